//! Media session startup
//!
//! Wires one source into one transport connection:
//!
//! ```text
//! connection ─ video track ─┐            ┌─ video listener ◄── tcp ── ffmpeg
//!            └ audio track ─┤  bridge ◄──┤                             ▲
//!                           │            └─ audio listener ◄── tcp ────┤
//!                           │                                          │
//!                           └──── probe ◄── stdout/stderr lines ───────┘
//! ```
//!
//! Every resource registers its release with the session's [`Teardown`]
//! as soon as it exists, so a failure half-way through still releases
//! what was already created.

use super::teardown::{Stage, Teardown, TeardownReason};
use super::watchdog;
use crate::config::{BridgeConfig, IceServerConfig};
use crate::ffmpeg::{build_arguments, OutputProbe, TranscoderProcess};
use crate::media::bridge::{MediaBridge, StreamSink};
use crate::peer::{RtcConnection, RtcEngine};
use crate::source::SourceDescriptor;
use crate::Result;
use std::sync::Arc;
use tracing::instrument;

/// Running media pipeline of one session
pub struct MediaSession {
    connection: Arc<dyn RtcConnection>,
    process: Arc<TranscoderProcess>,
    bridge: Arc<MediaBridge>,
    probe: Arc<OutputProbe>,
}

impl MediaSession {
    pub fn connection(&self) -> &Arc<dyn RtcConnection> {
        &self.connection
    }

    pub fn process(&self) -> &Arc<TranscoderProcess> {
        &self.process
    }

    pub fn bridge(&self) -> &Arc<MediaBridge> {
        &self.bridge
    }

    pub fn probe(&self) -> &Arc<OutputProbe> {
        &self.probe
    }
}

/// Start the transcoder, bridge, tracks and watchdog for `source`
///
/// On failure the teardown is triggered before the error is returned.
#[instrument(skip_all, fields(session_id = %teardown.session_id()))]
pub async fn launch(
    engine: &dyn RtcEngine,
    config: &BridgeConfig,
    source: &SourceDescriptor,
    ice_servers: &[IceServerConfig],
    teardown: &Arc<Teardown>,
) -> Result<MediaSession> {
    let result = start(engine, config, source, ice_servers, teardown).await;
    if let Err(e) = &result {
        tracing::error!("Media session failed to start: {}", e);
        teardown.trigger(TeardownReason::ProcessExited);
    }
    result
}

async fn start(
    engine: &dyn RtcEngine,
    config: &BridgeConfig,
    source: &SourceDescriptor,
    ice_servers: &[IceServerConfig],
    teardown: &Arc<Teardown>,
) -> Result<MediaSession> {
    let connection = engine.create_connection(ice_servers).await?;
    {
        let connection = Arc::clone(&connection);
        teardown.on(Stage::Transport, move || async move {
            if let Err(e) = connection.close().await {
                tracing::warn!("Error closing transport connection: {}", e);
            }
        });
    }

    let expects_audio = source.expects_audio();
    let video_sink = connection.add_video_track().await?;
    let audio_sink = if expects_audio {
        Some(connection.add_audio_track().await?)
    } else {
        None
    };

    let bridge = Arc::new(MediaBridge::bind(config.listen_ip()?, expects_audio).await?);
    {
        let bridge = Arc::clone(&bridge);
        teardown.on(Stage::Listeners, move || async move {
            bridge.close();
        });
    }

    let args = build_arguments(
        source,
        bridge.audio_addr(),
        bridge.video_addr(),
        config.video_framerate,
    )?;

    let probe = Arc::new(OutputProbe::new(expects_audio));
    let process = Arc::new(TranscoderProcess::spawn(
        &config.ffmpeg_path,
        &args,
        Arc::clone(&probe),
        config.kill_grace(),
    )?);
    {
        let process = Arc::clone(&process);
        teardown.on(Stage::Process, move || async move {
            process.kill().await;
        });
    }

    bridge.video().start(
        StreamSink::Video(video_sink),
        Arc::clone(&probe),
        config.probe_timeout(),
        Arc::clone(teardown),
    )?;
    if let (Some(listener), Some(sink)) = (bridge.audio(), audio_sink) {
        listener.start(
            StreamSink::Audio(sink),
            Arc::clone(&probe),
            config.probe_timeout(),
            Arc::clone(teardown),
        )?;
    }

    {
        let process = Arc::clone(&process);
        let teardown = Arc::clone(teardown);
        tokio::spawn(async move {
            let reason = process.wait_exit().await;
            tracing::info!(
                session_id = %teardown.session_id(),
                ?reason,
                "Transcoder exited, ending session"
            );
            teardown.trigger(TeardownReason::ProcessExited);
        });
    }

    watchdog::spawn(&connection, Arc::clone(teardown), config.connect_timeout());

    Ok(MediaSession {
        connection,
        process,
        bridge,
        probe,
    })
}
