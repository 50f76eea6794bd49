//! Command line bridge
//!
//! Signaling messages are exchanged as JSON lines: responses go to stdout,
//! inbound messages are read from stdin, logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Offer a file, then paste the answer and candidate messages
//! ffmpeg_webrtc offer -- -re -i test.mp4
//!
//! # Answer an offer read from stdin, without audio
//! ffmpeg_webrtc answer --no-audio -- -re -i test.mp4
//!
//! # Source and bridge settings from JSON files
//! ffmpeg_webrtc --config bridge.json offer --source source.json
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use remotemedia_ffmpeg_webrtc::{
    BridgeConfig, Error, IceServerConfig, MemoryEngine, RtcEngine, SignalingHandler,
    SignalingMessage, SourceDescriptor, WebRtcEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Bridge an FFmpeg source into a WebRTC session
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bridge configuration (JSON)
    #[arg(long, env = "FFMPEG_WEBRTC_CONFIG")]
    config: Option<PathBuf>,

    /// ffmpeg executable
    #[arg(long, env = "FFMPEG_PATH")]
    ffmpeg: Option<PathBuf>,

    /// ICE server URLs (comma-separated), replacing the configured list
    #[arg(long, value_delimiter = ',', env = "FFMPEG_WEBRTC_ICE_SERVERS")]
    ice_servers: Vec<String>,

    /// Connect deadline in milliseconds
    #[arg(long, env = "FFMPEG_WEBRTC_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    /// Use the in-memory transport; nothing is sent over the network
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an offer, then apply answer / candidate lines from stdin
    Offer(SourceArgs),
    /// Read an offer line from stdin and print the answer
    Answer(SourceArgs),
}

#[derive(clap::Args, Debug)]
struct SourceArgs {
    /// Source descriptor (JSON); overrides the trailing input arguments
    #[arg(long)]
    source: Option<PathBuf>,

    /// Do not expect an audio stream
    #[arg(long, default_value_t = false)]
    no_audio: bool,

    /// ffmpeg input arguments
    #[arg(last = true)]
    input: Vec<String>,
}

impl SourceArgs {
    fn descriptor(&self) -> anyhow::Result<SourceDescriptor> {
        let source = match &self.source {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("reading source descriptor {}", path.display()))?;
                SourceDescriptor::from_json(&json)?
            }
            None if self.input.is_empty() => {
                bail!("no source: pass --source or input arguments after `--`")
            }
            None => SourceDescriptor::new(self.input.clone()),
        };

        Ok(if self.no_audio {
            source.without_audio()
        } else {
            source
        })
    }
}

fn build_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_json_file(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(ffmpeg) = &args.ffmpeg {
        config = config.with_ffmpeg_path(ffmpeg);
    }
    if !args.ice_servers.is_empty() {
        config = config.with_ice_servers(
            args.ice_servers
                .iter()
                .map(|url| IceServerConfig::stun(url.as_str()))
                .collect(),
        );
    }
    if let Some(ms) = args.connect_timeout_ms {
        config = config.with_connect_timeout(std::time::Duration::from_millis(ms));
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = build_config(&args)?;
    info!(
        version = remotemedia_ffmpeg_webrtc::version(),
        ffmpeg = %config.ffmpeg_path.display(),
        dry_run = args.dry_run,
        "ffmpeg_webrtc starting"
    );

    let engine: Arc<dyn RtcEngine> = if args.dry_run {
        Arc::new(MemoryEngine::new())
    } else {
        Arc::new(video_engine(&config))
    };
    let handler = Arc::new(SignalingHandler::new(engine, config)?);

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            let _ = stop.send(true);
        }
    });

    let result = match &args.command {
        Command::Offer(source) => {
            let output = spawn_writer();
            run_offer(&handler, source.descriptor()?, tokio::io::stdin(), output, shutdown).await
        }
        Command::Answer(source) => {
            let output = spawn_writer();
            run_answer(&handler, source.descriptor()?, tokio::io::stdin(), output, shutdown).await
        }
    };

    handler.close_all().await;
    info!("ffmpeg_webrtc stopped");
    result
}

#[cfg(feature = "h264")]
fn video_engine(config: &BridgeConfig) -> WebRtcEngine {
    WebRtcEngine::new()
        .with_video_framerate(config.video_framerate)
        .with_video_encoder(remotemedia_ffmpeg_webrtc::media::h264::H264Encoder::factory())
}

#[cfg(not(feature = "h264"))]
fn video_engine(config: &BridgeConfig) -> WebRtcEngine {
    warn!("Built without the h264 feature; video frames will be dropped");
    WebRtcEngine::new().with_video_framerate(config.video_framerate)
}

/// Flips to `true` once on Ctrl-C
type Shutdown = watch::Receiver<bool>;

/// Resolves once shutdown was requested; never if the sender is gone
async fn interrupted(shutdown: &mut Shutdown) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Writes each response as one stdout line
fn spawn_writer() -> mpsc::UnboundedSender<SignalingMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message.to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => error!("{}", e),
            }
        }
    });
    tx
}

async fn close(handler: &SignalingHandler, session_id: &str) -> anyhow::Result<()> {
    match handler.close_session(session_id).await {
        Ok(()) | Err(Error::SessionNotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn run_offer<R>(
    handler: &Arc<SignalingHandler>,
    source: SourceDescriptor,
    input: R,
    output: mpsc::UnboundedSender<SignalingMessage>,
    mut shutdown: Shutdown,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let offer = tokio::select! {
        offer = handler.create_offer(&source) => offer?,
        _ = interrupted(&mut shutdown) => return Ok(()),
    };
    let session_id = offer.id.clone().context("offer without session id")?;
    let session = handler.sessions().get(&session_id).await?;
    let _ = output.send(offer);

    // Stdin closing is not the end of the session
    let mut lines = BufReader::new(input).lines();
    let mut input_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                let Some(line) = line? else {
                    info!("stdin closed");
                    input_open = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let mut message = match SignalingMessage::from_json(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Skipping malformed line: {}", e);
                        continue;
                    }
                };
                message.id.get_or_insert_with(|| session_id.clone());

                // A candidate-less answer may wait for local candidates
                let handler = Arc::clone(handler);
                let output = output.clone();
                tokio::spawn(async move {
                    match handler.apply_answer(&message).await {
                        Ok(response) => {
                            let _ = output.send(response);
                        }
                        Err(e) if e.is_session_error() => info!("Session gone: {}", e),
                        Err(e) => warn!("Signaling message rejected: {}", e),
                    }
                });
            }
            reason = session.teardown().wait() => {
                info!(?reason, "Session ended");
                return Ok(());
            }
            _ = interrupted(&mut shutdown) => {
                info!(session_id = %session_id, "Closing session");
                return close(handler, &session_id).await;
            }
        }
    }
}

async fn run_answer<R>(
    handler: &Arc<SignalingHandler>,
    source: SourceDescriptor,
    input: R,
    output: mpsc::UnboundedSender<SignalingMessage>,
    mut shutdown: Shutdown,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let line = loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
                None => bail!("stdin closed before an offer arrived"),
            },
            _ = interrupted(&mut shutdown) => return Ok(()),
        }
    };

    let offer = SignalingMessage::from_json(&line)?;
    let answer = tokio::select! {
        answer = handler.create_answer(&offer, &source) => answer?,
        _ = interrupted(&mut shutdown) => {
            info!("Interrupted before the answer was ready");
            return Ok(());
        }
    };
    let session_id = answer.session_id;
    let session = handler.sessions().get(&session_id).await?;
    let _ = output.send(answer.message);

    tokio::select! {
        reason = session.teardown().wait() => {
            info!(?reason, "Session ended");
            Ok(())
        }
        _ = interrupted(&mut shutdown) => {
            info!(session_id = %session_id, "Closing session");
            close(handler, &session_id).await
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use remotemedia_ffmpeg_webrtc::signaling::SessionDescription;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    const STEP: Duration = Duration::from_secs(10);

    struct Bridge {
        _dir: tempfile::TempDir,
        engine: Arc<MemoryEngine>,
        handler: Arc<SignalingHandler>,
    }

    fn bridge() -> Bridge {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = dir.path().join("ffmpeg");
        std::fs::write(
            &ffmpeg,
            "#!/bin/sh\n\
             echo \"  Stream #0:0: Video: rawvideo (I420 / 0x30323449), yuv420p, 16x16, 15 fps\" >&2\n\
             exec sleep 3600\n",
        )
        .unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = BridgeConfig::default()
            .with_ffmpeg_path(&ffmpeg)
            .with_kill_grace(Duration::from_millis(200));
        let engine = Arc::new(MemoryEngine::new());
        let handler = Arc::new(SignalingHandler::new(engine.clone(), config).unwrap());
        Bridge {
            _dir: dir,
            engine,
            handler,
        }
    }

    fn source() -> SourceDescriptor {
        SourceDescriptor::new(["-i", "test.mp4"]).without_audio()
    }

    #[tokio::test]
    async fn test_single_interrupt_ends_offer() {
        let bridge = bridge();
        let (stop, shutdown) = watch::channel(false);
        let (output, mut responses) = mpsc::unbounded_channel();
        // Writer half stays open: stdin is still attached when Ctrl-C arrives
        let (_stdin, input) = tokio::io::duplex(64);

        let run = {
            let handler = bridge.handler.clone();
            tokio::spawn(async move { run_offer(&handler, source(), input, output, shutdown).await })
        };

        let offer = timeout(STEP, responses.recv()).await.unwrap().unwrap();
        assert!(offer.id.is_some());
        assert_eq!(bridge.handler.session_count().await, 1);

        stop.send(true).unwrap();
        timeout(STEP, run).await.unwrap().unwrap().unwrap();
        assert_eq!(bridge.handler.session_count().await, 0);
        assert_eq!(bridge.engine.last_connection().unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_after_stdin_closed_ends_offer() {
        let bridge = bridge();
        let (stop, shutdown) = watch::channel(false);
        let (output, mut responses) = mpsc::unbounded_channel();
        let (mut stdin, input) = tokio::io::duplex(64);

        let run = {
            let handler = bridge.handler.clone();
            tokio::spawn(async move { run_offer(&handler, source(), input, output, shutdown).await })
        };
        timeout(STEP, responses.recv()).await.unwrap().unwrap();

        stdin.write_all(b"not json\n").await.unwrap();
        drop(stdin);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!run.is_finished());

        stop.send(true).unwrap();
        timeout(STEP, run).await.unwrap().unwrap().unwrap();
        assert_eq!(bridge.handler.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_interrupt_before_offer_line_ends_answer() {
        let bridge = bridge();
        let (stop, shutdown) = watch::channel(false);
        let (output, mut responses) = mpsc::unbounded_channel();
        let (_stdin, input) = tokio::io::duplex(64);

        let run = {
            let handler = bridge.handler.clone();
            tokio::spawn(async move { run_answer(&handler, source(), input, output, shutdown).await })
        };

        stop.send(true).unwrap();
        timeout(STEP, run).await.unwrap().unwrap().unwrap();
        assert!(responses.try_recv().is_err());
        assert_eq!(bridge.handler.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_interrupt_after_answer_closes_session() {
        let bridge = bridge();
        let (stop, shutdown) = watch::channel(false);
        let (output, mut responses) = mpsc::unbounded_channel();
        let (mut stdin, input) = tokio::io::duplex(1024);

        let offer = SignalingMessage {
            id: None,
            description: Some(SessionDescription::offer("v=0\r\ns=browser\r\n")),
            candidates: None,
            configuration: None,
        };
        stdin
            .write_all(format!("{}\n", offer.to_json().unwrap()).as_bytes())
            .await
            .unwrap();

        let run = {
            let handler = bridge.handler.clone();
            tokio::spawn(async move { run_answer(&handler, source(), input, output, shutdown).await })
        };

        let connection = timeout(STEP, async {
            loop {
                if let Some(connection) = bridge.engine.last_connection() {
                    if connection.remote_description_count() == 1 {
                        return connection;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        connection.complete_gathering();

        let answer = timeout(STEP, responses.recv()).await.unwrap().unwrap();
        assert!(answer.id.is_some());

        stop.send(true).unwrap();
        timeout(STEP, run).await.unwrap().unwrap().unwrap();
        assert_eq!(bridge.handler.session_count().await, 0);
        assert_eq!(connection.close_count(), 1);
    }
}
