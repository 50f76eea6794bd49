//! Raw-stream listeners feeding media tracks
//!
//! Each elementary stream gets its own loopback TCP listener. The
//! transcoder connects once; the listener is dropped on accept so no
//! second connection can be made. Once the stream's format is known the
//! socket is cut into whole frames and forwarded to the track sink.

use super::framer::FrameReader;
use super::{AudioFrame, Resolution, SampleFormat, VideoFrame};
use crate::ffmpeg::OutputProbe;
use crate::peer::{AudioSink, VideoSink};
use crate::session::teardown::{Teardown, TeardownReason};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Which elementary stream a listener carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Audio => write!(f, "audio"),
            StreamKind::Video => write!(f, "video"),
        }
    }
}

/// Forward every whole audio frame from `reader` to `sink`
///
/// Returns the number of frames forwarded when the stream ends.
pub async fn forward_audio<R>(reader: R, format: SampleFormat, sink: &dyn AudioSink) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader, format.frame_bytes());
    let mut count = 0;
    while let Some(chunk) = frames.next_frame().await? {
        let frame = AudioFrame::from_le_bytes(&chunk, format)?;
        sink.on_data(frame).await?;
        count += 1;
    }
    Ok(count)
}

/// Forward every whole video frame from `reader` to `sink`
///
/// Returns the number of frames forwarded when the stream ends.
pub async fn forward_video<R>(reader: R, resolution: Resolution, sink: &dyn VideoSink) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader, resolution.frame_bytes());
    let mut count = 0;
    while let Some(chunk) = frames.next_frame().await? {
        let frame = VideoFrame::new(resolution, chunk)?;
        sink.on_frame(frame).await?;
        count += 1;
    }
    Ok(count)
}

/// Sink a listener forwards into
pub enum StreamSink {
    Audio(Arc<dyn AudioSink>),
    Video(Arc<dyn VideoSink>),
}

impl StreamSink {
    fn kind(&self) -> StreamKind {
        match self {
            StreamSink::Audio(_) => StreamKind::Audio,
            StreamSink::Video(_) => StreamKind::Video,
        }
    }
}

/// One-shot loopback listener for a raw elementary stream
pub struct StreamListener {
    kind: StreamKind,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StreamListener {
    /// Bind an ephemeral port on `host`
    pub async fn bind(host: IpAddr, kind: StreamKind) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(host, 0)).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%kind, port = local_addr.port(), "Stream listener bound");
        Ok(Self {
            kind,
            local_addr,
            listener: Mutex::new(Some(listener)),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start the accept / forward task
    ///
    /// The task waits up to `probe_timeout` for the stream format, accepts
    /// one connection, drops the listener and forwards frames until EOF.
    /// A probe stall or forwarding failure triggers `teardown`.
    pub fn start(
        &self,
        sink: StreamSink,
        probe: Arc<OutputProbe>,
        probe_timeout: Duration,
        teardown: Arc<Teardown>,
    ) -> Result<()> {
        if sink.kind() != self.kind {
            return Err(Error::InvalidConfig(format!(
                "{} sink attached to {} listener",
                sink.kind(),
                self.kind
            )));
        }
        let listener = self.listener.lock().take().ok_or_else(|| {
            Error::InvalidConfig(format!("{} listener already started or closed", self.kind))
        })?;

        let kind = self.kind;
        let port = self.local_addr.port();
        let session_id = teardown.session_id().to_string();

        let handle = tokio::spawn(async move {
            let result = run_stream(listener, sink, &probe, probe_timeout).await;
            match result {
                Ok(()) => {
                    tracing::debug!(session_id = %session_id, %kind, port, "Stream ended");
                }
                Err(e @ Error::ParseStall(_)) => {
                    tracing::error!(session_id = %session_id, %kind, port, "{}", e);
                    teardown.trigger(TeardownReason::ParseStall);
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, %kind, port, "Frame forwarding failed: {}", e);
                    teardown.trigger(TeardownReason::FrameForwarding);
                }
            }
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop accepting and forwarding; returns `false` if already closed
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        drop(self.listener.lock().take());
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        tracing::debug!(kind = %self.kind, port = self.local_addr.port(), "Stream listener closed");
        true
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn run_stream(
    listener: TcpListener,
    sink: StreamSink,
    probe: &OutputProbe,
    probe_timeout: Duration,
) -> Result<()> {
    // The listener is gone before the format is known
    let stream = accept_once(listener).await?;
    let count = match sink {
        StreamSink::Audio(sink) => {
            let format = probe.wait_sample_format(probe_timeout).await?;
            tracing::info!(%format, "Audio stream connected");
            forward_audio(stream, format, sink.as_ref()).await?
        }
        StreamSink::Video(sink) => {
            let resolution = probe.wait_resolution(probe_timeout).await?;
            tracing::info!(%resolution, "Video stream connected");
            forward_video(stream, resolution, sink.as_ref()).await?
        }
    };
    tracing::debug!(frames = count, "Forwarding finished");
    Ok(())
}

/// Accept a single connection and close the listener
async fn accept_once(listener: TcpListener) -> Result<TcpStream> {
    let (stream, peer) = listener.accept().await?;
    drop(listener);
    tracing::debug!(%peer, "Transcoder connected");
    Ok(stream)
}

/// The listener pair of one session: video always, audio when expected
pub struct MediaBridge {
    video: StreamListener,
    audio: Option<StreamListener>,
}

impl MediaBridge {
    /// Bind the video listener, and the audio listener when `with_audio`
    pub async fn bind(host: IpAddr, with_audio: bool) -> Result<Self> {
        let audio = if with_audio {
            Some(StreamListener::bind(host, StreamKind::Audio).await?)
        } else {
            None
        };
        let video = StreamListener::bind(host, StreamKind::Video).await?;
        Ok(Self { video, audio })
    }

    pub fn video(&self) -> &StreamListener {
        &self.video
    }

    pub fn audio(&self) -> Option<&StreamListener> {
        self.audio.as_ref()
    }

    pub fn audio_addr(&self) -> Option<SocketAddr> {
        self.audio.as_ref().map(StreamListener::local_addr)
    }

    pub fn video_addr(&self) -> SocketAddr {
        self.video.local_addr()
    }

    /// Close both listeners
    pub fn close(&self) {
        if let Some(audio) = &self.audio {
            audio.close();
        }
        self.video.close();
    }

    pub fn is_closed(&self) -> bool {
        self.video.is_closed() && self.audio.as_ref().map_or(true, StreamListener::is_closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::memory::{MemoryAudioSink, MemoryVideoSink};
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_forward_audio_whole_frames_only() {
        let format = SampleFormat::new(48000, 2).unwrap();
        let sink = MemoryAudioSink::default();

        let data = vec![0u8; 1920];
        assert_eq!(forward_audio(&data[..], format, &sink).await.unwrap(), 1);

        let data = vec![0u8; 1919];
        assert_eq!(forward_audio(&data[..], format, &sink).await.unwrap(), 0);

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples.len(), 960);
        assert_eq!(frames[0].bits_per_sample(), 16);
    }

    #[tokio::test]
    async fn test_forward_video_hd_frame() {
        let resolution = Resolution::new(1280, 720).unwrap();
        let sink = MemoryVideoSink::default();

        let data = vec![0x10u8; 1_382_400];
        assert_eq!(forward_video(&data[..], resolution, &sink).await.unwrap(), 1);
        assert_eq!(sink.frames()[0].data.len(), 1_382_400);
    }

    #[tokio::test]
    async fn test_sink_failure_propagates() {
        let format = SampleFormat::new(8000, 1).unwrap();
        let sink = MemoryAudioSink::default();
        sink.fail_frames(true);

        let data = vec![0u8; format.frame_bytes() * 3];
        assert!(forward_audio(&data[..], format, &sink).await.is_err());
    }

    #[tokio::test]
    async fn test_listener_accepts_once_and_forwards() {
        let listener = StreamListener::bind(LOOPBACK, StreamKind::Video).await.unwrap();
        let addr = listener.local_addr();
        let probe = Arc::new(OutputProbe::new(false));
        probe.feed_line("Stream #0:0: Video: rawvideo, yuv420p, 16x16");
        let sink = Arc::new(MemoryVideoSink::default());
        let teardown = Teardown::new("bridge-test");

        listener
            .start(
                StreamSink::Video(sink.clone()),
                probe,
                Duration::from_secs(5),
                Arc::clone(&teardown),
            )
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&vec![0u8; 16 * 16 * 3 / 2 * 2]).await.unwrap();
        sink.wait_for_frames(2).await;

        // The listener is gone after the first accept
        assert!(TcpStream::connect(addr).await.is_err());

        drop(stream);
        assert!(listener.close());
        assert!(!listener.close());
        assert!(!teardown.is_triggered());
    }

    #[tokio::test]
    async fn test_forwarding_failure_triggers_teardown() {
        let listener = StreamListener::bind(LOOPBACK, StreamKind::Audio).await.unwrap();
        let addr = listener.local_addr();
        let probe = Arc::new(OutputProbe::new(true));
        probe.feed_line("Stream #0:1: Audio: pcm_s16le, 16000 Hz, mono, s16");
        let sink = Arc::new(MemoryAudioSink::default());
        sink.fail_frames(true);
        let teardown = Teardown::new("bridge-fail");

        listener
            .start(
                StreamSink::Audio(sink),
                probe,
                Duration::from_secs(5),
                Arc::clone(&teardown),
            )
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0u8; 320]).await.unwrap();
        assert_eq!(teardown.wait().await, TeardownReason::FrameForwarding);
    }

    #[tokio::test]
    async fn test_format_stall_triggers_teardown() {
        let listener = StreamListener::bind(LOOPBACK, StreamKind::Audio).await.unwrap();
        let addr = listener.local_addr();
        let probe = Arc::new(OutputProbe::new(true));
        let teardown = Teardown::new("bridge-stall");

        listener
            .start(
                StreamSink::Audio(Arc::new(MemoryAudioSink::default())),
                probe,
                Duration::from_millis(500),
                Arc::clone(&teardown),
            )
            .unwrap();

        let _stream = TcpStream::connect(addr).await.unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(5), teardown.wait())
            .await
            .unwrap();
        assert_eq!(reason, TeardownReason::ParseStall);
    }

    #[tokio::test]
    async fn test_listener_closes_on_accept_before_format() {
        let listener = StreamListener::bind(LOOPBACK, StreamKind::Video).await.unwrap();
        let addr = listener.local_addr();
        let probe = Arc::new(OutputProbe::new(false));
        let sink = Arc::new(MemoryVideoSink::default());
        let teardown = Teardown::new("bridge-early");

        listener
            .start(
                StreamSink::Video(sink.clone()),
                Arc::clone(&probe),
                Duration::from_secs(30),
                Arc::clone(&teardown),
            )
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let refused = tokio::time::timeout(Duration::from_secs(5), async {
            while TcpStream::connect(addr).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(refused.is_ok(), "listener still bound while the format is unknown");

        // The accepted stream is forwarded once the format shows up
        probe.feed_line("Stream #0:0: Video: rawvideo, yuv420p, 16x16");
        stream.write_all(&vec![0u8; 16 * 16 * 3 / 2]).await.unwrap();
        sink.wait_for_frames(1).await;
        assert!(!teardown.is_triggered());
        listener.close();
    }

    #[tokio::test]
    async fn test_mismatched_sink_rejected() {
        let listener = StreamListener::bind(LOOPBACK, StreamKind::Video).await.unwrap();
        let result = listener.start(
            StreamSink::Audio(Arc::new(MemoryAudioSink::default())),
            Arc::new(OutputProbe::new(false)),
            Duration::from_secs(1),
            Teardown::new("mismatch"),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bridge_without_audio() {
        let bridge = MediaBridge::bind(LOOPBACK, false).await.unwrap();
        assert!(bridge.audio_addr().is_none());
        assert_ne!(bridge.video_addr().port(), 0);
        bridge.close();
        assert!(bridge.is_closed());
    }
}
