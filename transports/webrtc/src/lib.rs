//! FFmpeg to WebRTC media bridge
//!
//! Takes a media source described as FFmpeg input arguments, decodes it
//! with an `ffmpeg` subprocess into raw PCM and I420 streams, and sends
//! those streams over a WebRTC connection negotiated with offer / answer /
//! trickle-ICE signaling messages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  SignalingHandler (offer / answer / trickle candidates)  │
//! │  ├─ SessionManager (live sessions by id)                 │
//! │  └─ Session                                              │
//! │     ├─ CandidateQueue (local candidates, many waiters)   │
//! │     ├─ RtcConnection (webrtc-rs or in-memory engine)     │
//! │     │   └─ AudioTrack (Opus) / VideoTrack (encoder)      │
//! │     ├─ MediaBridge (one-shot TCP listeners + framing)    │
//! │     ├─ TranscoderProcess (ffmpeg, output probe)          │
//! │     ├─ Watchdog (connect deadline, terminal states)      │
//! │     └─ Teardown (ordered, runs once)                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use remotemedia_ffmpeg_webrtc::{BridgeConfig, SignalingHandler, SourceDescriptor, WebRtcEngine};
//! use std::sync::Arc;
//!
//! # async fn example() -> remotemedia_ffmpeg_webrtc::Result<()> {
//! let handler = SignalingHandler::new(Arc::new(WebRtcEngine::new()), BridgeConfig::default())?;
//! let source = SourceDescriptor::new(["-re", "-i", "test.mp4"]);
//!
//! let offer = handler.create_offer(&source).await?;
//! println!("{}", offer.to_json()?);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod source;

pub use config::{BridgeConfig, IceServerConfig};
pub use error::{Error, Result};
pub use media::{AudioFrame, Resolution, SampleFormat, VideoFrame};
pub use peer::{AudioSink, MemoryEngine, RtcConnection, RtcEngine, VideoSink, WebRtcEngine};
pub use session::{Session, SessionManager, TeardownReason};
pub use signaling::{AnswerSession, SignalingHandler, SignalingMessage};
pub use source::SourceDescriptor;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
