//! Real-time transport capability
//!
//! The bridge never touches ICE, DTLS or SRTP directly. It drives a
//! connection through [`RtcConnection`], obtained from an explicitly passed
//! [`RtcEngine`]:
//!
//! - [`connection::WebRtcEngine`]: webrtc-rs peer connections, Opus audio
//! - [`memory::MemoryEngine`]: in-process engine that records every call

pub mod connection;
pub mod memory;

use crate::config::IceServerConfig;
use crate::media::{AudioFrame, VideoFrame};
use crate::signaling::message::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use connection::WebRtcEngine;
pub use memory::MemoryEngine;

/// Aggregate connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Disconnected, failed or closed
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }
}

/// ICE agent connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Disconnected, failed or closed
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IceConnectionState::Disconnected
                | IceConnectionState::Failed
                | IceConnectionState::Closed
        )
    }
}

/// A state notification from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Connection(PeerConnectionState),
    Ice(IceConnectionState),
}

/// Called for every gathered local candidate; `None` marks gathering complete
pub type CandidateCallback = Box<dyn Fn(Option<IceCandidate>) + Send + Sync>;

/// Called for every connection or ICE state change
pub type StateCallback = Box<dyn Fn(StateChange) + Send + Sync>;

/// Receives 10 ms PCM frames
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn on_data(&self, frame: AudioFrame) -> Result<()>;
}

/// Receives raw I420 frames
#[async_trait]
pub trait VideoSink: Send + Sync {
    async fn on_frame(&self, frame: VideoFrame) -> Result<()>;
}

/// Factory for transport connections
#[async_trait]
pub trait RtcEngine: Send + Sync {
    async fn create_connection(&self, ice_servers: &[IceServerConfig])
        -> Result<Arc<dyn RtcConnection>>;
}

/// One transport connection, as seen by the bridge
#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Attach an outgoing audio track and return its frame sink
    async fn add_audio_track(&self) -> Result<Arc<dyn AudioSink>>;

    /// Attach an outgoing video track and return its frame sink
    async fn add_video_track(&self) -> Result<Arc<dyn VideoSink>>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    /// Current local description, including candidates gathered so far
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn connection_state(&self) -> PeerConnectionState;

    fn ice_connection_state(&self) -> IceConnectionState;

    /// Register the local candidate callback, replacing any previous one
    fn on_ice_candidate(&self, callback: CandidateCallback);

    /// Register an additional state change callback
    fn on_state_change(&self, callback: StateCallback);
}
