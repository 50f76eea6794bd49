//! In-process transport engine
//!
//! Every connection records the calls made on it and exposes hooks to
//! play the remote side: emit local candidates, finish gathering, move
//! the connection or ICE state. Sinks keep the frames they receive.

use super::{
    AudioSink, CandidateCallback, IceConnectionState, PeerConnectionState, RtcConnection,
    RtcEngine, StateCallback, StateChange, VideoSink,
};
use crate::config::IceServerConfig;
use crate::media::{AudioFrame, VideoFrame};
use crate::signaling::message::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Engine handing out [`MemoryConnection`]s
#[derive(Default)]
pub struct MemoryEngine {
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection created so far, oldest first
    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        self.connections.lock().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MemoryConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl RtcEngine for MemoryEngine {
    async fn create_connection(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<Arc<dyn RtcConnection>> {
        let connection = Arc::new(MemoryConnection::new(ice_servers.to_vec()));
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

#[derive(Debug)]
struct State {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_set_count: usize,
    applied: Vec<IceCandidate>,
    gathered: Vec<IceCandidate>,
    connection_state: PeerConnectionState,
    ice_state: IceConnectionState,
}

/// Recording connection
pub struct MemoryConnection {
    ice_servers: Vec<IceServerConfig>,
    state: Mutex<State>,
    candidate_callback: Mutex<Option<Arc<CandidateCallback>>>,
    state_callbacks: Mutex<Vec<Arc<StateCallback>>>,
    close_count: AtomicUsize,
    audio: Mutex<Option<Arc<MemoryAudioSink>>>,
    video: Mutex<Option<Arc<MemoryVideoSink>>>,
}

impl MemoryConnection {
    fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            ice_servers,
            state: Mutex::new(State {
                local: None,
                remote: None,
                remote_set_count: 0,
                applied: Vec::new(),
                gathered: Vec::new(),
                connection_state: PeerConnectionState::New,
                ice_state: IceConnectionState::New,
            }),
            candidate_callback: Mutex::new(None),
            state_callbacks: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
            audio: Mutex::new(None),
            video: Mutex::new(None),
        }
    }

    /// ICE servers the connection was created with
    pub fn ice_servers(&self) -> &[IceServerConfig] {
        &self.ice_servers
    }

    /// Remote candidates applied so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// How many times a remote description was set
    pub fn remote_description_count(&self) -> usize {
        self.state.lock().remote_set_count
    }

    /// How many times `close` was called
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn audio_sink(&self) -> Option<Arc<MemoryAudioSink>> {
        self.audio.lock().clone()
    }

    pub fn video_sink(&self) -> Option<Arc<MemoryVideoSink>> {
        self.video.lock().clone()
    }

    /// Produce a local candidate, as the ICE agent would
    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        self.state.lock().gathered.push(candidate.clone());
        self.fire_candidate(Some(candidate));
    }

    /// Signal the end of local gathering
    pub fn complete_gathering(&self) {
        self.fire_candidate(None);
    }

    pub fn set_connection_state(&self, new_state: PeerConnectionState) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.connection_state != new_state;
            state.connection_state = new_state;
            changed
        };
        if changed {
            self.fire_state(StateChange::Connection(new_state));
        }
    }

    pub fn set_ice_connection_state(&self, new_state: IceConnectionState) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.ice_state != new_state;
            state.ice_state = new_state;
            changed
        };
        if changed {
            self.fire_state(StateChange::Ice(new_state));
        }
    }

    fn fire_candidate(&self, candidate: Option<IceCandidate>) {
        let callback = self.candidate_callback.lock().clone();
        if let Some(callback) = callback {
            callback(candidate);
        }
    }

    fn fire_state(&self, change: StateChange) {
        let callbacks = self.state_callbacks.lock().clone();
        for callback in callbacks {
            callback(change);
        }
    }

    fn sdp(&self, kind: &str, candidates: &[IceCandidate]) -> String {
        let mut sdp = format!("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\n", kind);
        if self.audio.lock().is_some() {
            sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n");
        }
        if self.video.lock().is_some() {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n");
        }
        for candidate in candidates {
            sdp.push_str("a=");
            sdp.push_str(&candidate.candidate);
            sdp.push_str("\r\n");
        }
        sdp
    }
}

#[async_trait]
impl RtcConnection for MemoryConnection {
    async fn add_audio_track(&self) -> Result<Arc<dyn AudioSink>> {
        let sink = Arc::new(MemoryAudioSink::default());
        *self.audio.lock() = Some(Arc::clone(&sink));
        Ok(sink)
    }

    async fn add_video_track(&self) -> Result<Arc<dyn VideoSink>> {
        let sink = Arc::new(MemoryVideoSink::default());
        *self.video.lock() = Some(Arc::clone(&sink));
        Ok(sink)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(self.sdp("offer", &[])))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        match self.state.lock().remote.as_ref().map(|d| d.sdp_type) {
            Some(SdpType::Offer) => {}
            _ => {
                return Err(Error::SdpError(
                    "cannot answer without a remote offer".to_string(),
                ))
            }
        }
        Ok(SessionDescription::answer(self.sdp("answer", &[])))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.state.lock().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        state.remote = Some(description);
        state.remote_set_count += 1;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let (kind, gathered) = {
            let state = self.state.lock();
            let kind = state.local.as_ref()?.sdp_type;
            (kind, state.gathered.clone())
        };
        let label = if kind == SdpType::Answer { "answer" } else { "offer" };
        Some(SessionDescription {
            sdp_type: kind,
            sdp: self.sdp(label, &gathered),
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.set_ice_connection_state(IceConnectionState::Closed);
        self.set_connection_state(PeerConnectionState::Closed);
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection_state
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice_state
    }

    fn on_ice_candidate(&self, callback: CandidateCallback) {
        *self.candidate_callback.lock() = Some(Arc::new(callback));
    }

    fn on_state_change(&self, callback: StateCallback) {
        self.state_callbacks.lock().push(Arc::new(callback));
    }
}

/// Audio sink that keeps every frame
#[derive(Default)]
pub struct MemoryAudioSink {
    frames: Mutex<Vec<AudioFrame>>,
    fail: AtomicBool,
    changed: Notify,
}

impl MemoryAudioSink {
    pub fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    /// Make every following `on_data` call fail
    pub fn fail_frames(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Wait until at least `count` frames have arrived
    pub async fn wait_for_frames(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.frame_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl AudioSink for MemoryAudioSink {
    async fn on_data(&self, frame: AudioFrame) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::MediaTrackError("audio sink rejected frame".to_string()));
        }
        self.frames.lock().push(frame);
        self.changed.notify_waiters();
        Ok(())
    }
}

/// Video sink that keeps every frame
#[derive(Default)]
pub struct MemoryVideoSink {
    frames: Mutex<Vec<VideoFrame>>,
    fail: AtomicBool,
    changed: Notify,
}

impl MemoryVideoSink {
    pub fn frames(&self) -> Vec<VideoFrame> {
        self.frames.lock().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    /// Make every following `on_frame` call fail
    pub fn fail_frames(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Wait until at least `count` frames have arrived
    pub async fn wait_for_frames(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.frame_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl VideoSink for MemoryVideoSink {
    async fn on_frame(&self, frame: VideoFrame) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::MediaTrackError("video sink rejected frame".to_string()));
        }
        self.frames.lock().push(frame);
        self.changed.notify_waiters();
        Ok(())
    }
}
