//! Per-session signaling state

use super::startup::MediaSession;
use super::teardown::{Teardown, TeardownReason};
use crate::peer::RtcConnection;
use crate::signaling::message::{IceCandidate, RtcConfiguration, SessionDescription, SessionId};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueState {
    candidates: Vec<IceCandidate>,
    gathering_complete: bool,
}

/// Local candidates waiting to be sent to the remote peer
///
/// Producers push from the transport's candidate callback; every push wakes
/// all current waiters. Each candidate is handed out by exactly one
/// [`drain`](CandidateQueue::drain).
#[derive(Debug, Default)]
pub struct CandidateQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, candidate: IceCandidate) {
        self.state.lock().candidates.push(candidate);
        self.notify.notify_waiters();
    }

    /// Mark local gathering as finished
    pub fn complete_gathering(&self) {
        self.state.lock().gathering_complete = true;
        self.notify.notify_waiters();
    }

    /// Take every queued candidate, oldest first
    pub fn drain(&self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.state.lock().candidates)
    }

    pub fn len(&self) -> usize {
        self.state.lock().candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_gathering_complete(&self) -> bool {
        self.state.lock().gathering_complete
    }

    /// Wait until a candidate is queued or gathering has completed
    pub async fn wait_for_candidate(&self) {
        self.wait_until(|state| !state.candidates.is_empty() || state.gathering_complete)
            .await
    }

    /// Wait until gathering has completed
    pub async fn wait_for_gathering(&self) {
        self.wait_until(|state| state.gathering_complete).await
    }

    async fn wait_until(&self, ready: impl Fn(&QueueState) -> bool) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed
            notified.as_mut().enable();
            let done = ready(&self.state.lock());
            if done {
                return;
            }
            notified.await;
        }
    }
}

/// Outcome of [`Session::apply_remote`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUpdate {
    /// No remote description yet; this many candidates were buffered
    Buffered(usize),
    /// This many candidates were applied to the connection
    Applied(usize),
}

/// Remote side bookkeeping, serialized across concurrent signaling calls
#[derive(Debug, Default)]
struct RemoteState {
    /// Candidates that arrived before the remote description
    pending: Vec<IceCandidate>,
}

/// One signaling exchange and the media pipeline behind it
pub struct Session {
    id: SessionId,
    media: MediaSession,
    teardown: Arc<Teardown>,
    local_candidates: Arc<CandidateQueue>,
    remote: tokio::sync::Mutex<RemoteState>,
    configuration: RtcConfiguration,
}

impl Session {
    /// Wrap a started media session and capture its local candidates
    pub fn new(
        id: SessionId,
        media: MediaSession,
        teardown: Arc<Teardown>,
        configuration: RtcConfiguration,
    ) -> Self {
        let local_candidates = Arc::new(CandidateQueue::new());
        let queue = Arc::clone(&local_candidates);
        media
            .connection()
            .on_ice_candidate(Box::new(move |candidate: Option<IceCandidate>| match candidate {
                Some(candidate) => queue.push(candidate),
                None => queue.complete_gathering(),
            }));

        Self {
            id,
            media,
            teardown,
            local_candidates,
            remote: tokio::sync::Mutex::new(RemoteState::default()),
            configuration,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> &Arc<dyn RtcConnection> {
        self.media.connection()
    }

    pub fn media(&self) -> &MediaSession {
        &self.media
    }

    pub fn teardown(&self) -> &Arc<Teardown> {
        &self.teardown
    }

    pub fn local_candidates(&self) -> &CandidateQueue {
        &self.local_candidates
    }

    pub fn configuration(&self) -> &RtcConfiguration {
        &self.configuration
    }

    /// Remote candidates still waiting for the remote description
    pub async fn pending_remote_candidates(&self) -> usize {
        self.remote.lock().await.pending.len()
    }

    /// Start teardown with [`TeardownReason::Closed`]
    pub fn close(&self) -> bool {
        self.teardown.trigger(TeardownReason::Closed)
    }

    fn closed_error(&self, reason: Option<TeardownReason>) -> Error {
        reason.unwrap_or(TeardownReason::Closed).into_error(&self.id)
    }

    /// Apply a remote description and/or candidates
    ///
    /// Candidates that arrive before the description are buffered and
    /// applied, in arrival order, right after it.
    pub async fn apply_remote(
        &self,
        description: Option<SessionDescription>,
        candidates: &[IceCandidate],
    ) -> Result<RemoteUpdate> {
        if self.teardown.is_triggered() {
            return Err(self.closed_error(self.teardown.reason()));
        }

        let connection = self.connection();
        let mut remote = self.remote.lock().await;

        if !connection.has_remote_description().await {
            let Some(description) = description else {
                tracing::debug!(
                    session_id = %self.id,
                    count = candidates.len(),
                    "Buffering remote candidates until the description arrives"
                );
                remote.pending.extend(candidates.iter().cloned());
                return Ok(RemoteUpdate::Buffered(candidates.len()));
            };

            tracing::debug!(session_id = %self.id, sdp_type = ?description.sdp_type, "Setting remote description");
            connection.set_remote_description(description).await?;

            let buffered = std::mem::take(&mut remote.pending);
            let mut applied = 0;
            for candidate in buffered.into_iter().chain(candidates.iter().cloned()) {
                connection.add_ice_candidate(candidate).await?;
                applied += 1;
            }
            return Ok(RemoteUpdate::Applied(applied));
        }

        if description.is_some() {
            tracing::warn!(session_id = %self.id, "Ignoring second remote description");
        }
        for candidate in candidates {
            connection.add_ice_candidate(candidate.clone()).await?;
        }
        Ok(RemoteUpdate::Applied(candidates.len()))
    }

    /// Wait for a local candidate, unless one is already queued
    ///
    /// Fails with the teardown reason's error if the session ends first.
    pub async fn wait_for_local_candidate(&self) -> Result<()> {
        tokio::select! {
            _ = self.local_candidates.wait_for_candidate() => Ok(()),
            reason = self.teardown.wait() => Err(self.closed_error(Some(reason))),
        }
    }

    /// Wait for local gathering to complete
    ///
    /// Fails with the teardown reason's error if the session ends first.
    pub async fn wait_for_gathering(&self) -> Result<()> {
        tokio::select! {
            _ = self.local_candidates.wait_for_gathering() => Ok(()),
            reason = self.teardown.wait() => Err(self.closed_error(Some(reason))),
        }
    }

    /// Take every queued local candidate
    pub fn drain_local_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates.drain()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("torn_down", &self.teardown.is_triggered())
            .field("local_candidates", &self.local_candidates.len())
            .finish()
    }
}
