//! Idempotent, stage-ordered session teardown
//!
//! Every terminal signal (transcoder exit, connect deadline, terminal
//! transport state, frame forwarding failure, probe stall, explicit close)
//! calls [`Teardown::trigger`]. Only the first call wins; it runs every
//! registered action once, in [`Stage`] order.

use crate::Error;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Why a session was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownReason {
    /// The transcoder exited (or could not be started)
    ProcessExited,
    /// A frame could not be forwarded to its track
    FrameForwarding,
    /// The connection did not reach `connected` before the deadline
    ConnectTimeout,
    /// Connection or ICE state became disconnected, failed or closed
    TerminalState,
    /// Resolution or sample format never appeared in the transcoder output
    ParseStall,
    /// Closed on request
    Closed,
}

impl TeardownReason {
    /// Error reported to callers that were waiting on the session
    pub fn into_error(self, session_id: &str) -> Error {
        match self {
            TeardownReason::ConnectTimeout => {
                Error::ConnectTimeout(format!("session {} never connected", session_id))
            }
            TeardownReason::ParseStall => {
                Error::ParseStall(format!("session {} saw no stream format", session_id))
            }
            TeardownReason::ProcessExited => {
                Error::SubprocessFailure(format!("transcoder for session {} exited", session_id))
            }
            TeardownReason::FrameForwarding | TeardownReason::TerminalState | TeardownReason::Closed => {
                Error::SessionClosed(session_id.to_string())
            }
        }
    }
}

/// Teardown stages, run in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Kill the transcoder
    Process,
    /// Close the raw-stream listeners
    Listeners,
    /// Close the transport connection
    Transport,
    /// Forget the session
    Registry,
}

type Action = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Single teardown routine shared by every component of a session
pub struct Teardown {
    session_id: String,
    triggered: AtomicBool,
    /// `None` once the actions have been taken for running
    actions: Mutex<Option<Vec<(Stage, Action)>>>,
    reason: watch::Sender<Option<TeardownReason>>,
    completed: watch::Sender<bool>,
}

impl Teardown {
    pub fn new(session_id: impl Into<String>) -> Arc<Self> {
        let (reason, _) = watch::channel(None);
        let (completed, _) = watch::channel(false);
        Arc::new(Self {
            session_id: session_id.into(),
            triggered: AtomicBool::new(false),
            actions: Mutex::new(Some(Vec::new())),
            reason,
            completed,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Register an action for `stage`
    ///
    /// An action registered after teardown has already started is run
    /// right away on its own task.
    pub fn on<F, Fut>(&self, stage: Stage, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let action: Action = Box::new(move || Box::pin(action()));
        let late = {
            let mut actions = self.actions.lock();
            match actions.as_mut() {
                Some(list) => {
                    list.push((stage, action));
                    None
                }
                None => Some(action),
            }
        };
        if let Some(action) = late {
            tracing::debug!(session_id = %self.session_id, ?stage, "Running late teardown action");
            tokio::spawn(action());
        }
    }

    /// Start teardown; returns `true` only for the first call
    pub fn trigger(self: &Arc<Self>, reason: TeardownReason) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            tracing::trace!(session_id = %self.session_id, ?reason, "Teardown already triggered");
            return false;
        }
        tracing::info!(session_id = %self.session_id, ?reason, "Tearing down session");
        self.reason.send_replace(Some(reason));

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await });
        true
    }

    async fn run(&self) {
        let mut actions = self.actions.lock().take().unwrap_or_default();
        // Stable: actions of one stage keep their registration order
        actions.sort_by_key(|(stage, _)| *stage);

        for (stage, action) in actions {
            tracing::debug!(session_id = %self.session_id, ?stage, "Teardown stage");
            action().await;
        }

        tracing::debug!(session_id = %self.session_id, "Teardown complete");
        self.completed.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// First trigger reason, if any
    pub fn reason(&self) -> Option<TeardownReason> {
        *self.reason.borrow()
    }

    /// Wait until teardown is triggered
    pub async fn wait(&self) -> TeardownReason {
        let mut rx = self.reason.subscribe();
        let result = rx.wait_for(Option::is_some).await.map(|reason| *reason);
        // The sender lives as long as `self`
        result.ok().flatten().unwrap_or(TeardownReason::Closed)
    }

    /// Wait until every action has finished
    pub async fn wait_complete(&self) {
        let mut rx = self.completed.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("session_id", &self.session_id)
            .field("reason", &self.reason())
            .finish()
    }
}
