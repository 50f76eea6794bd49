//! Connection watchdog
//!
//! Two independent triggers, both feeding the session's single teardown:
//! a level-triggered check on every connection / ICE state notification,
//! and a one-shot connect deadline.

use super::teardown::{Teardown, TeardownReason};
use crate::peer::{PeerConnectionState, RtcConnection, StateChange};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Watch `connection` until teardown
///
/// Returns the deadline task; it finishes on its own once the deadline
/// passes or teardown starts.
pub fn spawn(
    connection: &Arc<dyn RtcConnection>,
    teardown: Arc<Teardown>,
    connect_timeout: Duration,
) -> JoinHandle<()> {
    // The callback lives inside the connection, so it only holds a weak reference
    let weak: Weak<dyn RtcConnection> = Arc::downgrade(connection);
    let state_teardown = Arc::clone(&teardown);
    connection.on_state_change(Box::new(move |change: StateChange| {
        let terminal = match change {
            StateChange::Connection(state) => state.is_terminal(),
            StateChange::Ice(state) => state.is_terminal(),
        };
        let terminal = terminal
            || weak.upgrade().is_some_and(|connection| {
                connection.connection_state().is_terminal()
                    || connection.ice_connection_state().is_terminal()
            });
        if terminal {
            tracing::info!(
                session_id = %state_teardown.session_id(),
                ?change,
                "Transport reached a terminal state"
            );
            state_teardown.trigger(TeardownReason::TerminalState);
        }
    }));

    let connection = Arc::clone(connection);
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(connect_timeout) => {
                let state = connection.connection_state();
                if state != PeerConnectionState::Connected {
                    tracing::warn!(
                        session_id = %teardown.session_id(),
                        ?state,
                        "Not connected after {:?}",
                        connect_timeout
                    );
                    teardown.trigger(TeardownReason::ConnectTimeout);
                }
            }
            _ = teardown.wait() => {}
        }
    })
}
