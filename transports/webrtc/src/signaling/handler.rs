//! Offer / answer / trickle-ICE handler
//!
//! Two roles share the same session machinery:
//!
//! * offerer: [`SignalingHandler::create_offer`] starts a session and
//!   returns an offer; every later message for that id goes through
//!   [`SignalingHandler::apply_answer`], which applies the remote side and
//!   returns whatever local candidates were gathered since the last call.
//! * responder: [`SignalingHandler::create_answer`] takes a remote offer
//!   and returns a complete answer once local gathering has finished.

use super::message::{
    new_session_id, IceCandidate, RtcConfiguration, SdpType, SessionDescription, SessionId,
    SignalingMessage,
};
use crate::config::BridgeConfig;
use crate::peer::{RtcConnection, RtcEngine};
use crate::session::{startup, RemoteUpdate, Session, SessionManager, Stage, Teardown, TeardownReason};
use crate::source::SourceDescriptor;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of answering a remote offer
pub struct AnswerSession {
    pub session_id: SessionId,
    /// Transport connection carrying the media
    pub connection: Arc<dyn RtcConnection>,
    /// Answer to send back, candidates embedded in the SDP
    pub message: SignalingMessage,
}

impl std::fmt::Debug for AnswerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerSession")
            .field("session_id", &self.session_id)
            .field("message", &self.message)
            .finish()
    }
}

/// Signaling entry point
pub struct SignalingHandler {
    engine: Arc<dyn RtcEngine>,
    config: BridgeConfig,
    sessions: Arc<SessionManager>,
}

impl SignalingHandler {
    /// Create a handler using `engine` for every transport connection
    pub fn new(engine: Arc<dyn RtcEngine>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            config,
            sessions: Arc::new(SessionManager::new()),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    fn default_configuration(&self) -> RtcConfiguration {
        RtcConfiguration::new(self.config.ice_servers.clone())
    }

    /// Start a session for `source` and return the offer to relay
    #[instrument(skip_all)]
    pub async fn create_offer(&self, source: &SourceDescriptor) -> Result<SignalingMessage> {
        let id = new_session_id();
        let configuration = self.default_configuration();
        let session = self.start_session(&id, source, configuration.clone()).await?;

        let offer = match local_offer(session.connection().as_ref()).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(session_id = %id, "Failed to create offer: {}", e);
                session.close();
                return Err(e);
            }
        };

        self.register(&session).await?;
        info!(session_id = %id, "Offer created");
        Ok(SignalingMessage::offer(id, offer, configuration))
    }

    /// Apply a remote answer and/or candidates to an offering session
    ///
    /// Returns the local candidates gathered since the previous call. If
    /// nothing could be applied and none are queued yet, waits for the next
    /// local candidate, the end of gathering, or teardown.
    #[instrument(skip_all, fields(session_id = ?msg.id))]
    pub async fn apply_answer(&self, msg: &SignalingMessage) -> Result<SignalingMessage> {
        let id = msg
            .id
            .as_deref()
            .ok_or_else(|| Error::SessionNotFound("message carries no session id".to_string()))?;
        let session = self.sessions.get(id).await?;

        let update = session
            .apply_remote(msg.description.clone(), msg.candidate_list())
            .await?;
        debug!(session_id = %id, ?update, "Remote update applied");

        if update == RemoteUpdate::Applied(0) && session.local_candidates().is_empty() {
            session.wait_for_local_candidate().await?;
        }

        let candidates = session.drain_local_candidates();
        debug!(session_id = %id, count = candidates.len(), "Returning local candidates");
        Ok(SignalingMessage::trickle(id.to_string(), candidates))
    }

    /// Start a session answering `offer` and return the complete answer
    #[instrument(skip_all)]
    pub async fn create_answer(
        &self,
        offer: &SignalingMessage,
        source: &SourceDescriptor,
    ) -> Result<AnswerSession> {
        let description = match &offer.description {
            Some(description) if description.sdp_type == SdpType::Offer => description.clone(),
            Some(description) => {
                return Err(Error::SdpError(format!(
                    "expected an offer, got {:?}",
                    description.sdp_type
                )))
            }
            None => {
                return Err(Error::SdpError(
                    "offer message carries no description".to_string(),
                ))
            }
        };

        let id = new_session_id();
        let configuration = offer
            .configuration
            .clone()
            .unwrap_or_else(|| self.default_configuration());
        let session = self.start_session(&id, source, configuration.clone()).await?;

        let answer = match answer_offer(&session, description, offer.candidate_list()).await {
            Ok(()) => {
                self.register(&session).await?;
                gathered_answer(&session).await
            }
            Err(e) => Err(e),
        };

        match answer {
            Ok(description) => {
                info!(session_id = %id, "Answer created");
                Ok(AnswerSession {
                    session_id: id.clone(),
                    connection: Arc::clone(session.connection()),
                    message: SignalingMessage::answer(id, description, configuration),
                })
            }
            Err(e) if e.is_terminal() => {
                info!(session_id = %id, "Session ended before the answer was ready: {}", e);
                session.close();
                Err(e)
            }
            Err(e) => {
                warn!(session_id = %id, "Failed to answer offer: {}", e);
                session.close();
                Err(e)
            }
        }
    }

    /// Tear a session down and wait until its resources are released
    #[instrument(skip(self))]
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let session = self.sessions.get(session_id).await?;
        session.close();
        session.teardown().wait_complete().await;
        Ok(())
    }

    /// Tear every live session down
    pub async fn close_all(&self) {
        for id in self.sessions.session_ids().await {
            if let Err(e) = self.close_session(&id).await {
                debug!(session_id = %id, "Session already gone: {}", e);
            }
        }
    }

    async fn start_session(
        &self,
        id: &str,
        source: &SourceDescriptor,
        configuration: RtcConfiguration,
    ) -> Result<Arc<Session>> {
        let teardown = Teardown::new(id);
        {
            let sessions = Arc::downgrade(&self.sessions);
            let id = id.to_string();
            teardown.on(Stage::Registry, move || async move {
                if let Some(sessions) = sessions.upgrade() {
                    sessions.remove(&id).await;
                }
            });
        }

        let media = startup::launch(
            self.engine.as_ref(),
            &self.config,
            source,
            &configuration.ice_servers,
            &teardown,
        )
        .await?;

        Ok(Arc::new(Session::new(
            id.to_string(),
            media,
            teardown,
            configuration,
        )))
    }

    async fn register(&self, session: &Arc<Session>) -> Result<()> {
        if let Err(e) = self.sessions.insert(Arc::clone(session)).await {
            session.close();
            return Err(e);
        }
        // The registry stage may already have run before the insert
        if session.teardown().is_triggered() {
            self.sessions.remove(session.id()).await;
            let reason = session.teardown().reason().unwrap_or(TeardownReason::Closed);
            return Err(reason.into_error(session.id()));
        }
        Ok(())
    }
}

async fn local_offer(connection: &dyn RtcConnection) -> Result<SessionDescription> {
    let offer = connection.create_offer().await?;
    connection.set_local_description(offer.clone()).await?;
    Ok(offer)
}

async fn answer_offer(
    session: &Session,
    description: SessionDescription,
    candidates: &[IceCandidate],
) -> Result<()> {
    session.apply_remote(Some(description), candidates).await?;
    let connection = session.connection();
    let answer = connection.create_answer().await?;
    connection.set_local_description(answer).await
}

async fn gathered_answer(session: &Session) -> Result<SessionDescription> {
    session.wait_for_gathering().await?;
    session
        .connection()
        .local_description()
        .await
        .ok_or_else(|| Error::SdpError("no local description after gathering".to_string()))
}
