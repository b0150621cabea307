//! Join / send / end handling for session rooms.
//!
//! Every event that touches a session runs under that session's lock, so
//! timestamp assignment, the append and the fan-out happen as one step, and a
//! join's history read never interleaves with an append. Different sessions
//! never contend.

use std::sync::Arc;

use dashmap::DashMap;
use duet_core::events::{EndSession, JoinSession, SendMessage};
use duet_core::{
    now_ms, ClientEvent, ConnectionId, MessageId, MessageType, NewMessage, ServerEvent, SessionId,
    ValidationError,
};
use duet_settings::PolicySettings;
use duet_store::{EndOutcome, PersistenceLog, SessionRow, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::protocol::{self, encode};
use crate::registry::SessionRegistry;

/// Why an inbound event was refused. Reported to the originating connection
/// only.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("{0}")]
    InvalidEvent(String),
    #[error(transparent)]
    InvalidMessage(#[from] ValidationError),
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {0} has ended")]
    SessionEnded(SessionId),
    #[error("questionId {0} does not reference a multiple_choice message in this session")]
    InvalidQuestionRef(MessageId),
    #[error("persistence failed: {0}")]
    Persistence(#[source] StoreError),
}

impl RouterError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidEvent(_) => protocol::INVALID_EVENT,
            Self::InvalidMessage(_) => protocol::INVALID_MESSAGE,
            Self::SessionNotFound(_) => protocol::SESSION_NOT_FOUND,
            Self::SessionEnded(_) => protocol::SESSION_ENDED,
            Self::InvalidQuestionRef(_) => protocol::INVALID_QUESTION_REF,
            Self::Persistence(_) => protocol::PERSISTENCE_FAILED,
        }
    }
}

/// Source of message and end times, in ms since the epoch.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Per-session serialization point.
#[derive(Debug, Default)]
struct SessionCursor {
    /// Last timestamp handed out, so replay order never goes backwards when
    /// the wall clock does. `None` until read back from the log.
    last_timestamp: Option<i64>,
}

pub struct MessageRouter {
    log: Arc<dyn PersistenceLog>,
    registry: Arc<SessionRegistry>,
    policy: PolicySettings,
    cursors: DashMap<SessionId, Arc<Mutex<SessionCursor>>>,
    clock: Clock,
}

impl MessageRouter {
    pub fn new(
        log: Arc<dyn PersistenceLog>,
        registry: Arc<SessionRegistry>,
        policy: PolicySettings,
    ) -> Self {
        Self {
            log,
            registry,
            policy,
            cursors: DashMap::new(),
            clock: Arc::new(now_ms),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn log(&self) -> &Arc<dyn PersistenceLog> {
        &self.log
    }

    pub fn policy(&self) -> PolicySettings {
        self.policy
    }

    /// Decode and handle one raw frame from a connection.
    pub async fn handle_frame(&self, conn: &ConnectionId, raw: &str) {
        match protocol::decode(raw) {
            Ok(event) => self.handle(conn, event).await,
            Err(e) => {
                warn!(connection_id = %conn, reason = %e.message, "rejected frame");
                if let Some(frame) = encode(&e.to_event()) {
                    self.registry.send_to(conn, &frame);
                }
            }
        }
    }

    /// Handle one event, reporting any failure to `conn` alone.
    pub async fn handle(&self, conn: &ConnectionId, event: ClientEvent) {
        let name = event.name();
        let session_id = event.session_id().clone();
        if let Err(e) = self.dispatch(conn, event).await {
            match &e {
                RouterError::Persistence(source) => {
                    error!(connection_id = %conn, %session_id, event = name, error = %source, "persistence failed")
                }
                other => {
                    warn!(connection_id = %conn, %session_id, event = name, code = other.code(), reason = %other, "event rejected")
                }
            }
            if let Some(frame) = encode(&ServerEvent::error(Some(name), e.code(), e.to_string())) {
                self.registry.send_to(conn, &frame);
            }
        }
    }

    pub async fn dispatch(&self, conn: &ConnectionId, event: ClientEvent) -> Result<(), RouterError> {
        match event {
            ClientEvent::JoinSession(req) => self.join(conn, req).await,
            ClientEvent::SendMessage(req) => self.send(conn, req).await,
            ClientEvent::EndSession(req) => self.end(conn, req).await,
        }
    }

    /// Admit `conn` to the room, tell the others, then replay history to it.
    #[instrument(skip_all, fields(connection_id = %conn, session_id = %req.session_id, role = %req.role))]
    async fn join(&self, conn: &ConnectionId, req: JoinSession) -> Result<(), RouterError> {
        require_session_id(&req.session_id)?;

        let cursor = self.cursor(&req.session_id);
        let mut cursor = cursor.lock().await;

        if self.find_session(&req.session_id).await?.is_none()
            && self.policy.reject_unknown_sessions
        {
            return Err(RouterError::SessionNotFound(req.session_id));
        }

        let history = self
            .log
            .messages_for_session(&req.session_id)
            .await
            .map_err(RouterError::Persistence)?;
        // History is in timestamp order, so its tail is the latest stamp.
        if cursor.last_timestamp.is_none() {
            cursor.last_timestamp = Some(history.last().map_or(0, |m| m.timestamp));
        }

        if !self.registry.join(conn, &req.session_id, req.role) {
            debug!("connection closed before join completed");
            return Ok(());
        }

        if let Some(frame) = encode(&ServerEvent::UserJoined { role: req.role }) {
            self.registry.broadcast_except(&req.session_id, conn, &frame);
        }
        let replayed = history.len();
        if let Some(frame) = encode(&ServerEvent::LoadMessages(history)) {
            self.registry.send_to(conn, &frame);
        }

        info!(replayed, "participant joined");
        Ok(())
    }

    /// Persist a message, then deliver it to the whole room, sender included.
    #[instrument(skip_all, fields(connection_id = %conn, session_id = %req.session_id, role = %req.role))]
    async fn send(&self, conn: &ConnectionId, req: SendMessage) -> Result<(), RouterError> {
        let body = req.validate()?;

        let cursor = self.cursor(&req.session_id);
        let mut cursor = cursor.lock().await;

        match self.find_session(&req.session_id).await? {
            None => return Err(RouterError::SessionNotFound(req.session_id)),
            Some(session) if session.is_ended() && self.policy.reject_ended_sends => {
                return Err(RouterError::SessionEnded(req.session_id));
            }
            Some(_) => {}
        }

        if let Some(question_id) = body.question_ref() {
            if self.policy.verify_question_refs {
                self.verify_question_ref(&req.session_id, question_id).await?;
            }
        }

        let last = match cursor.last_timestamp {
            Some(last) => last,
            None => self
                .log
                .latest_timestamp(&req.session_id)
                .await
                .map_err(RouterError::Persistence)?
                .unwrap_or(0),
        };
        let timestamp = (self.clock)().max(last);
        let message = self
            .log
            .append_message(NewMessage {
                session_id: req.session_id.clone(),
                role: req.role,
                content: req.content,
                body,
                timestamp,
            })
            .await
            .map_err(RouterError::Persistence)?;
        cursor.last_timestamp = Some(timestamp);

        let message_id = message.id;
        let message_type = message.message_type();
        if let Some(frame) = encode(&ServerEvent::NewMessage(message)) {
            let delivered = self.registry.broadcast(&req.session_id, &frame);
            debug!(%message_id, message_type = %message_type.as_str(), delivered, "message delivered");
        }
        Ok(())
    }

    /// End the session. Only the first end reaches the room; a repeat is
    /// acknowledged to the caller alone and leaves the record untouched.
    #[instrument(skip_all, fields(connection_id = %conn, session_id = %req.session_id))]
    async fn end(&self, conn: &ConnectionId, req: EndSession) -> Result<(), RouterError> {
        require_session_id(&req.session_id)?;

        let cursor = self.cursor(&req.session_id);
        let _cursor = cursor.lock().await;

        let outcome = self
            .log
            .end_session(&req.session_id, (self.clock)())
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => RouterError::SessionNotFound(req.session_id.clone()),
                other => RouterError::Persistence(other),
            })?;

        let Some(frame) = encode(&ServerEvent::SessionEnded {}) else {
            return Ok(());
        };
        let ended_at = outcome.session().ended_at;
        match outcome {
            EndOutcome::Ended(_) => {
                let delivered = self.registry.broadcast(&req.session_id, &frame);
                info!(?ended_at, delivered, "session ended");
            }
            EndOutcome::AlreadyEnded(_) => {
                self.registry.send_to(conn, &frame);
                debug!(?ended_at, "session already ended");
            }
        }
        Ok(())
    }

    async fn verify_question_ref(
        &self,
        session_id: &SessionId,
        question_id: MessageId,
    ) -> Result<(), RouterError> {
        let question = self
            .log
            .get_message(question_id)
            .await
            .map_err(RouterError::Persistence)?;
        match question {
            Some(q) if q.session_id == *session_id && q.message_type() == MessageType::MultipleChoice => {
                Ok(())
            }
            _ => Err(RouterError::InvalidQuestionRef(question_id)),
        }
    }

    async fn find_session(&self, id: &SessionId) -> Result<Option<SessionRow>, RouterError> {
        self.log.get_session(id).await.map_err(RouterError::Persistence)
    }

    fn cursor(&self, id: &SessionId) -> Arc<Mutex<SessionCursor>> {
        Arc::clone(self.cursors.entry(id.clone()).or_default().value())
    }

    /// Drop serialization state for sessions with no members and no event in
    /// flight.
    pub fn prune_idle_sessions(&self) -> usize {
        let before = self.cursors.len();
        self.cursors.retain(|id, cursor| {
            Arc::strong_count(cursor) > 1 || self.registry.has_members(id)
        });
        before.saturating_sub(self.cursors.len())
    }

    pub fn tracked_sessions(&self) -> usize {
        self.cursors.len()
    }
}

fn require_session_id(id: &SessionId) -> Result<(), RouterError> {
    if id.is_blank() {
        Err(RouterError::InvalidEvent(ValidationError::EmptySessionId.to_string()))
    } else {
        Ok(())
    }
}
