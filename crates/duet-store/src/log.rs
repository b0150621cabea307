//! The persistence log as seen by the message router.

use async_trait::async_trait;

use duet_core::{now_ms, Message, MessageId, NewMessage, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::sessions::{EndOutcome, SessionRepo, SessionRow, SessionSummary};

/// Durable store of sessions and messages.
///
/// Messages are append-only; sessions only ever change by being ended.
/// Implementations must be safe to call concurrently for different sessions.
#[async_trait]
pub trait PersistenceLog: Send + Sync {
    async fn create_session(&self) -> Result<SessionRow, StoreError>;
    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRow>, StoreError>;
    async fn end_session(&self, id: &SessionId, ended_at: i64) -> Result<EndOutcome, StoreError>;
    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError>;
    async fn messages_for_session(&self, id: &SessionId) -> Result<Vec<Message>, StoreError>;
    async fn latest_timestamp(&self, id: &SessionId) -> Result<Option<i64>, StoreError>;
    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;
    async fn list_sessions(&self, limit: u32, offset: u32)
        -> Result<Vec<SessionSummary>, StoreError>;
    async fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError>;
    fn is_healthy(&self) -> bool;
}

/// SQLite-backed log. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteLog {
    db: Database,
}

impl SqliteLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| StoreError::Io(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl PersistenceLog for SqliteLog {
    async fn create_session(&self) -> Result<SessionRow, StoreError> {
        let created_at = now_ms();
        self.blocking(move |db| SessionRepo::new(db).create(created_at))
            .await
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRow>, StoreError> {
        let id = id.clone();
        self.blocking(move |db| SessionRepo::new(db).find(&id)).await
    }

    async fn end_session(&self, id: &SessionId, ended_at: i64) -> Result<EndOutcome, StoreError> {
        let id = id.clone();
        self.blocking(move |db| SessionRepo::new(db).end(&id, ended_at))
            .await
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.blocking(move |db| MessageRepo::new(db).append(message))
            .await
    }

    async fn messages_for_session(&self, id: &SessionId) -> Result<Vec<Message>, StoreError> {
        let id = id.clone();
        self.blocking(move |db| MessageRepo::new(db).list_for_session(&id))
            .await
    }

    async fn latest_timestamp(&self, id: &SessionId) -> Result<Option<i64>, StoreError> {
        let id = id.clone();
        self.blocking(move |db| MessageRepo::new(db).latest_timestamp(&id))
            .await
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        self.blocking(move |db| match MessageRepo::new(db).get(id) {
            Ok(m) => Ok(Some(m)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn list_sessions(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        self.blocking(move |db| SessionRepo::new(db).list_with_counts(limit, offset))
            .await
    }

    async fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        let id = id.clone();
        self.blocking(move |db| SessionRepo::new(db).delete(&id))
            .await
    }

    fn is_healthy(&self) -> bool {
        self.db.ping()
    }
}
