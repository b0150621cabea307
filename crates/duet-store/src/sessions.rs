use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use duet_core::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// How many fresh codes `create` tries before giving up on collisions.
const MAX_CODE_ATTEMPTS: usize = 8;

/// Session lifecycle. `Ended` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub created_at: i64,
    pub ended_at: Option<i64>,
}

impl SessionRow {
    pub fn status(&self) -> SessionStatus {
        if self.ended_at.is_some() {
            SessionStatus::Ended
        } else {
            SessionStatus::Open
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// A session plus how many messages it holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: SessionRow,
    pub message_count: i64,
}

/// Result of ending a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndOutcome {
    /// This call set `ended_at`.
    Ended(SessionRow),
    /// The session was already ended; the record is untouched.
    AlreadyEnded(SessionRow),
}

impl EndOutcome {
    pub fn session(&self) -> &SessionRow {
        match self {
            Self::Ended(s) | Self::AlreadyEnded(s) => s,
        }
    }
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a session under a freshly generated code.
    #[instrument(skip(self))]
    pub fn create(&self, created_at: i64) -> Result<SessionRow, StoreError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            match self.create_with_id(&SessionId::generate(), created_at) {
                Err(StoreError::Conflict(detail)) => {
                    warn!(%detail, "session code collision, retrying");
                }
                other => return other,
            }
        }
        Err(StoreError::Conflict(format!(
            "no free session code after {MAX_CODE_ATTEMPTS} attempts"
        )))
    }

    /// Create a session with a caller-chosen id.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn create_with_id(&self, id: &SessionId, created_at: i64) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, created_at) VALUES (?1, ?2)",
                rusqlite::params![id.as_str(), created_at],
            )
            .map_err(|e| {
                if row_helpers::is_constraint_violation(&e) {
                    StoreError::Conflict(format!("session {id} already exists"))
                } else {
                    StoreError::from(e)
                }
            })?;

            Ok(SessionRow {
                id: id.clone(),
                created_at,
                ended_at: None,
            })
        })
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    /// Get a session by ID, `None` when absent.
    pub fn find(&self, id: &SessionId) -> Result<Option<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, created_at, ended_at FROM sessions WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row).map(Some),
                None => Ok(None),
            }
        })
    }

    /// Mark a session ended. Never overwrites an existing `ended_at`.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn end(&self, id: &SessionId, ended_at: i64) -> Result<EndOutcome, StoreError> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
                rusqlite::params![ended_at, id.as_str()],
            )?)
        })?;

        let session = self.get(id)?;
        if changed == 1 {
            Ok(EndOutcome::Ended(session))
        } else {
            Ok(EndOutcome::AlreadyEnded(session))
        }
    }

    /// List sessions with their message counts, newest first.
    #[instrument(skip(self))]
    pub fn list_with_counts(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.created_at, s.ended_at, COUNT(m.id) AS message_count
                 FROM sessions s
                 LEFT JOIN messages m ON s.id = m.session_id
                 GROUP BY s.id
                 ORDER BY s.created_at DESC, s.id ASC
                 LIMIT ?1 OFFSET ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(SessionSummary {
                    session: row_to_session(row)?,
                    message_count: row_helpers::get(row, 3, "sessions", "message_count")?,
                });
            }
            Ok(results)
        })
    }

    /// Administrative purge of one session and its messages.
    /// Returns false when the session did not exist.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM messages WHERE session_id = ?1", [id.as_str()])?;
            let removed = tx.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            tx.commit()?;
            Ok(removed > 0)
        })
    }

    /// Delete every session and message. Returns `(sessions, messages)` removed.
    #[instrument(skip(self))]
    pub fn purge_all(&self) -> Result<(usize, usize), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let messages = tx.execute("DELETE FROM messages", [])?;
            let sessions = tx.execute("DELETE FROM sessions", [])?;
            tx.commit()?;
            Ok((sessions, messages))
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        created_at: row_helpers::get(row, 1, "sessions", "created_at")?,
        ended_at: row_helpers::get_opt(row, 2, "sessions", "ended_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_session_is_open() {
        let repo = setup();
        let session = repo.create(1_000).unwrap();
        assert_eq!(session.id.as_str().len(), duet_core::ids::SESSION_CODE_LEN);
        assert_eq!(session.created_at, 1_000);
        assert_eq!(session.status(), SessionStatus::Open);
    }

    #[test]
    fn create_with_duplicate_id_conflicts() {
        let repo = setup();
        let id = SessionId::from_raw("abcd1234");
        repo.create_with_id(&id, 1).unwrap();
        let result = repo.create_with_id(&id, 2);
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(repo.get(&id).unwrap().created_at, 1);
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = setup();
        let result = repo.get(&SessionId::from_raw("missing0"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(repo.find(&SessionId::from_raw("missing0")).unwrap().is_none());
    }

    #[test]
    fn end_session_sets_ended_at_once() {
        let repo = setup();
        let id = SessionId::from_raw("abcd1234");
        repo.create_with_id(&id, 100).unwrap();

        let first = repo.end(&id, 200).unwrap();
        assert!(matches!(first, EndOutcome::Ended(ref s) if s.ended_at == Some(200)));

        let second = repo.end(&id, 300).unwrap();
        match second {
            EndOutcome::AlreadyEnded(s) => {
                assert_eq!(s.ended_at, Some(200));
                assert_eq!(s.created_at, 100);
            }
            other => panic!("expected AlreadyEnded, got {other:?}"),
        }
        assert_eq!(repo.get(&id).unwrap().status(), SessionStatus::Ended);
    }

    #[test]
    fn end_missing_session_is_not_found() {
        let repo = setup();
        let result = repo.end(&SessionId::from_raw("missing0"), 1);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_with_counts_newest_first() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        repo.create_with_id(&SessionId::from_raw("older000"), 1).unwrap();
        repo.create_with_id(&SessionId::from_raw("newer000"), 2).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (session_id, role, content, timestamp) VALUES ('older000', 'expert', 'a', 5), ('older000', 'learner', 'b', 6)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let list = repo.list_with_counts(100, 0).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].session.id.as_str(), "newer000");
        assert_eq!(list[0].message_count, 0);
        assert_eq!(list[1].message_count, 2);

        let page = repo.list_with_counts(1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].session.id.as_str(), "older000");
    }

    #[test]
    fn summary_serializes_flat() {
        let summary = SessionSummary {
            session: SessionRow {
                id: SessionId::from_raw("abcd1234"),
                created_at: 1,
                ended_at: None,
            },
            message_count: 3,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["id"], "abcd1234");
        assert!(json["ended_at"].is_null());
        assert_eq!(json["message_count"], 3);
    }

    #[test]
    fn delete_session_purges_messages() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        let id = SessionId::from_raw("abcd1234");
        repo.create_with_id(&id, 1).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (session_id, role, content, timestamp) VALUES ('abcd1234', 'expert', 'a', 5)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        assert!(repo.delete(&id).unwrap());
        assert!(repo.find(&id).unwrap().is_none());
        assert!(!repo.delete(&id).unwrap());
    }

    #[test]
    fn purge_all_reports_counts() {
        let repo = setup();
        repo.create(1).unwrap();
        repo.create(2).unwrap();
        assert_eq!(repo.count().unwrap(), 2);

        let (sessions, messages) = repo.purge_all().unwrap();
        assert_eq!(sessions, 2);
        assert_eq!(messages, 0);
        assert_eq!(repo.count().unwrap(), 0);
    }
}
