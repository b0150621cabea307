use tracing::instrument;

use duet_core::{Message, MessageBody, MessageId, NewMessage, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SELECT_COLUMNS: &str =
    "SELECT id, session_id, role, content, timestamp, message_type, metadata FROM messages";

/// Append-only message log.
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a message and return it with its assigned id.
    #[instrument(skip(self, message), fields(session_id = %message.session_id, message_type = %message.body.message_type()))]
    pub fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
        let metadata = message
            .body
            .metadata()
            .map(|m| serde_json::to_string(&m))
            .transpose()?;

        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (session_id, role, content, timestamp, message_type, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    message.session_id.as_str(),
                    message.role.as_str(),
                    message.content,
                    message.timestamp,
                    message.body.message_type().as_str(),
                    metadata,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        Ok(message.into_message(MessageId::new(id)))
    }

    /// Full history of a session in replay order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// Get a single message by ID.
    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: MessageId) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    /// Largest timestamp stored for the session, `None` when it has no messages.
    pub fn latest_timestamp(&self, session_id: &SessionId) -> Result<Option<i64>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT MAX(timestamp) FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let role: String = row_helpers::get(row, 2, "messages", "role")?;
    let message_type: String = row_helpers::get(row, 5, "messages", "message_type")?;
    let metadata = row_helpers::get_opt::<String>(row, 6, "messages", "metadata")?
        .map(|raw| row_helpers::parse_json(&raw, "messages", "metadata"))
        .transpose()?;

    let body = MessageBody::from_parts(
        row_helpers::parse_enum(&message_type, "messages", "message_type")?,
        metadata,
    )
    .map_err(|e| StoreError::CorruptRow {
        table: "messages",
        column: "metadata",
        detail: e.to_string(),
    })?;

    Ok(Message {
        id: MessageId::new(row_helpers::get(row, 0, "messages", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "messages", "session_id")?),
        role: row_helpers::parse_enum(&role, "messages", "role")?,
        content: row_helpers::get(row, 3, "messages", "content")?,
        body,
        timestamp: row_helpers::get(row, 4, "messages", "timestamp")?,
    })
}
