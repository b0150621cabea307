use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// What [`Database::open`] had to change to bring the file up to date.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version recorded before opening, `None` for a fresh or untracked file.
    pub from: Option<u32>,
    pub to: u32,
    pub added_columns: Vec<&'static str>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.added_columns.is_empty() && self.from == Some(self.to)
    }
}

/// Thread-safe SQLite connection wrapper.
/// A single connection behind a parking_lot::Mutex (rusqlite connections are not Sync).
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    migration: MigrationReport,
}

impl Database {
    /// Open or create a database at the given path, migrating older schemas.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
            }
        }

        let conn = Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?;
        let migration = initialize(&conn)?;

        info!(
            path = %path.display(),
            version = migration.to,
            added_columns = migration.added_columns.len(),
            "database opened"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
            migration,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Database(e.to_string()))?;
        let migration = initialize(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
            migration,
        })
    }

    /// Execute a closure with the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Re-run the migration step. A no-op once the schema is current.
    pub fn migrate(&self) -> Result<MigrationReport, StoreError> {
        self.with_conn(migrate)
    }

    /// Migration performed when this handle was opened.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cheap liveness probe used by the health endpoint.
    pub fn ping(&self) -> bool {
        self.with_conn(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(())
        })
        .is_ok()
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            path: self.path.clone(),
            migration: self.migration.clone(),
        }
    }
}

fn initialize(conn: &Connection) -> Result<MigrationReport, StoreError> {
    conn.execute_batch(schema::PRAGMAS)
        .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;

    conn.execute_batch(schema::CREATE_TABLES)
        .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

    migrate(conn)
}

fn migrate(conn: &Connection) -> Result<MigrationReport, StoreError> {
    let from: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;

    let existing: Vec<String> = conn
        .prepare("PRAGMA table_info(messages)")?
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;

    let mut added_columns = Vec::new();
    for (column, ddl) in schema::MESSAGE_COLUMN_MIGRATIONS {
        if !existing.iter().any(|c| c == column) {
            conn.execute_batch(ddl)
                .map_err(|e| StoreError::Database(format!("add column {column}: {e}")))?;
            added_columns.push(*column);
        }
    }

    match from {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )?;
        }
        Some(v) if v < schema::SCHEMA_VERSION => {
            conn.execute("UPDATE schema_version SET version = ?1", [schema::SCHEMA_VERSION])?;
        }
        Some(_) => {}
    }

    if !added_columns.is_empty() {
        info!(?added_columns, "migrated messages table");
    }

    Ok(MigrationReport {
        from,
        to: schema::SCHEMA_VERSION,
        added_columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("duet-store-test-{}", uuid::Uuid::now_v7()));
        let path = dir.join(name);
        (dir, path)
    }

    #[test]
    fn open_in_memory() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.path(), Path::new(":memory:"));
        assert!(db.ping());
    }

    #[test]
    fn schema_version_set() {
        let db = Database::in_memory().unwrap();
        let version: u32 = db
            .with_conn(|conn| {
                conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))
                    .map_err(|e| StoreError::Database(e.to_string()))
            })
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
        assert_eq!(db.migration_report().from, None);
    }

    #[test]
    fn tables_and_indexes_created() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let names: Vec<String> = conn
                .prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'index') ORDER BY name")?
                .query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?;

            assert!(names.contains(&"sessions".to_string()));
            assert!(names.contains(&"messages".to_string()));
            assert!(names.contains(&"idx_messages_session".to_string()));
            assert!(names.contains(&"idx_messages_timestamp".to_string()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn second_migration_is_noop() {
        let db = Database::in_memory().unwrap();
        let report = db.migrate().unwrap();
        assert!(report.is_noop(), "{report:?}");
    }

    #[test]
    fn open_file_database_twice() {
        let (dir, path) = temp_path("test.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());

        let db2 = Database::open(&path).unwrap();
        assert!(db2.migration_report().is_noop());
        drop(db);
        drop(db2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn upgrades_version_one_layout() {
        let (dir, path) = temp_path("legacy.db");
        std::fs::create_dir_all(&dir).unwrap();
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE sessions (id TEXT PRIMARY KEY, created_at INTEGER NOT NULL, ended_at INTEGER);
                 CREATE TABLE messages (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     session_id TEXT NOT NULL,
                     role TEXT NOT NULL,
                     content TEXT NOT NULL,
                     timestamp INTEGER NOT NULL
                 );
                 INSERT INTO sessions (id, created_at) VALUES ('old12345', 1);
                 INSERT INTO messages (session_id, role, content, timestamp) VALUES ('old12345', 'expert', 'hi', 2);",
            )
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let report = db.migration_report().clone();
        assert_eq!(report.from, None);
        assert_eq!(report.added_columns, vec!["message_type", "metadata"]);

        let message_type: String = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT message_type FROM messages", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(message_type, "text");

        assert!(db.migrate().unwrap().is_noop());
        drop(db);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn foreign_keys_enforced() {
        let db = Database::in_memory().unwrap();
        let result = db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (session_id, role, content, timestamp) VALUES ('missing', 'expert', 'x', 1)",
                [],
            )?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::Database(_))));
    }
}
