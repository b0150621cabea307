pub mod database;
pub mod error;
pub mod log;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use database::{Database, MigrationReport};
pub use error::StoreError;
pub use log::{PersistenceLog, SqliteLog};
pub use messages::MessageRepo;
pub use sessions::{EndOutcome, SessionRepo, SessionRow, SessionStatus, SessionSummary};
