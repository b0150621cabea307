//! Domain types shared by every duet crate: identifiers, the message model
//! and the transport events exchanged with connected participants.

pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;

pub use errors::ValidationError;
pub use events::{ClientEvent, ErrorPayload, ServerEvent};
pub use ids::{ConnectionId, MessageId, SessionId};
pub use messages::{Message, MessageBody, MessageType, NewMessage, Role};

/// Milliseconds since the UNIX epoch, the unit used for every persisted time.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
