//! Frame decoding and the error codes reported back to a connection.

use duet_core::{ClientEvent, ServerEvent};

pub const INVALID_EVENT: &str = "INVALID_EVENT";
pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
pub const SESSION_ENDED: &str = "SESSION_ENDED";
pub const INVALID_QUESTION_REF: &str = "INVALID_QUESTION_REF";
pub const PERSISTENCE_FAILED: &str = "PERSISTENCE_FAILED";

const KNOWN_EVENTS: [&str; 3] = ["join-session", "send-message", "end-session"];

/// A frame that could not be turned into a [`ClientEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// Event name, when the frame got far enough to carry one.
    pub event: Option<String>,
    pub message: String,
}

impl DecodeError {
    fn new(event: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            event: event.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.event.as_deref(), INVALID_EVENT, self.message.clone())
    }
}

/// Parse one inbound text frame.
pub fn decode(raw: &str) -> Result<ClientEvent, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| DecodeError::new(None, format!("malformed frame: {e}")))?;

    let name = value
        .get("event")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DecodeError::new(None, "frame has no event name"))?
        .to_string();

    if !KNOWN_EVENTS.contains(&name.as_str()) {
        return Err(DecodeError::new(Some(&name), format!("unknown event: {name}")));
    }

    serde_json::from_value(value)
        .map_err(|e| DecodeError::new(Some(&name), format!("invalid {name} payload: {e}")))
}

/// Serialize an outbound event. Serialization of our own types only fails on
/// a bug, which is logged rather than propagated to the peer.
pub fn encode(event: &ServerEvent) -> Option<String> {
    match event.to_json() {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(event = event.name(), error = %e, "failed to encode outbound event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::Role;

    #[test]
    fn decodes_join() {
        let evt = decode(r#"{"event":"join-session","data":{"sessionId":"abcd1234","role":"learner"}}"#)
            .unwrap();
        match evt {
            ClientEvent::JoinSession(join) => {
                assert_eq!(join.session_id.as_str(), "abcd1234");
                assert_eq!(join.role, Role::Learner);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn rejects_non_json() {
        let err = decode("hello").unwrap_err();
        assert!(err.event.is_none());
        assert!(err.message.starts_with("malformed frame"));
    }

    #[test]
    fn rejects_missing_event_name() {
        let err = decode(r#"{"data":{}}"#).unwrap_err();
        assert_eq!(err.message, "frame has no event name");
    }

    #[test]
    fn rejects_unknown_event() {
        let err = decode(r#"{"event":"leave-session","data":{}}"#).unwrap_err();
        assert_eq!(err.event.as_deref(), Some("leave-session"));
        assert_eq!(err.message, "unknown event: leave-session");
    }

    #[test]
    fn rejects_bad_role() {
        let err = decode(r#"{"event":"join-session","data":{"sessionId":"abcd1234","role":"admin"}}"#)
            .unwrap_err();
        assert_eq!(err.event.as_deref(), Some("join-session"));

        let json: serde_json::Value =
            serde_json::from_str(&encode(&err.to_event()).unwrap()).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["data"]["code"], INVALID_EVENT);
        assert_eq!(json["data"]["event"], "join-session");
    }
}
