//! Transport events. Every frame is `{ "event": <name>, "data": <payload> }`.

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::ids::SessionId;
use crate::messages::{Message, MessageBody, MessageType, Role};

/// Events a connected participant sends to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinSession(JoinSession),
    SendMessage(SendMessage),
    EndSession(EndSession),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSession {
    #[serde(alias = "session_id")]
    pub session_id: SessionId,
    pub role: Role,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(alias = "session_id")]
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    #[serde(
        default,
        rename = "message_type",
        alias = "messageType",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSession {
    #[serde(alias = "session_id")]
    pub session_id: SessionId,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinSession(_) => "join-session",
            Self::SendMessage(_) => "send-message",
            Self::EndSession(_) => "end-session",
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::JoinSession(e) => &e.session_id,
            Self::SendMessage(e) => &e.session_id,
            Self::EndSession(e) => &e.session_id,
        }
    }
}

impl SendMessage {
    /// Check the payload and build the typed body to persist.
    pub fn validate(&self) -> Result<MessageBody, ValidationError> {
        if self.session_id.is_blank() {
            return Err(ValidationError::EmptySessionId);
        }
        if self.content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let message_type = match self.message_type.as_deref() {
            None => MessageType::Text,
            Some(raw) => raw.parse()?,
        };
        MessageBody::from_parts(message_type, self.metadata.clone())
    }
}

/// Events the server pushes to connected participants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    UserJoined { role: Role },
    LoadMessages(Vec<Message>),
    NewMessage(Message),
    SessionEnded {},
    Error(ErrorPayload),
}

/// Failure report delivered only to the connection that caused it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub code: String,
    pub message: String,
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "user-joined",
            Self::LoadMessages(_) => "load-messages",
            Self::NewMessage(_) => "new-message",
            Self::SessionEnded {} => "session-ended",
            Self::Error(_) => "error",
        }
    }

    pub fn error(event: Option<&str>, code: &str, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            event: event.map(str::to_string),
            code: code.to_string(),
            message: message.into(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use crate::messages::NewMessage;
    use serde_json::json;

    #[test]
    fn parse_join_session() {
        let raw = r#"{"event":"join-session","data":{"sessionId":"abcd1234","role":"expert"}}"#;
        let evt: ClientEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(evt.name(), "join-session");
        assert_eq!(evt.session_id().as_str(), "abcd1234");
        match evt {
            ClientEvent::JoinSession(j) => assert_eq!(j.role, Role::Expert),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parse_send_message_with_stringified_metadata() {
        let raw = json!({
            "event": "send-message",
            "data": {
                "sessionId": "abcd1234",
                "role": "expert",
                "content": "Pick one",
                "message_type": "multiple_choice",
                "metadata": "{\"question\":\"Pick one\",\"options\":[\"A\",\"B\"]}"
            }
        });
        let evt: ClientEvent = serde_json::from_value(raw).unwrap();
        let ClientEvent::SendMessage(send) = evt else {
            panic!("expected send-message");
        };
        let body = send.validate().unwrap();
        assert_eq!(body.message_type(), MessageType::MultipleChoice);
    }

    #[test]
    fn send_message_defaults_to_text() {
        let send = SendMessage {
            session_id: SessionId::from_raw("abcd1234"),
            role: Role::Learner,
            content: "Hello".into(),
            message_type: None,
            metadata: None,
        };
        assert_eq!(send.validate().unwrap(), MessageBody::Text);
    }

    #[test]
    fn send_message_rejects_empty_content_and_session() {
        let mut send = SendMessage {
            session_id: SessionId::from_raw("abcd1234"),
            role: Role::Learner,
            content: "   ".into(),
            message_type: None,
            metadata: None,
        };
        assert_eq!(send.validate().unwrap_err(), ValidationError::EmptyContent);

        send.content = "hi".into();
        send.session_id = SessionId::from_raw("");
        assert_eq!(send.validate().unwrap_err(), ValidationError::EmptySessionId);
    }

    #[test]
    fn send_message_rejects_unknown_type() {
        let send = SendMessage {
            session_id: SessionId::from_raw("abcd1234"),
            role: Role::Learner,
            content: "hi".into(),
            message_type: Some("poll".into()),
            metadata: None,
        };
        assert!(matches!(
            send.validate(),
            Err(ValidationError::UnknownMessageType(t)) if t == "poll"
        ));
    }

    #[test]
    fn unknown_event_fails_to_parse() {
        let raw = r#"{"event":"kick-user","data":{"sessionId":"abcd1234"}}"#;
        assert!(serde_json::from_str::<ClientEvent>(raw).is_err());
    }

    #[test]
    fn server_event_wire_names() {
        let joined = serde_json::to_value(ServerEvent::UserJoined { role: Role::Learner }).unwrap();
        assert_eq!(joined, json!({"event": "user-joined", "data": {"role": "learner"}}));

        let ended = serde_json::to_value(ServerEvent::SessionEnded {}).unwrap();
        assert_eq!(ended, json!({"event": "session-ended", "data": {}}));

        let empty = serde_json::to_value(ServerEvent::LoadMessages(vec![])).unwrap();
        assert_eq!(empty, json!({"event": "load-messages", "data": []}));
    }

    #[test]
    fn new_message_event_carries_assigned_id() {
        let msg = NewMessage {
            session_id: SessionId::from_raw("abcd1234"),
            role: Role::Expert,
            content: "Hello".into(),
            body: MessageBody::Text,
            timestamp: 1234,
        }
        .into_message(MessageId::new(1));
        let evt = ServerEvent::NewMessage(msg);
        assert_eq!(evt.name(), "new-message");
        let wire: serde_json::Value = serde_json::from_str(&evt.to_json().unwrap()).unwrap();
        assert_eq!(wire["data"]["id"], 1);
        assert_eq!(wire["data"]["timestamp"], 1234);
        assert_eq!(wire["data"]["role"], "expert");
    }

    #[test]
    fn error_event_shape() {
        let evt = ServerEvent::error(Some("send-message"), "SESSION_ENDED", "session has ended");
        let wire = serde_json::to_value(&evt).unwrap();
        assert_eq!(wire["event"], "error");
        assert_eq!(wire["data"]["event"], "send-message");
        assert_eq!(wire["data"]["code"], "SESSION_ENDED");
    }
}
