use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::ids::{MessageId, SessionId};

/// Minimum number of options a multiple-choice question must offer.
pub const MIN_CHOICE_OPTIONS: usize = 2;

/// Which participant authored a message. Not a connection identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Expert,
    Learner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expert => "expert",
            Self::Learner => "learner",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expert" => Ok(Self::Expert),
            "learner" => Ok(Self::Learner),
            other => Err(ValidationError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    MultipleChoice,
    ChoiceResponse,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::MultipleChoice => "multiple_choice",
            Self::ChoiceResponse => "choice_response",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "multiple_choice" => Ok(Self::MultipleChoice),
            "choice_response" => Ok(Self::ChoiceResponse),
            other => Err(ValidationError::UnknownMessageType(other.to_string())),
        }
    }
}

/// A question with an ordered list of answers to pick from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipleChoice {
    pub question: String,
    pub options: Vec<String>,
}

/// The learner's pick for an earlier multiple-choice message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceResponse {
    pub question: String,
    pub answer: String,
    pub question_id: MessageId,
}

/// Message payload keyed by `message_type`. Each variant carries its own
/// metadata schema; `Text` carries none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Text,
    MultipleChoice(MultipleChoice),
    ChoiceResponse(ChoiceResponse),
}

impl MessageBody {
    /// Build and validate a body from the loosely typed wire fields.
    ///
    /// `metadata` may be a JSON object or a JSON-encoded string holding one;
    /// `null` counts as absent.
    pub fn from_parts(
        message_type: MessageType,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, ValidationError> {
        let metadata = normalize_metadata(metadata)?;
        let body = match (message_type, metadata) {
            (MessageType::Text, None) => Self::Text,
            (MessageType::Text, Some(_)) => {
                return Err(ValidationError::UnexpectedMetadata { message_type: "text" })
            }
            (MessageType::MultipleChoice, None) => {
                return Err(ValidationError::MissingMetadata {
                    message_type: "multiple_choice",
                })
            }
            (MessageType::MultipleChoice, Some(raw)) => Self::MultipleChoice(
                serde_json::from_value(raw)
                    .map_err(|e| ValidationError::MalformedMetadata(e.to_string()))?,
            ),
            (MessageType::ChoiceResponse, None) => {
                return Err(ValidationError::MissingMetadata {
                    message_type: "choice_response",
                })
            }
            (MessageType::ChoiceResponse, Some(raw)) => Self::ChoiceResponse(
                serde_json::from_value(raw)
                    .map_err(|e| ValidationError::MalformedMetadata(e.to_string()))?,
            ),
        };
        body.validate()?;
        Ok(body)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text => MessageType::Text,
            Self::MultipleChoice(_) => MessageType::MultipleChoice,
            Self::ChoiceResponse(_) => MessageType::ChoiceResponse,
        }
    }

    /// Metadata as it appears on the wire and in storage.
    pub fn metadata(&self) -> Option<serde_json::Value> {
        match self {
            Self::Text => None,
            Self::MultipleChoice(mc) => serde_json::to_value(mc).ok(),
            Self::ChoiceResponse(cr) => serde_json::to_value(cr).ok(),
        }
    }

    /// The multiple-choice message a response points at, if any.
    pub fn question_ref(&self) -> Option<MessageId> {
        match self {
            Self::ChoiceResponse(cr) => Some(cr.question_id),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Text => Ok(()),
            Self::MultipleChoice(mc) => {
                require_text(&mc.question, "question")?;
                if mc.options.len() < MIN_CHOICE_OPTIONS {
                    return Err(ValidationError::TooFewOptions {
                        min: MIN_CHOICE_OPTIONS,
                        actual: mc.options.len(),
                    });
                }
                if mc.options.iter().any(|o| o.trim().is_empty()) {
                    return Err(ValidationError::BlankField("options"));
                }
                Ok(())
            }
            Self::ChoiceResponse(cr) => {
                require_text(&cr.question, "question")?;
                require_text(&cr.answer, "answer")?;
                if cr.question_id.get() <= 0 {
                    return Err(ValidationError::InvalidQuestionId(cr.question_id.get()));
                }
                Ok(())
            }
        }
    }
}

fn require_text(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::BlankField(field))
    } else {
        Ok(())
    }
}

fn normalize_metadata(
    metadata: Option<serde_json::Value>,
) -> Result<Option<serde_json::Value>, ValidationError> {
    match metadata {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| ValidationError::MalformedMetadata(format!("invalid JSON: {e}"))),
        Some(other) => Ok(Some(other)),
    }
}

/// A validated message that has not been persisted yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMessage {
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    pub body: MessageBody,
    pub timestamp: i64,
}

impl NewMessage {
    pub fn into_message(self, id: MessageId) -> Message {
        Message {
            id,
            session_id: self.session_id,
            role: self.role,
            content: self.content,
            body: self.body,
            timestamp: self.timestamp,
        }
    }
}

/// A persisted message. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "MessageRecord", try_from = "MessageRecord")]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    pub body: MessageBody,
    pub timestamp: i64,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }
}

/// Flat wire shape of [`Message`].
#[derive(Serialize, Deserialize)]
struct MessageRecord {
    id: MessageId,
    session_id: SessionId,
    role: Role,
    content: String,
    #[serde(default)]
    message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
    timestamp: i64,
}

impl From<Message> for MessageRecord {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            session_id: m.session_id,
            role: m.role,
            content: m.content,
            message_type: m.body.message_type(),
            metadata: m.body.metadata(),
            timestamp: m.timestamp,
        }
    }
}

impl TryFrom<MessageRecord> for Message {
    type Error = ValidationError;

    fn try_from(r: MessageRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            session_id: r.session_id,
            role: r.role,
            content: r.content,
            body: MessageBody::from_parts(r.message_type, r.metadata)?,
            timestamp: r.timestamp,
        })
    }
}
