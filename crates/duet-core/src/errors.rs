/// Reasons an inbound event or message body is rejected before it reaches
/// the persistence log.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("session id must not be empty")]
    EmptySessionId,
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("{message_type} messages must not carry metadata")]
    UnexpectedMetadata { message_type: &'static str },
    #[error("{message_type} messages require metadata")]
    MissingMetadata { message_type: &'static str },
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),
    #[error("multiple choice needs at least {min} options, got {actual}")]
    TooFewOptions { min: usize, actual: usize },
    #[error("field `{0}` must not be blank")]
    BlankField(&'static str),
    #[error("questionId must reference a persisted message, got {0}")]
    InvalidQuestionId(i64),
}
