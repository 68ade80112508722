use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ShardingError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("Message has no integer message_type field")]
    MissingMessageType,

    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("Unexpected {received} message, expected {expected}")]
    UnexpectedMessage {
        expected: &'static str,
        received: &'static str,
    },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Connection {0} has not sent INIT yet")]
    NotInitialized(Uuid),

    #[error("Connection {0} already joined a cohort")]
    AlreadyInitialized(Uuid),

    #[error("Schema mismatch: cohort runs {expected}, message names {received}")]
    SchemaMismatch { expected: String, received: String },

    #[error("Step {step} is not in progress for connection {connection_id}")]
    StepNotInProgress { connection_id: Uuid, step: usize },

    #[error("Connection {connection_id} is not a member of cohort {cohort_id}")]
    NotAMember { connection_id: Uuid, cohort_id: Uuid },

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(Uuid),

    #[error("Cohort {0} has no members left and was retired")]
    CohortRetired(Uuid),

    #[error("Connection {connection_id} is bound to destroyed cohort {cohort_id}")]
    CohortDestroyed { connection_id: Uuid, cohort_id: Uuid },

    #[error("Failed to send to connection {0}: channel closed")]
    SendFailed(Uuid),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ShardingError {
    /// True when only the offending message should be rejected; cohort state
    /// is untouched and the connection can keep going.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ShardingError::UnknownMessageType(_)
                | ShardingError::MissingMessageType
                | ShardingError::MalformedMessage(_)
                | ShardingError::UnexpectedMessage { .. }
                | ShardingError::InvalidPlan(_)
                | ShardingError::NotInitialized(_)
                | ShardingError::AlreadyInitialized(_)
                | ShardingError::SchemaMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ShardingError>;
