//! Message vocabulary exchanged between workers and the coordinator.
//!
//! Frames are JSON objects tagged with an integer `message_type`:
//!
//! | type | name                | direction            |
//! |------|---------------------|----------------------|
//! | 1    | `INIT`              | worker → coordinator |
//! | 2    | `BUILD_INSTRUCTION` | coordinator → worker |
//! | 3    | `STEP_COMPLETE`     | worker → coordinator |
//! | 4    | `SCHEMA_COMPLETE`   | coordinator → worker |
//! | 5    | `ABORT_STEP`        | coordinator → worker |
//!
//! Step ids travel as decimal strings (`"0"`) but numbers are accepted too.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ShardingError};
use crate::scheduler::repo_state::{CohortKey, RepoState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Init = 1,
    BuildInstruction = 2,
    StepComplete = 3,
    SchemaComplete = 4,
    AbortStep = 5,
}

impl MessageType {
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Init => "INIT",
            MessageType::BuildInstruction => "BUILD_INSTRUCTION",
            MessageType::StepComplete => "STEP_COMPLETE",
            MessageType::SchemaComplete => "SCHEMA_COMPLETE",
            MessageType::AbortStep => "ABORT_STEP",
        }
    }
}

impl TryFrom<u64> for MessageType {
    type Error = ShardingError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Init),
            2 => Ok(MessageType::BuildInstruction),
            3 => Ok(MessageType::StepComplete),
            4 => Ok(MessageType::SchemaComplete),
            5 => Ok(MessageType::AbortStep),
            other => Err(ShardingError::UnknownMessageType(other)),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// First message on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    #[serde(deserialize_with = "wire::string_or_number")]
    pub cache_id: String,
    #[serde(deserialize_with = "wire::string_or_number")]
    pub schema_id: String,
    pub total_steps: usize,
    #[serde(default)]
    pub repo_state: RepoState,
    #[serde(default)]
    pub complex_patchset: bool,
}

impl InitMessage {
    pub fn key(&self) -> CohortKey {
        CohortKey::new(self.cache_id.clone(), self.schema_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCompleteMessage {
    #[serde(deserialize_with = "wire::string_or_number")]
    pub schema_id: String,
    #[serde(with = "wire::step_id")]
    pub step_id: usize,
    pub step_success: bool,
}

/// Worker → coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Init(InitMessage),
    StepComplete(StepCompleteMessage),
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Init(_) => MessageType::Init,
            ClientMessage::StepComplete(_) => MessageType::StepComplete,
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let (kind, value) = split_frame(text)?;
        match kind {
            MessageType::Init => Ok(ClientMessage::Init(serde_json::from_value(value)?)),
            MessageType::StepComplete => {
                Ok(ClientMessage::StepComplete(serde_json::from_value(value)?))
            }
            other => Err(ShardingError::UnexpectedMessage {
                expected: "INIT or STEP_COMPLETE",
                received: other.name(),
            }),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let kind = self.message_type();
        let text = match self {
            ClientMessage::Init(body) => serde_json::to_string(&Frame::new(kind, body))?,
            ClientMessage::StepComplete(body) => serde_json::to_string(&Frame::new(kind, body))?,
        };
        Ok(text)
    }
}

/// Coordinator → worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    BuildInstruction { schema_id: String, step_id: usize },
    SchemaComplete { schema_id: String },
    AbortStep { schema_id: String },
}

#[derive(Serialize, Deserialize)]
struct InstructionBody {
    #[serde(deserialize_with = "wire::string_or_number")]
    schema_id: String,
    #[serde(with = "wire::step_id")]
    step_id: usize,
}

#[derive(Serialize, Deserialize)]
struct SchemaBody {
    #[serde(deserialize_with = "wire::string_or_number")]
    schema_id: String,
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::BuildInstruction { .. } => MessageType::BuildInstruction,
            ServerMessage::SchemaComplete { .. } => MessageType::SchemaComplete,
            ServerMessage::AbortStep { .. } => MessageType::AbortStep,
        }
    }

    pub fn schema_id(&self) -> &str {
        match self {
            ServerMessage::BuildInstruction { schema_id, .. }
            | ServerMessage::SchemaComplete { schema_id }
            | ServerMessage::AbortStep { schema_id } => schema_id,
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let (kind, value) = split_frame(text)?;
        match kind {
            MessageType::BuildInstruction => {
                let body: InstructionBody = serde_json::from_value(value)?;
                Ok(ServerMessage::BuildInstruction {
                    schema_id: body.schema_id,
                    step_id: body.step_id,
                })
            }
            MessageType::SchemaComplete => {
                let body: SchemaBody = serde_json::from_value(value)?;
                Ok(ServerMessage::SchemaComplete {
                    schema_id: body.schema_id,
                })
            }
            MessageType::AbortStep => {
                let body: SchemaBody = serde_json::from_value(value)?;
                Ok(ServerMessage::AbortStep {
                    schema_id: body.schema_id,
                })
            }
            other => Err(ShardingError::UnexpectedMessage {
                expected: "BUILD_INSTRUCTION, SCHEMA_COMPLETE or ABORT_STEP",
                received: other.name(),
            }),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let kind = self.message_type();
        let text = match self {
            ServerMessage::BuildInstruction { schema_id, step_id } => {
                let body = InstructionBody {
                    schema_id: schema_id.clone(),
                    step_id: *step_id,
                };
                serde_json::to_string(&Frame::new(kind, &body))?
            }
            ServerMessage::SchemaComplete { schema_id } | ServerMessage::AbortStep { schema_id } => {
                let body = SchemaBody {
                    schema_id: schema_id.clone(),
                };
                serde_json::to_string(&Frame::new(kind, &body))?
            }
        };
        Ok(text)
    }
}

#[derive(Serialize)]
struct Frame<'a, T: Serialize> {
    message_type: u8,
    #[serde(flatten)]
    body: &'a T,
}

impl<'a, T: Serialize> Frame<'a, T> {
    fn new(kind: MessageType, body: &'a T) -> Self {
        Self {
            message_type: kind as u8,
            body,
        }
    }
}

/// Parse a frame and read its tag. Tags sent as numeric strings are tolerated.
fn split_frame(text: &str) -> Result<(MessageType, Value)> {
    let value: Value = serde_json::from_str(text)?;
    let raw = value
        .get("message_type")
        .and_then(|tag| {
            tag.as_u64()
                .or_else(|| tag.as_str().and_then(|s| s.parse().ok()))
        })
        .ok_or(ShardingError::MissingMessageType)?;
    Ok((MessageType::try_from(raw)?, value))
}

mod wire {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s,
            Raw::Number(n) => n.to_string(),
        })
    }

    pub mod step_id {
        use super::*;

        pub fn serialize<S>(step: &usize, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(step)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<usize, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Raw::deserialize(deserializer)? {
                Raw::Text(s) => s
                    .trim()
                    .parse()
                    .map_err(|_| de::Error::custom(format!("step_id {:?} is not an index", s))),
                Raw::Number(n) => usize::try_from(n).map_err(de::Error::custom),
            }
        }
    }
}
