use std::path::Path;

use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::{Result, ShardingError};

/// One step of a schema. `task` is handed to the task runner verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaStep {
    #[serde(deserialize_with = "scalar_string")]
    pub task: String,
}

impl SchemaStep {
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into() }
    }
}

/// A named plan. The name doubles as the schema id sent in INIT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(deserialize_with = "scalar_string")]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<SchemaStep>,
}

impl Schema {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let schema = Self::from_yaml(&text)?;
        tracing::debug!(path = %path.display(), name = %schema.name, steps = schema.total_steps(), "Loaded schema");
        Ok(schema)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let schema: Schema = serde_yaml::from_str(text)?;
        if schema.steps.is_empty() {
            return Err(ShardingError::Config(format!(
                "schema {} has no steps",
                schema.name
            )));
        }
        Ok(schema)
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, step_id: usize) -> Option<&SchemaStep> {
        self.steps.get(step_id)
    }
}

/// Accept `task: 3` as well as `task: "make test"`.
fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(de::Error::custom(format!("expected a scalar, found {:?}", other))),
    }
}
