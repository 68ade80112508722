use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport-assigned identifier of one worker connection.
pub type ConnectionId = Uuid;

/// Source tree of one repository as declared by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub base_ref: String,
    pub patchset: String,
    /// Other patchsets this tree already contains. Only used for affinity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_patchsets: Vec<String>,
}

impl RepoSnapshot {
    pub fn new(base_ref: impl Into<String>, patchset: impl Into<String>) -> Self {
        Self {
            base_ref: base_ref.into(),
            patchset: patchset.into(),
            additional_patchsets: Vec::new(),
        }
    }

    pub fn with_additional(mut self, patchset: impl Into<String>) -> Self {
        self.additional_patchsets.push(patchset.into());
        self
    }

    /// Own patchset followed by the additional ones.
    pub fn all_patchsets(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.patchset.as_str())
            .chain(self.additional_patchsets.iter().map(String::as_str))
    }
}

/// Repository name → snapshot. Ordered so scoring walks repositories deterministically.
pub type RepoState = BTreeMap<String, RepoSnapshot>;

/// What a worker wants to run. Cohorts are only shared on an exact match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CohortKey {
    pub cache_id: String,
    pub schema_id: String,
}

impl CohortKey {
    pub fn new(cache_id: impl Into<String>, schema_id: impl Into<String>) -> Self {
        Self {
            cache_id: cache_id.into(),
            schema_id: schema_id.into(),
        }
    }
}

impl std::fmt::Display for CohortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.cache_id, self.schema_id)
    }
}

/// Identity of one cohort, fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDetails {
    pub id: Uuid,
    pub key: CohortKey,
    pub total_steps: usize,
    pub created_at: DateTime<Utc>,
}

impl SchemaDetails {
    pub fn new(key: CohortKey, total_steps: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            total_steps,
            created_at: Utc::now(),
        }
    }

    pub fn schema_id(&self) -> &str {
        &self.key.schema_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_deserializes_without_additional_patchsets() {
        let snap: RepoSnapshot =
            serde_json::from_str(r#"{"base_ref":"main","patchset":"abc"}"#).unwrap();
        assert_eq!(snap, RepoSnapshot::new("main", "abc"));
        assert!(snap.additional_patchsets.is_empty());
    }

    #[test]
    fn all_patchsets_lists_own_first() {
        let snap = RepoSnapshot::new("main", "p1")
            .with_additional("p0")
            .with_additional("p-1");
        let all: Vec<&str> = snap.all_patchsets().collect();
        assert_eq!(all, vec!["p1", "p0", "p-1"]);
    }

    #[test]
    fn schema_details_get_unique_ids() {
        let key = CohortKey::new("1", "build");
        let a = SchemaDetails::new(key.clone(), 3);
        let b = SchemaDetails::new(key, 3);
        assert_ne!(a.id, b.id);
        assert_eq!(a.schema_id(), "build");
        assert_eq!(a.key.to_string(), "1/build");
    }
}
