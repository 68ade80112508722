//! One cohort (schema instance): a shared work queue for workers running the
//! same schema against compatible source trees.
//!
//! Step lifecycle: `unclaimed → in progress → completed`, with failures and
//! abandonment sending the step back to `unclaimed`. The cohort goes `Open →
//! Finished` once every step has completed, or `Open → Failed` when a retry
//! cap is configured and a step exhausts it.
//!
//! Every operation mutates state under the cohort's own lock, collects the
//! outbound messages, releases the lock and only then sends.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{Result, ShardingError};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::scheduler::registry::ConsumerRegistry;
use crate::scheduler::repo_state::{CohortKey, ConnectionId, RepoState, SchemaDetails};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CohortStatus {
    Open,
    Finished,
    Failed,
}

impl std::fmt::Display for CohortStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CohortStatus::Open => write!(f, "open"),
            CohortStatus::Finished => write!(f, "finished"),
            CohortStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How well a prospective worker fits a cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Incompatible,
    Score(i64),
}

impl Affinity {
    pub fn score(&self) -> Option<i64> {
        match self {
            Affinity::Score(score) => Some(*score),
            Affinity::Incompatible => None,
        }
    }

    /// Non-negative scores are good enough to join instead of starting fresh.
    pub fn is_usable(&self) -> bool {
        matches!(self, Affinity::Score(score) if *score >= 0)
    }
}

/// Score `candidate` against the repo states of a cohort's current members.
///
/// Each repository starts at -1 and earns a point for the candidate's own
/// patchset and for every patchset it shares with the union of the members'
/// patchsets (own + additional). A repository missing from any member, or on
/// a different base branch, makes the pair incompatible. A candidate with no
/// repositories at all scores -1.
pub fn score_repo_states(members: &HashMap<ConnectionId, RepoState>, candidate: &RepoState) -> Affinity {
    if candidate.is_empty() {
        return Affinity::Score(-1);
    }

    let mut total: i64 = 0;

    for (repo_name, candidate_repo) in candidate {
        let mut known: HashSet<&str> = HashSet::new();
        for member_state in members.values() {
            let Some(member_repo) = member_state.get(repo_name) else {
                return Affinity::Incompatible;
            };
            if member_repo.base_ref != candidate_repo.base_ref {
                return Affinity::Incompatible;
            }
            known.extend(member_repo.all_patchsets());
        }

        let mut shared: i64 = -1;
        shared += known
            .iter()
            .filter(|patchset| {
                candidate_repo
                    .additional_patchsets
                    .iter()
                    .any(|additional| additional == *patchset)
            })
            .count() as i64;
        if known.contains(candidate_repo.patchset.as_str()) {
            shared += 1;
        }
        total += shared;
    }

    Affinity::Score(total)
}

#[derive(Debug)]
struct CohortState {
    /// Popped from the back: the highest remaining index goes out first.
    unclaimed: Vec<usize>,
    in_progress: HashMap<ConnectionId, usize>,
    members: HashSet<ConnectionId>,
    repo_states: HashMap<ConnectionId, RepoState>,
    failures: HashMap<usize, u32>,
    completed: usize,
    status: CohortStatus,
    /// Set once membership drains to zero; the scheduler drops the cohort.
    retired: bool,
}

/// Read-only view used by diagnostics and tests.
#[derive(Debug, Clone, Serialize)]
pub struct CohortSnapshot {
    pub id: Uuid,
    pub cache_id: String,
    pub schema_id: String,
    pub total_steps: usize,
    pub status: CohortStatus,
    pub unclaimed: Vec<usize>,
    pub in_progress: BTreeMap<ConnectionId, usize>,
    pub members: usize,
    pub completed: usize,
    pub created_at: DateTime<Utc>,
}

type Outbound = Vec<(ConnectionId, ServerMessage)>;

pub struct CohortInstance {
    details: SchemaDetails,
    registry: Arc<ConsumerRegistry>,
    retry: RetryPolicy,
    state: Mutex<CohortState>,
}

impl std::fmt::Debug for CohortInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CohortInstance")
            .field("details", &self.details)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl CohortInstance {
    pub fn new(details: SchemaDetails, registry: Arc<ConsumerRegistry>, retry: RetryPolicy) -> Self {
        let unclaimed = (0..details.total_steps).collect();
        Self {
            details,
            registry,
            retry,
            state: Mutex::new(CohortState {
                unclaimed,
                in_progress: HashMap::new(),
                members: HashSet::new(),
                repo_states: HashMap::new(),
                failures: HashMap::new(),
                completed: 0,
                status: CohortStatus::Open,
                retired: false,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.details.id
    }

    pub fn details(&self) -> &SchemaDetails {
        &self.details
    }

    pub fn key(&self) -> &CohortKey {
        &self.details.key
    }

    /// Register a member and hand it the next unclaimed step, if any.
    pub async fn join(&self, connection_id: ConnectionId, repo_state: RepoState) -> Result<()> {
        let outbound = {
            let mut state = self.state.lock().await;
            if state.retired {
                return Err(ShardingError::CohortRetired(self.id()));
            }

            state.members.insert(connection_id);
            state.repo_states.insert(connection_id, repo_state);
            tracing::info!(
                cohort_id = %self.id(),
                connection_id = %connection_id,
                members = state.members.len(),
                "Consumer registered"
            );

            let status = state.status;
            match status {
                CohortStatus::Open => self
                    .assign_next(&mut state, connection_id)
                    .into_iter()
                    .collect(),
                // Joined in the window between completion and the last
                // member leaving; tell it right away instead of idling.
                CohortStatus::Finished => vec![(connection_id, self.schema_complete())],
                CohortStatus::Failed => vec![(connection_id, self.abort_step())],
            }
        };

        self.deliver(outbound).await
    }

    /// Record the outcome of `step` reported by `connection_id`.
    pub async fn report_completion(
        &self,
        connection_id: ConnectionId,
        step: usize,
        success: bool,
    ) -> Result<()> {
        let outbound = {
            let mut state = self.state.lock().await;
            if !state.members.contains(&connection_id) {
                return Err(ShardingError::NotAMember {
                    connection_id,
                    cohort_id: self.id(),
                });
            }
            if state.in_progress.get(&connection_id) != Some(&step) {
                return Err(ShardingError::StepNotInProgress {
                    connection_id,
                    step,
                });
            }
            state.in_progress.remove(&connection_id);

            let mut outbound = Outbound::new();
            if success {
                state.completed += 1;
                tracing::info!(
                    cohort_id = %self.id(),
                    connection_id = %connection_id,
                    step,
                    "Step completed"
                );
            } else {
                self.record_failure(&mut state, step, &mut outbound);
            }

            if state.status == CohortStatus::Open {
                if !state.unclaimed.is_empty() || !state.in_progress.is_empty() {
                    tracing::debug!(
                        cohort_id = %self.id(),
                        unclaimed = state.unclaimed.len(),
                        in_progress = state.in_progress.len(),
                        "Steps remaining"
                    );
                    outbound.extend(self.assign_next(&mut state, connection_id));
                } else {
                    state.status = CohortStatus::Finished;
                    tracing::info!(
                        cohort_id = %self.id(),
                        members = state.members.len(),
                        "Schema completed"
                    );
                    let complete = self.schema_complete();
                    outbound.extend(state.members.iter().map(|m| (*m, complete.clone())));
                }
            }
            outbound
        };

        self.deliver(outbound).await
    }

    /// Drop a member. A step it was holding returns to the pool but is not
    /// reassigned here. Returns the number of members left.
    pub async fn deregister(&self, connection_id: ConnectionId) -> usize {
        let mut state = self.state.lock().await;
        state.members.remove(&connection_id);
        state.repo_states.remove(&connection_id);

        if let Some(step) = state.in_progress.remove(&connection_id) {
            if state.status == CohortStatus::Open {
                state.unclaimed.push(step);
                tracing::warn!(
                    cohort_id = %self.id(),
                    connection_id = %connection_id,
                    step,
                    "Step abandoned, returned to pool"
                );
            }
        }

        let remaining = state.members.len();
        if remaining == 0 && !state.retired {
            state.retired = true;
            tracing::info!(cohort_id = %self.id(), status = %state.status, "Cohort drained");
        }
        remaining
    }

    /// Affinity of a prospective worker with this cohort's current members.
    pub async fn affinity_score(
        &self,
        key: &CohortKey,
        repo_state: &RepoState,
        complex_patchset: bool,
    ) -> Affinity {
        if complex_patchset || key != self.key() {
            return Affinity::Incompatible;
        }
        let state = self.state.lock().await;
        score_repo_states(&state.repo_states, repo_state)
    }

    /// Route a message from an already-bound member.
    pub async fn dispatch(&self, connection_id: ConnectionId, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Init(_) => Err(ShardingError::AlreadyInitialized(connection_id)),
            ClientMessage::StepComplete(step) => {
                if step.schema_id != self.details.schema_id() {
                    return Err(ShardingError::SchemaMismatch {
                        expected: self.details.schema_id().to_string(),
                        received: step.schema_id,
                    });
                }
                self.report_completion(connection_id, step.step_id, step.step_success)
                    .await
            }
        }
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn status(&self) -> CohortStatus {
        self.state.lock().await.status
    }

    pub async fn is_retired(&self) -> bool {
        self.state.lock().await.retired
    }

    /// Open and not yet drained: a candidate for new workers.
    pub async fn is_accepting(&self) -> bool {
        let state = self.state.lock().await;
        state.status == CohortStatus::Open && !state.retired
    }

    pub async fn snapshot(&self) -> CohortSnapshot {
        let state = self.state.lock().await;
        CohortSnapshot {
            id: self.id(),
            cache_id: self.details.key.cache_id.clone(),
            schema_id: self.details.key.schema_id.clone(),
            total_steps: self.details.total_steps,
            status: state.status,
            unclaimed: state.unclaimed.clone(),
            in_progress: state.in_progress.iter().map(|(c, s)| (*c, *s)).collect(),
            members: state.members.len(),
            completed: state.completed,
            created_at: self.details.created_at,
        }
    }

    fn assign_next(
        &self,
        state: &mut CohortState,
        connection_id: ConnectionId,
    ) -> Option<(ConnectionId, ServerMessage)> {
        if state.in_progress.contains_key(&connection_id) {
            return None;
        }
        let step = state.unclaimed.pop()?;
        state.in_progress.insert(connection_id, step);
        tracing::info!(
            cohort_id = %self.id(),
            connection_id = %connection_id,
            step,
            "Assigning step"
        );
        Some((
            connection_id,
            ServerMessage::BuildInstruction {
                schema_id: self.details.schema_id().to_string(),
                step_id: step,
            },
        ))
    }

    fn record_failure(&self, state: &mut CohortState, step: usize, outbound: &mut Outbound) {
        let failures = {
            let count = state.failures.entry(step).or_insert(0);
            *count += 1;
            *count
        };

        if self.retry.allows_retry(failures) {
            tracing::warn!(cohort_id = %self.id(), step, failures, "Step failed, returned to pool");
            if state.status == CohortStatus::Open {
                state.unclaimed.push(step);
            }
            return;
        }

        tracing::error!(cohort_id = %self.id(), step, failures, "Step exhausted its retries");
        if state.status == CohortStatus::Open {
            state.status = CohortStatus::Failed;
            state.unclaimed.clear();
            let abort = self.abort_step();
            outbound.extend(state.members.iter().map(|m| (*m, abort.clone())));
        }
    }

    fn schema_complete(&self) -> ServerMessage {
        ServerMessage::SchemaComplete {
            schema_id: self.details.schema_id().to_string(),
        }
    }

    fn abort_step(&self) -> ServerMessage {
        ServerMessage::AbortStep {
            schema_id: self.details.schema_id().to_string(),
        }
    }

    /// Send after the lock is gone. State is already committed, so a failed
    /// send is reported but never rolled back.
    async fn deliver(&self, outbound: Outbound) -> Result<()> {
        let mut first_error = None;
        for (connection_id, message) in outbound {
            if let Err(e) = self.registry.send(&connection_id, message).await {
                tracing::error!(
                    cohort_id = %self.id(),
                    connection_id = %connection_id,
                    error = %e,
                    "Failed to deliver message"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
