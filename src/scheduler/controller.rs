use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{RetryPolicy, DEFAULT_MAX_TOTAL_STEPS};
use crate::error::{Result, ShardingError};
use crate::protocol::{ClientMessage, InitMessage};
use crate::scheduler::cohort::{Affinity, CohortInstance, CohortSnapshot};
use crate::scheduler::registry::{ConsumerHandle, ConsumerRegistry};
use crate::scheduler::repo_state::{ConnectionId, SchemaDetails};

#[derive(Default)]
struct SchedulerState {
    /// Live cohorts in creation order. Ties in affinity go to the earliest.
    cohorts: Vec<Arc<CohortInstance>>,
    bindings: HashMap<ConnectionId, Arc<CohortInstance>>,
    clients: HashMap<String, ConnectionId>,
    connection_clients: HashMap<ConnectionId, String>,
}

/// Entry point for every connection event: routes messages to cohorts,
/// creates cohorts on demand and destroys them once they drain.
///
/// The scheduler lock and a cohort lock are never held together.
pub struct Scheduler {
    registry: Arc<ConsumerRegistry>,
    retry: RetryPolicy,
    max_total_steps: usize,
    state: Mutex<SchedulerState>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Scheduler {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            registry: Arc::new(ConsumerRegistry::new()),
            retry,
            max_total_steps: DEFAULT_MAX_TOTAL_STEPS,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Reject INIT messages declaring more than `max_total_steps` steps.
    pub fn with_max_total_steps(mut self, max_total_steps: usize) -> Self {
        self.max_total_steps = max_total_steps;
        self
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Make a connection reachable before its first message arrives.
    pub async fn register_connection(
        &self,
        connection_id: ConnectionId,
        client_id: impl Into<String>,
        handle: ConsumerHandle,
    ) {
        let client_id = client_id.into();
        self.registry.add(connection_id, handle);

        let mut state = self.state.lock().await;
        if let Some(previous) = state.clients.insert(client_id.clone(), connection_id) {
            if previous != connection_id {
                tracing::warn!(
                    client_id = %client_id,
                    previous = %previous,
                    connection_id = %connection_id,
                    "Client id reconnected on a new connection"
                );
            }
        }
        state.connection_clients.insert(connection_id, client_id);
    }

    /// Handle one inbound message. The first message of a connection must be
    /// INIT; everything after goes to the cohort it was bound to.
    pub async fn handle_message(
        &self,
        connection_id: ConnectionId,
        message: ClientMessage,
    ) -> Result<()> {
        let bound = self.state.lock().await.bindings.get(&connection_id).cloned();

        match bound {
            Some(cohort) => {
                if cohort.is_retired().await {
                    return Err(ShardingError::CohortDestroyed {
                        connection_id,
                        cohort_id: cohort.id(),
                    });
                }
                cohort.dispatch(connection_id, message).await
            }
            None => match message {
                ClientMessage::Init(init) => self.join(connection_id, init).await,
                ClientMessage::StepComplete(_) => Err(ShardingError::NotInitialized(connection_id)),
            },
        }
    }

    async fn join(&self, connection_id: ConnectionId, init: InitMessage) -> Result<()> {
        if init.total_steps == 0 {
            return Err(ShardingError::InvalidPlan(
                "total_steps must be at least 1".to_string(),
            ));
        }
        if init.total_steps > self.max_total_steps {
            return Err(ShardingError::InvalidPlan(format!(
                "total_steps {} exceeds the limit of {}",
                init.total_steps, self.max_total_steps
            )));
        }

        loop {
            let cohort = self.find_or_create_cohort(&init).await;
            self.state
                .lock()
                .await
                .bindings
                .insert(connection_id, cohort.clone());

            match cohort.join(connection_id, init.repo_state.clone()).await {
                Err(ShardingError::CohortRetired(cohort_id)) => {
                    // Drained between matching and joining; match again.
                    tracing::debug!(
                        connection_id = %connection_id,
                        cohort_id = %cohort_id,
                        "Matched cohort retired, retrying"
                    );
                    self.state.lock().await.bindings.remove(&connection_id);
                }
                result => return result,
            }
        }
    }

    /// Pick the best-scoring open cohort for `init`, or create a new one.
    ///
    /// Scoring runs on a snapshot of the cohort list, so two workers arriving
    /// at once for a brand-new key may each start their own cohort.
    pub async fn find_or_create_cohort(&self, init: &InitMessage) -> Arc<CohortInstance> {
        let key = init.key();
        let candidates: Vec<Arc<CohortInstance>> = {
            let state = self.state.lock().await;
            state
                .cohorts
                .iter()
                .filter(|cohort| cohort.key() == &key)
                .cloned()
                .collect()
        };

        let mut best: Option<(i64, Arc<CohortInstance>)> = None;
        for cohort in candidates {
            if !cohort.is_accepting().await {
                continue;
            }
            let affinity = cohort
                .affinity_score(&key, &init.repo_state, init.complex_patchset)
                .await;
            tracing::debug!(cohort_id = %cohort.id(), ?affinity, "Scored cohort");

            if let Affinity::Score(score) = affinity {
                let better = score >= 0 && best.as_ref().is_none_or(|(top, _)| score > *top);
                if better {
                    best = Some((score, cohort));
                }
            }
        }

        if let Some((score, cohort)) = best {
            tracing::info!(cohort_id = %cohort.id(), score, key = %key, "Matched existing cohort");
            return cohort;
        }

        let details = SchemaDetails::new(key, init.total_steps);
        let cohort = Arc::new(CohortInstance::new(details, self.registry.clone(), self.retry));
        tracing::info!(
            cohort_id = %cohort.id(),
            key = %cohort.key(),
            total_steps = init.total_steps,
            "Created cohort"
        );
        self.state.lock().await.cohorts.push(cohort.clone());
        cohort
    }

    /// Forget a connection. Destroys its cohort if it was the last member.
    /// Safe to call for connections that never joined.
    pub async fn handle_disconnect(&self, connection_id: ConnectionId) {
        let cohort = {
            let mut state = self.state.lock().await;
            if let Some(client_id) = state.connection_clients.remove(&connection_id) {
                if state.clients.get(&client_id) == Some(&connection_id) {
                    state.clients.remove(&client_id);
                }
            }
            state.bindings.remove(&connection_id)
        };
        self.registry.remove(&connection_id);

        let Some(cohort) = cohort else {
            tracing::debug!(connection_id = %connection_id, "Unbound connection closed");
            return;
        };

        let remaining = cohort.deregister(connection_id).await;
        tracing::info!(
            connection_id = %connection_id,
            cohort_id = %cohort.id(),
            remaining,
            "Consumer deregistered"
        );
        if remaining > 0 {
            return;
        }

        let mut state = self.state.lock().await;
        let before = state.cohorts.len();
        state.cohorts.retain(|live| !Arc::ptr_eq(live, &cohort));
        if state.cohorts.len() < before {
            tracing::info!(cohort_id = %cohort.id(), "Cohort destroyed");
        }
    }

    /// Members summed over every live cohort.
    pub async fn total_registered_consumers(&self) -> usize {
        let cohorts = self.state.lock().await.cohorts.clone();
        let mut total = 0;
        for cohort in cohorts {
            total += cohort.member_count().await;
        }
        total
    }

    /// Connections with a live handle, whether or not they have sent INIT.
    pub fn open_connections(&self) -> usize {
        self.registry.count()
    }

    pub async fn running_cohorts(&self) -> usize {
        self.state.lock().await.cohorts.len()
    }

    pub async fn cohort_for_client(&self, client_id: &str) -> Option<Uuid> {
        let state = self.state.lock().await;
        let connection_id = state.clients.get(client_id)?;
        state.bindings.get(connection_id).map(|cohort| cohort.id())
    }

    pub async fn cohort_snapshots(&self) -> Vec<CohortSnapshot> {
        let cohorts = self.state.lock().await.cohorts.clone();
        let mut snapshots = Vec::with_capacity(cohorts.len());
        for cohort in cohorts {
            snapshots.push(cohort.snapshot().await);
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerMessage, StepCompleteMessage};
    use crate::scheduler::repo_state::RepoState;

    fn init(total_steps: usize) -> InitMessage {
        InitMessage {
            cache_id: "1".into(),
            schema_id: "1".into(),
            total_steps,
            repo_state: RepoState::new(),
            complex_patchset: false,
        }
    }

    #[tokio::test]
    async fn step_complete_before_init_is_rejected() {
        let scheduler = Scheduler::default();
        let id = Uuid::new_v4();
        let (handle, _rx) = ConsumerHandle::channel(id, 4);
        scheduler.register_connection(id, "a", handle).await;

        let msg = ClientMessage::StepComplete(StepCompleteMessage {
            schema_id: "1".into(),
            step_id: 0,
            step_success: true,
        });
        let err = scheduler.handle_message(id, msg).await.unwrap_err();
        assert!(matches!(err, ShardingError::NotInitialized(c) if c == id));
        assert_eq!(scheduler.running_cohorts().await, 0);
    }

    #[tokio::test]
    async fn empty_plan_is_rejected() {
        let scheduler = Scheduler::default();
        let id = Uuid::new_v4();
        let (handle, _rx) = ConsumerHandle::channel(id, 4);
        scheduler.register_connection(id, "a", handle).await;

        let err = scheduler
            .handle_message(id, ClientMessage::Init(init(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::InvalidPlan(_)));
        assert_eq!(scheduler.running_cohorts().await, 0);
        assert_eq!(scheduler.total_registered_consumers().await, 0);
    }

    #[tokio::test]
    async fn plan_over_the_limit_is_rejected() {
        let scheduler = Scheduler::default().with_max_total_steps(4);
        let id = Uuid::new_v4();
        let (handle, mut rx) = ConsumerHandle::channel(id, 4);
        scheduler.register_connection(id, "a", handle).await;

        let err = scheduler
            .handle_message(id, ClientMessage::Init(init(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::InvalidPlan(_)));
        assert!(err.is_protocol_error());
        assert_eq!(scheduler.running_cohorts().await, 0);
        assert!(rx.try_recv().is_err());

        // Exactly at the limit is fine
        scheduler
            .handle_message(id, ClientMessage::Init(init(4)))
            .await
            .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::BuildInstruction { step_id: 3, .. }
        ));
    }

    #[tokio::test]
    async fn second_init_is_rejected() {
        let scheduler = Scheduler::default();
        let id = Uuid::new_v4();
        let (handle, mut rx) = ConsumerHandle::channel(id, 4);
        scheduler.register_connection(id, "a", handle).await;

        scheduler
            .handle_message(id, ClientMessage::Init(init(2)))
            .await
            .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::BuildInstruction { step_id: 1, .. }
        ));

        let err = scheduler
            .handle_message(id, ClientMessage::Init(init(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::AlreadyInitialized(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn client_lookup_follows_connection() {
        let scheduler = Scheduler::default();
        let id = Uuid::new_v4();
        let (handle, _rx) = ConsumerHandle::channel(id, 4);
        scheduler.register_connection(id, "worker-1", handle).await;
        assert_eq!(scheduler.cohort_for_client("worker-1").await, None);

        scheduler
            .handle_message(id, ClientMessage::Init(init(1)))
            .await
            .unwrap();
        let cohort_id = scheduler.cohort_for_client("worker-1").await.unwrap();
        assert_eq!(scheduler.cohort_snapshots().await[0].id, cohort_id);

        scheduler.handle_disconnect(id).await;
        assert_eq!(scheduler.cohort_for_client("worker-1").await, None);
        assert_eq!(scheduler.running_cohorts().await, 0);
        assert_eq!(scheduler.total_registered_consumers().await, 0);
        assert_eq!(scheduler.open_connections(), 0);
    }
}
