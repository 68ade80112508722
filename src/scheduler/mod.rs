pub mod cohort;
pub mod controller;
pub mod registry;
pub mod repo_state;

pub use cohort::{Affinity, CohortInstance, CohortSnapshot, CohortStatus};
pub use controller::Scheduler;
pub use registry::{ConsumerHandle, ConsumerRegistry};
pub use repo_state::{CohortKey, ConnectionId, RepoSnapshot, RepoState, SchemaDetails};
