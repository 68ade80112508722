//! Worker side of the protocol.
//!
//! A worker loads a [`Schema`], describes its source tree, joins a cohort and
//! runs whichever steps the coordinator hands it through a [`TaskRunner`].

pub mod client;
pub mod runner;
pub mod schema;
pub mod source_tree;

pub use client::{WorkerClient, WorkerOutcome};
pub use runner::{ShellTaskRunner, TaskRunner};
pub use schema::{Schema, SchemaStep};

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;

/// Run one worker session with the shell runner.
pub async fn run_worker(config: WorkerConfig, shutdown: CancellationToken) -> Result<WorkerOutcome> {
    let schema = Schema::load(&config.schema_path)?;
    let workspace = match &config.workspace_path {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    let repo_state =
        source_tree::resolve_repo_state(config.repo_state_path.as_deref(), &workspace).await?;

    tracing::info!(
        client_id = %config.client_id,
        cache_id = %config.cache_id,
        schema = %schema.name,
        total_steps = schema.total_steps(),
        repositories = repo_state.len(),
        "Starting worker"
    );

    let runner = ShellTaskRunner::new(workspace);
    WorkerClient::new(config, schema, repo_state, runner)
        .run(shutdown)
        .await
}
