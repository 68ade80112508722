use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use task_sharding::config::{RetryPolicy, ServerConfig, WorkerConfig};
use task_sharding::server::run_server;
use task_sharding::shutdown::install_shutdown_handler;
use task_sharding::worker::{run_worker, WorkerOutcome};

#[derive(Parser, Debug)]
#[command(name = "task-sharding")]
#[command(version)]
#[command(about = "Shard a schema's steps across cohorts of cooperating workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the coordinator
    Server(ServerArgs),

    /// Join a cohort and run steps until the schema completes
    Worker(WorkerArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port for worker connections and diagnostics
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Abort a cohort once one of its steps has failed this many times.
    /// Unlimited when omitted.
    #[arg(long)]
    max_step_attempts: Option<u32>,

    /// Outbound messages buffered per worker
    #[arg(long, default_value = "32")]
    outbound_capacity: usize,

    /// Largest number of steps a worker may declare for one plan
    #[arg(long, default_value = "10000")]
    max_total_steps: usize,

    /// Seconds a send may wait on a worker whose buffer is full
    #[arg(long, default_value = "5")]
    send_timeout_secs: u64,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Unique client identifier
    #[arg(long)]
    client_id: String,

    /// Path to the schema file
    #[arg(long)]
    schema: PathBuf,

    /// Coordinator URL
    #[arg(long, default_value = "ws://127.0.0.1:8000")]
    server: String,

    /// Cache identifier; only workers with the same one share a cohort
    #[arg(long, default_value = "1")]
    cache_id: String,

    /// Directory steps run in (defaults to the current directory)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Repo state file; detected from the workspace's git checkout when omitted
    #[arg(long)]
    repo_state: Option<PathBuf>,

    /// Never share a cohort with other workers
    #[arg(long)]
    complex_patchset: bool,

    /// Output format for the session summary
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Serialize)]
struct WorkerSummary {
    client_id: String,
    outcome: String,
    failed_step: Option<usize>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn handle_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let retry = match args.max_step_attempts {
        Some(0) => return Err("--max-step-attempts must be at least 1".into()),
        Some(max) => RetryPolicy::limited(max),
        None => RetryPolicy::unlimited(),
    };
    if args.max_total_steps == 0 {
        return Err("--max-total-steps must be at least 1".into());
    }
    let mut config = ServerConfig::new(SocketAddr::new(args.host, args.port))
        .with_retry(retry)
        .with_max_total_steps(args.max_total_steps);
    config.outbound_capacity = args.outbound_capacity;
    config.send_timeout = Duration::from_secs(args.send_timeout_secs);

    tracing::info!(
        listen_addr = %config.listen_addr,
        max_step_attempts = ?config.retry.max_attempts,
        max_total_steps = config.max_total_steps,
        "Starting coordinator"
    );

    let shutdown = install_shutdown_handler();
    run_server(config, shutdown).await?;
    Ok(())
}

async fn handle_worker(args: WorkerArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let mut config = WorkerConfig::new(args.client_id, args.schema)
        .with_server_url(args.server)
        .with_cache_id(args.cache_id);
    config.workspace_path = args.workspace;
    config.repo_state_path = args.repo_state;
    config.complex_patchset = args.complex_patchset;
    let client_id = config.client_id.clone();

    let shutdown = install_shutdown_handler();
    let outcome = run_worker(config, shutdown).await?;

    let summary = WorkerSummary {
        client_id,
        outcome: match outcome {
            WorkerOutcome::SchemaComplete => "schema_complete",
            WorkerOutcome::Aborted => "aborted",
            WorkerOutcome::StepFailed(_) => "step_failed",
            WorkerOutcome::Interrupted => "interrupted",
        }
        .to_string(),
        failed_step: match outcome {
            WorkerOutcome::StepFailed(step) => Some(step),
            _ => None,
        },
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Table => {
            println!("Client:  {}", summary.client_id);
            println!("Outcome: {}", summary.outcome);
            if let Some(step) = summary.failed_step {
                println!("Failed step: {}", step);
            }
        }
    }

    Ok(outcome.is_success())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let result = match args.command {
        Commands::Server(server_args) => handle_server(server_args).await.map(|_| true),
        Commands::Worker(worker_args) => handle_worker(worker_args).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "Exiting with error");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
