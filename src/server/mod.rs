//! HTTP/WebSocket surface of the coordinator.

pub mod connection;
pub mod diagnostics;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Per-connection outbound buffer
    pub outbound_capacity: usize,
    /// How long a send may wait on a full outbound buffer
    pub send_timeout: Duration,
    /// Cancelled on shutdown; open sockets close when it fires.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            outbound_capacity: ServerConfig::default().outbound_capacity,
            send_timeout: ServerConfig::default().send_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/api/{api_version}/{client_id}", get(connection::ws_handler))
        .route("/ws/api/{api_version}/{client_id}/", get(connection::ws_handler))
        .merge(diagnostics::routes())
        .layer(cors)
        .with_state(state)
}

/// Serve on an already-bound listener until `state.shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr()?;
    let shutdown = state.shutdown.clone();
    tracing::info!(addr = %addr, "Coordinator listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Coordinator stopped");
    Ok(())
}

/// Bind `config.listen_addr` and run a fresh scheduler on it.
pub async fn run_server(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    let scheduler =
        Arc::new(Scheduler::new(config.retry).with_max_total_steps(config.max_total_steps));
    if let Some(max) = config.retry.max_attempts {
        tracing::info!(max_attempts = max, "Step retries capped");
    }

    let state = AppState::new(scheduler)
        .with_outbound_capacity(config.outbound_capacity)
        .with_send_timeout(config.send_timeout)
        .with_shutdown(shutdown);
    serve(listener, state).await
}
