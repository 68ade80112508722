//! Read-only JSON views of scheduler state.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
struct StatsResponse {
    /// Members of live cohorts
    registered_consumers: usize,
    running_cohorts: usize,
    /// Open sockets, including those that have not sent INIT
    connections: usize,
}

#[derive(Serialize)]
struct ClientCohortResponse {
    client_id: String,
    cohort_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/cohorts", get(list_cohorts_handler))
        .route("/api/clients/{client_id}/cohort", get(client_cohort_handler))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse {
        registered_consumers: state.scheduler.total_registered_consumers().await,
        running_cohorts: state.scheduler.running_cohorts().await,
        connections: state.scheduler.open_connections(),
    })
}

async fn list_cohorts_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.cohort_snapshots().await)
}

async fn client_cohort_handler(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Response {
    match state.scheduler.cohort_for_client(&client_id).await {
        Some(cohort_id) => Json(ClientCohortResponse {
            client_id,
            cohort_id: cohort_id.to_string(),
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Client {} is not in a cohort", client_id),
            }),
        )
            .into_response(),
    }
}
