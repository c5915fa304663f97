//! Cluster-level orchestrator listings.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use dockyard_core::orchestrator::NodeSummary;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/nodes", get(list_nodes))
}

async fn list_nodes(State(state): State<AppState>) -> Result<Json<Vec<NodeSummary>>, ApiError> {
    Ok(Json(state.orchestrator.list_nodes().await?))
}
