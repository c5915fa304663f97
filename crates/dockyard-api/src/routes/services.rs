//! Runtime view of a deployed service.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use dockyard_core::ResourceId;
use dockyard_core::orchestrator::TaskSummary;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::sse::log_events;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/logs", get(runtime_logs))
        .route("/{id}/tasks", get(list_tasks))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<u64>,
}

async fn runtime_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let cancel = CancellationToken::new();
    let lines = state
        .logs
        .stream_runtime_logs(ResourceId::from_uuid(id), query.tail, cancel.clone())
        .await?;
    Ok(log_events(lines, cancel))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    let service = state.store.get_service(ResourceId::from_uuid(id)).await?;
    let project = state.store.get_project(service.project_id).await?;
    let name = state
        .config
        .orchestrator
        .service_name(&project.name, &service.name);
    Ok(Json(state.orchestrator.list_tasks(&name).await?))
}
