//! Deployment records and build logs.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use dockyard_core::ResourceId;
use dockyard_core::deployment::{Deployment, ProjectDeployment};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::sse::log_events;

pub fn router() -> Router<AppState> {
    Router::new().route("/{id}/logs", get(build_logs))
}

pub fn project_router() -> Router<AppState> {
    Router::new().route("/{id}", get(get_project_deployment))
}

/// Live while the build runs, archived afterwards.
async fn build_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cancel = CancellationToken::new();
    let lines = state
        .logs
        .stream_build_logs(ResourceId::from_uuid(id), cancel.clone())
        .await?;
    Ok(log_events(lines, cancel))
}

#[derive(Debug, Serialize)]
struct ProjectDeploymentResponse {
    #[serde(flatten)]
    project_deployment: ProjectDeployment,
    deployments: Vec<Deployment>,
}

async fn get_project_deployment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProjectDeploymentResponse>, ApiError> {
    let id = ResourceId::from_uuid(id);
    let project_deployment = state.store.get_project_deployment(id).await?;
    let deployments = state.store.list_deployments(id).await?;
    Ok(Json(ProjectDeploymentResponse {
        project_deployment,
        deployments,
    }))
}
