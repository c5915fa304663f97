//! Project deploys and pending-change diffs.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use dockyard_core::ResourceId;
use dockyard_core::deployment::Deployment;
use dockyard_scheduler::{DeployHandle, ServiceDiff};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/deploy", post(deploy))
        .route("/{id}/diff", get(diff))
}

/// Body of an accepted deploy.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeployResponse {
    pub project_deployment_id: ResourceId,
    pub deployments: Vec<Deployment>,
}

impl From<DeployHandle> for DeployResponse {
    fn from(handle: DeployHandle) -> Self {
        // The deploy keeps running after the request returns.
        drop(handle.completion);
        Self {
            project_deployment_id: handle.project_deployment.id,
            deployments: handle.deployments,
        }
    }
}

async fn deploy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<DeployResponse>), ApiError> {
    let project_id = ResourceId::from_uuid(id);
    let handle = state.coordinator.submit_deploy(project_id, &[]).await?;
    info!(
        project_id = %project_id,
        project_deployment_id = %handle.project_deployment.id,
        "Deploy accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(handle.into())))
}

async fn diff(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ServiceDiff>>, ApiError> {
    let diffs = state
        .coordinator
        .deploy_diff(ResourceId::from_uuid(id))
        .await?;
    Ok(Json(diffs))
}
