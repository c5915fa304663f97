//! API routes.

pub mod cluster;
pub mod deployments;
pub mod health;
pub mod projects;
pub mod services;
pub mod sse;
pub mod webhooks;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .nest("/webhooks", webhooks::router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/projects", projects::router())
        .nest("/deployments", deployments::router())
        .nest("/project-deployments", deployments::project_router())
        .nest("/services", services::router())
        .merge(cluster::router())
}
