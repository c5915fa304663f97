//! Redeploy webhook.
//!
//! Each service carries a redeploy secret. A caller proves it knows the
//! secret either directly (`X-Dockyard-Secret` header or `?secret=`) or, for
//! git hosting push hooks, with an `X-Hub-Signature-256` HMAC of the body.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use dockyard_core::ResourceId;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::projects::DeployResponse;

const SECRET_HEADER: &str = "X-Dockyard-Secret";
const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

pub fn router() -> Router<AppState> {
    Router::new().route("/redeploy/{service_id}", post(redeploy))
}

#[derive(Debug, Deserialize)]
struct RedeployQuery {
    secret: Option<String>,
}

/// Start a project deploy that always includes this service.
async fn redeploy(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
    Query(query): Query<RedeployQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<DeployResponse>), ApiError> {
    let service = state
        .store
        .get_service(ResourceId::from_uuid(service_id))
        .await?;

    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.secret);
    let authorized = match presented {
        Some(secret) => secrets_match(&service.redeploy_secret, &secret),
        None => verify_signature(
            &service.redeploy_secret,
            &body,
            headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()),
        ),
    };
    if !authorized {
        warn!(service = %service.name, "Rejected redeploy webhook");
        return Err(ApiError::Unauthorized("invalid redeploy secret".to_string()));
    }

    let handle = state
        .coordinator
        .submit_deploy(service.project_id, &[service.id])
        .await?;
    info!(
        service = %service.name,
        project_deployment_id = %handle.project_deployment.id,
        "Redeploy triggered by webhook"
    );
    Ok((StatusCode::ACCEPTED, Json(handle.into())))
}

/// Compare digests so the comparison time does not depend on how much of
/// the secret matched.
fn secrets_match(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

/// Verify a `sha256=<hex>` HMAC signature of `body`.
fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(sig_hex) = signature.and_then(|s| s.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}
