//! Serialized status writes for one deployment.

use dockyard_core::ResourceId;
use dockyard_core::deployment::DeploymentStatus;
use dockyard_core::{Error, Result};
use dockyard_db::Store;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Owns the persisted status of one deployment.
///
/// The lock is held across the store write, so a second update waits for
/// the first to land and writes can never reach the store out of order.
pub struct StatusWriter {
    store: Arc<dyn Store>,
    deployment_id: ResourceId,
    current: Mutex<DeploymentStatus>,
}

impl StatusWriter {
    pub fn new(store: Arc<dyn Store>, deployment_id: ResourceId, current: DeploymentStatus) -> Self {
        Self {
            store,
            deployment_id,
            current: Mutex::new(current),
        }
    }

    pub fn deployment_id(&self) -> ResourceId {
        self.deployment_id
    }

    pub async fn current(&self) -> DeploymentStatus {
        *self.current.lock().await
    }

    /// Move to `next`, persisting it.
    pub async fn transition(&self, next: DeploymentStatus) -> Result<()> {
        let mut current = self.current.lock().await;
        Self::check(*current, next)?;
        self.store
            .update_deployment_status(self.deployment_id, next)
            .await?;
        debug!(deployment_id = %self.deployment_id, from = %*current, to = %next, "Status updated");
        *current = next;
        Ok(())
    }

    /// Move to `next` and store the image and compressed logs with it.
    pub async fn finish(
        &self,
        next: DeploymentStatus,
        image: Option<&str>,
        build_logs: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut current = self.current.lock().await;
        Self::check(*current, next)?;
        self.store
            .finish_deployment(self.deployment_id, next, image, build_logs)
            .await?;
        debug!(deployment_id = %self.deployment_id, from = %*current, to = %next, "Status updated");
        *current = next;
        Ok(())
    }

    fn check(from: DeploymentStatus, to: DeploymentStatus) -> Result<()> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }
}
