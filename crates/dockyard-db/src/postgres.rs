//! PostgreSQL store.
//!
//! Generation configuration and child collections are stored as JSONB,
//! compressed build logs as BYTEA.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockyard_core::ResourceId;
use dockyard_core::deployment::{
    Deployment, DeploymentStatus, ProjectDeployment, ProjectDeploymentStatus,
};
use dockyard_core::generation::{
    Domain, Generation, GenerationConfig, ParseEnumError, Port, Sysctl, Ulimit, Volume,
};
use dockyard_core::service::{Project, Service, is_valid_name};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use crate::store::{DeploymentEntry, Store};
use crate::{DbError, DbResult};

const ACTIVE_PROJECT_DEPLOYMENT: &str = "in_progress";

fn parse_status<T: FromStr<Err = ParseEnumError>>(value: &str) -> DbResult<T> {
    value
        .parse()
        .map_err(|e: ParseEnumError| DbError::InvalidData(e.to_string()))
}

/// Database row for projects.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRow {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Project {
            id: ResourceId::from_uuid(row.id),
            name: row.name,
            created_at: row.created_at,
        }
    }
}

/// Database row for services.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub latest_generation_id: Uuid,
    pub deployed_generation_id: Option<Uuid>,
    pub deployed_image: Option<String>,
    pub redeploy_secret: String,
    pub created_at: DateTime<Utc>,
}

impl From<ServiceRow> for Service {
    fn from(row: ServiceRow) -> Self {
        Service {
            id: ResourceId::from_uuid(row.id),
            project_id: ResourceId::from_uuid(row.project_id),
            name: row.name,
            latest_generation_id: ResourceId::from_uuid(row.latest_generation_id),
            deployed_generation_id: row.deployed_generation_id.map(ResourceId::from_uuid),
            deployed_image: row.deployed_image,
            redeploy_secret: row.redeploy_secret,
            created_at: row.created_at,
        }
    }
}

/// Database row for generations.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GenerationRow {
    pub id: Uuid,
    pub service_id: Uuid,
    pub config: Json<GenerationConfig>,
    pub domains: Json<Vec<Domain>>,
    pub ports: Json<Vec<Port>>,
    pub volumes: Json<Vec<Volume>>,
    pub sysctls: Json<Vec<Sysctl>>,
    pub ulimits: Json<Vec<Ulimit>>,
    pub created_at: DateTime<Utc>,
}

impl From<GenerationRow> for Generation {
    fn from(row: GenerationRow) -> Self {
        Generation {
            id: ResourceId::from_uuid(row.id),
            service_id: ResourceId::from_uuid(row.service_id),
            config: row.config.0,
            domains: row.domains.0,
            ports: row.ports.0,
            volumes: row.volumes.0,
            sysctls: row.sysctls.0,
            ulimits: row.ulimits.0,
            created_at: row.created_at,
        }
    }
}

/// Database row for project deployments.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectDeploymentRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub status: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<ProjectDeploymentRow> for ProjectDeployment {
    type Error = DbError;

    fn try_from(row: ProjectDeploymentRow) -> Result<Self, Self::Error> {
        Ok(ProjectDeployment {
            id: ResourceId::from_uuid(row.id),
            project_id: ResourceId::from_uuid(row.project_id),
            status: parse_status(&row.status)?,
            error: row.error,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

/// Database row for deployments.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeploymentRow {
    pub id: Uuid,
    pub service_id: Uuid,
    pub generation_id: Uuid,
    pub project_deployment_id: Option<Uuid>,
    pub status: String,
    pub image: Option<String>,
    pub build_logs: Option<Vec<u8>>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = DbError;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        Ok(Deployment {
            id: ResourceId::from_uuid(row.id),
            service_id: ResourceId::from_uuid(row.service_id),
            generation_id: ResourceId::from_uuid(row.generation_id),
            project_deployment_id: row.project_deployment_id.map(ResourceId::from_uuid),
            status: parse_status(&row.status)?,
            image: row.image,
            build_logs: row.build_logs,
            deployed_at: row.deployed_at,
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL implementation.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn conflict_on_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> DbError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Conflict(what()),
        _ => DbError::Database(err),
    }
}

async fn insert_generation(conn: &mut PgConnection, generation: &Generation) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO generations (
            id, service_id, config, domains, ports, volumes, sysctls, ulimits, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(generation.id.as_uuid())
    .bind(generation.service_id.as_uuid())
    .bind(Json(&generation.config))
    .bind(Json(&generation.domains))
    .bind(Json(&generation.ports))
    .bind(Json(&generation.volumes))
    .bind(Json(&generation.sysctls))
    .bind(Json(&generation.ulimits))
    .bind(generation.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn fetch_generation(conn: &mut PgConnection, id: Uuid) -> DbResult<Generation> {
    let row = sqlx::query_as::<_, GenerationRow>("SELECT * FROM generations WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("generation {}", id)))?;
    Ok(row.into())
}

async fn lock_service(conn: &mut PgConnection, id: Uuid) -> DbResult<ServiceRow> {
    sqlx::query_as::<_, ServiceRow>("SELECT * FROM services WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("service {}", id)))
}

/// Deployed, or referenced by a deployment that has not finished.
async fn is_frozen(conn: &mut PgConnection, generation_id: Uuid) -> DbResult<bool> {
    let frozen: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM services WHERE deployed_generation_id = $1
        ) OR EXISTS (
            SELECT 1 FROM deployments
            WHERE generation_id = $1 AND status NOT IN ('success', 'failed')
        )
        "#,
    )
    .bind(generation_id)
    .fetch_one(conn)
    .await?;
    Ok(frozen)
}

async fn fork_latest(conn: &mut PgConnection, service: &ServiceRow) -> DbResult<Generation> {
    let fork = fetch_generation(&mut *conn, service.latest_generation_id)
        .await?
        .fork();
    insert_generation(&mut *conn, &fork).await?;
    sqlx::query("UPDATE services SET latest_generation_id = $2 WHERE id = $1")
        .bind(service.id)
        .bind(fork.id.as_uuid())
        .execute(conn)
        .await?;
    debug!(service_id = %service.id, generation_id = %fork.id, "Forked latest generation");
    Ok(fork)
}

#[async_trait]
impl Store for PgStore {
    async fn create_project(&self, name: &str) -> DbResult<Project> {
        if !is_valid_name(name) {
            return Err(DbError::InvalidData(format!("invalid project name '{}'", name)));
        }
        let row = sqlx::query_as::<_, ProjectRow>(
            "INSERT INTO projects (id, name, created_at) VALUES ($1, $2, NOW()) RETURNING *",
        )
        .bind(Uuid::now_v7())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("project {} already exists", name)))?;

        Ok(row.into())
    }

    async fn get_project(&self, id: ResourceId) -> DbResult<Project> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))?;

        Ok(row.into())
    }

    async fn list_projects(&self) -> DbResult<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_service(
        &self,
        project_id: ResourceId,
        name: &str,
        draft: Generation,
    ) -> DbResult<Service> {
        if !is_valid_name(name) {
            return Err(DbError::InvalidData(format!("invalid service name '{}'", name)));
        }
        let service_id = ResourceId::new();
        let mut generation = Generation {
            id: ResourceId::new(),
            service_id,
            created_at: Utc::now(),
            ..draft
        };
        generation.assign_child_ids();

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ServiceRow>(
            r#"
            INSERT INTO services (
                id, project_id, name, latest_generation_id, redeploy_secret, created_at
            )
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING *
            "#,
        )
        .bind(service_id.as_uuid())
        .bind(project_id.as_uuid())
        .bind(name)
        .bind(generation.id.as_uuid())
        .bind(Service::generate_redeploy_secret())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                DbError::NotFound(format!("project {}", project_id))
            }
            _ => conflict_on_unique(e, || format!("service {} already exists", name)),
        })?;

        insert_generation(&mut tx, &generation).await?;
        tx.commit().await?;

        Ok(row.into())
    }

    async fn get_service(&self, id: ResourceId) -> DbResult<Service> {
        let row = sqlx::query_as::<_, ServiceRow>("SELECT * FROM services WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("service {}", id)))?;

        Ok(row.into())
    }

    async fn list_services(&self, project_id: ResourceId) -> DbResult<Vec<Service>> {
        let rows = sqlx::query_as::<_, ServiceRow>(
            "SELECT * FROM services WHERE project_id = $1 ORDER BY name",
        )
        .bind(project_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_generation(&self, id: ResourceId) -> DbResult<Generation> {
        let mut conn = self.pool.acquire().await?;
        fetch_generation(&mut conn, *id.as_uuid()).await
    }

    async fn editable_generation(&self, service_id: ResourceId) -> DbResult<Generation> {
        let mut tx = self.pool.begin().await?;
        let service = lock_service(&mut tx, *service_id.as_uuid()).await?;

        let generation = if is_frozen(&mut tx, service.latest_generation_id).await? {
            fork_latest(&mut tx, &service).await?
        } else {
            fetch_generation(&mut tx, service.latest_generation_id).await?
        };

        tx.commit().await?;
        Ok(generation)
    }

    async fn update_generation(&self, generation: &Generation) -> DbResult<Generation> {
        let mut updated = generation.clone();
        updated.assign_child_ids();

        let mut tx = self.pool.begin().await?;
        lock_service(&mut tx, *generation.service_id.as_uuid()).await?;

        if is_frozen(&mut tx, *generation.id.as_uuid()).await? {
            return Err(DbError::Conflict(format!(
                "generation {} is deployed or being deployed",
                generation.id
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE generations
            SET config = $3, domains = $4, ports = $5, volumes = $6, sysctls = $7, ulimits = $8
            WHERE id = $1 AND service_id = $2
            "#,
        )
        .bind(updated.id.as_uuid())
        .bind(updated.service_id.as_uuid())
        .bind(Json(&updated.config))
        .bind(Json(&updated.domains))
        .bind(Json(&updated.ports))
        .bind(Json(&updated.volumes))
        .bind(Json(&updated.sysctls))
        .bind(Json(&updated.ulimits))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("generation {}", generation.id)));
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn promote_generation(
        &self,
        service_id: ResourceId,
        generation_id: ResourceId,
        image: &str,
    ) -> DbResult<Service> {
        let mut tx = self.pool.begin().await?;
        let service = lock_service(&mut tx, *service_id.as_uuid()).await?;

        let generation = fetch_generation(&mut tx, *generation_id.as_uuid()).await?;
        if generation.service_id != service_id {
            return Err(DbError::InvalidData(format!(
                "generation {} does not belong to service {}",
                generation_id, service_id
            )));
        }

        sqlx::query(
            "UPDATE services SET deployed_generation_id = $2, deployed_image = $3 WHERE id = $1",
        )
        .bind(service.id)
        .bind(generation_id.as_uuid())
        .bind(image)
        .execute(&mut *tx)
        .await?;

        if service.latest_generation_id == *generation_id.as_uuid() {
            fork_latest(&mut tx, &service).await?;
        }

        let row = sqlx::query_as::<_, ServiceRow>("SELECT * FROM services WHERE id = $1")
            .bind(service.id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn create_project_deployment(
        &self,
        project_id: ResourceId,
        entries: &[DeploymentEntry],
    ) -> DbResult<(ProjectDeployment, Vec<Deployment>)> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent deploy requests for the same project.
        sqlx::query("SELECT id FROM projects WHERE id = $1 FOR UPDATE")
            .bind(project_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("project {}", project_id)))?;

        let conflict = || {
            format!(
                "a deployment of project {} is already in progress",
                project_id
            )
        };

        let row = sqlx::query_as::<_, ProjectDeploymentRow>(
            r#"
            INSERT INTO project_deployments (id, project_id, status, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(project_id.as_uuid())
        .bind(ACTIVE_PROJECT_DEPLOYMENT)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, conflict))?;
        let project_deployment: ProjectDeployment = row.try_into()?;

        let mut deployments = Vec::with_capacity(entries.len());
        for entry in entries {
            let row = sqlx::query_as::<_, DeploymentRow>(
                r#"
                INSERT INTO deployments (
                    id, service_id, generation_id, project_deployment_id, status,
                    created_at, updated_at
                )
                SELECT $1, $2, g.id, $4, $5, NOW(), NOW()
                FROM generations g
                WHERE g.id = $3 AND g.service_id = $2
                RETURNING *
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(entry.service_id.as_uuid())
            .bind(entry.generation_id.as_uuid())
            .bind(project_deployment.id.as_uuid())
            .bind(DeploymentStatus::BuildPending.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                DbError::InvalidData(format!(
                    "generation {} does not belong to service {}",
                    entry.generation_id, entry.service_id
                ))
            })?;
            deployments.push(row.try_into()?);
        }

        tx.commit().await?;
        debug!(
            project_deployment_id = %project_deployment.id,
            deployments = deployments.len(),
            "Project deployment created"
        );
        Ok((project_deployment, deployments))
    }

    async fn get_project_deployment(&self, id: ResourceId) -> DbResult<ProjectDeployment> {
        let row = sqlx::query_as::<_, ProjectDeploymentRow>(
            "SELECT * FROM project_deployments WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("project deployment {}", id)))?;

        row.try_into()
    }

    async fn active_project_deployment(
        &self,
        project_id: ResourceId,
    ) -> DbResult<Option<ProjectDeployment>> {
        let row = sqlx::query_as::<_, ProjectDeploymentRow>(
            "SELECT * FROM project_deployments WHERE project_id = $1 AND status = $2",
        )
        .bind(project_id.as_uuid())
        .bind(ACTIVE_PROJECT_DEPLOYMENT)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn finish_project_deployment(
        &self,
        id: ResourceId,
        status: ProjectDeploymentStatus,
        error: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE project_deployments SET status = $2, error = $3, finished_at = NOW() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_deployment(&self, id: ResourceId) -> DbResult<Deployment> {
        let row = sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("deployment {}", id)))?;

        row.try_into()
    }

    async fn list_deployments(
        &self,
        project_deployment_id: ResourceId,
    ) -> DbResult<Vec<Deployment>> {
        let rows = sqlx::query_as::<_, DeploymentRow>(
            "SELECT * FROM deployments WHERE project_deployment_id = $1 ORDER BY id",
        )
        .bind(project_deployment_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_deployment_status(
        &self,
        id: ResourceId,
        status: DeploymentStatus,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = $2,
                deployed_at = CASE WHEN $2 = 'success' THEN NOW() ELSE deployed_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("deployment {}", id)));
        }
        Ok(())
    }

    async fn finish_deployment(
        &self,
        id: ResourceId,
        status: DeploymentStatus,
        image: Option<&str>,
        build_logs: Option<Vec<u8>>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = $2,
                image = COALESCE($3, image),
                build_logs = COALESCE($4, build_logs),
                deployed_at = CASE WHEN $2 = 'success' THEN NOW() ELSE deployed_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(image)
        .bind(build_logs)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("deployment {}", id)));
        }
        Ok(())
    }

    async fn fail_interrupted(&self, reason: &str, build_logs: Vec<u8>) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE project_deployments
            SET status = $1, error = $2, finished_at = NOW()
            WHERE status = $3
            "#,
        )
        .bind(ProjectDeploymentStatus::Failed.as_str())
        .bind(reason)
        .bind(ACTIVE_PROJECT_DEPLOYMENT)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1,
                build_logs = COALESCE(build_logs, $2),
                updated_at = NOW()
            WHERE status NOT IN ($1, $3)
            "#,
        )
        .bind(DeploymentStatus::Failed.as_str())
        .bind(build_logs)
        .bind(DeploymentStatus::Success.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() as usize)
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
