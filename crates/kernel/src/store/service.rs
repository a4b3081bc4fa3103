//! Service rows — the central entity: a declaratively-defined container
//! with lifecycle policy and health configuration.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use super::{Store, StoreError, Tx};
use crate::store::search::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<DesiredState> {
        match s {
            "running" => Some(DesiredState::Running),
            "stopped" => Some(DesiredState::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Fail,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Fail => "fail",
            HealthStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<HealthStatus> {
        match s {
            "ok" => Some(HealthStatus::Ok),
            "fail" => Some(HealthStatus::Fail),
            "unknown" => Some(HealthStatus::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    pub container: u16,
    pub host: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMap {
    pub host: String,
    pub container: String,
    #[serde(default)]
    pub ro: bool,
}

/// Creation input for a service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMap>,
    #[serde(default)]
    pub volumes: Vec<VolumeMap>,
    pub registry: Option<String>,
    pub health_path: Option<String>,
    /// Peer service ids whose aliases are pulled into this service's
    /// network. The only sanctioned cross-project path.
    #[serde(default)]
    pub links: Vec<i64>,
}

impl ServiceSpec {
    pub fn image(name: &str, image: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: image.to_string(),
            env: HashMap::new(),
            ports: vec![],
            volumes: vec![],
            registry: None,
            health_path: None,
            links: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Service {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub image: String,
    /// Env values never leave the process through an API response.
    #[serde(skip_serializing)]
    pub env: HashMap<String, String>,
    pub ports: Vec<PortMap>,
    pub volumes: Vec<VolumeMap>,
    pub links: Vec<i64>,
    pub registry: Option<String>,
    pub health_path: Option<String>,
    pub desired_state: DesiredState,
    pub container_id: Option<String>,
    pub last_exit_code: Option<i64>,
    pub restart_count: i64,
    pub restart_window_start: Option<DateTime<Utc>>,
    pub crash_looping: bool,
    pub health_status: HealthStatus,
    pub last_probe_at: Option<DateTime<Utc>>,
    /// Latest observed lifecycle state, engine vocabulary
    /// (created/starting/running/stopping/stopped/exited/dead).
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    pub fn has_container_port(&self, port: u16) -> bool {
        self.ports.iter().any(|p| p.container == port)
    }
}

fn decode_err(column: &str, source: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(source),
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for Service {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let env_raw: String = row.try_get("env")?;
        let ports_raw: String = row.try_get("ports")?;
        let volumes_raw: String = row.try_get("volumes")?;
        let links_raw: String = row.try_get("links")?;
        let desired_raw: String = row.try_get("desired_state")?;
        let health_raw: String = row.try_get("health_status")?;

        Ok(Service {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            image: row.try_get("image")?,
            env: serde_json::from_str(&env_raw).map_err(|e| decode_err("env", e))?,
            ports: serde_json::from_str(&ports_raw).map_err(|e| decode_err("ports", e))?,
            volumes: serde_json::from_str(&volumes_raw).map_err(|e| decode_err("volumes", e))?,
            links: serde_json::from_str(&links_raw).map_err(|e| decode_err("links", e))?,
            registry: row.try_get("registry")?,
            health_path: row.try_get("health_path")?,
            desired_state: DesiredState::parse(&desired_raw).ok_or_else(|| {
                decode_err(
                    "desired_state",
                    std::io::Error::new(std::io::ErrorKind::InvalidData, desired_raw.clone()),
                )
            })?,
            container_id: row.try_get("container_id")?,
            last_exit_code: row.try_get("last_exit_code")?,
            restart_count: row.try_get("restart_count")?,
            restart_window_start: row.try_get("restart_window_start")?,
            crash_looping: row.try_get::<i64, _>("crash_looping")? != 0,
            health_status: HealthStatus::parse(&health_raw).ok_or_else(|| {
                decode_err(
                    "health_status",
                    std::io::Error::new(std::io::ErrorKind::InvalidData, health_raw.clone()),
                )
            })?,
            last_probe_at: row.try_get("last_probe_at")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Store {
    pub async fn create_service(
        &self,
        tx: &mut Tx<'_>,
        project_id: i64,
        spec: &ServiceSpec,
    ) -> Result<Service, StoreError> {
        let now = Utc::now();
        let env = serde_json::to_string(&spec.env).unwrap_or_else(|_| "{}".into());
        let ports = serde_json::to_string(&spec.ports).unwrap_or_else(|_| "[]".into());
        let volumes = serde_json::to_string(&spec.volumes).unwrap_or_else(|_| "[]".into());
        let links = serde_json::to_string(&spec.links).unwrap_or_else(|_| "[]".into());

        let id = sqlx::query(
            "INSERT INTO services
                 (project_id, name, image, env, ports, volumes, links, registry, health_path,
                  desired_state, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'stopped', 'created', ?, ?)",
        )
        .bind(project_id)
        .bind(&spec.name)
        .bind(&spec.image)
        .bind(&env)
        .bind(&ports)
        .bind(&volumes)
        .bind(&links)
        .bind(&spec.registry)
        .bind(&spec.health_path)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::classify(e, &format!("service {:?}", spec.name)))?
        .last_insert_rowid();

        let service = Service {
            id,
            project_id,
            name: spec.name.clone(),
            image: spec.image.clone(),
            env: spec.env.clone(),
            ports: spec.ports.clone(),
            volumes: spec.volumes.clone(),
            links: spec.links.clone(),
            registry: spec.registry.clone(),
            health_path: spec.health_path.clone(),
            desired_state: DesiredState::Stopped,
            container_id: None,
            last_exit_code: None,
            restart_count: 0,
            restart_window_start: None,
            crash_looping: false,
            health_status: HealthStatus::Unknown,
            last_probe_at: None,
            status: "created".to_string(),
            created_at: now,
            updated_at: now,
        };
        self.upsert_document(tx, &Document::for_service(&service))
            .await?;
        Ok(service)
    }

    pub async fn get_service(&self, id: i64) -> Result<Service, StoreError> {
        sqlx::query_as("SELECT * FROM services WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, &format!("service {id}")))
    }

    pub async fn get_service_by_container(
        &self,
        container_id: &str,
    ) -> Result<Option<Service>, StoreError> {
        sqlx::query_as("SELECT * FROM services WHERE container_id = ?")
            .bind(container_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, "service"))
    }

    pub async fn list_services(&self, project_id: i64) -> Result<Vec<Service>, StoreError> {
        sqlx::query_as("SELECT * FROM services WHERE project_id = ? ORDER BY name")
            .bind(project_id)
            .fetch_all(self.read_pool())
            .await
            .map_err(|e| StoreError::classify(e, "services"))
    }

    pub async fn list_all_services(&self) -> Result<Vec<Service>, StoreError> {
        sqlx::query_as("SELECT * FROM services ORDER BY project_id, name")
            .fetch_all(self.read_pool())
            .await
            .map_err(|e| StoreError::classify(e, "services"))
    }

    /// Services eligible for scheduled health probes.
    pub async fn list_probeable_services(&self) -> Result<Vec<Service>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM services
             WHERE status = 'running' AND health_path IS NOT NULL AND crash_looping = 0",
        )
        .fetch_all(self.read_pool())
        .await
        .map_err(|e| StoreError::classify(e, "services"))
    }

    /// Delete a service row. Routes must be gone first, in the same
    /// transaction; the check keeps cascade ordering honest.
    pub async fn delete_service(&self, tx: &mut Tx<'_>, id: i64) -> Result<(), StoreError> {
        let routes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM routes WHERE service_id = ?")
            .bind(id)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| StoreError::classify(e, "routes"))?;
        if routes > 0 {
            return Err(StoreError::ConstraintViolation(format!(
                "service {id} still owns {routes} route(s)"
            )));
        }

        self.delete_document(tx, "service", id).await?;
        sqlx::query("DELETE FROM deployments WHERE service_id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify(e, "deployments"))?;
        let result = sqlx::query("DELETE FROM services WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify(e, &format!("service {id}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("service {id}")));
        }
        Ok(())
    }

    // ── Lifecycle bookkeeping ───────────────────────────────────

    pub async fn set_desired_state(
        &self,
        id: i64,
        desired: DesiredState,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE services SET desired_state = ?, updated_at = ? WHERE id = ?",
        )
        .bind(desired.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::classify(e, &format!("service {id}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("service {id}")));
        }
        Ok(())
    }

    pub async fn bind_container(&self, id: i64, container_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE services SET container_id = ?, updated_at = ? WHERE id = ?")
            .bind(container_id)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, &format!("service {id}")))?;
        Ok(())
    }

    pub async fn clear_container(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE services SET container_id = NULL, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, &format!("service {id}")))?;
        Ok(())
    }

    /// Command-driven status write. Always wins; bumps `updated_at`.
    pub async fn update_status(
        &self,
        id: i64,
        status: &str,
        exit_code: Option<i64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE services SET status = ?, last_exit_code = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(exit_code)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::classify(e, &format!("service {id}")))?;
        Ok(())
    }

    /// Event-driven status write with first-writer-wins semantics: only
    /// applies when the event refers to the bound container and is newer
    /// than the row. Returns whether the write landed.
    pub async fn apply_observed_status(
        &self,
        id: i64,
        container_id: &str,
        status: &str,
        exit_code: Option<i64>,
        observed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE services SET status = ?, last_exit_code = ?, updated_at = ?
             WHERE id = ? AND container_id = ? AND updated_at < ?",
        )
        .bind(status)
        .bind(exit_code)
        .bind(observed_at)
        .bind(id)
        .bind(container_id)
        .bind(observed_at)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::classify(e, &format!("service {id}")))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_crash_state(
        &self,
        id: i64,
        restart_count: i64,
        window_start: Option<DateTime<Utc>>,
        crash_looping: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE services
             SET restart_count = ?, restart_window_start = ?, crash_looping = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(restart_count)
        .bind(window_start)
        .bind(crash_looping as i64)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::classify(e, &format!("service {id}")))?;
        Ok(())
    }

    pub async fn set_health(
        &self,
        id: i64,
        status: HealthStatus,
        probe_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE services SET health_status = ?, last_probe_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(probe_at)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::classify(e, &format!("service {id}")))?;
        Ok(())
    }
}
