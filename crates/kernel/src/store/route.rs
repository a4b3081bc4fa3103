//! Route rows — external `(domain, path)` mapped to a service port.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};

use super::{Store, StoreError, Tx};
use crate::store::search::Document;
use crate::store::service::PortMap;

#[derive(Debug, Clone, Serialize)]
pub struct Route {
    pub id: i64,
    pub service_id: i64,
    pub domain: String,
    pub path: Option<String>,
    pub port: u16,
    pub tls: bool,
    pub certificate_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpec {
    pub domain: String,
    pub path: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    pub certificate_id: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for Route {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let path: String = row.try_get("path")?;
        Ok(Route {
            id: row.try_get("id")?,
            service_id: row.try_get("service_id")?,
            domain: row.try_get("domain")?,
            path: if path.is_empty() { None } else { Some(path) },
            port: row.try_get::<i64, _>("port")? as u16,
            tls: row.try_get::<i64, _>("tls")? != 0,
            certificate_id: row.try_get("certificate_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A route joined with the pieces the proxy renderer needs: the owning
/// service's name and resolved host port, plus the certificate domain.
#[derive(Debug, Clone)]
pub struct RouteBinding {
    pub route: Route,
    pub service_name: String,
    pub project_id: i64,
    /// Host port the container port is published on, if any.
    pub host_port: Option<u16>,
    pub cert_domain: Option<String>,
}

impl Store {
    pub async fn create_route(
        &self,
        tx: &mut Tx<'_>,
        service_id: i64,
        spec: &RouteSpec,
    ) -> Result<Route, StoreError> {
        let now = Utc::now();
        let path = spec.path.clone().unwrap_or_default();
        let id = sqlx::query(
            "INSERT INTO routes
                 (service_id, domain, path, port, tls, certificate_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(service_id)
        .bind(&spec.domain)
        .bind(&path)
        .bind(spec.port as i64)
        .bind(spec.tls as i64)
        .bind(spec.certificate_id)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            StoreError::classify(e, &format!("route {}{}", spec.domain, path))
        })?
        .last_insert_rowid();

        let route = Route {
            id,
            service_id,
            domain: spec.domain.clone(),
            path: spec.path.clone().filter(|p| !p.is_empty()),
            port: spec.port,
            tls: spec.tls,
            certificate_id: spec.certificate_id,
            created_at: now,
            updated_at: now,
        };
        self.upsert_document(tx, &Document::for_route(&route)).await?;
        Ok(route)
    }

    pub async fn get_route(&self, id: i64) -> Result<Route, StoreError> {
        sqlx::query_as("SELECT * FROM routes WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, &format!("route {id}")))
    }

    pub async fn list_routes(&self, service_id: i64) -> Result<Vec<Route>, StoreError> {
        sqlx::query_as("SELECT * FROM routes WHERE service_id = ? ORDER BY domain, path")
            .bind(service_id)
            .fetch_all(self.read_pool())
            .await
            .map_err(|e| StoreError::classify(e, "routes"))
    }

    pub async fn list_all_routes(&self) -> Result<Vec<Route>, StoreError> {
        sqlx::query_as("SELECT * FROM routes ORDER BY domain, path")
            .fetch_all(self.read_pool())
            .await
            .map_err(|e| StoreError::classify(e, "routes"))
    }

    /// Does any route reference this certificate's domain? Drives the
    /// "certificate change triggers reconcile" rule.
    pub async fn domain_is_routed(&self, domain: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM routes WHERE domain = ?")
            .bind(domain)
            .fetch_one(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, "routes"))?;
        Ok(count > 0)
    }

    /// Single consistent snapshot for the proxy renderer.
    pub async fn route_snapshot(&self) -> Result<Vec<RouteBinding>, StoreError> {
        let rows = sqlx::query(
            "SELECT r.id, r.service_id, r.domain, r.path, r.port, r.tls, r.certificate_id,
                    r.created_at, r.updated_at,
                    s.name AS service_name, s.project_id, s.ports AS service_ports,
                    c.domain AS cert_domain
             FROM routes r
             JOIN services s ON s.id = r.service_id
             LEFT JOIN certificates c ON c.id = r.certificate_id
             ORDER BY r.domain, r.path",
        )
        .fetch_all(self.read_pool())
        .await
        .map_err(|e| StoreError::classify(e, "route snapshot"))?;

        let mut bindings = Vec::with_capacity(rows.len());
        for row in rows {
            let route = Route::from_row(&row).map_err(|e| StoreError::Fatal(e.to_string()))?;
            let ports_raw: String = row
                .try_get("service_ports")
                .map_err(|e| StoreError::Fatal(e.to_string()))?;
            let ports: Vec<PortMap> = serde_json::from_str(&ports_raw)
                .map_err(|e| StoreError::Fatal(format!("service ports: {e}")))?;
            let host_port = ports
                .iter()
                .find(|p| p.container == route.port)
                .map(|p| p.host);
            bindings.push(RouteBinding {
                service_name: row
                    .try_get("service_name")
                    .map_err(|e| StoreError::Fatal(e.to_string()))?,
                project_id: row
                    .try_get("project_id")
                    .map_err(|e| StoreError::Fatal(e.to_string()))?,
                cert_domain: row
                    .try_get("cert_domain")
                    .map_err(|e| StoreError::Fatal(e.to_string()))?,
                host_port,
                route,
            });
        }
        Ok(bindings)
    }

    pub async fn delete_route(&self, tx: &mut Tx<'_>, id: i64) -> Result<(), StoreError> {
        self.delete_document(tx, "route", id).await?;
        let result = sqlx::query("DELETE FROM routes WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify(e, &format!("route {id}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("route {id}")));
        }
        Ok(())
    }

    /// Cascade helper: removes every route (and its search document) owned
    /// by a service. Returns the deleted route ids.
    pub async fn delete_routes_for_service(
        &self,
        tx: &mut Tx<'_>,
        service_id: i64,
    ) -> Result<Vec<i64>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM routes WHERE service_id = ?")
            .bind(service_id)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| StoreError::classify(e, "routes"))?;
        for id in &ids {
            self.delete_document(tx, "route", *id).await?;
        }
        sqlx::query("DELETE FROM routes WHERE service_id = ?")
            .bind(service_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify(e, "routes"))?;
        Ok(ids)
    }
}
