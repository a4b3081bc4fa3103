//! Project rows — logical grouping of services, one virtual network each.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Store, StoreError, Tx};
use crate::store::search::Document;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn network_name(&self) -> String {
        crate::net::network_name(self.id)
    }
}

impl Store {
    pub async fn create_project(&self, tx: &mut Tx<'_>, name: &str) -> Result<Project, StoreError> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO projects (name, created_at, updated_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::classify(e, &format!("project {name:?}")))?
        .last_insert_rowid();

        let project = Project {
            id,
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.upsert_document(tx, &Document::for_project(&project))
            .await?;
        Ok(project)
    }

    pub async fn get_project(&self, id: i64) -> Result<Project, StoreError> {
        sqlx::query_as("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, &format!("project {id}")))
    }

    pub async fn get_project_by_name(&self, name: &str) -> Result<Project, StoreError> {
        sqlx::query_as("SELECT * FROM projects WHERE name = ?")
            .bind(name)
            .fetch_one(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, &format!("project {name:?}")))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        sqlx::query_as("SELECT * FROM projects ORDER BY name")
            .fetch_all(self.read_pool())
            .await
            .map_err(|e| StoreError::classify(e, "projects"))
    }

    pub async fn count_project_services(&self, project_id: i64) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM services WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, "services"))
    }

    /// Delete a project row. Refuses while services still reference it;
    /// cascade ordering (routes → services → project) is the caller's job
    /// inside the same transaction.
    pub async fn delete_project(&self, tx: &mut Tx<'_>, id: i64) -> Result<(), StoreError> {
        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM services WHERE project_id = ?")
                .bind(id)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| StoreError::classify(e, "services"))?;
        if remaining > 0 {
            return Err(StoreError::ConstraintViolation(format!(
                "project {id} still owns {remaining} service(s)"
            )));
        }

        self.delete_document(tx, "project", id).await?;
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify(e, &format!("project {id}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("project {id}")));
        }
        Ok(())
    }
}
