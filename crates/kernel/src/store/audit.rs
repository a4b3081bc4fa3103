//! Append-only audit log. Entries are never mutated.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Store, StoreError, Tx};
use crate::actor::Actor;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: String,
    /// Dotted action tag, e.g. `service.start`, `nginx.reload`.
    pub action: String,
    pub target: String,
    pub correlation_id: String,
    /// Opaque key/value JSON.
    pub metadata: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Append inside a caller transaction so the entry commits atomically
    /// with the mutation it records.
    pub async fn audit_append(
        &self,
        tx: &mut Tx<'_>,
        actor: &Actor,
        action: &str,
        target: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_log (actor, action, target, correlation_id, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&actor.name)
        .bind(action)
        .bind(target)
        .bind(&actor.correlation_id)
        .bind(metadata.to_string())
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::classify(e, "audit entry"))?;
        Ok(())
    }

    /// Standalone append for mutations that have no surrounding store
    /// transaction (engine-only operations, proxy reloads).
    pub async fn audit_record(
        &self,
        actor: &Actor,
        action: &str,
        target: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        self.audit_append(&mut tx, actor, action, target, metadata)
            .await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::classify(e, "audit entry"))
    }

    pub async fn audit_recent(&self, limit: i64) -> Result<Vec<AuditEntry>, StoreError> {
        sqlx::query_as("SELECT * FROM audit_log ORDER BY id DESC LIMIT ?")
            .bind(limit.clamp(1, 1000))
            .fetch_all(self.read_pool())
            .await
            .map_err(|e| StoreError::classify(e, "audit log"))
    }
}
