//! API token rows. Only the bcrypt hash of the secret is persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use super::{Store, StoreError, Tx};
use crate::actor::Role;

#[derive(Debug, Clone, Serialize)]
pub struct Token {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for Token {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let role_raw: String = row.try_get("role")?;
        Ok(Token {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            secret_hash: row.try_get("secret_hash")?,
            role: Role::parse(&role_raw).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "role".to_string(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    role_raw.clone(),
                )),
            })?,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
        })
    }
}

impl Store {
    pub async fn create_token(
        &self,
        tx: &mut Tx<'_>,
        name: &str,
        secret_hash: &str,
        role: Role,
    ) -> Result<Token, StoreError> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO tokens (name, secret_hash, role, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(secret_hash)
        .bind(role.as_str())
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::classify(e, &format!("token {name:?}")))?
        .last_insert_rowid();

        Ok(Token {
            id,
            name: name.to_string(),
            secret_hash: secret_hash.to_string(),
            role,
            created_at: now,
            last_used_at: None,
        })
    }

    pub async fn get_token_by_name(&self, name: &str) -> Result<Option<Token>, StoreError> {
        sqlx::query_as("SELECT * FROM tokens WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, &format!("token {name:?}")))
    }

    pub async fn list_tokens(&self) -> Result<Vec<Token>, StoreError> {
        sqlx::query_as("SELECT * FROM tokens ORDER BY name")
            .fetch_all(self.read_pool())
            .await
            .map_err(|e| StoreError::classify(e, "tokens"))
    }

    pub async fn delete_token_by_name(&self, tx: &mut Tx<'_>, name: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM tokens WHERE name = ?")
            .bind(name)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify(e, &format!("token {name:?}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("token {name:?}")));
        }
        Ok(())
    }

    /// Best-effort usage stamp; failures must not fail the request.
    pub async fn touch_token(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE tokens SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, "token"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_lookup() {
        let store = Store::open_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        store
            .create_token(&mut tx, "ci", "$2b$12$fakehash", Role::Deployer)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let token = store.get_token_by_name("ci").await.unwrap().unwrap();
        assert_eq!(token.role, Role::Deployer);
        assert!(token.last_used_at.is_none());

        store.touch_token(token.id).await.unwrap();
        let token = store.get_token_by_name("ci").await.unwrap().unwrap();
        assert!(token.last_used_at.is_some());
    }

    #[tokio::test]
    async fn hash_is_never_serialized() {
        let store = Store::open_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let token = store
            .create_token(&mut tx, "ci", "$2b$12$fakehash", Role::Viewer)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let json = serde_json::to_value(&token).unwrap();
        assert!(json.get("secret_hash").is_none());
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let store = Store::open_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        store
            .create_token(&mut tx, "ci", "h1", Role::Viewer)
            .await
            .unwrap();
        let err = store
            .create_token(&mut tx, "ci", "h2", Role::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueConflict(_)));
    }
}
