//! Certificate rows. The private key is stored only as an AES-GCM
//! ciphertext plus its nonce; plaintext never touches the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use super::{Store, StoreError, Tx};
use crate::store::search::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertType {
    Manual,
    Acme,
    Custom,
}

impl CertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertType::Manual => "manual",
            CertType::Acme => "acme",
            CertType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<CertType> {
        match s {
            "manual" => Some(CertType::Manual),
            "acme" => Some(CertType::Acme),
            "custom" => Some(CertType::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Certificate {
    pub id: i64,
    pub domain: String,
    pub cert_type: CertType,
    pub cert_pem: String,
    pub key_ciphertext: Vec<u8>,
    pub key_nonce: Vec<u8>,
    pub expires_at: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for Certificate {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let type_raw: String = row.try_get("cert_type")?;
        Ok(Certificate {
            id: row.try_get("id")?,
            domain: row.try_get("domain")?,
            cert_type: CertType::parse(&type_raw).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "cert_type".to_string(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    type_raw.clone(),
                )),
            })?,
            cert_pem: row.try_get("cert_pem")?,
            key_ciphertext: row.try_get("key_ciphertext")?,
            key_nonce: row.try_get("key_nonce")?,
            expires_at: row.try_get("expires_at")?,
            auto_renew: row.try_get::<i64, _>("auto_renew")? != 0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub async fn create_certificate(
        &self,
        tx: &mut Tx<'_>,
        domain: &str,
        cert_type: CertType,
        cert_pem: &str,
        key_ciphertext: &[u8],
        key_nonce: &[u8],
        expires_at: Option<DateTime<Utc>>,
        auto_renew: bool,
    ) -> Result<Certificate, StoreError> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO certificates
                 (domain, cert_type, cert_pem, key_ciphertext, key_nonce,
                  expires_at, auto_renew, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(domain)
        .bind(cert_type.as_str())
        .bind(cert_pem)
        .bind(key_ciphertext)
        .bind(key_nonce)
        .bind(expires_at)
        .bind(auto_renew as i64)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::classify(e, &format!("certificate {domain:?}")))?
        .last_insert_rowid();

        let cert = Certificate {
            id,
            domain: domain.to_string(),
            cert_type,
            cert_pem: cert_pem.to_string(),
            key_ciphertext: key_ciphertext.to_vec(),
            key_nonce: key_nonce.to_vec(),
            expires_at,
            auto_renew,
            created_at: now,
            updated_at: now,
        };
        self.upsert_document(tx, &Document::for_certificate(&cert))
            .await?;
        Ok(cert)
    }

    pub async fn get_certificate(&self, id: i64) -> Result<Certificate, StoreError> {
        sqlx::query_as("SELECT * FROM certificates WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, &format!("certificate {id}")))
    }

    pub async fn get_certificate_by_domain(
        &self,
        domain: &str,
    ) -> Result<Option<Certificate>, StoreError> {
        sqlx::query_as("SELECT * FROM certificates WHERE domain = ?")
            .bind(domain)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| StoreError::classify(e, &format!("certificate {domain:?}")))
    }

    pub async fn list_certificates(&self) -> Result<Vec<Certificate>, StoreError> {
        sqlx::query_as("SELECT * FROM certificates ORDER BY domain")
            .fetch_all(self.read_pool())
            .await
            .map_err(|e| StoreError::classify(e, "certificates"))
    }

    /// Certificates with `auto_renew` whose expiry falls within the
    /// renewal window.
    pub async fn list_renewal_eligible(
        &self,
        now: DateTime<Utc>,
        within_days: i64,
    ) -> Result<Vec<Certificate>, StoreError> {
        let horizon = now + chrono::Duration::days(within_days);
        sqlx::query_as(
            "SELECT * FROM certificates
             WHERE auto_renew = 1 AND expires_at IS NOT NULL AND expires_at <= ?
             ORDER BY expires_at",
        )
        .bind(horizon)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::classify(e, "certificates"))
    }

    /// Replace certificate material after a renewal, atomically with the
    /// search-document refresh.
    pub async fn update_certificate_material(
        &self,
        tx: &mut Tx<'_>,
        id: i64,
        cert_pem: &str,
        key_ciphertext: &[u8],
        key_nonce: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE certificates
             SET cert_pem = ?, key_ciphertext = ?, key_nonce = ?, expires_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(cert_pem)
        .bind(key_ciphertext)
        .bind(key_nonce)
        .bind(expires_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::classify(e, &format!("certificate {id}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("certificate {id}")));
        }
        Ok(())
    }

    pub async fn delete_certificate(&self, tx: &mut Tx<'_>, id: i64) -> Result<(), StoreError> {
        let routed: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM routes WHERE certificate_id = ?")
                .bind(id)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| StoreError::classify(e, "routes"))?;
        if routed > 0 {
            return Err(StoreError::ConstraintViolation(format!(
                "certificate {id} is referenced by {routed} route(s)"
            )));
        }

        self.delete_document(tx, "certificate", id).await?;
        let result = sqlx::query("DELETE FROM certificates WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify(e, &format!("certificate {id}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("certificate {id}")));
        }
        Ok(())
    }
}
