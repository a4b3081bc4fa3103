//! Denormalized search documents, updated transactionally with their
//! source rows. An FTS5 shadow table accelerates matching when the
//! platform supports it; otherwise queries degrade to prefix matching.

use chrono::Utc;
use serde::Serialize;

use super::{Store, StoreError, Tx};
use crate::store::cert::Certificate;
use crate::store::project::Project;
use crate::store::route::Route;
use crate::store::service::Service;

#[derive(Debug, Clone)]
pub struct Document {
    pub entity_type: &'static str,
    pub entity_id: i64,
    pub title: String,
    pub subtitle: String,
    pub body: String,
    pub tags: String,
    pub url_path: String,
}

impl Document {
    pub fn for_project(project: &Project) -> Document {
        Document {
            entity_type: "project",
            entity_id: project.id,
            title: project.name.clone(),
            subtitle: project.network_name(),
            body: String::new(),
            tags: "project".to_string(),
            url_path: format!("/projects/{}", project.id),
        }
    }

    pub fn for_service(service: &Service) -> Document {
        Document {
            entity_type: "service",
            entity_id: service.id,
            title: service.name.clone(),
            subtitle: service.image.clone(),
            body: String::new(),
            tags: "service container".to_string(),
            url_path: format!("/services/{}", service.id),
        }
    }

    pub fn for_route(route: &Route) -> Document {
        let path = route.path.as_deref().unwrap_or("");
        Document {
            entity_type: "route",
            entity_id: route.id,
            title: format!("{}{path}", route.domain),
            subtitle: format!("port {}", route.port),
            body: String::new(),
            tags: if route.tls { "route tls" } else { "route" }.to_string(),
            url_path: format!("/routes/{}", route.id),
        }
    }

    pub fn for_certificate(cert: &Certificate) -> Document {
        Document {
            entity_type: "certificate",
            entity_id: cert.id,
            title: cert.domain.clone(),
            subtitle: cert.cert_type.as_str().to_string(),
            body: String::new(),
            tags: "certificate tls".to_string(),
            url_path: format!("/certificates/{}", cert.id),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SearchHit {
    pub entity_type: String,
    pub entity_id: i64,
    pub title: String,
    pub subtitle: String,
    pub url_path: String,
}

impl Store {
    pub(crate) async fn upsert_document(
        &self,
        tx: &mut Tx<'_>,
        doc: &Document,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO documents
                 (entity_type, entity_id, title, subtitle, body, tags, url_path, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (entity_type, entity_id) DO UPDATE SET
                 title = excluded.title, subtitle = excluded.subtitle,
                 body = excluded.body, tags = excluded.tags,
                 url_path = excluded.url_path, updated_at = excluded.updated_at",
        )
        .bind(doc.entity_type)
        .bind(doc.entity_id)
        .bind(&doc.title)
        .bind(&doc.subtitle)
        .bind(&doc.body)
        .bind(&doc.tags)
        .bind(&doc.url_path)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::classify(e, "search document"))?;

        if self.fts_enabled() {
            sqlx::query("DELETE FROM documents_fts WHERE entity_type = ? AND entity_id = ?")
                .bind(doc.entity_type)
                .bind(doc.entity_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| StoreError::classify(e, "search index"))?;
            sqlx::query(
                "INSERT INTO documents_fts (entity_type, entity_id, title, subtitle, body, tags)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(doc.entity_type)
            .bind(doc.entity_id)
            .bind(&doc.title)
            .bind(&doc.subtitle)
            .bind(&doc.body)
            .bind(&doc.tags)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify(e, "search index"))?;
        }
        Ok(())
    }

    pub(crate) async fn delete_document(
        &self,
        tx: &mut Tx<'_>,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM documents WHERE entity_type = ? AND entity_id = ?")
            .bind(entity_type)
            .bind(entity_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::classify(e, "search document"))?;
        if self.fts_enabled() {
            sqlx::query("DELETE FROM documents_fts WHERE entity_type = ? AND entity_id = ?")
                .bind(entity_type)
                .bind(entity_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| StoreError::classify(e, "search index"))?;
        }
        Ok(())
    }

    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchHit>, StoreError> {
        let limit = limit.clamp(1, 100);
        let query = query.trim();
        if query.is_empty() {
            return Ok(vec![]);
        }

        if self.fts_enabled() {
            // Quote the term so user input cannot inject FTS operators.
            let term = format!("\"{}\"*", query.replace('"', ""));
            sqlx::query_as(
                "SELECT d.entity_type, d.entity_id, d.title, d.subtitle, d.url_path
                 FROM documents_fts
                 JOIN documents d
                   ON d.entity_type = documents_fts.entity_type
                  -- fts5 columns carry no affinity; cast before comparing
                  AND d.entity_id = CAST(documents_fts.entity_id AS INTEGER)
                 WHERE documents_fts MATCH ?
                 ORDER BY rank
                 LIMIT ?",
            )
            .bind(term)
            .bind(limit)
            .fetch_all(self.read_pool())
            .await
            .map_err(|e| StoreError::classify(e, "search"))
        } else {
            let prefix = format!("{}%", query.replace('%', "").replace('_', ""));
            sqlx::query_as(
                "SELECT entity_type, entity_id, title, subtitle, url_path
                 FROM documents
                 WHERE title LIKE ? OR tags LIKE ?
                 ORDER BY title
                 LIMIT ?",
            )
            .bind(&prefix)
            .bind(&prefix)
            .bind(limit)
            .fetch_all(self.read_pool())
            .await
            .map_err(|e| StoreError::classify(e, "search"))
        }
    }

    /// Title-prefix suggestions for typeahead.
    pub async fn suggest(&self, prefix: &str, limit: i64) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Ok(vec![]);
        }
        let pattern = format!("{}%", prefix.replace('%', "").replace('_', ""));
        sqlx::query_scalar(
            "SELECT DISTINCT title FROM documents WHERE title LIKE ? ORDER BY title LIMIT ?",
        )
        .bind(pattern)
        .bind(limit.clamp(1, 20))
        .fetch_all(self.read_pool())
        .await
        .map_err(|e| StoreError::classify(e, "suggest"))
    }

    /// Rebuild every document from its source row. Used by the `reindex`
    /// job after upgrades or manual index damage.
    pub async fn reindex_all(&self) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM documents")
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::classify(e, "documents"))?;
        if self.fts_enabled() {
            sqlx::query("DELETE FROM documents_fts")
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::classify(e, "search index"))?;
        }

        let projects: Vec<Project> = sqlx::query_as("SELECT * FROM projects")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::classify(e, "projects"))?;
        let services: Vec<Service> = sqlx::query_as("SELECT * FROM services")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::classify(e, "services"))?;
        let routes: Vec<Route> = sqlx::query_as("SELECT * FROM routes")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::classify(e, "routes"))?;
        let certs: Vec<Certificate> = sqlx::query_as("SELECT * FROM certificates")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::classify(e, "certificates"))?;

        let mut count = 0u64;
        for doc in projects
            .iter()
            .map(Document::for_project)
            .chain(services.iter().map(Document::for_service))
            .chain(routes.iter().map(Document::for_route))
            .chain(certs.iter().map(Document::for_certificate))
        {
            self.upsert_document(&mut tx, &doc).await?;
            count += 1;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::classify(e, "reindex"))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ServiceSpec;

    async fn seeded() -> Store {
        let store = Store::open_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let project = store.create_project(&mut tx, "demo").await.unwrap();
        store
            .create_service(&mut tx, project.id, &ServiceSpec::image("webapp", "nginx:alpine"))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn documents_follow_source_rows() {
        let store = seeded().await;
        let hits = store.search("webapp", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity_type, "service");
    }

    #[tokio::test]
    async fn suggest_is_prefix_based() {
        let store = seeded().await;
        let suggestions = store.suggest("web", 5).await.unwrap();
        assert_eq!(suggestions, vec!["webapp".to_string()]);
        assert!(store.suggest("zzz", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() {
        let store = seeded().await;
        assert!(store.search("  ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reindex_rebuilds_documents() {
        let store = seeded().await;
        // Simulate index damage.
        let mut tx = store.begin().await.unwrap();
        sqlx::query("DELETE FROM documents")
            .execute(&mut *tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(store.search("webapp", 10).await.unwrap().is_empty());

        let count = store.reindex_all().await.unwrap();
        assert_eq!(count, 2); // project + service
        assert_eq!(store.search("webapp", 10).await.unwrap().len(), 1);
    }
}
