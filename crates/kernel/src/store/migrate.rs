//! Forward-only schema migrations, executed at startup under an exclusive
//! transaction and guarded by a persisted schema version.

use sqlx::SqlitePool;

use super::StoreError;

/// Ordered, append-only. Never edit a shipped migration; add a new one.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE projects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        name TEXT NOT NULL,
        image TEXT NOT NULL,
        env TEXT NOT NULL DEFAULT '{}',
        ports TEXT NOT NULL DEFAULT '[]',
        volumes TEXT NOT NULL DEFAULT '[]',
        links TEXT NOT NULL DEFAULT '[]',
        registry TEXT,
        health_path TEXT,
        desired_state TEXT NOT NULL DEFAULT 'stopped',
        container_id TEXT,
        last_exit_code INTEGER,
        restart_count INTEGER NOT NULL DEFAULT 0,
        restart_window_start TEXT,
        crash_looping INTEGER NOT NULL DEFAULT 0,
        health_status TEXT NOT NULL DEFAULT 'unknown',
        last_probe_at TEXT,
        status TEXT NOT NULL DEFAULT 'created',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (project_id, name)
    );
    CREATE INDEX idx_services_project ON services(project_id);
    CREATE INDEX idx_services_container ON services(container_id);

    CREATE TABLE certificates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        domain TEXT NOT NULL UNIQUE,
        cert_type TEXT NOT NULL,
        cert_pem TEXT NOT NULL,
        key_ciphertext BLOB NOT NULL,
        key_nonce BLOB NOT NULL,
        expires_at TEXT,
        auto_renew INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE routes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        service_id INTEGER NOT NULL REFERENCES services(id),
        domain TEXT NOT NULL,
        -- empty string means "no path prefix"; NOT NULL keeps the unique
        -- index honest (sqlite treats NULLs as pairwise distinct)
        path TEXT NOT NULL DEFAULT '',
        port INTEGER NOT NULL,
        tls INTEGER NOT NULL DEFAULT 0,
        certificate_id INTEGER REFERENCES certificates(id),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (domain, path)
    );
    CREATE INDEX idx_routes_service ON routes(service_id);

    CREATE TABLE tokens (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        secret_hash TEXT NOT NULL,
        role TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_used_at TEXT
    );

    CREATE TABLE audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        target TEXT NOT NULL,
        correlation_id TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_audit_created ON audit_log(created_at);

    CREATE TABLE deployments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        service_id INTEGER NOT NULL REFERENCES services(id),
        image TEXT NOT NULL,
        git_ref TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        log_path TEXT,
        created_at TEXT NOT NULL,
        finished_at TEXT
    );
    CREATE INDEX idx_deployments_service ON deployments(service_id);

    CREATE TABLE documents (
        entity_type TEXT NOT NULL,
        entity_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        subtitle TEXT NOT NULL DEFAULT '',
        body TEXT NOT NULL DEFAULT '',
        tags TEXT NOT NULL DEFAULT '',
        url_path TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (entity_type, entity_id)
    );
    "#,
)];

pub(super) async fn run(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL PRIMARY KEY)",
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::Fatal(format!("create schema_version: {e}")))?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(|e| StoreError::Fatal(format!("read schema_version: {e}")))?;
    let current = current.unwrap_or(0);

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Fatal(format!("migration {version}: {e}")))?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Fatal(format!("record migration {version}: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Fatal(format!("commit migration {version}: {e}")))?;
        tracing::info!(version, "applied schema migration");
    }
    Ok(())
}

/// Probe FTS5 support and create the shadow index if available.
/// Returns whether full-text search is usable.
pub(super) async fn try_enable_fts(pool: &SqlitePool) -> bool {
    let result = sqlx::raw_sql(
        "CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts
         USING fts5(entity_type UNINDEXED, entity_id UNINDEXED, title, subtitle, body, tags)",
    )
    .execute(pool)
    .await;
    match result {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(error = %e, "FTS5 probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn migrations_are_idempotent_on_rerun() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run(&pool).await.unwrap();
        // Second run must be a no-op, not a failure.
        run(&pool).await.unwrap();

        let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, 1);
    }
}
