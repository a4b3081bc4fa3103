//! Latest-status cache — derived state, always recoverable from engine
//! inspection. Updated before subscribers are notified, so a consumer
//! reading the cache after a notification sees at-least-as-recent state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service_id: i64,
    pub container_id: Option<String>,
    pub state: String,
    pub exit_code: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

pub struct StatusCache {
    entries: DashMap<i64, ServiceStatus>,
}

impl StatusCache {
    pub fn new() -> Self {
        StatusCache {
            entries: DashMap::new(),
        }
    }

    pub fn update(
        &self,
        service_id: i64,
        container_id: Option<String>,
        state: &str,
        exit_code: Option<i64>,
    ) {
        self.entries.insert(
            service_id,
            ServiceStatus {
                service_id,
                container_id,
                state: state.to_string(),
                exit_code,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, service_id: i64) -> Option<ServiceStatus> {
        self.entries.get(&service_id).map(|e| e.clone())
    }

    pub fn remove(&self, service_id: i64) {
        self.entries.remove(&service_id);
    }

    pub fn all(&self) -> Vec<ServiceStatus> {
        self.entries.iter().map(|e| e.clone()).collect()
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}
