//! In-process broadcast topics with bounded rings.
//!
//! Three topic classes: one global `lifecycle` topic, and per-service
//! `logs` / `stats` topics (plus per-job log topics) created on demand.
//! Subscribers receive events from the moment they subscribe; no replay.
//! On overflow the oldest entries are dropped and the subscriber observes
//! a [`Delivery::Gap`] marker.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::engine::{EngineEvent, LogLine, StatsSample};

const LIFECYCLE_CAPACITY: usize = 1024;
const TOPIC_CAPACITY: usize = 256;

/// What a subscriber pulls off a topic: an item, or a marker recording how
/// many items were dropped while it lagged.
#[derive(Debug, Clone)]
pub enum Delivery<T> {
    Item(T),
    Gap(u64),
}

pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// `None` when the topic is closed (process shutdown).
    pub async fn recv(&mut self) -> Option<Delivery<T>> {
        match self.rx.recv().await {
            Ok(item) => Some(Delivery::Item(item)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(Delivery::Gap(n)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

pub struct EventBus {
    lifecycle: broadcast::Sender<EngineEvent>,
    logs: DashMap<i64, broadcast::Sender<LogLine>>,
    stats: DashMap<i64, broadcast::Sender<StatsSample>>,
    job_logs: DashMap<i64, broadcast::Sender<Bytes>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        EventBus {
            lifecycle,
            logs: DashMap::new(),
            stats: DashMap::new(),
            job_logs: DashMap::new(),
        }
    }

    // ── lifecycle topic ─────────────────────────────────────────

    pub fn publish_lifecycle(&self, event: EngineEvent) {
        // No subscribers is fine; the cache was already updated.
        let _ = self.lifecycle.send(event);
    }

    pub fn subscribe_lifecycle(&self) -> Subscription<EngineEvent> {
        Subscription {
            rx: self.lifecycle.subscribe(),
        }
    }

    // ── per-service topics ──────────────────────────────────────

    pub fn publish_log(&self, service_id: i64, line: LogLine) {
        if let Some(topic) = self.logs.get(&service_id) {
            let _ = topic.send(line);
        }
    }

    pub fn subscribe_logs(&self, service_id: i64) -> Subscription<LogLine> {
        let topic = self
            .logs
            .entry(service_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Subscription {
            rx: topic.subscribe(),
        }
    }

    pub fn publish_stats(&self, service_id: i64, sample: StatsSample) {
        if let Some(topic) = self.stats.get(&service_id) {
            let _ = topic.send(sample);
        }
    }

    pub fn subscribe_stats(&self, service_id: i64) -> Subscription<StatsSample> {
        let topic = self
            .stats
            .entry(service_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Subscription {
            rx: topic.subscribe(),
        }
    }

    // ── per-job log topics ──────────────────────────────────────

    pub fn publish_job_log(&self, job_id: i64, chunk: Bytes) {
        if let Some(topic) = self.job_logs.get(&job_id) {
            let _ = topic.send(chunk);
        }
    }

    pub fn subscribe_job_logs(&self, job_id: i64) -> Subscription<Bytes> {
        let topic = self
            .job_logs
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Subscription {
            rx: topic.subscribe(),
        }
    }

    /// Drop per-entity topics when the entity is gone; open subscriptions
    /// observe `Closed` and end.
    pub fn drop_service_topics(&self, service_id: i64) {
        self.logs.remove(&service_id);
        self.stats.remove(&service_id);
    }

    pub fn drop_job_topic(&self, job_id: i64) {
        self.job_logs.remove(&job_id);
    }

    /// Shutdown: closes every per-entity topic. The lifecycle topic closes
    /// when the bus itself is dropped.
    pub fn close(&self) {
        self.logs.clear();
        self.stats.clear();
        self.job_logs.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
