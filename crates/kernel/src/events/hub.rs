//! Per-service stream pumps: one engine log/stats stream per service,
//! fanned out to any number of bus subscribers.
//!
//! Pumps start lazily on first subscription and exit when their engine
//! stream ends or when nobody is listening anymore.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{EventBus, Subscription};
use crate::engine::{ContainerEngine, LogLine, StatsSample};

pub struct StreamHub {
    engine: Arc<dyn ContainerEngine>,
    bus: Arc<EventBus>,
    log_pumps: DashMap<i64, JoinHandle<()>>,
    stats_pumps: DashMap<i64, JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl StreamHub {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        bus: Arc<EventBus>,
        shutdown: CancellationToken,
    ) -> Arc<StreamHub> {
        Arc::new(StreamHub {
            engine,
            bus,
            log_pumps: DashMap::new(),
            stats_pumps: DashMap::new(),
            shutdown,
        })
    }

    pub fn subscribe_logs(
        self: &Arc<Self>,
        service_id: i64,
        container_id: &str,
    ) -> Subscription<LogLine> {
        let subscription = self.bus.subscribe_logs(service_id);
        self.ensure_log_pump(service_id, container_id);
        subscription
    }

    pub fn subscribe_stats(
        self: &Arc<Self>,
        service_id: i64,
        container_id: &str,
    ) -> Subscription<StatsSample> {
        let subscription = self.bus.subscribe_stats(service_id);
        self.ensure_stats_pump(service_id, container_id);
        subscription
    }

    fn ensure_log_pump(self: &Arc<Self>, service_id: i64, container_id: &str) {
        if let Some(existing) = self.log_pumps.get(&service_id) {
            if !existing.is_finished() {
                return;
            }
        }
        let hub = Arc::clone(self);
        let container_id = container_id.to_string();
        let handle = tokio::spawn(async move {
            let mut stream = hub.engine.log_stream(&container_id, true);
            loop {
                tokio::select! {
                    _ = hub.shutdown.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(line)) => hub.bus.publish_log(service_id, line),
                        Some(Err(e)) => {
                            tracing::debug!(service_id, error = %e, "log stream error");
                            break;
                        }
                        None => break,
                    }
                }
            }
            hub.log_pumps.remove(&service_id);
        });
        self.log_pumps.insert(service_id, handle);
    }

    fn ensure_stats_pump(self: &Arc<Self>, service_id: i64, container_id: &str) {
        if let Some(existing) = self.stats_pumps.get(&service_id) {
            if !existing.is_finished() {
                return;
            }
        }
        let hub = Arc::clone(self);
        let container_id = container_id.to_string();
        let handle = tokio::spawn(async move {
            let mut stream = hub.engine.stats_stream(&container_id);
            loop {
                tokio::select! {
                    _ = hub.shutdown.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(sample)) => hub.bus.publish_stats(service_id, sample),
                        Some(Err(e)) => {
                            tracing::debug!(service_id, error = %e, "stats stream error");
                            break;
                        }
                        None => break,
                    }
                }
            }
            hub.stats_pumps.remove(&service_id);
        });
        self.stats_pumps.insert(service_id, handle);
    }
}
