//! Engine event pump — owns the single engine event subscription.
//!
//! Parses lifecycle events, updates the status cache, publishes to the
//! bus, then feeds the state machine — in that order, so cache reads
//! after a notification are never stale. On stream loss the pump flips
//! the engine-link flag (new lifecycle commands block on it) and
//! reconnects with exponential backoff capped at 30 s.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{EventBus, StatusCache};
use crate::engine::{ContainerEngine, EngineEvent, EventAction};
use crate::lifecycle::LifecycleManager;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct EventPump {
    engine: Arc<dyn ContainerEngine>,
    bus: Arc<EventBus>,
    cache: Arc<StatusCache>,
    machine: Arc<LifecycleManager>,
    connected: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl EventPump {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        bus: Arc<EventBus>,
        cache: Arc<StatusCache>,
        machine: Arc<LifecycleManager>,
        connected: watch::Sender<bool>,
        shutdown: CancellationToken,
    ) -> Self {
        EventPump {
            engine,
            bus,
            cache,
            machine,
            connected,
            shutdown,
        }
    }

    pub async fn run(self) {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let mut stream = self.engine.event_stream();
            self.connected.send_replace(true);
            tracing::info!("engine event stream established");

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            backoff = BACKOFF_INITIAL;
                            self.dispatch(event).await;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "engine event stream error");
                            break;
                        }
                        None => {
                            tracing::warn!("engine event stream ended");
                            break;
                        }
                    }
                }
            }

            // Unknown mode: preserve state, queue commands, reconnect.
            self.connected.send_replace(false);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn dispatch(&self, event: EngineEvent) {
        if let Some(service_id) = event.service_id {
            if event.action == EventAction::Destroy {
                // The container is gone; a stale cache entry would outlive
                // the service row on delete.
                self.cache.remove(service_id);
            } else if let Some(state) = observed_state(event.action) {
                self.cache
                    .update(service_id, Some(event.container_id.clone()), state, event.exit_code);
            }
        }
        self.bus.publish_lifecycle(event.clone());
        self.machine.observe_event(&event).await;
    }
}

/// Cache vocabulary for an engine action. `kill` carries no settled state
/// (a `die` always follows); `destroy` is handled as a cache removal.
fn observed_state(action: EventAction) -> Option<&'static str> {
    match action {
        EventAction::Create => Some("created"),
        EventAction::Start => Some("running"),
        EventAction::Die | EventAction::OomKill => Some("exited"),
        EventAction::Stop => Some("stopped"),
        EventAction::Kill | EventAction::Destroy => None,
    }
}
