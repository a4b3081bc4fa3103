//! Event domain — engine lifecycle events for managed containers.

use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use serde::Serialize;

use super::client::{DockerEngine, EngineError};
use super::{LABEL_MANAGED, LABEL_SERVICE_ID, MANAGED_VALUE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Create,
    Start,
    Die,
    Stop,
    Kill,
    OomKill,
    Destroy,
}

impl EventAction {
    fn parse(action: &str) -> Option<EventAction> {
        // `exec_die` and friends carry a colon-suffixed detail; the verb
        // is everything before it.
        let verb = action.split(':').next().unwrap_or(action);
        match verb {
            "create" => Some(EventAction::Create),
            "start" => Some(EventAction::Start),
            "die" => Some(EventAction::Die),
            "stop" => Some(EventAction::Stop),
            "kill" => Some(EventAction::Kill),
            "oom" => Some(EventAction::OomKill),
            "destroy" => Some(EventAction::Destroy),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Create => "create",
            EventAction::Start => "start",
            EventAction::Die => "die",
            EventAction::Stop => "stop",
            EventAction::Kill => "kill",
            EventAction::OomKill => "oom",
            EventAction::Destroy => "destroy",
        }
    }
}

/// A lifecycle event for a managed container, in engine-reported order.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub container_id: String,
    /// Parsed from the service label; absent on containers created before
    /// adoption completed.
    pub service_id: Option<i64>,
    pub action: EventAction,
    /// Exit code, on `die` events.
    pub exit_code: Option<i64>,
    pub at: DateTime<Utc>,
}

impl DockerEngine {
    /// Subscribe to lifecycle events for managed containers. The stream is
    /// infinite and non-restartable; on transport loss it ends and the
    /// event pump reconnects with backoff.
    pub(super) fn managed_event_stream(
        &self,
    ) -> BoxStream<'static, Result<EngineEvent, EngineError>> {
        use bollard::query_parameters::EventsOptionsBuilder;
        use std::collections::HashMap;

        let label = format!("{LABEL_MANAGED}={MANAGED_VALUE}");
        let mut filters: HashMap<&str, Vec<&str>> = HashMap::new();
        filters.insert("type", vec!["container"]);
        filters.insert("label", vec![label.as_str()]);
        let options = EventsOptionsBuilder::default().filters(&filters).build();

        // Own a client clone so the stream is 'static.
        let client = self.client.clone();
        Box::pin(async_stream::stream! {
            let mut events = client.events(Some(options));
            while let Some(result) = events.next().await {
                match result {
                    Ok(message) => {
                        if let Some(event) = convert_event(message) {
                            yield Ok(event);
                        }
                    }
                    Err(e) => {
                        yield Err(EngineError::from(e));
                        break;
                    }
                }
            }
        })
    }
}

/// Convert a raw engine event message. Returns `None` for actions the
/// kernel does not track.
fn convert_event(message: bollard::models::EventMessage) -> Option<EngineEvent> {
    let action = EventAction::parse(message.action.as_deref()?)?;
    let actor = message.actor?;
    let container_id = actor.id?;
    let attributes = actor.attributes.unwrap_or_default();

    let service_id = attributes
        .get(LABEL_SERVICE_ID)
        .and_then(|v| v.parse().ok());
    let exit_code = if action == EventAction::Die {
        attributes.get("exitCode").and_then(|v| v.parse().ok())
    } else {
        None
    };

    // Prefer nanosecond precision so event ordering survives sub-second
    // races with command completions.
    let at = message
        .time_nano
        .map(DateTime::from_timestamp_nanos)
        .or_else(|| message.time.and_then(|t| DateTime::from_timestamp(t, 0)))
        .unwrap_or_else(Utc::now);

    Some(EngineEvent {
        container_id,
        service_id,
        action,
        exit_code,
        at,
    })
}
