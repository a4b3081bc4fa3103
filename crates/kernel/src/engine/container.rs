//! Container domain — create, lifecycle, inspect, list.

use std::collections::HashMap;

use bollard::models::{
    ContainerCreateBody, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    ListContainersOptionsBuilder, RemoveContainerOptions, StopContainerOptions,
};
use chrono::DateTime;
use tokio_util::sync::CancellationToken;

use super::client::{DockerEngine, EngineError};
use super::{
    ContainerState, ContainerSummary, CreateSpec, LABEL_MANAGED, LABEL_PROJECT_ID,
    LABEL_SERVICE_ID, MANAGED_VALUE,
};

impl DockerEngine {
    pub(super) async fn create(
        &self,
        spec: &CreateSpec,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        // Idempotency: a previous attempt may have created the container
        // already. The deterministic name plus the service label makes the
        // match safe.
        if let Some(existing) = self.find_by_service_label(spec.service_id).await? {
            return Ok(existing);
        }

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), MANAGED_VALUE.to_string());
        labels.insert(LABEL_SERVICE_ID.to_string(), spec.service_id.to_string());
        labels.insert(LABEL_PROJECT_ID.to_string(), spec.project_id.to_string());

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: Vec<String> = Vec::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port.container);
            exposed_ports.push(key.clone());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.host.to_string()),
                }]),
            );
        }

        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|v| {
                if v.ro {
                    format!("{}:{}:ro", v.host, v.container)
                } else {
                    format!("{}:{}", v.host, v.container)
                }
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            binds: if binds.is_empty() { None } else { Some(binds) },
            // Automatic restarts are the engine's job; the state machine
            // only detects this budget being exhausted.
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ON_FAILURE),
                maximum_retry_count: Some(spec.restart_max_retries as i64),
            }),
            // The project network is attached after create, so aliases ride
            // along with the endpoint config.
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(bollard::query_parameters::CreateContainerOptions {
            name: Some(spec.container_name.clone()),
            ..Default::default()
        });

        let response = self
            .cancellable(cancel, self.client.create_container(options, body))
            .await?;
        Ok(response.id)
    }

    pub(super) async fn start(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.cancellable(cancel, self.client.start_container(container_id, None))
            .await
    }

    pub(super) async fn stop(
        &self,
        container_id: &str,
        grace_secs: u32,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let options = Some(StopContainerOptions {
            t: Some(grace_secs as i32),
            ..Default::default()
        });
        self.cancellable(cancel, self.client.stop_container(container_id, options))
            .await
    }

    pub(super) async fn remove(
        &self,
        container_id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let options = Some(RemoveContainerOptions {
            force,
            v: false,
            ..Default::default()
        });
        self.cancellable(cancel, self.client.remove_container(container_id, options))
            .await
    }

    pub(super) async fn inspect(&self, container_id: &str) -> Result<ContainerState, EngineError> {
        let details = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(EngineError::from)?;

        let state = details.state.as_ref();
        let started_at = state
            .and_then(|s| s.started_at.as_deref())
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|dt| dt.to_utc())
            // Engine reports zero-time for never-started containers.
            .filter(|dt| dt.timestamp() > 0);

        // The container's own address. When attached to several networks
        // the project network's endpoint wins; the default bridge is the
        // fallback.
        let ip_address = details
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .and_then(|networks| {
                let endpoint = networks
                    .iter()
                    .find(|(name, _)| name.starts_with("proj_"))
                    .or_else(|| networks.iter().next())
                    .map(|(_, endpoint)| endpoint)?;
                endpoint.ip_address.clone().filter(|ip| !ip.is_empty())
            });

        Ok(ContainerState {
            id: details.id.unwrap_or_else(|| container_id.to_string()),
            status: state
                .and_then(|s| s.status.as_ref())
                .map(|s| s.to_string().to_lowercase())
                .unwrap_or_else(|| "unknown".into()),
            running: state.and_then(|s| s.running).unwrap_or(false),
            exit_code: state.and_then(|s| s.exit_code),
            started_at,
            ip_address,
            labels: details.config.and_then(|c| c.labels).unwrap_or_default(),
        })
    }

    /// List containers, split by presence of the managed label.
    pub(super) async fn list_by_label(
        &self,
        managed: bool,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let label = format!("{LABEL_MANAGED}={MANAGED_VALUE}");
        let mut builder = ListContainersOptionsBuilder::default().all(true);
        let mut filters = HashMap::new();
        if managed {
            filters.insert("label", vec![label.as_str()]);
            builder = builder.filters(&filters);
        }
        let containers = self
            .client
            .list_containers(Some(builder.build()))
            .await
            .map_err(EngineError::from)?;

        let summaries = containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .as_deref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/'))
                    .unwrap_or("unknown")
                    .to_string(),
                image: c.image.unwrap_or_default(),
                state: c
                    .state
                    .map(|s| s.to_string().to_lowercase())
                    .unwrap_or_else(|| "unknown".into()),
                labels: c.labels.unwrap_or_default(),
            })
            .filter(|c| {
                let has_label =
                    c.labels.get(LABEL_MANAGED).map(String::as_str) == Some(MANAGED_VALUE);
                has_label == managed
            })
            .collect();
        Ok(summaries)
    }

    /// Locate the container bound to a service id via its label, if any.
    pub(super) async fn find_by_service_label(
        &self,
        service_id: i64,
    ) -> Result<Option<String>, EngineError> {
        let label = format!("{LABEL_SERVICE_ID}={service_id}");
        let mut filters = HashMap::new();
        filters.insert("label", vec![label.as_str()]);
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(EngineError::from)?;
        Ok(containers.into_iter().next().and_then(|c| c.id))
    }
}
