//! Network domain — lazy project networks, alias attachment.

use std::collections::HashMap;

use bollard::models::{EndpointSettings, NetworkConnectRequest, NetworkCreateRequest};

use super::client::{DockerEngine, EngineError};
use super::{LABEL_MANAGED, LABEL_PROJECT_ID, MANAGED_VALUE};

impl DockerEngine {
    /// Create the project's bridge network if it does not exist yet.
    pub(super) async fn ensure_bridge_network(
        &self,
        name: &str,
        project_id: i64,
    ) -> Result<(), EngineError> {
        match self
            .client
            .inspect_network(
                name,
                None::<bollard::query_parameters::InspectNetworkOptions>,
            )
            .await
        {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(EngineError::from(e)),
        }

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), MANAGED_VALUE.to_string());
        labels.insert(LABEL_PROJECT_ID.to_string(), project_id.to_string());

        let request = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            labels: Some(labels),
            ..Default::default()
        };

        match self.client.create_network(request).await {
            Ok(_) => {
                tracing::info!(network = %name, project_id, "created project network");
                Ok(())
            }
            // Lost a create race with a concurrent start; the network exists.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(EngineError::from(e)),
        }
    }

    /// Attach a container with its service aliases. Idempotent: "already
    /// connected" is success.
    pub(super) async fn connect_with_aliases(
        &self,
        network: &str,
        container_id: &str,
        aliases: &[String],
    ) -> Result<(), EngineError> {
        let request = NetworkConnectRequest {
            container: container_id.to_string(),
            endpoint_config: Some(EndpointSettings {
                aliases: Some(aliases.to_vec()),
                ..Default::default()
            }),
        };

        match self.client.connect_network(network, request).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { message, .. })
                if message.contains("already exists in network") =>
            {
                Ok(())
            }
            Err(e) => Err(EngineError::from(e)),
        }
    }
}
