//! Image domain — registry pulls.

use futures_util::stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::client::{DockerEngine, EngineError};

impl DockerEngine {
    /// Pull an image, waiting for completion. Pull failures are surfaced
    /// as [`EngineError::ImagePullFailed`] and never retried here.
    pub(super) async fn pull(
        &self,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        use bollard::query_parameters::CreateImageOptions;

        let (from_image, tag) = match image.rsplit_once(':') {
            // A colon inside a registry host:port is not a tag.
            Some((name, tag)) if !tag.contains('/') => (name, tag),
            _ => (image, "latest"),
        };

        let options = Some(CreateImageOptions {
            from_image: Some(from_image.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        });

        let mut stream = self.client.create_image(options, None, None);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                next = stream.next() => match next {
                    Some(Ok(info)) => {
                        tracing::debug!(status = ?info.status, image, "image pull progress");
                    }
                    Some(Err(e)) => {
                        let classified = EngineError::from(e);
                        return Err(match classified {
                            EngineError::Unreachable(msg) => EngineError::Unreachable(msg),
                            other => EngineError::ImagePullFailed(other.to_string()),
                        });
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}
