// Docker manager - the container runtime surface the pool drives

use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker connection error: {0}")]
    Connection(#[from] bollard::errors::Error),

    #[error("no container state in inspect response")]
    MissingState,
}

impl DockerError {
    /// True when the daemon reports the container as gone, which the pool
    /// treats as "not running" rather than as a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DockerError::Connection(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })
        )
    }
}

#[derive(Debug)]
pub struct DockerManager {
    docker: Docker,
}

impl DockerManager {
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Creates a named container and returns its runtime-assigned id plus any
    /// daemon warnings.
    pub async fn create_container(
        &self,
        name: &str,
        mut config: Config<String>,
        host_config: HostConfig,
    ) -> Result<(String, Vec<String>), DockerError> {
        config.host_config = Some(host_config);

        let options = Some(CreateContainerOptions {
            name,
            platform: None,
        });

        let response = self.docker.create_container(options, config).await?;

        Ok((response.id, response.warnings))
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Whether the container currently reports a running state.
    pub async fn is_running(&self, id: &str) -> Result<bool, DockerError> {
        let response = self.docker.inspect_container(id, None).await?;
        let state = response.state.ok_or(DockerError::MissingState)?;

        Ok(state.running.unwrap_or(false))
    }

    /// Removes a container regardless of its running state. Failures are
    /// logged, not returned: removal is always best-effort on a container we
    /// no longer want.
    pub async fn force_remove(&self, id: &str) {
        tracing::info!(id, "removing container");

        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });

        if let Err(err) = self.docker.remove_container(id, options).await {
            tracing::error!(%err, "unable to remove container");
        }
    }
}
