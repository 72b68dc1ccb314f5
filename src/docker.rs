//! Presence check for the managed application container

use anyhow::Context;
use bollard::Docker;
use std::time::Duration;
use tracing::debug;

/// Seconds bollard waits on a daemon request
const DOCKER_TIMEOUT_SECS: u64 = 10;

/// Connection to the Docker daemon used to look up the app container
pub struct ContainerLookup {
    client: Docker,
}

impl ContainerLookup {
    /// Connect to `docker_host` if given, otherwise to whatever `DOCKER_HOST`
    /// or the local socket provides, and check the daemon answers.
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = match docker_host {
            Some(host) => client_for_host(host)?,
            None => Docker::connect_with_defaults().context("Cannot connect to Docker daemon")?,
        };

        client
            .ping()
            .await
            .context("Docker daemon is not responding")?;
        Ok(Self { client })
    }

    /// Whether a container with this name exists, running or not
    pub async fn exists(&self, name: &str) -> anyhow::Result<bool> {
        match self.client.inspect_container(name, None).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = name, "Container not found");
                Ok(false)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to inspect container '{}'", name)),
        }
    }
}

fn client_for_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .with_context(|| format!("Cannot connect to Docker socket '{}'", socket))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .with_context(|| format!("Cannot connect to Docker at '{}'", host))
    } else {
        anyhow::bail!(
            "Invalid docker_host '{}': expected unix:///path/to/socket or tcp://host:port",
            host
        )
    }
}

/// Upper bound for one container lookup including connection setup
pub fn lookup_timeout() -> Duration {
    Duration::from_secs(DOCKER_TIMEOUT_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_host_scheme() {
        let err = client_for_host("ftp://docker").unwrap_err();
        assert!(err.to_string().contains("Invalid docker_host"));
    }

    #[tokio::test]
    async fn test_connect_fails_for_missing_socket() {
        let tmp = tempfile::TempDir::new().unwrap();
        let host = format!("unix://{}", tmp.path().join("docker.sock").display());
        assert!(ContainerLookup::connect(Some(&host)).await.is_err());
    }
}
