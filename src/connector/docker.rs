//! Docker Engine API connector (local socket, TCP, SSH tunnel).

use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum};
use bollard::query_parameters::{
    InspectContainerOptions, InspectContainerOptionsBuilder, ListContainersOptionsBuilder,
    ListImagesOptionsBuilder, LogsOptionsBuilder, PruneImagesOptions, RemoveContainerOptionsBuilder,
    RemoveImageOptionsBuilder, RestartContainerOptionsBuilder, StartContainerOptions,
    StatsOptionsBuilder, StopContainerOptionsBuilder,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::Utc;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{cpu_percent, memory_percent, ConnectorError, HostConnector, ImageInfo, SshTunnel};
use crate::db::{ContainerSnapshot, ImageRef, PortMapping, ResourceStats, RuntimeState, VolumeMount};

impl From<ContainerStateStatusEnum> for RuntimeState {
    fn from(status: ContainerStateStatusEnum) -> Self {
        match status {
            ContainerStateStatusEnum::EMPTY => Self::Unknown,
            ContainerStateStatusEnum::CREATED => Self::Created,
            ContainerStateStatusEnum::RUNNING => Self::Running,
            ContainerStateStatusEnum::PAUSED => Self::Paused,
            ContainerStateStatusEnum::RESTARTING => Self::Restarting,
            ContainerStateStatusEnum::REMOVING => Self::Removing,
            ContainerStateStatusEnum::EXITED => Self::Exited,
            ContainerStateStatusEnum::DEAD => Self::Dead,
        }
    }
}

/// Connector speaking the Docker Engine API through bollard.
pub struct DockerConnector {
    docker: Docker,
    host_id: i64,
    timeout: Duration,
    // Keeps the forwarded socket alive for SSH hosts.
    _tunnel: Option<SshTunnel>,
}

impl DockerConnector {
    /// Connect over a local unix socket.
    pub fn unix(host_id: i64, path: &str, timeout: Duration) -> Result<Self, ConnectorError> {
        let docker = Docker::connect_with_unix(path, timeout.as_secs().max(1), API_DEFAULT_VERSION)
            .map_err(|e| ConnectorError::Unreachable(e.to_string()))?;
        Ok(Self {
            docker,
            host_id,
            timeout,
            _tunnel: None,
        })
    }

    /// Connect to a remote daemon over plain TCP.
    pub fn tcp(host_id: i64, addr: &str, timeout: Duration) -> Result<Self, ConnectorError> {
        let url = format!("http://{}", addr);
        let docker = Docker::connect_with_http(&url, timeout.as_secs().max(1), API_DEFAULT_VERSION)
            .map_err(|e| ConnectorError::InvalidAddress(e.to_string()))?;
        Ok(Self {
            docker,
            host_id,
            timeout,
            _tunnel: None,
        })
    }

    /// Connect through an SSH-forwarded socket.
    pub fn tunnelled(host_id: i64, tunnel: SshTunnel, timeout: Duration) -> Result<Self, ConnectorError> {
        let path = tunnel.socket_path().to_string_lossy().to_string();
        let mut connector = Self::unix(host_id, &path, timeout)?;
        connector._tunnel = Some(tunnel);
        Ok(connector)
    }

    fn map_error(&self, e: bollard::errors::Error) -> ConnectorError {
        use bollard::errors::Error;
        match &e {
            Error::DockerResponseServerError {
                status_code: 401 | 403,
                message,
            } => ConnectorError::Auth(message.clone()),
            Error::DockerResponseServerError { status_code, message } => {
                ConnectorError::Api(format!("{}: {}", status_code, message))
            }
            Error::RequestTimeoutError => ConnectorError::Timeout(self.timeout),
            Error::JsonSerdeError { .. } => ConnectorError::Decode(e.to_string()),
            _ => ConnectorError::Unreachable(e.to_string()),
        }
    }

    async fn inspect_raw(&self, container_id: &str) -> Result<ContainerInspectResponse, ConnectorError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        self.docker
            .inspect_container(container_id, Some(options))
            .await
            .map_err(|e| self.map_error(e))
    }
}

/// Fill in the details only inspect reports.
fn apply_inspect(snapshot: &mut ContainerSnapshot, info: ContainerInspectResponse) {
    snapshot.restart_count = info.restart_count.map(|c| c.max(0) as u32);

    if let Some(status) = info.state.and_then(|s| s.status) {
        let state = RuntimeState::from(status);
        if state != RuntimeState::Unknown {
            snapshot.state = state;
        }
    }

    if let Some(networks) = info.network_settings.and_then(|n| n.networks) {
        let mut names: Vec<String> = networks.into_keys().collect();
        names.sort();
        snapshot.networks = names;
    }

    if let Some(mounts) = info.mounts {
        snapshot.volumes = mounts
            .into_iter()
            .map(|m| {
                let kind = m.typ.map(|t| t.to_string()).unwrap_or_default();
                // Bind mounts are identified by their source path.
                let name = if kind == "bind" {
                    m.source.unwrap_or_default()
                } else {
                    m.name.unwrap_or_default()
                };
                VolumeMount {
                    name,
                    destination: m.destination.unwrap_or_default(),
                    kind,
                    rw: m.rw.unwrap_or(false),
                }
            })
            .collect();
    }
}

#[async_trait]
impl HostConnector for DockerConnector {
    async fn list_containers(&self) -> Result<Vec<ContainerSnapshot>, ConnectorError> {
        let options = ListContainersOptionsBuilder::new().all(true).build();
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| self.map_error(e))?;

        let now = Utc::now();
        let mut result = Vec::with_capacity(summaries.len());

        for c in summaries {
            let container_id = c.id.unwrap_or_default();
            let name = c
                .names
                .and_then(|n| n.into_iter().next())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            let image = ImageRef::parse(&c.image.unwrap_or_default(), c.image_id.as_deref());
            let state = c
                .state
                .map(|s| RuntimeState::parse(&s.to_string()))
                .unwrap_or(RuntimeState::Unknown);

            let mut snapshot = ContainerSnapshot::new(self.host_id, &container_id, &name, image, state);
            snapshot.status = c.status.unwrap_or_default();
            snapshot.observed_at = now;
            snapshot.labels = c.labels.unwrap_or_default().into_iter().collect::<BTreeMap<_, _>>();
            snapshot.ports = c
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| {
                    let protocol = p.typ.map(|t| t.to_string()).filter(|t| !t.is_empty());
                    PortMapping {
                        private_port: p.private_port as u16,
                        public_port: p.public_port.map(|v| v as u16),
                        protocol: protocol.unwrap_or_else(|| "tcp".to_string()),
                        ip: p.ip,
                    }
                })
                .collect();

            match self.inspect_raw(&container_id).await {
                Ok(info) => apply_inspect(&mut snapshot, info),
                Err(e) => debug!("Inspect failed for {}: {}", name, e),
            }

            result.push(snapshot);
        }

        Ok(result)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerSnapshot, ConnectorError> {
        let info = self.inspect_raw(container_id).await?;

        let name = info
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        let reference = info
            .config
            .as_ref()
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        let labels = info
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let image = ImageRef::parse(&reference, info.image.as_deref());
        let id = info.id.clone().unwrap_or_else(|| container_id.to_string());

        let mut snapshot = ContainerSnapshot::new(self.host_id, &id, &name, image, RuntimeState::Unknown);
        snapshot.labels = labels.into_iter().collect();
        apply_inspect(&mut snapshot, info);
        Ok(snapshot)
    }

    async fn stats(&self, container_id: &str) -> Result<ResourceStats, ConnectorError> {
        let options = StatsOptionsBuilder::new().stream(false).one_shot(false).build();
        let mut stream = Box::pin(self.docker.stats(container_id, Some(options)));

        let sample = match stream.next().await {
            Some(Ok(s)) => s,
            Some(Err(e)) => return Err(self.map_error(e)),
            None => return Err(ConnectorError::Api("empty stats stream".to_string())),
        };

        let cpu = sample.cpu_stats.as_ref();
        let precpu = sample.precpu_stats.as_ref();

        let cpu_total = cpu
            .and_then(|c| c.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0) as u64;
        let precpu_total = precpu
            .and_then(|c| c.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0) as u64;
        let system = cpu.and_then(|c| c.system_cpu_usage).unwrap_or(0) as u64;
        let presystem = precpu.and_then(|c| c.system_cpu_usage).unwrap_or(0) as u64;
        let online_cpus = cpu.and_then(|c| c.online_cpus).unwrap_or(0) as u32;

        let memory = sample.memory_stats.as_ref();
        let memory_usage = memory.and_then(|m| m.usage).unwrap_or(0) as u64;
        let memory_limit = memory.and_then(|m| m.limit).unwrap_or(0) as u64;

        Ok(ResourceStats {
            cpu_percent: cpu_percent(cpu_total, precpu_total, system, presystem, online_cpus),
            memory_usage,
            memory_limit,
            memory_percent: memory_percent(memory_usage, memory_limit),
        })
    }

    async fn start(&self, container_id: &str) -> Result<(), ConnectorError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<(), ConnectorError> {
        let options = StopContainerOptionsBuilder::new().t(timeout.as_secs() as i32).build();
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(_) => Ok(()),
            // Already stopped.
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(self.map_error(e)),
        }
    }

    async fn restart(&self, container_id: &str, timeout: Duration) -> Result<(), ConnectorError> {
        let options = RestartContainerOptionsBuilder::new().t(timeout.as_secs() as i32).build();
        self.docker
            .restart_container(container_id, Some(options))
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), ConnectorError> {
        let options = RemoveContainerOptionsBuilder::new().force(force).build();
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn logs(&self, container_id: &str, tail: &str) -> Result<String, ConnectorError> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(tail)
            .build();
        let mut stream = Box::pin(self.docker.logs(container_id, Some(options)));

        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_error(e))?;
            out.push_str(&chunk.to_string());
        }
        Ok(out)
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>, ConnectorError> {
        let options = ListImagesOptionsBuilder::new().build();
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(images
            .into_iter()
            .map(|img| ImageInfo {
                id: img.id,
                repo_tags: img.repo_tags,
                size: img.size,
                created: img.created,
            })
            .collect())
    }

    async fn remove_image(&self, image_id: &str, force: bool) -> Result<(), ConnectorError> {
        let options = RemoveImageOptionsBuilder::new().force(force).build();
        self.docker
            .remove_image(image_id, Some(options), None)
            .await
            .map(|_| ())
            .map_err(|e| self.map_error(e))
    }

    async fn prune_images(&self) -> Result<u64, ConnectorError> {
        let resp = self
            .docker
            .prune_images(None::<PruneImagesOptions>)
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(resp.space_reclaimed.unwrap_or(0).max(0) as u64)
    }

    async fn verify_connection(&self) -> Result<(), ConnectorError> {
        self.docker.ping().await.map(|_| ()).map_err(|e| self.map_error(e))
    }
}
