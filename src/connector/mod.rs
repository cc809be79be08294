//! Host connectors.
//!
//! One connector per transport (local socket, remote daemon, SSH tunnel,
//! remote agent) behind a common [`HostConnector`] trait.

mod agent;
mod docker;
mod ssh;

pub use agent::*;
pub use docker::*;
pub use ssh::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::db::{ContainerSnapshot, Host, HostStatus, ResourceStats, RuntimeState};

/// Connector error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("host call timed out after {0:?}")]
    Timeout(Duration),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl ConnectorError {
    /// Host status this failure leaves the host in.
    pub fn host_status(&self) -> HostStatus {
        match self {
            Self::Auth(_) => HostStatus::AuthFailed,
            Self::InvalidAddress(_) => HostStatus::Misconfigured,
            _ => HostStatus::Offline,
        }
    }

    /// Permanent failures need operator action; they are still retried every cycle.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::InvalidAddress(_))
    }
}

/// How a host is reached, derived from its address scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Docker Engine API over a local unix socket.
    Unix(String),
    /// Docker Engine API over TCP, `host:port`.
    Tcp(String),
    /// Docker Engine API through an SSH-forwarded socket.
    Ssh {
        user: Option<String>,
        host: String,
        port: Option<u16>,
    },
    /// Remote agent HTTP API, normalized base URL without trailing slash.
    Agent(String),
}

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

impl Transport {
    /// Select the transport for a host address.
    pub fn from_address(address: &str) -> Result<Self, ConnectorError> {
        let address = address.trim();

        if address.is_empty() || address == "local" {
            return Ok(Self::Unix(DEFAULT_SOCKET.to_string()));
        }

        if let Some(path) = address.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ConnectorError::InvalidAddress(address.to_string()));
            }
            return Ok(Self::Unix(path.to_string()));
        }

        if let Some(rest) = address.strip_prefix("tcp://") {
            let rest = rest.trim_end_matches('/');
            if rest.is_empty() {
                return Err(ConnectorError::InvalidAddress(address.to_string()));
            }
            return Ok(Self::Tcp(rest.to_string()));
        }

        if let Some(rest) = address.strip_prefix("ssh://") {
            return parse_ssh(rest).ok_or_else(|| ConnectorError::InvalidAddress(address.to_string()));
        }

        if let Some(rest) = address.strip_prefix("agent://") {
            let rest = rest.trim_end_matches('/');
            if rest.is_empty() {
                return Err(ConnectorError::InvalidAddress(address.to_string()));
            }
            if rest.starts_with("http://") || rest.starts_with("https://") {
                return Ok(Self::Agent(rest.to_string()));
            }
            return Ok(Self::Agent(format!("http://{}", rest)));
        }

        if address.starts_with("http://") || address.starts_with("https://") {
            return Ok(Self::Agent(address.trim_end_matches('/').to_string()));
        }

        Err(ConnectorError::InvalidAddress(format!(
            "unsupported address format: {}",
            address
        )))
    }
}

fn parse_ssh(rest: &str) -> Option<Transport> {
    let rest = rest.trim_end_matches('/');
    let (user, hostport) = match rest.split_once('@') {
        Some((u, h)) if !u.is_empty() => (Some(u.to_string()), h),
        Some(_) => return None,
        None => (None, rest),
    };
    let (host, port) = match hostport.rsplit_once(':') {
        Some((h, p)) => (h, Some(p.parse::<u16>().ok()?)),
        None => (hostport, None),
    };
    if host.is_empty() {
        return None;
    }
    Some(Transport::Ssh {
        user,
        host: host.to_string(),
        port,
    })
}

/// An image present on a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Size", default)]
    pub size: i64,
    #[serde(rename = "Created", default)]
    pub created: i64,
}

/// Capabilities every transport exposes for one host.
///
/// Callers wrap every call in their own timeout.
#[async_trait]
pub trait HostConnector: Send + Sync {
    /// All containers on the host, stopped ones included.
    async fn list_containers(&self) -> Result<Vec<ContainerSnapshot>, ConnectorError>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerSnapshot, ConnectorError>;

    /// One resource sample for a running container.
    async fn stats(&self, container_id: &str) -> Result<ResourceStats, ConnectorError>;

    async fn start(&self, container_id: &str) -> Result<(), ConnectorError>;

    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<(), ConnectorError>;

    async fn restart(&self, container_id: &str, timeout: Duration) -> Result<(), ConnectorError>;

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), ConnectorError>;

    async fn logs(&self, container_id: &str, tail: &str) -> Result<String, ConnectorError>;

    async fn list_images(&self) -> Result<Vec<ImageInfo>, ConnectorError>;

    async fn remove_image(&self, image_id: &str, force: bool) -> Result<(), ConnectorError>;

    /// Remove dangling images and return the bytes reclaimed.
    async fn prune_images(&self) -> Result<u64, ConnectorError>;

    async fn verify_connection(&self) -> Result<(), ConnectorError>;
}

/// Builds a connector for a host. `timeout` bounds each call the connector
/// makes and is read from the current settings on every cycle.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn connect(&self, host: &Host, timeout: Duration) -> Result<Box<dyn HostConnector>, ConnectorError>;
}

/// Factory that picks the connector implementation from the address scheme.
#[derive(Clone)]
pub struct TransportFactory {
    http: reqwest::Client,
}

impl TransportFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ConnectorFactory for TransportFactory {
    async fn connect(&self, host: &Host, timeout: Duration) -> Result<Box<dyn HostConnector>, ConnectorError> {
        match Transport::from_address(&host.address)? {
            Transport::Unix(path) => Ok(Box::new(DockerConnector::unix(host.id, &path, timeout)?)),
            Transport::Tcp(addr) => Ok(Box::new(DockerConnector::tcp(host.id, &addr, timeout)?)),
            Transport::Ssh { user, host: ssh_host, port } => {
                let tunnel = SshTunnel::open(user.as_deref(), &ssh_host, port, timeout).await?;
                Ok(Box::new(DockerConnector::tunnelled(host.id, tunnel, timeout)?))
            }
            Transport::Agent(base) => Ok(Box::new(AgentConnector::new(
                self.http.clone(),
                host.id,
                &base,
                &host.agent_token,
                timeout,
            ))),
        }
    }
}

/// Run one observation of a host: list containers and, when asked, sample
/// resource usage of the running ones that came back without stats.
///
/// A failed stats call only drops that container's sample.
pub async fn observe_host(
    connector: &dyn HostConnector,
    collect_stats: bool,
) -> Result<Vec<ContainerSnapshot>, ConnectorError> {
    let mut containers = connector.list_containers().await?;

    if collect_stats {
        for c in containers.iter_mut() {
            if c.state != RuntimeState::Running || c.stats.is_some() {
                continue;
            }
            match connector.stats(&c.container_id).await {
                Ok(stats) => c.stats = Some(stats),
                Err(e) => debug!("Stats unavailable for {}: {}", c.name, e),
            }
        }
    } else {
        for c in containers.iter_mut() {
            c.stats = None;
        }
    }

    Ok(containers)
}

/// CPU percent from two cumulative samples, scaled by online CPUs.
pub fn cpu_percent(cpu_total: u64, precpu_total: u64, system: u64, presystem: u64, online_cpus: u32) -> f64 {
    let cpu_delta = cpu_total.saturating_sub(precpu_total) as f64;
    let system_delta = system.saturating_sub(presystem) as f64;
    if system_delta <= 0.0 || cpu_delta <= 0.0 {
        return 0.0;
    }
    let cpus = if online_cpus == 0 { 1.0 } else { online_cpus as f64 };
    (cpu_delta / system_delta) * cpus * 100.0
}

pub fn memory_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    usage as f64 / limit as f64 * 100.0
}
