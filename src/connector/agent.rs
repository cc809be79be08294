//! Remote agent connector.
//!
//! The agent exposes a small HTTP API next to the Docker daemon of a host
//! and authenticates every request with the `X-API-Token` header.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{ConnectorError, HostConnector, ImageInfo};
use crate::db::{ContainerSnapshot, ImageRef, PortMapping, ResourceStats, RuntimeState, VolumeMount};

/// Container record as reported by the agent.
#[derive(Debug, Deserialize)]
struct AgentContainer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    image_id: Option<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    status: String,
    // Older agents do not report the restart counter.
    #[serde(default)]
    restart_count: Option<u32>,
    #[serde(default)]
    ports: Option<Vec<PortMapping>>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    networks: Option<Vec<String>>,
    #[serde(default)]
    volumes: Option<Vec<VolumeMount>>,
    #[serde(default)]
    cpu_percent: f64,
    #[serde(default)]
    memory_usage: i64,
    #[serde(default)]
    memory_limit: i64,
    #[serde(default)]
    memory_percent: f64,
}

impl AgentContainer {
    fn into_snapshot(self, host_id: i64) -> ContainerSnapshot {
        let stats = (self.memory_limit > 0 || self.cpu_percent > 0.0).then(|| ResourceStats {
            cpu_percent: self.cpu_percent,
            memory_usage: self.memory_usage.max(0) as u64,
            memory_limit: self.memory_limit.max(0) as u64,
            memory_percent: self.memory_percent,
        });

        let image = ImageRef::parse(&self.image, self.image_id.as_deref());
        let mut snapshot = ContainerSnapshot::new(
            host_id,
            &self.id,
            self.name.trim_start_matches('/'),
            image,
            RuntimeState::parse(&self.state),
        );
        snapshot.status = self.status;
        snapshot.restart_count = self.restart_count;
        snapshot.ports = self.ports.unwrap_or_default();
        snapshot.labels = self.labels.unwrap_or_default();
        snapshot.networks = self.networks.unwrap_or_default();
        snapshot.volumes = self.volumes.unwrap_or_default();
        snapshot.stats = stats;
        snapshot.observed_at = Utc::now();
        snapshot
    }
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    #[serde(default)]
    logs: String,
}

#[derive(Debug, Deserialize)]
struct PruneResponse {
    #[serde(default)]
    space_reclaimed: f64,
}

/// Connector for hosts running the fleetwatch agent.
pub struct AgentConnector {
    client: reqwest::Client,
    host_id: i64,
    base_url: String,
    token: String,
    timeout: Duration,
}

impl AgentConnector {
    pub fn new(client: reqwest::Client, host_id: i64, base_url: &str, token: &str, timeout: Duration) -> Self {
        Self {
            client,
            host_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            timeout,
        }
    }

    async fn request(&self, method: Method, path: &str) -> Result<reqwest::Response, ConnectorError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .request(method, &url)
            .header("X-API-Token", &self.token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ConnectorError::Auth(format!("agent returned status {}", status.as_u16())));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ConnectorError::Api(format!(
                "agent returned status {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConnectorError> {
        let resp = self.request(Method::GET, path).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ConnectorError::Decode(e.to_string()))
    }

    async fn find(&self, container_id: &str) -> Result<ContainerSnapshot, ConnectorError> {
        self.list_containers()
            .await?
            .into_iter()
            .find(|c| c.container_id == container_id || c.container_id.starts_with(container_id))
            .ok_or_else(|| ConnectorError::Api(format!("container {} not found", container_id)))
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> ConnectorError {
    if e.is_timeout() {
        ConnectorError::Timeout(timeout)
    } else if e.is_builder() {
        ConnectorError::InvalidAddress(e.to_string())
    } else if e.is_decode() {
        ConnectorError::Decode(e.to_string())
    } else {
        ConnectorError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl HostConnector for AgentConnector {
    async fn list_containers(&self) -> Result<Vec<ContainerSnapshot>, ConnectorError> {
        let containers: Vec<AgentContainer> = self.get_json("/api/containers").await?;
        Ok(containers
            .into_iter()
            .map(|c| c.into_snapshot(self.host_id))
            .collect())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerSnapshot, ConnectorError> {
        self.find(container_id).await
    }

    async fn stats(&self, container_id: &str) -> Result<ResourceStats, ConnectorError> {
        self.find(container_id)
            .await?
            .stats
            .ok_or_else(|| ConnectorError::Api("agent reported no stats".to_string()))
    }

    async fn start(&self, container_id: &str) -> Result<(), ConnectorError> {
        self.request(Method::POST, &format!("/api/containers/{}/start", container_id))
            .await
            .map(|_| ())
    }

    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<(), ConnectorError> {
        let path = format!("/api/containers/{}/stop?timeout={}", container_id, timeout.as_secs());
        self.request(Method::POST, &path).await.map(|_| ())
    }

    async fn restart(&self, container_id: &str, timeout: Duration) -> Result<(), ConnectorError> {
        let path = format!("/api/containers/{}/restart?timeout={}", container_id, timeout.as_secs());
        self.request(Method::POST, &path).await.map(|_| ())
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), ConnectorError> {
        let path = format!("/api/containers/{}/remove?force={}", container_id, force);
        self.request(Method::DELETE, &path).await.map(|_| ())
    }

    async fn logs(&self, container_id: &str, tail: &str) -> Result<String, ConnectorError> {
        let tail: String = tail.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        let resp: LogsResponse = self
            .get_json(&format!("/api/containers/{}/logs?tail={}", container_id, tail))
            .await?;
        Ok(resp.logs)
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>, ConnectorError> {
        self.get_json("/api/images").await
    }

    async fn remove_image(&self, image_id: &str, force: bool) -> Result<(), ConnectorError> {
        let path = format!("/api/images/{}/remove?force={}", image_id, force);
        self.request(Method::DELETE, &path).await.map(|_| ())
    }

    async fn prune_images(&self) -> Result<u64, ConnectorError> {
        let resp = self.request(Method::POST, "/api/images/prune").await?;
        let body: PruneResponse = resp
            .json()
            .await
            .map_err(|e| ConnectorError::Decode(e.to_string()))?;
        Ok(body.space_reclaimed.max(0.0) as u64)
    }

    async fn verify_connection(&self) -> Result<(), ConnectorError> {
        self.request(Method::GET, "/health").await.map(|_| ())
    }
}
