//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reachability of a host as seen by the last scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Unknown,
    Online,
    Offline,
    /// The host rejected our credentials.
    AuthFailed,
    /// The address could not be turned into a connection.
    Misconfigured,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::AuthFailed => "auth_failed",
            Self::Misconfigured => "misconfigured",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => Self::Online,
            "offline" => Self::Offline,
            "auth_failed" => Self::AuthFailed,
            "misconfigured" => Self::Misconfigured,
            _ => Self::Unknown,
        }
    }
}

/// A container host to scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: i64,
    pub name: String,
    /// e.g. `unix:///var/run/docker.sock`, `tcp://host:2375`, `ssh://user@host`, `agent://host:9876`
    pub address: String,
    pub enabled: bool,
    pub collect_stats: bool,
    pub agent_token: String,
    pub status: HostStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: "unix:///var/run/docker.sock".to_string(),
            enabled: true,
            collect_stats: true,
            agent_token: String::new(),
            status: HostStatus::Unknown,
            last_seen: None,
        }
    }
}

/// Runtime state reported by the container engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An image reference split into its human-facing tag and its content digest.
///
/// The digest is the content identity of the image. The tag (`nginx:latest`)
/// can point at different content over time, so only the digest says whether
/// a container actually runs new bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImageRef {
    pub tag: String,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Split `reference` (`repo:tag`, `repo:tag@sha256:..`, `repo@sha256:..`).
    ///
    /// A digest pinned in the reference wins over `image_id`; otherwise the
    /// runtime's image ID is used as the digest.
    pub fn parse(reference: &str, image_id: Option<&str>) -> Self {
        let reference = reference.trim();
        if let Some((tag, digest)) = reference.split_once('@') {
            if !digest.is_empty() {
                return Self {
                    tag: tag.to_string(),
                    digest: Some(digest.to_string()),
                };
            }
        }

        Self {
            tag: reference.trim_end_matches('@').to_string(),
            digest: image_id
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
        }
    }

    /// What identifies the image content: the digest, or the tag when there is none.
    pub fn identity(&self) -> &str {
        self.digest.as_deref().unwrap_or(&self.tag)
    }

    /// First 12 hex characters of the digest, without the algorithm prefix.
    pub fn short_digest(&self) -> Option<String> {
        self.digest.as_deref().map(short_digest)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(d) => write!(f, "{}@{}", self.tag, d),
            None => f.write_str(&self.tag),
        }
    }
}

pub fn short_digest(digest: &str) -> String {
    let hex = digest.split_once(':').map(|(_, h)| h).unwrap_or(digest);
    hex.chars().take(12).collect()
}

/// A published container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub private_port: u16,
    #[serde(default)]
    pub public_port: Option<u16>,
    #[serde(default = "default_protocol", rename = "type")]
    pub protocol: String,
    #[serde(default)]
    pub ip: Option<String>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// A volume or bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub destination: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub rw: bool,
}

/// CPU and memory usage of a running container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
}

/// One container's observed state at one scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub host_id: i64,
    pub container_id: String,
    pub name: String,
    pub image: ImageRef,
    pub state: RuntimeState,
    pub status: String,
    /// `None` when the transport cannot report the engine's restart counter.
    pub restart_count: Option<u32>,
    pub ports: Vec<PortMapping>,
    pub networks: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    pub labels: BTreeMap<String, String>,
    pub stats: Option<ResourceStats>,
    pub observed_at: DateTime<Utc>,
}

impl ContainerSnapshot {
    pub fn new(host_id: i64, container_id: &str, name: &str, image: ImageRef, state: RuntimeState) -> Self {
        Self {
            host_id,
            container_id: container_id.to_string(),
            name: name.to_string(),
            image,
            state,
            status: String::new(),
            restart_count: None,
            ports: Vec::new(),
            networks: Vec::new(),
            volumes: Vec::new(),
            labels: BTreeMap::new(),
            stats: None,
            observed_at: Utc::now(),
        }
    }

    /// The name the lifecycle history is keyed by; falls back to the runtime ID.
    pub fn history_key(&self) -> &str {
        if self.name.is_empty() {
            &self.container_id
        } else {
            &self.name
        }
    }
}

/// Kinds of events that rules can subscribe to.
///
/// Lifecycle kinds come out of the diff engine, metric kinds out of
/// sustained-threshold evaluation of resource samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FirstSeen,
    Reappeared,
    Disappeared,
    StateChange,
    Restarted,
    ImageUpdated,
    LastSeen,
    HighCpu,
    HighMemory,
    /// Resource usage well above the baseline of the image a container ran
    /// before its last update.
    AnomalousBehavior,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstSeen => "first_seen",
            Self::Reappeared => "reappeared",
            Self::Disappeared => "disappeared",
            Self::StateChange => "state_change",
            Self::Restarted => "restarted",
            Self::ImageUpdated => "image_updated",
            Self::LastSeen => "last_seen",
            Self::HighCpu => "high_cpu",
            Self::HighMemory => "high_memory",
            Self::AnomalousBehavior => "anomalous_behavior",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "first_seen" => Self::FirstSeen,
            "reappeared" => Self::Reappeared,
            "disappeared" => Self::Disappeared,
            "state_change" => Self::StateChange,
            "restarted" => Self::Restarted,
            "image_updated" => Self::ImageUpdated,
            "last_seen" => Self::LastSeen,
            "high_cpu" => Self::HighCpu,
            "high_memory" => Self::HighMemory,
            "anomalous_behavior" => Self::AnomalousBehavior,
            _ => return None,
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed transition derived from two consecutive observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: i64,
    pub host_id: i64,
    pub container_id: String,
    pub container_name: String,
    pub kind: EventKind,
    pub old_state: Option<RuntimeState>,
    pub new_state: Option<RuntimeState>,
    pub old_image: Option<String>,
    pub new_image: Option<String>,
    pub old_digest: Option<String>,
    pub new_digest: Option<String>,
    pub restart_count: Option<u32>,
    /// Cumulative observation count, set on `last_seen` markers.
    pub observations: Option<u64>,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(host_id: i64, container_id: &str, container_name: &str, kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            host_id,
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            kind,
            old_state: None,
            new_state: None,
            old_image: None,
            new_image: None,
            old_digest: None,
            new_digest: None,
            restart_count: None,
            observations: None,
            description: String::new(),
            timestamp,
        }
    }
}

/// Per-container rollup of the lifecycle history on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerLifecycleSummary {
    pub host_id: i64,
    pub container_name: String,
    pub container_id: String,
    pub image: String,
    pub current_state: Option<RuntimeState>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub state_changes: u32,
    pub image_updates: u32,
    pub restart_events: u32,
    pub total_observations: u64,
}

/// Filter for summary queries.
#[derive(Debug, Clone, Default)]
pub struct SummaryFilter {
    pub host_id: Option<i64>,
    pub container_name: Option<String>,
    pub active_only: bool,
    pub limit: Option<usize>,
}

/// Outcome of scanning one host in one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub id: i64,
    pub host_id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub containers_found: usize,
    pub error: Option<String>,
}

/// An alerting rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub event_types: Vec<EventKind>,
    pub host_id: Option<i64>,
    pub container_pattern: Option<String>,
    pub image_pattern: Option<String>,
    pub cpu_threshold: Option<f64>,
    pub memory_threshold: Option<f64>,
    pub threshold_duration_s: u64,
    pub cooldown_s: u64,
    pub channel_ids: Vec<i64>,
}

impl Default for NotificationRule {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            enabled: true,
            event_types: Vec::new(),
            host_id: None,
            container_pattern: None,
            image_pattern: None,
            cpu_threshold: None,
            memory_threshold: None,
            threshold_duration_s: 0,
            cooldown_s: 0,
            channel_ids: Vec::new(),
        }
    }
}

/// Longest accepted rule cooldown or threshold duration, in seconds (one year).
pub const MAX_RULE_WINDOW_S: u64 = 365 * 24 * 60 * 60;

impl NotificationRule {
    /// Reject values the evaluator cannot represent.
    pub fn validate(&self) -> Result<(), String> {
        if self.cooldown_s > MAX_RULE_WINDOW_S {
            return Err(format!("cooldown_s {} exceeds {}", self.cooldown_s, MAX_RULE_WINDOW_S));
        }
        if self.threshold_duration_s > MAX_RULE_WINDOW_S {
            return Err(format!(
                "threshold_duration_s {} exceeds {}",
                self.threshold_duration_s, MAX_RULE_WINDOW_S
            ));
        }
        for threshold in [self.cpu_threshold, self.memory_threshold].into_iter().flatten() {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(format!("invalid threshold {}", threshold));
            }
        }
        Ok(())
    }
}

/// Average resource usage of a container while it ran one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerBaseline {
    pub host_id: i64,
    pub container_name: String,
    /// Digest (or tag) of the image the averages were taken under.
    pub image: String,
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub sample_count: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// A temporary notification suppression.
///
/// Every criterion that is set must match; a silence with no criterion never
/// matches anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSilence {
    pub id: i64,
    pub host_id: Option<i64>,
    pub container_id: Option<String>,
    pub host_pattern: Option<String>,
    pub container_pattern: Option<String>,
    pub silenced_until: DateTime<Utc>,
    pub reason: String,
}

impl NotificationSilence {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.silenced_until
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Webhook,
    Push,
    InApp,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Push => "push",
            Self::InApp => "in_app",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook" => Some(Self::Webhook),
            "push" | "ntfy" => Some(Self::Push),
            "in_app" | "inapp" => Some(Self::InApp),
            _ => None,
        }
    }
}

/// A configured delivery channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: i64,
    pub name: String,
    pub kind: ChannelKind,
    pub config: serde_json::Value,
    pub enabled: bool,
}

/// One dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationLog {
    pub id: i64,
    pub rule_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub event_kind: String,
    pub host_id: Option<i64>,
    pub container_id: String,
    pub container_name: String,
    pub message: String,
    pub success: bool,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
}

/// What kind of dispatch target a health record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Channel,
    TelemetryEndpoint,
    VulnerabilityNotifier,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::TelemetryEndpoint => "telemetry_endpoint",
            Self::VulnerabilityNotifier => "vulnerability_notifier",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "channel" => Some(Self::Channel),
            "telemetry_endpoint" => Some(Self::TelemetryEndpoint),
            "vulnerability_notifier" => Some(Self::VulnerabilityNotifier),
            _ => None,
        }
    }
}

/// Last recorded success and failure of a dispatch target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetHealth {
    pub kind: TargetKind,
    pub name: String,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
}

impl TargetHealth {
    /// True when the most recent outcome was a failure.
    pub fn is_failing(&self) -> bool {
        match (self.last_failure, self.last_success) {
            (Some(f), Some(s)) => f > s,
            (Some(_), None) => true,
            _ => false,
        }
    }
}
