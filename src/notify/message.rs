//! Alert payloads and their human-readable messages.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use super::ratelimit::QueuedAlert;
use crate::db::{ContainerSnapshot, EventKind, Host, LifecycleEvent, RuntimeState};

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    Event(EventKind),
    Summary,
    Test,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event(kind) => kind.as_str(),
            Self::Summary => "batch_summary",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AlertKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Everything a channel may render about one alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    #[serde(rename = "event_type")]
    pub kind: AlertKind,
    pub host_id: i64,
    pub host_name: String,
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_state: Option<RuntimeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<RuntimeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            host_id: 0,
            host_name: String::new(),
            container_id: String::new(),
            container_name: String::new(),
            image: String::new(),
            old_state: None,
            new_state: None,
            old_image: None,
            new_image: None,
            cpu_percent: None,
            memory_percent: None,
            description: String::new(),
            timestamp,
        }
    }

    /// Alert for a lifecycle event. `image` is the container's current image
    /// when the event itself does not carry one.
    pub fn from_event(host: &Host, event: &LifecycleEvent, image: Option<&str>) -> Self {
        let mut alert = Self::new(AlertKind::Event(event.kind), event.timestamp);
        alert.host_id = host.id;
        alert.host_name = host.name.clone();
        alert.container_id = event.container_id.clone();
        alert.container_name = event.container_name.clone();
        alert.image = event
            .new_image
            .as_deref()
            .or(image)
            .or(event.old_image.as_deref())
            .unwrap_or_default()
            .to_string();
        alert.old_state = event.old_state;
        alert.new_state = event.new_state;
        alert.old_image = event.old_image.clone();
        alert.new_image = event.new_image.clone();
        alert.description = event.description.clone();
        alert
    }

    /// Alert for a sustained resource threshold breach.
    pub fn from_sample(host: &Host, snapshot: &ContainerSnapshot, kind: EventKind, now: DateTime<Utc>) -> Self {
        let mut alert = Self::new(AlertKind::Event(kind), now);
        alert.host_id = host.id;
        alert.host_name = host.name.clone();
        alert.container_id = snapshot.container_id.clone();
        alert.container_name = snapshot.name.clone();
        alert.image = snapshot.image.tag.clone();
        alert.new_state = Some(snapshot.state);
        if let Some(stats) = snapshot.stats {
            alert.cpu_percent = Some(stats.cpu_percent);
            alert.memory_percent = Some(stats.memory_percent);
        }
        alert
    }

    pub fn test(now: DateTime<Utc>) -> Self {
        let mut alert = Self::new(AlertKind::Test, now);
        alert.host_name = "test-host".to_string();
        alert.container_name = "test-container".to_string();
        alert
    }

    pub fn message(&self) -> String {
        let (name, host) = (&self.container_name, &self.host_name);
        let kind = match self.kind {
            AlertKind::Event(kind) => kind,
            AlertKind::Summary => return self.description.clone(),
            AlertKind::Test => return "Test notification from fleetwatch".to_string(),
        };

        match kind {
            EventKind::FirstSeen => format!("New container: {} on {} ({})", name, host, self.image),
            EventKind::Reappeared => format!("Container reappeared: {} on {}", name, host),
            EventKind::Disappeared => format!("Container disappeared: {} on {}", name, host),
            EventKind::Restarted => format!("Container restarted: {} on {} ({})", name, host, self.description),
            EventKind::ImageUpdated => format!(
                "Image updated for {} on {}: {} -> {}",
                name,
                host,
                self.old_image.as_deref().unwrap_or("?"),
                self.new_image.as_deref().unwrap_or("?")
            ),
            EventKind::StateChange => match (self.old_state, self.new_state) {
                (Some(old), Some(new)) => format!("State changed: {} on {} ({} -> {})", name, host, old, new),
                _ => format!("State changed: {} on {} ({})", name, host, self.description),
            },
            EventKind::HighCpu => format!(
                "High CPU usage: {} on {} ({:.1}%)",
                name,
                host,
                self.cpu_percent.unwrap_or_default()
            ),
            EventKind::HighMemory => format!(
                "High memory usage: {} on {} ({:.1}%)",
                name,
                host,
                self.memory_percent.unwrap_or_default()
            ),
            EventKind::AnomalousBehavior => {
                format!("Anomalous behavior after update: {} on {} ({})", name, host, self.description)
            }
            EventKind::LastSeen => format!("Event: {} for {} on {}", kind, name, host),
        }
    }
}

/// One summary line per alert kind, for a single channel's held-back alerts.
pub fn batch_summary(queued: &[&QueuedAlert]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for q in queued {
        *counts.entry(q.kind.as_str()).or_default() += 1;
    }

    let mut msg = format!(
        "Notification summary: {} alert{} held back by the rate limit",
        queued.len(),
        if queued.len() == 1 { "" } else { "s" }
    );
    for (kind, count) in counts {
        msg.push_str(&format!("\n- {}: {}", kind, count));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Host {
        Host {
            id: 3,
            name: "prod-a".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_image_update_message() {
        let mut event = LifecycleEvent::new(3, "c1", "web", EventKind::ImageUpdated, Utc::now());
        event.old_image = Some("app:1".to_string());
        event.new_image = Some("app:2".to_string());

        let alert = Alert::from_event(&host(), &event, None);
        assert_eq!(alert.image, "app:2");
        assert_eq!(alert.message(), "Image updated for web on prod-a: app:1 -> app:2");
    }

    #[test]
    fn test_state_change_message_uses_current_image() {
        let mut event = LifecycleEvent::new(3, "c1", "web", EventKind::StateChange, Utc::now());
        event.old_state = Some(RuntimeState::Running);
        event.new_state = Some(RuntimeState::Exited);

        let alert = Alert::from_event(&host(), &event, Some("nginx:1.25"));
        assert_eq!(alert.image, "nginx:1.25");
        assert_eq!(alert.message(), "State changed: web on prod-a (running -> exited)");
    }

    #[test]
    fn test_batch_summary_counts_kinds() {
        let q = |kind| QueuedAlert {
            channel_id: 1,
            rule_id: None,
            kind: AlertKind::Event(kind),
            message: String::new(),
        };
        let items = [q(EventKind::HighCpu), q(EventKind::StateChange), q(EventKind::HighCpu)];
        let refs: Vec<&QueuedAlert> = items.iter().collect();

        let msg = batch_summary(&refs);
        assert!(msg.starts_with("Notification summary: 3 alerts"));
        assert!(msg.contains("- high_cpu: 2"));
        assert!(msg.contains("- state_change: 1"));
    }
}
