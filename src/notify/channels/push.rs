//! ntfy-style push notifications.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{check_status, parse_config, Channel, ChannelError, SEND_TIMEOUT, USER_AGENT};
use crate::db::{ChannelKind, EventKind, NotificationChannel};
use crate::notify::{Alert, AlertKind};

pub const DEFAULT_PUSH_SERVER: &str = "https://ntfy.sh";

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Serialize)]
struct PushMessage<'a> {
    topic: &'a str,
    title: &'static str,
    message: &'a str,
    priority: u8,
    tags: [&'static str; 1],
}

pub struct PushChannel {
    client: reqwest::Client,
    name: String,
    config: PushConfig,
}

impl PushChannel {
    pub fn from_config(client: reqwest::Client, channel: &NotificationChannel) -> Result<Self, ChannelError> {
        let mut config: PushConfig = parse_config(channel)?;
        if config.topic.is_empty() {
            return Err(ChannelError::InvalidConfig("push topic is required".to_string()));
        }
        if config.server_url.is_empty() {
            config.server_url = DEFAULT_PUSH_SERVER.to_string();
        }
        config.server_url = config.server_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            name: channel.name.clone(),
            config,
        })
    }
}

fn priority(kind: AlertKind) -> u8 {
    match kind {
        AlertKind::Event(
            EventKind::Disappeared | EventKind::HighCpu | EventKind::HighMemory | EventKind::AnomalousBehavior,
        ) => 4,
        _ => 3,
    }
}

fn tag(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::Event(EventKind::FirstSeen | EventKind::Reappeared) => "white_check_mark",
        AlertKind::Event(EventKind::Disappeared) => "octagonal_sign",
        AlertKind::Event(EventKind::ImageUpdated) => "arrows_counterclockwise",
        AlertKind::Event(EventKind::Restarted) => "repeat",
        AlertKind::Event(EventKind::HighCpu | EventKind::HighMemory | EventKind::AnomalousBehavior) => "warning",
        _ => "information_source",
    }
}

#[async_trait]
impl Channel for PushChannel {
    async fn send(&self, message: &str, alert: &Alert) -> Result<(), ChannelError> {
        let body = PushMessage {
            topic: &self.config.topic,
            title: "fleetwatch",
            message,
            priority: priority(alert.kind),
            tags: [tag(alert.kind)],
        };

        let mut req = self
            .client
            .post(&self.config.server_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(SEND_TIMEOUT)
            .json(&body);
        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            req = req.bearer_auth(token);
        }

        check_status(&req.send().await?)
    }

    async fn test(&self) -> Result<(), ChannelError> {
        let alert = Alert::test(chrono::Utc::now());
        self.send(&alert.message(), &alert).await
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve_http;
    use serde_json::json;

    fn channel(config: serde_json::Value) -> NotificationChannel {
        NotificationChannel {
            id: 2,
            name: "phone".to_string(),
            kind: ChannelKind::Push,
            config,
            enabled: true,
        }
    }

    #[test]
    fn test_default_server() {
        let push = PushChannel::from_config(reqwest::Client::new(), &channel(json!({"topic": "t"}))).unwrap();
        assert_eq!(push.config.server_url, DEFAULT_PUSH_SERVER);
    }

    #[test]
    fn test_priority_by_kind() {
        assert_eq!(priority(AlertKind::Event(EventKind::HighMemory)), 4);
        assert_eq!(priority(AlertKind::Event(EventKind::AnomalousBehavior)), 4);
        assert_eq!(tag(AlertKind::Event(EventKind::AnomalousBehavior)), "warning");
        assert_eq!(priority(AlertKind::Event(EventKind::ImageUpdated)), 3);
        assert_eq!(priority(AlertKind::Test), 3);
    }

    #[tokio::test]
    async fn test_send_with_token() {
        let (url, server) = serve_http(vec![(200, "{}".to_string())]).await;
        let push = PushChannel::from_config(
            reqwest::Client::new(),
            &channel(json!({"server_url": format!("{}/", url), "topic": "fleet", "token": "tk"})),
        )
        .unwrap();

        let alert = Alert::new(AlertKind::Event(EventKind::HighCpu), chrono::Utc::now());
        push.send("hot", &alert).await.unwrap();

        let raw = server.await.unwrap().remove(0);
        assert!(raw.starts_with("POST / "));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer tk"));
        assert!(raw.contains(r#""topic":"fleet""#));
        assert!(raw.contains(r#""priority":4"#));
        assert!(raw.contains(r#""tags":["warning"]"#));
    }
}
