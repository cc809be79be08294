//! Generic JSON webhook.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{check_status, parse_config, Channel, ChannelError, SEND_TIMEOUT, USER_AGENT};
use crate::db::{ChannelKind, NotificationChannel};
use crate::notify::Alert;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    message: &'a str,
    #[serde(flatten)]
    alert: &'a Alert,
}

pub struct WebhookChannel {
    client: reqwest::Client,
    name: String,
    config: WebhookConfig,
}

impl WebhookChannel {
    pub fn from_config(client: reqwest::Client, channel: &NotificationChannel) -> Result<Self, ChannelError> {
        let config: WebhookConfig = parse_config(channel)?;
        if config.url.is_empty() {
            return Err(ChannelError::InvalidConfig("webhook url is required".to_string()));
        }
        Ok(Self {
            client,
            name: channel.name.clone(),
            config,
        })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    async fn send(&self, message: &str, alert: &Alert) -> Result<(), ChannelError> {
        let mut req = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(SEND_TIMEOUT)
            .json(&WebhookPayload { message, alert });
        for (key, value) in &self.config.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        check_status(&req.send().await?)
    }

    async fn test(&self) -> Result<(), ChannelError> {
        let alert = Alert::test(chrono::Utc::now());
        self.send(&alert.message(), &alert).await
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EventKind;
    use crate::notify::AlertKind;
    use crate::testutil::serve_http;
    use serde_json::json;

    fn channel(url: &str) -> NotificationChannel {
        NotificationChannel {
            id: 1,
            name: "hook".to_string(),
            kind: ChannelKind::Webhook,
            config: json!({"url": url, "headers": {"X-Auth": "k1"}}),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_posts_alert_json() {
        let (url, server) = serve_http(vec![(200, "{}".to_string())]).await;
        let hook = WebhookChannel::from_config(reqwest::Client::new(), &channel(&format!("{}/hook", url))).unwrap();

        let mut alert = Alert::new(AlertKind::Event(EventKind::Disappeared), chrono::Utc::now());
        alert.container_name = "web".to_string();
        hook.send("gone", &alert).await.unwrap();

        let requests = server.await.unwrap();
        let raw = &requests[0];
        assert!(raw.starts_with("POST /hook"));
        assert!(raw.to_ascii_lowercase().contains("x-auth: k1"));
        assert!(raw.contains(r#""message":"gone""#));
        assert!(raw.contains(r#""event_type":"disappeared""#));
        assert!(raw.contains(r#""container_name":"web""#));
    }

    #[tokio::test]
    async fn test_error_status() {
        let (url, server) = serve_http(vec![(500, "{}".to_string())]).await;
        let hook = WebhookChannel::from_config(reqwest::Client::new(), &channel(&url)).unwrap();

        assert_eq!(hook.test().await, Err(ChannelError::Status(500)));
        server.await.unwrap();
    }
}
