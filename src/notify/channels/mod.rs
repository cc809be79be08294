//! Notification delivery backends.

mod inapp;
mod push;
mod webhook;

pub use inapp::*;
pub use push::*;
pub use webhook::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::Alert;
use crate::db::{ChannelKind, NotificationChannel};

/// Per-request timeout for outbound notifications.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub const USER_AGENT: &str = concat!("fleetwatch-notifier/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("invalid channel config: {0}")]
    InvalidConfig(String),
    #[error("channel {0} not found")]
    NotFound(i64),
    #[error("channel {0} is disabled")]
    Disabled(i64),
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("store error: {0}")]
    Store(String),
}

impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.to_string())
    }
}

/// A delivery target. Sends are attempted once; there is no retry here.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, message: &str, alert: &Alert) -> Result<(), ChannelError>;

    async fn test(&self) -> Result<(), ChannelError>;

    fn kind(&self) -> ChannelKind;

    fn name(&self) -> &str;
}

/// Instantiate the backend for a stored channel.
pub fn build_channel(
    client: &reqwest::Client,
    channel: &NotificationChannel,
) -> Result<Arc<dyn Channel>, ChannelError> {
    Ok(match channel.kind {
        ChannelKind::Webhook => Arc::new(WebhookChannel::from_config(client.clone(), channel)?),
        ChannelKind::Push => Arc::new(PushChannel::from_config(client.clone(), channel)?),
        ChannelKind::InApp => Arc::new(InAppChannel::new(&channel.name)),
    })
}

fn parse_config<T: serde::de::DeserializeOwned>(channel: &NotificationChannel) -> Result<T, ChannelError> {
    serde_json::from_value(channel.config.clone())
        .map_err(|e| ChannelError::InvalidConfig(format!("{}: {}", channel.name, e)))
}

fn check_status(resp: &reqwest::Response) -> Result<(), ChannelError> {
    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ChannelError::Status(status.as_u16()))
    }
}
