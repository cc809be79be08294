use async_trait::async_trait;

use super::{Channel, ChannelError};
use crate::db::ChannelKind;
use crate::notify::Alert;

/// The notification log row is the in-app notification, so sending is a no-op.
pub struct InAppChannel {
    name: String,
}

impl InAppChannel {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

#[async_trait]
impl Channel for InAppChannel {
    async fn send(&self, _message: &str, _alert: &Alert) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn test(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    fn name(&self) -> &str {
        &self.name
    }
}
