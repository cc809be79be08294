//! Notification setup for a fresh install.

use tracing::{info, warn};

use crate::db::{ChannelKind, DbError, EventKind, NotificationChannel, NotificationRule, Store};

pub const DEFAULT_CHANNEL_NAME: &str = "In-App Notifications";

fn default_rules(channel_id: i64) -> Vec<NotificationRule> {
    vec![
        NotificationRule {
            name: "Container Stopped or Removed".to_string(),
            event_types: vec![EventKind::StateChange, EventKind::Disappeared],
            cooldown_s: 300,
            channel_ids: vec![channel_id],
            ..Default::default()
        },
        NotificationRule {
            name: "New Image Detected".to_string(),
            event_types: vec![EventKind::ImageUpdated],
            cooldown_s: 600,
            channel_ids: vec![channel_id],
            ..Default::default()
        },
        NotificationRule {
            name: "High Resource Usage".to_string(),
            event_types: vec![EventKind::HighCpu, EventKind::HighMemory],
            cpu_threshold: Some(80.0),
            memory_threshold: Some(90.0),
            threshold_duration_s: 120,
            cooldown_s: 600,
            channel_ids: vec![channel_id],
            ..Default::default()
        },
    ]
}

/// Create the in-app channel and the default rules when no channel exists
/// yet. Returns whether anything was created.
pub fn seed_default_notifications(store: &Store) -> Result<bool, DbError> {
    if !store.get_channels()?.is_empty() {
        return Ok(false);
    }

    info!("Initializing default notification channel and rules");
    let mut channel = NotificationChannel {
        id: 0,
        name: DEFAULT_CHANNEL_NAME.to_string(),
        kind: ChannelKind::InApp,
        config: serde_json::json!({}),
        enabled: true,
    };
    let channel_id = store.add_channel(&mut channel)?;

    for mut rule in default_rules(channel_id) {
        match store.add_rule(&mut rule) {
            Ok(id) => info!("Created default notification rule {} ({})", rule.name, id),
            Err(e) => warn!("Failed to create default rule {}: {}", rule.name, e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Host, LifecycleEvent, RuntimeState};
    use crate::notify::Notifier;
    use crate::settings::NotificationSettings;
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    #[test]
    fn test_seeds_only_once() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        assert!(seed_default_notifications(&store).unwrap());
        assert!(!seed_default_notifications(&store).unwrap());

        let channels = store.get_channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].kind, ChannelKind::InApp);

        let rules = store.get_rules(false).unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.enabled && r.channel_ids == vec![channels[0].id]));
        let usage = rules.iter().find(|r| r.name == "High Resource Usage").unwrap();
        assert_eq!(usage.cpu_threshold, Some(80.0));
        assert_eq!(usage.memory_threshold, Some(90.0));
    }

    #[test]
    fn test_existing_channel_skips_seeding() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut channel = NotificationChannel {
            id: 0,
            name: "ops".to_string(),
            kind: ChannelKind::InApp,
            config: serde_json::json!({}),
            enabled: true,
        };
        store.add_channel(&mut channel).unwrap();

        assert!(!seed_default_notifications(&store).unwrap());
        assert!(store.get_rules(false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_rule_reaches_in_app_log() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        seed_default_notifications(&store).unwrap();
        let mut host = Host {
            name: "prod-a".to_string(),
            ..Default::default()
        };
        store.add_host(&mut host).unwrap();

        let notifier = Notifier::new(store.clone(), NotificationSettings::default());
        let now = Utc::now();
        let mut event = LifecycleEvent::new(host.id, "id-web", "web", EventKind::StateChange, now);
        event.old_state = Some(RuntimeState::Running);
        event.new_state = Some(RuntimeState::Exited);

        assert_eq!(notifier.process_events(&host, &[event], now).await.unwrap(), 1);
        assert_eq!(store.unread_notification_count().unwrap(), 1);
    }
}
