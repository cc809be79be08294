//! Silence matching.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::rules::Glob;
use super::Alert;
use crate::db::NotificationSilence;

/// First active silence covering the alert.
pub fn find_silence<'a>(
    silences: &'a [NotificationSilence],
    alert: &Alert,
    now: DateTime<Utc>,
) -> Option<&'a NotificationSilence> {
    silences.iter().find(|s| s.is_active(now) && covers(s, alert))
}

/// Every criterion that is set must match; at least one must be set.
fn covers(silence: &NotificationSilence, alert: &Alert) -> bool {
    let mut constrained = false;

    if let Some(host_id) = silence.host_id {
        constrained = true;
        if host_id != alert.host_id {
            return false;
        }
    }
    if let Some(container_id) = silence.container_id.as_deref().filter(|s| !s.is_empty()) {
        constrained = true;
        if !id_matches(container_id, &alert.container_id) {
            return false;
        }
    }
    if let Some(pattern) = silence.host_pattern.as_deref().filter(|s| !s.is_empty()) {
        constrained = true;
        if !glob_matches(silence, pattern, &alert.host_name) {
            return false;
        }
    }
    if let Some(pattern) = silence.container_pattern.as_deref().filter(|s| !s.is_empty()) {
        constrained = true;
        if !glob_matches(silence, pattern, &alert.container_name) {
            return false;
        }
    }

    constrained
}

// Short and full runtime IDs refer to the same container.
fn id_matches(silenced: &str, actual: &str) -> bool {
    !actual.is_empty() && (silenced == actual || actual.starts_with(silenced) || silenced.starts_with(actual))
}

fn glob_matches(silence: &NotificationSilence, pattern: &str, value: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.matches(value),
        Err(e) => {
            warn!("Ignoring silence {}: {}", silence.id, e);
            false
        }
    }
}
