//! Runtime settings.
//!
//! Stored as JSON in the `settings` table so they can change without a
//! restart. The environment only provides the values written on first start.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::db::{DbError, Store};

/// Longest interval or timeout a setting can express (one year).
pub const MAX_SETTING_S: u64 = 365 * 24 * 60 * 60;

/// Most probes a cycle runs at once.
pub const MAX_CONCURRENCY: usize = 1024;

fn seconds(s: u64) -> Duration {
    Duration::from_secs(s.clamp(1, MAX_SETTING_S))
}

pub trait Setting: Serialize + DeserializeOwned + Default {
    const KEY: &'static str;
}

/// Scan scheduling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub enabled: bool,
    pub interval_s: u64,
    pub host_timeout_s: u64,
    pub cycle_timeout_s: u64,
    pub max_concurrency: usize,
    /// Days of snapshots and scan results to keep.
    pub retention_days: u32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_s: 300,
            host_timeout_s: 30,
            cycle_timeout_s: 240,
            max_concurrency: 8,
            retention_days: 7,
        }
    }
}

impl ScanSettings {
    pub fn interval(&self) -> Duration {
        seconds(self.interval_s)
    }

    pub fn host_timeout(&self) -> Duration {
        seconds(self.host_timeout_s)
    }

    pub fn cycle_timeout(&self) -> Duration {
        seconds(self.cycle_timeout_s)
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

impl Setting for ScanSettings {
    const KEY: &'static str = "scan";
}

/// Notification quota parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub max_per_hour: u32,
    pub batch_interval_s: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            max_per_hour: 100,
            batch_interval_s: 600,
        }
    }
}

impl NotificationSettings {
    pub fn batch_interval(&self) -> Duration {
        seconds(self.batch_interval_s)
    }
}

impl Setting for NotificationSettings {
    const KEY: &'static str = "notifications";
}

/// Current value, or the default when unset or unreadable.
pub fn load<T: Setting>(store: &Store) -> Result<T, DbError> {
    Ok(match store.get_setting(T::KEY)? {
        Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Ignoring malformed {} settings: {}", T::KEY, e);
            T::default()
        }),
        None => T::default(),
    })
}

pub fn save<T: Setting>(store: &Store, value: &T) -> Result<(), DbError> {
    let raw = serde_json::to_string(value)?;
    store.set_setting(T::KEY, &raw)
}

/// Write `initial` if nothing is stored yet; return what is in effect.
pub fn seed<T: Setting>(store: &Store, initial: T) -> Result<T, DbError> {
    if store.get_setting(T::KEY)?.is_some() {
        return load(store);
    }
    save(store, &initial)?;
    Ok(initial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_seed_only_once() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let first = ScanSettings {
            interval_s: 60,
            ..Default::default()
        };
        assert_eq!(seed(&store, first.clone()).unwrap(), first);

        let second = ScanSettings {
            interval_s: 5,
            ..Default::default()
        };
        assert_eq!(seed(&store, second).unwrap().interval_s, 60);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.set_setting("notifications", r#"{"max_per_hour": 5}"#).unwrap();

        let s: NotificationSettings = load(&store).unwrap();
        assert_eq!(s.max_per_hour, 5);
        assert_eq!(s.batch_interval_s, 600);

        store.set_setting("notifications", "not json").unwrap();
        assert_eq!(load::<NotificationSettings>(&store).unwrap(), NotificationSettings::default());
    }

    #[test]
    fn test_durations_are_clamped() {
        let scan = ScanSettings {
            interval_s: 0,
            host_timeout_s: u64::MAX,
            max_concurrency: usize::MAX,
            ..Default::default()
        };
        assert_eq!(scan.interval(), Duration::from_secs(1));
        assert_eq!(scan.host_timeout(), Duration::from_secs(MAX_SETTING_S));
        assert_eq!(scan.concurrency(), MAX_CONCURRENCY);

        let notify = NotificationSettings {
            batch_interval_s: u64::MAX,
            ..Default::default()
        };
        assert_eq!(notify.batch_interval(), Duration::from_secs(MAX_SETTING_S));
    }
}
