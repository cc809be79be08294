//! Configuration module for fleetwatch.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Scan and notification parameters only seed the runtime settings on first
//! start; afterwards the stored settings win.

use std::env;
use thiserror::Error;

use crate::db::Host;
use crate::settings::{NotificationSettings, ScanSettings};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid host entry {0:?}, expected name=address")]
    InvalidHost(String),
}

/// A host to create when the host table is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSeed {
    pub name: String,
    pub address: String,
}

impl HostSeed {
    pub fn to_host(&self) -> Host {
        Host {
            name: self.name.clone(),
            address: self.address.clone(),
            ..Default::default()
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the SQLite database file (default: "fleetwatch.db")
    pub db_path: String,
    pub hosts: Vec<HostSeed>,
    pub scan: ScanSettings,
    pub notifications: NotificationSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "fleetwatch.db".to_string(),
            hosts: vec![HostSeed {
                name: "local".to_string(),
                address: "unix:///var/run/docker.sock".to_string(),
            }],
            scan: ScanSettings::default(),
            notifications: NotificationSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `FLEETWATCH_DB_PATH`: Database file path (default: "fleetwatch.db")
    /// - `FLEETWATCH_HOSTS`: `name=address,...` (default: the local Docker socket)
    /// - `FLEETWATCH_SCAN_INTERVAL`: seconds between scans (default: 300)
    /// - `FLEETWATCH_HOST_TIMEOUT`: per-host deadline in seconds (default: 30)
    /// - `FLEETWATCH_CYCLE_TIMEOUT`: whole-cycle deadline in seconds (default: 240)
    /// - `FLEETWATCH_MAX_CONCURRENCY`: parallel host probes (default: 8)
    /// - `FLEETWATCH_NOTIFY_MAX_PER_HOUR`: notification quota (default: 100)
    /// - `FLEETWATCH_NOTIFY_BATCH_INTERVAL`: seconds between batch summaries (default: 600)
    /// - `FLEETWATCH_RETENTION_DAYS`: snapshot retention (default: 7)
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(db_path) = lookup("FLEETWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(hosts) = lookup("FLEETWATCH_HOSTS") {
            cfg.hosts = parse_hosts(&hosts)?;
        }

        let num = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidValue { key, value: v }),
            }
        };

        if let Some(v) = num("FLEETWATCH_SCAN_INTERVAL")? {
            cfg.scan.interval_s = v;
        }
        if let Some(v) = num("FLEETWATCH_HOST_TIMEOUT")? {
            cfg.scan.host_timeout_s = v;
        }
        if let Some(v) = num("FLEETWATCH_CYCLE_TIMEOUT")? {
            cfg.scan.cycle_timeout_s = v;
        }
        if let Some(v) = num("FLEETWATCH_MAX_CONCURRENCY")? {
            cfg.scan.max_concurrency = v as usize;
        }
        if let Some(v) = num("FLEETWATCH_RETENTION_DAYS")? {
            cfg.scan.retention_days = v.min(u32::MAX as u64) as u32;
        }
        if let Some(v) = num("FLEETWATCH_NOTIFY_MAX_PER_HOUR")? {
            cfg.notifications.max_per_hour = v.min(u32::MAX as u64) as u32;
        }
        if let Some(v) = num("FLEETWATCH_NOTIFY_BATCH_INTERVAL")? {
            cfg.notifications.batch_interval_s = v;
        }

        Ok(cfg)
    }
}

fn parse_hosts(raw: &str) -> Result<Vec<HostSeed>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, address) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidHost(entry.to_string()))?;
            let (name, address) = (name.trim(), address.trim());
            if name.is_empty() || address.is_empty() {
                return Err(ConfigError::InvalidHost(entry.to_string()));
            }
            Ok(HostSeed {
                name: name.to_string(),
                address: address.to_string(),
            })
        })
        .collect()
}
