//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Invalid value: {0}")]
    Invalid(String),
    #[error("Not found")]
    NotFound,
    #[error("Database lock poisoned")]
    Poisoned,
}

/// Storage contract for observations and lifecycle history.
///
/// Writes for one host are independent of writes for any other host.
pub trait SnapshotStore: Send + Sync {
    /// Append one observation set.
    fn save_snapshots(&self, snapshots: &[ContainerSnapshot]) -> Result<(), DbError>;

    /// Most recent snapshot per container on one host.
    fn get_latest_by_host(&self, host_id: i64) -> Result<Vec<ContainerSnapshot>, DbError>;

    /// Most recent snapshot per container across all hosts.
    fn get_latest_all(&self) -> Result<Vec<ContainerSnapshot>, DbError>;

    fn append_lifecycle_events(&self, events: &[LifecycleEvent]) -> Result<(), DbError>;

    fn upsert_summary(&self, summary: &ContainerLifecycleSummary) -> Result<(), DbError>;

    fn get_summaries(&self, filter: &SummaryFilter) -> Result<Vec<ContainerLifecycleSummary>, DbError>;

    /// Persist snapshots, events and summaries for one host in a single transaction.
    fn record_observation(
        &self,
        snapshots: &[ContainerSnapshot],
        events: &[LifecycleEvent],
        summaries: &[ContainerLifecycleSummary],
    ) -> Result<(), DbError>;

    /// Average CPU and memory percent of one container's samples since
    /// `since`, with the sample count. Samples without usage are ignored.
    fn average_usage(
        &self,
        host_id: i64,
        container_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<(f64, f64, u32)>, DbError>;

    /// Replace the usage baseline of one container.
    fn save_baseline(&self, baseline: &ContainerBaseline) -> Result<(), DbError>;
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Hosts ---

    /// Add a new host and return its ID.
    pub fn add_host(&self, host: &mut Host) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO hosts (name, address, enabled, collect_stats, agent_token, status, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                host.name,
                host.address,
                host.enabled,
                host.collect_stats,
                host.agent_token,
                host.status.as_str(),
                host.last_seen.as_ref().map(fmt_db_time),
            ],
        )?;
        let id = conn.last_insert_rowid();
        host.id = id;
        Ok(id)
    }

    /// Update the operator-editable fields of a host.
    pub fn update_host(&self, host: &Host) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE hosts SET name=?1, address=?2, enabled=?3, collect_stats=?4, agent_token=?5 WHERE id=?6",
            params![
                host.name,
                host.address,
                host.enabled,
                host.collect_stats,
                host.agent_token,
                host.id,
            ],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all hosts.
    pub fn get_hosts(&self) -> Result<Vec<Host>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, address, enabled, collect_stats, agent_token, status, last_seen FROM hosts ORDER BY id",
        )?;
        let hosts = stmt
            .query_map([], host_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(hosts)
    }

    /// Get a host by ID.
    pub fn get_host(&self, id: i64) -> Result<Host, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, address, enabled, collect_stats, agent_token, status, last_seen FROM hosts WHERE id = ?1",
            params![id],
            host_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a host and everything recorded about it.
    pub fn delete_host(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM container_snapshots WHERE host_id = ?1", params![id])?;
        tx.execute("DELETE FROM lifecycle_events WHERE host_id = ?1", params![id])?;
        tx.execute("DELETE FROM lifecycle_summaries WHERE host_id = ?1", params![id])?;
        tx.execute("DELETE FROM scan_results WHERE host_id = ?1", params![id])?;
        tx.execute("DELETE FROM container_baselines WHERE host_id = ?1", params![id])?;
        tx.execute("DELETE FROM hosts WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Record the outcome of the latest scan on a host.
    ///
    /// `last_seen` is only overwritten when a value is given.
    pub fn set_host_status(
        &self,
        id: i64,
        status: HostStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE hosts SET status = ?1, last_seen = COALESCE(?2, last_seen) WHERE id = ?3",
            params![status.as_str(), last_seen.as_ref().map(fmt_db_time), id],
        )?;
        Ok(())
    }

    // --- Lifecycle history ---

    /// Full event history for one container name on a host, oldest first.
    pub fn get_lifecycle_events(
        &self,
        host_id: i64,
        container_name: &str,
    ) -> Result<Vec<LifecycleEvent>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, host_id, container_id, container_name, kind, old_state, new_state,
                    old_image, new_image, old_digest, new_digest, restart_count, observations,
                    description, timestamp
             FROM lifecycle_events WHERE host_id = ?1 AND container_name = ?2 ORDER BY id ASC",
        )?;
        let events = stmt
            .query_map(params![host_id, container_name], event_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }

    /// Most recent events on a host, newest first.
    pub fn get_recent_events(&self, host_id: i64, limit: usize) -> Result<Vec<LifecycleEvent>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, host_id, container_id, container_name, kind, old_state, new_state,
                    old_image, new_image, old_digest, new_digest, restart_count, observations,
                    description, timestamp
             FROM lifecycle_events WHERE host_id = ?1 AND kind != 'last_seen'
             ORDER BY id DESC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![host_id, limit as i64], event_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }

    // --- Scan results ---

    pub fn save_scan_result(&self, result: &ScanResult) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scan_results (host_id, started_at, completed_at, success, containers_found, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                result.host_id,
                fmt_db_time(&result.started_at),
                fmt_db_time(&result.completed_at),
                result.success,
                result.containers_found as i64,
                result.error,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent scan results, newest first.
    pub fn get_scan_results(&self, host_id: Option<i64>, limit: usize) -> Result<Vec<ScanResult>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, host_id, started_at, completed_at, success, containers_found, error
             FROM scan_results WHERE (?1 IS NULL OR host_id = ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let results = stmt
            .query_map(params![host_id, limit as i64], |row| {
                Ok(ScanResult {
                    id: row.get(0)?,
                    host_id: row.get(1)?,
                    started_at: time_col(row, 2)?,
                    completed_at: time_col(row, 3)?,
                    success: row.get(4)?,
                    containers_found: row.get::<_, i64>(5)? as usize,
                    error: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    // --- Notification rules ---

    pub fn add_rule(&self, rule: &mut NotificationRule) -> Result<i64, DbError> {
        rule.validate().map_err(DbError::Invalid)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notification_rules (name, enabled, event_types, host_id, container_pattern,
                image_pattern, cpu_threshold, memory_threshold, threshold_duration_s, cooldown_s, channel_ids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                rule.name,
                rule.enabled,
                to_json(&rule.event_types),
                rule.host_id,
                rule.container_pattern,
                rule.image_pattern,
                rule.cpu_threshold,
                rule.memory_threshold,
                rule.threshold_duration_s as i64,
                rule.cooldown_s as i64,
                to_json(&rule.channel_ids),
            ],
        )?;
        let id = conn.last_insert_rowid();
        rule.id = id;
        Ok(id)
    }

    pub fn update_rule(&self, rule: &NotificationRule) -> Result<(), DbError> {
        rule.validate().map_err(DbError::Invalid)?;
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE notification_rules SET name=?1, enabled=?2, event_types=?3, host_id=?4,
                container_pattern=?5, image_pattern=?6, cpu_threshold=?7, memory_threshold=?8,
                threshold_duration_s=?9, cooldown_s=?10, channel_ids=?11
             WHERE id=?12",
            params![
                rule.name,
                rule.enabled,
                to_json(&rule.event_types),
                rule.host_id,
                rule.container_pattern,
                rule.image_pattern,
                rule.cpu_threshold,
                rule.memory_threshold,
                rule.threshold_duration_s as i64,
                rule.cooldown_s as i64,
                to_json(&rule.channel_ids),
                rule.id,
            ],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn delete_rule(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM notification_rules WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Get rules, optionally only the enabled ones.
    pub fn get_rules(&self, enabled_only: bool) -> Result<Vec<NotificationRule>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, enabled, event_types, host_id, container_pattern, image_pattern,
                    cpu_threshold, memory_threshold, threshold_duration_s, cooldown_s, channel_ids
             FROM notification_rules WHERE (?1 = 0 OR enabled = 1) ORDER BY id",
        )?;
        let rules = stmt
            .query_map(params![enabled_only], |row| {
                let event_types: String = row.get(3)?;
                let channel_ids: String = row.get(11)?;
                Ok(NotificationRule {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    enabled: row.get(2)?,
                    event_types: from_json(3, &event_types)?,
                    host_id: row.get(4)?,
                    container_pattern: row.get(5)?,
                    image_pattern: row.get(6)?,
                    cpu_threshold: row.get(7)?,
                    memory_threshold: row.get(8)?,
                    threshold_duration_s: row.get::<_, i64>(9)?.max(0) as u64,
                    cooldown_s: row.get::<_, i64>(10)?.max(0) as u64,
                    channel_ids: from_json(11, &channel_ids)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rules)
    }

    // --- Notification channels ---

    pub fn add_channel(&self, channel: &mut NotificationChannel) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notification_channels (name, kind, config, enabled) VALUES (?1, ?2, ?3, ?4)",
            params![
                channel.name,
                channel.kind.as_str(),
                channel.config.to_string(),
                channel.enabled,
            ],
        )?;
        let id = conn.last_insert_rowid();
        channel.id = id;
        Ok(id)
    }

    pub fn update_channel(&self, channel: &NotificationChannel) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE notification_channels SET name=?1, kind=?2, config=?3, enabled=?4 WHERE id=?5",
            params![
                channel.name,
                channel.kind.as_str(),
                channel.config.to_string(),
                channel.enabled,
                channel.id,
            ],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn delete_channel(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM notification_channels WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_channels(&self) -> Result<Vec<NotificationChannel>, DbError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, kind, config, enabled FROM notification_channels ORDER BY id")?;
        let channels = stmt
            .query_map([], channel_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(channels)
    }

    pub fn get_channel(&self, id: i64) -> Result<NotificationChannel, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, kind, config, enabled FROM notification_channels WHERE id = ?1",
            params![id],
            channel_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    // --- Silences ---

    pub fn add_silence(&self, silence: &mut NotificationSilence) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notification_silences (host_id, container_id, host_pattern, container_pattern, silenced_until, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                silence.host_id,
                silence.container_id,
                silence.host_pattern,
                silence.container_pattern,
                fmt_db_time(&silence.silenced_until),
                silence.reason,
            ],
        )?;
        let id = conn.last_insert_rowid();
        silence.id = id;
        Ok(id)
    }

    pub fn delete_silence(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM notification_silences WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Silences whose window has not yet ended at `now`.
    pub fn get_active_silences(&self, now: DateTime<Utc>) -> Result<Vec<NotificationSilence>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, host_id, container_id, host_pattern, container_pattern, silenced_until, reason
             FROM notification_silences WHERE silenced_until > ?1 ORDER BY id",
        )?;
        let silences = stmt
            .query_map(params![fmt_db_time(&now)], |row| {
                Ok(NotificationSilence {
                    id: row.get(0)?,
                    host_id: row.get(1)?,
                    container_id: row.get(2)?,
                    host_pattern: row.get(3)?,
                    container_pattern: row.get(4)?,
                    silenced_until: time_col(row, 5)?,
                    reason: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(silences)
    }

    // --- Notification log ---

    pub fn add_notification_log(&self, entry: &mut NotificationLog) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notification_log (rule_id, channel_id, event_kind, host_id, container_id,
                container_name, message, success, error, sent_at, read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.rule_id,
                entry.channel_id,
                entry.event_kind,
                entry.host_id,
                entry.container_id,
                entry.container_name,
                entry.message,
                entry.success,
                entry.error,
                fmt_db_time(&entry.sent_at),
                entry.read,
            ],
        )?;
        let id = conn.last_insert_rowid();
        entry.id = id;
        Ok(id)
    }

    /// Most recent log rows, newest first.
    pub fn get_notification_logs(&self, limit: usize, unread_only: bool) -> Result<Vec<NotificationLog>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, channel_id, event_kind, host_id, container_id, container_name,
                    message, success, error, sent_at, read
             FROM notification_log WHERE (?1 = 0 OR read = 0)
             ORDER BY sent_at DESC, id DESC LIMIT ?2",
        )?;
        let logs = stmt
            .query_map(params![unread_only, limit as i64], |row| {
                Ok(NotificationLog {
                    id: row.get(0)?,
                    rule_id: row.get(1)?,
                    channel_id: row.get(2)?,
                    event_kind: row.get(3)?,
                    host_id: row.get(4)?,
                    container_id: row.get(5)?,
                    container_name: row.get(6)?,
                    message: row.get(7)?,
                    success: row.get(8)?,
                    error: row.get(9)?,
                    sent_at: time_col(row, 10)?,
                    read: row.get(11)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(logs)
    }

    pub fn mark_notification_read(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute("UPDATE notification_log SET read = 1 WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Mark every unread row as read and return how many changed.
    pub fn mark_all_notifications_read(&self) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute("UPDATE notification_log SET read = 1 WHERE read = 0", [])?)
    }

    pub fn unread_notification_count(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM notification_log WHERE read = 0", [], |r| r.get(0))?)
    }

    /// Delete log rows older than `cutoff` that are not among the newest `keep_recent`.
    pub fn cleanup_notification_log(&self, cutoff: DateTime<Utc>, keep_recent: usize) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM notification_log
             WHERE sent_at < ?1
               AND id NOT IN (SELECT id FROM notification_log ORDER BY sent_at DESC, id DESC LIMIT ?2)",
            params![fmt_db_time(&cutoff), keep_recent as i64],
        )?;
        Ok(n)
    }

    // --- Baselines ---

    pub fn get_baseline(&self, host_id: i64, container_name: &str) -> Result<Option<ContainerBaseline>, DbError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT host_id, container_name, image, avg_cpu_percent, avg_memory_percent,
                        sample_count, window_start, window_end
                 FROM container_baselines WHERE host_id = ?1 AND container_name = ?2",
                params![host_id, container_name],
                |row| {
                    Ok(ContainerBaseline {
                        host_id: row.get(0)?,
                        container_name: row.get(1)?,
                        image: row.get(2)?,
                        avg_cpu_percent: row.get(3)?,
                        avg_memory_percent: row.get(4)?,
                        sample_count: row.get(5)?,
                        window_start: time_col(row, 6)?,
                        window_end: time_col(row, 7)?,
                    })
                },
            )
            .optional()?)
    }

    // --- Target health ---

    pub fn record_target_success(&self, kind: TargetKind, name: &str, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO target_health (kind, name, last_success) VALUES (?1, ?2, ?3)
             ON CONFLICT(kind, name) DO UPDATE SET last_success = excluded.last_success",
            params![kind.as_str(), name, fmt_db_time(&at)],
        )?;
        Ok(())
    }

    pub fn record_target_failure(
        &self,
        kind: TargetKind,
        name: &str,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO target_health (kind, name, last_failure, last_failure_reason) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, name) DO UPDATE SET
                last_failure = excluded.last_failure,
                last_failure_reason = excluded.last_failure_reason",
            params![kind.as_str(), name, fmt_db_time(&at), reason],
        )?;
        Ok(())
    }

    /// Clear the recorded failure of a target, keeping its last success.
    pub fn clear_target_failure(&self, kind: TargetKind, name: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE target_health SET last_failure = NULL, last_failure_reason = NULL WHERE kind = ?1 AND name = ?2",
            params![kind.as_str(), name],
        )?;
        Ok(())
    }

    pub fn get_target_health(&self, kind: TargetKind, name: &str) -> Result<Option<TargetHealth>, DbError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT kind, name, last_success, last_failure, last_failure_reason
                 FROM target_health WHERE kind = ?1 AND name = ?2",
                params![kind.as_str(), name],
                health_from_row,
            )
            .optional()?)
    }

    pub fn list_target_health(&self) -> Result<Vec<TargetHealth>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, name, last_success, last_failure, last_failure_reason FROM target_health ORDER BY kind, name",
        )?;
        let rows = stmt
            .query_map([], health_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    // --- Settings ---

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // --- Retention ---

    /// Delete snapshots observed before `cutoff`, keeping the latest one per container.
    pub fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM container_snapshots
             WHERE observed_at < ?1
               AND id NOT IN (SELECT MAX(id) FROM container_snapshots GROUP BY host_id, container_id)",
            params![fmt_db_time(&cutoff)],
        )?;
        Ok(n)
    }

    pub fn delete_scan_results_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM scan_results WHERE completed_at < ?1",
            params![fmt_db_time(&cutoff)],
        )?)
    }
}

impl SnapshotStore for Store {
    fn save_snapshots(&self, snapshots: &[ContainerSnapshot]) -> Result<(), DbError> {
        if snapshots.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        insert_snapshots(&tx, snapshots)?;
        tx.commit()?;
        Ok(())
    }

    fn get_latest_by_host(&self, host_id: i64) -> Result<Vec<ContainerSnapshot>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{SNAPSHOT_COLUMNS} WHERE id IN
                (SELECT MAX(id) FROM container_snapshots WHERE host_id = ?1 GROUP BY container_id)
             ORDER BY name"
        ))?;
        let snapshots = stmt
            .query_map(params![host_id], snapshot_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(snapshots)
    }

    fn get_latest_all(&self) -> Result<Vec<ContainerSnapshot>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{SNAPSHOT_COLUMNS} WHERE id IN
                (SELECT MAX(id) FROM container_snapshots GROUP BY host_id, container_id)
             ORDER BY host_id, name"
        ))?;
        let snapshots = stmt
            .query_map([], snapshot_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(snapshots)
    }

    fn append_lifecycle_events(&self, events: &[LifecycleEvent]) -> Result<(), DbError> {
        if events.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        insert_events(&tx, events)?;
        tx.commit()?;
        Ok(())
    }

    fn upsert_summary(&self, summary: &ContainerLifecycleSummary) -> Result<(), DbError> {
        let conn = self.conn()?;
        upsert_summaries(&conn, std::slice::from_ref(summary))
    }

    fn get_summaries(&self, filter: &SummaryFilter) -> Result<Vec<ContainerLifecycleSummary>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT host_id, container_name, container_id, image, current_state, first_seen, last_seen,
                    is_active, state_changes, image_updates, restart_events, total_observations
             FROM lifecycle_summaries
             WHERE (?1 IS NULL OR host_id = ?1)
               AND (?2 IS NULL OR container_name = ?2)
               AND (?3 = 0 OR is_active = 1)
             ORDER BY host_id, container_name
             LIMIT ?4",
        )?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let summaries = stmt
            .query_map(
                params![filter.host_id, filter.container_name, filter.active_only, limit],
                |row| {
                    let state: String = row.get(4)?;
                    Ok(ContainerLifecycleSummary {
                        host_id: row.get(0)?,
                        container_name: row.get(1)?,
                        container_id: row.get(2)?,
                        image: row.get(3)?,
                        current_state: (!state.is_empty()).then(|| RuntimeState::parse(&state)),
                        first_seen: time_col(row, 5)?,
                        last_seen: time_col(row, 6)?,
                        is_active: row.get(7)?,
                        state_changes: row.get(8)?,
                        image_updates: row.get(9)?,
                        restart_events: row.get(10)?,
                        total_observations: row.get::<_, i64>(11)?.max(0) as u64,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(summaries)
    }

    fn record_observation(
        &self,
        snapshots: &[ContainerSnapshot],
        events: &[LifecycleEvent],
        summaries: &[ContainerLifecycleSummary],
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        insert_snapshots(&tx, snapshots)?;
        insert_events(&tx, events)?;
        upsert_summaries(&tx, summaries)?;
        tx.commit()?;
        Ok(())
    }

    fn average_usage(
        &self,
        host_id: i64,
        container_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<(f64, f64, u32)>, DbError> {
        let conn = self.conn()?;
        let (cpu, memory, count): (Option<f64>, Option<f64>, i64) = conn.query_row(
            "SELECT AVG(cpu_percent), AVG(COALESCE(memory_percent, 0)), COUNT(*)
             FROM container_snapshots
             WHERE host_id = ?1 AND name = ?2 AND observed_at >= ?3
               AND cpu_percent IS NOT NULL
               AND (cpu_percent > 0 OR COALESCE(memory_usage, 0) > 0)",
            params![host_id, container_name, fmt_db_time(&since)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(match (cpu, memory) {
            (Some(cpu), Some(memory)) if count > 0 => Some((cpu, memory, count.min(u32::MAX as i64) as u32)),
            _ => None,
        })
    }

    fn save_baseline(&self, baseline: &ContainerBaseline) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO container_baselines (host_id, container_name, image, avg_cpu_percent,
                avg_memory_percent, sample_count, window_start, window_end)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(host_id, container_name) DO UPDATE SET
                image = excluded.image,
                avg_cpu_percent = excluded.avg_cpu_percent,
                avg_memory_percent = excluded.avg_memory_percent,
                sample_count = excluded.sample_count,
                window_start = excluded.window_start,
                window_end = excluded.window_end",
            params![
                baseline.host_id,
                baseline.container_name,
                baseline.image,
                baseline.avg_cpu_percent,
                baseline.avg_memory_percent,
                baseline.sample_count,
                fmt_db_time(&baseline.window_start),
                fmt_db_time(&baseline.window_end),
            ],
        )?;
        Ok(())
    }
}

const SNAPSHOT_COLUMNS: &str = "SELECT host_id, container_id, name, image, image_digest, state, status,
        restart_count, ports, networks, volumes, labels, cpu_percent, memory_usage, memory_limit,
        memory_percent, observed_at
     FROM container_snapshots";

fn insert_snapshots(conn: &Connection, snapshots: &[ContainerSnapshot]) -> Result<(), DbError> {
    let mut stmt = conn.prepare(
        "INSERT INTO container_snapshots (host_id, container_id, name, image, image_digest, state, status,
            restart_count, ports, networks, volumes, labels, cpu_percent, memory_usage, memory_limit,
            memory_percent, observed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
    )?;
    for s in snapshots {
        stmt.execute(params![
            s.host_id,
            s.container_id,
            s.name,
            s.image.tag,
            s.image.digest,
            s.state.as_str(),
            s.status,
            s.restart_count,
            to_json(&s.ports),
            to_json(&s.networks),
            to_json(&s.volumes),
            to_json(&s.labels),
            s.stats.map(|st| st.cpu_percent),
            s.stats.map(|st| st.memory_usage as i64),
            s.stats.map(|st| st.memory_limit as i64),
            s.stats.map(|st| st.memory_percent),
            fmt_db_time(&s.observed_at),
        ])?;
    }
    Ok(())
}

fn insert_events(conn: &Connection, events: &[LifecycleEvent]) -> Result<(), DbError> {
    let mut stmt = conn.prepare(
        "INSERT INTO lifecycle_events (host_id, container_id, container_name, kind, old_state, new_state,
            old_image, new_image, old_digest, new_digest, restart_count, observations, description, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )?;
    for e in events {
        stmt.execute(params![
            e.host_id,
            e.container_id,
            e.container_name,
            e.kind.as_str(),
            e.old_state.map(|s| s.as_str()),
            e.new_state.map(|s| s.as_str()),
            e.old_image,
            e.new_image,
            e.old_digest,
            e.new_digest,
            e.restart_count,
            e.observations.map(|o| o as i64),
            e.description,
            fmt_db_time(&e.timestamp),
        ])?;
    }
    Ok(())
}

fn upsert_summaries(conn: &Connection, summaries: &[ContainerLifecycleSummary]) -> Result<(), DbError> {
    let mut stmt = conn.prepare(
        "INSERT INTO lifecycle_summaries (host_id, container_name, container_id, image, current_state,
            first_seen, last_seen, is_active, state_changes, image_updates, restart_events, total_observations)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(host_id, container_name) DO UPDATE SET
            container_id=excluded.container_id, image=excluded.image, current_state=excluded.current_state,
            first_seen=excluded.first_seen, last_seen=excluded.last_seen, is_active=excluded.is_active,
            state_changes=excluded.state_changes, image_updates=excluded.image_updates,
            restart_events=excluded.restart_events, total_observations=excluded.total_observations",
    )?;
    for s in summaries {
        stmt.execute(params![
            s.host_id,
            s.container_name,
            s.container_id,
            s.image,
            s.current_state.map(|st| st.as_str()).unwrap_or(""),
            fmt_db_time(&s.first_seen),
            fmt_db_time(&s.last_seen),
            s.is_active,
            s.state_changes,
            s.image_updates,
            s.restart_events,
            s.total_observations as i64,
        ])?;
    }
    Ok(())
}

fn host_from_row(row: &Row<'_>) -> SqlResult<Host> {
    let status: String = row.get(6)?;
    Ok(Host {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        enabled: row.get(3)?,
        collect_stats: row.get(4)?,
        agent_token: row.get(5)?,
        status: HostStatus::parse(&status),
        last_seen: opt_time_col(row, 7)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> SqlResult<ContainerSnapshot> {
    let state: String = row.get(5)?;
    let ports: String = row.get(8)?;
    let networks: String = row.get(9)?;
    let volumes: String = row.get(10)?;
    let labels: String = row.get(11)?;
    let cpu_percent: Option<f64> = row.get(12)?;
    let memory_usage: Option<i64> = row.get(13)?;
    let memory_limit: Option<i64> = row.get(14)?;
    let memory_percent: Option<f64> = row.get(15)?;

    let stats = cpu_percent.map(|cpu| ResourceStats {
        cpu_percent: cpu,
        memory_usage: memory_usage.unwrap_or(0).max(0) as u64,
        memory_limit: memory_limit.unwrap_or(0).max(0) as u64,
        memory_percent: memory_percent.unwrap_or(0.0),
    });

    Ok(ContainerSnapshot {
        host_id: row.get(0)?,
        container_id: row.get(1)?,
        name: row.get(2)?,
        image: ImageRef {
            tag: row.get(3)?,
            digest: row.get(4)?,
        },
        state: RuntimeState::parse(&state),
        status: row.get(6)?,
        restart_count: row.get(7)?,
        ports: from_json(8, &ports)?,
        networks: from_json(9, &networks)?,
        volumes: from_json(10, &volumes)?,
        labels: from_json::<BTreeMap<String, String>>(11, &labels)?,
        stats,
        observed_at: time_col(row, 16)?,
    })
}

fn event_from_row(row: &Row<'_>) -> SqlResult<LifecycleEvent> {
    let kind: String = row.get(4)?;
    let old_state: Option<String> = row.get(5)?;
    let new_state: Option<String> = row.get(6)?;
    Ok(LifecycleEvent {
        id: row.get(0)?,
        host_id: row.get(1)?,
        container_id: row.get(2)?,
        container_name: row.get(3)?,
        kind: EventKind::parse(&kind).ok_or_else(|| invalid_column(4, format!("unknown event kind {kind}")))?,
        old_state: old_state.as_deref().map(RuntimeState::parse),
        new_state: new_state.as_deref().map(RuntimeState::parse),
        old_image: row.get(7)?,
        new_image: row.get(8)?,
        old_digest: row.get(9)?,
        new_digest: row.get(10)?,
        restart_count: row.get(11)?,
        observations: row.get::<_, Option<i64>>(12)?.map(|o| o.max(0) as u64),
        description: row.get(13)?,
        timestamp: time_col(row, 14)?,
    })
}

fn channel_from_row(row: &Row<'_>) -> SqlResult<NotificationChannel> {
    let kind: String = row.get(2)?;
    let config: String = row.get(3)?;
    Ok(NotificationChannel {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: ChannelKind::parse(&kind).ok_or_else(|| invalid_column(2, format!("unknown channel kind {kind}")))?,
        config: from_json(3, &config)?,
        enabled: row.get(4)?,
    })
}

fn health_from_row(row: &Row<'_>) -> SqlResult<TargetHealth> {
    let kind: String = row.get(0)?;
    Ok(TargetHealth {
        kind: TargetKind::parse(&kind).ok_or_else(|| invalid_column(0, format!("unknown target kind {kind}")))?,
        name: row.get(1)?,
        last_success: opt_time_col(row, 2)?,
        last_failure: opt_time_col(row, 3)?,
        last_failure_reason: row.get(4)?,
    })
}

fn invalid_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn from_json<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> SqlResult<T> {
    serde_json::from_str(s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_col(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| invalid_column(idx, format!("bad timestamp {s}")))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    Ok(s.as_deref().and_then(parse_db_time))
}

/// Format a timestamp the way it is stored; lexical order matches time order.
pub fn fmt_db_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn test_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn add_host(store: &Store, name: &str) -> i64 {
        let mut host = Host {
            name: name.to_string(),
            ..Default::default()
        };
        store.add_host(&mut host).unwrap()
    }

    fn snapshot(host_id: i64, id: &str, name: &str, state: RuntimeState, at: DateTime<Utc>) -> ContainerSnapshot {
        let mut s = ContainerSnapshot::new(
            host_id,
            id,
            name,
            ImageRef::parse("nginx:latest", Some("sha256:aaa")),
            state,
        );
        s.observed_at = at;
        s
    }

    #[test]
    fn test_host_crud() {
        let (_tmp, store) = test_store();

        let mut host = Host {
            name: "edge-1".to_string(),
            address: "tcp://10.0.0.5:2375".to_string(),
            ..Default::default()
        };
        let id = store.add_host(&mut host).unwrap();
        assert!(id > 0);

        let fetched = store.get_host(id).unwrap();
        assert_eq!(fetched.name, "edge-1");
        assert_eq!(fetched.status, HostStatus::Unknown);

        let mut updated = fetched;
        updated.enabled = false;
        store.update_host(&updated).unwrap();
        assert!(!store.get_host(id).unwrap().enabled);

        let seen = Utc::now();
        store.set_host_status(id, HostStatus::Online, Some(seen)).unwrap();
        store.set_host_status(id, HostStatus::Offline, None).unwrap();
        let h = store.get_host(id).unwrap();
        assert_eq!(h.status, HostStatus::Offline);
        assert!(h.last_seen.is_some());

        store.delete_host(id).unwrap();
        assert!(matches!(store.get_host(id), Err(DbError::NotFound)));
    }

    #[test]
    fn test_latest_snapshot_per_container() {
        let (_tmp, store) = test_store();
        let h1 = add_host(&store, "a");
        let h2 = add_host(&store, "b");
        let t0 = Utc::now();

        store
            .save_snapshots(&[
                snapshot(h1, "c1", "web", RuntimeState::Running, t0),
                snapshot(h2, "c9", "db", RuntimeState::Running, t0),
            ])
            .unwrap();
        store
            .save_snapshots(&[snapshot(h1, "c1", "web", RuntimeState::Exited, t0 + Duration::seconds(60))])
            .unwrap();

        let latest = store.get_latest_by_host(h1).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].state, RuntimeState::Exited);
        assert_eq!(latest[0].image.digest.as_deref(), Some("sha256:aaa"));

        assert_eq!(store.get_latest_all().unwrap().len(), 2);
    }

    #[test]
    fn test_record_observation_is_atomic_unit() {
        let (_tmp, store) = test_store();
        let host = add_host(&store, "a");
        let now = Utc::now();

        let snap = snapshot(host, "c1", "web", RuntimeState::Running, now);
        let mut event = LifecycleEvent::new(host, "c1", "web", EventKind::FirstSeen, now);
        event.new_state = Some(RuntimeState::Running);
        let summary = ContainerLifecycleSummary {
            host_id: host,
            container_name: "web".to_string(),
            container_id: "c1".to_string(),
            image: "nginx:latest".to_string(),
            current_state: Some(RuntimeState::Running),
            first_seen: now,
            last_seen: now,
            is_active: true,
            state_changes: 0,
            image_updates: 0,
            restart_events: 0,
            total_observations: 1,
        };

        store.record_observation(&[snap], &[event], &[summary.clone()]).unwrap();

        let events = store.get_lifecycle_events(host, "web").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::FirstSeen);

        let summaries = store
            .get_summaries(&SummaryFilter {
                host_id: Some(host),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(summaries, vec![summary.clone()]);

        let mut inactive = summary;
        inactive.is_active = false;
        store.upsert_summary(&inactive).unwrap();
        let active = store
            .get_summaries(&SummaryFilter {
                active_only: true,
                ..Default::default()
            })
            .unwrap();
        assert!(active.is_empty());
    }

    #[test]
    fn test_snapshot_retention_keeps_latest() {
        let (_tmp, store) = test_store();
        let host = add_host(&store, "a");
        let old = Utc::now() - Duration::days(30);

        store
            .save_snapshots(&[
                snapshot(host, "c1", "web", RuntimeState::Running, old),
                snapshot(host, "c1", "web", RuntimeState::Running, old + Duration::seconds(60)),
            ])
            .unwrap();

        let deleted = store.delete_snapshots_before(Utc::now() - Duration::days(7)).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.get_latest_by_host(host).unwrap().len(), 1);
    }

    #[test]
    fn test_notification_log_cleanup_keeps_newest() {
        let (_tmp, store) = test_store();
        let old = Utc::now() - Duration::days(10);

        for i in 0..120 {
            let mut entry = NotificationLog {
                id: 0,
                rule_id: None,
                channel_id: None,
                event_kind: "state_change".to_string(),
                host_id: None,
                container_id: String::new(),
                container_name: format!("c{i}"),
                message: "m".to_string(),
                success: true,
                error: None,
                sent_at: old + Duration::seconds(i),
                read: false,
            };
            store.add_notification_log(&mut entry).unwrap();
        }

        let deleted = store
            .cleanup_notification_log(Utc::now() - Duration::days(7), 100)
            .unwrap();
        assert_eq!(deleted, 20);
        assert_eq!(store.unread_notification_count().unwrap(), 100);

        let newest = store.get_notification_logs(1, false).unwrap();
        assert_eq!(newest[0].container_name, "c119");

        store.mark_notification_read(newest[0].id).unwrap();
        assert_eq!(store.unread_notification_count().unwrap(), 99);
        assert_eq!(store.mark_all_notifications_read().unwrap(), 99);
        assert!(store.get_notification_logs(10, true).unwrap().is_empty());
    }

    #[test]
    fn test_target_health_reset() {
        let (_tmp, store) = test_store();
        let now = Utc::now();

        store.record_target_success(TargetKind::Channel, "ops", now).unwrap();
        store
            .record_target_failure(TargetKind::Channel, "ops", now + Duration::seconds(5), "503")
            .unwrap();

        let h = store.get_target_health(TargetKind::Channel, "ops").unwrap().unwrap();
        assert!(h.is_failing());
        assert_eq!(h.last_failure_reason.as_deref(), Some("503"));

        store.clear_target_failure(TargetKind::Channel, "ops").unwrap();
        let h = store.get_target_health(TargetKind::Channel, "ops").unwrap().unwrap();
        assert!(!h.is_failing());
        assert!(h.last_success.is_some());
        assert!(h.last_failure_reason.is_none());
    }

    #[test]
    fn test_rules_channels_and_silences() {
        let (_tmp, store) = test_store();

        let mut channel = NotificationChannel {
            id: 0,
            name: "hook".to_string(),
            kind: ChannelKind::Webhook,
            config: serde_json::json!({"url": "http://example.invalid"}),
            enabled: true,
        };
        let cid = store.add_channel(&mut channel).unwrap();
        assert_eq!(store.get_channel(cid).unwrap(), channel);

        let mut rule = NotificationRule {
            name: "cpu".to_string(),
            event_types: vec![EventKind::HighCpu],
            cpu_threshold: Some(80.0),
            threshold_duration_s: 60,
            channel_ids: vec![cid],
            ..Default::default()
        };
        store.add_rule(&mut rule).unwrap();
        let mut disabled = NotificationRule {
            name: "off".to_string(),
            enabled: false,
            ..Default::default()
        };
        store.add_rule(&mut disabled).unwrap();

        assert_eq!(store.get_rules(true).unwrap(), vec![rule]);
        assert_eq!(store.get_rules(false).unwrap().len(), 2);

        let now = Utc::now();
        let mut active = NotificationSilence {
            id: 0,
            host_id: Some(1),
            container_id: None,
            host_pattern: None,
            container_pattern: None,
            silenced_until: now + Duration::hours(1),
            reason: "maintenance".to_string(),
        };
        let mut expired = NotificationSilence {
            silenced_until: now - Duration::hours(1),
            ..active.clone()
        };
        store.add_silence(&mut active).unwrap();
        store.add_silence(&mut expired).unwrap();

        let silences = store.get_active_silences(now).unwrap();
        assert_eq!(silences.len(), 1);
        assert_eq!(silences[0].id, active.id);
    }

    #[test]
    fn test_settings_upsert() {
        let (_tmp, store) = test_store();
        assert_eq!(store.get_setting("scan").unwrap(), None);
        store.set_setting("scan", "a").unwrap();
        store.set_setting("scan", "b").unwrap();
        assert_eq!(store.get_setting("scan").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_out_of_range_rule_rejected() {
        let (_tmp, store) = test_store();
        let mut rule = NotificationRule {
            name: "forever".to_string(),
            event_types: vec![EventKind::StateChange],
            cooldown_s: 10_000_000_000_000_000,
            ..Default::default()
        };
        assert!(matches!(store.add_rule(&mut rule), Err(DbError::Invalid(_))));
        assert!(store.get_rules(false).unwrap().is_empty());

        rule.cooldown_s = 300;
        store.add_rule(&mut rule).unwrap();
        rule.threshold_duration_s = u64::MAX;
        assert!(matches!(store.update_rule(&rule), Err(DbError::Invalid(_))));
        assert_eq!(store.get_rules(false).unwrap()[0].threshold_duration_s, 0);
    }

    #[test]
    fn test_average_usage_and_baseline() {
        let (_tmp, store) = test_store();
        let host = add_host(&store, "h1");
        let now = Utc::now();

        let samples: Vec<_> = [10.0, 20.0, 0.0, 30.0]
            .iter()
            .enumerate()
            .map(|(i, cpu)| {
                let mut s = snapshot(host, "c1", "web", RuntimeState::Running, now - Duration::minutes(i as i64));
                s.stats = Some(ResourceStats {
                    cpu_percent: *cpu,
                    memory_usage: 0,
                    memory_limit: 100,
                    memory_percent: 40.0,
                });
                s
            })
            .collect();
        store.save_snapshots(&samples).unwrap();
        store
            .save_snapshots(&[snapshot(host, "c1", "web", RuntimeState::Running, now)])
            .unwrap();

        // The zero sample and the one without stats do not count.
        let (cpu, memory, count) = store.average_usage(host, "web", now - Duration::hours(1)).unwrap().unwrap();
        assert_eq!(count, 3);
        assert!((cpu - 20.0).abs() < 1e-9);
        assert!((memory - 40.0).abs() < 1e-9);
        assert!(store.average_usage(host, "db", now - Duration::hours(1)).unwrap().is_none());

        let baseline = ContainerBaseline {
            host_id: host,
            container_name: "web".to_string(),
            image: "sha256:aa".to_string(),
            avg_cpu_percent: cpu,
            avg_memory_percent: memory,
            sample_count: count,
            window_start: now - Duration::hours(1),
            window_end: now,
        };
        store.save_baseline(&baseline).unwrap();
        store
            .save_baseline(&ContainerBaseline {
                image: "sha256:bb".to_string(),
                ..baseline.clone()
            })
            .unwrap();
        assert_eq!(store.get_baseline(host, "web").unwrap().unwrap().image, "sha256:bb");
        assert!(store.get_baseline(host, "db").unwrap().is_none());
    }
}
