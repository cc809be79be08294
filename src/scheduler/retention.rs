//! Retention manager for cleaning up old data.

use crate::db::Store;
use crate::settings::{self, ScanSettings};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Notification log rows older than this are deleted...
const NOTIFICATION_LOG_DAYS: i64 = 7;
/// ...except for the newest ones.
const NOTIFICATION_LOG_KEEP: usize = 100;

const RETENTION_INTERVAL: Duration = Duration::from_secs(600);

/// Rows removed by one retention pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionStats {
    pub snapshots: usize,
    pub scan_results: usize,
    pub notifications: usize,
}

/// Manager for deleting data past retention periods.
pub struct RetentionManager {
    store: Arc<Store>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(RETENTION_INTERVAL);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, Utc::now());
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Lifecycle events and summaries are never pruned; summaries must stay
/// rebuildable from the full history.
pub fn process_retention(store: &Store, now: DateTime<Utc>) -> RetentionStats {
    let mut stats = RetentionStats::default();

    let scan: ScanSettings = match settings::load(store) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("RetentionManager: Failed to load settings: {}", e);
            return stats;
        }
    };
    let cutoff = ChronoDuration::try_days(i64::from(scan.retention_days.max(1)))
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    match store.delete_snapshots_before(cutoff) {
        Ok(n) => stats.snapshots = n,
        Err(e) => tracing::error!("RetentionManager: Failed to delete snapshots: {}", e),
    }
    match store.delete_scan_results_before(cutoff) {
        Ok(n) => stats.scan_results = n,
        Err(e) => tracing::error!("RetentionManager: Failed to delete scan results: {}", e),
    }

    let log_cutoff = now - ChronoDuration::days(NOTIFICATION_LOG_DAYS);
    match store.cleanup_notification_log(log_cutoff, NOTIFICATION_LOG_KEEP) {
        Ok(n) => stats.notifications = n,
        Err(e) => tracing::error!("RetentionManager: Failed to clean notification log: {}", e),
    }

    if stats != RetentionStats::default() {
        tracing::info!(
            "RetentionManager: removed {} snapshots, {} scan results, {} notifications",
            stats.snapshots,
            stats.scan_results,
            stats.notifications
        );
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Host, ImageRef, NotificationLog, RuntimeState, ScanResult, SnapshotStore, ContainerSnapshot};
    use tempfile::NamedTempFile;

    #[test]
    fn test_retention_pass() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut host = Host {
            name: "a".to_string(),
            ..Default::default()
        };
        let host_id = store.add_host(&mut host).unwrap();
        let now = Utc::now();
        let old = now - ChronoDuration::days(30);

        // Two old observations of one container: only the older one may go.
        for at in [old, old + ChronoDuration::minutes(5)] {
            let mut s = ContainerSnapshot::new(host_id, "c1", "web", ImageRef::parse("app:1", None), RuntimeState::Running);
            s.observed_at = at;
            store.save_snapshots(&[s]).unwrap();
        }
        store
            .save_scan_result(&ScanResult {
                id: 0,
                host_id,
                started_at: old,
                completed_at: old,
                success: true,
                containers_found: 1,
                error: None,
            })
            .unwrap();
        for i in 0..105 {
            let mut entry = NotificationLog {
                id: 0,
                rule_id: None,
                channel_id: None,
                event_kind: "state_change".to_string(),
                host_id: Some(host_id),
                container_id: String::new(),
                container_name: "web".to_string(),
                message: format!("m{}", i),
                success: true,
                error: None,
                sent_at: old + ChronoDuration::seconds(i),
                read: false,
            };
            store.add_notification_log(&mut entry).unwrap();
        }

        let stats = process_retention(&store, now);
        assert_eq!(
            stats,
            RetentionStats {
                snapshots: 1,
                scan_results: 1,
                notifications: 5,
            }
        );
        assert_eq!(store.get_latest_by_host(host_id).unwrap().len(), 1);
        assert_eq!(store.get_notification_logs(200, false).unwrap().len(), 100);
    }
}
