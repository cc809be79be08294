//! Scheduler module for running scan cycles and background maintenance.

mod orchestrator;
mod retention;

pub use orchestrator::*;
pub use retention::*;

use crate::db::{DbError, Store};
use crate::lifecycle;
use crate::notify::Notifier;
use crate::settings::{self, NotificationSettings, ScanSettings};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::{Instant, MissedTickBehavior};

const BASELINE_INTERVAL: Duration = Duration::from_secs(3600);

/// The main scheduler: a periodic ticker feeding the orchestrator, plus
/// retention, usage baselines and notification batching in the background.
pub struct Scheduler {
    store: Arc<Store>,
    orchestrator: Arc<Orchestrator>,
    notifier: Arc<Notifier>,
    retention_manager: Arc<RetentionManager>,
    wake: Arc<Notify>,
    stop_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, orchestrator: Arc<Orchestrator>, notifier: Arc<Notifier>) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            retention_manager: Arc::new(RetentionManager::new(store.clone())),
            store,
            orchestrator,
            notifier,
            wake: Arc::new(Notify::new()),
            stop_tx,
        }
    }

    /// Start the ticker and the background managers.
    pub fn start(&self) {
        tokio::spawn(run_ticker(
            self.store.clone(),
            self.orchestrator.clone(),
            self.notifier.clone(),
            self.wake.clone(),
            self.stop_tx.subscribe(),
        ));
        tokio::spawn(self.notifier.clone().run_batch_flusher(self.stop_tx.subscribe()));
        tokio::spawn(run_baseline_refresh(self.store.clone(), self.stop_tx.subscribe()));
        self.retention_manager.start();

        tracing::info!("Scheduler started");
    }

    /// Request an out-of-schedule scan. Returns immediately.
    pub fn trigger(&self, scope: ScanScope) {
        self.orchestrator.trigger(scope);
    }

    /// Persist new scan settings and restart the ticker with them.
    pub fn update_scan_settings(&self, scan: &ScanSettings) -> Result<(), DbError> {
        settings::save(&self.store, scan)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Persist new notification settings and apply them right away.
    pub fn update_notification_settings(&self, notify: NotificationSettings) -> Result<(), DbError> {
        settings::save(&self.store, &notify)?;
        self.notifier.apply_settings(notify);
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(());
        self.retention_manager.stop().await;
        tracing::info!("Scheduler stopped");
    }
}

/// Refresh usage baselines hourly until stopped.
async fn run_baseline_refresh(store: Arc<Store>, mut stop_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(BASELINE_INTERVAL);
    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                match lifecycle::refresh(&store, chrono::Utc::now()) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Refreshed {} usage baseline(s)", n),
                    Err(e) => tracing::error!("Failed to refresh usage baselines: {}", e),
                }
            }
        }
    }
}

fn load_scan_settings(store: &Store) -> ScanSettings {
    settings::load(store).unwrap_or_else(|e| {
        tracing::error!("Failed to load scan settings, using defaults: {}", e);
        ScanSettings::default()
    })
}

/// Tick at the configured interval and start a full cycle on each tick.
///
/// Settings are re-read on every tick; a changed interval, or a wake-up from
/// [`Scheduler::update_scan_settings`], rebuilds the ticker.
async fn run_ticker(
    store: Arc<Store>,
    orchestrator: Arc<Orchestrator>,
    notifier: Arc<Notifier>,
    wake: Arc<Notify>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut first = true;

    loop {
        let current = load_scan_settings(&store);
        let period = current.interval();
        let start = if first { Instant::now() } else { Instant::now() + period };
        first = false;

        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Scan ticker running every {}s", period.as_secs());

        loop {
            tokio::select! {
                _ = stop_rx.recv() => return,
                _ = wake.notified() => {
                    tracing::info!("Scan settings changed, restarting ticker");
                    break;
                }
                _ = interval.tick() => {
                    let latest = load_scan_settings(&store);
                    match settings::load::<NotificationSettings>(&store) {
                        Ok(n) => notifier.apply_settings(n),
                        Err(e) => tracing::error!("Failed to load notification settings: {}", e),
                    }

                    if latest.enabled {
                        // Skipped by the orchestrator if the previous cycle is still running.
                        orchestrator.trigger(ScanScope::All);
                    }
                    if latest.interval() != period {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::orchestrator::tests::Fixture;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ticker_scans_and_reloads_settings() {
        let f = Fixture::new(ScanSettings {
            interval_s: 3600,
            host_timeout_s: 1,
            ..Default::default()
        });
        f.host("ok-1");
        let notifier = Arc::new(Notifier::new(f.store.clone(), NotificationSettings::default()));
        let scheduler = Scheduler::new(f.store.clone(), f.orchestrator.clone(), notifier.clone());

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(f.store.get_scan_results(None, 10).unwrap().len(), 1);

        scheduler
            .update_notification_settings(NotificationSettings {
                max_per_hour: 3,
                batch_interval_s: 60,
            })
            .unwrap();
        assert_eq!(notifier.remaining(chrono::Utc::now()), 3);
        assert_eq!(notifier.batch_interval(), Duration::from_secs(60));

        scheduler
            .update_scan_settings(&ScanSettings {
                enabled: false,
                interval_s: 3600,
                ..Default::default()
            })
            .unwrap();
        let stored: ScanSettings = settings::load(&f.store).unwrap();
        assert!(!stored.enabled);

        scheduler.stop().await;
    }
}
