//! Notification rule evaluation and dispatch.
//!
//! Lifecycle events and resource samples are matched against the enabled
//! rules. A match passes the sustained-threshold check (samples only), the
//! per (rule, container) cooldown, the silences and finally the global
//! quota before it reaches the rule's channels. Every delivery attempt is
//! written to the notification log and to the channel's health record.

mod channels;
mod defaults;
mod message;
mod ratelimit;
mod rules;
mod silence;
mod state;

pub use channels::*;
pub use defaults::*;
pub use message::*;
pub use ratelimit::*;
pub use rules::*;
pub use silence::*;
pub use state::*;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::db::{
    ContainerBaseline, ContainerSnapshot, DbError, EventKind, Host, LifecycleEvent, NotificationChannel,
    NotificationLog, NotificationRule, NotificationSilence, ResourceStats, RuntimeState, SnapshotStore, Store,
    SummaryFilter, TargetKind,
};
use crate::health::HealthTracker;
use crate::lifecycle::{increase, watching, ANOMALY_INCREASE};
use crate::settings::NotificationSettings;

/// Turns a stored channel into a delivery backend.
pub type ChannelBuilder =
    Box<dyn Fn(&NotificationChannel) -> Result<Arc<dyn Channel>, ChannelError> + Send + Sync>;

/// Window of the global dispatch quota, in hours.
pub const RATE_WINDOW_HOURS: i64 = 1;

/// Health record name of a channel. Keyed by id so a renamed or recreated
/// channel never shares another channel's record.
pub fn channel_target(channel_id: i64) -> String {
    format!("channel-{}", channel_id)
}

impl Alert {
    pub fn target(&self) -> TargetKey {
        TargetKey {
            host_id: self.host_id,
            container: self.container_name.clone(),
        }
    }
}

pub struct Notifier {
    store: Arc<Store>,
    health: HealthTracker,
    settings: Mutex<NotificationSettings>,
    state: Mutex<TemporalState>,
    limiter: Mutex<RateLimiter>,
    build: ChannelBuilder,
}

impl Notifier {
    pub fn new(store: Arc<Store>, settings: NotificationSettings) -> Self {
        let client = reqwest::Client::new();
        Self::with_builder(store, settings, Box::new(move |ch| build_channel(&client, ch)))
    }

    pub fn with_builder(store: Arc<Store>, settings: NotificationSettings, build: ChannelBuilder) -> Self {
        let limiter = RateLimiter::new(settings.max_per_hour, Duration::hours(RATE_WINDOW_HOURS), Utc::now());
        Self {
            health: HealthTracker::new(store.clone()),
            store,
            settings: Mutex::new(settings),
            state: Mutex::new(TemporalState::default()),
            limiter: Mutex::new(limiter),
            build,
        }
    }

    fn state(&self) -> MutexGuard<'_, TemporalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limiter(&self) -> MutexGuard<'_, RateLimiter> {
        self.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply changed quota settings without losing the current window.
    pub fn apply_settings(&self, settings: NotificationSettings) {
        self.limiter().set_max(settings.max_per_hour);
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn batch_interval(&self) -> std::time::Duration {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .batch_interval()
    }

    /// Dispatches left in the current quota window.
    pub fn remaining(&self, now: DateTime<Utc>) -> u32 {
        self.limiter().remaining(now)
    }

    /// When the quota window refills.
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.limiter().reset_at()
    }

    pub fn queued(&self) -> usize {
        self.limiter().queued()
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    fn load_rules(&self) -> Result<Vec<NotificationRule>, DbError> {
        let rules = self.store.get_rules(true)?;
        let live: HashSet<i64> = rules.iter().map(|r| r.id).collect();
        self.state().retain_rules(&live);
        Ok(rules)
    }

    /// Evaluate one host's lifecycle events. Returns the number of
    /// successful deliveries.
    pub async fn process_events(
        &self,
        host: &Host,
        events: &[LifecycleEvent],
        now: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let events: Vec<&LifecycleEvent> = events.iter().filter(|e| e.kind != EventKind::LastSeen).collect();
        if events.is_empty() {
            return Ok(0);
        }

        let rules = self.load_rules()?;
        let compiled = compile_rules(&rules);
        if compiled.is_empty() {
            return Ok(0);
        }
        let silences = self.store.get_active_silences(now)?;

        // Events without an image of their own are matched on the image the
        // container currently runs.
        let images: HashMap<String, String> = if compiled.iter().any(|r| r.rule.image_pattern.is_some()) {
            self.store
                .get_summaries(&SummaryFilter {
                    host_id: Some(host.id),
                    ..Default::default()
                })?
                .into_iter()
                .map(|s| (s.container_name, s.image))
                .collect()
        } else {
            HashMap::new()
        };

        let mut admitted = Vec::new();
        for event in events {
            let image = images.get(&event.container_name).map(String::as_str);
            let alert = Alert::from_event(host, event, image);
            for rule in &compiled {
                if !rule.wants(event.kind) || !rule.matches(&alert) {
                    continue;
                }
                if self.admit_event(rule.rule, &alert, &silences, now) {
                    admitted.push((rule.rule, alert.clone()));
                }
            }
        }

        Ok(self.dispatch(admitted, now).await)
    }

    /// Evaluate resource samples against the sustained threshold rules and,
    /// for recently updated containers, against the pre-update baseline.
    pub async fn process_samples(
        &self,
        host: &Host,
        samples: &[ContainerSnapshot],
        now: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let rules = self.load_rules()?;
        let compiled: Vec<CompiledRule<'_>> = compile_rules(&rules)
            .into_iter()
            .filter(|r| {
                (r.wants(EventKind::HighCpu) && r.rule.cpu_threshold.is_some())
                    || (r.wants(EventKind::HighMemory) && r.rule.memory_threshold.is_some())
                    || r.wants(EventKind::AnomalousBehavior)
            })
            .collect();
        if compiled.is_empty() {
            return Ok(0);
        }
        let silences = self.store.get_active_silences(now)?;
        let anomalies = compiled.iter().any(|r| r.wants(EventKind::AnomalousBehavior));

        let mut admitted = Vec::new();
        for snapshot in samples {
            let Some(stats) = snapshot.stats else {
                continue;
            };
            let anomaly = match (anomalies, snapshot.state) {
                (true, RuntimeState::Running) => self
                    .store
                    .get_baseline(host.id, &snapshot.name)?
                    .and_then(|b| compare_to_baseline(&b, snapshot, &stats, now)),
                _ => None,
            };

            for rule in &compiled {
                let checks = [
                    (EventKind::HighCpu, Metric::Cpu, rule.rule.cpu_threshold, stats.cpu_percent),
                    (EventKind::HighMemory, Metric::Memory, rule.rule.memory_threshold, stats.memory_percent),
                ];
                for (kind, metric, threshold, value) in checks {
                    let Some(threshold) = threshold else {
                        continue;
                    };
                    if !rule.wants(kind) {
                        continue;
                    }
                    let alert = Alert::from_sample(host, snapshot, kind, now);
                    if !rule.matches(&alert) {
                        continue;
                    }
                    let duration = window(rule.rule.threshold_duration_s);
                    if self.admit_sample(rule.rule, &alert, metric, value >= threshold, duration, &silences, now) {
                        admitted.push((rule.rule, alert));
                    }
                }

                if let Some((breaching, description)) = &anomaly {
                    if !rule.wants(EventKind::AnomalousBehavior) {
                        continue;
                    }
                    let mut alert = Alert::from_sample(host, snapshot, EventKind::AnomalousBehavior, now);
                    alert.description = description.clone();
                    if !rule.matches(&alert) {
                        continue;
                    }
                    // Fires once per anomalous episode.
                    let zero = Duration::zero();
                    if self.admit_sample(rule.rule, &alert, Metric::Anomaly, *breaching, zero, &silences, now) {
                        admitted.push((rule.rule, alert));
                    }
                }
            }
        }

        Ok(self.dispatch(admitted, now).await)
    }

    fn admit_event(
        &self,
        rule: &NotificationRule,
        alert: &Alert,
        silences: &[NotificationSilence],
        now: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state();
        let target = alert.target();
        if state.in_cooldown(rule.id, &target, now) {
            debug!("Rule {} in cooldown for {} on {}", rule.name, alert.container_name, alert.host_name);
            return false;
        }
        admit_unsilenced(&mut state, rule, alert, silences, now)
    }

    fn admit_sample(
        &self,
        rule: &NotificationRule,
        alert: &Alert,
        metric: Metric,
        breaching: bool,
        duration: Duration,
        silences: &[NotificationSilence],
        now: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state();
        let target = alert.target();
        if state.observe(rule.id, &target, metric, breaching, duration, now).is_none() {
            return false;
        }
        if state.in_cooldown(rule.id, &target, now) {
            debug!("Rule {} in cooldown for {} on {}", rule.name, alert.container_name, alert.host_name);
            return false;
        }
        state.mark_fired(rule.id, &target, metric);
        admit_unsilenced(&mut state, rule, alert, silences, now)
    }

    async fn dispatch(&self, admitted: Vec<(&NotificationRule, Alert)>, now: DateTime<Utc>) -> usize {
        let mut sends = Vec::new();
        let mut held = 0;
        {
            let mut limiter = self.limiter();
            for (rule, alert) in &admitted {
                let message = alert.message();
                for &channel_id in &rule.channel_ids {
                    if limiter.allow(now) {
                        sends.push((Some(rule.id), channel_id, message.clone(), alert));
                    } else {
                        held += 1;
                        limiter.enqueue(QueuedAlert {
                            channel_id,
                            rule_id: Some(rule.id),
                            kind: alert.kind,
                            message: message.clone(),
                        });
                    }
                }
            }
        }
        if held > 0 {
            info!("Notification quota exhausted, {} alert(s) queued for the next batch", held);
        }

        let results = join_all(
            sends
                .into_iter()
                .map(|(rule_id, channel_id, message, alert)| self.deliver(rule_id, channel_id, message, alert, now)),
        )
        .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// Send one summary per channel for everything the quota held back.
    /// Summaries do not consume quota.
    pub async fn flush_batch(&self, now: DateTime<Utc>) -> usize {
        let queued = self.limiter().drain();
        if queued.is_empty() {
            return 0;
        }

        let mut by_channel: BTreeMap<i64, Vec<&QueuedAlert>> = BTreeMap::new();
        for q in &queued {
            by_channel.entry(q.channel_id).or_default().push(q);
        }

        let summaries: Vec<(i64, Alert)> = by_channel
            .into_iter()
            .map(|(channel_id, items)| {
                let mut alert = Alert::new(AlertKind::Summary, now);
                alert.description = batch_summary(&items);
                (channel_id, alert)
            })
            .collect();

        info!("Flushing {} queued alert(s) to {} channel(s)", queued.len(), summaries.len());
        let results = join_all(
            summaries
                .iter()
                .map(|(channel_id, alert)| self.deliver(None, *channel_id, alert.message(), alert, now)),
        )
        .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// Send a test message through one channel.
    pub async fn send_test(&self, channel_id: i64) -> Result<(), ChannelError> {
        let now = Utc::now();
        let (name, channel) = self.resolve(channel_id);
        let outcome = match channel {
            Ok(ch) => ch.test().await,
            Err(e) => Err(e),
        };
        debug!("Test notification via {}", name);
        self.health.record(TargetKind::Channel, &channel_target(channel_id), &outcome, now);
        outcome
    }

    /// Periodically flush the batch queue until stopped.
    pub async fn run_batch_flusher(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        loop {
            let wait = self.batch_interval();
            tokio::select! {
                _ = stop.recv() => break,
                _ = tokio::time::sleep(wait) => {
                    self.flush_batch(Utc::now()).await;
                    self.state().prune(Utc::now());
                }
            }
        }
    }

    fn resolve(&self, channel_id: i64) -> (String, Result<Arc<dyn Channel>, ChannelError>) {
        let channel = match self.store.get_channel(channel_id) {
            Ok(c) => c,
            Err(DbError::NotFound) => {
                return (format!("channel-{}", channel_id), Err(ChannelError::NotFound(channel_id)))
            }
            Err(e) => return (format!("channel-{}", channel_id), Err(ChannelError::Store(e.to_string()))),
        };
        if !channel.enabled {
            return (channel.name, Err(ChannelError::Disabled(channel_id)));
        }
        let built = (self.build)(&channel);
        (channel.name, built)
    }

    async fn deliver(
        &self,
        rule_id: Option<i64>,
        channel_id: i64,
        message: String,
        alert: &Alert,
        now: DateTime<Utc>,
    ) -> bool {
        let (name, channel) = self.resolve(channel_id);
        let outcome = match channel {
            Ok(ch) => ch.send(&message, alert).await,
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(()) => debug!("Sent {} alert via {}", alert.kind, name),
            Err(e) => error!("Failed to send {} alert via {}: {}", alert.kind, name, e),
        }

        let mut entry = NotificationLog {
            id: 0,
            rule_id,
            channel_id: Some(channel_id),
            event_kind: alert.kind.as_str().to_string(),
            host_id: (alert.host_id != 0).then_some(alert.host_id),
            container_id: alert.container_id.clone(),
            container_name: alert.container_name.clone(),
            message,
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
            sent_at: now,
            read: false,
        };
        if let Err(e) = self.store.add_notification_log(&mut entry) {
            error!("Failed to write notification log: {}", e);
        }
        self.health.record(TargetKind::Channel, &channel_target(channel_id), &outcome, now);

        outcome.is_ok()
    }
}

/// Post-update usage against the baseline taken under the previous image.
/// `None` when the container has not been updated recently.
fn compare_to_baseline(
    baseline: &ContainerBaseline,
    snapshot: &ContainerSnapshot,
    stats: &ResourceStats,
    now: DateTime<Utc>,
) -> Option<(bool, String)> {
    if baseline.image == snapshot.image.identity() || !watching(baseline, now) {
        return None;
    }
    let cpu = increase(stats.cpu_percent, baseline.avg_cpu_percent);
    let memory = increase(stats.memory_percent, baseline.avg_memory_percent);
    let breaching = cpu.into_iter().chain(memory).any(|i| i > ANOMALY_INCREASE);
    let description = format!(
        "CPU {:.1}% vs {:.1}% before the update, memory {:.1}% vs {:.1}%",
        stats.cpu_percent, baseline.avg_cpu_percent, stats.memory_percent, baseline.avg_memory_percent
    );
    Some((breaching, description))
}

fn compile_rules(rules: &[NotificationRule]) -> Vec<CompiledRule<'_>> {
    rules
        .iter()
        .filter_map(|rule| match CompiledRule::compile(rule) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("Skipping rule {}: {}", rule.name, e);
                None
            }
        })
        .collect()
}

// Cooldown starts only for alerts that get past the silences.
fn admit_unsilenced(
    state: &mut TemporalState,
    rule: &NotificationRule,
    alert: &Alert,
    silences: &[NotificationSilence],
    now: DateTime<Utc>,
) -> bool {
    if let Some(s) = find_silence(silences, alert, now) {
        warn!(
            "Silenced {} alert for {} on {} (rule {}, silence {}: {})",
            alert.kind, alert.container_name, alert.host_name, rule.name, s.id, s.reason
        );
        return false;
    }
    state.start_cooldown(rule.id, &alert.target(), window(rule.cooldown_s), now);
    true
}
