//! Temporal state of the rule evaluator: sustained-threshold episodes and
//! cooldowns. One instance per notifier; nothing here is global.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

/// A container as seen by the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub host_id: i64,
    pub container: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Cpu,
    Memory,
    /// Usage against the pre-update baseline.
    Anomaly,
}

/// A rule window in seconds. Saturates instead of overflowing.
pub fn window(seconds: u64) -> Duration {
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

type BreachKey = (i64, TargetKey, Metric);

#[derive(Debug, Default)]
pub struct TemporalState {
    breach_start: HashMap<BreachKey, DateTime<Utc>>,
    fired: HashSet<BreachKey>,
    cooldown_until: HashMap<(i64, TargetKey), DateTime<Utc>>,
}

impl TemporalState {
    /// Record one sample against a rule threshold.
    ///
    /// Returns the breach start when the breach has lasted at least
    /// `duration` and has not fired yet in this episode. A sample below the
    /// threshold ends the episode.
    pub fn observe(
        &mut self,
        rule_id: i64,
        target: &TargetKey,
        metric: Metric,
        breaching: bool,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let key = (rule_id, target.clone(), metric);
        if !breaching {
            self.breach_start.remove(&key);
            self.fired.remove(&key);
            return None;
        }

        let start = *self.breach_start.entry(key.clone()).or_insert(now);
        if self.fired.contains(&key) || now - start < duration {
            return None;
        }
        Some(start)
    }

    /// Mark the current episode as handled so it does not fire again.
    pub fn mark_fired(&mut self, rule_id: i64, target: &TargetKey, metric: Metric) {
        self.fired.insert((rule_id, target.clone(), metric));
    }

    pub fn in_cooldown(&self, rule_id: i64, target: &TargetKey, now: DateTime<Utc>) -> bool {
        self.cooldown_until
            .get(&(rule_id, target.clone()))
            .map_or(false, |until| now < *until)
    }

    pub fn start_cooldown(&mut self, rule_id: i64, target: &TargetKey, cooldown: Duration, now: DateTime<Utc>) {
        if cooldown <= Duration::zero() {
            return;
        }
        let until = now.checked_add_signed(cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.cooldown_until.insert((rule_id, target.clone()), until);
    }

    /// Drop state that can no longer affect a decision.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.cooldown_until.retain(|_, until| now < *until);
    }

    /// Forget everything about rules that no longer exist.
    pub fn retain_rules(&mut self, live: &HashSet<i64>) {
        self.breach_start.retain(|(rule, _, _), _| live.contains(rule));
        self.fired.retain(|(rule, _, _)| live.contains(rule));
        self.cooldown_until.retain(|(rule, _), _| live.contains(rule));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetKey {
        TargetKey {
            host_id: 1,
            container: "web".to_string(),
        }
    }

    #[test]
    fn test_sustained_breach_fires_once() {
        let mut state = TemporalState::default();
        let t0 = Utc::now();
        let d = Duration::seconds(60);
        let t = target();

        assert_eq!(state.observe(1, &t, Metric::Cpu, true, d, t0), None);
        assert_eq!(state.observe(1, &t, Metric::Cpu, true, d, t0 + Duration::seconds(30)), None);
        assert_eq!(
            state.observe(1, &t, Metric::Cpu, true, d, t0 + Duration::seconds(60)),
            Some(t0)
        );
        state.mark_fired(1, &t, Metric::Cpu);
        assert_eq!(state.observe(1, &t, Metric::Cpu, true, d, t0 + Duration::seconds(90)), None);

        // Dropping below re-arms.
        assert_eq!(state.observe(1, &t, Metric::Cpu, false, d, t0 + Duration::seconds(120)), None);
        let t1 = t0 + Duration::seconds(130);
        assert_eq!(state.observe(1, &t, Metric::Cpu, true, d, t1), None);
        assert_eq!(
            state.observe(1, &t, Metric::Cpu, true, d, t1 + Duration::seconds(60)),
            Some(t1)
        );
    }

    #[test]
    fn test_metrics_tracked_separately() {
        let mut state = TemporalState::default();
        let t0 = Utc::now();
        let t = target();
        state.observe(1, &t, Metric::Cpu, true, Duration::zero(), t0);
        assert!(state
            .observe(1, &t, Metric::Memory, true, Duration::seconds(10), t0)
            .is_none());
    }

    #[test]
    fn test_cooldown_window() {
        let mut state = TemporalState::default();
        let t0 = Utc::now();
        let t = target();

        assert!(!state.in_cooldown(1, &t, t0));
        state.start_cooldown(1, &t, Duration::seconds(300), t0);
        assert!(state.in_cooldown(1, &t, t0 + Duration::seconds(299)));
        assert!(!state.in_cooldown(2, &t, t0 + Duration::seconds(10)));
        assert!(!state.in_cooldown(1, &t, t0 + Duration::seconds(300)));

        state.prune(t0 + Duration::seconds(301));
        assert!(state.cooldown_until.is_empty());
    }

    #[test]
    fn test_huge_windows_saturate() {
        assert_eq!(window(300), Duration::seconds(300));
        assert_eq!(window(10_000_000_000_000_000), Duration::MAX);
        assert_eq!(window(u64::MAX), Duration::MAX);

        let mut state = TemporalState::default();
        let t0 = Utc::now();
        let t = target();
        state.start_cooldown(1, &t, window(u64::MAX), t0);
        assert!(state.in_cooldown(1, &t, t0 + Duration::days(365 * 1000)));

        assert!(state.observe(2, &t, Metric::Cpu, true, window(u64::MAX), t0).is_none());
        assert!(state
            .observe(2, &t, Metric::Cpu, true, window(u64::MAX), t0 + Duration::days(365 * 1000))
            .is_none());
    }
}
