//! Diff of one host's observation set against its previous latest snapshots.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::db::{
    short_digest, ContainerLifecycleSummary, ContainerSnapshot, EventKind, LifecycleEvent, RuntimeState,
};

/// Events derived by one diff and the summaries they touched.
#[derive(Debug, Default)]
pub struct DiffOutcome {
    pub events: Vec<LifecycleEvent>,
    pub summaries: Vec<ContainerLifecycleSummary>,
}

impl DiffOutcome {
    /// Events other than `last_seen` markers.
    pub fn transitions(&self) -> impl Iterator<Item = &LifecycleEvent> {
        self.events.iter().filter(|e| e.kind != EventKind::LastSeen)
    }
}

struct Working {
    host_id: i64,
    now: DateTime<Utc>,
    summaries: HashMap<String, ContainerLifecycleSummary>,
    touched: Vec<String>,
    events: Vec<LifecycleEvent>,
}

impl Working {
    fn summary(&self, key: &str) -> Option<&ContainerLifecycleSummary> {
        self.summaries.get(key)
    }

    fn event(&self, snapshot: &ContainerSnapshot, kind: EventKind) -> LifecycleEvent {
        LifecycleEvent::new(
            self.host_id,
            &snapshot.container_id,
            snapshot.history_key(),
            kind,
            self.now,
        )
    }

    fn emit(&mut self, event: LifecycleEvent) {
        let key = event.container_name.clone();
        let summary = self
            .summaries
            .entry(key.clone())
            .or_insert_with(|| ContainerLifecycleSummary::seed(&event));
        summary.apply(&event);
        if !self.touched.contains(&key) {
            self.touched.push(key);
        }
        self.events.push(event);
    }
}

/// Derive lifecycle events for one host.
///
/// `previous` holds the latest stored snapshot per container and `summaries`
/// the stored summaries of the same host. A malformed record degrades to a
/// generic `state_change` for that container only, emitted once when the
/// container turns malformed rather than on every cycle it stays that way.
pub fn diff(
    host_id: i64,
    observed: &[ContainerSnapshot],
    previous: &[ContainerSnapshot],
    summaries: &[ContainerLifecycleSummary],
    now: DateTime<Utc>,
) -> DiffOutcome {
    let mut w = Working {
        host_id,
        now,
        summaries: summaries
            .iter()
            .filter(|s| s.host_id == host_id)
            .map(|s| (s.container_name.clone(), s.clone()))
            .collect(),
        touched: Vec::new(),
        events: Vec::new(),
    };

    let prev_by_id: HashMap<&str, &ContainerSnapshot> = previous
        .iter()
        .filter(|p| p.host_id == host_id)
        .map(|p| (p.container_id.as_str(), p))
        .collect();
    let mut prev_by_name: HashMap<&str, &ContainerSnapshot> = HashMap::new();
    for p in previous.iter().filter(|p| p.host_id == host_id) {
        let newer = prev_by_name
            .get(p.history_key())
            .map_or(true, |existing| p.observed_at > existing.observed_at);
        if newer {
            prev_by_name.insert(p.history_key(), p);
        }
    }

    let mut observed_names: HashSet<&str> = HashSet::new();

    for obs in observed {
        observed_names.insert(obs.history_key());

        let prev = prev_by_id
            .get(obs.container_id.as_str())
            .or_else(|| prev_by_name.get(obs.history_key()))
            .copied();
        let summary_active = w.summary(obs.history_key()).map(|s| s.is_active);
        let reason = malformed(obs);
        if let Some(reason) = reason {
            warn!(
                "Malformed observation for container {} on host {}: {}",
                obs.history_key(),
                host_id,
                reason
            );
        }

        match (prev, summary_active) {
            (_, None) => {
                let mut e = w.event(obs, EventKind::FirstSeen);
                e.new_state = Some(obs.state);
                e.new_image = Some(obs.image.tag.clone());
                e.new_digest = obs.image.digest.clone();
                e.restart_count = obs.restart_count;
                e.description = format!("first seen {} ({})", obs.image.tag, obs.state);
                w.emit(e);
            }
            (prev, Some(false)) => {
                let mut e = w.event(obs, EventKind::Reappeared);
                e.old_state = prev.map(|p| p.state);
                e.new_state = Some(obs.state);
                e.new_image = Some(obs.image.tag.clone());
                e.new_digest = obs.image.digest.clone();
                e.restart_count = obs.restart_count;
                e.description = "reappeared".to_string();
                w.emit(e);
                if let (Some(p), None) = (prev, reason) {
                    compare_images(&mut w, p, obs);
                }
            }
            // Active summary but no stored snapshot: the history continues.
            (None, Some(true)) => {}
            (Some(p), Some(true)) => match reason {
                // One degraded event per malformed episode, or when the record still changed.
                Some(reason) => {
                    let changed = p.state != obs.state || p.image != obs.image;
                    if malformed(p).is_none() || changed {
                        let mut e = w.event(obs, EventKind::StateChange);
                        e.old_state = Some(p.state);
                        e.new_state = Some(obs.state);
                        e.description = format!("unclassified change ({})", reason);
                        w.emit(e);
                    }
                }
                None => {
                    compare_states(&mut w, p, obs);
                    compare_images(&mut w, p, obs);
                }
            },
        }

        emit_last_seen(&mut w, obs);
    }

    let mut gone: HashSet<&str> = HashSet::new();
    for p in previous.iter().filter(|p| p.host_id == host_id) {
        let key = p.history_key();
        if observed_names.contains(key) || !gone.insert(key) {
            continue;
        }
        // Emit once: an inactive summary means the disappearance is already recorded.
        if w.summary(key).map_or(true, |s| s.is_active) {
            let mut e = w.event(p, EventKind::Disappeared);
            e.old_state = Some(p.state);
            e.old_image = Some(p.image.tag.clone());
            e.old_digest = p.image.digest.clone();
            e.description = "no longer reported by host".to_string();
            w.emit(e);
        }
    }

    let mut summaries = Vec::with_capacity(w.touched.len());
    for key in &w.touched {
        if let Some(s) = w.summaries.get(key) {
            summaries.push(s.clone());
        }
    }

    DiffOutcome {
        events: w.events,
        summaries,
    }
}

fn malformed(obs: &ContainerSnapshot) -> Option<&'static str> {
    if obs.name.is_empty() {
        Some("missing name")
    } else if obs.state == RuntimeState::Unknown {
        Some("unknown state")
    } else if obs.image.tag.is_empty() && obs.image.digest.is_none() {
        Some("missing image")
    } else {
        None
    }
}

fn emit_last_seen(w: &mut Working, obs: &ContainerSnapshot) {
    let observations = w
        .summary(obs.history_key())
        .map(|s| s.total_observations)
        .unwrap_or(0)
        + 1;
    let mut e = w.event(obs, EventKind::LastSeen);
    e.new_state = Some(obs.state);
    e.observations = Some(observations);
    w.emit(e);
}

fn compare_states(w: &mut Working, prev: &ContainerSnapshot, obs: &ContainerSnapshot) {
    if prev.state == obs.state {
        return;
    }

    let mut e = w.event(obs, EventKind::StateChange);
    e.old_state = Some(prev.state);
    e.new_state = Some(obs.state);
    e.restart_count = obs.restart_count;
    e.description = format!("{} -> {}", prev.state, obs.state);

    if prev.state == RuntimeState::Exited && obs.state == RuntimeState::Running {
        match (prev.restart_count, obs.restart_count) {
            (Some(before), Some(after)) if after > before => {
                e.kind = EventKind::Restarted;
                e.restart_count = Some(after);
                e.description = format!("restarted (restart count {} -> {})", before, after);
            }
            (Some(_), Some(_)) => {}
            _ => {
                // The runtime counter is unavailable; count exited -> running from history.
                let counted = w
                    .summary(obs.history_key())
                    .map(|s| s.restart_events)
                    .unwrap_or(0)
                    + 1;
                e.kind = EventKind::Restarted;
                e.restart_count = Some(counted);
                e.description = format!("restarted (approximate count {} from history)", counted);
            }
        }
    }

    w.emit(e);
}

fn compare_images(w: &mut Working, prev: &ContainerSnapshot, obs: &ContainerSnapshot) {
    let changed = match (&prev.image.digest, &obs.image.digest) {
        (Some(old), Some(new)) => old != new,
        _ => prev.image.tag != obs.image.tag,
    };
    if !changed {
        return;
    }

    let mut e = w.event(obs, EventKind::ImageUpdated);
    e.new_state = Some(obs.state);
    e.old_image = Some(prev.image.tag.clone());
    e.new_image = Some(obs.image.tag.clone());
    e.old_digest = prev.image.digest.clone();
    e.new_digest = obs.image.digest.clone();
    e.description = match (&prev.image.digest, &obs.image.digest) {
        (Some(old), Some(new)) => format!(
            "image updated {} ({} -> {})",
            obs.image.tag,
            short_digest(old),
            short_digest(new)
        ),
        _ => format!("image changed {} -> {}", prev.image.tag, obs.image.tag),
    };
    w.emit(e);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ImageRef;
    use crate::lifecycle::rebuild;
    use chrono::Duration;

    const HOST: i64 = 1;

    fn snap(id: &str, name: &str, image: &str, state: RuntimeState) -> ContainerSnapshot {
        ContainerSnapshot::new(HOST, id, name, ImageRef::parse(image, None), state)
    }

    /// Run cycles the way the orchestrator does: observed becomes the next previous.
    struct Harness {
        previous: Vec<ContainerSnapshot>,
        summaries: HashMap<String, ContainerLifecycleSummary>,
        history: Vec<LifecycleEvent>,
        now: DateTime<Utc>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                previous: Vec::new(),
                summaries: HashMap::new(),
                history: Vec::new(),
                now: Utc::now(),
            }
        }

        fn cycle(&mut self, observed: Vec<ContainerSnapshot>) -> Vec<LifecycleEvent> {
            self.now += Duration::seconds(300);
            let summaries: Vec<_> = self.summaries.values().cloned().collect();
            let out = diff(HOST, &observed, &self.previous, &summaries, self.now);

            for s in out.summaries {
                self.summaries.insert(s.container_name.clone(), s);
            }
            // Latest snapshot per container id survives, like the store query.
            for o in observed {
                self.previous.retain(|p| p.container_id != o.container_id);
                self.previous.push(o);
            }
            self.history.extend(out.events.iter().cloned());
            out.events
        }

        fn kinds(events: &[LifecycleEvent]) -> Vec<EventKind> {
            events.iter().map(|e| e.kind).collect()
        }
    }

    #[test]
    fn test_first_seen_then_only_last_seen() {
        let mut h = Harness::new();
        let c = snap("c1", "web", "app:latest", RuntimeState::Running);

        let first = h.cycle(vec![c.clone()]);
        assert_eq!(Harness::kinds(&first), vec![EventKind::FirstSeen, EventKind::LastSeen]);

        let second = h.cycle(vec![c]);
        assert_eq!(Harness::kinds(&second), vec![EventKind::LastSeen]);
        assert_eq!(second[0].observations, Some(2));
    }

    #[test]
    fn test_single_disappeared() {
        let mut h = Harness::new();
        h.cycle(vec![snap("c1", "web", "app:latest", RuntimeState::Running)]);

        let gone = h.cycle(vec![]);
        assert_eq!(Harness::kinds(&gone), vec![EventKind::Disappeared]);
        assert_eq!(gone[0].old_state, Some(RuntimeState::Running));

        assert!(h.cycle(vec![]).is_empty());
        assert!(!h.summaries["web"].is_active);
    }

    #[test]
    fn test_disappeared_without_summary() {
        let prev = vec![snap("c1", "web", "app:latest", RuntimeState::Running)];
        let out = diff(HOST, &[], &prev, &[], Utc::now());
        assert_eq!(Harness::kinds(&out.events), vec![EventKind::Disappeared]);
        assert!(!out.summaries[0].is_active);

        let again = diff(HOST, &[], &prev, &out.summaries, Utc::now());
        assert!(again.events.is_empty());
    }

    #[test]
    fn test_reappeared_after_disappearing() {
        let mut h = Harness::new();
        let c = snap("c1", "web", "app:latest", RuntimeState::Running);
        h.cycle(vec![c.clone()]);
        h.cycle(vec![]);

        let back = h.cycle(vec![c]);
        assert_eq!(Harness::kinds(&back), vec![EventKind::Reappeared, EventKind::LastSeen]);
        assert!(h.summaries["web"].is_active);
    }

    #[test]
    fn test_digest_change_under_same_tag() {
        let mut h = Harness::new();
        h.cycle(vec![snap("c1", "web", "app:latest@sha256:1111", RuntimeState::Running)]);

        let events = h.cycle(vec![snap("c1", "web", "app:latest@sha256:2222", RuntimeState::Running)]);
        let transitions: Vec<_> = events.iter().filter(|e| e.kind != EventKind::LastSeen).collect();

        assert_eq!(transitions.len(), 1);
        let e = transitions[0];
        assert_eq!(e.kind, EventKind::ImageUpdated);
        assert_eq!(e.old_digest.as_deref(), Some("sha256:1111"));
        assert_eq!(e.new_digest.as_deref(), Some("sha256:2222"));
        assert!(!events.iter().any(|e| e.kind == EventKind::StateChange));
    }

    #[test]
    fn test_tag_change_with_same_digest_is_silent() {
        let mut h = Harness::new();
        h.cycle(vec![snap("c1", "web", "app:1.2@sha256:1111", RuntimeState::Running)]);

        let events = h.cycle(vec![snap("c1", "web", "app:latest@sha256:1111", RuntimeState::Running)]);
        assert_eq!(Harness::kinds(&events), vec![EventKind::LastSeen]);
    }

    #[test]
    fn test_tag_fallback_without_digest() {
        let mut h = Harness::new();
        h.cycle(vec![snap("c1", "web", "app:1", RuntimeState::Running)]);

        let events = h.cycle(vec![snap("c1", "web", "app:2", RuntimeState::Running)]);
        assert_eq!(Harness::kinds(&events), vec![EventKind::ImageUpdated, EventKind::LastSeen]);
    }

    #[test]
    fn test_restart_from_runtime_counter() {
        let mut h = Harness::new();
        let mut exited = snap("c1", "api", "api:1", RuntimeState::Exited);
        exited.restart_count = Some(2);
        h.cycle(vec![exited]);

        let mut running = snap("c1", "api", "api:1", RuntimeState::Running);
        running.restart_count = Some(3);
        let events = h.cycle(vec![running]);

        assert_eq!(Harness::kinds(&events), vec![EventKind::Restarted, EventKind::LastSeen]);
        assert_eq!(events[0].restart_count, Some(3));
        assert_eq!(h.summaries["api"].restart_events, 1);
    }

    #[test]
    fn test_manual_start_is_state_change() {
        let mut h = Harness::new();
        let mut exited = snap("c1", "api", "api:1", RuntimeState::Exited);
        exited.restart_count = Some(0);
        h.cycle(vec![exited]);

        let mut running = snap("c1", "api", "api:1", RuntimeState::Running);
        running.restart_count = Some(0);
        let events = h.cycle(vec![running]);
        assert_eq!(Harness::kinds(&events), vec![EventKind::StateChange, EventKind::LastSeen]);
    }

    #[test]
    fn test_restart_counted_from_history_is_flagged_approximate() {
        let mut h = Harness::new();
        for _ in 0..2 {
            h.cycle(vec![snap("c1", "job", "job:1", RuntimeState::Exited)]);
            h.cycle(vec![snap("c1", "job", "job:1", RuntimeState::Running)]);
        }

        let restarts: Vec<_> = h
            .history
            .iter()
            .filter(|e| e.kind == EventKind::Restarted)
            .collect();
        assert_eq!(restarts.len(), 2);
        assert_eq!(restarts[1].restart_count, Some(2));
        assert!(restarts.iter().all(|e| e.description.contains("approximate")));
    }

    #[test]
    fn test_flap_between_polls_is_invisible() {
        let mut h = Harness::new();
        let mut before = snap("c1", "worker", "worker:1", RuntimeState::Running);
        before.restart_count = Some(4);
        h.cycle(vec![before]);

        // running -> exited -> running happened between the two polls.
        let mut after = snap("c1", "worker", "worker:1", RuntimeState::Running);
        after.restart_count = Some(5);
        let events = h.cycle(vec![after]);
        assert_eq!(Harness::kinds(&events), vec![EventKind::LastSeen]);
    }

    #[test]
    fn test_recreated_container_keeps_history() {
        let mut h = Harness::new();
        h.cycle(vec![snap("old-id", "web", "app:1", RuntimeState::Running)]);

        let events = h.cycle(vec![snap("new-id", "web", "app:2", RuntimeState::Running)]);
        assert_eq!(Harness::kinds(&events), vec![EventKind::ImageUpdated, EventKind::LastSeen]);
        assert_eq!(h.summaries["web"].container_id, "new-id");

        // The old ID's snapshot is still "latest" for that ID but must not count as gone.
        let events = h.cycle(vec![snap("new-id", "web", "app:2", RuntimeState::Running)]);
        assert_eq!(Harness::kinds(&events), vec![EventKind::LastSeen]);
    }

    #[test]
    fn test_malformed_record_degrades() {
        let mut h = Harness::new();
        let good = snap("c1", "web", "app:1", RuntimeState::Running);
        let bad = snap("c2", "db", "db:1", RuntimeState::Unknown);

        let events = h.cycle(vec![good.clone(), bad]);
        let db: Vec<_> = events.iter().filter(|e| e.container_name == "db").collect();
        assert_eq!(Harness::kinds(&events), vec![
            EventKind::FirstSeen,
            EventKind::LastSeen,
            EventKind::FirstSeen,
            EventKind::LastSeen,
        ]);
        assert_eq!(db[0].new_state, Some(RuntimeState::Unknown));

        // The good container turning malformed degrades to one generic change.
        let broken = snap("c1", "web", "app:1", RuntimeState::Unknown);
        let events = h.cycle(vec![broken]);
        let web: Vec<_> = events.iter().filter(|e| e.container_name == "web").collect();
        assert_eq!(web[0].kind, EventKind::StateChange);
        assert!(web[0].description.contains("unclassified"));
    }

    #[test]
    fn test_malformed_record_emits_once_per_episode() {
        let mut h = Harness::new();
        let bad = snap("c2", "db", "db:1", RuntimeState::Unknown);

        let first = h.cycle(vec![bad.clone()]);
        assert_eq!(Harness::kinds(&first), vec![EventKind::FirstSeen, EventKind::LastSeen]);
        for _ in 0..2 {
            let again = h.cycle(vec![bad.clone()]);
            assert_eq!(Harness::kinds(&again), vec![EventKind::LastSeen]);
        }
        assert_eq!(h.summaries["db"].state_changes, 0);

        // Recovery is an ordinary transition out of the unknown state.
        let events = h.cycle(vec![snap("c2", "db", "db:1", RuntimeState::Running)]);
        assert_eq!(Harness::kinds(&events), vec![EventKind::StateChange, EventKind::LastSeen]);
    }

    #[test]
    fn test_summary_matches_rebuild() {
        let mut h = Harness::new();
        let mut cycles = vec![
            vec![snap("c1", "web", "app:1@sha256:aa", RuntimeState::Running)],
            vec![snap("c1", "web", "app:1@sha256:aa", RuntimeState::Exited)],
            vec![snap("c1", "web", "app:1@sha256:aa", RuntimeState::Running)],
            vec![snap("c1", "web", "app:1@sha256:bb", RuntimeState::Running)],
            vec![],
            vec![],
            vec![snap("c1", "web", "app:1@sha256:bb", RuntimeState::Paused)],
        ];
        for observed in cycles.drain(..) {
            h.cycle(observed);
        }

        let web_history: Vec<_> = h
            .history
            .iter()
            .filter(|e| e.container_name == "web")
            .cloned()
            .collect();
        assert_eq!(rebuild(&web_history).unwrap(), h.summaries["web"]);
        assert_eq!(h.summaries["web"].image_updates, 1);
        assert_eq!(h.summaries["web"].current_state, Some(RuntimeState::Paused));
    }
}
