//! Per-container lifecycle rollups.
//!
//! A summary is a fold over the container's event history. The incremental
//! path (one cycle's events applied to the stored summary) and the rebuild
//! path (all events applied to an empty summary) share [`apply`], so both
//! always agree.
//!
//! [`apply`]: ContainerLifecycleSummary::apply

use crate::db::{ContainerLifecycleSummary, EventKind, LifecycleEvent};

impl ContainerLifecycleSummary {
    /// Empty summary for the container an event belongs to.
    pub fn seed(event: &LifecycleEvent) -> Self {
        Self {
            host_id: event.host_id,
            container_name: event.container_name.clone(),
            container_id: event.container_id.clone(),
            image: String::new(),
            current_state: None,
            first_seen: event.timestamp,
            last_seen: event.timestamp,
            is_active: false,
            state_changes: 0,
            image_updates: 0,
            restart_events: 0,
            total_observations: 0,
        }
    }

    /// Fold one event into the summary.
    pub fn apply(&mut self, event: &LifecycleEvent) {
        if !event.container_id.is_empty() {
            self.container_id = event.container_id.clone();
        }

        match event.kind {
            EventKind::FirstSeen => {
                self.first_seen = event.timestamp;
                self.mark_observed(event);
                self.set_image(event);
            }
            EventKind::Reappeared => {
                self.mark_observed(event);
                self.set_image(event);
            }
            EventKind::Disappeared => {
                self.is_active = false;
            }
            EventKind::StateChange => {
                self.state_changes += 1;
                self.mark_observed(event);
            }
            EventKind::Restarted => {
                self.state_changes += 1;
                self.restart_events += 1;
                self.mark_observed(event);
            }
            EventKind::ImageUpdated => {
                self.image_updates += 1;
                self.mark_observed(event);
                self.set_image(event);
            }
            EventKind::LastSeen => {
                self.total_observations = event
                    .observations
                    .unwrap_or(self.total_observations + 1);
                self.last_seen = event.timestamp;
                self.mark_observed(event);
            }
            EventKind::HighCpu | EventKind::HighMemory | EventKind::AnomalousBehavior => {}
        }
    }

    fn mark_observed(&mut self, event: &LifecycleEvent) {
        self.is_active = true;
        if let Some(state) = event.new_state {
            self.current_state = Some(state);
        }
    }

    fn set_image(&mut self, event: &LifecycleEvent) {
        if let Some(image) = &event.new_image {
            self.image = image.clone();
        }
    }
}

/// Rebuild a summary from a container's full event history, oldest first.
pub fn rebuild(events: &[LifecycleEvent]) -> Option<ContainerLifecycleSummary> {
    let first = events.first()?;
    let mut summary = ContainerLifecycleSummary::seed(first);
    for event in events {
        summary.apply(event);
    }
    Some(summary)
}
