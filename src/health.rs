//! Failure visibility for dispatch targets.
//!
//! Every delivery outcome is recorded against its target. A failing target
//! is not backed off; it is retried on its normal schedule and the failure
//! stays visible until it succeeds again or an operator resets it.

use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::sync::Arc;
use tracing::error;

use crate::db::{DbError, Store, TargetHealth, TargetKind};

#[derive(Clone)]
pub struct HealthTracker {
    store: Arc<Store>,
}

impl HealthTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Record the outcome of one attempt. Store errors are logged, never returned.
    pub fn record<E: Display>(&self, kind: TargetKind, name: &str, outcome: &Result<(), E>, at: DateTime<Utc>) {
        let res = match outcome {
            Ok(()) => self.store.record_target_success(kind, name, at),
            Err(e) => self.store.record_target_failure(kind, name, at, &e.to_string()),
        };
        if let Err(e) = res {
            error!("Failed to record health of {} {}: {}", kind.as_str(), name, e);
        }
    }

    /// Clear a recorded failure.
    pub fn reset_failure(&self, kind: TargetKind, name: &str) -> Result<(), DbError> {
        self.store.clear_target_failure(kind, name)
    }

    pub fn get(&self, kind: TargetKind, name: &str) -> Result<Option<TargetHealth>, DbError> {
        self.store.get_target_health(kind, name)
    }

    /// Targets whose most recent attempt failed.
    pub fn failing(&self) -> Result<Vec<TargetHealth>, DbError> {
        Ok(self
            .store
            .list_target_health()?
            .into_iter()
            .filter(TargetHealth::is_failing)
            .collect())
    }
}
