//! Lifecycle tracking.
//!
//! Turns consecutive observation sets of a host into typed lifecycle events
//! and keeps the per-container summaries in step with the event history.

mod baseline;
mod diff;
mod summary;

pub use baseline::*;
pub use diff::*;
pub use summary::*;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::db::{ContainerSnapshot, DbError, SnapshotStore, SummaryFilter};

/// Diff one host's observation set against the store and persist the result.
///
/// Snapshots, events and touched summaries are written in one transaction.
/// An image update first takes the container's usage baseline under the old
/// image. Callers serialize calls per host.
pub fn record_cycle<S: SnapshotStore + ?Sized>(
    store: &S,
    host_id: i64,
    observed: &[ContainerSnapshot],
    now: DateTime<Utc>,
) -> Result<DiffOutcome, DbError> {
    let previous = store.get_latest_by_host(host_id)?;
    let summaries = store.get_summaries(&SummaryFilter {
        host_id: Some(host_id),
        ..Default::default()
    })?;

    let outcome = diff(host_id, observed, &previous, &summaries, now);
    if let Err(e) = capture_on_update(store, host_id, &outcome.events, now) {
        warn!("Failed to take usage baseline on host {}: {}", host_id, e);
    }
    store.record_observation(observed, &outcome.events, &outcome.summaries)?;
    Ok(outcome)
}
