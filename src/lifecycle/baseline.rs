//! Usage baselines.
//!
//! A baseline is the average CPU and memory use of a container under one
//! image. The baseline taken just before an image update is what the
//! notifier compares post-update samples against.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::db::{ContainerBaseline, DbError, EventKind, LifecycleEvent, RuntimeState, SnapshotStore, Store};

/// Samples averaged into a baseline.
pub const BASELINE_WINDOW_HOURS: i64 = 48;
/// Fewer samples than this give no baseline.
pub const MIN_BASELINE_SAMPLES: u32 = 10;
/// How long after an update samples are compared against the old baseline.
pub const ANOMALY_WATCH_HOURS: i64 = 24;
/// Relative increase over the baseline that counts as anomalous.
pub const ANOMALY_INCREASE: f64 = 0.25;

/// Take a baseline for every container whose image changed in `events`.
///
/// Must run before the new observation set is stored so that only samples
/// taken under the old image are averaged.
pub fn capture_on_update<S: SnapshotStore + ?Sized>(
    store: &S,
    host_id: i64,
    events: &[LifecycleEvent],
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let mut saved = 0;
    for event in events.iter().filter(|e| e.kind == EventKind::ImageUpdated) {
        let image = event
            .old_digest
            .as_deref()
            .or(event.old_image.as_deref())
            .unwrap_or_default();
        if take(store, host_id, &event.container_name, image, now)? {
            saved += 1;
        }
    }
    Ok(saved)
}

/// Refresh the baselines of all running containers.
///
/// A baseline still inside its post-update watch window is left alone.
pub fn refresh(store: &Store, now: DateTime<Utc>) -> Result<usize, DbError> {
    let mut saved = 0;
    for snapshot in store.get_latest_all()? {
        if snapshot.state != RuntimeState::Running {
            continue;
        }
        let image = snapshot.image.identity();
        if let Some(existing) = store.get_baseline(snapshot.host_id, &snapshot.name)? {
            if existing.image != image && watching(&existing, now) {
                continue;
            }
        }
        if take(store, snapshot.host_id, &snapshot.name, image, now)? {
            saved += 1;
        }
    }
    Ok(saved)
}

/// Whether samples are still compared against this baseline.
pub fn watching(baseline: &ContainerBaseline, now: DateTime<Utc>) -> bool {
    now - baseline.window_end <= Duration::hours(ANOMALY_WATCH_HOURS)
}

/// Relative increase of `current` over `average`, if the average is usable.
pub fn increase(current: f64, average: f64) -> Option<f64> {
    (average > 0.0).then(|| (current - average) / average)
}

fn take<S: SnapshotStore + ?Sized>(
    store: &S,
    host_id: i64,
    container_name: &str,
    image: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let since = now - Duration::hours(BASELINE_WINDOW_HOURS);
    let Some((cpu, memory, count)) = store.average_usage(host_id, container_name, since)? else {
        return Ok(false);
    };
    if count < MIN_BASELINE_SAMPLES {
        debug!(
            "Not enough samples for a baseline of {} on host {} ({})",
            container_name, host_id, count
        );
        return Ok(false);
    }

    store.save_baseline(&ContainerBaseline {
        host_id,
        container_name: container_name.to_string(),
        image: image.to_string(),
        avg_cpu_percent: cpu,
        avg_memory_percent: memory,
        sample_count: count,
        window_start: since,
        window_end: now,
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ContainerSnapshot, Host, ImageRef, ResourceStats};
    use crate::lifecycle::record_cycle;
    use tempfile::NamedTempFile;

    fn sample(host_id: i64, image: &str, cpu: f64) -> ContainerSnapshot {
        let mut s = ContainerSnapshot::new(host_id, "c1", "web", ImageRef::parse(image, None), RuntimeState::Running);
        s.stats = Some(ResourceStats {
            cpu_percent: cpu,
            memory_usage: 100,
            memory_limit: 1000,
            memory_percent: 10.0,
        });
        s
    }

    #[test]
    fn test_baseline_taken_at_image_update() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut host = Host {
            name: "a".to_string(),
            ..Default::default()
        };
        let host_id = store.add_host(&mut host).unwrap();

        let mut now = Utc::now() - Duration::hours(2);
        for _ in 0..MIN_BASELINE_SAMPLES {
            now += Duration::minutes(5);
            record_cycle(&store, host_id, &[sample(host_id, "app:1@sha256:aa", 20.0)], now).unwrap();
        }
        assert!(store.get_baseline(host_id, "web").unwrap().is_none());

        now += Duration::minutes(5);
        record_cycle(&store, host_id, &[sample(host_id, "app:1@sha256:bb", 90.0)], now).unwrap();

        let baseline = store.get_baseline(host_id, "web").unwrap().unwrap();
        assert_eq!(baseline.image, "sha256:aa");
        assert_eq!(baseline.sample_count, MIN_BASELINE_SAMPLES);
        assert!((baseline.avg_cpu_percent - 20.0).abs() < 1e-9);
        assert_eq!(baseline.window_end, now);

        // Still inside the watch window: the pre-update baseline is kept.
        assert_eq!(refresh(&store, now + Duration::hours(1)).unwrap(), 0);
        assert_eq!(store.get_baseline(host_id, "web").unwrap().unwrap().image, "sha256:aa");

        // Afterwards it follows the image the container runs now.
        assert_eq!(refresh(&store, now + Duration::hours(25)).unwrap(), 1);
        assert_eq!(store.get_baseline(host_id, "web").unwrap().unwrap().image, "sha256:bb");
    }

    #[test]
    fn test_too_few_samples_give_no_baseline() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut host = Host {
            name: "a".to_string(),
            ..Default::default()
        };
        let host_id = store.add_host(&mut host).unwrap();

        let now = Utc::now();
        record_cycle(&store, host_id, &[sample(host_id, "app:1", 20.0)], now).unwrap();
        let out = record_cycle(&store, host_id, &[sample(host_id, "app:2", 20.0)], now + Duration::minutes(5)).unwrap();
        assert_eq!(capture_on_update(&store, host_id, &out.events, now).unwrap(), 0);
        assert!(store.get_baseline(host_id, "web").unwrap().is_none());
    }

    #[test]
    fn test_increase() {
        assert_eq!(increase(30.0, 20.0), Some(0.5));
        assert_eq!(increase(30.0, 0.0), None);
    }
}
