//! Fan-out of lifecycle events to downstream consumers.
//!
//! Consumers such as an image vulnerability scanner subscribe to the bus.
//! Publishing never blocks the scan path; a lagging subscriber loses the
//! oldest messages.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::db::{EventKind, LifecycleEvent};

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPriority {
    Normal,
    High,
}

/// Request to scan one image, keyed by digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageScanRequest {
    pub digest: String,
    pub image: String,
    pub host_id: i64,
    pub priority: ScanPriority,
}

impl ImageScanRequest {
    /// New or updated images are worth scanning; everything else is not.
    pub fn from_event(event: &LifecycleEvent) -> Option<Self> {
        let priority = match event.kind {
            EventKind::ImageUpdated => ScanPriority::High,
            EventKind::FirstSeen => ScanPriority::Normal,
            _ => return None,
        };
        let digest = event.new_digest.clone().filter(|d| !d.is_empty())?;
        Some(Self {
            digest,
            image: event.new_image.clone().unwrap_or_default(),
            host_id: event.host_id,
            priority,
        })
    }
}

#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<Arc<LifecycleEvent>>,
    scans: broadcast::Sender<ImageScanRequest>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BUS_CAPACITY);
        let (scans, _) = broadcast::channel(BUS_CAPACITY);
        Self { events, scans }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Arc<LifecycleEvent>> {
        self.events.subscribe()
    }

    pub fn subscribe_scans(&self) -> broadcast::Receiver<ImageScanRequest> {
        self.scans.subscribe()
    }

    /// Publish one host's transitions. `last_seen` markers are not published.
    pub fn publish<'a>(&self, events: impl IntoIterator<Item = &'a LifecycleEvent>) {
        let mut published = 0;
        for event in events {
            if event.kind == EventKind::LastSeen {
                continue;
            }
            if let Some(req) = ImageScanRequest::from_event(event) {
                // No subscribers is not an error.
                let _ = self.scans.send(req);
            }
            let _ = self.events.send(Arc::new(event.clone()));
            published += 1;
        }
        if published > 0 {
            debug!("Published {} lifecycle events", published);
        }
    }
}

/// Log scan requests until the bus closes. Stands in for a scanner when none
/// is attached.
pub async fn log_scan_requests(mut rx: broadcast::Receiver<ImageScanRequest>) {
    loop {
        match rx.recv().await {
            Ok(req) => info!(
                "Image scan requested for {} ({}, {:?} priority)",
                req.image, req.digest, req.priority
            ),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Scan request log lagged, {} dropped", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(kind: EventKind, digest: Option<&str>) -> LifecycleEvent {
        let mut e = LifecycleEvent::new(1, "c1", "web", kind, Utc::now());
        e.new_image = Some("app:1".to_string());
        e.new_digest = digest.map(str::to_string);
        e
    }

    #[test]
    fn test_scan_priority_by_kind() {
        let high = ImageScanRequest::from_event(&event(EventKind::ImageUpdated, Some("sha256:bb"))).unwrap();
        assert_eq!(high.priority, ScanPriority::High);
        assert_eq!(high.digest, "sha256:bb");

        let normal = ImageScanRequest::from_event(&event(EventKind::FirstSeen, Some("sha256:aa"))).unwrap();
        assert_eq!(normal.priority, ScanPriority::Normal);

        assert!(ImageScanRequest::from_event(&event(EventKind::StateChange, Some("sha256:aa"))).is_none());
        assert!(ImageScanRequest::from_event(&event(EventKind::FirstSeen, None)).is_none());
    }

    #[tokio::test]
    async fn test_publish_skips_last_seen() {
        let bus = EventBus::new();
        let mut events = bus.subscribe_events();
        let mut scans = bus.subscribe_scans();

        let batch = [
            event(EventKind::FirstSeen, Some("sha256:aa")),
            event(EventKind::LastSeen, None),
        ];
        bus.publish(&batch);

        assert_eq!(events.recv().await.unwrap().kind, EventKind::FirstSeen);
        assert!(events.try_recv().is_err());
        assert_eq!(scans.recv().await.unwrap().digest, "sha256:aa");
    }
}
