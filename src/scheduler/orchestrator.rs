//! Scan cycles.
//!
//! A cycle probes every enabled host in its scope with bounded parallelism.
//! Each probe has its own deadline and the cycle as a whole has another; a
//! host that fails or runs out of time is recorded as a failed scan and
//! never affects the others. Once the probes settle, every host's outcome is
//! persisted, diffed and evaluated on its own.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::connector::{observe_host, ConnectorError, ConnectorFactory};
use crate::db::{ContainerSnapshot, Host, HostStatus, ScanResult, Store};
use crate::downstream::EventBus;
use crate::lifecycle::record_cycle;
use crate::notify::Notifier;
use crate::settings::{self, ScanSettings};

/// Upper bound of the random delay before each probe, in milliseconds.
const PROBE_JITTER_MS: u64 = 100;

pub const DEADLINE_EXCEEDED: &str = "cycle deadline exceeded";

/// The set of hosts a cycle covers. At most one cycle per scope runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanScope {
    All,
    Host(i64),
}

impl fmt::Display for ScanScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all hosts"),
            Self::Host(id) => write!(f, "host {}", id),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub scope: ScanScope,
    pub started_at: DateTime<Utc>,
    pub results: Vec<ScanResult>,
    pub transitions: usize,
}

struct ProbeOutcome {
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
    result: Result<Vec<ContainerSnapshot>, ConnectorError>,
}

/// Marks a scope busy until dropped.
struct ScopeGuard<'a> {
    busy: &'a Mutex<HashSet<ScanScope>>,
    scope: ScanScope,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.scope);
    }
}

pub struct Orchestrator {
    store: Arc<Store>,
    factory: Arc<dyn ConnectorFactory>,
    notifier: Arc<Notifier>,
    bus: EventBus,
    busy: Mutex<HashSet<ScanScope>>,
    host_locks: DashMap<i64, Arc<tokio::sync::Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, factory: Arc<dyn ConnectorFactory>, notifier: Arc<Notifier>, bus: EventBus) -> Self {
        Self {
            store,
            factory,
            notifier,
            bus,
            busy: Mutex::new(HashSet::new()),
            host_locks: DashMap::new(),
        }
    }

    /// Start a cycle in the background and return immediately.
    pub fn trigger(self: &Arc<Self>, scope: ScanScope) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_cycle(scope).await;
        });
    }

    fn try_begin(&self, scope: ScanScope) -> Option<ScopeGuard<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(scope) {
            return None;
        }
        Some(ScopeGuard {
            busy: &self.busy,
            scope,
        })
    }

    fn host_lock(&self, host_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.host_locks.entry(host_id).or_default().clone()
    }

    fn hosts_in_scope(&self, scope: ScanScope) -> Result<Vec<Host>, crate::db::DbError> {
        let hosts = match scope {
            ScanScope::All => self.store.get_hosts()?,
            ScanScope::Host(id) => vec![self.store.get_host(id)?],
        };
        Ok(hosts.into_iter().filter(|h| h.enabled).collect())
    }

    /// Run one cycle. Returns `None` when a cycle for the same scope is
    /// already running or the cycle could not start.
    pub async fn run_cycle(&self, scope: ScanScope) -> Option<CycleReport> {
        let Some(_guard) = self.try_begin(scope) else {
            info!("Scan of {} already in progress, skipping", scope);
            return None;
        };

        let settings: ScanSettings = match settings::load(&self.store) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to load scan settings: {}", e);
                return None;
            }
        };
        let hosts = match self.hosts_in_scope(scope) {
            Ok(h) => h,
            Err(e) => {
                error!("Failed to load hosts for {}: {}", scope, e);
                return None;
            }
        };

        let started_at = Utc::now();
        info!("Starting scan of {} ({} hosts)", scope, hosts.len());

        let mut outcomes = self.probe_all(&hosts, &settings).await;
        let results = join_all(hosts.iter().map(|host| {
            let outcome = outcomes.remove(&host.id);
            self.process_host(host, outcome)
        }))
        .await;

        let transitions: usize = results.iter().map(|(_, n)| n).sum();
        let results: Vec<ScanResult> = results.into_iter().map(|(r, _)| r).collect();
        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            "Scan of {} finished in {}ms: {} ok, {} failed, {} transitions",
            scope,
            (Utc::now() - started_at).num_milliseconds(),
            results.len() - failed,
            failed,
            transitions
        );

        Some(CycleReport {
            scope,
            started_at,
            results,
            transitions,
        })
    }

    async fn probe_all(&self, hosts: &[Host], settings: &ScanSettings) -> HashMap<i64, ProbeOutcome> {
        let semaphore = Arc::new(Semaphore::new(settings.concurrency()));
        let host_timeout = settings.host_timeout();
        let mut set = JoinSet::new();

        for host in hosts {
            let factory = self.factory.clone();
            let semaphore = semaphore.clone();
            let host = host.clone();

            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let jitter = rand::random::<u64>() % PROBE_JITTER_MS;
                tokio::time::sleep(Duration::from_millis(jitter)).await;

                let started = Utc::now();
                let attempt = tokio::time::timeout(host_timeout, scan_host(factory.as_ref(), &host, host_timeout));
                let result = match AssertUnwindSafe(attempt).catch_unwind().await {
                    Ok(Ok(r)) => r,
                    Ok(Err(_)) => Err(ConnectorError::Timeout(host_timeout)),
                    Err(panic) => {
                        let reason = panic_message(panic.as_ref());
                        error!("Scan task for {} panicked: {}", host.name, reason);
                        Err(ConnectorError::Api(format!("scan task panicked: {}", reason)))
                    }
                };
                (
                    host.id,
                    ProbeOutcome {
                        started,
                        finished: Utc::now(),
                        result,
                    },
                )
            });
        }

        let mut outcomes = HashMap::new();
        let deadline = tokio::time::sleep(settings.cycle_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((id, outcome))) => {
                        outcomes.insert(id, outcome);
                    }
                    Some(Err(e)) => error!("Probe task failed: {}", e),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!("Scan deadline reached with {} probe(s) outstanding", set.len());
                    set.abort_all();
                    break;
                }
            }
        }

        outcomes
    }

    /// Persist and evaluate one host's outcome. `None` means the probe did
    /// not finish before the cycle deadline.
    async fn process_host(&self, host: &Host, outcome: Option<ProbeOutcome>) -> (ScanResult, usize) {
        let now = Utc::now();
        let mut result = ScanResult {
            id: 0,
            host_id: host.id,
            started_at: outcome.as_ref().map_or(now, |o| o.started),
            completed_at: outcome.as_ref().map_or(now, |o| o.finished),
            success: false,
            containers_found: 0,
            error: None,
        };

        let mut transitions = 0;
        match outcome.map(|o| o.result) {
            Some(Ok(observed)) => {
                result.containers_found = observed.len();
                match self.record(host, &observed, result.completed_at).await {
                    Ok(n) => {
                        result.success = true;
                        transitions = n;
                        self.set_status(host, HostStatus::Online, Some(result.completed_at));
                    }
                    Err(e) => {
                        error!("Failed to record scan of {}: {}", host.name, e);
                        result.error = Some(format!("store error: {}", e));
                    }
                }
            }
            Some(Err(e)) => {
                warn!("Scan of {} failed: {}", host.name, e);
                result.error = Some(e.to_string());
                self.set_status(host, e.host_status(), None);
            }
            None => {
                warn!("Scan of {} failed: {}", host.name, DEADLINE_EXCEEDED);
                result.error = Some(DEADLINE_EXCEEDED.to_string());
                self.set_status(host, HostStatus::Offline, None);
            }
        }

        if let Err(e) = self.store.save_scan_result(&result) {
            error!("Failed to save scan result for {}: {}", host.name, e);
        }
        (result, transitions)
    }

    async fn record(
        &self,
        host: &Host,
        observed: &[ContainerSnapshot],
        at: DateTime<Utc>,
    ) -> Result<usize, crate::db::DbError> {
        let outcome = {
            let lock = self.host_lock(host.id);
            let _held = lock.lock().await;
            record_cycle(self.store.as_ref(), host.id, observed, at)?
        };

        let transitions = outcome.transitions().count();
        info!(
            "Host {}: {} containers, {} transitions",
            host.name,
            observed.len(),
            transitions
        );
        self.bus.publish(outcome.transitions());

        if let Err(e) = self.notifier.process_events(host, &outcome.events, at).await {
            error!("Failed to evaluate events for {}: {}", host.name, e);
        }
        if host.collect_stats {
            if let Err(e) = self.notifier.process_samples(host, observed, at).await {
                error!("Failed to evaluate samples for {}: {}", host.name, e);
            }
        }
        Ok(transitions)
    }

    fn set_status(&self, host: &Host, status: HostStatus, last_seen: Option<DateTime<Utc>>) {
        if let Err(e) = self.store.set_host_status(host.id, status, last_seen) {
            error!("Failed to update status of {}: {}", host.name, e);
        }
    }
}

async fn scan_host(
    factory: &dyn ConnectorFactory,
    host: &Host,
    timeout: Duration,
) -> Result<Vec<ContainerSnapshot>, ConnectorError> {
    let connector = factory.connect(host, timeout).await?;
    observe_host(connector.as_ref(), host.collect_stats).await
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
