//! fleetwatch - container fleet monitor.

use fleetwatch::config::ServerConfig;
use fleetwatch::connector::TransportFactory;
use fleetwatch::db::Store;
use fleetwatch::downstream::{log_scan_requests, EventBus};
use fleetwatch::notify::{seed_default_notifications, Notifier};
use fleetwatch::scheduler::{Orchestrator, Scheduler};
use fleetwatch::settings;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("fleetwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load()?;
    tracing::info!("Starting fleetwatch...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Seed hosts if none exist
    if store.get_hosts()?.is_empty() {
        for seed in &cfg.hosts {
            let mut host = seed.to_host();
            store.add_host(&mut host)?;
            tracing::info!("Added host {} ({})", host.name, host.address);
        }
    }

    // Seed the in-app channel and default rules on first start
    seed_default_notifications(&store)?;

    let scan = settings::seed(&store, cfg.scan.clone())?;
    tracing::info!(
        "Scanning every {}s, host timeout {}s",
        scan.interval().as_secs(),
        scan.host_timeout().as_secs()
    );
    let notify = settings::seed(&store, cfg.notifications.clone())?;

    let factory = Arc::new(TransportFactory::new(reqwest::Client::new()));
    let notifier = Arc::new(Notifier::new(store.clone(), notify));
    let bus = EventBus::new();
    tokio::spawn(log_scan_requests(bus.subscribe_scans()));

    let orchestrator = Arc::new(Orchestrator::new(store.clone(), factory, notifier.clone(), bus));
    let scheduler = Scheduler::new(store, orchestrator, notifier);
    scheduler.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.stop().await;

    Ok(())
}
