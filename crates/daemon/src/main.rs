//! Station Relay - Main Entry Point
//! Watches the station output directory and relays records to the collector outbox

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use relay_core::application::pool::constants::DEFAULT_DISPOSE_TIMEOUT;
use relay_core::application::{
    shutdown_channel, CircuitBreaker, CircuitBreakerConfig, ClientOperationSender, ConverterBinding,
    ConverterPool, DeliveryQueueConfig, DeliveryQueueManager, PoolConfig,
};
use relay_core::port::time_provider::SystemTimeProvider;
use relay_core::port::{DeliveryClient, DeliveryError, PostProcess, SourceInbox, WorkQueue};
use relay_infra_fs::{
    FileArrivalWatcher, FsInbox, FsOperationStore, JsonPassthroughConverter, OutboxDeliveryClient,
    PersistentQueue, PersistentQueueConfig, WatcherConfig,
};

use config::RelayConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_LOG_FILTER: &str = "station_relay=info,relay_core=info,relay_infra_fs=info";

/// Install the subscriber; the guard must live until exit to flush file output
fn init_tracing(config: &RelayConfig) -> Result<Option<WorkerGuard>> {
    let log_format = std::env::var("RELAY_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .context("Failed to create env filter")?;

    let console = match log_format.as_str() {
        // Production: JSON structured logging
        "json" => fmt::layer().json().boxed(),
        _ => fmt::layer().pretty().boxed(),
    };

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "station-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration + logging
    let config = RelayConfig::from_env()?;
    let _log_guard = init_tracing(&config)?;
    info!("Station Relay v{} starting...", VERSION);
    info!(
        data_dir = %config.data_dir.display(),
        watch_dir = %config.watch_dir.display(),
        outbox_dir = %config.outbox_dir.display(),
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.watch_dir)
        .with_context(|| format!("cannot create {}", config.watch_dir.display()))?;

    // 2. Persistent queue (crash recovery happens during open)
    let queue = Arc::new(
        PersistentQueue::open(PersistentQueueConfig {
            default_max_attempts: config.max_attempts,
            delete_on_completion: config.delete_completed,
            ..PersistentQueueConfig::new(config.queue_dir())
        })
        .context("Failed to open persistent queue")?,
    );
    info!(items = queue.size(), "Persistent queue ready");

    // 3. Adapters (DI wiring)
    let client: Arc<dyn DeliveryClient> = Arc::new(
        OutboxDeliveryClient::new(&config.outbox_dir).context("Failed to open outbox")?,
    );
    let inbox: Arc<dyn SourceInbox> = Arc::new(FsInbox::new());
    let breaker_config = CircuitBreakerConfig {
        failure_threshold: config.breaker_failures,
        timeout: config.breaker_timeout,
        ..Default::default()
    }
    // Rejected records say nothing about collector health
    .exclude_when(|err| {
        err.downcast_ref::<DeliveryError>()
            .map(DeliveryError::is_permanent)
            .unwrap_or(false)
    });
    let breaker = Arc::new(CircuitBreaker::new("collector", breaker_config));

    // 4. Converter pool
    let bindings = vec![ConverterBinding::new(
        Arc::new(JsonPassthroughConverter::new()),
        &config.watch_dir,
    )
    .with_post_process(PostProcess::Move(config.data_dir.join("archive")))];

    let pool = Arc::new(ConverterPool::new(
        queue.clone(),
        breaker.clone(),
        client.clone(),
        inbox.clone(),
        bindings,
        PoolConfig {
            max_workers: config.max_workers,
            max_attempts: config.max_attempts,
            enable_startup_scan: config.startup_scan,
            ..Default::default()
        },
    ));

    // 5. File watcher, attached before the startup scan so no arrival is missed
    let watcher = Arc::new(FileArrivalWatcher::new(
        pool.clone(),
        inbox.clone(),
        WatcherConfig::default(),
    ));
    match watcher.start_background().await {
        Ok(Ok(())) => info!("File watcher attached"),
        Ok(Err(e)) => warn!(error = %e, "Running without file watcher"),
        Err(e) => warn!(error = %e, "File watcher start task failed"),
    }

    let scan = pool.start().await.context("Failed to start converter pool")?;
    info!(
        scanned = scan.scanned,
        queued = scan.queued,
        skipped = scan.skipped,
        errors = scan.errors,
        "Startup reconciliation done"
    );

    // 6. Delivery queue for operations
    let store = Arc::new(
        FsOperationStore::new(config.operations_dir()).context("Failed to open operation store")?,
    );
    let delivery = Arc::new(DeliveryQueueManager::new(
        store,
        Arc::new(ClientOperationSender::new(client.clone())),
        Arc::new(SystemTimeProvider),
        DeliveryQueueConfig::default(),
    ));
    match delivery.pending_count() {
        Ok(count) => info!(pending_operations = count, "Delivery queue ready"),
        Err(e) => warn!(error = %e, "Could not count pending operations"),
    }

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let delivery_handle = {
        let delivery = delivery.clone();
        tokio::spawn(async move {
            if let Err(e) = delivery.run(shutdown_rx).await {
                error!(error = %e, "Delivery loop failed");
            }
        })
    };

    info!("System ready. Waiting for files...");
    info!("Press Ctrl+C to shutdown");

    // 7. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully...");

    // 8. Graceful shutdown: stop intake first, then drain workers
    if let Err(e) = watcher.dispose(watcher.config().dispose_timeout).await {
        warn!(error = %e, "Watcher shutdown failed");
    }
    if let Err(e) = pool.dispose(DEFAULT_DISPOSE_TIMEOUT).await {
        warn!(error = %e, "Pool shutdown failed");
    }
    shutdown_tx.shutdown();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), delivery_handle).await;

    let stats = pool.get_stats();
    info!(
        delivered = stats.delivered,
        failed = stats.failed,
        pending = stats.queue.pending,
        "Shutdown complete."
    );
    Ok(())
}
