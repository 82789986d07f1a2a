// Converter Pool - bounded workers driving conversion + delivery

pub mod constants;
mod panic_guard;
mod shutdown;
mod startup_scan;
mod worker;

use constants::*;
pub use panic_guard::{execute_guarded, panic_message, PanicGuardResult};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
pub use startup_scan::ScanStats;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

use crate::application::breaker::CircuitBreaker;
use crate::application::queue::AsyncQueue;
use crate::application::retry::RetryPolicy;
use crate::domain::{
    ConversionTask, ItemId, ItemPayload, ItemStatus, NewItem, Priority, QueueItem,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY,
};
use crate::error::{AppError, Result};
use crate::port::{Converter, DeliveryClient, PostProcess, QueueStats, SourceInbox, WorkQueue};

/// Progress callback: (completed, total)
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Pool configuration
#[derive(Clone)]
pub struct PoolConfig {
    /// Clamped to [MIN_WORKERS, MAX_WORKERS]
    pub max_workers: usize,
    /// Attempt budget for items the pool enqueues
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub max_retry_delay: Duration,
    /// Retried items drop one priority step
    pub demote_on_retry: bool,
    pub enable_startup_scan: bool,
    /// 0 = unlimited
    pub startup_scan_max_files: usize,
    pub dedup_ttl: Duration,
    pub idle_poll: Duration,
    pub on_progress: Option<ProgressCallback>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            demote_on_retry: false,
            enable_startup_scan: true,
            startup_scan_max_files: DEFAULT_STARTUP_SCAN_MAX_FILES,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            idle_poll: IDLE_POLL_INTERVAL,
            on_progress: None,
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("max_workers", &self.max_workers)
            .field("max_attempts", &self.max_attempts)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("max_retry_delay", &self.max_retry_delay)
            .field("demote_on_retry", &self.demote_on_retry)
            .field("enable_startup_scan", &self.enable_startup_scan)
            .field("startup_scan_max_files", &self.startup_scan_max_files)
            .field("dedup_ttl", &self.dedup_ttl)
            .field("idle_poll", &self.idle_poll)
            .finish()
    }
}

/// A converter attached to the directory it watches
#[derive(Clone)]
pub struct ConverterBinding {
    pub converter: Arc<dyn Converter>,
    pub watch_dir: PathBuf,
    pub recursive: bool,
    pub priority: Priority,
    pub post_process: PostProcess,
}

impl ConverterBinding {
    pub fn new(converter: Arc<dyn Converter>, watch_dir: impl Into<PathBuf>) -> Self {
        Self {
            converter,
            watch_dir: watch_dir.into(),
            recursive: false,
            priority: DEFAULT_PRIORITY,
            post_process: PostProcess::Keep,
        }
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_post_process(mut self, action: PostProcess) -> Self {
        self.post_process = action;
        self
    }

    pub fn name(&self) -> &str {
        self.converter.name()
    }

    /// File lives under the watch dir (directly, unless recursive) and the converter wants it
    pub fn matches(&self, path: &Path) -> bool {
        let in_scope = if self.recursive {
            path.starts_with(&self.watch_dir)
        } else {
            path.parent() == Some(self.watch_dir.as_path())
        };
        in_scope && self.converter.matches(path)
    }
}

impl fmt::Debug for ConverterBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterBinding")
            .field("converter", &self.converter.name())
            .field("watch_dir", &self.watch_dir)
            .field("recursive", &self.recursive)
            .field("priority", &self.priority)
            .field("post_process", &self.post_process)
            .finish()
    }
}

/// Result of `on_file_created`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued(ItemId),
    /// Already queued while the startup dedup window is open
    Duplicate,
    /// No binding for this converter handles the file
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub queue: QueueStats,
    pub converted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub suspended: usize,
    pub retried: usize,
    pub workers: usize,
    pub active_workers: usize,
}

#[derive(Default)]
struct PoolCounters {
    converted: AtomicUsize,
    delivered: AtomicUsize,
    failed: AtomicUsize,
    suspended: AtomicUsize,
    retried: AtomicUsize,
    active: AtomicUsize,
}

#[derive(Default)]
struct StartupState {
    /// Paths queued by the scan or by file events until the dedup window closes
    files: HashSet<PathBuf>,
    complete: bool,
    reset_task: Option<AbortHandle>,
}

/// A retry waiting out its backoff
struct DelayedRetry {
    handle: AbortHandle,
    demote: bool,
}

/// State shared by the pool handle, its workers and timers
struct PoolShared {
    queue: AsyncQueue,
    breaker: Arc<CircuitBreaker>,
    client: Arc<dyn DeliveryClient>,
    inbox: Arc<dyn SourceInbox>,
    bindings: Vec<ConverterBinding>,
    retry_policy: RetryPolicy,
    config: PoolConfig,
    counters: PoolCounters,
    delayed: Mutex<HashMap<ItemId, DelayedRetry>>,
    startup: Mutex<StartupState>,
}

impl PoolShared {
    fn binding_for(&self, converter: &str) -> Option<&ConverterBinding> {
        self.bindings.iter().find(|b| b.name() == converter)
    }

    /// Enqueue one source file and write its durable marker
    fn submit(&self, path: &Path, binding: &ConverterBinding) -> Result<QueueItem> {
        let task = ConversionTask {
            source_path: path.to_path_buf(),
            converter: binding.name().to_string(),
        };
        let request = NewItem::new(ItemPayload::json(&task)?)
            .with_priority(binding.priority as i64)
            .with_max_attempts(self.config.max_attempts)
            .with_metadata(SOURCE_PATH_KEY, path.display().to_string());
        let item = match self.queue.put(request.clone()) {
            Err(AppError::QueueFull(max)) => {
                // Retained completed items count toward the bound; drop them once
                let purged = self.queue.inner().clear(Some(ItemStatus::Completed))?;
                if purged == 0 {
                    return Err(AppError::QueueFull(max));
                }
                info!(purged, max_size = max, "Queue full, purged completed items");
                self.queue.put(request)?
            }
            other => other?,
        };

        // The item is already queued; a missing marker only risks a duplicate later
        if let Err(e) = self.inbox.mark(path) {
            warn!(path = %path.display(), error = %e, "Failed to write queued marker");
        }

        info!(
            item_id = %item.id,
            converter = %binding.name(),
            path = %path.display(),
            "Source file queued"
        );
        Ok(item)
    }

    /// Reserve `path` for one submission while the dedup window is open.
    ///
    /// False if it is already reserved. Once the window has closed every call
    /// succeeds and nothing is recorded.
    fn claim_startup_path(&self, path: &Path) -> bool {
        let mut startup = self.startup_state();
        startup.complete || startup.files.insert(path.to_path_buf())
    }

    fn release_startup_path(&self, path: &Path) {
        self.startup_state().files.remove(path);
    }

    fn startup_state(&self) -> std::sync::MutexGuard<'_, StartupState> {
        self.startup.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn delayed_retries(&self) -> std::sync::MutexGuard<'_, HashMap<ItemId, DelayedRetry>> {
        self.delayed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded pool of conversion workers.
///
/// Collaborators (queue, converters, delivery client, inbox) are invoked from
/// several workers at once and must be safe to share.
pub struct ConverterPool {
    shared: Arc<PoolShared>,
    workers: usize,
    shutdown_tx: ShutdownSender,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl ConverterPool {
    /// Create a pool; nothing runs until `start`
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        breaker: Arc<CircuitBreaker>,
        client: Arc<dyn DeliveryClient>,
        inbox: Arc<dyn SourceInbox>,
        bindings: Vec<ConverterBinding>,
        config: PoolConfig,
    ) -> Self {
        let workers = config.max_workers.clamp(MIN_WORKERS, MAX_WORKERS);
        if workers != config.max_workers {
            warn!(
                requested = config.max_workers,
                effective = workers,
                "max_workers out of range, clamped"
            );
        }

        let retry_policy = RetryPolicy::new(config.retry_base_delay, config.max_retry_delay)
            .with_demotion(config.demote_on_retry);
        let (shutdown_tx, _) = shutdown_channel();

        Self {
            shared: Arc::new(PoolShared {
                queue: AsyncQueue::new(queue),
                breaker,
                client,
                inbox,
                bindings,
                retry_policy,
                config,
                counters: PoolCounters::default(),
                delayed: Mutex::new(HashMap::new()),
                startup: Mutex::new(StartupState::default()),
            }),
            workers,
            shutdown_tx,
            supervisor: Mutex::new(None),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.shared.queue
    }

    pub fn bindings(&self) -> &[ConverterBinding] {
        &self.shared.bindings
    }

    pub fn binding_for(&self, converter: &str) -> Option<&ConverterBinding> {
        self.shared.binding_for(converter)
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.disposed.load(Ordering::SeqCst)
    }

    /// Reconcile existing files, then spawn the supervised workers.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn start(&self) -> Result<ScanStats> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AppError::InvalidState("pool already disposed".to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::InvalidState("pool already started".to_string()));
        }

        let stats = self.scan_existing_files().await?;

        let handle = tokio::spawn(worker::supervise(
            Arc::clone(&self.shared),
            self.workers,
            self.shutdown_tx.token(),
        ));
        *self.supervisor.lock()? = Some(handle);

        info!(workers = self.workers, "Converter pool started");
        Ok(stats)
    }

    /// Queue files that arrived while nothing was watching
    pub async fn scan_existing_files(&self) -> Result<ScanStats> {
        startup_scan::scan_existing_files(&self.shared).await
    }

    /// True once the post-scan dedup window has closed
    pub fn is_startup_scan_complete(&self) -> bool {
        self.shared.startup_state().complete
    }

    /// Handle a newly arrived file for the named converter
    pub fn on_file_created(&self, path: &Path, converter: &str) -> Result<SubmitOutcome> {
        let Some(binding) = self
            .shared
            .binding_for(converter)
            .filter(|b| b.matches(path))
        else {
            return Ok(SubmitOutcome::Ignored);
        };

        if !self.shared.claim_startup_path(path) {
            info!(path = %path.display(), "Skipping file already queued during startup");
            return Ok(SubmitOutcome::Duplicate);
        }

        match self.shared.submit(path, binding) {
            Ok(item) => Ok(SubmitOutcome::Queued(item.id)),
            Err(e) => {
                self.shared.release_startup_path(path);
                Err(e)
            }
        }
    }

    /// Process at most one ready item without waiting (true if one was processed)
    pub async fn process_next(&self) -> Result<bool> {
        match self.shared.queue.inner().get_next() {
            Some(item) => {
                worker::process_item(&self.shared, item).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Put every suspended item back in line
    pub fn resume_suspended(&self) -> Result<usize> {
        let mut resumed = 0;
        for mut item in self.shared.queue.list_by_status(ItemStatus::Suspended) {
            item.reset_to_pending();
            self.shared.queue.update(&item)?;
            resumed += 1;
        }
        if resumed > 0 {
            info!(count = resumed, "Resumed suspended items");
        }
        Ok(resumed)
    }

    /// Items currently waiting out a retry delay
    pub fn delayed_retry_count(&self) -> usize {
        self.shared.delayed_retries().len()
    }

    pub fn get_stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            queue: self.shared.queue.get_stats(),
            converted: c.converted.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            suspended: c.suspended.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            workers: self.workers,
            active_workers: c.active.load(Ordering::Relaxed),
        }
    }

    /// Stop workers and wait up to `timeout` for in-flight items.
    ///
    /// Idempotent. Workers still busy at the deadline are logged and left to finish
    /// their current item in the background; none of them takes another one. If
    /// the process exits first, a persistent queue recovers their items on load.
    pub async fn dispose(&self, timeout: Duration) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Converter pool shutting down");
        self.shutdown_tx.shutdown();

        if let Some(reset) = self.shared.startup_state().reset_task.take() {
            reset.abort();
        }

        let supervisor = self.supervisor.lock()?.take();
        if let Some(mut handle) = supervisor {
            let waited = tokio::time::timeout(timeout, &mut handle).await;
            match waited {
                Ok(Ok(())) => info!("All workers stopped"),
                Ok(Err(e)) => error!(error = %e, "Worker supervisor ended abnormally"),
                Err(_) => {
                    let abandoned = self.shared.counters.active.load(Ordering::SeqCst);
                    let processing = self.shared.queue.processing_count();
                    error!(
                        abandoned_workers = abandoned,
                        processing_items = processing,
                        timeout_ms = timeout.as_millis() as u64,
                        "Workers did not stop in time, leaving in-flight work to finish"
                    );
                    tokio::spawn(async move {
                        match handle.await {
                            Ok(()) => info!("Late workers finished in-flight work"),
                            Err(e) => error!(error = %e, "Worker supervisor ended abnormally"),
                        }
                    });
                }
            }
        }

        let flushed = worker::flush_delayed(&self.shared);
        if flushed > 0 {
            info!(count = flushed, "Flushed delayed retries back to pending");
        }
        info!("Converter pool stopped");
        Ok(())
    }
}
