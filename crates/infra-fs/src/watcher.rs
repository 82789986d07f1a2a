// File Arrival Watcher
// notify callback thread -> mpsc -> event task -> ConverterPool::on_file_created

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use relay_core::application::{
    shutdown_channel, ConverterPool, ShutdownSender, ShutdownToken, SubmitOutcome,
};
use relay_core::error::{AppError, Result};
use relay_core::port::SourceInbox;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::inbox::is_candidate_file;

const DEFAULT_DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Convert notify::Error to AppError
fn map_notify_error(err: notify::Error) -> AppError {
    match err.kind {
        notify::ErrorKind::Io(io) => AppError::Io(io),
        notify::ErrorKind::PathNotFound => AppError::NotFound(format!(
            "watch path {}",
            err.paths
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        )),
        other => AppError::Internal(format!("file watcher: {:?}", other)),
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Default wait for the event task in `dispose`
    pub dispose_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            dispose_timeout: DEFAULT_DISPOSE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Created,
    Running,
    Disposed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStats {
    pub submitted: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub errors: usize,
}

#[derive(Default)]
struct WatcherCounters {
    submitted: AtomicUsize,
    duplicates: AtomicUsize,
    ignored: AtomicUsize,
    errors: AtomicUsize,
}

struct Lifecycle {
    state: WatcherState,
    starting: bool,
    watcher: Option<RecommendedWatcher>,
    event_task: Option<JoinHandle<()>>,
    stop: Option<ShutdownSender>,
}

/// State shared with the event task
struct Dispatch {
    pool: Arc<ConverterPool>,
    inbox: Arc<dyn SourceInbox>,
    submit_lock: Mutex<()>,
    counters: WatcherCounters,
}

pub struct FileArrivalWatcher {
    dispatch: Arc<Dispatch>,
    config: WatcherConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl FileArrivalWatcher {
    pub fn new(
        pool: Arc<ConverterPool>,
        inbox: Arc<dyn SourceInbox>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            dispatch: Arc::new(Dispatch {
                pool,
                inbox,
                submit_lock: Mutex::new(()),
                counters: WatcherCounters::default(),
            }),
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: WatcherState::Created,
                starting: false,
                watcher: None,
                event_task: None,
                stop: None,
            }),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> WatcherState {
        self.lifecycle().state
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> WatcherStats {
        let c = &self.dispatch.counters;
        WatcherStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    /// One watch per directory; recursive wins when bindings disagree
    fn watch_targets(&self) -> BTreeMap<PathBuf, RecursiveMode> {
        let mut targets = BTreeMap::new();
        for binding in self.dispatch.pool.bindings() {
            let mode = if binding.recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            targets
                .entry(binding.watch_dir.clone())
                .and_modify(|current| {
                    if mode == RecursiveMode::Recursive {
                        *current = mode;
                    }
                })
                .or_insert(mode);
        }
        targets
    }

    /// Attach the watches and start the event task.
    ///
    /// Must be called from within a tokio runtime. Returns once every watch is attached.
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|e| AppError::InvalidState(format!("watcher needs a tokio runtime: {}", e)))?;

        {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                WatcherState::Disposed => {
                    return Err(AppError::InvalidState("watcher already disposed".to_string()))
                }
                WatcherState::Running => {
                    return Err(AppError::InvalidState("watcher already running".to_string()))
                }
                WatcherState::Created if lifecycle.starting => {
                    return Err(AppError::InvalidState("watcher is starting".to_string()))
                }
                WatcherState::Created => lifecycle.starting = true,
            }
        }

        let attached = self.attach();
        let mut lifecycle = self.lifecycle();
        lifecycle.starting = false;
        let (watcher, rx) = attached?;

        // dispose() won the race while we were attaching
        if lifecycle.state == WatcherState::Disposed {
            drop(watcher);
            return Err(AppError::InvalidState("watcher disposed during start".to_string()));
        }

        let (stop, token) = shutdown_channel();
        let task = runtime.spawn(event_loop(Arc::clone(&self.dispatch), rx, token));
        lifecycle.watcher = Some(watcher);
        lifecycle.event_task = Some(task);
        lifecycle.stop = Some(stop);
        lifecycle.state = WatcherState::Running;
        info!(dirs = self.watch_targets().len(), "File watcher running");
        Ok(())
    }

    fn attach(
        &self,
    ) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<notify::Result<Event>>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Receiver gone means the watcher is shutting down
            let _ = tx.send(res);
        })
        .map_err(map_notify_error)?;

        for (dir, mode) in self.watch_targets() {
            watcher.watch(&dir, mode).map_err(map_notify_error)?;
            debug!(
                dir = %dir.display(),
                recursive = mode == RecursiveMode::Recursive,
                "Watching directory"
            );
        }
        Ok((watcher, rx))
    }

    /// Start on the blocking pool and return at once.
    ///
    /// Events are only seen once `state()` reports `Running`.
    pub fn start_background(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let result = this.start();
            if let Err(e) = &result {
                error!(error = %e, "File watcher failed to start");
            }
            result
        })
    }

    /// Detach the watches and stop the event task. Idempotent.
    pub async fn dispose(&self, timeout: Duration) -> Result<()> {
        let (watcher, task, stop) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == WatcherState::Disposed {
                return Ok(());
            }
            lifecycle.state = WatcherState::Disposed;
            (
                lifecycle.watcher.take(),
                lifecycle.event_task.take(),
                lifecycle.stop.take(),
            )
        };

        drop(watcher);
        if let Some(stop) = stop {
            stop.shutdown();
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Watcher event task did not stop in time"
                );
                task.abort();
            }
        }
        info!("File watcher stopped");
        Ok(())
    }
}

async fn event_loop(
    dispatch: Arc<Dispatch>,
    mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    mut stop: ShutdownToken,
) {
    loop {
        tokio::select! {
            _ = stop.wait() => break,
            received = rx.recv() => match received {
                Some(Ok(event)) => {
                    for path in arrived_paths(&event) {
                        dispatch.submit(path);
                    }
                }
                Some(Err(e)) => {
                    dispatch.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "File watcher error");
                }
                None => break,
            },
        }
    }
    debug!("Watcher event loop exited");
}

/// Paths that now hold a newly arrived file
fn arrived_paths(event: &Event) -> Vec<&Path> {
    let paths: Vec<&Path> = match event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => {
            event.paths.iter().map(PathBuf::as_path).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(PathBuf::as_path).collect()
        }
        // [from, to]
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.get(1).map(PathBuf::as_path).into_iter().collect()
        }
        // Backends that cannot tell the two ends apart
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().map(PathBuf::as_path).filter(|p| p.exists()).collect()
        }
        _ => Vec::new(),
    };
    paths
        .into_iter()
        .filter(|p| is_candidate_file(p) && p.is_file())
        .collect()
}

impl Dispatch {
    fn submit(&self, path: &Path) {
        let _guard = self.submit_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.inbox.is_marked(path) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(path = %path.display(), "Duplicate event for queued file");
            return;
        }

        let Some(binding) = self.pool.bindings().iter().find(|b| b.matches(path)) else {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match self.pool.on_file_created(path, binding.name()) {
            Ok(SubmitOutcome::Queued(id)) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                info!(
                    path = %path.display(),
                    item_id = %id,
                    converter = %binding.name(),
                    "File queued"
                );
            }
            Ok(SubmitOutcome::Duplicate) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            Ok(SubmitOutcome::Ignored) => {
                self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                error!(path = %path.display(), error = %e, "Could not queue arrived file");
            }
        }
    }
}
