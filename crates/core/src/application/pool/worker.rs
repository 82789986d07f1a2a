// Worker - conversion + delivery loop

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::constants::{ERROR_RECOVERY_SLEEP_DURATION, REMOTE_ID_KEY};
use super::panic_guard::{execute_guarded, panic_message, PanicGuardResult};
use super::{ConverterBinding, DelayedRetry, PoolShared, ShutdownToken};
use crate::application::breaker::BreakerError;
use crate::application::retry::RetryDecision;
use crate::domain::{CanonicalRecord, ConversionTask, QueueItem};
use crate::error::Result;
use crate::port::{ConversionOutcome, ConvertError, DeliveryError};

/// Keeps `workers` loops alive until shutdown, replacing any that die
pub(super) async fn supervise(shared: Arc<PoolShared>, workers: usize, shutdown: ShutdownToken) {
    let mut set = JoinSet::new();
    for worker_id in 0..workers {
        set.spawn(run(Arc::clone(&shared), worker_id, shutdown.clone()));
    }
    let mut next_id = workers;

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(()) => {}
            Err(e) if e.is_panic() => error!(error = %e, "Worker panicked"),
            Err(e) => warn!(error = %e, "Worker cancelled"),
        }
        if !shutdown.is_shutdown() {
            warn!(worker_id = next_id, "Worker exited unexpectedly, starting replacement");
            set.spawn(run(Arc::clone(&shared), next_id, shutdown.clone()));
            next_id += 1;
        }
    }
}

/// Run worker loop with graceful shutdown support
async fn run(shared: Arc<PoolShared>, worker_id: usize, mut shutdown: ShutdownToken) {
    info!(worker_id, "Worker started");
    loop {
        if shutdown.is_shutdown() {
            break;
        }

        let next = tokio::select! {
            _ = shutdown.wait() => break,
            next = shared.queue.get(Some(shared.config.idle_poll)) => next,
        };
        let Some(item) = next else {
            continue;
        };

        // In-flight work is never interrupted by shutdown
        if let Err(e) = process_item(&shared, item).await {
            error!(worker_id, error = %e, "Worker error");
            tokio::select! {
                _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                _ = shutdown.wait() => break,
            }
        }
    }
    info!(worker_id, "Worker stopped");
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drive one item from PENDING to its next state
pub(super) async fn process_item(shared: &Arc<PoolShared>, mut item: QueueItem) -> Result<()> {
    if item.mark_processing().is_err() {
        // Taken by someone else since it was handed out
        return Ok(());
    }
    if let Err(e) = shared.queue.update(&item) {
        // Still PENDING in the queue; put it back in line for the next worker
        shared.queue.requeue(&item.id);
        return Err(e);
    }
    let _active = ActiveGuard::enter(&shared.counters.active);

    let task: ConversionTask = match item.data.parse_json() {
        Ok(task) => task,
        Err(e) => return fail(shared, item, format!("unreadable conversion task: {}", e)),
    };
    let Some(binding) = shared.binding_for(&task.converter).cloned() else {
        let err = ConvertError::UnknownConverter(task.converter.clone());
        return fail(shared, item, err.to_string());
    };

    info!(
        item_id = %item.id,
        attempt = %item.attempts,
        converter = %task.converter,
        path = %task.source_path.display(),
        "Converting"
    );

    match convert(&binding, &task).await {
        Ok(ConversionOutcome::Success(record)) => {
            shared.counters.converted.fetch_add(1, Ordering::Relaxed);
            deliver(shared, item, record, &binding, &task).await
        }
        Ok(ConversionOutcome::Suspended(reason)) => {
            info!(item_id = %item.id, reason = %reason, "Conversion suspended");
            item.mark_suspended(Some(reason));
            shared.queue.update(&item)?;
            shared.counters.suspended.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Ok(ConversionOutcome::Failed(reason)) => fail(shared, item, reason),
        Err(e) => retry_or_fail(shared, item, e.to_string()),
    }
}

/// Run the converter on the blocking pool, isolating panics
async fn convert(
    binding: &ConverterBinding,
    task: &ConversionTask,
) -> std::result::Result<ConversionOutcome, ConvertError> {
    let converter = Arc::clone(&binding.converter);
    let path = task.source_path.clone();

    let joined = tokio::task::spawn_blocking(move || {
        execute_guarded(AssertUnwindSafe(move || converter.convert(&path)))
    })
    .await;

    match joined {
        Ok(PanicGuardResult::Success(result)) => result,
        Ok(PanicGuardResult::Panicked(msg)) => Err(ConvertError::Panicked(msg)),
        Err(join_err) => Err(ConvertError::Panicked(join_err.to_string())),
    }
}

async fn deliver(
    shared: &Arc<PoolShared>,
    mut item: QueueItem,
    record: CanonicalRecord,
    binding: &ConverterBinding,
    task: &ConversionTask,
) -> Result<()> {
    let client = Arc::clone(&shared.client);
    let sent = shared
        .breaker
        .call_async(move || async move {
            match AssertUnwindSafe(client.send(&record)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    error!(panic_msg = %msg, "Delivery client panicked");
                    Err(DeliveryError::Transient(format!("delivery client panicked: {}", msg)))
                }
            }
        })
        .await;

    match sent {
        Ok(remote_id) => {
            item.metadata.insert(REMOTE_ID_KEY.to_string(), remote_id.clone());
            item.mark_completed();
            shared.queue.update(&item)?;
            shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
            info!(item_id = %item.id, remote_id = %remote_id, "Record delivered");

            if let Err(e) = shared.inbox.finalize(&task.source_path, &binding.post_process) {
                warn!(
                    item_id = %item.id,
                    path = %task.source_path.display(),
                    error = %e,
                    "Post-processing failed"
                );
            }
            Ok(())
        }
        Err(BreakerError::Open { retry_after, .. }) => {
            // Not the item's fault: give the attempt back
            item.attempts = item.attempts.saturating_sub(1);
            item.last_error = Some("circuit breaker open".to_string());
            info!(
                item_id = %item.id,
                retry_after_ms = retry_after.as_millis() as u64,
                "Delivery deferred, circuit open"
            );
            schedule_retry(shared, item, retry_after, false)
        }
        Err(BreakerError::Inner(e)) if e.is_permanent() => fail(shared, item, e.to_string()),
        Err(BreakerError::Inner(e)) => retry_or_fail(shared, item, e.to_string()),
    }
}

fn fail(shared: &PoolShared, mut item: QueueItem, reason: String) -> Result<()> {
    warn!(item_id = %item.id, attempts = %item.attempts, reason = %reason, "Item failed");
    item.mark_failed(reason);
    shared.queue.update(&item)?;
    shared.counters.failed.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn retry_or_fail(shared: &Arc<PoolShared>, mut item: QueueItem, error: String) -> Result<()> {
    match shared.retry_policy.should_retry(&item) {
        RetryDecision::Failed => fail(shared, item, error),
        RetryDecision::Retry(delay) => {
            warn!(item_id = %item.id, attempt = %item.attempts, error = %error, "Attempt failed");
            item.last_error = Some(error);
            shared.counters.retried.fetch_add(1, Ordering::Relaxed);
            schedule_retry(shared, item, delay, true)
        }
    }
}

/// Keep the item PROCESSING until `delay` passes, then make it pending again
fn schedule_retry(
    shared: &Arc<PoolShared>,
    item: QueueItem,
    delay: Duration,
    demote: bool,
) -> Result<()> {
    shared.queue.update(&item)?;

    // Hold the map lock across spawn so the timer cannot finish before it is tracked
    let mut delayed = shared.delayed_retries();
    let timer_shared = Arc::clone(shared);
    let id = item.id.clone();
    let handle = tokio::spawn(async move {
        sleep(delay).await;
        fire_delayed_retry(&timer_shared, &id);
    });
    delayed.insert(
        item.id,
        DelayedRetry {
            handle: handle.abort_handle(),
            demote,
        },
    );
    Ok(())
}

fn fire_delayed_retry(shared: &PoolShared, id: &str) {
    let Some(retry) = shared.delayed_retries().remove(id) else {
        return;
    };
    make_pending(shared, id, retry.demote);
}

fn make_pending(shared: &PoolShared, id: &str, demote: bool) {
    let Some(mut item) = shared.queue.get_item(id) else {
        return; // removed meanwhile
    };
    if !item.is_processing() {
        return;
    }
    if demote {
        shared.retry_policy.prepare_for_retry(&mut item);
    } else {
        item.reset_to_pending();
    }
    if let Err(e) = shared.queue.update(&item) {
        error!(item_id = %id, error = %e, "Failed to requeue item");
    }
}

/// Cancel pending retry timers and make their items pending now
pub(super) fn flush_delayed(shared: &PoolShared) -> usize {
    let drained: Vec<_> = shared.delayed_retries().drain().collect();
    let count = drained.len();
    for (id, retry) in drained {
        retry.handle.abort();
        make_pending(shared, &id, retry.demote);
    }
    count
}
