// Delivery Queue Manager - durable operation outbox with double-failure detection

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::application::pool::ShutdownToken;
use crate::domain::{CanonicalRecord, OperationId, OperationStatus, QueuedOperation};
use crate::error::{AppError, CriticalError, Result};
use crate::port::{
    DeliveryClient, DeliveryError, OperationSender, OperationStore, StorePartition, TimeProvider,
};

pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SENT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct DeliveryQueueConfig {
    /// Attempts before an operation moves to the failed partition
    pub max_retries: u32,
    /// Period of the background retry loop
    pub retry_interval: Duration,
    /// How long delivered operations are kept
    pub sent_retention: Duration,
}

impl Default for DeliveryQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            sent_retention: DEFAULT_SENT_RETENTION,
        }
    }
}

/// Outcome of one `process_pending` pass
#[derive(Debug, Default, Serialize)]
pub struct ProcessSummary {
    pub attempted: usize,
    pub sent: usize,
    /// Attempted but still pending (or moved to failed)
    pub unsent: usize,
    /// Non-critical store errors
    pub errors: usize,
    #[serde(skip)]
    pub critical: Vec<CriticalError>,
}

/// Removes an id from the in-flight set on drop
struct InFlight<'a> {
    set: &'a Mutex<HashSet<OperationId>>,
    id: OperationId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

/// Stores operations before sending them, so a failed send is never lost.
///
/// When the send fails *and* recording that failure fails, the operation's
/// on-disk state is unknown. That case is raised as
/// [`CriticalError::DoubleFailure`] instead of being swallowed.
pub struct DeliveryQueueManager {
    store: Arc<dyn OperationStore>,
    sender: Arc<dyn OperationSender>,
    time_provider: Arc<dyn TimeProvider>,
    config: DeliveryQueueConfig,
    sending: Mutex<HashSet<OperationId>>,
}

impl DeliveryQueueManager {
    pub fn new(
        store: Arc<dyn OperationStore>,
        sender: Arc<dyn OperationSender>,
        time_provider: Arc<dyn TimeProvider>,
        config: DeliveryQueueConfig,
    ) -> Self {
        Self {
            store,
            sender,
            time_provider,
            config,
            sending: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &DeliveryQueueConfig {
        &self.config
    }

    fn sending(&self) -> MutexGuard<'_, HashSet<OperationId>> {
        self.sending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, id: &str) -> Option<InFlight<'_>> {
        if !self.sending().insert(id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.sending,
            id: id.to_string(),
        })
    }

    fn next_id(&self) -> OperationId {
        let stamp = self.time_provider.now().format("%Y%m%d_%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", stamp, &suffix[..8])
    }

    /// Persist a new pending operation
    pub fn enqueue(&self, operation_type: &str, payload: serde_json::Value) -> Result<OperationId> {
        let operation = QueuedOperation::new(
            self.next_id(),
            operation_type,
            payload,
            self.time_provider.now(),
        );
        self.store.save(StorePartition::Pending, &operation)?;
        info!(operation_id = %operation.id, operation_type = %operation_type, "Operation queued");
        Ok(operation.id)
    }

    /// Persist, then try to send right away
    pub async fn enqueue_and_send(
        &self,
        operation_type: &str,
        payload: serde_json::Value,
    ) -> Result<(OperationId, bool)> {
        let id = self.enqueue(operation_type, payload)?;
        let sent = self.send(&id).await?;
        Ok((id, sent))
    }

    /// Attempt to send one pending operation.
    ///
    /// Returns `Ok(true)` when sent, `Ok(false)` when it is not pending, is already
    /// in flight, or the attempt failed and was recorded.
    ///
    /// # Errors
    /// - Store errors before the send (nothing was sent)
    /// - `AppError::Critical` when the send failed and the failure could not be persisted
    pub async fn send(&self, id: &str) -> Result<bool> {
        let Some(_in_flight) = self.claim(id) else {
            debug!(operation_id = %id, "Send already in progress");
            return Ok(false);
        };
        let Some(mut operation) = self.store.load(StorePartition::Pending, id)? else {
            debug!(operation_id = %id, "Operation not pending");
            return Ok(false);
        };
        // A stored SENDING status without an in-flight claim is left over from a crash
        if !matches!(
            operation.status,
            OperationStatus::Pending | OperationStatus::Sending
        ) {
            return Ok(false);
        }

        operation.begin_attempt(self.time_provider.now());
        self.store.save(StorePartition::Pending, &operation)?;

        match self.sender.send(&operation).await {
            Ok(()) => {
                operation.status = OperationStatus::Sent;
                operation.error = None;
                self.store.save(StorePartition::Sent, &operation)?;
                self.store.delete(StorePartition::Pending, id)?;
                info!(
                    operation_id = %id,
                    operation_type = %operation.operation_type,
                    attempt = %operation.attempts,
                    "Operation sent"
                );
                Ok(true)
            }
            Err(primary) => self.record_failure(operation, primary),
        }
    }

    fn record_failure(
        &self,
        mut operation: QueuedOperation,
        primary: DeliveryError,
    ) -> Result<bool> {
        operation.record_failure(primary.to_string());
        let exhausted = operation.attempts >= self.config.max_retries;

        let persisted = if exhausted {
            operation.status = OperationStatus::Failed;
            self.store.save(StorePartition::Failed, &operation)
        } else {
            self.store.save(StorePartition::Pending, &operation)
        };

        if let Err(fallback) = persisted {
            let critical = CriticalError::DoubleFailure {
                operation_id: operation.id.clone(),
                operation_type: operation.operation_type.clone(),
                primary_error: primary.to_string(),
                fallback_error: fallback.to_string(),
            };
            error!(
                operation_id = %operation.id,
                operation_type = %operation.operation_type,
                primary_error = %primary,
                fallback_error = %fallback,
                "CRITICAL: send failed and the failure could not be persisted"
            );
            return Err(critical.into());
        }

        if exhausted {
            if let Err(e) = self.store.delete(StorePartition::Pending, &operation.id) {
                warn!(operation_id = %operation.id, error = %e, "Failed to remove pending copy");
            }
            error!(
                operation_id = %operation.id,
                operation_type = %operation.operation_type,
                attempts = %operation.attempts,
                error = %primary,
                "Operation moved to failed after max retries"
            );
        } else {
            warn!(
                operation_id = %operation.id,
                attempt = %operation.attempts,
                max_retries = %self.config.max_retries,
                error = %primary,
                "Send failed, will retry"
            );
        }
        Ok(false)
    }

    /// Attempt every pending operation, oldest first
    pub async fn process_pending(&self) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();
        for operation in self.store.list(StorePartition::Pending)? {
            summary.attempted += 1;
            match self.send(&operation.id).await {
                Ok(true) => summary.sent += 1,
                Ok(false) => summary.unsent += 1,
                Err(AppError::Critical(critical)) => summary.critical.push(critical),
                Err(e) => {
                    summary.errors += 1;
                    warn!(
                        operation_id = %operation.id,
                        error = %e,
                        "Pending operation not attempted"
                    );
                }
            }
        }
        if summary.attempted > 0 {
            info!(
                attempted = summary.attempted,
                sent = summary.sent,
                unsent = summary.unsent,
                critical = summary.critical.len(),
                "Processed pending operations"
            );
        }
        Ok(summary)
    }

    /// Periodic retry loop; returns when `shutdown` fires
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<()> {
        info!(interval_s = self.config.retry_interval.as_secs(), "Delivery retry loop started");
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            match self.process_pending().await {
                Ok(summary) => {
                    for critical in &summary.critical {
                        error!(error = %critical, "Unresolved double failure");
                    }
                }
                Err(e) => error!(error = %e, "Retry pass failed"),
            }
            if let Err(e) = self.purge_sent(self.config.sent_retention) {
                warn!(error = %e, "Failed to purge sent operations");
            }

            tokio::select! {
                _ = sleep(self.config.retry_interval) => {},
                _ = shutdown.wait() => break,
            }
        }
        info!("Delivery retry loop stopped");
        Ok(())
    }

    /// Move a failed operation back to pending with a fresh attempt budget
    pub fn retry_failed(&self, id: &str) -> Result<bool> {
        let Some(mut operation) = self.store.load(StorePartition::Failed, id)? else {
            return Ok(false);
        };
        operation.status = OperationStatus::Pending;
        operation.attempts = 0;
        operation.error = None;
        self.store.save(StorePartition::Pending, &operation)?;
        self.store.delete(StorePartition::Failed, id)?;
        info!(operation_id = %id, "Failed operation requeued");
        Ok(true)
    }

    pub fn delete_failed(&self, id: &str) -> Result<bool> {
        let deleted = self.store.delete(StorePartition::Failed, id)?;
        if deleted {
            info!(operation_id = %id, "Failed operation deleted");
        }
        Ok(deleted)
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.store.count(StorePartition::Pending)
    }

    pub fn failed_count(&self) -> Result<usize> {
        self.store.count(StorePartition::Failed)
    }

    pub fn pending_operations(&self) -> Result<Vec<QueuedOperation>> {
        self.store.list(StorePartition::Pending)
    }

    pub fn failed_operations(&self) -> Result<Vec<QueuedOperation>> {
        self.store.list(StorePartition::Failed)
    }

    /// Delete sent operations older than `retention`
    pub fn purge_sent(&self, retention: Duration) -> Result<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| AppError::Validation(format!("retention out of range: {}", e)))?;
        let cutoff = self.time_provider.now() - retention;

        let mut purged = 0;
        for operation in self.store.list(StorePartition::Sent)? {
            let sent_at = operation.last_attempt.unwrap_or(operation.created);
            if sent_at < cutoff && self.store.delete(StorePartition::Sent, &operation.id)? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(count = purged, "Purged sent operations");
        }
        Ok(purged)
    }
}

/// Sends operations through the record delivery client
pub struct ClientOperationSender {
    client: Arc<dyn DeliveryClient>,
}

impl ClientOperationSender {
    pub fn new(client: Arc<dyn DeliveryClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OperationSender for ClientOperationSender {
    async fn send(&self, operation: &QueuedOperation) -> std::result::Result<(), DeliveryError> {
        let record = CanonicalRecord::new(serde_json::json!({
            "operation_id": operation.id,
            "operation_type": operation.operation_type,
            "payload": operation.payload,
        }));
        self.client.send(&record).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::pool::shutdown_channel;
    use crate::port::delivery_client::mocks::{MockBehavior, MockDeliveryClient};
    use crate::port::operation_sender::mocks::MockOperationSender;
    use crate::port::operation_store::mocks::InMemoryOperationStore;
    use crate::port::time_provider::mocks::FixedTimeProvider;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Harness {
        manager: DeliveryQueueManager,
        store: Arc<InMemoryOperationStore>,
        sender: Arc<MockOperationSender>,
        clock: Arc<FixedTimeProvider>,
    }

    fn harness(sender: MockOperationSender, max_retries: u32) -> Harness {
        let store = Arc::new(InMemoryOperationStore::new());
        let sender = Arc::new(sender);
        let clock = Arc::new(FixedTimeProvider::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap(),
        ));
        let manager = DeliveryQueueManager::new(
            store.clone(),
            sender.clone(),
            clock.clone(),
            DeliveryQueueConfig {
                max_retries,
                retry_interval: Duration::from_millis(20),
                ..Default::default()
            },
        );
        Harness {
            manager,
            store,
            sender,
            clock,
        }
    }

    #[test]
    fn test_enqueue_persists_pending_operation() {
        let h = harness(MockOperationSender::new_success(), 10);
        let id = h.manager.enqueue("submit_report", json!({"sn": "A1"})).unwrap();

        assert!(id.starts_with("20240301_123005_"));
        assert_eq!(id.len(), "20240301_123005_".len() + 8);

        let stored = h.store.load(StorePartition::Pending, &id).unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.operation_type, "submit_report");
        assert_eq!(h.manager.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_enqueue_store_failure_propagates() {
        let h = harness(MockOperationSender::new_success(), 10);
        h.store.fail_saves_after(0);
        assert!(matches!(
            h.manager.enqueue("submit_report", json!({})),
            Err(AppError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_successful_send_moves_to_sent() {
        let h = harness(MockOperationSender::new_success(), 10);
        let id = h.manager.enqueue("submit_report", json!({"sn": "A1"})).unwrap();

        assert!(h.manager.send(&id).await.unwrap());

        assert!(h.store.load(StorePartition::Pending, &id).unwrap().is_none());
        let sent = h.store.load(StorePartition::Sent, &id).unwrap().unwrap();
        assert_eq!(sent.status, OperationStatus::Sent);
        assert_eq!(sent.attempts, 1);
        assert!(sent.last_attempt.is_some());
        assert_eq!(h.sender.sent()[0].status, OperationStatus::Sending);
    }

    #[tokio::test]
    async fn test_send_unknown_operation_returns_false() {
        let h = harness(MockOperationSender::new_success(), 10);
        assert!(!h.manager.send("20240101_000000_deadbeef").await.unwrap());
        assert_eq!(h.sender.call_count(), 0);
    }

    #[tokio::test]
    async fn test_ordinary_failure_is_recorded_and_returns_false() {
        let h = harness(MockOperationSender::new_fail("connection reset"), 10);
        let id = h.manager.enqueue("submit_report", json!({})).unwrap();

        assert!(!h.manager.send(&id).await.unwrap());

        let stored = h.store.load(StorePartition::Pending, &id).unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert!(stored.error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_exhausted_operation_moves_to_failed() {
        let h = harness(MockOperationSender::new_fail("server down"), 2);
        let id = h.manager.enqueue("submit_report", json!({})).unwrap();

        assert!(!h.manager.send(&id).await.unwrap());
        assert_eq!(h.manager.pending_count().unwrap(), 1);
        assert!(!h.manager.send(&id).await.unwrap());

        assert_eq!(h.manager.pending_count().unwrap(), 0);
        assert_eq!(h.manager.failed_count().unwrap(), 1);
        let failed = &h.manager.failed_operations().unwrap()[0];
        assert_eq!(failed.status, OperationStatus::Failed);
        assert_eq!(failed.attempts, 2);

        // Failed operations are no longer sendable
        assert!(!h.manager.send(&id).await.unwrap());
        assert_eq!(h.sender.call_count(), 2);
    }

    #[tokio::test]
    async fn test_double_failure_raises_critical_error() {
        let h = harness(MockOperationSender::new_fail("503 Service Unavailable"), 10);
        let id = h.manager.enqueue("submit_report", json!({})).unwrap();
        // The SENDING save succeeds, the failure record does not
        h.store.fail_saves_after(1);

        let err = h.manager.send(&id).await.unwrap_err();
        assert!(err.is_critical());
        match err {
            AppError::Critical(CriticalError::DoubleFailure {
                operation_id,
                operation_type,
                primary_error,
                fallback_error,
            }) => {
                assert_eq!(operation_id, id);
                assert_eq!(operation_type, "submit_report");
                assert!(primary_error.contains("503 Service Unavailable"));
                assert!(fallback_error.contains("No space left on device"));
            }
            other => panic!("expected double failure, got {:?}", other),
        }
        assert_eq!(h.sender.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_pre_send_save_propagates_without_sending() {
        let h = harness(MockOperationSender::new_success(), 10);
        let id = h.manager.enqueue("submit_report", json!({})).unwrap();
        h.store.fail_saves_after(0);

        let err = h.manager.send(&id).await.unwrap_err();
        assert!(!err.is_critical());
        assert_eq!(h.sender.call_count(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_operation_is_not_sent_twice() {
        let h = harness(MockOperationSender::new_success(), 10);
        let id = h.manager.enqueue("submit_report", json!({})).unwrap();

        let claim = h.manager.claim(&id).unwrap();
        assert!(!h.manager.send(&id).await.unwrap());
        assert_eq!(h.sender.call_count(), 0);

        drop(claim);
        assert!(h.manager.send(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_sending_status_is_retried() {
        let h = harness(MockOperationSender::new_success(), 10);
        let id = h.manager.enqueue("submit_report", json!({})).unwrap();
        let mut stale = h.store.load(StorePartition::Pending, &id).unwrap().unwrap();
        stale.status = OperationStatus::Sending;
        stale.attempts = 1;
        h.store.save(StorePartition::Pending, &stale).unwrap();

        assert!(h.manager.send(&id).await.unwrap());
        let sent = h.store.load(StorePartition::Sent, &id).unwrap().unwrap();
        assert_eq!(sent.attempts, 2);
    }

    #[tokio::test]
    async fn test_process_pending_collects_critical_errors() {
        let h = harness(MockOperationSender::new_fail("timeout"), 10);
        h.manager.enqueue("a", json!({})).unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
        h.manager.enqueue("b", json!({})).unwrap();

        let summary = h.manager.process_pending().await.unwrap();
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.unsent, 2);
        assert!(summary.critical.is_empty());

        // First op: SENDING save ok, failure save fails. Second op: SENDING save fails.
        h.store.fail_saves_after(1);
        let summary = h.manager.process_pending().await.unwrap();
        assert_eq!(summary.critical.len(), 1);
        assert_eq!(summary.errors, 1);
    }

    #[tokio::test]
    async fn test_process_pending_oldest_first() {
        let h = harness(MockOperationSender::new_success(), 10);
        let first = h.manager.enqueue("a", json!({})).unwrap();
        h.clock.advance(chrono::Duration::seconds(5));
        let second = h.manager.enqueue("b", json!({})).unwrap();

        let summary = h.manager.process_pending().await.unwrap();
        assert_eq!(summary.sent, 2);
        let order: Vec<_> = h.sender.sent().into_iter().map(|op| op.id).collect();
        assert_eq!(order, vec![first, second]);
    }

    #[tokio::test]
    async fn test_retry_failed_resets_attempts() {
        let h = harness(MockOperationSender::new_fail("down"), 1);
        let id = h.manager.enqueue("submit_report", json!({})).unwrap();
        h.manager.send(&id).await.unwrap();
        assert_eq!(h.manager.failed_count().unwrap(), 1);

        assert!(h.manager.retry_failed(&id).unwrap());
        let pending = h.store.load(StorePartition::Pending, &id).unwrap().unwrap();
        assert_eq!(pending.attempts, 0);
        assert_eq!(pending.status, OperationStatus::Pending);
        assert!(pending.error.is_none());
        assert_eq!(h.manager.failed_count().unwrap(), 0);

        assert!(!h.manager.retry_failed(&id).unwrap());
    }

    #[tokio::test]
    async fn test_delete_failed() {
        let h = harness(MockOperationSender::new_fail("down"), 1);
        let id = h.manager.enqueue("submit_report", json!({})).unwrap();
        h.manager.send(&id).await.unwrap();

        assert!(h.manager.delete_failed(&id).unwrap());
        assert!(!h.manager.delete_failed(&id).unwrap());
        assert_eq!(h.manager.failed_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_sent_respects_retention() {
        let h = harness(MockOperationSender::new_success(), 10);
        let old = h.manager.enqueue("a", json!({})).unwrap();
        h.manager.send(&old).await.unwrap();

        h.clock.advance(chrono::Duration::days(6));
        let recent = h.manager.enqueue("b", json!({})).unwrap();
        h.manager.send(&recent).await.unwrap();

        h.clock.advance(chrono::Duration::days(2));
        assert_eq!(h.manager.purge_sent(DEFAULT_SENT_RETENTION).unwrap(), 1);
        assert!(h.store.load(StorePartition::Sent, &old).unwrap().is_none());
        assert!(h.store.load(StorePartition::Sent, &recent).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_retries_until_shutdown() {
        let h = harness(MockOperationSender::new_fail("down"), 10);
        let id = h.manager.enqueue("submit_report", json!({})).unwrap();
        let manager = Arc::new(h.manager);

        let (tx, token) = shutdown_channel();
        let loop_manager = Arc::clone(&manager);
        let handle = tokio::spawn(async move { loop_manager.run(token).await });

        tokio::time::sleep(Duration::from_millis(70)).await;
        h.sender.set_failure(None);
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(h.sender.call_count() >= 2);
        assert!(h.store.load(StorePartition::Sent, &id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_client_sender_wraps_operation() {
        let client = Arc::new(MockDeliveryClient::new_success());
        let sender = ClientOperationSender::new(client.clone());
        let op = QueuedOperation::new("OP-1", "submit_report", json!({"sn": "A1"}), Utc::now());

        sender.send(&op).await.unwrap();
        let record = client.delivered()[0].clone().into_value();
        assert_eq!(record["operation_type"], "submit_report");
        assert_eq!(record["payload"]["sn"], "A1");

        client.set_behavior(MockBehavior::Transient("offline".into()));
        assert!(matches!(
            sender.send(&op).await,
            Err(DeliveryError::Transient(_))
        ));
    }
}
