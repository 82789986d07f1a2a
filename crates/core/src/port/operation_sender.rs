// Operation Sender Port
// Live action behind DeliveryQueueManager::send

use crate::domain::QueuedOperation;
use crate::port::DeliveryError;
use async_trait::async_trait;

/// Performs the live action for one queued operation
#[async_trait]
pub trait OperationSender: Send + Sync {
    async fn send(&self, operation: &QueuedOperation) -> Result<(), DeliveryError>;
}

pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Mock Sender: succeeds, or always fails with a fixed message
    pub struct MockOperationSender {
        failure: Arc<Mutex<Option<String>>>,
        sent: Arc<Mutex<Vec<QueuedOperation>>>,
        call_count: Arc<Mutex<usize>>,
    }

    impl MockOperationSender {
        pub fn new_success() -> Self {
            Self {
                failure: Arc::new(Mutex::new(None)),
                sent: Arc::new(Mutex::new(Vec::new())),
                call_count: Arc::new(Mutex::new(0)),
            }
        }

        pub fn new_fail(message: impl Into<String>) -> Self {
            let sender = Self::new_success();
            sender.set_failure(Some(message.into()));
            sender
        }

        pub fn set_failure(&self, message: Option<String>) {
            *self.failure.lock().unwrap() = message;
        }

        pub fn call_count(&self) -> usize {
            *self.call_count.lock().unwrap()
        }

        pub fn sent(&self) -> Vec<QueuedOperation> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OperationSender for MockOperationSender {
        async fn send(&self, operation: &QueuedOperation) -> Result<(), DeliveryError> {
            *self.call_count.lock().unwrap() += 1;
            if let Some(msg) = self.failure.lock().unwrap().clone() {
                return Err(DeliveryError::Transient(msg));
            }
            self.sent.lock().unwrap().push(operation.clone());
            Ok(())
        }
    }
}
