// Delivery Client Port
// The remote collector binding lives outside the relay

use crate::domain::{CanonicalRecord, RemoteId};
use async_trait::async_trait;
use thiserror::Error;

/// Delivery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Network or server trouble; worth retrying
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// The collector rejected the record itself; retrying cannot help
    #[error("Record rejected: {0}")]
    Validation(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Validation(_))
    }
}

/// Sends canonical records to the remote collector.
///
/// Called concurrently from every pool worker; implementations must be safe to share.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(&self, record: &CanonicalRecord) -> Result<RemoteId, DeliveryError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        Success,
        Transient(String),
        Validation(String),
        /// Fail transiently `n` times, then succeed
        FailTimes(usize),
        Panic(String),
    }

    /// Mock Delivery Client for testing
    pub struct MockDeliveryClient {
        behavior: Arc<Mutex<MockBehavior>>,
        delivered: Arc<Mutex<Vec<CanonicalRecord>>>,
        call_count: Arc<Mutex<usize>>,
        delay: Option<Duration>,
    }

    impl MockDeliveryClient {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Arc::new(Mutex::new(behavior)),
                delivered: Arc::new(Mutex::new(Vec::new())),
                call_count: Arc::new(Mutex::new(0)),
                delay: None,
            }
        }

        pub fn new_success() -> Self {
            Self::new(MockBehavior::Success)
        }

        /// Sleep before answering (for in-flight shutdown tests)
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn call_count(&self) -> usize {
            *self.call_count.lock().unwrap()
        }

        pub fn delivered(&self) -> Vec<CanonicalRecord> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryClient for MockDeliveryClient {
        async fn send(&self, record: &CanonicalRecord) -> Result<RemoteId, DeliveryError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let call = {
                let mut count = self.call_count.lock().unwrap();
                *count += 1;
                *count
            };
            let behavior = self.behavior.lock().unwrap().clone();

            match behavior {
                MockBehavior::Success => {}
                MockBehavior::Transient(msg) => return Err(DeliveryError::Transient(msg)),
                MockBehavior::Validation(msg) => return Err(DeliveryError::Validation(msg)),
                MockBehavior::FailTimes(n) if call <= n => {
                    return Err(DeliveryError::Transient(format!("mock failure {}", call)))
                }
                MockBehavior::FailTimes(_) => {}
                MockBehavior::Panic(msg) => panic!("{}", msg),
            }

            let mut delivered = self.delivered.lock().unwrap();
            delivered.push(record.clone());
            Ok(format!("remote-{}", delivered.len()))
        }
    }
}
