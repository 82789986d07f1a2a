// Application Layer - Use Cases and Business Logic

pub mod breaker;
pub mod delivery;
pub mod pool;
pub mod queue;
pub mod retry;

// Re-exports
pub use breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState,
};
pub use delivery::{
    ClientOperationSender, DeliveryQueueConfig, DeliveryQueueManager, ProcessSummary,
};
pub use pool::{
    shutdown_channel, ConverterBinding, ConverterPool, PoolConfig, PoolStats, ScanStats,
    ShutdownSender, ShutdownToken, SubmitOutcome,
};
pub use queue::{AsyncQueue, MemoryQueue, MemoryQueueConfig};
pub use retry::{RetryDecision, RetryPolicy};
