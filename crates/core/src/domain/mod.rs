// Domain Layer - Pure business logic and entities

pub mod error;
pub mod item;
pub mod operation;
pub mod record;

// Re-exports
pub use error::DomainError;
pub use item::{
    clamp_priority, ItemId, ItemPayload, ItemStatus, Metadata, NewItem, PayloadKind, Priority,
    QueueItem, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, HIGHEST_PRIORITY, LOWEST_PRIORITY,
};
pub use operation::{OperationId, OperationStatus, QueuedOperation};
pub use record::{CanonicalRecord, ConversionTask, RemoteId};
