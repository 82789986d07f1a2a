// Port Layer - Interfaces for external dependencies

pub mod converter;
pub mod delivery_client;
pub mod id_provider; // For deterministic testing
pub mod operation_sender;
pub mod operation_store;
pub mod source_inbox;
pub mod time_provider;
pub mod work_queue;

// Re-exports
pub use converter::{ConversionOutcome, ConvertError, Converter};
pub use delivery_client::{DeliveryClient, DeliveryError};
pub use id_provider::IdProvider;
pub use operation_sender::OperationSender;
pub use operation_store::{OperationStore, StorePartition};
pub use source_inbox::{marker_path, PostProcess, SourceFile, SourceInbox, MARKER_EXTENSION};
pub use time_provider::TimeProvider;
pub use work_queue::{QueueStats, WorkQueue};
