// Queue - priority work queue and its async bridge

mod bridge;
mod memory;

pub use bridge::AsyncQueue;
pub use memory::{MemoryQueue, MemoryQueueConfig};
