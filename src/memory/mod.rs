//! Memory access for debug sessions.
//!
//! [`MemoryService`] is the public surface; it validates requests, runs
//! them on the session dispatcher and publishes change notifications.
//! [`MemoryCache`] keeps fetched blocks coherent across reads, writes and
//! target-side changes. [`MemoryTarget`] is the downstream debugger.

mod block;
mod cache;
mod service;
mod sim;
mod target;
mod types;

pub use block::{valid_runs, CachedBlock, Partition, Segment};
pub use cache::{CacheConfig, CacheStats, MemoryCache};
pub use service::MemoryService;
pub use sim::{AccessRecord, SimulatedTarget};
pub use target::MemoryTarget;
pub use types::{
    values, ByteRange, ChangeNotification, ChangeOrigin, ChangeScope, ContextId, MemoryByte,
};
