//! Cross-process shared-memory store
//!
//! Named, fixed-size memory-mapped regions with companion lock files:
//! - [`SharedMemoryManager`] — region registry plus length-prefixed
//!   JSON read/write/update primitives
//! - [`SharedMetricsStore`] — per-type metric regions with TTL staleness
//! - [`SharedStateManager`] — versioned state with optimistic CAS writes
//!
//! The API is synchronous by design: region access is bounded-wait file
//! locking plus a few kilobytes of memcpy. On the async runtime, wrap
//! calls in `spawn_blocking` or route them through the executor.

pub mod lock;
pub mod metrics;
pub mod region;
pub mod schema;
pub mod state;

pub use lock::{FileLock, LockKind};
pub use metrics::SharedMetricsStore;
pub use region::{MappedRegion, MemoryRegionInfo, RegionType, SharedMemoryManager};
pub use schema::{FieldType, Schema};
pub use state::SharedStateManager;
