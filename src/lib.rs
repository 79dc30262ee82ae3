//! Arbitrage bot resource runtime
//!
//! The performance layer every other subsystem of the bot builds on:
//! - Priority work-stealing task executor with adaptive CPU throttling
//! - Generic object pools with TTL eviction (Web3 clients, buffers)
//! - Batched asynchronous file IO with priority queues
//! - A resource manager facade with periodic usage sampling
//! - Memory-mapped shared regions with process-safe locking, TTL metric
//!   caching, and optimistically versioned state
//!
//! Opportunity detection, DEX adapters, and dashboards consume this API;
//! none of that business logic lives here.

pub mod batch_io;
pub mod config;
pub mod error;
pub mod pool;
pub mod resource;
pub mod scheduler;
pub mod shm;

pub use batch_io::BatchedIoManager;
pub use config::RuntimeConfig;
pub use error::{ShmError, TaskError};
pub use pool::ObjectPool;
pub use resource::{ResourceManager, ResourceUsage};
pub use scheduler::{TaskBuilder, TaskPriority, WorkStealingExecutor};
pub use shm::{SharedMemoryManager, SharedMetricsStore, SharedStateManager};
