//! Priority task scheduling
//!
//! A work-stealing executor with per-worker priority lanes:
//! - Submission goes to the shortest lane (load balancing up front)
//! - Idle workers steal one task from the most-loaded peer
//! - Workers self-throttle when process CPU runs hot
//! - Failed tasks retry locally with a fixed delay, then surface the error

pub mod executor;
pub mod task;

pub use executor::{ExecutorStats, WorkStealingExecutor};
pub use task::{ResourceType, TaskBuilder, TaskHandle, TaskPriority};
