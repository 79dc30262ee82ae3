//! Error taxonomy for the resource runtime.
//!
//! Two families:
//! - [`TaskError`] — scheduling, execution, and facade failures
//! - [`ShmError`] — shared-memory regions, registry, and lock files
//!
//! Transient executor failures (timeouts, task panics) are retried up to
//! the task's budget before surfacing; everything else raises immediately.

use std::fmt;
use std::io;

/// Errors from the executor, object pools, and batched IO.
#[derive(Debug)]
pub enum TaskError {
    /// Task ran past its deadline.
    Timeout { elapsed_ms: u64, limit_ms: u64 },
    /// The task body returned an error (after exhausting retries).
    Execution(String),
    /// The task was abandoned during shutdown.
    Cancelled,
    /// Completion channel closed before a result was delivered.
    QueueClosed,
    /// No pool registered under this name.
    UnknownPool(String),
    /// Pool exists but holds a different object type.
    PoolTypeMismatch(String),
    /// Component is stopping and no longer accepts work.
    ShuttingDown,
    /// Executor is at capacity; the submission was rejected.
    QueueFull { capacity: usize },
    /// Underlying file IO failed.
    Io(io::Error),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed_ms, limit_ms } => {
                write!(f, "task timed out after {elapsed_ms}ms (limit {limit_ms}ms)")
            }
            Self::Execution(msg) => write!(f, "task execution failed: {msg}"),
            Self::Cancelled => write!(f, "task cancelled"),
            Self::QueueClosed => write!(f, "completion channel closed"),
            Self::UnknownPool(name) => write!(f, "unknown object pool: {name}"),
            Self::PoolTypeMismatch(name) => {
                write!(f, "object pool {name} holds a different type")
            }
            Self::ShuttingDown => write!(f, "component is shutting down"),
            Self::QueueFull { capacity } => {
                write!(f, "executor queue is full (capacity {capacity})")
            }
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TaskError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Errors from the shared-memory store and its layered facades.
#[derive(Debug)]
pub enum ShmError {
    /// Timed out acquiring a region or registry lock file.
    LockAcquisition { path: String, waited_ms: u64 },
    /// Unknown region name.
    RegionNotFound(String),
    /// A region with this name already exists.
    RegionExists(String),
    /// Value failed the region's declared schema.
    SchemaValidation(String),
    /// Malformed length header or undeserializable payload.
    CorruptData(String),
    /// Payload (plus header) does not fit the fixed region size.
    PayloadTooLarge { payload: usize, capacity: usize },
    /// Optimistic write lost the race: expected version is stale.
    VersionConflict { expected: u64, actual: u64 },
    /// Underlying filesystem operation failed.
    Io(io::Error),
    /// JSON encode/decode failed outside the payload path.
    Serialize(serde_json::Error),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockAcquisition { path, waited_ms } => {
                write!(f, "failed to acquire lock {path} after {waited_ms}ms")
            }
            Self::RegionNotFound(name) => write!(f, "memory region not found: {name}"),
            Self::RegionExists(name) => write!(f, "memory region already exists: {name}"),
            Self::SchemaValidation(msg) => write!(f, "schema validation failed: {msg}"),
            Self::CorruptData(msg) => write!(f, "corrupt region data: {msg}"),
            Self::PayloadTooLarge { payload, capacity } => write!(
                f,
                "payload of {payload} bytes exceeds region capacity of {capacity} bytes"
            ),
            Self::VersionConflict { expected, actual } => write!(
                f,
                "version conflict: expected {expected}, current is {actual}"
            ),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Serialize(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Serialize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ShmError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ShmError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize(e)
    }
}
