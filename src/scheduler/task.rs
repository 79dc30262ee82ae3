//! Task types: priorities, resource tags, builders, and completion handles.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{oneshot, OwnedSemaphorePermit};

use crate::error::TaskError;

/// Scheduling priority. Higher variants are popped first within a lane;
/// ordering across lanes is best effort only (see the executor docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TaskPriority {
    Background = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

/// Dominant resource a task is expected to consume. Carried for stats
/// and operator visibility; it does not affect placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceType {
    Cpu,
    Memory,
    Io,
    Network,
    Custom,
}

/// Erased task output, downcast by the caller via
/// [`TaskHandle::await_typed`].
pub type TaskOutput = Box<dyn Any + Send>;

pub type TaskResult = Result<TaskOutput, TaskError>;

/// Re-invocable task body. `Fn` (not `FnOnce`) so the executor can run
/// it again on retry.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// A unit of scheduled work. Owned exclusively by the executor once
/// submitted; the submitter keeps only a [`TaskHandle`].
pub(crate) struct Task {
    pub id: u64,
    pub priority: TaskPriority,
    pub resource_type: ResourceType,
    /// Global submission sequence, tie-breaker for FIFO within a priority.
    pub seq: u64,
    pub created_at: Instant,
    pub timeout: Option<Duration>,
    pub retries: u32,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub func: TaskFn,
    pub done_tx: oneshot::Sender<TaskResult>,
    /// Executor-capacity permit, released when the task reaches a
    /// terminal state (completed, failed, or cancelled).
    pub _permit: OwnedSemaphorePermit,
}

impl Task {
    /// Deliver the terminal result. The receiver may have been dropped;
    /// that is not an error, the work simply had no remaining observer.
    pub fn complete(self, result: TaskResult) {
        let _ = self.done_tx.send(result);
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    /// Max-heap order: higher priority first, then lower sequence
    /// (earlier submission) first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Builder for a task submission.
pub struct TaskBuilder {
    pub(crate) func: TaskFn,
    pub(crate) priority: TaskPriority,
    pub(crate) resource_type: ResourceType,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_retries: u32,
    pub(crate) retry_delay: Option<Duration>,
}

impl TaskBuilder {
    /// Wrap an async body. The closure is re-invoked on retry, so it must
    /// be `Fn`, capturing shared state by `Arc`/clone rather than by move.
    pub fn new<F, Fut, T>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, TaskError>> + Send + 'static,
        T: Send + 'static,
    {
        let func: TaskFn = Arc::new(move || {
            let fut = f();
            Box::pin(async move {
                fut.await
                    .map(|v| Box::new(v) as TaskOutput)
            }) as BoxFuture<'static, TaskResult>
        });

        Self {
            func,
            priority: TaskPriority::Normal,
            resource_type: ResourceType::Cpu,
            timeout: None,
            max_retries: 0,
            retry_delay: None,
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay between retries; falls back to the executor's configured
    /// default when unset.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }
}

/// Submitter-side handle to a pending task.
#[derive(Debug)]
pub struct TaskHandle {
    pub id: u64,
    pub(crate) rx: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// Wait for the task to finish and return its erased result, or the
    /// error stored on the task after retries were exhausted.
    pub async fn await_result(self) -> TaskResult {
        self.rx.await.unwrap_or(Err(TaskError::QueueClosed))
    }

    /// Wait and downcast to the concrete output type.
    pub async fn await_typed<T: Send + 'static>(self) -> Result<T, TaskError> {
        let out = self.await_result().await?;
        out.downcast::<T>().map(|b| *b).map_err(|_| {
            TaskError::Execution("task result downcast to unexpected type".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_task(priority: TaskPriority, seq: u64) -> (Task, oneshot::Receiver<TaskResult>) {
        let (tx, rx) = oneshot::channel();
        let func: TaskFn = Arc::new(|| {
            Box::pin(async { Ok(Box::new(()) as TaskOutput) }) as BoxFuture<'static, TaskResult>
        });
        let permit = Arc::new(tokio::sync::Semaphore::new(1))
            .try_acquire_owned()
            .unwrap();
        (
            Task {
                id: seq,
                priority,
                resource_type: ResourceType::Cpu,
                seq,
                created_at: Instant::now(),
                timeout: None,
                retries: 0,
                max_retries: 0,
                retry_delay: Duration::from_millis(1),
                func,
                done_tx: tx,
                _permit: permit,
            },
            rx,
        )
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert!(TaskPriority::Low > TaskPriority::Background);
    }

    #[test]
    fn heap_pops_priority_then_fifo() {
        let mut heap = std::collections::BinaryHeap::new();
        let (a, _ra) = dummy_task(TaskPriority::Normal, 1);
        let (b, _rb) = dummy_task(TaskPriority::Critical, 2);
        let (c, _rc) = dummy_task(TaskPriority::Normal, 3);
        heap.push(a);
        heap.push(b);
        heap.push(c);

        assert_eq!(heap.pop().unwrap().seq, 2); // critical first
        assert_eq!(heap.pop().unwrap().seq, 1); // then FIFO among normals
        assert_eq!(heap.pop().unwrap().seq, 3);
    }

    #[tokio::test]
    async fn handle_downcasts_result() {
        let builder = TaskBuilder::new(|| async { Ok::<_, TaskError>(41 + 1) });
        let fut = (builder.func)();
        let out = fut.await.unwrap();
        assert_eq!(*out.downcast::<i32>().unwrap(), 42);
    }
}
