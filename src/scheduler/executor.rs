//! Work-stealing executor
//!
//! N worker lanes, each an independent priority heap. Placement happens at
//! submission time (shortest lane wins); stealing happens only when a
//! worker goes idle, and only from the most-loaded peer once that peer
//! holds more than `steal_threshold` tasks. The steal path takes a
//! non-blocking `try_lock` on the victim and silently gives up on
//! contention, so two idle workers can never deadlock over a lane.
//!
//! Ordering is intentionally weak: priority order is best effort within a
//! single lane only. Once a task has been stolen there is no global
//! priority order across workers, and callers must not rely on one.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::config::ExecutorConfig;
use crate::error::TaskError;
use crate::scheduler::task::{Task, TaskBuilder, TaskHandle};

/// Interval between process CPU samples feeding the throttle gauge.
const CPU_SAMPLE_INTERVAL_MS: u64 = 100;

/// How long `stop` waits for each worker before aborting it.
const SHUTDOWN_GRACE_MS: u64 = 5_000;

struct Lane {
    queue: Mutex<BinaryHeap<Task>>,
    notify: Notify,
    /// Cached depth so lane selection and steal-victim scans never take
    /// a lock.
    depth: AtomicUsize,
}

impl Lane {
    fn new() -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            depth: AtomicUsize::new(0),
        }
    }

    fn push(&self, task: Task) {
        let mut queue = self.queue.lock();
        queue.push(task);
        self.depth.store(queue.len(), Ordering::Relaxed);
        drop(queue);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Task> {
        let mut queue = self.queue.lock();
        let task = queue.pop();
        self.depth.store(queue.len(), Ordering::Relaxed);
        task
    }

    /// Non-blocking pop for the steal path. Contention aborts the steal.
    fn try_steal(&self) -> Option<Task> {
        let mut queue = self.queue.try_lock()?;
        let task = queue.pop();
        self.depth.store(queue.len(), Ordering::Relaxed);
        task
    }
}

#[derive(Default)]
struct StatCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    stolen: AtomicU64,
    cancelled: AtomicU64,
    throttle_events: AtomicU64,
}

/// Point-in-time executor statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub workers: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub stolen: u64,
    pub cancelled: u64,
    pub throttle_events: u64,
    pub queue_depths: Vec<usize>,
    pub cpu_percent: f32,
}

struct ExecutorInner {
    lanes: Vec<Lane>,
    config: ExecutorConfig,
    stats: StatCounters,
    /// Latest process CPU (% of all cores), written by the sampler task.
    cpu_gauge: AtomicCell<f32>,
    /// Bounds queued-plus-running tasks; each task holds one permit
    /// until it reaches a terminal state.
    capacity: Arc<Semaphore>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl ExecutorInner {
    fn shortest_lane(&self) -> usize {
        let mut best = 0;
        let mut best_depth = usize::MAX;
        for (i, lane) in self.lanes.iter().enumerate() {
            let depth = lane.depth.load(Ordering::Relaxed);
            if depth < best_depth {
                best = i;
                best_depth = depth;
            }
        }
        best
    }

    fn place(&self, task: Task) {
        self.lanes[self.shortest_lane()].push(task);
    }
}

/// Pick the most-loaded peer worth stealing from, or `None` when every
/// peer sits at or below the threshold.
fn steal_victim(depths: &[usize], me: usize, threshold: usize) -> Option<usize> {
    let mut victim = None;
    let mut victim_depth = threshold;
    for (i, &depth) in depths.iter().enumerate() {
        if i != me && depth > victim_depth {
            victim = Some(i);
            victim_depth = depth;
        }
    }
    victim
}

/// Priority executor with idle-time work stealing and CPU throttling.
pub struct WorkStealingExecutor {
    inner: Arc<ExecutorInner>,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkStealingExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let workers = config.worker_count();
        let inner = ExecutorInner {
            lanes: (0..workers).map(|_| Lane::new()).collect(),
            capacity: Arc::new(Semaphore::new(config.queue_capacity.max(1))),
            config,
            stats: StatCounters::default(),
            cpu_gauge: AtomicCell::new(0.0),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker loops and the CPU sampler. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(cpu_sampler(Arc::clone(&self.inner))));
        for worker in 0..self.inner.lanes.len() {
            handles.push(tokio::spawn(worker_loop(Arc::clone(&self.inner), worker)));
        }
        tracing::info!(
            workers = self.inner.lanes.len(),
            steal_threshold = self.inner.config.steal_threshold,
            "work-stealing executor started"
        );
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Queue a task on the currently shortest lane and return a handle to
    /// await its result. Rejects with [`TaskError::QueueFull`] when the
    /// executor already holds `queue_capacity` queued-plus-running tasks.
    pub fn submit(&self, builder: TaskBuilder) -> Result<TaskHandle, TaskError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(TaskError::ShuttingDown);
        }
        let Ok(permit) = Arc::clone(&self.inner.capacity).try_acquire_owned() else {
            return Err(TaskError::QueueFull {
                capacity: self.inner.config.queue_capacity,
            });
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let task = Task {
            id,
            priority: builder.priority,
            resource_type: builder.resource_type,
            seq,
            created_at: Instant::now(),
            timeout: builder.timeout,
            retries: 0,
            max_retries: builder.max_retries,
            retry_delay: builder
                .retry_delay
                .unwrap_or_else(|| self.inner.config.retry_delay()),
            func: builder.func,
            done_tx: tx,
            _permit: permit,
        };

        self.inner.place(task);
        self.inner.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(TaskHandle { id, rx })
    }

    /// Stop all workers. Queued tasks are drained and completed with
    /// [`TaskError::Cancelled`]; the in-flight task on each worker is
    /// dropped at its next suspension point and reported cancelled too.
    pub async fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.shutdown_notify.notify_waiters();
        for lane in &self.inner.lanes {
            lane.notify.notify_waiters();
        }

        let grace = std::time::Duration::from_millis(SHUTDOWN_GRACE_MS);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
                tracing::warn!("worker exceeded shutdown grace period, aborted");
            }
        }

        // Everything still queued is abandoned, never silently dropped.
        let mut drained = 0u64;
        for lane in &self.inner.lanes {
            while let Some(task) = lane.pop() {
                task.complete(Err(TaskError::Cancelled));
                drained += 1;
            }
        }
        if drained > 0 {
            self.inner
                .stats
                .cancelled
                .fetch_add(drained, Ordering::Relaxed);
            tracing::warn!(count = drained, "cancelled queued tasks on shutdown");
        }
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("work-stealing executor stopped");
    }

    pub fn get_stats(&self) -> ExecutorStats {
        let s = &self.inner.stats;
        ExecutorStats {
            workers: self.inner.lanes.len(),
            submitted: s.submitted.load(Ordering::Relaxed),
            completed: s.completed.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            retried: s.retried.load(Ordering::Relaxed),
            stolen: s.stolen.load(Ordering::Relaxed),
            cancelled: s.cancelled.load(Ordering::Relaxed),
            throttle_events: s.throttle_events.load(Ordering::Relaxed),
            queue_depths: self
                .inner
                .lanes
                .iter()
                .map(|l| l.depth.load(Ordering::Relaxed))
                .collect(),
            cpu_percent: self.inner.cpu_gauge.load(),
        }
    }
}

/// Resolves once shutdown is flagged. The waiter is registered before
/// the flag is re-checked, so a notification racing the registration can
/// never be missed.
async fn shutdown_signal(inner: &ExecutorInner) {
    loop {
        let notified = inner.shutdown_notify.notified();
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

/// Periodically refresh the process CPU gauge the workers throttle on.
async fn cpu_sampler(inner: Arc<ExecutorInner>) {
    let Ok(pid) = sysinfo::get_current_pid() else {
        tracing::warn!("could not resolve current pid, CPU throttling disabled");
        return;
    };
    let mut system = sysinfo::System::new_all();
    let cores = system.cpus().len().max(1) as f32;
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(CPU_SAMPLE_INTERVAL_MS));

    while !inner.shutdown.load(Ordering::SeqCst) {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_signal(&inner) => break,
        }
        system.refresh_all();
        if let Some(process) = system.process(pid) {
            // cpu_usage() is % of one core; normalize to % of the machine.
            inner.cpu_gauge.store(process.cpu_usage() / cores);
        }
    }
}

async fn worker_loop(inner: Arc<ExecutorInner>, worker: usize) {
    let poll_interval = inner.config.poll_interval();
    let backoff = inner.config.throttle_backoff();

    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Adaptive throttling: back off before taking new work while the
        // process runs hotter than the configured threshold.
        let cpu = inner.cpu_gauge.load();
        if cpu > inner.config.throttle_threshold {
            inner.stats.throttle_events.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(worker, cpu, "throttling");
            // Back off harder once past the hard ceiling.
            let pause = if cpu > inner.config.max_cpu_percent {
                backoff * 2
            } else {
                backoff
            };
            tokio::time::sleep(pause).await;
            continue;
        }

        let task = match inner.lanes[worker].pop() {
            Some(task) => task,
            None => {
                // Wait briefly for local work, then try to steal.
                tokio::select! {
                    _ = inner.lanes[worker].notify.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown_signal(&inner) => break,
                }
                if let Some(task) = inner.lanes[worker].pop() {
                    task
                } else {
                    match steal(&inner, worker) {
                        Some(task) => task,
                        None => continue,
                    }
                }
            }
        };

        run_task(&inner, task).await;
    }
}

fn steal(inner: &ExecutorInner, worker: usize) -> Option<Task> {
    let depths: Vec<usize> = inner
        .lanes
        .iter()
        .map(|l| l.depth.load(Ordering::Relaxed))
        .collect();
    let victim = steal_victim(&depths, worker, inner.config.steal_threshold)?;
    let task = inner.lanes[victim].try_steal()?;
    inner.stats.stolen.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(worker, victim, task = task.id, "stole task");
    Some(task)
}

/// Execute one task attempt, retrying locally until the budget runs out.
async fn run_task(inner: &Arc<ExecutorInner>, mut task: Task) {
    let started = Instant::now();
    tracing::trace!(
        task = task.id,
        resource = ?task.resource_type,
        queued_ms = task.created_at.elapsed().as_millis() as u64,
        "task starting"
    );

    let attempt = (task.func)();
    let result = match task.timeout {
        Some(limit) => tokio::select! {
            outcome = tokio::time::timeout(limit, attempt) => match outcome {
                Ok(r) => r,
                Err(_) => Err(TaskError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    limit_ms: limit.as_millis() as u64,
                }),
            },
            _ = shutdown_signal(inner) => {
                inner.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                task.complete(Err(TaskError::Cancelled));
                return;
            }
        },
        None => tokio::select! {
            r = attempt => r,
            _ = shutdown_signal(inner) => {
                inner.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                task.complete(Err(TaskError::Cancelled));
                return;
            }
        },
    };

    match result {
        Ok(value) => {
            inner.stats.completed.fetch_add(1, Ordering::Relaxed);
            task.complete(Ok(value));
        }
        Err(err) if task.retries < task.max_retries => {
            task.retries += 1;
            inner.stats.retried.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                task = task.id,
                attempt = task.retries,
                max = task.max_retries,
                error = %err,
                "task failed, retrying"
            );
            tokio::time::sleep(task.retry_delay).await;
            inner.place(task);
        }
        Err(err) => {
            inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(task = task.id, error = %err, "task failed permanently");
            task.complete(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::TaskPriority;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_config(workers: usize) -> ExecutorConfig {
        ExecutorConfig {
            workers,
            steal_threshold: 5,
            // Disable throttling in tests: the gauge starts at 0.
            throttle_threshold: 101.0,
            poll_interval_ms: 5,
            retry_delay_ms: 5,
            ..ExecutorConfig::default()
        }
    }

    #[test]
    fn steal_victim_respects_threshold() {
        // No peer above the threshold: never steal.
        assert_eq!(steal_victim(&[0, 5, 3], 0, 5), None);
        // Peer strictly above: steal from it.
        assert_eq!(steal_victim(&[0, 6, 3], 0, 5), Some(1));
        // Most loaded peer wins.
        assert_eq!(steal_victim(&[0, 8, 12], 0, 5), Some(2));
        // Own lane is never a victim.
        assert_eq!(steal_victim(&[40, 2], 0, 5), None);
    }

    #[tokio::test]
    async fn submit_and_await() {
        let exec = WorkStealingExecutor::new(test_config(2));
        exec.start();

        let handle = exec
            .submit(TaskBuilder::new(|| async { Ok::<_, TaskError>(7u64 * 6) }))
            .unwrap();
        let value: u64 = handle.await_typed().await.unwrap();
        assert_eq!(value, 42);

        exec.stop().await;
        let stats = exec.get_stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn retries_then_surfaces_error() {
        let exec = WorkStealingExecutor::new(test_config(1));
        exec.start();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let handle = exec
            .submit(
                TaskBuilder::new(move || {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TaskError::Execution("bad quote".to_string()))
                    }
                })
                .max_retries(2)
                .retry_delay(Duration::from_millis(1)),
            )
            .unwrap();

        let err = handle.await_result().await.unwrap_err();
        assert!(matches!(err, TaskError::Execution(_)));
        // One initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = exec.get_stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
        exec.stop().await;
    }

    #[tokio::test]
    async fn timeout_is_retried_then_reported() {
        let exec = WorkStealingExecutor::new(test_config(1));
        exec.start();

        let handle = exec
            .submit(
                TaskBuilder::new(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, TaskError>(())
                })
                .timeout(Duration::from_millis(10)),
            )
            .unwrap();

        let err = handle.await_result().await.unwrap_err();
        assert!(matches!(err, TaskError::Timeout { .. }));
        exec.stop().await;
    }

    #[tokio::test]
    async fn priority_order_within_one_lane() {
        // Single worker, tasks queued before start: pops must follow
        // priority order. This is the per-lane guarantee only.
        let exec = WorkStealingExecutor::new(test_config(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (priority, tag) in [
            (TaskPriority::Low, "low"),
            (TaskPriority::Critical, "critical"),
            (TaskPriority::Normal, "normal"),
        ] {
            let order = Arc::clone(&order);
            handles.push(
                exec.submit(
                    TaskBuilder::new(move || {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().push(tag);
                            Ok::<_, TaskError>(())
                        }
                    })
                    .priority(priority),
                )
                .unwrap(),
            );
        }

        exec.start();
        for handle in handles {
            handle.await_result().await.unwrap();
        }

        assert_eq!(*order.lock(), vec!["critical", "normal", "low"]);
        exec.stop().await;
    }

    #[tokio::test]
    async fn submit_rejects_past_queue_capacity() {
        let mut config = test_config(2);
        config.queue_capacity = 8;
        // Never started: nothing drains, so the bound is exact.
        let exec = WorkStealingExecutor::new(config);

        let mut handles = Vec::new();
        for _ in 0..8 {
            handles.push(
                exec.submit(TaskBuilder::new(|| async { Ok::<_, TaskError>(()) }))
                    .unwrap(),
            );
        }
        let err = exec
            .submit(TaskBuilder::new(|| async { Ok::<_, TaskError>(()) }))
            .unwrap_err();
        assert!(matches!(err, TaskError::QueueFull { capacity: 8 }));
        exec.stop().await;
    }

    #[tokio::test]
    async fn capacity_recycles_as_tasks_finish() {
        let mut config = test_config(1);
        config.queue_capacity = 2;
        let exec = WorkStealingExecutor::new(config);
        exec.start();

        for _ in 0..5 {
            let handle = exec
                .submit(TaskBuilder::new(|| async { Ok::<_, TaskError>(1u8) }))
                .unwrap();
            handle.await_result().await.unwrap();
        }
        exec.stop().await;
        assert_eq!(exec.get_stats().completed, 5);
    }

    #[tokio::test]
    async fn stop_interrupts_in_flight_task() {
        let exec = WorkStealingExecutor::new(test_config(1));
        exec.start();

        // No timeout: only cancellation can resolve this task early.
        let handle = exec
            .submit(TaskBuilder::new(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, TaskError>(())
            }))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio::time::timeout(Duration::from_secs(5), exec.stop())
            .await
            .expect("stop must complete promptly");
        let err = handle.await_result().await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
    }

    #[tokio::test]
    async fn idle_worker_steals_from_hot_lane() {
        use crate::scheduler::task::{ResourceType, TaskFn, TaskOutput, TaskResult};
        use futures_util::future::BoxFuture;

        let mut config = test_config(2);
        config.steal_threshold = 1;
        let exec = WorkStealingExecutor::new(config);

        // Load one lane directly so submission balancing cannot spread
        // the work; the other worker has nothing local to do.
        let mut receivers = Vec::new();
        for seq in 0..10u64 {
            let (tx, rx) = oneshot::channel();
            let func: TaskFn = Arc::new(|| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Box::new(()) as TaskOutput)
                }) as BoxFuture<'static, TaskResult>
            });
            let permit = Arc::clone(&exec.inner.capacity).try_acquire_owned().unwrap();
            exec.inner.lanes[0].push(Task {
                id: seq,
                priority: TaskPriority::Normal,
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
            });
            receivers.push(rx);
        }

        exec.start();
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }
        assert!(exec.get_stats().stolen > 0);
        exec.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_queued_tasks() {
        let exec = WorkStealingExecutor::new(test_config(1));
        // Never started: the queued task can only resolve via stop().
        let handle = exec
            .submit(TaskBuilder::new(|| async { Ok::<_, TaskError>(()) }))
            .unwrap();
        exec.stop().await;

        let err = handle.await_result().await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert!(exec.submit(TaskBuilder::new(|| async { Ok::<_, TaskError>(()) })).is_err());
    }
}
