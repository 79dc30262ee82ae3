//! Batched asynchronous file IO
//!
//! Reads and writes queue into independent bounded priority queues. A
//! dispatcher per queue fires a batch when either trigger lands:
//! - the queue holds `max_batch_size` requests (throughput bound), or
//! - the queue is non-empty and `batch_interval` has elapsed since the
//!   last batch (latency bound).
//!
//! A batch is grouped by parent directory (cache locality, and a write
//! group's directory is created exactly once) and executed through a
//! bounded worker semaphore. Every request resolves its own completion
//! channel, so one failing item never fails its siblings.

use std::collections::{BTreeMap, BinaryHeap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::config::IoConfig;
use crate::error::TaskError;
use crate::scheduler::TaskPriority;

enum IoOp {
    Read { path: PathBuf },
    Write { path: PathBuf, data: Vec<u8> },
}

impl IoOp {
    fn path(&self) -> &Path {
        match self {
            Self::Read { path } => path,
            Self::Write { path, .. } => path,
        }
    }
}

enum IoOutcome {
    Read(Vec<u8>),
    Written(usize),
}

struct IoRequest {
    priority: TaskPriority,
    seq: u64,
    op: IoOp,
    /// Queue-capacity permit, held until the request resolves.
    _permit: OwnedSemaphorePermit,
    done: oneshot::Sender<Result<IoOutcome, TaskError>>,
}

impl PartialEq for IoRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for IoRequest {}
impl PartialOrd for IoRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for IoRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct IoQueue {
    heap: Mutex<BinaryHeap<IoRequest>>,
    notify: Notify,
    capacity: Arc<Semaphore>,
    seq: AtomicU64,
}

impl IoQueue {
    fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            capacity: Arc::new(Semaphore::new(capacity)),
            seq: AtomicU64::new(0),
        }
    }

    fn depth(&self) -> usize {
        self.heap.lock().len()
    }

    fn drain_batch(&self, max: usize) -> Vec<IoRequest> {
        let mut heap = self.heap.lock();
        let take = heap.len().min(max);
        (0..take).filter_map(|_| heap.pop()).collect()
    }
}

#[derive(Default)]
struct IoStatCounters {
    batches: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time IO manager statistics.
#[derive(Debug, Clone, Serialize)]
pub struct IoStats {
    pub batches: u64,
    pub reads: u64,
    pub writes: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
    pub errors: u64,
    pub pending_reads: usize,
    pub pending_writes: usize,
}

struct IoInner {
    config: IoConfig,
    read_queue: IoQueue,
    write_queue: IoQueue,
    /// Bounds concurrent filesystem operations across all batches.
    workers: Arc<Semaphore>,
    stats: IoStatCounters,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

/// Priority-batched file IO front end.
pub struct BatchedIoManager {
    inner: Arc<IoInner>,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchedIoManager {
    pub fn new(config: IoConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let workers = config.io_workers.max(1);
        let inner = IoInner {
            read_queue: IoQueue::new(capacity),
            write_queue: IoQueue::new(capacity),
            workers: Arc::new(Semaphore::new(workers)),
            stats: IoStatCounters::default(),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the two dispatcher loops. Idempotent; called lazily on
    /// first enqueue as well.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(dispatcher(Arc::clone(&self.inner), Lane::Read)));
        handles.push(tokio::spawn(dispatcher(Arc::clone(&self.inner), Lane::Write)));
        tracing::info!(
            max_batch = self.inner.config.max_batch_size,
            interval_ms = self.inner.config.batch_interval_ms,
            "batched io manager started"
        );
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Queue a read and wait for its batch to execute.
    pub async fn read_file(
        &self,
        path: impl Into<PathBuf>,
        priority: TaskPriority,
    ) -> Result<Vec<u8>, TaskError> {
        let outcome = self
            .enqueue(Lane::Read, IoOp::Read { path: path.into() }, priority)
            .await?;
        match outcome {
            IoOutcome::Read(data) => Ok(data),
            IoOutcome::Written(_) => Err(TaskError::Execution(
                "read request resolved as write".to_string(),
            )),
        }
    }

    /// Queue a read and decode the contents as UTF-8.
    pub async fn read_file_to_string(
        &self,
        path: impl Into<PathBuf>,
        priority: TaskPriority,
    ) -> Result<String, TaskError> {
        let data = self.read_file(path, priority).await?;
        String::from_utf8(data).map_err(|e| {
            TaskError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    /// Queue a write and wait for its batch to execute. Returns the byte
    /// count written. Parent directories are created per batch group.
    pub async fn write_file(
        &self,
        path: impl Into<PathBuf>,
        data: Vec<u8>,
        priority: TaskPriority,
    ) -> Result<usize, TaskError> {
        let outcome = self
            .enqueue(
                Lane::Write,
                IoOp::Write {
                    path: path.into(),
                    data,
                },
                priority,
            )
            .await?;
        match outcome {
            IoOutcome::Written(n) => Ok(n),
            IoOutcome::Read(_) => Err(TaskError::Execution(
                "write request resolved as read".to_string(),
            )),
        }
    }

    async fn enqueue(
        &self,
        lane: Lane,
        op: IoOp,
        priority: TaskPriority,
    ) -> Result<IoOutcome, TaskError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(TaskError::ShuttingDown);
        }
        self.start();

        let queue = lane.queue(&self.inner);
        // Bounded backpressure: wait for queue capacity.
        let permit = Arc::clone(&queue.capacity)
            .acquire_owned()
            .await
            .map_err(|_| TaskError::ShuttingDown)?;

        let (tx, rx) = oneshot::channel();
        let request = IoRequest {
            priority,
            seq: queue.seq.fetch_add(1, Ordering::Relaxed),
            op,
            _permit: permit,
            done: tx,
        };
        {
            // Re-check under the heap lock: `stop` sets the flag before
            // draining, so a push that lands after the drain is impossible.
            let mut heap = queue.heap.lock();
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return Err(TaskError::ShuttingDown);
            }
            heap.push(request);
        }
        queue.notify.notify_one();

        rx.await.unwrap_or(Err(TaskError::QueueClosed))
    }

    pub fn get_stats(&self) -> IoStats {
        let s = &self.inner.stats;
        IoStats {
            batches: s.batches.load(Ordering::Relaxed),
            reads: s.reads.load(Ordering::Relaxed),
            writes: s.writes.load(Ordering::Relaxed),
            read_bytes: s.read_bytes.load(Ordering::Relaxed),
            written_bytes: s.written_bytes.load(Ordering::Relaxed),
            errors: s.errors.load(Ordering::Relaxed),
            pending_reads: self.inner.read_queue.depth(),
            pending_writes: self.inner.write_queue.depth(),
        }
    }

    /// Stop the dispatchers; pending requests resolve as cancelled and
    /// producers waiting on queue capacity are released with
    /// [`TaskError::ShuttingDown`].
    pub async fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.read_queue.capacity.close();
        self.inner.write_queue.capacity.close();
        self.inner.shutdown_notify.notify_waiters();
        self.inner.read_queue.notify.notify_waiters();
        self.inner.write_queue.notify.notify_waiters();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        for queue in [&self.inner.read_queue, &self.inner.write_queue] {
            for request in queue.drain_batch(usize::MAX) {
                let _ = request.done.send(Err(TaskError::Cancelled));
            }
        }
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("batched io manager stopped");
    }
}

#[derive(Clone, Copy)]
enum Lane {
    Read,
    Write,
}

impl Lane {
    fn queue<'a>(&self, inner: &'a IoInner) -> &'a IoQueue {
        match self {
            Self::Read => &inner.read_queue,
            Self::Write => &inner.write_queue,
        }
    }
}

/// Resolves once shutdown is flagged; registered before the flag is
/// re-checked so the notification cannot be missed.
async fn shutdown_signal(inner: &IoInner) {
    loop {
        let notified = inner.shutdown_notify.notified();
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

async fn dispatcher(inner: Arc<IoInner>, lane: Lane) {
    let interval = inner.config.batch_interval();
    let max_batch = inner.config.max_batch_size.max(1);
    let mut last_batch = Instant::now();

    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let queue = lane.queue(&inner);
        let depth = queue.depth();
        let due = depth >= max_batch || (depth > 0 && last_batch.elapsed() >= interval);

        if !due {
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_signal(&inner) => break,
            }
            continue;
        }

        let batch = queue.drain_batch(max_batch);
        last_batch = Instant::now();
        if batch.is_empty() {
            continue;
        }
        inner.stats.batches.fetch_add(1, Ordering::Relaxed);
        execute_batch(&inner, batch).await;
    }
}

/// Run one batch: group by parent directory, create write-group
/// directories once, then execute items under the worker semaphore.
async fn execute_batch(inner: &Arc<IoInner>, batch: Vec<IoRequest>) {
    let mut groups: BTreeMap<PathBuf, Vec<IoRequest>> = BTreeMap::new();
    for request in batch {
        let parent = request
            .op
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        groups.entry(parent).or_default().push(request);
    }

    let mut join = Vec::new();
    for (dir, requests) in groups {
        let has_write = requests
            .iter()
            .any(|r| matches!(r.op, IoOp::Write { .. }));
        if has_write && !dir.as_os_str().is_empty() {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to create batch directory");
                // Individual writes will surface their own errors below.
            }
        }

        for request in requests {
            let inner = Arc::clone(inner);
            let permit = match Arc::clone(&inner.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let _ = request.done.send(Err(TaskError::ShuttingDown));
                    continue;
                }
            };
            join.push(tokio::spawn(async move {
                let _permit = permit;
                let result = execute_request(&inner, request.op).await;
                if result.is_err() {
                    inner.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
                let _ = request.done.send(result);
            }));
        }
    }

    for handle in join {
        let _ = handle.await;
    }
}

async fn execute_request(inner: &IoInner, op: IoOp) -> Result<IoOutcome, TaskError> {
    match op {
        IoOp::Read { path } => {
            let data = tokio::fs::read(&path).await?;
            inner.stats.reads.fetch_add(1, Ordering::Relaxed);
            inner
                .stats
                .read_bytes
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            Ok(IoOutcome::Read(data))
        }
        IoOp::Write { path, data } => {
            let len = data.len();
            tokio::fs::write(&path, data).await?;
            inner.stats.writes.fetch_add(1, Ordering::Relaxed);
            inner
                .stats
                .written_bytes
                .fetch_add(len as u64, Ordering::Relaxed);
            Ok(IoOutcome::Written(len))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoConfig;
    use std::time::Duration;

    fn fast_config() -> IoConfig {
        IoConfig {
            max_batch_size: 4,
            batch_interval_ms: 10,
            queue_capacity: 64,
            io_workers: 2,
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let io = BatchedIoManager::new(fast_config());
        let path = dir.path().join("quotes/latest.json");

        let written = io
            .write_file(&path, b"{\"a\":1}".to_vec(), TaskPriority::Normal)
            .await
            .unwrap();
        assert_eq!(written, 7);

        let data = io.read_file(&path, TaskPriority::High).await.unwrap();
        assert_eq!(data, b"{\"a\":1}");

        let text = io
            .read_file_to_string(&path, TaskPriority::Normal)
            .await
            .unwrap();
        assert_eq!(text, "{\"a\":1}");

        let stats = io.get_stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 2);
        assert!(stats.batches >= 2);
        io.stop().await;
    }

    #[tokio::test]
    async fn sibling_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let io = BatchedIoManager::new(fast_config());
        let good = dir.path().join("data/good.bin");
        tokio::fs::create_dir_all(good.parent().unwrap()).await.unwrap();
        tokio::fs::write(&good, b"ok").await.unwrap();

        let missing = dir.path().join("data/missing.bin");
        let (read_good, read_missing) = tokio::join!(
            io.read_file(&good, TaskPriority::Normal),
            io.read_file(&missing, TaskPriority::Normal),
        );

        assert_eq!(read_good.unwrap(), b"ok");
        assert!(matches!(read_missing.unwrap_err(), TaskError::Io(_)));
        assert_eq!(io.get_stats().errors, 1);
        io.stop().await;
    }

    #[tokio::test]
    async fn writes_create_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let io = BatchedIoManager::new(fast_config());
        let nested = dir.path().join("a/b/c/out.txt");

        io.write_file(&nested, b"deep".to_vec(), TaskPriority::Low)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&nested).await.unwrap(), b"deep");
        io.stop().await;
    }

    #[tokio::test]
    async fn requests_after_stop_are_rejected() {
        let io = BatchedIoManager::new(fast_config());
        io.start();
        io.stop().await;

        let err = io
            .read_file("/no/such/file", TaskPriority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ShuttingDown));
    }

    #[tokio::test]
    async fn stop_resolves_parked_requests_promptly() {
        // The interval alone would park the dispatcher for a minute;
        // stop must still resolve the pending request and return.
        let io = Arc::new(BatchedIoManager::new(IoConfig {
            max_batch_size: 100,
            batch_interval_ms: 60_000,
            queue_capacity: 8,
            io_workers: 2,
        }));

        let io_in = Arc::clone(&io);
        let pending = tokio::spawn(async move {
            io_in.read_file("/no/such/file", TaskPriority::Normal).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(5), io.stop())
            .await
            .expect("stop must complete promptly");
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TaskError::Cancelled | TaskError::ShuttingDown));
    }

    #[tokio::test]
    async fn full_batch_triggers_without_waiting_for_interval() {
        let dir = tempfile::tempdir().unwrap();
        let io = BatchedIoManager::new(IoConfig {
            max_batch_size: 2,
            batch_interval_ms: 60_000, // interval alone would stall the test
            queue_capacity: 8,
            io_workers: 2,
        });

        let p1 = dir.path().join("x1");
        let p2 = dir.path().join("x2");
        let (w1, w2) = tokio::join!(
            io.write_file(&p1, b"1".to_vec(), TaskPriority::Normal),
            io.write_file(&p2, b"2".to_vec(), TaskPriority::Normal),
        );
        w1.unwrap();
        w2.unwrap();
        io.stop().await;
    }
}
