//! Resource manager facade
//!
//! Composes the work-stealing executor, named object pools, and the
//! batched IO manager behind one handle, and runs a periodic usage
//! monitor (CPU, memory, disk IO, network) with a bounded history ring.
//! Memory pressure above the configured ceiling triggers a reclaim pass
//! over everything this layer owns; CPU pressure is only logged here,
//! throttling is enforced inside the executor.
//!
//! The manager is an explicitly constructed service: build it at startup
//! and hand out `Arc<ResourceManager>` clones. There is no global
//! singleton.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::Networks;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::batch_io::{BatchedIoManager, IoStats};
use crate::config::RuntimeConfig;
use crate::error::TaskError;
use crate::pool::{Factory, ObjectPool, PoolStats, Validator};
use crate::scheduler::{ExecutorStats, TaskBuilder, TaskHandle, TaskPriority, WorkStealingExecutor};

/// Immutable usage snapshot appended to the monitor's history ring.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub memory_percent: f32,
    pub cpu_percent: f32,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub net_recv_bytes: u64,
    pub net_sent_bytes: u64,
    pub timestamp: i64,
}

/// Periodic sampler over sysinfo with a bounded history.
pub struct ResourceMonitor {
    system: Mutex<sysinfo::System>,
    networks: Mutex<Networks>,
    pid: Option<sysinfo::Pid>,
    history: RwLock<VecDeque<ResourceUsage>>,
    history_len: usize,
}

impl ResourceMonitor {
    pub fn new(history_len: usize) -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new_all()),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
            pid: sysinfo::get_current_pid().ok(),
            history: RwLock::new(VecDeque::with_capacity(history_len)),
            history_len: history_len.max(1),
        }
    }

    /// Take a fresh sample and append it to the history ring.
    pub fn sample(&self) -> ResourceUsage {
        let mut system = self.system.lock();
        system.refresh_all();

        let total = system.total_memory().max(1);
        let memory_percent = (system.used_memory() as f64 / total as f64 * 100.0) as f32;
        let cores = system.cpus().len().max(1) as f32;

        let (cpu_percent, io_read_bytes, io_write_bytes) = match self.pid.and_then(|p| system.process(p)) {
            Some(process) => {
                let disk = process.disk_usage();
                (
                    process.cpu_usage() / cores,
                    disk.total_read_bytes,
                    disk.total_written_bytes,
                )
            }
            None => (0.0, 0, 0),
        };
        drop(system);

        let mut networks = self.networks.lock();
        networks.refresh();
        let (net_recv_bytes, net_sent_bytes) = networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.total_received(), tx + data.total_transmitted())
            });
        drop(networks);

        let usage = ResourceUsage {
            memory_percent,
            cpu_percent,
            io_read_bytes,
            io_write_bytes,
            net_recv_bytes,
            net_sent_bytes,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        let mut history = self.history.write();
        if history.len() >= self.history_len {
            history.pop_front();
        }
        history.push_back(usage.clone());
        usage
    }

    pub fn latest(&self) -> Option<ResourceUsage> {
        self.history.read().back().cloned()
    }

    pub fn history(&self) -> Vec<ResourceUsage> {
        self.history.read().iter().cloned().collect()
    }

    /// Shrink the history ring (memory-pressure path).
    pub fn trim_history(&self, keep: usize) {
        let mut history = self.history.write();
        while history.len() > keep {
            history.pop_front();
        }
    }
}

/// Type-erased maintenance surface over a pool of any object type.
trait PoolMaintenance: Send + Sync {
    fn purge_all(&self) -> usize;
    fn stats(&self) -> PoolStats;
    fn shutdown(&self);
}

impl<T: Send + 'static> PoolMaintenance for ObjectPool<T> {
    fn purge_all(&self) -> usize {
        ObjectPool::purge_all(self)
    }
    fn stats(&self) -> PoolStats {
        self.get_stats()
    }
    fn shutdown(&self) {
        ObjectPool::shutdown(self)
    }
}

struct PoolSlot {
    /// `Arc<ObjectPool<T>>` behind `Any` for typed access.
    typed: Arc<dyn Any + Send + Sync>,
    maintenance: Arc<dyn PoolMaintenance>,
}

/// Combined statistics across the whole runtime.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceManagerStats {
    pub executor: ExecutorStats,
    pub io: IoStats,
    pub pools: Vec<PoolStats>,
    pub usage: Option<ResourceUsage>,
}

/// Facade over the executor, pools, batched IO, and the usage monitor.
pub struct ResourceManager {
    config: RuntimeConfig,
    executor: WorkStealingExecutor,
    io: BatchedIoManager,
    monitor: Arc<ResourceMonitor>,
    pools: RwLock<HashMap<String, PoolSlot>>,
    started: AtomicBool,
    shutdown_notify: Arc<Notify>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceManager {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            executor: WorkStealingExecutor::new(config.executor.clone()),
            io: BatchedIoManager::new(config.io.clone()),
            monitor: Arc::new(ResourceMonitor::new(config.monitor.history_len)),
            pools: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            shutdown_notify: Arc::new(Notify::new()),
            monitor_handle: Mutex::new(None),
            config,
        })
    }

    /// Start the executor, IO dispatchers, and the monitor loop.
    /// Idempotent; invoked lazily by the first submitted task or IO call.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.executor.start();
        self.io.start();

        let manager = Arc::clone(self);
        *self.monitor_handle.lock() = Some(tokio::spawn(monitor_loop(manager)));
        tracing::info!("resource manager started");
    }

    /// Stop everything. Queued tasks and IO requests resolve cancelled;
    /// pooled objects are dropped.
    pub async fn stop(&self) {
        // Flag first, then wake: the monitor may be mid-sample when the
        // notification fires, so it re-checks the flag every iteration.
        self.started.store(false, Ordering::SeqCst);
        self.shutdown_notify.notify_one();
        if let Some(handle) = self.monitor_handle.lock().take() {
            let _ = handle.await;
        }
        self.executor.stop().await;
        self.io.stop().await;
        for slot in self.pools.read().values() {
            slot.maintenance.shutdown();
        }
        tracing::info!("resource manager stopped");
    }

    // --- task scheduling ---

    /// Submit a task for execution; see [`TaskBuilder`] for knobs.
    pub fn submit_task(self: &Arc<Self>, builder: TaskBuilder) -> Result<TaskHandle, TaskError> {
        self.start();
        self.executor.submit(builder)
    }

    /// Submit and wait: returns the task's value, or the error stored on
    /// the task once its retry budget is exhausted.
    pub async fn run_task<T: Send + 'static>(
        self: &Arc<Self>,
        builder: TaskBuilder,
    ) -> Result<T, TaskError> {
        self.submit_task(builder)?.await_typed().await
    }

    // --- object pools ---

    /// Register a new named pool. Duplicate names are a programmer
    /// error and fail immediately.
    pub fn create_object_pool<T: Send + 'static>(
        &self,
        name: &str,
        max_size: usize,
        ttl: Duration,
        factory: Factory<T>,
        validation: Option<Validator<T>>,
    ) -> Result<Arc<ObjectPool<T>>, TaskError> {
        let mut pools = self.pools.write();
        if pools.contains_key(name) {
            return Err(TaskError::Execution(format!(
                "object pool '{name}' already exists"
            )));
        }
        let pool = ObjectPool::new(name, max_size, ttl, factory, validation);
        pools.insert(
            name.to_string(),
            PoolSlot {
                typed: Arc::clone(&pool) as Arc<dyn Any + Send + Sync>,
                maintenance: Arc::clone(&pool) as Arc<dyn PoolMaintenance>,
            },
        );
        Ok(pool)
    }

    /// Register a pool sized by the configured `[pool]` defaults.
    pub fn create_default_object_pool<T: Send + 'static>(
        &self,
        name: &str,
        factory: Factory<T>,
        validation: Option<Validator<T>>,
    ) -> Result<Arc<ObjectPool<T>>, TaskError> {
        self.create_object_pool(
            name,
            self.config.pool.default_max_size,
            self.config.pool.default_ttl(),
            factory,
            validation,
        )
    }

    /// Typed handle to a registered pool.
    pub fn pool<T: Send + 'static>(&self, name: &str) -> Result<Arc<ObjectPool<T>>, TaskError> {
        let pools = self.pools.read();
        let slot = pools
            .get(name)
            .ok_or_else(|| TaskError::UnknownPool(name.to_string()))?;
        Arc::clone(&slot.typed)
            .downcast::<ObjectPool<T>>()
            .map_err(|_| TaskError::PoolTypeMismatch(name.to_string()))
    }

    pub fn get_object<T: Send + 'static>(&self, pool_name: &str) -> Result<T, TaskError> {
        Ok(self.pool::<T>(pool_name)?.get())
    }

    pub fn release_object<T: Send + 'static>(
        &self,
        pool_name: &str,
        object: T,
    ) -> Result<(), TaskError> {
        self.pool::<T>(pool_name)?.release(object);
        Ok(())
    }

    // --- batched IO ---

    pub async fn read_file(
        self: &Arc<Self>,
        path: impl Into<PathBuf>,
        priority: TaskPriority,
    ) -> Result<Vec<u8>, TaskError> {
        self.start();
        self.io.read_file(path, priority).await
    }

    pub async fn write_file(
        self: &Arc<Self>,
        path: impl Into<PathBuf>,
        data: Vec<u8>,
        priority: TaskPriority,
    ) -> Result<usize, TaskError> {
        self.start();
        self.io.write_file(path, data, priority).await
    }

    // --- observability ---

    /// Fresh usage sample (also recorded into the history ring).
    pub fn get_resource_usage(&self) -> ResourceUsage {
        self.monitor.sample()
    }

    pub fn usage_history(&self) -> Vec<ResourceUsage> {
        self.monitor.history()
    }

    pub fn get_stats(&self) -> ResourceManagerStats {
        ResourceManagerStats {
            executor: self.executor.get_stats(),
            io: self.io.get_stats(),
            pools: self
                .pools
                .read()
                .values()
                .map(|slot| slot.maintenance.stats())
                .collect(),
            usage: self.monitor.latest(),
        }
    }

    /// Reclaim what this layer owns: drop idle pooled objects and shrink
    /// the usage history. Called automatically under memory pressure.
    pub fn reclaim_memory(&self) -> usize {
        let mut reclaimed = 0;
        for slot in self.pools.read().values() {
            reclaimed += slot.maintenance.purge_all();
        }
        self.monitor.trim_history(self.config.monitor.history_len / 4);
        reclaimed
    }
}

/// Periodic sampling with reactive reclaim. Unexpected per-tick problems
/// are logged and the loop continues; one bad sample must not kill it.
async fn monitor_loop(manager: Arc<ResourceManager>) {
    let config = manager.config.monitor.clone();
    let mut interval = tokio::time::interval(config.sample_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let shutdown = Arc::clone(&manager.shutdown_notify);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.notified() => {}
        }
        if !manager.started.load(Ordering::SeqCst) {
            break;
        }

        let usage = manager.monitor.sample();
        tracing::trace!(
            memory = usage.memory_percent,
            cpu = usage.cpu_percent,
            "resource sample"
        );

        if usage.memory_percent > config.max_memory_percent {
            let reclaimed = manager.reclaim_memory();
            tracing::warn!(
                memory = usage.memory_percent,
                threshold = config.max_memory_percent,
                reclaimed,
                "memory pressure, reclaimed idle resources"
            );
        }
        if usage.cpu_percent > config.max_cpu_percent {
            tracing::warn!(
                cpu = usage.cpu_percent,
                threshold = config.max_cpu_percent,
                "cpu above ceiling; executor throttling applies"
            );
        }
    }
}
