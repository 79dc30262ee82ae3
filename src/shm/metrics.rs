//! Shared metrics store
//!
//! One lazily-created region per metric type (`metrics_<type>`). Values
//! are wrapped with a wall-clock timestamp on write and considered stale
//! once older than the type's TTL, at which point readers see `None`
//! rather than outdated numbers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::error::ShmError;
use crate::shm::region::{RegionType, SharedMemoryManager};

const REGION_PREFIX: &str = "metrics_";

pub struct SharedMetricsStore {
    shm: Arc<SharedMemoryManager>,
    default_ttl: Duration,
    ttls: RwLock<HashMap<String, Duration>>,
}

impl SharedMetricsStore {
    pub fn new(shm: Arc<SharedMemoryManager>) -> Self {
        let default_ttl = shm.config().default_metrics_ttl();
        Self {
            shm,
            default_ttl,
            ttls: RwLock::new(HashMap::new()),
        }
    }

    /// Override the staleness TTL for one metric type.
    pub fn set_ttl(&self, metric_type: &str, ttl: Duration) {
        self.ttls.write().insert(metric_type.to_string(), ttl);
    }

    pub fn get_ttl(&self, metric_type: &str) -> Duration {
        self.ttls
            .read()
            .get(metric_type)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Store metrics for a type, stamping them with the current time.
    pub fn store_metrics(&self, metric_type: &str, value: &Value) -> Result<(), ShmError> {
        let region = self.ensure_region(metric_type)?;
        let envelope = json!({
            "data": value,
            "timestamp": Utc::now().timestamp_millis(),
        });
        self.shm.write_data(&region, &envelope, 0, true)?;
        Ok(())
    }

    /// Fetch metrics for a type; `None` when absent, never written, or
    /// older than the type's TTL.
    pub fn get_metrics(&self, metric_type: &str) -> Result<Option<Value>, ShmError> {
        let region = region_name(metric_type);
        let envelope = match self.shm.read_data(&region, 0) {
            Ok(v) => v,
            Err(ShmError::RegionNotFound(_)) | Err(ShmError::CorruptData(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(unwrap_fresh(envelope, self.get_ttl(metric_type)))
    }

    /// Read-modify-write a metric value in one atomic cycle. The closure
    /// sees the current fresh value (or `None`), and the result is
    /// re-stamped.
    pub fn update_metrics<F>(&self, metric_type: &str, update_fn: F) -> Result<(), ShmError>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let region = self.ensure_region(metric_type)?;
        let ttl = self.get_ttl(metric_type);
        self.shm.update_data(
            &region,
            |current| {
                let fresh = current.and_then(|envelope| unwrap_fresh(envelope, ttl));
                json!({
                    "data": update_fn(fresh),
                    "timestamp": Utc::now().timestamp_millis(),
                })
            },
            0,
            true,
        )?;
        Ok(())
    }

    /// All non-stale metrics, keyed by type.
    pub fn get_all_metrics(&self) -> Result<BTreeMap<String, Value>, ShmError> {
        let mut all = BTreeMap::new();
        for region in self.shm.list_regions(Some(RegionType::Metrics))? {
            let Some(metric_type) = region.name.strip_prefix(REGION_PREFIX) else {
                continue;
            };
            if let Some(value) = self.get_metrics(metric_type)? {
                all.insert(metric_type.to_string(), value);
            }
        }
        Ok(all)
    }

    fn ensure_region(&self, metric_type: &str) -> Result<String, ShmError> {
        let region = region_name(metric_type);
        match self.shm.get_region_info(&region) {
            Ok(_) => Ok(region),
            Err(ShmError::RegionNotFound(_)) => {
                let size = self.shm.config().default_region_size;
                match self.shm.create_region(&region, size, RegionType::Metrics, None) {
                    Ok(_) => Ok(region),
                    // Lost a create race to another process; the region
                    // exists now, which is all we needed.
                    Err(ShmError::RegionExists(_)) => Ok(region),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

fn region_name(metric_type: &str) -> String {
    format!("{REGION_PREFIX}{metric_type}")
}

/// Pull `data` out of a timestamped envelope if it is within `ttl`.
fn unwrap_fresh(envelope: Value, ttl: Duration) -> Option<Value> {
    let stamp = envelope.get("timestamp")?.as_i64()?;
    let age_ms = Utc::now().timestamp_millis().saturating_sub(stamp);
    if age_ms < 0 || age_ms as u128 > ttl.as_millis() {
        return None;
    }
    envelope.get("data").cloned()
}
