//! Shared state with optimistic concurrency
//!
//! One region per state name (`state_<name>`). Each successful write
//! bumps a monotonically increasing version by exactly 1; a caller that
//! supplies an expected version performs a compare-and-swap and gets
//! `VersionConflict` when it lost the race, leaving the stored state
//! untouched. Change callbacks fire synchronously after a successful
//! write; a panicking callback is caught and logged, never propagated to
//! the writer.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ShmError;
use crate::shm::region::{RegionType, SharedMemoryManager};

const REGION_PREFIX: &str = "state_";

pub type StateCallback = Box<dyn Fn(&Value, u64) + Send + Sync>;

/// Persisted form of one state cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEntry {
    data: Value,
    version: u64,
    timestamp: i64,
}

pub struct SharedStateManager {
    shm: Arc<SharedMemoryManager>,
    callbacks: RwLock<HashMap<String, Vec<StateCallback>>>,
}

impl SharedStateManager {
    pub fn new(shm: Arc<SharedMemoryManager>) -> Self {
        Self {
            shm,
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Current `(value, version)`, or `None` for never-written state.
    pub fn get_state(&self, name: &str) -> Result<Option<(Value, u64)>, ShmError> {
        let region = region_name(name);
        let raw = match self.shm.read_data(&region, 0) {
            Ok(v) => v,
            Err(ShmError::RegionNotFound(_)) => return Ok(None),
            Err(ShmError::CorruptData(msg)) if msg.contains("never written") => return Ok(None),
            Err(e) => return Err(e),
        };
        let entry: StateEntry = serde_json::from_value(raw)
            .map_err(|e| ShmError::CorruptData(format!("state entry unreadable: {e}")))?;
        Ok(Some((entry.data, entry.version)))
    }

    /// Write state and return the new version. With
    /// `expected_version: Some(v)` this is a CAS: it succeeds only when
    /// the stored version equals `v`. `None` writes unconditionally.
    /// Versions start at 0 (unwritten) and increase by exactly 1 per
    /// successful write.
    pub fn set_state(
        &self,
        name: &str,
        value: Value,
        expected_version: Option<u64>,
    ) -> Result<u64, ShmError> {
        let region = self.ensure_region(name)?;

        let mut new_version = 0u64;
        self.shm.update_data_with(
            &region,
            |current| {
                let current_version = match current {
                    Some(raw) => serde_json::from_value::<StateEntry>(raw)
                        .map_err(|e| {
                            ShmError::CorruptData(format!("state entry unreadable: {e}"))
                        })?
                        .version,
                    None => 0,
                };
                if let Some(expected) = expected_version {
                    if expected != current_version {
                        return Err(ShmError::VersionConflict {
                            expected,
                            actual: current_version,
                        });
                    }
                }
                new_version = current_version + 1;
                let entry = StateEntry {
                    data: value.clone(),
                    version: new_version,
                    timestamp: Utc::now().timestamp_millis(),
                };
                serde_json::to_value(&entry).map_err(ShmError::from)
            },
            0,
            true,
        )?;

        self.fire_callbacks(name, &value, new_version);
        Ok(new_version)
    }

    /// Register a callback invoked synchronously with
    /// `(new_value, new_version)` after every successful write to `name`
    /// made through this manager instance.
    pub fn register_change_callback(&self, name: &str, callback: StateCallback) {
        self.callbacks
            .write()
            .entry(name.to_string())
            .or_default()
            .push(callback);
    }

    fn fire_callbacks(&self, name: &str, value: &Value, version: u64) {
        let callbacks = self.callbacks.read();
        let Some(registered) = callbacks.get(name) else {
            return;
        };
        for callback in registered {
            if catch_unwind(AssertUnwindSafe(|| callback(value, version))).is_err() {
                tracing::error!(state = name, version, "state change callback panicked");
            }
        }
    }

    fn ensure_region(&self, name: &str) -> Result<String, ShmError> {
        let region = region_name(name);
        match self.shm.get_region_info(&region) {
            Ok(_) => Ok(region),
            Err(ShmError::RegionNotFound(_)) => {
                let size = self.shm.config().default_region_size;
                match self.shm.create_region(&region, size, RegionType::State, None) {
                    Ok(_) => Ok(region),
                    Err(ShmError::RegionExists(_)) => Ok(region),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

fn region_name(name: &str) -> String {
    format!("{REGION_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShmConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn states() -> (SharedStateManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let shm = SharedMemoryManager::new(ShmConfig {
            root_dir: dir.path().to_string_lossy().to_string(),
            default_region_size: 4096,
            ..ShmConfig::default()
        })
        .unwrap();
        (SharedStateManager::new(Arc::new(shm)), dir)
    }

    #[test]
    fn versions_increment_by_one() {
        let (states, _dir) = states();
        assert_eq!(states.get_state("mode").unwrap(), None);

        let v1 = states.set_state("mode", json!("scanning"), None).unwrap();
        assert_eq!(v1, 1);
        let v2 = states.set_state("mode", json!("executing"), None).unwrap();
        assert_eq!(v2, 2);

        let (value, version) = states.get_state("mode").unwrap().unwrap();
        assert_eq!(value, json!("executing"));
        assert_eq!(version, 2);
    }

    #[test]
    fn stale_cas_conflicts_and_leaves_state() {
        let (states, _dir) = states();
        let v1 = states.set_state("route", json!("A"), None).unwrap();
        assert_eq!(v1, 1);

        let v2 = states.set_state("route", json!("B"), Some(1)).unwrap();
        assert_eq!(v2, 2);

        let err = states.set_state("route", json!("C"), Some(1)).unwrap_err();
        assert!(matches!(
            err,
            ShmError::VersionConflict { expected: 1, actual: 2 }
        ));

        let (value, version) = states.get_state("route").unwrap().unwrap();
        assert_eq!(value, json!("B"));
        assert_eq!(version, 2);
    }

    #[test]
    fn cas_against_unwritten_state_uses_version_zero() {
        let (states, _dir) = states();
        let err = states.set_state("fresh", json!(1), Some(3)).unwrap_err();
        assert!(matches!(err, ShmError::VersionConflict { actual: 0, .. }));

        let v = states.set_state("fresh", json!(1), Some(0)).unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn callbacks_fire_with_new_value_and_version() {
        let (states, _dir) = states();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in = Arc::clone(&seen);
        states.register_change_callback(
            "pnl",
            Box::new(move |value, version| {
                assert_eq!(value["usd"], 12.5);
                seen_in.store(version, Ordering::SeqCst);
            }),
        );

        states.set_state("pnl", json!({"usd": 12.5}), None).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_poison_writes() {
        let (states, _dir) = states();
        states.register_change_callback("risky", Box::new(|_, _| panic!("observer bug")));

        let v = states.set_state("risky", json!(true), None).unwrap();
        assert_eq!(v, 1);
        // Writer unaffected; a second write still succeeds.
        assert_eq!(states.set_state("risky", json!(false), None).unwrap(), 2);
    }
}
