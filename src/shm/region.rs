//! Memory-mapped region registry and data plane
//!
//! Each region is a named, fixed-size file mapped on demand, paired with
//! a lock sentinel for cross-process exclusion. Region metadata lives in
//! a single `registry.json` guarded by `registry.lock`; every registry
//! mutation is serialized under the manager's own mutex so two creations
//! of the same name race safely (the loser sees `RegionExists`).
//!
//! Logical cell layout at any offset: `u32_be(length) || payload`, with
//! the payload encoded as JSON. A zero length header means the cell was
//! never written. Payloads are validated against the region's declared
//! schema (shallow, top-level only) before they touch the mapping.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use memmap2::MmapMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ShmConfig;
use crate::error::ShmError;
use crate::shm::lock::{FileLock, LockKind};
use crate::shm::schema::{self, Schema};

/// Bytes of big-endian length prefix ahead of each payload.
pub const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionType {
    Metrics,
    State,
    Cache,
    Custom,
}

/// Registry entry for one region. Stats fields mutate on every access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRegionInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: usize,
    pub region_type: RegionType,
    pub schema: Option<Schema>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub lock_path: PathBuf,
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RegionStats {
    pub regions: usize,
    pub total_bytes: u64,
}

/// Scoped, locked view of a mapped region. Dropping unmaps first, then
/// releases the lock file, on every exit path.
#[derive(Debug)]
pub struct MappedRegion {
    mmap: MmapMut,
    info: MemoryRegionInfo,
    _lock: FileLock,
}

impl MappedRegion {
    pub fn info(&self) -> &MemoryRegionInfo {
        &self.info
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    pub fn flush(&self) -> Result<(), ShmError> {
        self.mmap.flush().map_err(ShmError::from)
    }

    /// Decode the cell at `offset`. `Ok(None)` means never written (zero
    /// length header); malformed headers or payloads are `CorruptData`.
    fn read_cell(&self, offset: usize) -> Result<Option<Value>, ShmError> {
        if offset + HEADER_LEN > self.info.size {
            return Err(ShmError::CorruptData(format!(
                "offset {offset} leaves no room for a header in {} bytes",
                self.info.size
            )));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.mmap[offset..offset + HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            return Ok(None);
        }
        if offset + HEADER_LEN + len > self.info.size {
            return Err(ShmError::CorruptData(format!(
                "length header {len} exceeds region capacity {}",
                self.info.size
            )));
        }

        let payload = &self.mmap[offset + HEADER_LEN..offset + HEADER_LEN + len];
        serde_json::from_slice(payload)
            .map(Some)
            .map_err(|e| ShmError::CorruptData(format!("undeserializable payload: {e}")))
    }

    /// Write a length-prefixed payload at `offset`. Capacity must have
    /// been checked by the caller; this only asserts the invariant.
    fn write_cell(&mut self, offset: usize, payload: &[u8]) -> Result<usize, ShmError> {
        let end = offset + HEADER_LEN + payload.len();
        if end > self.info.size {
            return Err(ShmError::PayloadTooLarge {
                payload: payload.len(),
                capacity: self.info.size.saturating_sub(HEADER_LEN + offset),
            });
        }
        let len = payload.len() as u32;
        self.mmap[offset..offset + HEADER_LEN].copy_from_slice(&len.to_be_bytes());
        self.mmap[offset + HEADER_LEN..end].copy_from_slice(payload);
        self.flush()?;
        Ok(HEADER_LEN + payload.len())
    }
}

/// Registry of named, fixed-size memory-mapped regions.
pub struct SharedMemoryManager {
    config: ShmConfig,
    root: PathBuf,
    registry_path: PathBuf,
    registry_lock_path: PathBuf,
    /// Serializes registry read-modify-persist cycles in this process.
    registry_mutex: Mutex<()>,
    /// Serializes `update_data` read-modify-write cycles in this process;
    /// the region's exclusive file lock covers other processes.
    update_mutex: Mutex<()>,
}

impl SharedMemoryManager {
    pub fn new(config: ShmConfig) -> Result<Self, ShmError> {
        let root = PathBuf::from(&config.root_dir);
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            registry_path: root.join("registry.json"),
            registry_lock_path: root.join("registry.lock"),
            root,
            registry_mutex: Mutex::new(()),
            update_mutex: Mutex::new(()),
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ShmConfig {
        &self.config
    }

    /// Create a region of `size` bytes plus its lock sentinel, and
    /// register it. Fails with `RegionExists` on a duplicate name.
    pub fn create_region(
        &self,
        name: &str,
        size: usize,
        region_type: RegionType,
        schema: Option<Schema>,
    ) -> Result<MemoryRegionInfo, ShmError> {
        validate_name(name)?;
        if size <= HEADER_LEN {
            return Err(ShmError::PayloadTooLarge {
                payload: 0,
                capacity: 0,
            });
        }

        let _guard = self.registry_mutex.lock();
        let mut registry = self.load_registry()?;
        if registry.contains_key(name) {
            return Err(ShmError::RegionExists(name.to_string()));
        }

        let path = self.root.join(format!("{name}.bin"));
        let lock_path = self.root.join(format!("{name}.lock"));

        let file = std::fs::File::create(&path)?;
        file.set_len(size as u64)?;
        drop(file);
        // Touch the sentinel so openers never race its creation.
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let now = Utc::now();
        let info = MemoryRegionInfo {
            name: name.to_string(),
            path: path.clone(),
            size,
            region_type,
            schema,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            lock_path: lock_path.clone(),
        };
        registry.insert(name.to_string(), info.clone());

        if let Err(e) = self.persist_registry(&registry) {
            // Roll the files back so registry and filesystem stay in step.
            let _ = std::fs::remove_file(&path);
            let _ = std::fs::remove_file(&lock_path);
            return Err(e);
        }

        tracing::debug!(region = name, size, ?region_type, "created shared region");
        Ok(info)
    }

    pub fn get_region_info(&self, name: &str) -> Result<MemoryRegionInfo, ShmError> {
        let _guard = self.registry_mutex.lock();
        let registry = self.load_registry()?;
        registry
            .get(name)
            .cloned()
            .ok_or_else(|| ShmError::RegionNotFound(name.to_string()))
    }

    pub fn list_regions(
        &self,
        region_type: Option<RegionType>,
    ) -> Result<Vec<MemoryRegionInfo>, ShmError> {
        let _guard = self.registry_mutex.lock();
        let registry = self.load_registry()?;
        let mut regions: Vec<_> = registry
            .into_values()
            .filter(|r| region_type.map_or(true, |t| r.region_type == t))
            .collect();
        regions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(regions)
    }

    /// Remove a region's registry entry and files. Returns `false` for
    /// unknown names. The registry entry goes first: if persisting fails
    /// nothing has been unlinked, and once it succeeds any leftover file
    /// is a harmless orphan that a later `create_region` of the same
    /// name truncates.
    pub fn delete_region(&self, name: &str) -> Result<bool, ShmError> {
        let _guard = self.registry_mutex.lock();
        let mut registry = self.load_registry()?;
        let Some(info) = registry.remove(name) else {
            return Ok(false);
        };
        self.persist_registry(&registry)?;

        for path in [&info.path, &info.lock_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    region = name,
                    path = %path.display(),
                    error = %e,
                    "failed to remove region file"
                ),
            }
        }

        tracing::debug!(region = name, "deleted shared region");
        Ok(true)
    }

    /// Acquire the region's lock and map it. `LockKind::Exclusive` for
    /// writers, `LockKind::Shared` for readers; both bounded-wait.
    pub fn open_region(&self, name: &str, kind: LockKind) -> Result<MappedRegion, ShmError> {
        let info = self.get_region_info(name)?;
        let lock = FileLock::acquire(&info.lock_path, kind, self.config.lock_timeout())?;

        let file = OpenOptions::new().read(true).write(true).open(&info.path)?;
        // Safety: the file is private to this store, fixed-size, and
        // concurrent mutation is excluded by the advisory lock protocol.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(MappedRegion {
            mmap,
            info,
            _lock: lock,
        })
    }

    /// Serialize `value`, length-prefix it, and write it at `offset`
    /// under an exclusive lock. Oversized payloads are rejected before
    /// anything is written.
    pub fn write_data(
        &self,
        name: &str,
        value: &Value,
        offset: usize,
        validate: bool,
    ) -> Result<usize, ShmError> {
        let info = self.get_region_info(name)?;
        let payload = serde_json::to_vec(value)?;
        if offset + HEADER_LEN + payload.len() > info.size {
            return Err(ShmError::PayloadTooLarge {
                payload: payload.len(),
                capacity: info.size.saturating_sub(HEADER_LEN + offset),
            });
        }
        if validate {
            if let Some(schema) = &info.schema {
                schema::validate(schema, value)?;
            }
        }

        let mut region = self.open_region(name, LockKind::Exclusive)?;
        let written = region.write_cell(offset, &payload)?;
        drop(region);
        self.touch(name);
        Ok(written)
    }

    /// Read and decode the cell at `offset` under a shared lock. A cell
    /// that was never written is `CorruptData`, never garbage.
    pub fn read_data(&self, name: &str, offset: usize) -> Result<Value, ShmError> {
        let region = self.open_region(name, LockKind::Shared)?;
        let value = region.read_cell(offset)?.ok_or_else(|| {
            ShmError::CorruptData(format!("region '{name}' was never written"))
        })?;
        drop(region);
        self.touch(name);
        Ok(value)
    }

    /// Read-modify-write as one atomic cycle: the region's exclusive
    /// lock is held across the whole update, and in-process callers are
    /// additionally serialized by the manager's update mutex, so
    /// concurrent updates never lose increments.
    pub fn update_data<F>(
        &self,
        name: &str,
        update_fn: F,
        offset: usize,
        validate: bool,
    ) -> Result<usize, ShmError>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        self.update_data_with(name, |current| Ok(update_fn(current)), offset, validate)
    }

    /// Like [`update_data`](Self::update_data) but the closure may abort
    /// the cycle with an error (used for CAS semantics upstream).
    pub fn update_data_with<F>(
        &self,
        name: &str,
        update_fn: F,
        offset: usize,
        validate: bool,
    ) -> Result<usize, ShmError>
    where
        F: FnOnce(Option<Value>) -> Result<Value, ShmError>,
    {
        let _cycle = self.update_mutex.lock();
        let mut region = self.open_region(name, LockKind::Exclusive)?;
        let current = region.read_cell(offset)?;
        let next = update_fn(current)?;

        let payload = serde_json::to_vec(&next)?;
        if offset + HEADER_LEN + payload.len() > region.info.size {
            return Err(ShmError::PayloadTooLarge {
                payload: payload.len(),
                capacity: region.info.size.saturating_sub(HEADER_LEN + offset),
            });
        }
        if validate {
            if let Some(schema) = &region.info.schema {
                schema::validate(schema, &next)?;
            }
        }

        let written = region.write_cell(offset, &payload)?;
        drop(region);
        self.touch(name);
        Ok(written)
    }

    pub fn region_stats(&self) -> Result<RegionStats, ShmError> {
        let regions = self.list_regions(None)?;
        Ok(RegionStats {
            regions: regions.len(),
            total_bytes: regions.iter().map(|r| r.size as u64).sum(),
        })
    }

    /// Best-effort access-stats bump; failures are logged, never raised.
    fn touch(&self, name: &str) {
        let _guard = self.registry_mutex.lock();
        let result = self.load_registry().and_then(|mut registry| {
            if let Some(info) = registry.get_mut(name) {
                info.last_accessed = Utc::now();
                info.access_count += 1;
                self.persist_registry(&registry)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            tracing::debug!(region = name, error = %e, "failed to update access stats");
        }
    }

    /// Load the registry under a shared file lock. Caller holds the
    /// in-process registry mutex.
    fn load_registry(&self) -> Result<HashMap<String, MemoryRegionInfo>, ShmError> {
        let _lock = FileLock::acquire(
            &self.registry_lock_path,
            LockKind::Shared,
            self.config.lock_timeout(),
        )?;
        match std::fs::read(&self.registry_path) {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ShmError::CorruptData(format!("registry unreadable: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(ShmError::Io(e)),
        }
    }

    /// Persist the registry under an exclusive file lock, via tmp-file
    /// rename so readers never observe a half-written registry.
    fn persist_registry(
        &self,
        registry: &HashMap<String, MemoryRegionInfo>,
    ) -> Result<(), ShmError> {
        let _lock = FileLock::acquire(
            &self.registry_lock_path,
            LockKind::Exclusive,
            self.config.lock_timeout(),
        )?;
        let tmp = self.registry_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(registry)?)?;
        std::fs::rename(&tmp, &self.registry_path)?;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), ShmError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ShmError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid region name '{name}'"),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::schema::FieldType;
    use serde_json::json;
    use std::sync::Arc;

    fn manager() -> (SharedMemoryManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = ShmConfig {
            root_dir: dir.path().to_string_lossy().to_string(),
            lock_timeout_ms: 2000,
            ..ShmConfig::default()
        };
        (SharedMemoryManager::new(config).unwrap(), dir)
    }

    #[test]
    fn create_write_read_roundtrip() {
        let (shm, _dir) = manager();
        shm.create_region("m", 1024, RegionType::Metrics, None).unwrap();

        shm.write_data("m", &json!({"a": 1}), 0, true).unwrap();
        assert_eq!(shm.read_data("m", 0).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn nested_values_roundtrip() {
        let (shm, _dir) = manager();
        shm.create_region("nested", 4096, RegionType::Cache, None).unwrap();

        let v = json!({
            "routes": [{"legs": ["uni", "sushi"], "profit_bps": 12.5}],
            "block": 19_000_000,
            "flags": {"flash_loan": true, "reverted": null},
        });
        shm.write_data("nested", &v, 0, true).unwrap();
        assert_eq!(shm.read_data("nested", 0).unwrap(), v);
    }

    #[test]
    fn duplicate_create_rejected() {
        let (shm, _dir) = manager();
        shm.create_region("dup", 256, RegionType::State, None).unwrap();
        let err = shm
            .create_region("dup", 256, RegionType::State, None)
            .unwrap_err();
        assert!(matches!(err, ShmError::RegionExists(_)));
    }

    #[test]
    fn oversized_payload_rejected_without_write() {
        let (shm, _dir) = manager();
        shm.create_region("tiny", 16, RegionType::Cache, None).unwrap();
        shm.write_data("tiny", &json!(1), 0, true).unwrap();

        let big = json!("x".repeat(64));
        let err = shm.write_data("tiny", &big, 0, true).unwrap_err();
        assert!(matches!(err, ShmError::PayloadTooLarge { .. }));
        // Previous contents survive untouched.
        assert_eq!(shm.read_data("tiny", 0).unwrap(), json!(1));
    }

    #[test]
    fn never_written_region_is_corrupt_not_garbage() {
        let (shm, _dir) = manager();
        shm.create_region("blank", 128, RegionType::Cache, None).unwrap();
        let err = shm.read_data("blank", 0).unwrap_err();
        assert!(matches!(err, ShmError::CorruptData(_)));
    }

    #[test]
    fn malformed_header_is_corrupt() {
        let (shm, _dir) = manager();
        shm.create_region("broken", 64, RegionType::Cache, None).unwrap();

        let mut region = shm.open_region("broken", LockKind::Exclusive).unwrap();
        // Length header claims more bytes than the region holds.
        region.as_mut_slice()[..4].copy_from_slice(&1_000_000u32.to_be_bytes());
        region.flush().unwrap();
        drop(region);

        let err = shm.read_data("broken", 0).unwrap_err();
        assert!(matches!(err, ShmError::CorruptData(_)));
    }

    #[test]
    fn schema_rejects_bad_write_and_leaves_region() {
        let (shm, _dir) = manager();
        let schema: Schema = [("spread".to_string(), FieldType::Number)].into();
        shm.create_region("quotes", 512, RegionType::Metrics, Some(schema))
            .unwrap();

        shm.write_data("quotes", &json!({"spread": 1.5}), 0, true).unwrap();
        let err = shm
            .write_data("quotes", &json!({"spread": "wide"}), 0, true)
            .unwrap_err();
        assert!(matches!(err, ShmError::SchemaValidation(_)));
        assert_eq!(shm.read_data("quotes", 0).unwrap(), json!({"spread": 1.5}));
    }

    #[test]
    fn delete_removes_files_and_entry() {
        let (shm, _dir) = manager();
        let info = shm
            .create_region("gone", 128, RegionType::Cache, None)
            .unwrap();

        assert!(shm.delete_region("gone").unwrap());
        assert!(!info.path.exists());
        assert!(!info.lock_path.exists());
        assert!(matches!(
            shm.get_region_info("gone").unwrap_err(),
            ShmError::RegionNotFound(_)
        ));
        // Idempotent: a second delete reports nothing to do.
        assert!(!shm.delete_region("gone").unwrap());
    }

    #[test]
    fn list_regions_filters_by_type() {
        let (shm, _dir) = manager();
        shm.create_region("m1", 128, RegionType::Metrics, None).unwrap();
        shm.create_region("s1", 128, RegionType::State, None).unwrap();

        let metrics = shm.list_regions(Some(RegionType::Metrics)).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "m1");
        assert_eq!(shm.list_regions(None).unwrap().len(), 2);
    }

    #[test]
    fn concurrent_updates_lose_nothing() {
        let (shm, _dir) = manager();
        let shm = Arc::new(shm);
        shm.create_region("counter", 256, RegionType::State, None).unwrap();
        shm.write_data("counter", &json!({"count": 0}), 0, true).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let shm = Arc::clone(&shm);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        shm.update_data(
                            "counter",
                            |current| {
                                let n = current
                                    .as_ref()
                                    .and_then(|v| v["count"].as_i64())
                                    .unwrap_or(0);
                                json!({"count": n + 1})
                            },
                            0,
                            true,
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(shm.read_data("counter", 0).unwrap(), json!({"count": 200}));
    }

    #[test]
    fn separate_offsets_hold_separate_cells() {
        let (shm, _dir) = manager();
        shm.create_region("cells", 256, RegionType::Cache, None).unwrap();

        shm.write_data("cells", &json!("first"), 0, true).unwrap();
        shm.write_data("cells", &json!("second"), 64, true).unwrap();
        assert_eq!(shm.read_data("cells", 0).unwrap(), json!("first"));
        assert_eq!(shm.read_data("cells", 64).unwrap(), json!("second"));
    }

    #[test]
    fn invalid_names_rejected() {
        let (shm, _dir) = manager();
        assert!(shm
            .create_region("../escape", 128, RegionType::Cache, None)
            .is_err());
        assert!(shm.create_region("", 128, RegionType::Cache, None).is_err());
    }
}
