//! Persistent per-target fingerprint records.
//!
//! One record per target identity. Workers own disjoint keys, so the only
//! requirement on a store is an atomic read and write of a single key.

use super::error::CacheError;
use super::engine::hash_bytes;
use crate::deps::DependencyRecord;
use crate::target::TargetId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Current schema version. Bump when the record format changes.
pub const RECORD_VERSION: u32 = 1;

/// What a target looked like after its last successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub version: u32,
    pub target: TargetId,
    /// Hash over everything that influences generation.
    pub pre_gen: String,
    /// Hash over everything that influences compilation, generated files
    /// included.
    pub post_gen: Option<String>,
    /// Consolidated dependencies recorded by the last build.
    pub dependencies: Vec<DependencyRecord>,
    /// Files the last generation produced. All must still exist for a hit.
    pub generated: Vec<PathBuf>,
}

/// Storage for fingerprint records.
///
/// `load` returns `Ok(None)` for a target that was never recorded; every
/// other problem is an error, which callers treat as a miss.
pub trait FingerprintStore: Send + Sync {
    fn load(&self, id: &TargetId) -> Result<Option<FingerprintRecord>, CacheError>;
    fn save(&self, record: &FingerprintRecord) -> Result<(), CacheError>;
    fn invalidate(&self, id: &TargetId) -> Result<(), CacheError>;
}

fn check_record(
    record: FingerprintRecord,
    id: &TargetId,
    path: &Path,
) -> Result<FingerprintRecord, CacheError> {
    if record.version != RECORD_VERSION {
        return Err(CacheError::VersionMismatch {
            path: path.to_path_buf(),
            expected: RECORD_VERSION,
            found: record.version,
        });
    }
    if record.target != *id {
        return Err(CacheError::IdentityMismatch {
            path: path.to_path_buf(),
            expected: id.to_string(),
            found: record.target.to_string(),
        });
    }
    Ok(record)
}

/// JSON files under a cache directory, one per target.
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Slug plus a short identity hash, so `a/b` and `a_b` never collide.
    pub fn record_path(&self, id: &TargetId) -> PathBuf {
        let digest = hash_bytes(id.to_string().as_bytes());
        self.dir.join(format!("{}-{}.json", id.slug(), &digest[..12]))
    }

    /// Every record file in the store, parsed or not.
    pub fn entries(
        &self,
    ) -> Result<Vec<(PathBuf, Result<FingerprintRecord, CacheError>)>, CacheError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let read = fs::read_dir(&self.dir).map_err(|e| CacheError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        let mut entries = Vec::new();
        for entry in read.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let parsed = read_record(&path);
            entries.push((path, parsed));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

fn read_record(path: &Path) -> Result<FingerprintRecord, CacheError> {
    let data = fs::read_to_string(path).map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&data).map_err(|e| CacheError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

impl FingerprintStore for DiskStore {
    fn load(&self, id: &TargetId) -> Result<Option<FingerprintRecord>, CacheError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let record = read_record(&path)?;
        check_record(record, id, &path).map(Some)
    }

    /// Write to a temp file next to the record, then rename over it.
    fn save(&self, record: &FingerprintRecord) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(|e| CacheError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        let path = self.record_path(&record.target);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        fs::write(&tmp, json).map_err(|e| CacheError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| CacheError::Io { path, source: e })
    }

    fn invalidate(&self, id: &TargetId) -> Result<(), CacheError> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io { path, source: e }),
        }
    }
}

/// In-memory store. Holds serialized records so tests can corrupt them.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<TargetId, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record with raw text.
    pub fn put_raw(&self, id: &TargetId, raw: impl Into<String>) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(id.clone(), raw.into());
        }
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.records
            .lock()
            .map(|r| r.contains_key(id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FingerprintStore for MemoryStore {
    fn load(&self, id: &TargetId) -> Result<Option<FingerprintRecord>, CacheError> {
        let records = self.records.lock().map_err(|_| CacheError::Poisoned)?;
        let Some(raw) = records.get(id) else {
            return Ok(None);
        };
        let path = PathBuf::from(format!("memory:{}", id));
        let record: FingerprintRecord =
            serde_json::from_str(raw).map_err(|e| CacheError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        check_record(record, id, &path).map(Some)
    }

    fn save(&self, record: &FingerprintRecord) -> Result<(), CacheError> {
        let raw = serde_json::to_string(record).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        let mut records = self.records.lock().map_err(|_| CacheError::Poisoned)?;
        records.insert(record.target.clone(), raw);
        Ok(())
    }

    fn invalidate(&self, id: &TargetId) -> Result<(), CacheError> {
        let mut records = self.records.lock().map_err(|_| CacheError::Poisoned)?;
        records.remove(id);
        Ok(())
    }
}
