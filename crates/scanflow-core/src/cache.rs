//! Result cache for idempotent node execution
//!
//! Entries are keyed by a blake3 fingerprint of the node name, its parameters
//! and its input values. The cache always lives in memory and can also be
//! persisted as one JSON file per entry so a later run reuses completed work.

use scanflow_common::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Content-addressed key for one node execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Node name
    pub node: String,

    /// Hash of task parameters
    pub params_hash: String,

    /// Hash of the input values
    pub input_hash: String,
}

impl CacheKey {
    /// Fingerprint a node execution. `inputs` is ordered by slot name so the
    /// hash does not depend on insertion order.
    pub fn new(node: &str, params: &Value, inputs: &BTreeMap<String, Value>) -> Self {
        let params_hash = blake3::hash(params.to_string().as_bytes());

        let mut hasher = blake3::Hasher::new();
        for (slot, value) in inputs {
            hasher.update(slot.as_bytes());
            hasher.update(&[0]);
            hasher.update(value.to_string().as_bytes());
            hasher.update(&[0]);
        }

        Self {
            node: node.to_string(),
            params_hash: params_hash.to_hex().to_string(),
            input_hash: hasher.finalize().to_hex().to_string(),
        }
    }

    /// File name for on-disk storage
    pub fn to_key_string(&self) -> String {
        let node: String = self
            .node
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("{}_{}_{}", node, &self.params_hash[..16], self.input_hash)
    }
}

/// One persisted entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResult {
    key: CacheKey,
    created_at: SystemTime,
    value: Value,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
}

/// Thread-safe result cache shared by every scheduler worker
#[derive(Clone, Default)]
pub struct ResultCache {
    entries: Arc<Mutex<HashMap<CacheKey, Value>>>,
    dir: Option<PathBuf>,
    hits: Arc<AtomicUsize>,
    misses: Arc<AtomicUsize>,
}

impl ResultCache {
    /// In-memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist entries under `dir` (created if missing)
    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: Some(dir),
            ..Self::default()
        })
    }

    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Value>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a prior result, falling back to disk
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        if let Some(value) = self.lock().get(key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(value) = self.read_entry(key) {
            self.lock().insert(key.clone(), value.clone());
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a result. Disk write failures are logged, not fatal.
    pub fn put(&self, key: &CacheKey, value: &Value) {
        self.lock().insert(key.clone(), value.clone());
        if let Err(e) = self.write_entry(key, value) {
            warn!("Failed to persist cache entry for {}: {}", key.node, e);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drop in-memory entries (persisted entries stay on disk)
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn entry_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", key.to_key_string())))
    }

    fn read_entry(&self, key: &CacheKey) -> Option<Value> {
        let path = self.entry_path(key)?;
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CachedResult>(&contents) {
            Ok(entry) if entry.key == *key => {
                debug!("Loaded cache entry {}", path.display());
                Some(entry.value)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Ignoring unreadable cache entry {}: {}", path.display(), e);
                None
            }
        }
    }

    fn write_entry(&self, key: &CacheKey, value: &Value) -> std::io::Result<()> {
        let Some(path) = self.entry_path(key) else {
            return Ok(());
        };
        let entry = CachedResult {
            key: key.clone(),
            created_at: SystemTime::now(),
            value: value.clone(),
        };
        let json = serde_json::to_vec_pretty(&entry)?;
        // Write then rename so readers never see a partial entry
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)
    }
}
