//! Key-value store backing the folder index cache.
//!
//! `MemoryKvStore` keeps everything in a process-local BTreeMap,
//! `FileKvStore` persists the map as a bincode file so several processes
//! can share one index (coordinated by the index lock).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::types::WatoError;

/// Raw key bytes.
pub type Key = Vec<u8>;
/// Raw value bytes.
pub type Value = Vec<u8>;
/// One stored entry.
pub type KvPair = (Key, Value);

type Map = BTreeMap<Key, Value>;

/// Byte-keyed store holding the folder index records.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, WatoError>;

    fn put(&self, key: Key, value: Value) -> Result<(), WatoError>;

    /// Removing an absent key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), WatoError>;

    /// Entries whose key starts with `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, WatoError>;

    /// Applies all operations or none of them.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), WatoError>;
}

/// One step of [`KvStore::write_batch`].
pub enum BatchOp {
    Put { key: Key, value: Value },
    Delete { key: Key },
    /// Clears a whole subtree of folder records.
    DeletePrefix { prefix: Key },
}

fn apply_batch(data: &mut Map, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key, value);
            }
            BatchOp::Delete { key } => {
                data.remove(&key);
            }
            BatchOp::DeletePrefix { prefix } => data.retain(|k, _| !k.starts_with(&prefix)),
        }
    }
}

fn scan(data: &Map, prefix: &[u8]) -> Vec<KvPair> {
    data.range::<[u8], _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn poisoned(e: impl std::fmt::Display) -> WatoError {
    WatoError::CacheUnavailable(e.to_string())
}

/// Process-local store; clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<RwLock<Map>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, WatoError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), WatoError> {
        self.write_batch(vec![BatchOp::Put { key, value }])
    }

    fn delete(&self, key: &[u8]) -> Result<(), WatoError> {
        self.write_batch(vec![BatchOp::Delete { key: key.to_vec() }])
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, WatoError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(scan(&entries, prefix))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), WatoError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        apply_batch(&mut entries, ops);
        Ok(())
    }
}

/// KV store persisted to a single bincode file.
///
/// Every operation re-reads the file so that writes of other processes are
/// observed; writes go to a temporary file that is renamed into place.
pub struct FileKvStore {
    path: PathBuf,
    guard: RwLock<()>,
}

impl FileKvStore {
    /// Opens (or lazily creates) a store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: RwLock::new(()),
        }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Map, WatoError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| WatoError::CacheUnavailable(format!("corrupt store: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(WatoError::CacheUnavailable(e.to_string())),
        }
    }

    fn store(&self, data: &Map) -> Result<(), WatoError> {
        let bytes = bincode::serialize(data).map_err(|e| WatoError::Serialization(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut Map)) -> Result<(), WatoError> {
        let _guard = self.guard.write().map_err(poisoned)?;
        let mut data = self.load()?;
        f(&mut data);
        self.store(&data)
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, WatoError> {
        let _guard = self.guard.read().map_err(poisoned)?;
        Ok(self.load()?.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), WatoError> {
        self.modify(|data| {
            data.insert(key, value);
        })
    }

    fn delete(&self, key: &[u8]) -> Result<(), WatoError> {
        self.modify(|data| {
            data.remove(key);
        })
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, WatoError> {
        let _guard = self.guard.read().map_err(poisoned)?;
        Ok(scan(&self.load()?, prefix))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), WatoError> {
        self.modify(|data| apply_batch(data, ops))
    }
}
