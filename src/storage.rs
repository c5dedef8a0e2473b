//! Durable record sets backed by atomically replaced JSON files
//!
//! Each record set (balances, prediction events, player profiles) is one file. A write
//! serializes the whole set to a temp file in the same directory and renames
//! it over the target, so a crash mid-write leaves the previous file intact.

use crate::errors::{StorageError, WagerResult};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whole-set load/save for one kind of record
pub trait RecordStore<K, V>: Send + Sync {
    fn load(&self) -> WagerResult<BTreeMap<K, V>>;

    /// Replace the stored set. Either the new set is fully durable or the
    /// previous one is left untouched.
    fn save(&self, records: &BTreeMap<K, V>) -> WagerResult<()>;
}

/// Pretty-printed JSON file with replace-on-success writes
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomically(&self, bytes: &[u8]) -> Result<(), std::io::Error> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl<K, V> RecordStore<K, V> for JsonFileStore
where
    K: Serialize + DeserializeOwned + Ord,
    V: Serialize + DeserializeOwned,
{
    fn load(&self) -> WagerResult<BTreeMap<K, V>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(StorageError::ReadFailed(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                ))
                .into())
            }
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&content).map_err(|e| {
            StorageError::CorruptedData(format!("Failed to decode {}: {}", self.path.display(), e))
                .into()
        })
    }

    fn save(&self, records: &BTreeMap<K, V>) -> WagerResult<()> {
        let bytes = serde_json::to_vec_pretty(records).map_err(|e| {
            StorageError::WriteFailed(format!("Failed to encode {}: {}", self.path.display(), e))
        })?;

        self.write_atomically(&bytes).map_err(|e| {
            StorageError::WriteFailed(format!("Failed to write {}: {}", self.path.display(), e))
                .into()
        })
    }
}

/// Volatile store for tests and `storage.in_memory` deployments
pub struct MemoryStore<K, V> {
    records: Mutex<BTreeMap<K, V>>,
}

impl<K, V> MemoryStore<K, V> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<K, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RecordStore<K, V> for MemoryStore<K, V>
where
    K: Clone + Ord + Send,
    V: Clone + Send,
{
    fn load(&self) -> WagerResult<BTreeMap<K, V>> {
        Ok(lock(&self.records).clone())
    }

    fn save(&self, records: &BTreeMap<K, V>) -> WagerResult<()> {
        *lock(&self.records) = records.clone();
        Ok(())
    }
}

/// Committed image of one record set
///
/// Writes go through the store before the image changes, so the image always
/// equals the last durable state. Callers that need per-key exclusion hold
/// their own key lock around the call; this type only serializes file writes.
pub struct SnapshotTable<K, V> {
    committed: Mutex<BTreeMap<K, V>>,
    store: Arc<dyn RecordStore<K, V>>,
}

impl<K, V> SnapshotTable<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    pub fn open(store: Arc<dyn RecordStore<K, V>>) -> WagerResult<Self> {
        let committed = store.load()?;
        Ok(Self {
            committed: Mutex::new(committed),
            store,
        })
    }

    /// Start from an empty image without reading the store.
    pub fn empty(store: Arc<dyn RecordStore<K, V>>) -> Self {
        Self {
            committed: Mutex::new(BTreeMap::new()),
            store,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        lock(&self.committed).get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<K, V> {
        lock(&self.committed).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.committed).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.committed).is_empty()
    }

    pub fn upsert(&self, key: K, value: V) -> WagerResult<()> {
        let mut committed = lock(&self.committed);
        let previous = committed.insert(key.clone(), value);
        if let Err(e) = self.store.save(&committed) {
            match previous {
                Some(old) => committed.insert(key, old),
                None => committed.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Replace the value for `key` with `f(current)` as one committed write.
    pub fn modify<F>(&self, key: K, f: F) -> WagerResult<V>
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let mut committed = lock(&self.committed);
        let next = f(committed.get(&key));
        let previous = committed.insert(key.clone(), next.clone());
        if let Err(e) = self.store.save(&committed) {
            match previous {
                Some(old) => committed.insert(key, old),
                None => committed.remove(&key),
            };
            return Err(e);
        }
        Ok(next)
    }

    pub fn remove(&self, key: &K) -> WagerResult<Option<V>> {
        let mut committed = lock(&self.committed);
        let Some(previous) = committed.remove(key) else {
            return Ok(None);
        };
        if let Err(e) = self.store.save(&committed) {
            committed.insert(key.clone(), previous);
            return Err(e);
        }
        Ok(Some(previous))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::test_framework::FailingStore;

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("points.json"));
        let records: BTreeMap<u64, u64> = store.load().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("points.json"));
        let mut records = BTreeMap::new();
        records.insert(7u64, 120u64);
        records.insert(9u64, 0u64);
        store.save(&records).unwrap();

        let loaded: BTreeMap<u64, u64> = store.load().unwrap();
        assert_eq!(loaded, records);
        // Only the target remains; the temp file was renamed over it.
        let entries = std::fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_corrupted_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.json");
        std::fs::write(&path, "{\"7\": 12").unwrap();
        let store = JsonFileStore::new(&path);
        let result: WagerResult<BTreeMap<u64, u64>> = store.load();
        assert!(result.is_err());
    }

    #[test]
    fn test_table_rolls_back_failed_writes() {
        let store: Arc<FailingStore<u64, u64>> = Arc::new(FailingStore::new());
        let table = SnapshotTable::open(store.clone() as Arc<dyn RecordStore<u64, u64>>).unwrap();
        table.upsert(1, 10).unwrap();

        store.fail_writes(true);
        assert!(table.upsert(1, 99).is_err());
        assert!(table.upsert(2, 5).is_err());
        assert!(table.remove(&1).is_err());
        assert_eq!(table.get(&1), Some(10));
        assert_eq!(table.get(&2), None);

        assert!(table.modify(1, |v| v.map_or(0, |n| n + 1)).is_err());
        assert_eq!(table.get(&1), Some(10));

        store.fail_writes(false);
        assert_eq!(table.modify(1, |v| v.map_or(0, |n| n + 1)).unwrap(), 11);
        assert_eq!(table.remove(&1).unwrap(), Some(11));
        assert!(table.is_empty());
    }
}
