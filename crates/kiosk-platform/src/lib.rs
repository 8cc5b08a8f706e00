//! Device-local storage backends for the kiosk position cache.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use kiosk_core::{CacheStorage, CacheStorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const DEFAULT_FILE_CAPACITY_BYTES: u64 = 512 * 1_024;

/// Process-local storage. Contents vanish with the process.
#[derive(Clone, Default)]
pub struct InMemoryCacheStorage {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl CacheStorage for InMemoryCacheStorage {
    fn read(&self, key: &str) -> Result<Option<String>, CacheStorageError> {
        let data = self
            .data
            .read()
            .map_err(|_| CacheStorageError::Backend("poisoned lock".to_owned()))?;
        Ok(data.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), CacheStorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CacheStorageError::Backend("poisoned lock".to_owned()))?;
        data.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheStorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CacheStorageError::Backend("poisoned lock".to_owned()))?;
        data.remove(key);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    entries: HashMap<String, String>,
}

impl StoreFile {
    fn size_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|(key, value)| (key.len() + value.len()) as u64)
            .sum()
    }
}

/// Single JSON file holding every key, rewritten on each change.
///
/// The capacity bound plays the role of a browser storage quota: a write
/// that would exceed it fails with `QuotaExceeded`.
pub struct FileCacheStorage {
    path: PathBuf,
    capacity_bytes: u64,
    state: Mutex<StoreFile>,
}

impl FileCacheStorage {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_capacity(path, DEFAULT_FILE_CAPACITY_BYTES)
    }

    pub fn with_capacity(path: impl Into<PathBuf>, capacity_bytes: u64) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let state = load_store(&path).unwrap_or_else(|| {
            debug!(path = %path.display(), "starting with empty cache store");
            StoreFile::default()
        });

        Ok(Self {
            path,
            capacity_bytes: capacity_bytes.max(1),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &StoreFile) -> Result<(), CacheStorageError> {
        let encoded = serde_json::to_vec_pretty(state)
            .map_err(|err| CacheStorageError::Backend(err.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, encoded)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|err| CacheStorageError::Unavailable(err.to_string()))
    }
}

impl CacheStorage for FileCacheStorage {
    fn read(&self, key: &str) -> Result<Option<String>, CacheStorageError> {
        let state = self
            .state
            .lock()
            .map_err(|_| CacheStorageError::Backend("poisoned lock".to_owned()))?;
        Ok(state.entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), CacheStorageError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CacheStorageError::Backend("poisoned lock".to_owned()))?;

        let previous = state.entries.insert(key.to_owned(), value.to_owned());
        if state.size_bytes() > self.capacity_bytes {
            match previous {
                Some(previous) => state.entries.insert(key.to_owned(), previous),
                None => state.entries.remove(key),
            };
            return Err(CacheStorageError::QuotaExceeded);
        }
        self.persist(&state)
    }

    fn remove(&self, key: &str) -> Result<(), CacheStorageError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CacheStorageError::Backend("poisoned lock".to_owned()))?;
        if state.entries.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&state)
    }
}

/// Prefixes every key with a namespace so several consumers can share one
/// backend.
#[derive(Clone)]
pub struct ScopedCacheStorage<S: CacheStorage> {
    inner: S,
    namespace: String,
}

impl<S: CacheStorage> ScopedCacheStorage<S> {
    pub fn new(inner: S, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}/{key}", self.namespace)
    }
}

impl<S: CacheStorage> CacheStorage for ScopedCacheStorage<S> {
    fn read(&self, key: &str) -> Result<Option<String>, CacheStorageError> {
        self.inner.read(&self.scoped(key))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), CacheStorageError> {
        self.inner.write(&self.scoped(key), value)
    }

    fn remove(&self, key: &str) -> Result<(), CacheStorageError> {
        self.inner.remove(&self.scoped(key))
    }
}

fn load_store(path: &Path) -> Option<StoreFile> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice::<StoreFile>(&bytes) {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable cache store");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kiosk_core::{PositionCache, Slide};

    use super::*;

    #[test]
    fn in_memory_roundtrip() {
        let store = InMemoryCacheStorage::default();
        store.write("a", "1").expect("write should work");
        assert_eq!(store.read("a").expect("read"), Some("1".to_owned()));
        store.remove("a").expect("remove should work");
        assert_eq!(store.read("a").expect("read"), None);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache").join("positions.json");

        let store = FileCacheStorage::open(&path).expect("open");
        store.write("k", "v").expect("write");
        drop(store);

        let reopened = FileCacheStorage::open(&path).expect("reopen");
        assert_eq!(reopened.read("k").expect("read"), Some("v".to_owned()));
    }

    #[test]
    fn file_store_rejects_writes_over_quota_and_keeps_old_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            FileCacheStorage::with_capacity(dir.path().join("p.json"), 8).expect("open");
        store.write("k", "1234").expect("fits");

        let err = store
            .write("k", "123456789")
            .expect_err("over quota must fail");
        assert_eq!(err, CacheStorageError::QuotaExceeded);
        assert_eq!(store.read("k").expect("read"), Some("1234".to_owned()));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("p.json");
        fs::write(&path, b"not json").expect("seed");

        let store = FileCacheStorage::open(&path).expect("open");
        assert_eq!(store.read("anything").expect("read"), None);
    }

    #[test]
    fn scoped_store_isolates_namespaces() {
        let base = InMemoryCacheStorage::default();
        let a = ScopedCacheStorage::new(base.clone(), "device-a");
        let b = ScopedCacheStorage::new(base.clone(), "device-b");

        a.write("k", "one").expect("write a");
        b.write("k", "two").expect("write b");

        assert_eq!(a.read("k").expect("read a"), Some("one".to_owned()));
        assert_eq!(b.read("k").expect("read b"), Some("two".to_owned()));
        assert_eq!(base.read("device-a/k").expect("raw"), Some("one".to_owned()));
    }

    #[test]
    fn position_cache_over_quota_file_store_degrades_silently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage =
            FileCacheStorage::with_capacity(dir.path().join("p.json"), 4).expect("open");
        let cache = PositionCache::new(Arc::new(storage), 300_000);

        cache.put("kiosk-slide-order:board", &["a".to_owned(), "b".to_owned()]);
        let slides = vec![Slide::liveboard("a", 3)];
        assert_eq!(
            cache.apply_if_present("kiosk-slide-order:board", slides.clone()),
            slides
        );
    }
}
