//! Device-local, TTL-bound memory of the last order this client wrote.
//!
//! Right after a reorder the read replica can still serve the previous
//! order for a while. A reload inside that window re-applies the cached
//! positions on top of the fetched slides. The cache is never a source of
//! truth: every storage failure is logged and swallowed.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Slide, SlideId};

/// Errors surfaced by a `CacheStorage` backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheStorageError {
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Durable string key/value storage owned by the device.
pub trait CacheStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, CacheStorageError>;

    fn write(&self, key: &str, value: &str) -> Result<(), CacheStorageError>;

    fn remove(&self, key: &str) -> Result<(), CacheStorageError>;
}

/// Persisted record: `{positions, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedOrder {
    pub positions: HashMap<SlideId, i64>,
    /// Write time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl CachedOrder {
    /// Positions `0..n-1` following `ordered_ids`.
    pub fn from_ordered_ids(ordered_ids: &[SlideId], timestamp: u64) -> Self {
        let positions = ordered_ids
            .iter()
            .enumerate()
            .map(|(index, id)| (id.clone(), index as i64))
            .collect();
        Self {
            positions,
            timestamp,
        }
    }

    pub fn is_expired(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) > ttl_ms
    }

    /// Overwrite positions of cached ids and re-sort. Slides unknown to the
    /// cache keep their fetched position. The sort is stable, so ties keep
    /// input order.
    pub fn apply(&self, slides: &mut [Slide]) {
        for slide in slides.iter_mut() {
            if let Some(position) = self.positions.get(&slide.id) {
                slide.position = *position;
            }
        }
        slides.sort_by_key(|slide| slide.position);
    }
}

/// TTL-bound position cache over a `CacheStorage` backend.
#[derive(Clone)]
pub struct PositionCache {
    storage: Arc<dyn CacheStorage>,
    ttl_ms: u64,
}

impl std::fmt::Debug for PositionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionCache")
            .field("ttl_ms", &self.ttl_ms)
            .finish_non_exhaustive()
    }
}

impl PositionCache {
    pub fn new(storage: Arc<dyn CacheStorage>, ttl_ms: u64) -> Self {
        Self { storage, ttl_ms }
    }

    /// Store the order of `ordered_ids` for `collection_key`.
    pub fn put(&self, collection_key: &str, ordered_ids: &[SlideId]) {
        self.put_at(collection_key, ordered_ids, now_millis());
    }

    pub fn put_at(&self, collection_key: &str, ordered_ids: &[SlideId], now_ms: u64) {
        let record = CachedOrder::from_ordered_ids(ordered_ids, now_ms);
        let encoded = match serde_json::to_string(&record) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(collection_key, error = %err, "failed encoding cached slide order");
                return;
            }
        };
        match self.storage.write(collection_key, &encoded) {
            Ok(()) => debug!(collection_key, slides = ordered_ids.len(), "cached slide order"),
            Err(err) => warn!(collection_key, error = %err, "failed writing cached slide order"),
        }
    }

    /// Unexpired cached order for `collection_key`. Expired or unreadable
    /// entries are evicted.
    pub fn get(&self, collection_key: &str) -> Option<CachedOrder> {
        self.get_at(collection_key, now_millis())
    }

    pub fn get_at(&self, collection_key: &str, now_ms: u64) -> Option<CachedOrder> {
        let raw = match self.storage.read(collection_key) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(collection_key, error = %err, "failed reading cached slide order");
                return None;
            }
        };

        let record = match serde_json::from_str::<CachedOrder>(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(collection_key, error = %err, "discarding unreadable cached slide order");
                self.evict(collection_key);
                return None;
            }
        };

        if record.is_expired(now_ms, self.ttl_ms) {
            debug!(collection_key, "cached slide order expired");
            self.evict(collection_key);
            return None;
        }
        Some(record)
    }

    /// Re-apply a cached order to freshly fetched slides, when one exists.
    pub fn apply_if_present(&self, collection_key: &str, slides: Vec<Slide>) -> Vec<Slide> {
        self.apply_if_present_at(collection_key, slides, now_millis())
    }

    pub fn apply_if_present_at(
        &self,
        collection_key: &str,
        mut slides: Vec<Slide>,
        now_ms: u64,
    ) -> Vec<Slide> {
        if let Some(record) = self.get_at(collection_key, now_ms) {
            record.apply(&mut slides);
        }
        slides
    }

    fn evict(&self, collection_key: &str) {
        if let Err(err) = self.storage.remove(collection_key) {
            warn!(collection_key, error = %err, "failed evicting cached slide order");
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
