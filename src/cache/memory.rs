use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{AssetStore, CacheEntry, CachedAsset, RecordMeta};
use crate::error::CacheError;

/// Volatile store used when persistence is disabled.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, CachedAsset>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record with an arbitrary header, bypassing capture.
    pub fn insert_raw(&self, meta: RecordMeta, bytes: Bytes) {
        self.records
            .write()
            .insert(meta.url.clone(), CachedAsset { meta, bytes });
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AssetStore for MemoryStore {
    async fn get(&self, url: &str) -> Result<Option<CachedAsset>, CacheError> {
        Ok(self.records.read().get(url).cloned())
    }

    async fn put(&self, url: &str, bytes: Bytes) -> Result<(), CacheError> {
        let meta = RecordMeta::capture(url, &bytes);
        self.records
            .write()
            .insert(url.to_string(), CachedAsset { meta, bytes });
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<bool, CacheError> {
        Ok(self.records.write().remove(url).is_some())
    }

    async fn list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(self
            .records
            .read()
            .values()
            .map(|r| CacheEntry {
                url: r.meta.url.clone(),
                size: r.meta.size,
            })
            .collect())
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let mut records = self.records.write();
        let removed = records.len();
        records.clear();
        Ok(removed)
    }
}
