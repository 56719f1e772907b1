//! Persistent byte store for downloaded model assets, keyed by source URL.
//!
//! A record is either fully present or absent. Stores never expose a
//! half-written payload; [`AssetCache`] additionally validates each record
//! against the header captured when it was stored.

pub mod disk;
pub mod memory;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::envconfig::WorkerConfig;
use crate::error::{CacheError, WorkerError};
use crate::format::human_bytes;

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Header stored alongside each payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub url: String,
    pub size: u64,
    /// The payload came from a successful response.
    pub status_ok: bool,
    pub sha256: String,
    pub stored_at: u64,
}

impl RecordMeta {
    pub fn capture(url: &str, bytes: &[u8]) -> Self {
        Self {
            url: url.to_string(),
            size: bytes.len() as u64,
            status_ok: true,
            sha256: sha256_hex(bytes),
            stored_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedAsset {
    pub meta: RecordMeta,
    pub bytes: Bytes,
}

impl CachedAsset {
    pub fn validate(&self) -> Result<(), String> {
        if !self.meta.status_ok {
            return Err("record was not captured from a successful response".to_string());
        }
        if self.meta.size != self.bytes.len() as u64 {
            return Err(format!(
                "size mismatch: header says {}, payload has {}",
                self.meta.size,
                self.bytes.len()
            ));
        }
        let digest = sha256_hex(&self.bytes);
        if digest != self.meta.sha256 {
            return Err(format!(
                "digest mismatch: expected {}, got {}",
                self.meta.sha256, digest
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub url: String,
    pub size: u64,
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn get(&self, url: &str) -> Result<Option<CachedAsset>, CacheError>;

    /// Store `bytes` under `url`, replacing any previous record only once
    /// the new one is complete.
    async fn put(&self, url: &str, bytes: Bytes) -> Result<(), CacheError>;

    async fn delete(&self, url: &str) -> Result<bool, CacheError>;

    /// Entries sorted by URL.
    async fn list(&self) -> Result<Vec<CacheEntry>, CacheError>;

    /// Remove every record, returning how many were removed.
    async fn clear(&self) -> Result<usize, CacheError>;
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    Hit(Bytes),
    Invalid(String),
    Miss,
}

#[derive(Clone)]
pub struct AssetCache {
    store: Arc<dyn AssetStore>,
}

impl AssetCache {
    pub fn new(store: Arc<dyn AssetStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        if config.persistent_cache {
            Self::new(Arc::new(DiskStore::new(config.store_dir())))
        } else {
            Self::in_memory()
        }
    }

    pub async fn lookup(&self, url: &str) -> Lookup {
        match self.store.get(url).await {
            Ok(Some(asset)) => match asset.validate() {
                Ok(()) => Lookup::Hit(asset.bytes),
                Err(reason) => Lookup::Invalid(reason),
            },
            Ok(None) => Lookup::Miss,
            Err(CacheError::Corrupt(reason)) => Lookup::Invalid(reason),
            Err(e) => {
                tracing::warn!(url, error = %e, "cache read failed, treating as miss");
                Lookup::Miss
            }
        }
    }

    /// Bytes of a valid record, if any.
    pub async fn get(&self, url: &str) -> Option<Bytes> {
        match self.lookup(url).await {
            Lookup::Hit(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Best-effort write. Failures are logged here and returned as
    /// `CacheWrite`; callers are free to ignore them.
    pub async fn put(&self, url: &str, bytes: Bytes) -> Result<(), WorkerError> {
        let size = bytes.len();
        match self.store.put(url, bytes).await {
            Ok(()) => {
                tracing::debug!(url, size, "cached asset");
                Ok(())
            }
            Err(e) => {
                let err = WorkerError::CacheWrite {
                    url: url.to_string(),
                    message: e.to_string(),
                };
                tracing::warn!(url, error = %err, "cache write failed");
                Err(err)
            }
        }
    }

    pub async fn delete(&self, url: &str) -> bool {
        match self.store.delete(url).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(url, error = %e, "cache delete failed");
                false
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        self.store.list().await
    }

    pub async fn clear(&self) -> Result<usize, CacheError> {
        let removed = self.store.clear().await?;
        tracing::info!(removed, "cleared asset cache");
        Ok(removed)
    }

    /// Human-readable listing used for `cache_status` replies.
    pub async fn summary(&self) -> Result<String, CacheError> {
        let entries = self.list().await?;
        Ok(summarize(&entries))
    }
}

pub fn summarize(entries: &[CacheEntry]) -> String {
    if entries.is_empty() {
        return "No cached models".to_string();
    }

    let total: u64 = entries.iter().map(|e| e.size).sum();
    let mut status = format!(
        "{} cached file{} ({})",
        entries.len(),
        if entries.len() == 1 { "" } else { "s" },
        human_bytes(total)
    );
    for entry in entries {
        status.push_str(&format!("\n{} ({})", entry.url, human_bytes(entry.size)));
    }
    status
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
