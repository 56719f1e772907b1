pub mod transport;

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use futures::StreamExt;

use crate::cache::{AssetCache, Lookup};
use crate::error::{Result, WorkerError};
use crate::format::{megabytes, percent};

pub use transport::{BodyStream, HttpTransport, Transport, TransportResponse};

// Upper bound on the buffer pre-allocated from an advertised length.
const MAX_PREALLOC: u64 = 512 * 1024 * 1024;

/// A downloadable resource plus the name shown in progress messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDescriptor {
    pub url: String,
    pub label: String,
}

impl AssetDescriptor {
    pub fn new(url: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    CacheHit,
    DownloadStarted,
    Downloading,
    Constructing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub message: String,
    pub percent: Option<u8>,
    pub bytes_received: u64,
}

pub type ProgressFn<'a> = &'a (dyn Fn(ProgressEvent) + Send + Sync);

/// Resolves asset URLs to bytes, serving from [`AssetCache`] when it can.
#[derive(Clone)]
pub struct AssetDownloader {
    cache: AssetCache,
    transport: Arc<dyn Transport>,
}

impl AssetDownloader {
    pub fn new(cache: AssetCache, transport: Arc<dyn Transport>) -> Self {
        Self { cache, transport }
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    pub async fn fetch_asset(&self, asset: &AssetDescriptor, on_progress: ProgressFn<'_>) -> Result<Bytes> {
        match self.cache.lookup(&asset.url).await {
            Lookup::Hit(bytes) => {
                tracing::debug!(url = %asset.url, size = bytes.len(), "cache hit");
                on_progress(ProgressEvent {
                    kind: ProgressKind::CacheHit,
                    message: format!("Loading {} from cache...", asset.label),
                    percent: None,
                    bytes_received: bytes.len() as u64,
                });
                return Ok(bytes);
            }
            Lookup::Invalid(reason) => {
                tracing::warn!(url = %asset.url, reason = %reason, "discarding invalid cache record");
                self.cache.delete(&asset.url).await;
            }
            Lookup::Miss => tracing::debug!(url = %asset.url, "cache miss"),
        }

        on_progress(ProgressEvent {
            kind: ProgressKind::DownloadStarted,
            message: format!("Downloading {}...", asset.label),
            percent: None,
            bytes_received: 0,
        });

        let bytes = self.download(asset, on_progress).await?;

        if self.cache.put(&asset.url, bytes.clone()).await.is_err() {
            tracing::debug!(url = %asset.url, "continuing without caching downloaded asset");
        }
        Ok(bytes)
    }

    /// Fetch several assets concurrently; results keep the input order.
    pub async fn fetch_assets(&self, assets: &[AssetDescriptor], on_progress: ProgressFn<'_>) -> Result<Vec<Bytes>> {
        try_join_all(assets.iter().map(|asset| self.fetch_asset(asset, on_progress))).await
    }

    async fn download(&self, asset: &AssetDescriptor, on_progress: ProgressFn<'_>) -> Result<Bytes> {
        let start = Instant::now();
        let res = self.transport.fetch(&asset.url).await?;

        if !res.is_success() {
            return Err(WorkerError::Network {
                status: res.status,
                url: asset.url.clone(),
            });
        }

        let total = res.content_length;
        let mut buf = BytesMut::with_capacity(total.unwrap_or(0).min(MAX_PREALLOC) as usize);
        let mut body = res.body;
        let mut received = 0u64;
        let mut last_pct = None;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            buf.extend_from_slice(&chunk);

            last_pct = percent(received, total);
            on_progress(downloading(asset, received, last_pct));
        }

        // An empty body never enters the loop above.
        if total == Some(received) && last_pct != Some(100) {
            on_progress(downloading(asset, received, percent(received, total)));
        }

        if let Some(total) = total {
            if total != received {
                tracing::warn!(url = %asset.url, total, received, "content length mismatch");
            }
        }

        tracing::info!(
            url = %asset.url,
            bytes = received,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "downloaded asset"
        );
        Ok(buf.freeze())
    }
}

fn downloading(asset: &AssetDescriptor, received: u64, pct: Option<u8>) -> ProgressEvent {
    let message = match pct {
        Some(pct) => format!("Downloading {}: {}% ({} MB)", asset.label, pct, megabytes(received)),
        None => format!("Downloading {}: {} MB", asset.label, megabytes(received)),
    };
    ProgressEvent {
        kind: ProgressKind::Downloading,
        message,
        percent: pct,
        bytes_received: received,
    }
}
