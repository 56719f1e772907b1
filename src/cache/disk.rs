use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{sha256_hex, AssetStore, CacheEntry, CachedAsset, RecordMeta};
use crate::error::CacheError;

const RECORD_EXT: &str = "rec";
const TEMP_EXT: &str = "tmp";
const HEADER_LEN_BYTES: usize = 4;

/// Directory-backed store. Each record lives in `<sha256(url)>.rec`:
///
/// ```text
/// u32 LE header length | JSON RecordMeta | payload
/// ```
///
/// Records are written to a temp file and renamed into place.
pub struct DiskStore {
    root: PathBuf,
    temp_seq: AtomicU64,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            temp_seq: AtomicU64::new(0),
        }
    }

    fn record_path(&self, url: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", sha256_hex(url.as_bytes()), RECORD_EXT))
    }

    fn temp_path(&self, url: &str) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            "{}.{}-{}.{}",
            sha256_hex(url.as_bytes()),
            std::process::id(),
            seq,
            TEMP_EXT
        ))
    }

    async fn write_record(&self, path: &Path, meta: &RecordMeta, bytes: &[u8]) -> Result<(), CacheError> {
        let header = serde_json::to_vec(meta)?;
        let mut len_buf = [0u8; HEADER_LEN_BYTES];
        LittleEndian::write_u32(&mut len_buf, header.len() as u32);
        let mut prefix = Vec::with_capacity(HEADER_LEN_BYTES + header.len());
        prefix.extend_from_slice(&len_buf);
        prefix.extend_from_slice(&header);

        let mut file = File::create(path).await?;
        file.write_all(&prefix).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn read_header(path: &Path) -> Result<RecordMeta, CacheError> {
        let mut file = File::open(path).await?;
        let mut len_buf = [0u8; HEADER_LEN_BYTES];
        file.read_exact(&mut len_buf).await?;
        let len = LittleEndian::read_u32(&len_buf) as usize;

        let mut header = vec![0u8; len];
        file.read_exact(&mut header).await?;
        serde_json::from_slice(&header).map_err(|e| CacheError::Corrupt(e.to_string()))
    }

    async fn entries_with_ext(&self, ext: &str) -> Result<Vec<PathBuf>, CacheError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ext) {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

fn decode_record(data: Vec<u8>) -> Result<CachedAsset, CacheError> {
    if data.len() < HEADER_LEN_BYTES {
        return Err(CacheError::Corrupt("record shorter than its header length".to_string()));
    }
    let len = LittleEndian::read_u32(&data[..HEADER_LEN_BYTES]) as usize;
    let payload_start = HEADER_LEN_BYTES + len;
    if data.len() < payload_start {
        return Err(CacheError::Corrupt(format!(
            "header length {} exceeds record size {}",
            len,
            data.len()
        )));
    }

    let meta: RecordMeta = serde_json::from_slice(&data[HEADER_LEN_BYTES..payload_start])
        .map_err(|e| CacheError::Corrupt(e.to_string()))?;
    let bytes = Bytes::from(data).slice(payload_start..);
    Ok(CachedAsset { meta, bytes })
}

#[async_trait]
impl AssetStore for DiskStore {
    async fn get(&self, url: &str) -> Result<Option<CachedAsset>, CacheError> {
        let data = match fs::read(self.record_path(url)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let asset = decode_record(data)?;
        if asset.meta.url != url {
            return Err(CacheError::Corrupt(format!(
                "record for {} found under key of {}",
                asset.meta.url, url
            )));
        }
        Ok(Some(asset))
    }

    async fn put(&self, url: &str, bytes: Bytes) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root).await?;

        let meta = RecordMeta::capture(url, &bytes);
        let temp = self.temp_path(url);
        if let Err(e) = self.write_record(&temp, &meta, &bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp, self.record_path(url)).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<bool, CacheError> {
        match fs::remove_file(self.record_path(url)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = Vec::new();
        for path in self.entries_with_ext(RECORD_EXT).await? {
            match Self::read_header(&path).await {
                Ok(meta) => entries.push(CacheEntry {
                    url: meta.url,
                    size: meta.size,
                }),
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        entries.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(entries)
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        for path in self.entries_with_ext(TEMP_EXT).await? {
            let _ = fs::remove_file(&path).await;
        }

        let mut removed = 0;
        for path in self.entries_with_ext(RECORD_EXT).await? {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}
