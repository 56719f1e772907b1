use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use phi_worker::downloader::{AssetDescriptor, AssetDownloader, HttpTransport, ProgressEvent};
use phi_worker::engine::CandleEngine;
use phi_worker::format::human_bytes;
use phi_worker::progress::Progress;
use phi_worker::{AssetCache, InboundMessage, OutboundMessage, Worker, WorkerConfig, WorkerHandle};

/// Run the worker over stdio: one JSON command per stdin line, one JSON
/// message per stdout line.
pub async fn serve(config: WorkerConfig) -> Result<()> {
    tracing::info!(cache_dir = %config.store_dir().display(), persistent = config.persistent_cache, "starting worker");
    let handle = Worker::spawn(Arc::new(CandleEngine::new()), config)?;
    let (sender, mut outbound, task) = handle.into_parts();

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(value) => {
                    if sender.send_raw(value).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "skipping malformed input line"),
            }
        }
        tracing::debug!("stdin closed");
        Ok::<(), std::io::Error>(())
    });

    let mut stdout = tokio::io::stdout();
    while let Some(msg) = outbound.recv().await {
        let mut line = serde_json::to_vec(&msg)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
        stdout.flush().await?;
    }

    reader.await?.context("failed to read stdin")?;
    task.await?;
    Ok(())
}

pub async fn cache_status(config: WorkerConfig) -> Result<()> {
    let status = ask(config, InboundMessage::CheckCache).await?;
    println!("{}", status);
    Ok(())
}

pub async fn cache_clear(config: WorkerConfig) -> Result<()> {
    let status = ask(config, InboundMessage::ClearCache).await?;
    println!("{}", status);
    Ok(())
}

async fn ask(config: WorkerConfig, command: InboundMessage) -> Result<String> {
    let mut handle: WorkerHandle = Worker::spawn(Arc::new(CandleEngine::new()), config)?;
    handle.send(&command)?;
    match handle.recv().await {
        Some(OutboundMessage::CacheStatus { status }) => Ok(status),
        Some(OutboundMessage::Error { error }) => bail!(error),
        Some(other) => bail!("unexpected reply from worker: {:?}", other),
        None => bail!("worker exited without replying"),
    }
}

/// Download assets into the cache ahead of a `load_model`.
pub async fn fetch(config: WorkerConfig, urls: Vec<String>, label: Option<String>) -> Result<()> {
    if urls.is_empty() {
        bail!("no URLs given");
    }

    let cache = AssetCache::from_config(&config);
    let transport = Arc::new(HttpTransport::new(&config)?);
    let downloader = AssetDownloader::new(cache, transport);

    let assets: Vec<AssetDescriptor> = urls
        .iter()
        .map(|url| {
            let name = label.clone().unwrap_or_else(|| file_name(url).to_string());
            AssetDescriptor::new(url.clone(), name)
        })
        .collect();

    let progress = Progress::spinner("Fetching...");
    let on_progress = |event: ProgressEvent| progress.update(&event);
    let result = downloader.fetch_assets(&assets, &on_progress).await;

    match result {
        Ok(bodies) => {
            let total: usize = bodies.iter().map(|b| b.len()).sum();
            progress.stop(&format!("Fetched {} file(s), {}", bodies.len(), human_bytes(total as u64)));
            Ok(())
        }
        Err(e) => {
            progress.stop_and_clear();
            Err(e.into())
        }
    }
}

fn file_name(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}
