//! The worker task: one inbound queue, one outbound queue, commands handled
//! strictly in arrival order.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::AssetCache;
use crate::downloader::transport::HttpTransport;
use crate::downloader::AssetDownloader;
use crate::engine::Engine;
use crate::envconfig::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::router::{MessageRouter, Outbox, WorkerSessionContext};

pub struct Worker;

impl Worker {
    /// Spawn a worker backed by the configured cache store and HTTP.
    pub fn spawn<E: Engine>(engine: Arc<E>, config: WorkerConfig) -> Result<WorkerHandle> {
        let cache = AssetCache::from_config(&config);
        let transport = Arc::new(HttpTransport::new(&config)?);
        let downloader = AssetDownloader::new(cache, transport);
        Ok(Self::spawn_with(engine, downloader, config))
    }

    pub fn spawn_with<E: Engine>(
        engine: Arc<E>,
        downloader: AssetDownloader,
        config: WorkerConfig,
    ) -> WorkerHandle {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Value>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let ctx = WorkerSessionContext::new(engine, downloader, config);
        let mut router = MessageRouter::new(ctx, Outbox::new(outbound_tx));

        let task = tokio::spawn(async move {
            tracing::debug!("worker started");
            while let Some(value) = inbound_rx.recv().await {
                router.dispatch_value(value).await;
            }
            tracing::debug!("inbound channel closed, worker exiting");
        });

        WorkerHandle {
            sender: WorkerSender { tx: inbound_tx },
            outbound: outbound_rx,
            task,
        }
    }
}

/// Cloneable inbound side of a worker.
#[derive(Clone)]
pub struct WorkerSender {
    tx: mpsc::UnboundedSender<Value>,
}

impl WorkerSender {
    pub fn send(&self, msg: &InboundMessage) -> Result<()> {
        let value = serde_json::to_value(msg).map_err(|e| WorkerError::InvalidCommand {
            command: msg.tag().to_string(),
            message: e.to_string(),
        })?;
        self.send_raw(value)
    }

    /// Queue an undecoded command, as received from the host.
    pub fn send_raw(&self, value: Value) -> Result<()> {
        self.tx.send(value).map_err(|_| WorkerError::Closed)
    }
}

pub struct WorkerHandle {
    sender: WorkerSender,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn sender(&self) -> WorkerSender {
        self.sender.clone()
    }

    pub fn send(&self, msg: &InboundMessage) -> Result<()> {
        self.sender.send(msg)
    }

    pub fn send_raw(&self, value: Value) -> Result<()> {
        self.sender.send_raw(value)
    }

    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.outbound.recv().await
    }

    /// Split into the inbound sender, the outbound receiver and the task.
    /// The task ends once every sender is dropped and the queue is drained.
    pub fn into_parts(
        self,
    ) -> (
        WorkerSender,
        mpsc::UnboundedReceiver<OutboundMessage>,
        JoinHandle<()>,
    ) {
        (self.sender, self.outbound, self.task)
    }

    /// Stop accepting commands, finish queued ones and return whatever the
    /// worker sent that has not been received yet.
    pub async fn shutdown(self) -> Vec<OutboundMessage> {
        let (sender, mut outbound, task) = self.into_parts();
        drop(sender);
        if let Err(e) = task.await {
            tracing::error!(error = %e, "worker task panicked");
        }
        let mut rest = Vec::new();
        while let Some(msg) = outbound.recv().await {
            rest.push(msg);
        }
        rest
    }
}
