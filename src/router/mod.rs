use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::downloader::{AssetDownloader, ProgressEvent};
use crate::engine::Engine;
use crate::envconfig::WorkerConfig;
use crate::error::WorkerError;
use crate::lifecycle::{LifecycleState, ModelConfig, ModelLifecycle};
use crate::protocol::{decode, Decoded, InboundMessage, OutboundMessage, StreamRequest};
use crate::session::{self, SessionEvent};

/// Sending half of the host channel. Messages sent after the host hung up
/// are dropped.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, msg: OutboundMessage) {
        if self.tx.send(msg).is_err() {
            tracing::debug!("host channel closed, dropping message");
        }
    }
}

/// Everything one worker owns.
pub struct WorkerSessionContext<E: Engine> {
    pub lifecycle: ModelLifecycle<E>,
    pub downloader: AssetDownloader,
    pub config: WorkerConfig,
}

impl<E: Engine> WorkerSessionContext<E> {
    pub fn new(engine: Arc<E>, downloader: AssetDownloader, config: WorkerConfig) -> Self {
        Self {
            lifecycle: ModelLifecycle::new(engine),
            downloader,
            config,
        }
    }
}

/// Decodes host commands and turns component results into outbound
/// messages. Nothing else writes to the host channel.
pub struct MessageRouter<E: Engine> {
    ctx: WorkerSessionContext<E>,
    outbox: Outbox,
}

impl<E: Engine> MessageRouter<E> {
    pub fn new(ctx: WorkerSessionContext<E>, outbox: Outbox) -> Self {
        Self { ctx, outbox }
    }

    pub fn state(&self) -> LifecycleState {
        self.ctx.lifecycle.state()
    }

    pub async fn dispatch_value(&mut self, value: Value) {
        match decode(value) {
            Decoded::Command(msg) => self.dispatch(msg).await,
            Decoded::Unknown(tag) => {
                tracing::warn!(command = %tag, "ignoring unknown command");
                if self.ctx.config.reject_unknown_commands {
                    self.outbox
                        .send(OutboundMessage::error(&WorkerError::UnsupportedCommand(tag)));
                }
            }
            Decoded::Invalid(e) => {
                tracing::warn!(error = %e, "rejecting malformed command");
                self.outbox.send(OutboundMessage::error(&e));
            }
        }
    }

    pub async fn dispatch(&mut self, msg: InboundMessage) {
        tracing::debug!(command = msg.tag(), "dispatching");
        match msg {
            InboundMessage::InitWasm => self.init_engine().await,
            InboundMessage::LoadModel(config) => self.load_model(config).await,
            InboundMessage::StreamTokens(request) => self.stream_tokens(request).await,
            InboundMessage::CheckCache => self.check_cache().await,
            InboundMessage::ClearCache => self.clear_cache().await,
        }
    }

    async fn init_engine(&mut self) {
        match self.ctx.lifecycle.init_engine().await {
            Ok(()) => self.outbox.send(OutboundMessage::WasmInitialized { success: true }),
            Err(e) => {
                self.outbox.send(OutboundMessage::WasmInitialized { success: false });
                self.outbox.send(OutboundMessage::error(&e));
            }
        }
    }

    async fn load_model(&mut self, config: ModelConfig) {
        let outbox = self.outbox.clone();
        let on_progress = move |event: ProgressEvent| {
            outbox.send(OutboundMessage::LoadingProgress {
                message: event.message,
            })
        };

        let ctx = &mut self.ctx;
        match ctx.lifecycle.load_model(&config, &ctx.downloader, &on_progress).await {
            Ok(()) => self.outbox.send(OutboundMessage::ModelLoaded),
            Err(e) => self.outbox.send(OutboundMessage::error(&e)),
        }
    }

    async fn stream_tokens(&mut self, request: StreamRequest) {
        let outbox = self.outbox.clone();
        let emit = move |event: SessionEvent| {
            let msg = match event {
                SessionEvent::Token {
                    token,
                    tokens_per_sec,
                    total_time_ms,
                } => OutboundMessage::Token {
                    token,
                    tokens_sec: tokens_per_sec,
                    total_time: total_time_ms,
                },
                SessionEvent::Complete => OutboundMessage::StreamComplete,
            };
            outbox.send(msg);
        };

        let result = session::generate(
            self.ctx.lifecycle.agent(),
            &request.prompt,
            request.has_image(),
            &request.options,
            self.ctx.config.fallback_token_delay,
            &emit,
        )
        .await;

        if let Err(e) = result {
            self.outbox.send(OutboundMessage::error(&e));
        }
    }

    async fn check_cache(&self) {
        let status = match self.ctx.downloader.cache().summary().await {
            Ok(summary) => summary,
            Err(e) => format!("Error checking cache: {}", e),
        };
        self.outbox.send(OutboundMessage::CacheStatus { status });
    }

    async fn clear_cache(&self) {
        let status = match self.ctx.downloader.cache().clear().await {
            Ok(removed) => format!(
                "Cleared {} cached file{}",
                removed,
                if removed == 1 { "" } else { "s" }
            ),
            Err(e) => format!("Error clearing cache: {}", e),
        };
        self.outbox.send(OutboundMessage::CacheStatus { status });
    }
}
