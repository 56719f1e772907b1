//! Contract between the worker and the model-execution engine.
//!
//! The worker never looks inside a model: it hands the engine three byte
//! buffers, gets back an opaque model, wraps it into an [`Agent`] and asks
//! that agent for token streams.

#[cfg(feature = "candle")]
pub mod candle;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[cfg(feature = "candle")]
pub use self::candle::CandleEngine;

/// Finite, non-restartable sequence of decoded text pieces.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// The three downloaded buffers a model is built from.
#[derive(Debug, Clone)]
pub struct ModelAssets {
    pub weights: Bytes,
    pub tokenizer: Bytes,
    pub config: Bytes,
}

/// Sampling parameters forwarded to the engine. Unset fields use the
/// engine's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationOptions {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub repeat_penalty: Option<f32>,
    pub repeat_last_n: Option<usize>,
    pub seed: Option<u64>,
    pub max_tokens: Option<usize>,
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    type Model: Send + Sync + 'static;

    async fn init(&self) -> Result<()>;

    async fn construct(&self, assets: ModelAssets, quantized: bool) -> Result<Self::Model>;

    fn wrap_model(&self, model: Arc<Self::Model>) -> Result<Arc<dyn Agent>>;
}

pub trait Agent: Send + Sync {
    fn stream_response(&self, prompt: &str, options: &GenerationOptions) -> Result<TokenStream>;
}
