use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama::ModelWeights;
use candle_transformers::utils::apply_repeat_penalty;
use futures::StreamExt;
use parking_lot::Mutex;
use tokenizers::Tokenizer;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{Agent, Engine, GenerationOptions, ModelAssets, TokenStream};
use crate::error::{Result, WorkerError};

const DEFAULT_SEED: u64 = 299792458;
const DEFAULT_MAX_TOKENS: usize = 512;
const DEFAULT_REPEAT_LAST_N: usize = 64;
const DEFAULT_CONTEXT_LENGTH: usize = 4096;
const TOKEN_CHANNEL_CAPACITY: usize = 32;

const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|end|>", "<|im_end|>"];

const STOP_STRINGS: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|user|>",
    "<|system|>",
    "<|assistant|>",
    "[INST]",
    "[/INST]",
    "Human:",
    "Assistant:",
];

impl From<candle_core::Error> for WorkerError {
    fn from(e: candle_core::Error) -> Self {
        WorkerError::Engine(e.to_string())
    }
}

/// Quantized llama-family models loaded from GGUF weights.
pub struct CandleEngine {
    device: Device,
}

impl CandleEngine {
    pub fn new() -> Self {
        Self { device: select_device() }
    }

    pub fn with_device(device: Device) -> Self {
        Self { device }
    }
}

impl Default for CandleEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cuda")]
fn select_device() -> Device {
    Device::cuda_if_available(0).unwrap_or(Device::Cpu)
}

#[cfg(not(feature = "cuda"))]
fn select_device() -> Device {
    Device::Cpu
}

pub struct CandleModel {
    weights: Mutex<ModelWeights>,
    tokenizer: Tokenizer,
    device: Device,
    eos_token: Option<u32>,
    context_length: usize,
}

#[async_trait]
impl Engine for CandleEngine {
    type Model = CandleModel;

    async fn init(&self) -> Result<()> {
        let _probe = Tensor::zeros(1, DType::F32, &self.device)?;
        tracing::info!(device = ?self.device, "engine initialized");
        Ok(())
    }

    async fn construct(&self, assets: ModelAssets, quantized: bool) -> Result<CandleModel> {
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || build_model(assets, quantized, device))
            .await
            .map_err(WorkerError::construction)?
    }

    fn wrap_model(&self, model: Arc<CandleModel>) -> Result<Arc<dyn Agent>> {
        Ok(Arc::new(CandleAgent { model }))
    }
}

fn build_model(assets: ModelAssets, quantized: bool, device: Device) -> Result<CandleModel> {
    if !quantized {
        return Err(WorkerError::Construction(
            "only quantized GGUF weights are supported".to_string(),
        ));
    }

    let tokenizer = Tokenizer::from_bytes(&assets.tokenizer).map_err(WorkerError::construction)?;

    let hints: serde_json::Value = serde_json::from_slice(&assets.config).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "ignoring unparseable model config");
        serde_json::Value::Null
    });
    let eos_token = hints
        .get("eos_token_id")
        .and_then(|v| v.as_u64())
        .map(|id| id as u32)
        .or_else(|| EOS_CANDIDATES.iter().find_map(|t| tokenizer.token_to_id(t)));
    let context_length = hints
        .get("max_position_embeddings")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_CONTEXT_LENGTH);

    let mut reader = Cursor::new(assets.weights.as_ref());
    let content = gguf_file::Content::read(&mut reader)
        .map_err(|e| WorkerError::Construction(format!("failed to read GGUF content: {e}")))?;
    let weights = ModelWeights::from_gguf(content, &mut reader, &device)
        .map_err(|e| WorkerError::Construction(format!("failed to load quantized weights: {e}")))?;

    tracing::info!(
        weights = assets.weights.len(),
        eos_token = ?eos_token,
        context_length,
        "model constructed"
    );

    Ok(CandleModel {
        weights: Mutex::new(weights),
        tokenizer,
        device,
        eos_token,
        context_length,
    })
}

struct CandleAgent {
    model: Arc<CandleModel>,
}

impl Agent for CandleAgent {
    fn stream_response(&self, prompt: &str, options: &GenerationOptions) -> Result<TokenStream> {
        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let model = Arc::clone(&self.model);
        let prompt = prompt.to_string();
        let options = options.clone();

        tokio::task::spawn_blocking(move || {
            if let Err(e) = generate(&model, &prompt, &options, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

fn generate(
    model: &CandleModel,
    prompt: &str,
    options: &GenerationOptions,
    tx: &mpsc::Sender<Result<String>>,
) -> Result<()> {
    let mut weights = model.weights.lock();

    let temperature = options.temperature.filter(|t| *t > 0.0);
    let top_p = options.top_p.filter(|p| *p > 0.0 && *p < 1.0);
    let mut sampler = LogitsProcessor::new(options.seed.unwrap_or(DEFAULT_SEED), temperature, top_p);
    let repeat_penalty = options.repeat_penalty.unwrap_or(1.0);
    let repeat_last_n = options.repeat_last_n.unwrap_or(DEFAULT_REPEAT_LAST_N);
    let max_tokens = options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

    let prompt_tokens = model
        .tokenizer
        .encode(prompt, true)
        .map_err(WorkerError::engine)?
        .get_ids()
        .to_vec();
    if prompt_tokens.is_empty() {
        return Ok(());
    }

    let mut history = prompt_tokens.clone();
    let mut input = prompt_tokens;
    let mut generated: Vec<u32> = Vec::new();
    let mut index_pos = 0;
    let mut emitted = 0;

    for _ in 0..max_tokens {
        if index_pos + input.len() > model.context_length {
            tracing::debug!(index_pos, "context window exhausted");
            break;
        }

        let x = Tensor::new(input.as_slice(), &model.device)?.unsqueeze(0)?;
        let logits = weights.forward(&x, index_pos)?;
        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
        index_pos += input.len();

        let logits = if repeat_penalty == 1.0 {
            logits
        } else {
            let start_at = history.len().saturating_sub(repeat_last_n);
            apply_repeat_penalty(&logits, repeat_penalty, &history[start_at..])?
        };

        let next = sampler.sample(&logits)?;
        history.push(next);
        if Some(next) == model.eos_token {
            break;
        }
        generated.push(next);

        let text = model
            .tokenizer
            .decode(&generated, true)
            .map_err(WorkerError::engine)?;
        let stop_at = STOP_STRINGS.iter().filter_map(|s| text.find(s)).min();
        let visible = &text[..stop_at.unwrap_or(text.len())];

        if visible.len() > emitted && visible.is_char_boundary(emitted) {
            let piece = visible[emitted..].to_string();
            emitted = visible.len();
            if tx.blocking_send(Ok(piece)).is_err() {
                return Ok(());
            }
        }

        if stop_at.is_some() {
            break;
        }
        input = vec![next];
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_on_cpu() {
        let engine = CandleEngine::with_device(Device::Cpu);
        assert!(engine.init().await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_unquantized_weights() {
        let engine = CandleEngine::with_device(Device::Cpu);
        let assets = ModelAssets {
            weights: bytes::Bytes::from_static(b"weights"),
            tokenizer: bytes::Bytes::from_static(b"{}"),
            config: bytes::Bytes::from_static(b"{}"),
        };
        let err = engine.construct(assets, false).await.err().unwrap();
        assert!(matches!(err, WorkerError::Construction(_)));
    }

    #[tokio::test]
    async fn test_bad_tokenizer_is_construction_error() {
        let engine = CandleEngine::with_device(Device::Cpu);
        let assets = ModelAssets {
            weights: bytes::Bytes::from_static(b"GGUF"),
            tokenizer: bytes::Bytes::from_static(b"not json"),
            config: bytes::Bytes::from_static(b"{}"),
        };
        let err = engine.construct(assets, true).await.err().unwrap();
        assert!(matches!(err, WorkerError::Construction(_)));
    }
}
