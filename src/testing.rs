//! Mocks shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::downloader::{Transport, TransportResponse};
use crate::engine::{Agent, Engine, GenerationOptions, ModelAssets, TokenStream};
use crate::error::{Result, WorkerError};

/// Serves fixed bodies by URL; anything else is a 404. With a latency set,
/// each request sleeps before answering and the peak number of requests in
/// flight is recorded.
#[derive(Default)]
pub struct StaticTransport {
    bodies: HashMap<String, Bytes>,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, body: &'static [u8]) -> Self {
        self.bodies.insert(url.to_string(), Bytes::from_static(body));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StaticTransport {
    async fn fetch(&self, url: &str) -> Result<TransportResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let (status, body) = match self.bodies.get(url) {
            Some(body) => (200, body.clone()),
            None => (404, Bytes::new()),
        };
        Ok(TransportResponse {
            status,
            content_length: Some(body.len() as u64),
            body: futures::stream::iter(vec![Ok(body)]).boxed(),
        })
    }
}

pub struct EchoModel {
    pub weights_len: usize,
}

/// Engine whose agent streams the prompt back word by word.
#[derive(Default)]
pub struct EchoEngine {
    pub fail_init: AtomicBool,
    pub fail_construct: AtomicBool,
    pub fail_stream_after: Option<usize>,
    pub inits: AtomicUsize,
    pub constructs: AtomicUsize,
    pub streams: Arc<AtomicUsize>,
}

#[async_trait]
impl Engine for EchoEngine {
    type Model = EchoModel;

    async fn init(&self) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(WorkerError::engine("wasm module failed to instantiate"));
        }
        Ok(())
    }

    async fn construct(&self, assets: ModelAssets, _quantized: bool) -> Result<EchoModel> {
        self.constructs.fetch_add(1, Ordering::SeqCst);
        if self.fail_construct.load(Ordering::SeqCst) {
            return Err(WorkerError::Construction("bad weights".to_string()));
        }
        Ok(EchoModel {
            weights_len: assets.weights.len(),
        })
    }

    fn wrap_model(&self, model: Arc<EchoModel>) -> Result<Arc<dyn Agent>> {
        if model.weights_len == 0 {
            return Err(WorkerError::Construction("empty weights".to_string()));
        }
        Ok(Arc::new(EchoAgent {
            fail_after: self.fail_stream_after,
            streams: self.streams.clone(),
        }))
    }
}

pub struct EchoAgent {
    pub fail_after: Option<usize>,
    pub streams: Arc<AtomicUsize>,
}

impl Agent for EchoAgent {
    fn stream_response(&self, prompt: &str, _options: &GenerationOptions) -> Result<TokenStream> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        let mut items: Vec<Result<String>> = prompt
            .split_whitespace()
            .map(|w| Ok(w.to_string()))
            .collect();
        if let Some(n) = self.fail_after {
            items.truncate(n);
            items.push(Err(WorkerError::engine("generation failed")));
        }
        Ok(futures::stream::iter(items).boxed())
    }
}
