use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::downloader::{AssetDescriptor, AssetDownloader, ProgressEvent, ProgressFn, ProgressKind};
use crate::engine::{Agent, Engine, ModelAssets};
use crate::error::{Result, WorkerError};

/// Where to fetch a model from. Each asset URL is `base_url` followed by
/// the corresponding path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub base_url: String,
    pub model_path: String,
    pub tokenizer_path: String,
    pub config_path: String,
    #[serde(default)]
    pub quantized: bool,
}

impl ModelConfig {
    /// Weights, tokenizer and config descriptors, in that order.
    pub fn assets(&self) -> [AssetDescriptor; 3] {
        [
            AssetDescriptor::new(format!("{}{}", self.base_url, self.model_path), "model weights"),
            AssetDescriptor::new(format!("{}{}", self.base_url, self.tokenizer_path), "tokenizer"),
            AssetDescriptor::new(format!("{}{}", self.base_url, self.config_path), "config"),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    EngineReady,
    Loading,
    ModelReady,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    InitSucceeded,
    InitFailed,
    LoadRequested,
    LoadSucceeded,
    LoadFailed,
}

impl LifecycleState {
    pub fn transition(self, event: LifecycleEvent) -> Result<LifecycleState> {
        use LifecycleEvent::*;
        use LifecycleState::*;

        match (self, event) {
            (Uninitialized, InitSucceeded) => Ok(EngineReady),
            (Uninitialized, InitFailed) => Ok(Uninitialized),
            (EngineReady | ModelReady | Failed, InitSucceeded) => Ok(self),
            (Uninitialized, LoadRequested) => Err(WorkerError::EngineNotReady {
                operation: "load_model",
            }),
            (Loading, LoadRequested) => Err(WorkerError::Busy),
            (EngineReady | ModelReady | Failed, LoadRequested) => Ok(Loading),
            (Loading, LoadSucceeded) => Ok(ModelReady),
            (Loading, LoadFailed) => Ok(Failed),
            (state, event) => Err(WorkerError::engine(format!(
                "invalid lifecycle transition: {:?} while {:?}",
                event, state
            ))),
        }
    }

    pub fn engine_ready(self) -> bool {
        !matches!(self, LifecycleState::Uninitialized)
    }
}

struct LoadedModel<M> {
    _model: Arc<M>,
    agent: Arc<dyn Agent>,
}

/// Owns the lifecycle state and the current model/agent pair.
pub struct ModelLifecycle<E: Engine> {
    engine: Arc<E>,
    state: LifecycleState,
    loaded: Option<LoadedModel<E::Model>>,
}

impl<E: Engine> ModelLifecycle<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            state: LifecycleState::Uninitialized,
            loaded: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The agent of the current model, only while `ModelReady`.
    pub fn agent(&self) -> Option<Arc<dyn Agent>> {
        match (self.state, &self.loaded) {
            (LifecycleState::ModelReady, Some(loaded)) => Some(Arc::clone(&loaded.agent)),
            _ => None,
        }
    }

    pub async fn init_engine(&mut self) -> Result<()> {
        if self.state.engine_ready() {
            tracing::debug!(state = ?self.state, "engine already initialized");
            return Ok(());
        }

        match self.engine.init().await {
            Ok(()) => {
                self.state = self.state.transition(LifecycleEvent::InitSucceeded)?;
                tracing::info!("engine ready");
                Ok(())
            }
            Err(e) => {
                self.state = self.state.transition(LifecycleEvent::InitFailed)?;
                tracing::error!(error = %e, "engine initialization failed");
                Err(e)
            }
        }
    }

    pub async fn load_model(
        &mut self,
        config: &ModelConfig,
        downloader: &AssetDownloader,
        on_progress: ProgressFn<'_>,
    ) -> Result<()> {
        self.state = self.state.transition(LifecycleEvent::LoadRequested)?;
        tracing::info!(base_url = %config.base_url, model = %config.model_path, "loading model");

        match self.build(config, downloader, on_progress).await {
            Ok(loaded) => {
                self.loaded = Some(loaded);
                self.state = self.state.transition(LifecycleEvent::LoadSucceeded)?;
                tracing::info!(model = %config.model_path, "model ready");
                Ok(())
            }
            Err(e) => {
                self.loaded = None;
                self.state = self.state.transition(LifecycleEvent::LoadFailed)?;
                tracing::error!(model = %config.model_path, error = %e, "model load failed");
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        config: &ModelConfig,
        downloader: &AssetDownloader,
        on_progress: ProgressFn<'_>,
    ) -> Result<LoadedModel<E::Model>> {
        let [weights_asset, tokenizer_asset, config_asset] = config.assets();

        let (weights, tokenizer, config_bytes) = futures::try_join!(
            downloader.fetch_asset(&weights_asset, on_progress),
            downloader.fetch_asset(&tokenizer_asset, on_progress),
            downloader.fetch_asset(&config_asset, on_progress)
        )?;

        on_progress(ProgressEvent {
            kind: ProgressKind::Constructing,
            message: "Initializing model...".to_string(),
            percent: None,
            bytes_received: (weights.len() + tokenizer.len() + config_bytes.len()) as u64,
        });

        let assets = ModelAssets {
            weights,
            tokenizer,
            config: config_bytes,
        };
        let model = Arc::new(self.engine.construct(assets, config.quantized).await?);
        let agent = self.engine.wrap_model(Arc::clone(&model))?;

        Ok(LoadedModel { _model: model, agent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AssetCache;
    use crate::testing::{EchoEngine, StaticTransport};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn config() -> ModelConfig {
        ModelConfig {
            base_url: "https://x/".to_string(),
            model_path: "m.bin".to_string(),
            tokenizer_path: "t.bin".to_string(),
            config_path: "c.json".to_string(),
            quantized: false,
        }
    }

    fn transport() -> Arc<StaticTransport> {
        Arc::new(
            StaticTransport::new()
                .with("https://x/m.bin", b"mmmmmmmmmm")
                .with("https://x/t.bin", b"tttttttttt")
                .with("https://x/c.json", b"{\"a\": 10}"),
        )
    }

    fn no_progress(_: ProgressEvent) {}

    #[test]
    fn test_transition_table() {
        use LifecycleEvent::*;
        use LifecycleState::*;

        assert_eq!(Uninitialized.transition(InitSucceeded).unwrap(), EngineReady);
        assert_eq!(Uninitialized.transition(InitFailed).unwrap(), Uninitialized);
        assert_eq!(EngineReady.transition(LoadRequested).unwrap(), Loading);
        assert_eq!(Loading.transition(LoadSucceeded).unwrap(), ModelReady);
        assert_eq!(Loading.transition(LoadFailed).unwrap(), Failed);
        assert_eq!(ModelReady.transition(LoadRequested).unwrap(), Loading);
        assert_eq!(Failed.transition(LoadRequested).unwrap(), Loading);
        assert_eq!(ModelReady.transition(InitSucceeded).unwrap(), ModelReady);

        assert!(matches!(
            Uninitialized.transition(LoadRequested),
            Err(WorkerError::EngineNotReady { .. })
        ));
        assert!(matches!(Loading.transition(LoadRequested), Err(WorkerError::Busy)));
        assert!(EngineReady.transition(LoadSucceeded).is_err());
    }

    #[test]
    fn test_assets_concatenate_base_url() {
        let urls: Vec<String> = config().assets().iter().map(|a| a.url.clone()).collect();
        assert_eq!(urls, vec!["https://x/m.bin", "https://x/t.bin", "https://x/c.json"]);
    }

    #[tokio::test]
    async fn test_load_before_init_fails_fast() {
        let transport = transport();
        let downloader = AssetDownloader::new(AssetCache::in_memory(), transport.clone());
        let mut lifecycle = ModelLifecycle::new(Arc::new(EchoEngine::default()));

        let err = lifecycle.load_model(&config(), &downloader, &no_progress).await.unwrap_err();

        assert!(matches!(err, WorkerError::EngineNotReady { .. }));
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_init_stays_uninitialized() {
        let engine = EchoEngine::default();
        engine.fail_init.store(true, Ordering::SeqCst);
        let mut lifecycle = ModelLifecycle::new(Arc::new(engine));

        assert!(lifecycle.init_engine().await.is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let engine = Arc::new(EchoEngine::default());
        let mut lifecycle = ModelLifecycle::new(engine.clone());

        lifecycle.init_engine().await.unwrap();
        lifecycle.init_engine().await.unwrap();
        assert_eq!(engine.inits.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), LifecycleState::EngineReady);
    }

    #[tokio::test]
    async fn test_load_and_reload_replace_agent() {
        let engine = Arc::new(EchoEngine::default());
        let downloader = AssetDownloader::new(AssetCache::in_memory(), transport());
        let mut lifecycle = ModelLifecycle::new(engine.clone());
        lifecycle.init_engine().await.unwrap();
        assert!(lifecycle.agent().is_none());

        lifecycle.load_model(&config(), &downloader, &no_progress).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::ModelReady);
        let first = lifecycle.agent().unwrap();

        lifecycle.load_model(&config(), &downloader, &no_progress).await.unwrap();
        let second = lifecycle.agent().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(engine.constructs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_model_assets_download_concurrently() {
        let transport = Arc::new(
            StaticTransport::new()
                .with("https://x/m.bin", b"mmmmmmmmmm")
                .with("https://x/t.bin", b"tttttttttt")
                .with("https://x/c.json", b"{}")
                .with_latency(Duration::from_millis(20)),
        );
        let downloader = AssetDownloader::new(AssetCache::in_memory(), transport.clone());
        let mut lifecycle = ModelLifecycle::new(Arc::new(EchoEngine::default()));
        lifecycle.init_engine().await.unwrap();

        lifecycle.load_model(&config(), &downloader, &no_progress).await.unwrap();
        assert_eq!(transport.calls(), 3);
        assert_eq!(transport.peak_in_flight(), 3);
    }

    #[tokio::test]
    async fn test_missing_asset_moves_to_failed() {
        let engine = Arc::new(EchoEngine::default());
        let transport = Arc::new(StaticTransport::new().with("https://x/m.bin", b"m"));
        let downloader = AssetDownloader::new(AssetCache::in_memory(), transport);
        let mut lifecycle = ModelLifecycle::new(engine.clone());
        lifecycle.init_engine().await.unwrap();

        let err = lifecycle.load_model(&config(), &downloader, &no_progress).await.unwrap_err();
        assert!(matches!(err, WorkerError::Network { status: 404, .. }));
        assert_eq!(lifecycle.state(), LifecycleState::Failed);
        assert!(lifecycle.agent().is_none());
        assert_eq!(engine.constructs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_construction_failure_then_retry() {
        let engine = Arc::new(EchoEngine::default());
        engine.fail_construct.store(true, Ordering::SeqCst);
        let downloader = AssetDownloader::new(AssetCache::in_memory(), transport());
        let mut lifecycle = ModelLifecycle::new(engine.clone());
        lifecycle.init_engine().await.unwrap();

        let err = lifecycle.load_model(&config(), &downloader, &no_progress).await.unwrap_err();
        assert!(matches!(err, WorkerError::Construction(_)));
        assert_eq!(lifecycle.state(), LifecycleState::Failed);

        engine.fail_construct.store(false, Ordering::SeqCst);
        lifecycle.load_model(&config(), &downloader, &no_progress).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::ModelReady);
    }
}
