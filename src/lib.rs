pub mod cache;
pub mod downloader;
pub mod engine;
pub mod envconfig;
pub mod error;
pub mod format;
pub mod lifecycle;
pub mod logging;
pub mod progress;
pub mod protocol;
pub mod router;
pub mod session;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{AssetCache, AssetStore, CacheEntry, DiskStore, MemoryStore};
pub use downloader::{AssetDescriptor, AssetDownloader, ProgressEvent, ProgressKind, Transport};
pub use engine::{Agent, Engine, GenerationOptions, ModelAssets, TokenStream};
pub use envconfig::WorkerConfig;
pub use error::{CacheError, Result, WorkerError};
pub use lifecycle::{LifecycleState, ModelConfig, ModelLifecycle};
pub use protocol::{InboundMessage, OutboundMessage, StreamRequest};
pub use router::{MessageRouter, WorkerSessionContext};
pub use worker::{Worker, WorkerHandle, WorkerSender};
