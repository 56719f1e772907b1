use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Failures surfaced by the worker. Everything except `CacheWrite` ends up
/// in an outbound `error` message; cache write failures are logged only.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("transport error fetching {url}: {message}")]
    Transport { url: String, message: String },

    #[error("failed to fetch {url}: HTTP status {status}")]
    Network { status: u16, url: String },

    #[error("engine not ready: call init_wasm before {operation}")]
    EngineNotReady { operation: &'static str },

    #[error("failed to construct model: {0}")]
    Construction(String),

    #[error("no model loaded")]
    NoAgent,

    #[error("failed to write {url} to cache: {message}")]
    CacheWrite { url: String, message: String },

    #[error("a model load is already in progress")]
    Busy,

    #[error("invalid {command} command: {message}")]
    InvalidCommand { command: String, message: String },

    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("worker has shut down")]
    Closed,
}

impl WorkerError {
    pub fn transport(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            url: url.into(),
            message: err.to_string(),
        }
    }

    pub fn engine(err: impl std::fmt::Display) -> Self {
        Self::Engine(err.to_string())
    }

    pub fn construction(err: impl std::fmt::Display) -> Self {
        Self::Construction(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache record: {0}")]
    Corrupt(String),

    #[error("failed to encode cache header: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_message_names_status_and_url() {
        let err = WorkerError::Network {
            status: 404,
            url: "https://x/m.bin".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("404"));
        assert!(msg.contains("https://x/m.bin"));
    }

    #[test]
    fn test_engine_not_ready_names_operation() {
        let err = WorkerError::EngineNotReady { operation: "load_model" };
        assert_eq!(err.to_string(), "engine not ready: call init_wasm before load_model");
    }
}
