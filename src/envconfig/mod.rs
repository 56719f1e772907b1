use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STORE_NAME: &str = "phi-model-cache";
pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const DEFAULT_TOKEN_DELAY_MS: u64 = 50;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub cache_dir: PathBuf,
    pub store_name: String,
    pub persistent_cache: bool,
    pub max_redirects: usize,
    pub user_agent: String,
    /// Pause between words of the canned reply for image prompts.
    pub fallback_token_delay: Duration,
    /// Reply with an `error` message to unknown command tags instead of
    /// logging and dropping them.
    pub reject_unknown_commands: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            store_name: DEFAULT_STORE_NAME.to_string(),
            persistent_cache: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: format!("phi-worker/{}", env!("CARGO_PKG_VERSION")),
            fallback_token_delay: Duration::from_millis(DEFAULT_TOKEN_DELAY_MS),
            reject_unknown_commands: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("PHI_WORKER_CACHE_DIR") {
            config.cache_dir = expand_home(&dir);
        }

        if let Ok(name) = env::var("PHI_WORKER_STORE") {
            if !name.trim().is_empty() {
                config.store_name = name.trim().to_string();
            }
        }

        if let Some(persistent) = env_flag("PHI_WORKER_PERSISTENT_CACHE") {
            config.persistent_cache = persistent;
        }

        if let Ok(n) = env::var("PHI_WORKER_MAX_REDIRECTS") {
            if let Ok(n) = n.parse() {
                config.max_redirects = n;
            }
        }

        if let Ok(ua) = env::var("PHI_WORKER_USER_AGENT") {
            config.user_agent = ua;
        }

        if let Ok(ms) = env::var("PHI_WORKER_TOKEN_DELAY_MS") {
            if let Ok(ms) = ms.parse() {
                config.fallback_token_delay = Duration::from_millis(ms);
            }
        }

        if let Some(strict) = env_flag("PHI_WORKER_STRICT") {
            config.reject_unknown_commands = strict;
        }

        config
    }

    /// Directory holding the named persistent store.
    pub fn store_dir(&self) -> PathBuf {
        self.cache_dir.join(&self.store_name)
    }
}

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("phi-worker")
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn env_flag(name: &str) -> Option<bool> {
    parse_flag(&env::var(name).ok()?)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
