//! Store configuration: defaults, optional `.caskrc` (JSON), env overrides.
//! CLI flags override everything loaded here.

use std::env;
use std::path::{Path, PathBuf};

/// Retry/backoff policy for network calls. All fields are explicit
/// configuration; delay for attempt n is
/// `min_timeout_ms * factor^(n-1)`, clamped to `max_timeout_ms`,
/// plus a small random jitter.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt).
    pub retries: u32,
    /// Exponential backoff factor.
    pub factor: f64,
    /// First backoff delay in milliseconds.
    pub min_timeout_ms: u64,
    /// Backoff delay ceiling in milliseconds.
    pub max_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            factor: 10.0,
            min_timeout_ms: 10_000,
            max_timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay (before jitter) for 1-based retry attempt `n`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let delay = (self.min_timeout_ms as f64) * exp;
        (delay as u64).min(self.max_timeout_ms)
    }
}

/// Configuration for one store controller instance.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Root of the content store + integrity index.
    pub store_dir: PathBuf,
    /// Registry base URL, e.g. `https://registry.npmjs.org`.
    pub registry: String,
    /// Optional bearer token sent on registry requests.
    pub auth_token: Option<String>,
    /// Max concurrent network-bound operations; excess callers queue FIFO.
    pub network_concurrency: usize,
    /// Max concurrent workspace-level operations (uploads, local scans).
    pub workspace_concurrency: usize,
    pub retry: RetryPolicy,
    /// When set, a store miss is an error instead of a network fetch.
    pub offline: bool,
    /// When set, store hits re-check that every indexed blob still exists.
    pub verify_store_integrity: bool,
    /// Whether side-effects cache entries may be written at all.
    pub side_effects_cache: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            registry: "https://registry.npmjs.org".to_string(),
            auth_token: None,
            network_concurrency: 16,
            workspace_concurrency: num_cpus::get().max(1),
            retry: RetryPolicy::default(),
            offline: false,
            verify_store_integrity: true,
            side_effects_cache: true,
        }
    }
}

/// Default store location: CASK_STORE_DIR, else ~/.cask-store.
pub fn default_store_dir() -> PathBuf {
    if let Ok(dir) = env::var("CASK_STORE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cask-store")
}

/// Load config: defaults, then `.caskrc` in `dir` or home, then env.
pub fn load_config(dir: &Path) -> StoreConfig {
    let mut cfg = StoreConfig::default();
    let candidates = [
        Some(dir.join(".caskrc")),
        dirs::home_dir().map(|h| h.join(".caskrc")),
    ];
    for path in candidates.iter().flatten() {
        if !path.is_file() {
            continue;
        }
        if let Ok(s) = std::fs::read_to_string(path) {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&s) {
                apply_file_config(&mut cfg, &v);
            }
        }
        break;
    }
    apply_env_config(&mut cfg);
    cfg
}

fn apply_file_config(cfg: &mut StoreConfig, v: &serde_json::Value) {
    if let Some(s) = v.get("storeDir").and_then(|x| x.as_str()) {
        cfg.store_dir = PathBuf::from(s);
    }
    if let Some(s) = v.get("registry").and_then(|x| x.as_str()) {
        cfg.registry = s.trim_end_matches('/').to_string();
    }
    if let Some(n) = v.get("networkConcurrency").and_then(|x| x.as_u64()) {
        cfg.network_concurrency = (n as usize).clamp(1, 128);
    }
    if let Some(n) = v.get("workspaceConcurrency").and_then(|x| x.as_u64()) {
        cfg.workspace_concurrency = (n as usize).clamp(1, 128);
    }
    if let Some(b) = v.get("offline").and_then(|x| x.as_bool()) {
        cfg.offline = b;
    }
    if let Some(b) = v.get("verifyStoreIntegrity").and_then(|x| x.as_bool()) {
        cfg.verify_store_integrity = b;
    }
    if let Some(b) = v.get("sideEffectsCache").and_then(|x| x.as_bool()) {
        cfg.side_effects_cache = b;
    }
    if let Some(n) = v.get("fetchRetries").and_then(|x| x.as_u64()) {
        cfg.retry.retries = n as u32;
    }
    if let Some(f) = v.get("fetchRetryFactor").and_then(|x| x.as_f64()) {
        cfg.retry.factor = f;
    }
    if let Some(n) = v.get("fetchRetryMintimeout").and_then(|x| x.as_u64()) {
        cfg.retry.min_timeout_ms = n;
    }
    if let Some(n) = v.get("fetchRetryMaxtimeout").and_then(|x| x.as_u64()) {
        cfg.retry.max_timeout_ms = n;
    }
}

fn apply_env_config(cfg: &mut StoreConfig) {
    if let Ok(dir) = env::var("CASK_STORE_DIR") {
        cfg.store_dir = PathBuf::from(dir);
    }
    if let Ok(url) = env::var("CASK_REGISTRY") {
        cfg.registry = url.trim_end_matches('/').to_string();
    }
    if let Ok(token) = env::var("CASK_AUTH_TOKEN") {
        if !token.is_empty() {
            cfg.auth_token = Some(token);
        }
    }
    if let Ok(n) = env::var("CASK_NETWORK_CONCURRENCY") {
        if let Ok(n) = n.parse::<usize>() {
            cfg.network_concurrency = n.clamp(1, 128);
        }
    }
    if env::var("CASK_OFFLINE").map(|v| v == "1" || v == "true").unwrap_or(false) {
        cfg.offline = true;
    }
}

/// Settings for one server instance.
#[derive(Clone, Debug, Default)]
pub struct ServerSettings {
    pub hostname: String,
    pub port: u16,
    /// POST /stop answers 403 and the server keeps listening.
    pub ignore_stop_requests: bool,
    /// POST /upload answers 403 and no store mutation happens.
    pub ignore_upload_requests: bool,
}

impl ServerSettings {
    pub fn new(hostname: &str, port: u16) -> Self {
        Self {
            hostname: hostname.to_string(),
            port,
            ignore_stop_requests: false,
            ignore_upload_requests: false,
        }
    }
}
