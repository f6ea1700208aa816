use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Upstream endpoints — fixed; the gateway fronts exactly one service.
pub const ASSISTANT_URL: &str = "https://q.us-east-1.amazonaws.com/generateAssistantResponse";
pub const MODELS_URL: &str = "https://q.us-east-1.amazonaws.com/ListAvailableModels";

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Client version embedded in the upstream user-agent string.
pub const CLIENT_VERSION: &str = "0.8.0";

/// Upstream request timeout for streaming dispatches (seconds).
pub const STREAM_TIMEOUT_SECS: u64 = 300;
/// Upstream request timeout for buffered dispatches (seconds).
pub const BUFFERED_TIMEOUT_SECS: u64 = 120;
/// Timeout for the model-list health probe (seconds).
pub const PROBE_TIMEOUT_SECS: u64 = 30;

/// Top-level service config (krelay.toml + KRELAY_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: RateLimitSettings,
    #[serde(default)]
    pub history: HistorySettings,
    /// Persisted accounts list (JSON). Rewritten on every pool mutation.
    #[serde(default = "default_accounts_path")]
    pub accounts_path: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: RateLimitSettings::default(),
            history: HistorySettings::default(),
            accounts_path: default_accounts_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Request pacing knobs. All runtime-updatable through the limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Minimum gap between two requests on the same credential (seconds).
    #[serde(default = "default_min_interval")]
    pub min_request_interval_secs: f64,
    /// Per-credential requests per minute. 0 disables the cap.
    #[serde(default = "default_account_rpm")]
    pub account_requests_per_minute: u32,
    /// Whole-gateway requests per minute. 0 disables the cap.
    #[serde(default = "default_global_rpm")]
    pub global_requests_per_minute: u32,
    /// Cooldown applied to a credential after a quota signal (seconds).
    #[serde(default = "default_cooldown")]
    pub quota_cooldown_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            min_request_interval_secs: default_min_interval(),
            account_requests_per_minute: default_account_rpm(),
            global_requests_per_minute: default_global_rpm(),
            quota_cooldown_secs: default_cooldown(),
        }
    }
}

/// How prior turns are compacted before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactionStrategy {
    /// Drop oldest turn pairs until under budget.
    TruncateHead,
    /// Summarize dropped turns with a fast model, keep the tail verbatim.
    SummarizeHead,
    /// Truncate up front; summarize only when the upstream rejects for length.
    SummarizeOnErrorOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySettings {
    /// Estimated character budget for history + current message.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// Turn-count ceiling; compaction triggers above this even under the
    /// char budget.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_strategy")]
    pub strategy: CompactionStrategy,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            max_turns: default_max_turns(),
            strategy: default_strategy(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_min_interval() -> f64 {
    1.0
}
fn default_account_rpm() -> u32 {
    30
}
fn default_global_rpm() -> u32 {
    120
}
fn default_cooldown() -> u64 {
    300
}
fn default_max_chars() -> usize {
    120_000
}
fn default_max_turns() -> usize {
    40
}
fn default_strategy() -> CompactionStrategy {
    CompactionStrategy::TruncateHead
}
fn default_accounts_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.krelay/accounts.json", home)
}

impl ServiceConfig {
    /// Load config from a TOML file with KRELAY_* env var overrides.
    /// A missing file yields the defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ServiceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("KRELAY_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.krelay/krelay.toml", home)
}

/// One persisted credential entry. Tokens themselves live behind
/// `token_path`; this file only records identity and the admin toggle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountEntry {
    pub id: String,
    pub name: String,
    pub token_path: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

fn bool_true() -> bool {
    true
}

/// Load the accounts list. A missing file is an empty pool, not an error.
pub fn load_accounts(path: &str) -> crate::error::Result<Vec<AccountEntry>> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_str(&data)?)
}

/// Rewrite the accounts list after a pool mutation.
pub fn save_accounts(path: &str, accounts: &[AccountEntry]) -> crate::error::Result<()> {
    if let Some(dir) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(accounts)?;
    std::fs::write(path, json)?;
    Ok(())
}
