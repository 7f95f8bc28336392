//! StockWatch configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StockWatchError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StockWatchConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl StockWatchConfig {
    /// Load config from the default path (~/.stockwatch/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StockWatchError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| StockWatchError::Config(format!("Failed to parse config: {e}")))
    }

    /// Override file values with the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(token) = get("BOT_TOKEN").filter(|v| !v.is_empty()) {
            self.telegram.bot_token = token;
        }
        if let Some(expr) = get("CHECK_INTERVAL").filter(|v| !v.is_empty()) {
            self.scheduler.check_interval = expr;
        }
        if let Some(code) = get("PINCODE").filter(|v| !v.is_empty()) {
            self.monitor.default_location = code;
        }
        if let Some(path) = get("STOCKWATCH_DB").filter(|v| !v.is_empty()) {
            self.store.path = Some(path);
        }
    }

    /// Fail early on values that would make the service useless.
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.is_empty() {
            return Err(StockWatchError::Config(
                "telegram.bot_token is empty (set BOT_TOKEN)".into(),
            ));
        }
        if self.scheduler.max_concurrent_probes == 0 {
            return Err(StockWatchError::Config(
                "scheduler.max_concurrent_probes must be at least 1".into(),
            ));
        }
        if self.monitor.max_concurrent_commands == 0 {
            return Err(StockWatchError::Config(
                "monitor.max_concurrent_commands must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the StockWatch home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stockwatch")
    }
}

fn bool_true() -> bool { true }

/// Telegram bot credentials and polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Seconds between getUpdates calls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String { "https://api.telegram.org".into() }
fn default_poll_interval() -> u64 { 1 }
fn default_request_timeout() -> u64 { 10 }

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            poll_interval: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Alert rate limiting and retry queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Minimum gap between two alerts to the same recipient.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Pause between queued retries.
    #[serde(default = "default_drain_delay_ms")]
    pub queue_drain_delay_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_cooldown_ms() -> u64 { 60_000 }
fn default_drain_delay_ms() -> u64 { 1_000 }
fn default_queue_capacity() -> usize { 1_000 }

impl NotifyConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.queue_drain_delay_ms)
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            queue_drain_delay_ms: default_drain_delay_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Availability poll schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 5-field cron expression (MIN HOUR DOM MON DOW).
    #[serde(default = "default_check_interval")]
    pub check_interval: String,
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
    /// Run one tick immediately at startup.
    #[serde(default = "bool_true")]
    pub run_on_start: bool,
}

fn default_check_interval() -> String { "*/10 * * * *".into() }
fn default_max_concurrent_probes() -> usize { 1 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            max_concurrent_probes: default_max_concurrent_probes(),
            run_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Location code used when `/monitor` is given none.
    #[serde(default = "default_location")]
    pub default_location: String,
    /// Chat events handled at once.
    #[serde(default = "default_max_concurrent_commands")]
    pub max_concurrent_commands: usize,
}

fn default_location() -> String { "396191".into() }
fn default_max_concurrent_commands() -> usize { 8 }

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_location: default_location(),
            max_concurrent_commands: default_max_concurrent_commands(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Json,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Database file (sqlite) or directory (json). Unset picks a
    /// per-backend location under the StockWatch home directory.
    #[serde(default)]
    pub path: Option<String>,
}

fn default_backend() -> StoreBackend { StoreBackend::Sqlite }

impl StoreConfig {
    /// Location used when `path` is unset.
    pub fn default_path(&self) -> PathBuf {
        let home = StockWatchConfig::home_dir();
        match self.backend {
            StoreBackend::Sqlite => home.join("stockwatch.db"),
            StoreBackend::Json | StoreBackend::Memory => home,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

/// HTTP availability prober.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Case-insensitive page fragments meaning "not purchasable".
    #[serde(default = "default_unavailable_markers")]
    pub unavailable_markers: Vec<String>,
    /// Query parameter carrying the location code, if the shop takes one.
    #[serde(default)]
    pub location_param: Option<String>,
}

fn default_probe_timeout() -> u64 { 60 }
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".into()
}
fn default_unavailable_markers() -> Vec<String> {
    vec!["sold out".into(), "out of stock".into(), "notify me".into()]
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_probe_timeout(),
            user_agent: default_user_agent(),
            unavailable_markers: default_unavailable_markers(),
            location_param: None,
        }
    }
}
