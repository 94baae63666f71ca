//! Configuration loader and validator for the price watcher.
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::{MAX_FREQUENCY_MINUTES, MIN_FREQUENCY_MINUTES};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub retention: Retention,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Poll scheduler tick.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// Upper bound on pipeline runs driven concurrently by one tick.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Frequency used by `/subscribe` when the user gives none.
    #[serde(default = "default_frequency_minutes")]
    pub default_frequency_minutes: i64,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Empty means everyone may use the bot.
    #[serde(default)]
    pub allowed_users: Vec<i64>,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,
}

/// Wildberries card API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Upstream {
    pub base_url: String,
    pub dest: i64,
    pub spp: i64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            base_url: "https://card.wb.ru/".into(),
            dest: -1257786,
            spp: 27,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

/// Daily cleanup settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Retention {
    /// `HH:MM`, UTC.
    pub run_at: String,
    pub task_log_days: i64,
    pub price_history_depth: i64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            run_at: "03:00".into(),
            task_log_days: 30,
            price_history_depth: 100,
        }
    }
}

impl Retention {
    pub fn run_at_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(self.run_at.trim(), "%H:%M")
            .map_err(|_| ConfigError::Invalid("retention.run_at must be HH:MM"))
    }
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_frequency_minutes() -> i64 {
    60
}

fn default_requests_per_minute() -> usize {
    30
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the default file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/pricewatch.db", self.app.data_dir))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.tick_seconds == 0 {
        return Err(ConfigError::Invalid("app.tick_seconds must be > 0"));
    }
    if cfg.app.max_concurrent_runs == 0 {
        return Err(ConfigError::Invalid("app.max_concurrent_runs must be > 0"));
    }
    if !(MIN_FREQUENCY_MINUTES..=MAX_FREQUENCY_MINUTES).contains(&cfg.app.default_frequency_minutes)
    {
        return Err(ConfigError::Invalid(
            "app.default_frequency_minutes must be within 1..=1440",
        ));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.telegram.requests_per_minute == 0 {
        return Err(ConfigError::Invalid("telegram.requests_per_minute must be > 0"));
    }

    if reqwest::Url::parse(&cfg.upstream.base_url).is_err() {
        return Err(ConfigError::Invalid("upstream.base_url must be a valid URL"));
    }
    if !(1..=5).contains(&cfg.upstream.connect_timeout_secs) {
        return Err(ConfigError::Invalid(
            "upstream.connect_timeout_secs must be within 1..=5",
        ));
    }
    if !(1..=10).contains(&cfg.upstream.request_timeout_secs) {
        return Err(ConfigError::Invalid(
            "upstream.request_timeout_secs must be within 1..=10",
        ));
    }

    cfg.retention.run_at_time()?;
    if cfg.retention.task_log_days <= 0 {
        return Err(ConfigError::Invalid("retention.task_log_days must be > 0"));
    }
    if cfg.retention.price_history_depth <= 0 {
        return Err(ConfigError::Invalid(
            "retention.price_history_depth must be > 0",
        ));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  tick_seconds: 60
  max_concurrent_runs: 4
  default_frequency_minutes: 60

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  allowed_users:
    - 123456789
  requests_per_minute: 30

upstream:
  base_url: "https://card.wb.ru/"
  dest: -1257786
  spp: 27
  connect_timeout_secs: 5
  request_timeout_secs: 10

retention:
  run_at: "03:00"
  task_log_days: 30
  price_history_depth: 100
"#
}
