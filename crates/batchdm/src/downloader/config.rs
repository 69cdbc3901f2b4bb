//! Configuration types for the download manager

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio_retry::strategy::FibonacciBackoff;
use tracing::debug;

use crate::downloader::core::{DownloadError, HashAlgorithm, Result};

/// Configuration for one scheduler and its transfer engine
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Concurrency bound of the engine
    pub max_concurrent_downloads: usize,
    /// Automatic retries for transient errors
    pub max_retries: usize,
    /// First delay between retries (grows along a Fibonacci sequence)
    pub retry_delay: Duration,
    /// Maximum retry delay cap
    pub max_retry_delay: Duration,
    pub connect_timeout: Duration,
    /// A transfer that receives nothing for this long is treated as a transient failure
    pub idle_timeout: Duration,
    pub user_agent: String,
    pub allow_resume: bool,
    /// Complete without transferring when the destination already verifies
    pub skip_existing: bool,
    /// Default algorithm; a descriptor's own algorithm wins
    pub hash_algorithm: HashAlgorithm,
    /// Granularity of progress callbacks, in percent
    pub progress_step_percent: f32,
    /// Sliding window for rate and ETA
    pub rate_window: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 4,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            user_agent: format!("batchdm/{}", env!("CARGO_PKG_VERSION")),
            allow_resume: true,
            skip_existing: true,
            hash_algorithm: HashAlgorithm::Md5,
            progress_step_percent: 1.0,
            rate_window: Duration::from_secs(5),
        }
    }
}

impl DownloadConfig {
    pub fn builder() -> DownloadConfigBuilder {
        DownloadConfigBuilder::default()
    }

    /// Delays between successive retries
    pub fn retry_delays(&self) -> impl Iterator<Item = Duration> {
        FibonacciBackoff::from_millis(self.retry_delay.as_millis() as u64).max_delay(self.max_retry_delay)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(invalid(
                "max_concurrent_downloads",
                "concurrency bound must be at least 1",
                "Set max_concurrent_downloads to 1 or more",
            ));
        }
        if !(self.progress_step_percent > 0.0 && self.progress_step_percent <= 100.0) {
            return Err(invalid(
                "progress_step_percent",
                "progress step must be within (0, 100]",
                "Use a step such as 1.0 or 5.0",
            ));
        }
        if self.rate_window.is_zero() {
            return Err(invalid(
                "rate_window",
                "rate window must not be zero",
                "Use a window of a few seconds",
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(invalid(
                "idle_timeout",
                "idle timeout must not be zero",
                "Use a timeout of several seconds",
            ));
        }
        Ok(())
    }

    /// Load from a JSON file; absent keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DownloadError::fs(path, crate::downloader::core::FileOperation::Read, e)
        })?;
        let file: ConfigFile = serde_json::from_str(&text).map_err(|e| DownloadError::Configuration {
            message: format!("{}: {}", path.display(), e),
            field: None,
            suggestion: Some("Check the JSON syntax and key names".to_string()),
        })?;
        let config = file.apply(Self::default());
        config.validate()?;
        debug!("Loaded download config from {}", path.display());
        Ok(config)
    }

    /// Defaults overridden by `BATCHDM_*` variables, reading `.env` if present
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let config = Self::default().apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("BATCHDM_MAX_CONCURRENT") {
            self.max_concurrent_downloads = parse_env("BATCHDM_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = lookup("BATCHDM_MAX_RETRIES") {
            self.max_retries = parse_env("BATCHDM_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("BATCHDM_IDLE_TIMEOUT_MS") {
            self.idle_timeout = Duration::from_millis(parse_env("BATCHDM_IDLE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("BATCHDM_HASH_ALGORITHM") {
            self.hash_algorithm = v.parse()?;
        }
        if let Some(v) = lookup("BATCHDM_USER_AGENT") {
            self.user_agent = v;
        }
        Ok(self)
    }
}

fn invalid(field: &str, message: &str, suggestion: &str) -> DownloadError {
    DownloadError::Configuration {
        message: message.to_string(),
        field: Some(field.to_string()),
        suggestion: Some(suggestion.to_string()),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| DownloadError::Configuration {
        message: format!("{} has unparseable value '{}'", key, value),
        field: Some(key.to_string()),
        suggestion: Some("Use a plain non-negative integer".to_string()),
    })
}

/// On-disk shape of the configuration, durations in milliseconds
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    max_concurrent_downloads: Option<usize>,
    max_retries: Option<usize>,
    retry_delay_ms: Option<u64>,
    max_retry_delay_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    user_agent: Option<String>,
    allow_resume: Option<bool>,
    skip_existing: Option<bool>,
    hash_algorithm: Option<HashAlgorithm>,
    progress_step_percent: Option<f32>,
    rate_window_ms: Option<u64>,
}

impl ConfigFile {
    fn apply(self, mut config: DownloadConfig) -> DownloadConfig {
        if let Some(v) = self.max_concurrent_downloads {
            config.max_concurrent_downloads = v;
        }
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.retry_delay_ms {
            config.retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.max_retry_delay_ms {
            config.max_retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.idle_timeout_ms {
            config.idle_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.user_agent {
            config.user_agent = v;
        }
        if let Some(v) = self.allow_resume {
            config.allow_resume = v;
        }
        if let Some(v) = self.skip_existing {
            config.skip_existing = v;
        }
        if let Some(v) = self.hash_algorithm {
            config.hash_algorithm = v;
        }
        if let Some(v) = self.progress_step_percent {
            config.progress_step_percent = v;
        }
        if let Some(v) = self.rate_window_ms {
            config.rate_window = Duration::from_millis(v);
        }
        config
    }
}

/// Fluent builder; `build()` validates
#[derive(Debug, Default)]
pub struct DownloadConfigBuilder {
    config: DownloadConfig,
}

impl DownloadConfigBuilder {
    pub fn max_concurrent_downloads(mut self, n: usize) -> Self {
        self.config.max_concurrent_downloads = n;
        self
    }

    pub fn max_retries(mut self, n: usize) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay = delay;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    pub fn allow_resume(mut self, allow: bool) -> Self {
        self.config.allow_resume = allow;
        self
    }

    pub fn skip_existing(mut self, skip: bool) -> Self {
        self.config.skip_existing = skip;
        self
    }

    pub fn hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.config.hash_algorithm = algorithm;
        self
    }

    pub fn progress_step_percent(mut self, step: f32) -> Self {
        self.config.progress_step_percent = step;
        self
    }

    pub fn rate_window(mut self, window: Duration) -> Self {
        self.config.rate_window = window;
        self
    }

    pub fn build(self) -> Result<DownloadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
