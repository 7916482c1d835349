//! Configuration management for Jobkeeper.
//!
//! Configuration can be built in code, loaded from a TOML file, or read from
//! `JOBKEEPER_*` environment variables. Durations are written as human-readable
//! strings (`"250ms"`, `"30s"`, `"5m"`, `"24h"`); bare numbers are seconds.

use crate::{job::JobDefaults, priority::Priority, retry::BackoffPolicy, scheduler::SchedulerSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serializes `std::time::Duration` as a human-readable string.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    pub fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        if duration.subsec_nanos() != 0 {
            format!("{}ms", duration.as_millis())
        } else if secs == 0 {
            "0s".to_string()
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    /// Parses "250ms", "30s", "5m", "1h", "2d" or a bare number of seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(millis) = s.strip_suffix("ms") {
            return millis
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| format!("Invalid number in duration: {}", millis));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        match suffix {
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            "d" => Ok(Duration::from_secs(num * 86400)),
            _ => Err(format!(
                "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                suffix
            )),
        }
    }
}

/// Same as [`duration_secs`] for optional durations.
pub(crate) mod option_duration_secs {
    use super::duration_secs::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        Option::<String>::deserialize(deserializer)?
            .map(|s| parse_duration(&s).map_err(D::Error::custom))
            .transpose()
    }
}

/// Top-level configuration.
///
/// ```rust
/// use jobkeeper::config::JobkeeperConfig;
/// use std::time::Duration;
///
/// let config = JobkeeperConfig::new()
///     .with_max_concurrent_jobs(8)
///     .with_poll_interval(Duration::from_secs(1))
///     .with_store_url("redis://localhost:6379/0");
///
/// assert_eq!(config.processor.max_concurrent_jobs, 8);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct JobkeeperConfig {
    pub processor: ProcessorConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl JobkeeperConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_jobs(mut self, max_concurrent_jobs: usize) -> Self {
        self.processor.max_concurrent_jobs = max_concurrent_jobs;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.processor.poll_interval = interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.processor.default_timeout = timeout;
        self
    }

    pub fn with_store_url(mut self, url: &str) -> Self {
        self.store.backend = StoreBackend::Redis;
        self.store.url = Some(url.to_string());
        self
    }

    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.processor.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Starts from defaults and overrides whatever `JOBKEEPER_*` variables are set.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("JOBKEEPER_MAX_CONCURRENT_JOBS") {
            config.processor.max_concurrent_jobs = parse_env("JOBKEEPER_MAX_CONCURRENT_JOBS", &value)?;
        }
        if let Ok(value) = std::env::var("JOBKEEPER_POLL_INTERVAL_MS") {
            let millis: u64 = parse_env("JOBKEEPER_POLL_INTERVAL_MS", &value)?;
            config.processor.poll_interval = Duration::from_millis(millis);
        }
        if let Ok(value) = std::env::var("JOBKEEPER_DEFAULT_TIMEOUT_SECONDS") {
            let seconds: u64 = parse_env("JOBKEEPER_DEFAULT_TIMEOUT_SECONDS", &value)?;
            config.processor.default_timeout = Duration::from_secs(seconds);
        }
        if let Ok(value) = std::env::var("JOBKEEPER_DEFAULT_MAX_RETRIES") {
            config.processor.default_max_retries = parse_env("JOBKEEPER_DEFAULT_MAX_RETRIES", &value)?;
        }
        if let Ok(url) = std::env::var("JOBKEEPER_STORE_URL") {
            config.store.backend = StoreBackend::Redis;
            config.store.url = Some(url);
        }
        if let Ok(level) = std::env::var("JOBKEEPER_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.processor.validate()?;
        Ok(config)
    }

    pub fn development() -> Self {
        Self {
            processor: ProcessorConfig {
                max_concurrent_jobs: 2,
                poll_interval: Duration::from_millis(500),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            processor: ProcessorConfig {
                max_concurrent_jobs: 16,
                backoff: BackoffPolicy::default().with_max_delay(Duration::from_secs(3600)),
                ..Default::default()
            },
            store: StoreConfig {
                backend: StoreBackend::Redis,
                url: Some("redis://127.0.0.1:6379/0".to_string()),
                key_prefix: "jobkeeper:".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: true,
                ..Default::default()
            },
            metrics: MetricsConfig {
                enabled: true,
                ..Default::default()
            },
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| crate::JobkeeperError::Config(format!("Invalid value for {}: {}", name, value)))
}

/// Scheduler and job default settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Maximum number of jobs executing at once
    pub max_concurrent_jobs: usize,

    /// How often the scheduler polls for eligible jobs
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    /// Priority for jobs created without one
    pub default_priority: Priority,

    /// Retry budget for jobs created without one
    pub default_max_retries: u32,

    /// Per-attempt timeout for jobs created without one
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,

    /// Expiry of job records in the store
    #[serde(with = "duration_secs")]
    pub job_ttl: Duration,

    /// Delay between failed attempts
    pub backoff: BackoffPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            poll_interval: Duration::from_secs(5),
            default_priority: Priority::default(),
            default_max_retries: 3,
            default_timeout: Duration::from_secs(300),
            job_ttl: Duration::from_secs(24 * 3600),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> crate::Result<()> {
        self.scheduler_settings().validate()
    }

    pub fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            priority: self.default_priority,
            max_retries: self.default_max_retries,
            timeout: self.default_timeout,
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent_jobs: self.max_concurrent_jobs,
            poll_interval: self.poll_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Connection URL for network-backed stores
    pub url: Option<String>,

    /// Prepended to every key
    pub key_prefix: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (overridden by `RUST_LOG`)
    pub level: String,

    /// Emit structured JSON lines instead of human-readable output
    pub json_format: bool,

    /// Include file and line information
    pub include_location: bool,

    /// Service name attached to every log line
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
            service_name: "jobkeeper".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,

    /// Prefix for every exported metric name
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "jobkeeper".to_string(),
        }
    }
}
