//! sqsd configuration.
//!
//! A single flat [`SqsdConfig`] loaded from TOML with `SQSD_*` environment
//! overrides. Every option has a default except `queue_url`. Startup calls
//! [`SqsdConfig::validate`] and treats any error as fatal.

use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid queue URL '{0}': cannot derive region")]
    InvalidQueueUrl(String),
}

/// Hard ceiling on messages per receive or batch delete call.
pub const SQS_BATCH_LIMIT: usize = 10;

/// Largest accepted value for any timer option, in seconds (ten years).
pub const MAX_TIMER_SECS: f64 = 315_360_000.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqsdConfig {
    /// Queue to consume. Required.
    pub queue_url: String,
    /// Region override. Derived from `queue_url` when absent.
    pub region: Option<String>,
    /// Endpoint override for local stacks.
    pub endpoint_url: Option<String>,

    pub http_url: String,
    pub http_port: u16,
    pub http_path: String,
    pub mime_type: String,
    /// Size of the outbound connection pool.
    pub http_connections: usize,
    /// Size of the background worker pool for queue and store calls.
    pub threads: usize,
    pub connect_timeout: f64,
    /// Idle/response timeout on dispatch. Defaults to `visibility_timeout`.
    pub inactivity_timeout: Option<f64>,
    pub keepalive: bool,

    pub visibility_timeout: u64,
    pub retention_period: u64,
    /// Visibility applied to failed messages. `false` or negative disables.
    #[serde(deserialize_with = "false_or_visibility")]
    pub error_visibility_timeout: Option<u32>,
    pub via_sns: bool,

    pub dedup: bool,
    pub dedup_table: Option<String>,
    /// Per-attempt timeout on dedup store calls.
    pub store_timeout: f64,
    /// Timeout on each queue call. Receives get the long-poll wait on top.
    pub queue_timeout: f64,

    pub sqs_batch_delete: bool,
    pub sqs_batch_delete_size: usize,
    pub batch_delete_timer: f64,
    pub poll_timer: f64,
    pub drain_timeout: f64,
    pub drain_check_interval: f64,
    pub idle_mode_delay: f64,
    /// Explicit backlog target. `false` enables autotuning.
    #[serde(deserialize_with = "false_or_count")]
    pub backlog_size: Option<usize>,
    pub autotuning_threshold_slow: f64,
    pub autotuning_threshold_slowest: f64,
    pub sqs_wait_time_seconds: u32,
    pub sqs_max_wait_time_seconds: u32,
    pub sqs_max_batch_size: usize,
    /// Poller fan-out. Autotuned when absent.
    pub concurrent_sqs_polls: Option<usize>,
    pub poll_mode_switch_interval: f64,

    /// Path to a `cron.yaml` schedule. Enables the scheduler.
    pub schedule_file: Option<PathBuf>,
    pub leader_redis_url: Option<String>,
    pub leader_lock_key: String,
    pub leader_ttl: u64,

    pub verbose: bool,
    pub debug: bool,
    pub quiet: bool,
}

impl Default for SqsdConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            region: None,
            endpoint_url: None,
            http_url: "http://localhost".to_string(),
            http_port: 80,
            http_path: "/".to_string(),
            mime_type: "application/json".to_string(),
            http_connections: 16,
            threads: 30,
            connect_timeout: 5.0,
            inactivity_timeout: None,
            keepalive: true,
            visibility_timeout: 300,
            retention_period: 345_600,
            error_visibility_timeout: None,
            via_sns: false,
            dedup: false,
            dedup_table: None,
            store_timeout: 5.0,
            queue_timeout: 10.0,
            sqs_batch_delete: true,
            sqs_batch_delete_size: 10,
            batch_delete_timer: 2.0,
            poll_timer: 0.15,
            drain_timeout: 600.0,
            drain_check_interval: 1.0,
            idle_mode_delay: 30.0,
            backlog_size: None,
            autotuning_threshold_slow: 1.0,
            autotuning_threshold_slowest: 15.0,
            sqs_wait_time_seconds: 20,
            sqs_max_wait_time_seconds: 20,
            sqs_max_batch_size: SQS_BATCH_LIMIT,
            concurrent_sqs_polls: None,
            poll_mode_switch_interval: 10.0,
            schedule_file: None,
            leader_redis_url: None,
            leader_lock_key: "sqsd:scheduler:leader".to_string(),
            leader_ttl: 30,
            verbose: false,
            debug: false,
            quiet: false,
        }
    }
}

impl SqsdConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Check the fatal error classes. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_url.trim().is_empty() {
            return Err(ConfigError::ValidationError("queue_url is required".into()));
        }
        self.region()?;

        if self.http_connections == 0 {
            return Err(invalid("http_connections must be at least 1"));
        }
        if self.threads == 0 {
            return Err(invalid("threads must be at least 1"));
        }
        if !(1..=SQS_BATCH_LIMIT).contains(&self.sqs_max_batch_size) {
            return Err(invalid("sqs_max_batch_size must be between 1 and 10"));
        }
        if !(1..=SQS_BATCH_LIMIT).contains(&self.sqs_batch_delete_size) {
            return Err(invalid("sqs_batch_delete_size must be between 1 and 10"));
        }
        if matches!(self.backlog_size, Some(0)) {
            return Err(invalid("backlog_size must be positive or false"));
        }
        if matches!(self.concurrent_sqs_polls, Some(0)) {
            return Err(invalid("concurrent_sqs_polls must be at least 1"));
        }
        for (name, value) in [
            ("poll_timer", self.poll_timer),
            ("batch_delete_timer", self.batch_delete_timer),
            ("drain_check_interval", self.drain_check_interval),
            ("connect_timeout", self.connect_timeout),
            ("store_timeout", self.store_timeout),
            ("queue_timeout", self.queue_timeout),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be positive",
                    name
                )));
            }
        }
        if self.drain_timeout < 0.0 {
            return Err(invalid("drain_timeout must not be negative"));
        }
        for (name, value) in [
            ("poll_timer", self.poll_timer),
            ("batch_delete_timer", self.batch_delete_timer),
            ("drain_check_interval", self.drain_check_interval),
            ("connect_timeout", self.connect_timeout),
            ("store_timeout", self.store_timeout),
            ("queue_timeout", self.queue_timeout),
            ("drain_timeout", self.drain_timeout),
            ("idle_mode_delay", self.idle_mode_delay),
            ("autotuning_threshold_slow", self.autotuning_threshold_slow),
            ("autotuning_threshold_slowest", self.autotuning_threshold_slowest),
            ("poll_mode_switch_interval", self.poll_mode_switch_interval),
            ("inactivity_timeout", self.inactivity_timeout.unwrap_or(0.0)),
        ] {
            if !(value <= MAX_TIMER_SECS) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must not exceed {} seconds",
                    name, MAX_TIMER_SECS
                )));
            }
        }
        if self.autotuning_threshold_slow > self.autotuning_threshold_slowest {
            return Err(invalid(
                "autotuning_threshold_slow must not exceed autotuning_threshold_slowest",
            ));
        }
        if self.dedup && self.dedup_table.as_deref().map_or(true, str::is_empty) {
            return Err(invalid("dedup requires dedup_table"));
        }
        Ok(())
    }

    /// Region from configuration, or parsed out of the queue URL.
    pub fn region(&self) -> Result<String, ConfigError> {
        if let Some(region) = self.region.as_deref().filter(|r| !r.is_empty()) {
            return Ok(region.to_string());
        }
        region_from_queue_url(&self.queue_url)
            .ok_or_else(|| ConfigError::InvalidQueueUrl(self.queue_url.clone()))
    }

    /// Poller fan-out before any autotuning.
    pub fn effective_concurrent_sqs_polls(&self) -> usize {
        self.concurrent_sqs_polls
            .unwrap_or_else(|| ((self.http_connections as f64 / 2.5).max(1.0)).ceil() as usize)
    }

    /// Dispatch target without the path, e.g. `http://localhost:80`.
    pub fn http_base_url(&self) -> String {
        format!("{}:{}", self.http_url.trim_end_matches('/'), self.http_port)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        secs(
            self.inactivity_timeout
                .unwrap_or(self.visibility_timeout as f64),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_timer)
    }

    pub fn batch_delete_interval(&self) -> Duration {
        secs(self.batch_delete_timer)
    }

    pub fn drain_deadline(&self) -> Duration {
        secs(self.drain_timeout)
    }

    pub fn drain_check(&self) -> Duration {
        secs(self.drain_check_interval)
    }

    pub fn idle_delay(&self) -> Duration {
        secs(self.idle_mode_delay)
    }

    pub fn mode_switch_interval(&self) -> Duration {
        secs(self.poll_mode_switch_interval)
    }

    pub fn store_attempt_timeout(&self) -> Duration {
        secs(self.store_timeout)
    }

    pub fn queue_call_timeout(&self) -> Duration {
        secs(self.queue_timeout)
    }

    pub fn slow_threshold(&self) -> Duration {
        secs(self.autotuning_threshold_slow)
    }

    pub fn slowest_threshold(&self) -> Duration {
        secs(self.autotuning_threshold_slowest)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_period)
    }

    pub fn visibility(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout)
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::ValidationError(msg.to_string())
}

/// Negative, non-finite and out-of-range values map to zero; `validate`
/// rejects the ones that matter.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Extract the region from an SQS queue URL.
pub fn region_from_queue_url(queue_url: &str) -> Option<String> {
    let pattern = Regex::new(r"sqs\.(.*?)\.amazonaws\.com").ok()?;
    pattern
        .captures(queue_url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|r| !r.is_empty())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FalseOr {
    Flag(bool),
    Number(i64),
}

fn false_or_count<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    match FalseOr::deserialize(deserializer)? {
        FalseOr::Flag(false) => Ok(None),
        FalseOr::Flag(true) => Err(serde::de::Error::custom(
            "expected false or a positive integer",
        )),
        FalseOr::Number(n) if n < 0 => Err(serde::de::Error::custom(
            "expected false or a positive integer",
        )),
        FalseOr::Number(n) => Ok(Some(n as usize)),
    }
}

fn false_or_visibility<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match FalseOr::deserialize(deserializer)? {
        FalseOr::Flag(false) => Ok(None),
        FalseOr::Flag(true) => Err(serde::de::Error::custom(
            "expected false or a number of seconds",
        )),
        FalseOr::Number(n) if n < 0 => Ok(None),
        FalseOr::Number(n) => u32::try_from(n)
            .map(Some)
            .map_err(|_| serde::de::Error::custom("visibility timeout out of range")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "https://sqs.eu-west-1.amazonaws.com/123456789012/work";

    #[test]
    fn test_defaults() {
        let config = SqsdConfig::default();
        assert_eq!(config.http_connections, 16);
        assert_eq!(config.threads, 30);
        assert_eq!(config.visibility_timeout, 300);
        assert_eq!(config.retention_period, 345_600);
        assert!(config.sqs_batch_delete);
        assert_eq!(config.poll_interval(), Duration::from_millis(150));
        assert_eq!(config.backlog_size, None);
        assert_eq!(config.error_visibility_timeout, None);
        assert_eq!(config.inactivity_timeout(), Duration::from_secs(300));
        // ceil(16 / 2.5)
        assert_eq!(config.effective_concurrent_sqs_polls(), 7);
    }

    #[test]
    fn test_poller_default_has_floor_of_one() {
        let config = SqsdConfig {
            http_connections: 1,
            ..SqsdConfig::default()
        };
        assert_eq!(config.effective_concurrent_sqs_polls(), 1);
    }

    #[test]
    fn test_false_or_number_options() {
        let config = SqsdConfig::from_toml(&format!(
            "queue_url = \"{}\"\nbacklog_size = 5\nerror_visibility_timeout = 30\n",
            QUEUE
        ))
        .unwrap();
        assert_eq!(config.backlog_size, Some(5));
        assert_eq!(config.error_visibility_timeout, Some(30));

        let config = SqsdConfig::from_toml(
            "backlog_size = false\nerror_visibility_timeout = -1\n",
        )
        .unwrap();
        assert_eq!(config.backlog_size, None);
        assert_eq!(config.error_visibility_timeout, None);

        assert!(SqsdConfig::from_toml("backlog_size = true\n").is_err());
    }

    #[test]
    fn test_region_from_queue_url() {
        assert_eq!(region_from_queue_url(QUEUE).as_deref(), Some("eu-west-1"));
        assert_eq!(region_from_queue_url("http://localhost:4566/000/q"), None);
    }

    #[test]
    fn test_explicit_region_wins() {
        let config = SqsdConfig {
            queue_url: "http://localhost:4566/000000000000/q".into(),
            region: Some("us-east-1".into()),
            ..SqsdConfig::default()
        };
        assert_eq!(config.region().unwrap(), "us-east-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        assert!(matches!(
            SqsdConfig::default().validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let bad_url = SqsdConfig {
            queue_url: "not-a-queue".into(),
            ..SqsdConfig::default()
        };
        assert!(matches!(
            bad_url.validate(),
            Err(ConfigError::InvalidQueueUrl(_))
        ));

        let dedup_without_table = SqsdConfig {
            queue_url: QUEUE.into(),
            dedup: true,
            ..SqsdConfig::default()
        };
        assert!(dedup_without_table.validate().is_err());

        let oversized_batch = SqsdConfig {
            queue_url: QUEUE.into(),
            sqs_batch_delete_size: 11,
            ..SqsdConfig::default()
        };
        assert!(oversized_batch.validate().is_err());
    }

    #[test]
    fn test_huge_timers_are_rejected() {
        let huge_drain = SqsdConfig {
            queue_url: QUEUE.into(),
            drain_timeout: 1e20,
            ..SqsdConfig::default()
        };
        assert!(matches!(
            huge_drain.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        // Accessors never panic, even on unvalidated values.
        assert_eq!(huge_drain.drain_deadline(), Duration::ZERO);

        let infinite_inactivity = SqsdConfig {
            queue_url: QUEUE.into(),
            inactivity_timeout: Some(f64::INFINITY),
            ..SqsdConfig::default()
        };
        assert!(infinite_inactivity.validate().is_err());

        let year_long_drain = SqsdConfig {
            queue_url: QUEUE.into(),
            drain_timeout: 31_536_000.0,
            ..SqsdConfig::default()
        };
        assert!(year_long_drain.validate().is_ok());
        assert_eq!(year_long_drain.drain_deadline(), Duration::from_secs(31_536_000));
    }

    #[test]
    fn test_queue_timeout() {
        assert_eq!(SqsdConfig::default().queue_call_timeout(), Duration::from_secs(10));
        let zero = SqsdConfig {
            queue_url: QUEUE.into(),
            queue_timeout: 0.0,
            ..SqsdConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_http_base_url() {
        let config = SqsdConfig {
            http_url: "http://127.0.0.1/".into(),
            http_port: 8080,
            ..SqsdConfig::default()
        };
        assert_eq!(config.http_base_url(), "http://127.0.0.1:8080");
    }
}
