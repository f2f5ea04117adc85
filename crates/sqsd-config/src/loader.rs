//! Configuration loader with file and environment variable support

use crate::{ConfigError, SqsdConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "sqsd.toml",
    "./config/sqsd.toml",
    "/etc/aws-sqsd.d/default.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides.
    ///
    /// Does not validate; the caller decides when a bad config is fatal.
    pub fn load(&self) -> Result<SqsdConfig, ConfigError> {
        let mut config = match self.find_config_file()? {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                SqsdConfig::from_file(&path)?
            }
            None => SqsdConfig::default(),
        };

        apply_env_overrides(&mut config);
        Ok(config)
    }

    fn find_config_file(&self) -> Result<Option<PathBuf>, ConfigError> {
        // An explicit path that does not exist is an error, not a fallback.
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::ValidationError(format!(
                "config file {} not found",
                path.display()
            )));
        }

        if let Ok(path) = env::var("SQSD_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
            warn!(?path, "SQSD_CONFIG points to a missing file, ignoring");
        }

        Ok(CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()))
    }
}

fn apply_env_overrides(config: &mut SqsdConfig) {
    // Queue
    if let Ok(val) = env::var("SQSD_QUEUE_URL") {
        config.queue_url = val;
    }
    if let Ok(val) = env::var("SQSD_REGION") {
        config.region = Some(val);
    }
    if let Ok(val) = env::var("SQSD_ENDPOINT_URL") {
        config.endpoint_url = Some(val);
    }

    // Local application
    if let Ok(val) = env::var("SQSD_HTTP_URL") {
        config.http_url = val;
    }
    parsed("SQSD_HTTP_PORT", &mut config.http_port);
    if let Ok(val) = env::var("SQSD_HTTP_PATH") {
        config.http_path = val;
    }
    if let Ok(val) = env::var("SQSD_MIME_TYPE") {
        config.mime_type = val;
    }
    parsed("SQSD_HTTP_CONNECTIONS", &mut config.http_connections);
    parsed("SQSD_THREADS", &mut config.threads);
    parsed("SQSD_CONNECT_TIMEOUT", &mut config.connect_timeout);
    parsed_option("SQSD_INACTIVITY_TIMEOUT", &mut config.inactivity_timeout);
    parsed("SQSD_KEEPALIVE", &mut config.keepalive);

    // Message handling
    parsed("SQSD_VISIBILITY_TIMEOUT", &mut config.visibility_timeout);
    parsed("SQSD_RETENTION_PERIOD", &mut config.retention_period);
    if let Ok(val) = env::var("SQSD_ERROR_VISIBILITY_TIMEOUT") {
        config.error_visibility_timeout = val.parse::<i64>().ok().and_then(|v| u32::try_from(v).ok());
    }
    parsed("SQSD_VIA_SNS", &mut config.via_sns);

    // Dedup
    parsed("SQSD_DEDUP", &mut config.dedup);
    if let Ok(val) = env::var("SQSD_DEDUP_TABLE") {
        config.dedup_table = Some(val);
    }

    // Polling and acknowledgment
    parsed("SQSD_SQS_BATCH_DELETE", &mut config.sqs_batch_delete);
    parsed("SQSD_SQS_BATCH_DELETE_SIZE", &mut config.sqs_batch_delete_size);
    parsed("SQSD_DRAIN_TIMEOUT", &mut config.drain_timeout);
    parsed("SQSD_QUEUE_TIMEOUT", &mut config.queue_timeout);
    if let Ok(val) = env::var("SQSD_BACKLOG_SIZE") {
        config.backlog_size = val.parse::<usize>().ok().filter(|v| *v > 0);
    }
    parsed_option("SQSD_CONCURRENT_SQS_POLLS", &mut config.concurrent_sqs_polls);

    // Scheduler
    if let Ok(val) = env::var("SQSD_SCHEDULE_FILE") {
        config.schedule_file = Some(PathBuf::from(val));
    }
    if let Ok(val) = env::var("SQSD_LEADER_REDIS_URL") {
        config.leader_redis_url = Some(val);
    }

    // Logging
    parsed("SQSD_VERBOSE", &mut config.verbose);
    parsed("SQSD_DEBUG", &mut config.debug);
    parsed("SQSD_QUIET", &mut config.quiet);
}

fn parsed<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = env::var(name) {
        match val.parse() {
            Ok(v) => *target = v,
            Err(_) => warn!(variable = name, value = %val, "Ignoring unparsable override"),
        }
    }
}

fn parsed_option<T: FromStr>(name: &str, target: &mut Option<T>) {
    if let Ok(val) = env::var(name) {
        match val.parse() {
            Ok(v) => *target = Some(v),
            Err(_) => warn!(variable = name, value = %val, "Ignoring unparsable override"),
        }
    }
}
