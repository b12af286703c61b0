use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::policy::{DEFAULT_DEAD_LETTER_MAX_RECEIVE_COUNT, DEFAULT_MAX_RECEIVE_COUNT};
use crate::record::{DEFAULT_TABLE, is_valid_table_identifier};

/// Environment variable holding a complete YAML configuration.
pub const CONFIG_ENV: &str = "INGEST_CONFIG";

pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u32 = 3600;
pub const DEFAULT_REDSHIFT_PORT: u16 = 5439;
const MAX_VISIBILITY_TIMEOUT_SECS: u32 = 43_200;
const MAX_WAIT_TIME_SECS: u32 = 20;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    pub queue: QueueConfig,
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub aws: AwsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub dead_letter_url: Option<String>,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u32,
    /// Defaults to 1s when draining and 20s when long polling.
    #[serde(default)]
    pub wait_time_secs: Option<u32>,
    #[serde(default)]
    pub poll_mode: PollMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    /// Exit as soon as a receive comes back empty.
    #[default]
    DrainOnce,
    /// Keep polling until shutdown is requested.
    LongPoll,
}

impl FromStr for PollMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "drain_once" | "drain" => Ok(PollMode::DrainOnce),
            "long_poll" | "forever" => Ok(PollMode::LongPoll),
            other => Err(ConfigError::Invalid {
                message: format!("unknown poll mode `{other}`"),
            }),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct WarehouseConfig {
    pub host: String,
    #[serde(default = "default_redshift_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_table")]
    pub table: String,
}

impl fmt::Debug for WarehouseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("table", &self.table)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    /// Bounds redelivery while the dead-letter queue is unavailable.
    #[serde(default = "default_dead_letter_max_receive_count")]
    pub dead_letter_max_receive_count: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            dead_letter_max_receive_count: DEFAULT_DEAD_LETTER_MAX_RECEIVE_COUNT,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AwsConfig {
    pub region: Option<String>,
    /// Custom endpoint, e.g. LocalStack.
    pub endpoint_url: Option<String>,
}

fn default_visibility_timeout_secs() -> u32 {
    DEFAULT_VISIBILITY_TIMEOUT_SECS
}

fn default_redshift_port() -> u16 {
    DEFAULT_REDSHIFT_PORT
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_max_receive_count() -> u32 {
    DEFAULT_MAX_RECEIVE_COUNT
}

fn default_dead_letter_max_receive_count() -> u32 {
    DEFAULT_DEAD_LETTER_MAX_RECEIVE_COUNT
}

pub fn load_config(config_path: Option<&str>) -> Result<WorkerConfig, ConfigError> {
    match config_path {
        Some(path) => WorkerConfig::from_file(path),
        None => WorkerConfig::from_env(),
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(&content, path)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from a variable lookup. A full YAML document
    /// in `INGEST_CONFIG` takes precedence over the individual variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(yaml) = lookup(CONFIG_ENV) {
            return Self::from_yaml(&yaml, CONFIG_ENV);
        }

        let queue = QueueConfig {
            url: lookup("sqs_queue_url").unwrap_or_default(),
            dead_letter_url: non_empty(lookup("sqs_dead_letter_queue_url")),
            visibility_timeout_secs: parse_var(&lookup, "sqs_visibility_timeout_seconds")?
                .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            wait_time_secs: parse_var(&lookup, "sqs_wait_time_seconds")?,
            poll_mode: parse_var(&lookup, "poll_mode")?.unwrap_or_default(),
        };

        let warehouse = WarehouseConfig {
            host: required(&lookup, "redshift_host")?,
            port: parse_var(&lookup, "redshift_port")?.unwrap_or(DEFAULT_REDSHIFT_PORT),
            database: required(&lookup, "redshift_db")?,
            user: required(&lookup, "redshift_user")?,
            password: required(&lookup, "redshift_password")?,
            table: non_empty(lookup("redshift_table")).unwrap_or_else(default_table),
        };

        let retry = RetryConfig {
            max_receive_count: parse_var(&lookup, "max_receive_count")?
                .unwrap_or(DEFAULT_MAX_RECEIVE_COUNT),
            dead_letter_max_receive_count: parse_var(&lookup, "dead_letter_max_receive_count")?
                .unwrap_or(DEFAULT_DEAD_LETTER_MAX_RECEIVE_COUNT),
        };

        let aws = AwsConfig {
            region: non_empty(lookup("AWS_REGION")),
            endpoint_url: non_empty(lookup("AWS_ENDPOINT_URL")),
        };

        Ok(Self {
            queue,
            warehouse,
            retry,
            aws,
        })
    }

    fn from_yaml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::LoadFailed {
            origin: origin.to_string(),
            error: Box::new(e),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.warehouse.validate()?;
        self.retry.validate()
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "queue.url".to_string(),
            });
        }
        if self.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS {
            return Err(invalid(format!(
                "visibility timeout {}s exceeds the SQS maximum of {MAX_VISIBILITY_TIMEOUT_SECS}s",
                self.visibility_timeout_secs
            )));
        }
        if let Some(wait) = self.wait_time_secs {
            if wait > MAX_WAIT_TIME_SECS {
                return Err(invalid(format!(
                    "wait time {wait}s exceeds the SQS maximum of {MAX_WAIT_TIME_SECS}s"
                )));
            }
        }
        if self.dead_letter_url.as_deref() == Some(self.url.as_str()) {
            return Err(invalid("dead-letter queue must differ from the source queue"));
        }
        Ok(())
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs.into())
    }

    pub fn wait_time(&self) -> Duration {
        let secs = self.wait_time_secs.unwrap_or(match self.poll_mode {
            PollMode::DrainOnce => 1,
            PollMode::LongPoll => MAX_WAIT_TIME_SECS,
        });
        Duration::from_secs(secs.into())
    }
}

impl WarehouseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("warehouse.host", &self.host),
            ("warehouse.database", &self.database),
            ("warehouse.user", &self.user),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: field.to_string(),
                });
            }
        }
        if self.port == 0 {
            return Err(invalid("warehouse port cannot be 0"));
        }
        if !is_valid_table_identifier(&self.table) {
            return Err(invalid(format!("`{}` is not a valid table name", self.table)));
        }
        Ok(())
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_receive_count == 0 {
            return Err(invalid("max_receive_count must be at least 1"));
        }
        if self.dead_letter_max_receive_count < self.max_receive_count {
            return Err(invalid(
                "dead_letter_max_receive_count cannot be lower than max_receive_count",
            ));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::ValidationFailed {
        reason: reason.into(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn required<F>(lookup: &F, name: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup(name)).ok_or_else(|| ConfigError::MissingField {
        field: name.to_string(),
    })
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match non_empty(lookup(name)) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                message: format!("{name}=`{raw}`: {e}"),
            }),
    }
}
