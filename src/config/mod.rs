use std::env;
use std::str::FromStr;
use std::time::Duration;

use retrying_receiver::retry::backoff::{DEFAULT_BACKOFF_BASE, DEFAULT_MAX_ATTEMPTS};
use retrying_receiver::{Exponential, ReceiverConfig, RetryPolicy, ShutdownMode};

const DEFAULT_OUTBOUND_CAPACITY: usize = 16;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;
const DEFAULT_METRICS_PORT: u16 = 9090;

#[derive(Debug, Clone)]
pub struct Config {
    pub brokers: Vec<String>,
    pub consumer_group: String,
    pub source_topic: String,
    pub service_name: String,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub outbound_capacity: usize,
    pub shutdown_mode: ShutdownMode,
    pub metrics_port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or(ConfigError::MissingRequired(name))
        };

        let brokers: Vec<String> = required("KAFKA_BROKERS")?
            .split(',')
            .map(str::trim)
            .filter(|broker| !broker.is_empty())
            .map(str::to_string)
            .collect();
        if brokers.is_empty() {
            return Err(ConfigError::MissingRequired("KAFKA_BROKERS"));
        }

        let consumer_group = required("CONSUMER_GROUP")?;
        let source_topic = required("SOURCE_TOPIC")?;

        let service_name =
            lookup("SERVICE_NAME").unwrap_or_else(|| "retrying-receiver".to_string());
        let max_attempts = parse_or(&lookup, "MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        let backoff_base_ms = parse_or(
            &lookup,
            "BACKOFF_BASE_MS",
            DEFAULT_BACKOFF_BASE.as_millis() as u64,
        )?;
        let outbound_capacity = parse_or(&lookup, "OUTBOUND_CAPACITY", DEFAULT_OUTBOUND_CAPACITY)?;
        if outbound_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "OUTBOUND_CAPACITY",
                value: "0".to_string(),
            });
        }

        let drain_timeout_secs =
            parse_or(&lookup, "DRAIN_TIMEOUT_SECS", DEFAULT_DRAIN_TIMEOUT_SECS)?;
        let shutdown_mode = match lookup("SHUTDOWN_MODE").as_deref().map(str::to_lowercase) {
            None => ShutdownMode::Abandon,
            Some(mode) if mode == "abandon" => ShutdownMode::Abandon,
            Some(mode) if mode == "drain" => ShutdownMode::Drain {
                timeout: Duration::from_secs(drain_timeout_secs),
            },
            Some(mode) => {
                return Err(ConfigError::Invalid {
                    name: "SHUTDOWN_MODE",
                    value: mode,
                });
            }
        };

        let metrics_port = parse_or(&lookup, "METRICS_PORT", DEFAULT_METRICS_PORT)?;
        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            brokers,
            consumer_group,
            source_topic,
            service_name,
            max_attempts,
            backoff_base: Duration::from_millis(backoff_base_ms),
            outbound_capacity,
            shutdown_mode,
            metrics_port,
            rust_log,
        })
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig::new(&self.consumer_group, &self.source_topic)
            .with_policy(RetryPolicy::new(
                self.max_attempts,
                Exponential::new(self.backoff_base),
            ))
            .with_shutdown(self.shutdown_mode)
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}
