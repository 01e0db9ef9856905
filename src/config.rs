//! Configuration module for the event bus
//!
//! Loads configuration from environment variables

use std::env;
use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Engine-level configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Drain deadline for graceful shutdown
    pub shutdown_timeout: Duration,
    /// Default per-attempt timeout when a subscription does not set one
    pub default_timeout: Duration,
    /// Bound of each ordered subscription's FIFO queue
    pub default_queue_capacity: usize,
    /// Interval of the background janitor (tracker sweep, registry cleanup)
    pub janitor_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
            default_timeout: Duration::from_secs(30),
            default_queue_capacity: 1024,
            janitor_interval: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            shutdown_timeout: Duration::from_millis(env_u64("EVENTBUS_SHUTDOWN_TIMEOUT_MS", 5000)),
            default_timeout: Duration::from_millis(env_u64("EVENTBUS_DEFAULT_TIMEOUT_MS", 30000)),
            default_queue_capacity: env_usize("EVENTBUS_ORDERED_QUEUE_CAPACITY", 1024),
            janitor_interval: Duration::from_millis(env_u64("EVENTBUS_JANITOR_INTERVAL_MS", 30000)),
        }
    }
}

/// Outbox publisher configuration
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// How often the background worker polls for ready entries
    pub poll_interval: Duration,
    /// Maximum entries fetched per poll
    pub batch_size: usize,
    /// Publish attempts before an entry rests in FAILED
    pub max_retries: u32,
    /// First backoff step between publish attempts
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Age after which PUBLISHED / CANCELLED entries may be cleaned up
    pub retention: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl OutboxConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            poll_interval: Duration::from_millis(env_u64("OUTBOX_POLL_INTERVAL_MS", 5000)),
            batch_size: env_usize("OUTBOX_BATCH_SIZE", 100),
            max_retries: env_u64("OUTBOX_MAX_RETRIES", 5) as u32,
            initial_backoff: Duration::from_millis(env_u64("OUTBOX_INITIAL_BACKOFF_MS", 1000)),
            max_backoff: Duration::from_millis(env_u64("OUTBOX_MAX_BACKOFF_MS", 60000)),
            retention: Duration::from_millis(env_u64("OUTBOX_RETENTION_MS", 24 * 3600 * 1000)),
        }
    }
}

/// Kafka bridge configuration
#[derive(Debug, Clone)]
pub struct KafkaBridgeConfig {
    pub bootstrap_servers: String,
    pub client_id: String,
    /// Prefix for derived topic names
    pub topic_prefix: String,
    /// Consumer group for the inbound loop
    pub group_id: String,
    pub request_timeout: Duration,
    pub send_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for KafkaBridgeConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "eventbus".to_string(),
            topic_prefix: "events".to_string(),
            group_id: "eventbus-bridge".to_string(),
            request_timeout: Duration::from_secs(30),
            send_retries: 5,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl KafkaBridgeConfig {
    /// Load configuration from environment variables
    ///
    /// `KAFKA_BOOTSTRAP_SERVERS` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let bootstrap_servers = env::var("KAFKA_BOOTSTRAP_SERVERS")
            .map_err(|_| ConfigError::MissingEnv("KAFKA_BOOTSTRAP_SERVERS".to_string()))?;

        Ok(Self {
            bootstrap_servers,
            client_id: env::var("KAFKA_CLIENT_ID").unwrap_or_else(|_| "eventbus".to_string()),
            topic_prefix: env::var("KAFKA_TOPIC_PREFIX").unwrap_or_else(|_| "events".to_string()),
            group_id: env::var("KAFKA_GROUP_ID").unwrap_or_else(|_| "eventbus-bridge".to_string()),
            request_timeout: Duration::from_millis(env_u64("KAFKA_REQUEST_TIMEOUT_MS", 30000)),
            send_retries: env_u64("KAFKA_SEND_RETRIES", 5) as u32,
            retry_backoff: Duration::from_millis(env_u64("KAFKA_RETRY_BACKOFF_MS", 100)),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BusConfig::default();
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert!(config.default_queue_capacity > 0);

        let outbox = OutboxConfig::default();
        assert!(outbox.max_backoff >= outbox.initial_backoff);
    }
}
