//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENCY: usize = 500;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_CHANNEL_SIZE: usize = 10_000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 50;
pub const DEFAULT_APPEND_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_MAX_APPEND_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 100;
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 5_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub push: PushConfig,
    pub writer: WriterConfig,
    pub database: DatabaseConfig,
    pub serializer: SerializerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_cert: String,
    pub tls_key: String,
    /// How long TLS connections get to finish after the shutdown signal
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            tls_cert: String::new(),
            tls_key: String::new(),
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Caps the number of in-flight requests
    pub max_concurrency: usize,
    /// How long a request waits for a slot. If one is not obtained, the
    /// handler answers 503 so the producer retries.
    pub acquire_timeout_ms: u64,
    /// How long a request waits for its record to be enqueued. If the
    /// writer is backpressured, the handler answers 503.
    pub enqueue_timeout_ms: u64,
    pub max_body_bytes: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            enqueue_timeout_ms: DEFAULT_ENQUEUE_TIMEOUT_MS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl PushConfig {
    /// Replace zero values with defaults; each field is defaulted on its own.
    pub fn with_defaults(mut self) -> Self {
        if self.max_concurrency == 0 {
            self.max_concurrency = DEFAULT_MAX_CONCURRENCY;
        }
        if self.acquire_timeout_ms == 0 {
            self.acquire_timeout_ms = DEFAULT_ACQUIRE_TIMEOUT_MS;
        }
        if self.enqueue_timeout_ms == 0 {
            self.enqueue_timeout_ms = DEFAULT_ENQUEUE_TIMEOUT_MS;
        }
        if self.max_body_bytes == 0 {
            self.max_body_bytes = DEFAULT_MAX_BODY_BYTES;
        }
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Records per sink append
    pub batch_size: usize,
    /// Capacity of the intake channel
    pub channel_size: usize,
    pub flush_interval_ms: u64,
    /// Upper bound on a single sink append
    pub append_timeout_ms: u64,
    /// Consecutive failed appends before the front batch is dropped
    pub max_append_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            channel_size: DEFAULT_CHANNEL_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            append_timeout_ms: DEFAULT_APPEND_TIMEOUT_MS,
            max_append_attempts: DEFAULT_MAX_APPEND_ATTEMPTS,
            retry_initial_backoff_ms: DEFAULT_RETRY_INITIAL_BACKOFF_MS,
            retry_max_backoff_ms: DEFAULT_RETRY_MAX_BACKOFF_MS,
        }
    }
}

impl WriterConfig {
    pub fn with_defaults(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.channel_size == 0 {
            self.channel_size = DEFAULT_CHANNEL_SIZE;
        }
        if self.flush_interval_ms == 0 {
            self.flush_interval_ms = DEFAULT_FLUSH_INTERVAL_MS;
        }
        if self.append_timeout_ms == 0 {
            self.append_timeout_ms = DEFAULT_APPEND_TIMEOUT_MS;
        }
        if self.max_append_attempts == 0 {
            self.max_append_attempts = DEFAULT_MAX_APPEND_ATTEMPTS;
        }
        if self.retry_initial_backoff_ms == 0 {
            self.retry_initial_backoff_ms = DEFAULT_RETRY_INITIAL_BACKOFF_MS;
        }
        if self.retry_max_backoff_ms == 0 {
            self.retry_max_backoff_ms = DEFAULT_RETRY_MAX_BACKOFF_MS;
        }
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub driver: String,
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            url: "push-ingest.db".to_string(),
        }
    }
}

/// Built-in record serializers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerFormat {
    /// Payload bytes are stored unchanged
    #[default]
    Raw,
    /// Payload must be a JSON object; attributes are merged in
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SerializerConfig {
    pub format: SerializerFormat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("PUSH_INGEST_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(
                config::Environment::with_prefix("PUSH_INGEST")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        let mut config: Config = settings.try_deserialize()?;
        config.push = config.push.with_defaults();
        config.writer = config.writer.with_defaults();

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate server config
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        // Validate database config
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.driver != "sqlite" {
            anyhow::bail!(
                "Invalid database driver '{}'. Must be 'sqlite'",
                self.database.driver
            );
        }

        // Validate TLS (both or neither must be set)
        let has_cert = !self.server.tls_cert.is_empty();
        let has_key = !self.server.tls_key.is_empty();
        if has_cert != has_key {
            anyhow::bail!(
                "TLS configuration incomplete: both tls_cert and tls_key must be set, or neither"
            );
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        !self.server.tls_cert.is_empty() && !self.server.tls_key.is_empty()
    }
}
