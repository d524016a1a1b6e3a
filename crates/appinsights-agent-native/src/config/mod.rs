//! Agent configuration.
//!
//! Configuration is resolved once at startup from the connection string and
//! environment variables, then shared immutably (`Arc<Config>`) by every
//! component. `APPLICATIONINSIGHTS_CONNECTION_STRING` is authoritative;
//! `APPINSIGHTS_INSTRUMENTATIONKEY` is the legacy fallback carrying a bare
//! key with default endpoints.

pub mod connection_string;

use connection_string::{ConnectionString, DEFAULT_INGESTION_ENDPOINT, DEFAULT_LIVE_ENDPOINT};
use std::env;
use std::path::PathBuf;
use thiserror::Error;

const CONNECTION_STRING_ENV: &str = "APPLICATIONINSIGHTS_CONNECTION_STRING";
const INSTRUMENTATION_KEY_ENV: &str = "APPINSIGHTS_INSTRUMENTATIONKEY";
const ROLE_NAME_ENV: &str = "APPLICATIONINSIGHTS_ROLE_NAME";
const ROLE_INSTANCE_ENV: &str = "APPLICATIONINSIGHTS_ROLE_INSTANCE";

/// Path suffix of the telemetry ingestion endpoint.
const TRACK_PATH: &str = "/v2.1/track";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "no instrumentation key: set {CONNECTION_STRING_ENV} or {INSTRUMENTATION_KEY_ENV}"
    )]
    MissingInstrumentationKey,

    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Tenant key stamped on every envelope.
    pub instrumentation_key: String,
    /// Ingestion endpoint origin, no trailing slash.
    pub ingestion_endpoint: String,
    /// Live metrics endpoint origin, no trailing slash.
    pub live_endpoint: String,
    pub role_name: Option<String>,
    pub role_instance: Option<String>,

    /// Maximum envelopes per transmission batch.
    pub batch_max_items: usize,
    /// Oldest-envelope age that forces a batch out, in milliseconds.
    pub batch_max_age_ms: u64,
    /// In-memory buffer capacity; overflow goes to the spool.
    pub buffer_max_items: usize,
    /// Number of transmission worker tasks.
    pub worker_count: usize,
    /// Consecutive failed dispatches of one batch before it is spooled.
    pub max_dispatch_attempts: u32,

    /// Base backoff after a transient delivery failure, in milliseconds.
    pub retry_backoff_base_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub retry_backoff_max_ms: u64,

    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Overall cooperative-shutdown deadline, in seconds.
    pub shutdown_deadline_secs: u64,

    /// Spool directory for undeliverable batches.
    pub spool_dir: PathBuf,
    /// Total spool size cap in bytes; oldest files are evicted first.
    pub spool_max_bytes: u64,
    /// How often the drainer looks for spooled batches to replay, in
    /// milliseconds.
    pub spool_drain_interval_ms: u64,
}

impl Config {
    /// Resolves configuration from the process environment.
    ///
    /// `APPLICATIONINSIGHTS_CONNECTION_STRING` is parsed first; when it is
    /// absent, `APPINSIGHTS_INSTRUMENTATIONKEY` is accepted as a bare key
    /// with default endpoints. `APPLICATIONINSIGHTS_ROLE_NAME` and
    /// `APPLICATIONINSIGHTS_ROLE_INSTANCE` fill the cloud role tags.
    ///
    /// # Returns
    ///
    /// * `Ok(config)` - Resolved configuration with defaults applied for
    ///   everything the environment does not override
    /// * `Err` - Neither variable is set, or the connection string is
    ///   malformed
    pub fn from_env() -> Result<Self, ConfigError> {
        let connection = if let Ok(raw) = env::var(CONNECTION_STRING_ENV) {
            ConnectionString::parse(&raw)?
        } else if let Ok(key) = env::var(INSTRUMENTATION_KEY_ENV) {
            ConnectionString::parse(key.trim())?
        } else {
            return Err(ConfigError::MissingInstrumentationKey);
        };

        let mut config = Self::from_connection(connection);
        config.role_name = env::var(ROLE_NAME_ENV).ok().filter(|v| !v.is_empty());
        config.role_instance = env::var(ROLE_INSTANCE_ENV).ok().filter(|v| !v.is_empty());
        Ok(config)
    }

    /// Resolves configuration from an explicit connection string.
    ///
    /// # Arguments
    ///
    /// * `raw` - Semicolon-separated `Key=Value` pairs
    ///   (`InstrumentationKey`, `IngestionEndpoint`, `LiveEndpoint`), or a
    ///   legacy bare instrumentation key
    ///
    /// # Returns
    ///
    /// * `Ok(config)` - Parsed configuration with defaults for every
    ///   unspecified field
    /// * `Err` - The string is empty, malformed, or names no key
    ///
    /// # Example
    ///
    /// ```rust
    /// use appinsights_agent_native::config::Config;
    ///
    /// let config = Config::from_connection_string(
    ///     "InstrumentationKey=ikey;IngestionEndpoint=https://in.example.com",
    /// )
    /// .unwrap();
    /// assert_eq!(config.track_url(), "https://in.example.com/v2.1/track");
    /// ```
    pub fn from_connection_string(raw: &str) -> Result<Self, ConfigError> {
        Ok(Self::from_connection(ConnectionString::parse(raw)?))
    }

    fn from_connection(connection: ConnectionString) -> Self {
        let spool_dir = env::temp_dir()
            .join("appinsights-agent")
            .join("transmission");
        Self {
            instrumentation_key: connection.instrumentation_key,
            ingestion_endpoint: connection
                .ingestion_endpoint
                .unwrap_or_else(|| DEFAULT_INGESTION_ENDPOINT.to_string()),
            live_endpoint: connection
                .live_endpoint
                .unwrap_or_else(|| DEFAULT_LIVE_ENDPOINT.to_string()),
            role_name: None,
            role_instance: None,
            batch_max_items: 500,
            batch_max_age_ms: 2_000,
            buffer_max_items: 10_000,
            worker_count: 1,
            max_dispatch_attempts: 8,
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 30_000,
            connect_timeout_secs: 10,
            read_timeout_secs: 20,
            shutdown_deadline_secs: 30,
            spool_dir,
            spool_max_bytes: 50 * 1024 * 1024,
            spool_drain_interval_ms: 30_000,
        }
    }

    /// Full URL envelopes are POSTed to.
    ///
    /// # Returns
    ///
    /// The ingestion endpoint suffixed with `/v2.1/track`.
    #[must_use]
    pub fn track_url(&self) -> String {
        format!("{}{TRACK_PATH}", self.ingestion_endpoint)
    }

    /// Live metrics ping URL for the given endpoint origin.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Endpoint origin to build against; the sender passes
    ///   the configured live endpoint or a redirect target
    #[must_use]
    pub fn quick_pulse_ping_url(&self, endpoint: &str) -> String {
        format!(
            "{}/QuickPulseService.svc/ping?ikey={}",
            endpoint.trim_end_matches('/'),
            self.instrumentation_key
        )
    }

    /// Live metrics post URL for the given endpoint origin.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Endpoint origin to build against; the sender passes
    ///   the configured live endpoint or a redirect target
    #[must_use]
    pub fn quick_pulse_post_url(&self, endpoint: &str) -> String {
        format!(
            "{}/QuickPulseService.svc/post?ikey={}",
            endpoint.trim_end_matches('/'),
            self.instrumentation_key
        )
    }
}
