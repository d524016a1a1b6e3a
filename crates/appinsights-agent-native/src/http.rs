//! Shared HTTP client construction.
//!
//! Both outbound surfaces (ingestion and live metrics) go through clients
//! built here so connect/read timeouts and connection pooling behave the
//! same everywhere. Building a client can only fail on TLS backend
//! misconfiguration; in that case the default client is returned so the
//! agent keeps running.

use crate::config::Config;
use std::time::Duration;
use tracing::error;

/// Creates the HTTP client used for envelope transmission and the live
/// metrics control channel.
///
/// # Arguments
///
/// * `config` - Agent configuration supplying the connect and read
///   timeouts
///
/// # Returns
///
/// A configured `reqwest::Client`; on TLS backend failure the default
/// client, so the agent keeps running.
///
/// # Example
///
/// ```rust,ignore
/// let client = get_client(&config);
/// let response = client.post(config.track_url()).body(payload).send().await?;
/// ```
#[must_use]
pub fn get_client(config: &Config) -> reqwest::Client {
    match build_client(config) {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build HTTP client: {e}, using defaults");
            reqwest::Client::new()
        }
    }
}

fn build_client(config: &Config) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(Duration::from_secs(config.read_timeout_secs))
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)))
        .build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builds_client_from_config() {
        let config = Config::from_connection_string("InstrumentationKey=k").unwrap();
        let _client = get_client(&config);
    }
}
