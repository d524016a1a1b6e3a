//! Connection string parsing.
//!
//! A connection string is a semicolon-separated list of `Key=Value` pairs;
//! keys are matched case-insensitively and unrecognized keys are ignored.
//! Legacy mode accepts a bare instrumentation key with no `=` anywhere.

use super::ConfigError;

pub(crate) const DEFAULT_INGESTION_ENDPOINT: &str = "https://dc.services.visualstudio.com";
pub(crate) const DEFAULT_LIVE_ENDPOINT: &str = "https://rt.services.visualstudio.com";

/// Parsed connection string fields, before defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub instrumentation_key: String,
    pub ingestion_endpoint: Option<String>,
    pub live_endpoint: Option<String>,
}

impl ConnectionString {
    /// Parses a raw connection string.
    ///
    /// # Arguments
    ///
    /// * `raw` - `Key=Value` pairs separated by semicolons, or a bare
    ///   instrumentation key (legacy mode)
    ///
    /// # Returns
    ///
    /// * `Ok(parsed)` - The recognized fields; endpoints stay `None` when
    ///   not present so the caller can apply defaults
    /// * `Err` - Empty input, a pair without `=`, or no instrumentation
    ///   key
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::InvalidConnectionString(
                "connection string is empty".to_string(),
            ));
        }

        // Legacy mode: a bare instrumentation key.
        if !raw.contains('=') {
            return Ok(Self {
                instrumentation_key: raw.to_string(),
                ingestion_endpoint: None,
                live_endpoint: None,
            });
        }

        let mut instrumentation_key = None;
        let mut ingestion_endpoint = None;
        let mut live_endpoint = None;

        for pair in raw.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                return Err(ConfigError::InvalidConnectionString(format!(
                    "expected Key=Value, got {pair:?}"
                )));
            };
            let key = key.trim();
            let value = value.trim();
            if key.eq_ignore_ascii_case("InstrumentationKey") {
                instrumentation_key = Some(value.to_string());
            } else if key.eq_ignore_ascii_case("IngestionEndpoint") {
                ingestion_endpoint = Some(normalize_endpoint(value));
            } else if key.eq_ignore_ascii_case("LiveEndpoint") {
                live_endpoint = Some(normalize_endpoint(value));
            }
        }

        let instrumentation_key = instrumentation_key.filter(|key| !key.is_empty()).ok_or(
            ConfigError::MissingInstrumentationKey,
        )?;

        Ok(Self {
            instrumentation_key,
            ingestion_endpoint,
            live_endpoint,
        })
    }
}

/// Strips the trailing slash so URL suffixes can always be appended with one.
fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim_end_matches('/').to_string()
}
