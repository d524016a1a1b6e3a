//! Envelope schema, sanitization, wire formatting, and correlation tags.

pub mod context_tags;
pub mod envelope;
pub mod sanitize;
pub mod time_format;

use thiserror::Error;

/// Errors raised while constructing or validating telemetry.
///
/// These never cross the pipeline boundary into the instrumented
/// application: the coordinator logs them and drops the offending field or
/// span.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A field failed validation; the field is dropped, not the envelope,
    /// unless the field is required.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The span kind has no envelope mapping; the span is dropped.
    #[error("unsupported span kind: {0}")]
    UnsupportedKind(String),

    /// A required field is missing; the envelope is dropped.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
