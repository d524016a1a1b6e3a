//! # Application Insights Agent Native
//!
//! Agent-side telemetry pipeline for a managed-runtime observability
//! collector. Finished spans produced by auto-instrumentation are mapped
//! onto the Application Insights envelope schema, streamed to the ingestion
//! endpoint with retry and an on-disk spool, and mirrored into a per-second
//! live metrics stream.
//!
//! ## Architecture
//!
//! ```text
//! span ──▶ exporter (mapper) ──▶ pipeline ──┬──▶ live_metrics (counters → QuickPulse post loop)
//!                                           └──▶ transmission (batch → gzip ndjson → POST → retry → spool)
//! ```
//!
//! The library is organized into several key modules:
//! - [`config`]: connection string, environment variables, and tunables
//! - [`spans`]: the finished-span input model
//! - [`telemetry`]: envelope schema, sanitization, wire formatting, tags
//! - [`exporter`]: span classification and envelope construction
//! - [`live_metrics`]: concurrent counters and the ping/post control loop
//! - [`transmission`]: batching, delivery, backoff, and the local spool
//! - [`pipeline`]: wires the mapper output into both consumers
//!
//! No error escapes to the instrumented application: every fallible path
//! ends in a log line on the agent's own sink.

#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

/// Configuration management - connection string, environment variables, and defaults
pub mod config;

/// Span classification and envelope construction
pub mod exporter;

/// HTTP client construction shared by the transmitter and live metrics sender
pub mod http;

/// Live metrics counters and the QuickPulse ping/post loop
pub mod live_metrics;

/// Logging infrastructure and tracing setup
pub mod logger;

/// Pipeline coordinator fanning envelopes out to consumers
pub mod pipeline;

/// The finished-span input model
pub mod spans;

/// Envelope schema, sanitization, wire formatting, and correlation tags
pub mod telemetry;

/// Envelope batching, delivery, retry policy, and the local spool
pub mod transmission;

/// Version string reported in the `ai.internal.sdkVersion` tag.
pub const SDK_VERSION: &str = concat!("ext-rs:", env!("CARGO_PKG_VERSION"));
