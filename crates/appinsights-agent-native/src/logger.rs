//! Internal logging for the agent.
//!
//! Agent diagnostics must stay distinguishable from the host application's
//! output and must never re-enter the telemetry pipeline, so they go to a
//! dedicated `tracing` subscriber with a custom formatter that prefixes
//! every line:
//!
//! ```text
//! APPINSIGHTS | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! [`LogOnce`] backs the "log once per status code / span kind" policy for
//! failure paths that would otherwise flood the sink.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const LOG_PREFIX: &str = "APPINSIGHTS";

/// Log formatter prefixing every line with `APPINSIGHTS`.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    /// Formats one tracing event as a prefixed log line.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Formatting context with access to the active spans
    /// * `writer` - Output writer for the formatted line
    /// * `event` - The tracing event to format
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The line was written
    /// * `Err` - Writing to the output failed
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "{LOG_PREFIX} | {} | ", metadata.level())?;

        // Include the active span hierarchy, root first, with span fields in
        // braces.
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the agent subscriber as the global default.
///
/// Level defaults to `info` and can be overridden with
/// `APPLICATIONINSIGHTS_LOG_LEVEL` (an `EnvFilter` directive). Returns
/// quietly if a global subscriber is already installed, so an embedding
/// application keeps its own.
///
/// # Example
///
/// ```rust,ignore
/// appinsights_agent_native::logger::init();
/// tracing::info!("agent starting");
/// // prints: APPINSIGHTS | INFO | agent starting
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_env("APPLICATIONINSIGHTS_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .event_format(Formatter)
        .with_env_filter(filter)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Deduplicates log lines by an arbitrary key.
///
/// `first(key)` returns true exactly once per key for the lifetime of the
/// value; callers log on true and stay silent afterwards.
#[derive(Debug, Default)]
pub struct LogOnce {
    seen: Mutex<HashSet<String>>,
}

impl LogOnce {
    /// Creates an empty deduplication set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `key` and reports whether it was new.
    ///
    /// # Arguments
    ///
    /// * `key` - Deduplication key, for example an HTTP status code or an
    ///   error rendering
    ///
    /// # Returns
    ///
    /// `true` the first time the key is seen, `false` on every later call.
    pub fn first(&self, key: &str) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.insert(key.to_string())
    }
}
