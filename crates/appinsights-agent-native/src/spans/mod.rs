//! The finished-span input model.
//!
//! Spans arrive already finalized from the instrumentation layer; the
//! pipeline never mutates one. Identifiers are lowercase hex strings in the
//! W3C widths (32-char trace id, 16-char span id). The trace-state string is
//! kept opaque except for the sampling percentage, which
//! [`parse_sample_rate`] recovers.

use std::collections::BTreeMap;

/// The role a span played in the operation it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Server,
    Client,
    Producer,
    Consumer,
    Internal,
}

impl SpanKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SpanKind::Server => "SERVER",
            SpanKind::Client => "CLIENT",
            SpanKind::Producer => "PRODUCER",
            SpanKind::Consumer => "CONSUMER",
            SpanKind::Internal => "INTERNAL",
        }
    }
}

/// Final status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
    Unset,
}

/// A typed attribute value.
///
/// Array values are rendered to strings with `", "` between elements when
/// copied into envelope properties.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Bool(bool),
    Int(i64),
    Double(f64),
    StringArray(Vec<String>),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    DoubleArray(Vec<f64>),
}

impl AttributeValue {
    /// The string payload, when this is a string attribute.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Renders any value as a property string; arrays join with `", "`.
    #[must_use]
    pub fn render(&self) -> String {
        fn join<T: ToString>(items: &[T]) -> String {
            items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }
        match self {
            AttributeValue::String(value) => value.clone(),
            AttributeValue::Bool(value) => value.to_string(),
            AttributeValue::Int(value) => value.to_string(),
            AttributeValue::Double(value) => value.to_string(),
            AttributeValue::StringArray(values) => values.join(", "),
            AttributeValue::BoolArray(values) => join(values),
            AttributeValue::IntArray(values) => join(values),
            AttributeValue::DoubleArray(values) => join(values),
        }
    }
}

/// A timestamped event recorded on a span.
#[derive(Debug, Clone)]
pub struct SpanEvent {
    pub epoch_nanos: i64,
    pub name: String,
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// A link to another span, carried as `_MS.links` on the envelope.
#[derive(Debug, Clone)]
pub struct SpanLink {
    pub trace_id: String,
    pub span_id: String,
}

/// An immutable, finished span record.
#[derive(Debug, Clone)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    /// Parent span id; may be absent or the invalid all-zero id.
    pub parent_span_id: Option<String>,
    /// Whether the parent span context came from another process.
    pub parent_is_remote: bool,
    pub kind: SpanKind,
    pub name: String,
    pub start_epoch_nanos: i64,
    pub end_epoch_nanos: i64,
    pub status: SpanStatus,
    /// Name of the instrumentation library that produced the span.
    pub instrumentation_name: String,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub events: Vec<SpanEvent>,
    pub links: Vec<SpanLink>,
    /// Opaque W3C trace-state string.
    pub trace_state: String,
}

impl Span {
    #[must_use]
    pub fn builder(trace_id: &str, span_id: &str) -> SpanBuilder {
        SpanBuilder::new(trace_id, span_id)
    }

    pub(crate) fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttributeValue::as_str)
    }

    pub(crate) fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attributes.get(key).and_then(AttributeValue::as_bool)
    }

    pub(crate) fn attr_i64(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(AttributeValue::as_i64)
    }

    #[must_use]
    pub fn duration_nanos(&self) -> i64 {
        self.end_epoch_nanos - self.start_epoch_nanos
    }
}

/// Builder used by the instrumentation bridge and tests.
#[derive(Debug)]
pub struct SpanBuilder {
    span: Span,
}

impl SpanBuilder {
    fn new(trace_id: &str, span_id: &str) -> Self {
        Self {
            span: Span {
                trace_id: trace_id.to_string(),
                span_id: span_id.to_string(),
                parent_span_id: None,
                parent_is_remote: false,
                kind: SpanKind::Internal,
                name: String::new(),
                start_epoch_nanos: 0,
                end_epoch_nanos: 0,
                status: SpanStatus::Unset,
                instrumentation_name: String::new(),
                attributes: BTreeMap::new(),
                events: Vec::new(),
                links: Vec::new(),
                trace_state: String::new(),
            },
        }
    }

    #[must_use]
    pub fn kind(mut self, kind: SpanKind) -> Self {
        self.span.kind = kind;
        self
    }

    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.span.name = name.to_string();
        self
    }

    #[must_use]
    pub fn parent(mut self, parent_span_id: &str, remote: bool) -> Self {
        self.span.parent_span_id = Some(parent_span_id.to_string());
        self.span.parent_is_remote = remote;
        self
    }

    #[must_use]
    pub fn times(mut self, start_epoch_nanos: i64, end_epoch_nanos: i64) -> Self {
        self.span.start_epoch_nanos = start_epoch_nanos;
        self.span.end_epoch_nanos = end_epoch_nanos;
        self
    }

    #[must_use]
    pub fn status(mut self, status: SpanStatus) -> Self {
        self.span.status = status;
        self
    }

    #[must_use]
    pub fn instrumentation(mut self, name: &str) -> Self {
        self.span.instrumentation_name = name.to_string();
        self
    }

    #[must_use]
    pub fn attribute(mut self, key: &str, value: AttributeValue) -> Self {
        self.span.attributes.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn string_attribute(self, key: &str, value: &str) -> Self {
        self.attribute(key, AttributeValue::String(value.to_string()))
    }

    #[must_use]
    pub fn event(mut self, event: SpanEvent) -> Self {
        self.span.events.push(event);
        self
    }

    #[must_use]
    pub fn link(mut self, trace_id: &str, span_id: &str) -> Self {
        self.span.links.push(SpanLink {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
        });
        self
    }

    #[must_use]
    pub fn trace_state(mut self, trace_state: &str) -> Self {
        self.span.trace_state = trace_state.to_string();
        self
    }

    #[must_use]
    pub fn build(self) -> Span {
        self.span
    }
}

/// Trace-state keys recognized as the sampling percentage, in precedence
/// order.
const SAMPLE_RATE_KEYS: [&str; 2] = ["ai_sampling", "ai-internal-sp"];

/// Recovers the sampling percentage from a W3C trace-state string.
///
/// Returns 100 when the state carries no recognized key or an unusable
/// value; anything outside (0, 100] is unusable.
#[must_use]
pub fn parse_sample_rate(trace_state: &str) -> f32 {
    for wanted in SAMPLE_RATE_KEYS {
        for entry in trace_state.split(',') {
            let Some((key, value)) = entry.trim().split_once('=') else {
                continue;
            };
            if key.trim() != wanted {
                continue;
            }
            if let Ok(rate) = value.trim().parse::<f32>() {
                if rate > 0.0 && rate <= 100.0 {
                    return rate;
                }
            }
        }
    }
    100.0
}
