//! The envelope wire schema.
//!
//! One envelope is one unit of telemetry: a tagged `baseType`/`baseData`
//! pair under a common header of tenant key, timestamp, sample rate, and
//! context tags. The mapper only constructs envelopes; serialization to the
//! newline-delimited JSON transport form happens in the transmitter, and
//! [`validate`] runs as a separate pass before an envelope enters the
//! channel.

use crate::telemetry::sanitize::{
    trim_and_truncate, MAX_ID_LENGTH, MAX_MESSAGE_LENGTH, MAX_NAME_LENGTH, MAX_URL_LENGTH,
};
use crate::telemetry::TelemetryError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version carried in every `baseData` body.
pub const SCHEMA_VERSION: i32 = 2;

const ENVELOPE_NAME_PREFIX: &str = "Microsoft.ApplicationInsights.";

/// Default response code stamped on requests that did not record one.
pub const DEFAULT_RESPONSE_CODE: &str = "200";

/// One envelope: header plus one of the five telemetry bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryItem {
    /// Wire name, `Microsoft.ApplicationInsights.<Type>`.
    pub name: String,
    /// ISO-8601 UTC instant with microsecond precision.
    pub time: String,
    /// Sampling percentage in (0, 100]; the server re-inflates counts by
    /// `100 / sampleRate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f32>,
    /// Tenant key; envelopes with an empty key are dropped before
    /// transmission.
    #[serde(rename = "iKey")]
    pub i_key: String,
    /// Context tags keyed by the constants in
    /// [`context_tags`](crate::telemetry::context_tags).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub data: Data,
}

impl TelemetryItem {
    /// Creates an envelope around `data` with the wire name derived from the
    /// body variant.
    #[must_use]
    pub fn new(i_key: String, time: String, data: TelemetryData) -> Self {
        Self {
            name: format!("{ENVELOPE_NAME_PREFIX}{}", data.type_name()),
            time,
            sample_rate: None,
            i_key,
            tags: BTreeMap::new(),
            data: Data { base_data: data },
        }
    }

    /// The telemetry body.
    #[must_use]
    pub fn base_data(&self) -> &TelemetryData {
        &self.data.base_data
    }

    /// Mutable access to the telemetry body.
    pub fn base_data_mut(&mut self) -> &mut TelemetryData {
        &mut self.data.base_data
    }
}

/// The `data` wrapper holding the tagged body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    #[serde(flatten)]
    pub base_data: TelemetryData,
}

/// The five telemetry bodies, tagged by `baseType` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "baseType", content = "baseData")]
pub enum TelemetryData {
    #[serde(rename = "RequestData")]
    Request(RequestData),
    #[serde(rename = "RemoteDependencyData")]
    RemoteDependency(RemoteDependencyData),
    #[serde(rename = "MessageData")]
    Message(MessageData),
    #[serde(rename = "ExceptionData")]
    Exception(ExceptionData),
    #[serde(rename = "EventData")]
    Event(EventData),
}

impl TelemetryData {
    /// The wire type suffix used in the envelope name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            TelemetryData::Request(_) => "Request",
            TelemetryData::RemoteDependency(_) => "RemoteDependency",
            TelemetryData::Message(_) => "Message",
            TelemetryData::Exception(_) => "Exception",
            TelemetryData::Event(_) => "Event",
        }
    }

    /// The properties map shared by every body variant.
    pub fn properties_mut(&mut self) -> &mut BTreeMap<String, String> {
        match self {
            TelemetryData::Request(d) => &mut d.properties,
            TelemetryData::RemoteDependency(d) => &mut d.properties,
            TelemetryData::Message(d) => &mut d.properties,
            TelemetryData::Exception(d) => &mut d.properties,
            TelemetryData::Event(d) => &mut d.properties,
        }
    }

    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, String> {
        match self {
            TelemetryData::Request(d) => &d.properties,
            TelemetryData::RemoteDependency(d) => &d.properties,
            TelemetryData::Message(d) => &d.properties,
            TelemetryData::Exception(d) => &d.properties,
            TelemetryData::Event(d) => &d.properties,
        }
    }
}

/// An inbound operation (server or consumer side).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    pub ver: i32,
    /// Span id of the request span; duplicate delivery is reconciled by id.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `DD.HH:MM:SS.mmmmmm`.
    pub duration: String,
    pub success: bool,
    pub response_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

/// An outbound or in-process dependency call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDependencyData {
    pub ver: i32,
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<String>,
    /// Command or URL issued to the dependency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub dependency_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub duration: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

/// A trace/log line routed through the span pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub ver: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity_level: Option<SeverityLevel>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

/// An exception, parsed from a recorded stack or an exception event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionData {
    pub ver: i32,
    pub exceptions: Vec<ExceptionDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity_level: Option<SeverityLevel>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

/// One exception in a causal chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub has_full_stack: bool,
}

impl ExceptionDetails {
    /// Parses the first line of a rendered stack as `type: message` and
    /// attaches the full stack.
    #[must_use]
    pub fn minimal_parse(error_stack: &str) -> Self {
        let line = error_stack.lines().next().unwrap_or_default();
        let (type_name, message) = match line.split_once(": ") {
            Some((type_name, message)) => (type_name.to_string(), Some(message.to_string())),
            None => (line.to_string(), None),
        };
        Self {
            type_name,
            message,
            stack: Some(error_stack.to_string()),
            has_full_stack: true,
        }
    }
}

/// A custom event attached to a span.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub ver: i32,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

/// Trace severity, ordered. Serialized by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeverityLevel {
    Verbose,
    Information,
    Warning,
    Error,
    Critical,
}

/// Validates required fields and clamps free-text fields to their wire
/// limits. Runs as a separate pass after construction, before the envelope
/// enters the channel.
pub fn validate(item: &mut TelemetryItem) -> Result<(), TelemetryError> {
    if item.i_key.is_empty() {
        return Err(TelemetryError::MissingField("iKey"));
    }
    if item.time.is_empty() {
        return Err(TelemetryError::MissingField("time"));
    }
    match &mut item.data.base_data {
        TelemetryData::Request(data) => {
            if data.response_code.is_empty() {
                data.response_code = DEFAULT_RESPONSE_CODE.to_string();
            }
            if data.id.is_empty() {
                return Err(TelemetryError::MissingField("request id"));
            }
            clamp(&mut data.id, MAX_ID_LENGTH);
            clamp_opt(&mut data.name, MAX_NAME_LENGTH);
            clamp_opt(&mut data.url, MAX_URL_LENGTH);
            clamp_opt(&mut data.source, MAX_NAME_LENGTH);
        }
        TelemetryData::RemoteDependency(data) => {
            if data.id.is_empty() {
                return Err(TelemetryError::MissingField("dependency id"));
            }
            clamp(&mut data.id, MAX_ID_LENGTH);
            clamp(&mut data.name, MAX_NAME_LENGTH);
            clamp_opt(&mut data.data, MAX_MESSAGE_LENGTH);
            clamp_opt(&mut data.target, MAX_NAME_LENGTH);
            clamp_opt(&mut data.dependency_type, MAX_NAME_LENGTH);
        }
        TelemetryData::Message(data) => {
            if data.message.is_empty() {
                return Err(TelemetryError::MissingField("message"));
            }
            clamp(&mut data.message, MAX_MESSAGE_LENGTH);
        }
        TelemetryData::Exception(data) => {
            if data.exceptions.is_empty() {
                return Err(TelemetryError::MissingField("exceptions"));
            }
            for details in &mut data.exceptions {
                clamp(&mut details.type_name, MAX_NAME_LENGTH);
                clamp_opt(&mut details.message, MAX_MESSAGE_LENGTH);
            }
        }
        TelemetryData::Event(data) => {
            if data.name.is_empty() {
                return Err(TelemetryError::MissingField("event name"));
            }
            clamp(&mut data.name, MAX_NAME_LENGTH);
        }
    }
    Ok(())
}

fn clamp(value: &mut String, max_length: usize) {
    if value.len() > max_length {
        *value = trim_and_truncate(value, max_length).to_string();
    }
}

fn clamp_opt(value: &mut Option<String>, max_length: usize) {
    if let Some(value) = value {
        clamp(value, max_length);
    }
}
