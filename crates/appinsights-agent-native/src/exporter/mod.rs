//! Span classification and envelope construction.
//!
//! The exporter is the schema-translation stage of the pipeline: one
//! finished span becomes zero or more envelopes. Classification is an
//! ordered decision tree over span kind, instrumentation name, and
//! attribute presence; dependency subtyping follows the semantic
//! conventions, first match wins. The exporter never performs I/O and runs
//! on the caller's thread.

use crate::config::Config;
use crate::spans::{parse_sample_rate, Span, SpanEvent, SpanKind, SpanStatus};
use crate::telemetry::context_tags;
use crate::telemetry::envelope::{
    EventData, ExceptionData, ExceptionDetails, MessageData, RemoteDependencyData, RequestData,
    SeverityLevel, TelemetryData, TelemetryItem, DEFAULT_RESPONSE_CODE, SCHEMA_VERSION,
};
use crate::telemetry::sanitize::sanitize_properties;
use crate::telemetry::time_format::{format_duration, format_instant};
use crate::telemetry::TelemetryError;
use crate::SDK_VERSION;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

// Semantic-convention attribute keys.
const HTTP_METHOD: &str = "http.method";
const HTTP_URL: &str = "http.url";
const HTTP_STATUS_CODE: &str = "http.status_code";
const HTTP_SCHEME: &str = "http.scheme";
const HTTP_HOST: &str = "http.host";
const HTTP_CLIENT_IP: &str = "http.client_ip";
const HTTP_USER_AGENT: &str = "http.user_agent";
const NET_PEER_NAME: &str = "net.peer.name";
const NET_PEER_IP: &str = "net.peer.ip";
const NET_PEER_PORT: &str = "net.peer.port";
const PEER_SERVICE: &str = "peer.service";
const DB_SYSTEM: &str = "db.system";
const DB_STATEMENT: &str = "db.statement";
const DB_NAME: &str = "db.name";
const RPC_SYSTEM: &str = "rpc.system";
const MESSAGING_SYSTEM: &str = "messaging.system";
const MESSAGING_DESTINATION: &str = "messaging.destination";
const ENDUSER_ID: &str = "enduser.id";
const EXCEPTION_TYPE: &str = "exception.type";
const EXCEPTION_MESSAGE: &str = "exception.message";
const EXCEPTION_STACKTRACE: &str = "exception.stacktrace";

// Attributes injected by the instrumentation layer; the
// `applicationinsights.internal.` prefix keeps them out of user properties.
const AI_LOG: &str = "applicationinsights.internal.log";
const AI_LOG_LEVEL: &str = "applicationinsights.internal.log_level";
const AI_LOGGER_NAME: &str = "applicationinsights.internal.logger_name";
const AI_LOG_ERROR_STACK: &str = "applicationinsights.internal.log_error_stack";
const AI_LEGACY_PARENT_ID: &str = "applicationinsights.internal.legacy_parent_id";
const AI_LEGACY_ROOT_ID: &str = "applicationinsights.internal.legacy_root_id";
const INTERNAL_ATTRIBUTE_PREFIX: &str = "applicationinsights.internal.";

// Cross-component correlation attributes set by the app-id propagation
// layer, and the legacy bridge source.
const AI_SPAN_SOURCE_APP_ID: &str = "ai.span.source.app_id";
const AI_SPAN_TARGET_APP_ID: &str = "ai.span.target.app_id";
const AI_SPAN_SOURCE: &str = "ai.span.source";

// Azure SDK attributes that predate the messaging conventions.
const AZURE_PEER_ADDRESS: &str = "peer.address";
const AZURE_MESSAGE_BUS_DESTINATION: &str = "message_bus.destination";
const AZURE_NAMESPACE: &str = "az.namespace";

// Per-span tenant and resource overrides.
const AI_PREVIEW_INSTRUMENTATION_KEY: &str = "ai.preview.instrumentation_key";
const AI_PREVIEW_SERVICE_NAME: &str = "ai.preview.service_name";
const AI_PREVIEW_SERVICE_INSTANCE_ID: &str = "ai.preview.service_instance_id";
const AI_PREVIEW_SERVICE_VERSION: &str = "ai.preview.service_version";

/// Database systems mapped to the `SQL` dependency type.
const SQL_DB_SYSTEMS: [&str; 11] = [
    "db2",
    "derby",
    "mariadb",
    "mssql",
    "mysql",
    "oracle",
    "postgresql",
    "sqlite",
    "other_sql",
    "hsqldb",
    "h2",
];

/// Attribute prefixes covered by the semantic conventions; these are mapped
/// into typed envelope fields and never copied into user properties.
const STANDARD_ATTRIBUTE_PREFIXES: [&str; 11] = [
    "http",
    "db",
    "message",
    "messaging",
    "rpc",
    "enduser",
    "net",
    "peer",
    "exception",
    "thread",
    "faas",
];

/// Events emitted by the redis codec itself; pure noise at this layer.
const LETTUCE_INSTRUMENTATION: &str = "io.opentelemetry.javaagent.lettuce-5.1";
const REDIS_ENCODE_PREFIX: &str = "redis.encode.";

const EVENT_HUBS_PROCESS: &str = "EventHubs.process";
const SERVICE_BUS_PROCESS: &str = "ServiceBus.process";

const LINKS_PROPERTY: &str = "_MS.links";

fn component_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^io\.opentelemetry\.javaagent\.([^0-9]*?)(-[0-9.]*)?$")
            .expect("component pattern compiles")
    })
}

/// Maps finished spans onto envelopes.
///
/// Constructed once at startup; the tenant key, this process's application
/// id, and the base context tags are fixed for the exporter's lifetime.
#[derive(Debug, Clone)]
pub struct Exporter {
    i_key: String,
    app_id: Option<String>,
    base_tags: BTreeMap<String, String>,
}

impl Exporter {
    /// Creates an exporter bound to the configured tenant.
    ///
    /// # Arguments
    ///
    /// * `config` - Resolved agent configuration; supplies the
    ///   instrumentation key and the cloud role / role instance / SDK
    ///   version tags stamped on every envelope
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let mut base_tags = BTreeMap::new();
        base_tags.insert(
            context_tags::INTERNAL_SDK_VERSION.to_string(),
            SDK_VERSION.to_string(),
        );
        if let Some(role_name) = &config.role_name {
            base_tags.insert(context_tags::CLOUD_ROLE.to_string(), role_name.clone());
        }
        if let Some(role_instance) = &config.role_instance {
            base_tags.insert(
                context_tags::CLOUD_ROLE_INSTANCE.to_string(),
                role_instance.clone(),
            );
        }
        Self {
            i_key: config.instrumentation_key.clone(),
            app_id: None,
            base_tags,
        }
    }

    /// Sets this process's application id, used to tell cross-component
    /// calls apart from self-calls.
    ///
    /// # Arguments
    ///
    /// * `app_id` - The application id assigned to this process by the
    ///   correlation service, or `None` before one is known
    #[must_use]
    pub fn with_app_id(mut self, app_id: Option<String>) -> Self {
        self.app_id = app_id;
        self
    }

    /// Maps one span to its envelopes.
    ///
    /// Classification:
    /// 1. INTERNAL spans flagged as logs take the log path (message or
    ///    exception envelope).
    /// 2. SERVER spans, CONSUMER spans with a remote parent (except the
    ///    EventHubs/ServiceBus process spans), and parentless
    ///    spring-scheduling INTERNAL spans become requests.
    /// 3. Everything else becomes a dependency; INTERNAL dependencies are
    ///    in-process.
    ///
    /// Span events ride along as extra envelopes: exception events become
    /// exception telemetry, everything else becomes event telemetry. Every
    /// produced envelope carries the span's trace id as `operation.id` and
    /// the sampling percentage parsed from its trace-state.
    ///
    /// # Arguments
    ///
    /// * `span` - The finished, immutable span record
    ///
    /// # Returns
    ///
    /// * `Ok(items)` - Zero or more envelopes; empty when the configured
    ///   instrumentation key is empty (the span is skipped wholesale)
    /// * `Err` - The span could not be rendered (for example a negative
    ///   duration); the caller drops the span and logs once
    ///
    /// # Example
    ///
    /// ```rust
    /// use appinsights_agent_native::config::Config;
    /// use appinsights_agent_native::exporter::Exporter;
    /// use appinsights_agent_native::spans::{Span, SpanKind};
    ///
    /// let config = Config::from_connection_string("InstrumentationKey=ikey").unwrap();
    /// let exporter = Exporter::new(&config);
    ///
    /// let span = Span::builder("4bf92f3577b34da6a3ce929d0e0e4736", "00f067aa0ba902b7")
    ///     .kind(SpanKind::Server)
    ///     .name("/api/users")
    ///     .times(0, 150_000_000)
    ///     .build();
    ///
    /// let envelopes = exporter.map(&span).unwrap();
    /// assert_eq!(envelopes.len(), 1);
    /// ```
    pub fn map(&self, span: &Span) -> Result<Vec<TelemetryItem>, TelemetryError> {
        if self.i_key.is_empty() {
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        let sample_rate = parse_sample_rate(&span.trace_state);

        match span.kind {
            SpanKind::Internal => {
                if span.attr_bool(AI_LOG) == Some(true) {
                    self.export_log_span(span, sample_rate, &mut items);
                } else if self.std_component(span) == Some("spring-scheduling".to_string())
                    && !parent_is_valid(span)
                {
                    self.export_request(span, sample_rate, &mut items)?;
                } else {
                    self.export_dependency(span, true, sample_rate, &mut items)?;
                }
            }
            SpanKind::Client | SpanKind::Producer => {
                self.export_dependency(span, false, sample_rate, &mut items)?;
            }
            SpanKind::Consumer => {
                // Some producers' SDKs do not mark the parent remote; their
                // process spans are still requests.
                if !span.parent_is_remote
                    && span.name != EVENT_HUBS_PROCESS
                    && span.name != SERVICE_BUS_PROCESS
                {
                    self.export_dependency(span, false, sample_rate, &mut items)?;
                } else {
                    self.export_request(span, sample_rate, &mut items)?;
                }
            }
            SpanKind::Server => {
                self.export_request(span, sample_rate, &mut items)?;
            }
        }

        Ok(items)
    }

    fn std_component(&self, span: &Span) -> Option<String> {
        component_pattern()
            .captures(&span.instrumentation_name)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn new_item(&self, time: String, data: TelemetryData) -> TelemetryItem {
        let mut item = TelemetryItem::new(self.i_key.clone(), time, data);
        item.tags.extend(
            self.base_tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        item
    }

    fn export_request(
        &self,
        span: &Span,
        sample_rate: f32,
        items: &mut Vec<TelemetryItem>,
    ) -> Result<(), TelemetryError> {
        let mut data = RequestData {
            ver: SCHEMA_VERSION,
            id: span.span_id.clone(),
            duration: format_duration(span.duration_nanos())?,
            success: span.status != SpanStatus::Error,
            response_code: span
                .attr_i64(HTTP_STATUS_CODE)
                .map_or_else(|| DEFAULT_RESPONSE_CODE.to_string(), |code| code.to_string()),
            url: span.attr_str(HTTP_URL).map(ToString::to_string),
            source: self.request_source(span),
            ..RequestData::default()
        };
        add_links(span, &mut data.properties);

        let name = telemetry_name(span);
        data.name = Some(name.clone());

        let mut item = self.new_item(
            format_instant(i128::from(span.start_epoch_nanos)),
            TelemetryData::Request(data),
        );
        item.tags
            .insert(context_tags::OPERATION_NAME.to_string(), name);
        item.tags
            .insert(context_tags::OPERATION_ID.to_string(), span.trace_id.clone());

        let location_ip = span
            .attr_str(HTTP_CLIENT_IP)
            .or_else(|| span.attr_str(NET_PEER_IP));
        if let Some(location_ip) = location_ip {
            item.tags
                .insert(context_tags::LOCATION_IP.to_string(), location_ip.to_string());
        }

        // The legacy bridge injects its own parent and root ids; they win
        // over the span's own parent.
        if let Some(legacy_parent_id) = span.attr_str(AI_LEGACY_PARENT_ID) {
            item.tags.insert(
                context_tags::OPERATION_PARENT_ID.to_string(),
                legacy_parent_id.to_string(),
            );
            if let Some(legacy_root_id) = span.attr_str(AI_LEGACY_ROOT_ID) {
                item.tags
                    .entry(context_tags::LEGACY_ROOT_ID.to_string())
                    .or_insert_with(|| legacy_root_id.to_string());
            }
        } else if let Some(parent_span_id) = valid_parent(span) {
            item.tags.insert(
                context_tags::OPERATION_PARENT_ID.to_string(),
                parent_span_id.to_string(),
            );
        }

        self.apply_extra_attributes(&mut item, &span.attributes);
        finish_properties(&mut item);
        item.sample_rate = Some(sample_rate);
        items.push(item);

        self.export_events(span, sample_rate, items);
        Ok(())
    }

    fn request_source(&self, span: &Span) -> Option<String> {
        if let Some(source_app_id) = span.attr_str(AI_SPAN_SOURCE_APP_ID) {
            if self.app_id.as_deref() != Some(source_app_id) {
                return Some(source_app_id.to_string());
            }
        }
        if let Some(messaging_system) = span.attr_str(MESSAGING_SYSTEM) {
            let source = null_aware_concat(
                target_from_peer_attributes(span, 0),
                span.attr_str(MESSAGING_DESTINATION).map(ToString::to_string),
                "/",
            );
            return Some(source.unwrap_or_else(|| messaging_system.to_string()));
        }
        // Only set by the legacy web interop bridge; preserved verbatim.
        span.attr_str(AI_SPAN_SOURCE).map(ToString::to_string)
    }

    fn export_dependency(
        &self,
        span: &Span,
        in_proc: bool,
        sample_rate: f32,
        items: &mut Vec<TelemetryItem>,
    ) -> Result<(), TelemetryError> {
        let mut data = RemoteDependencyData {
            ver: SCHEMA_VERSION,
            id: span.span_id.clone(),
            name: telemetry_name(span),
            duration: format_duration(span.duration_nanos())?,
            success: span.status != SpanStatus::Error,
            ..RemoteDependencyData::default()
        };
        add_links(span, &mut data.properties);

        if in_proc {
            data.dependency_type = Some("InProc".to_string());
        } else {
            self.apply_semantic_conventions(span, &mut data);
        }

        let mut item = self.new_item(
            format_instant(i128::from(span.start_epoch_nanos)),
            TelemetryData::RemoteDependency(data),
        );
        item.tags
            .insert(context_tags::OPERATION_ID.to_string(), span.trace_id.clone());
        if let Some(parent_span_id) = valid_parent(span) {
            item.tags.insert(
                context_tags::OPERATION_PARENT_ID.to_string(),
                parent_span_id.to_string(),
            );
        }

        self.apply_extra_attributes(&mut item, &span.attributes);
        finish_properties(&mut item);
        item.sample_rate = Some(sample_rate);
        items.push(item);

        self.export_events(span, sample_rate, items);
        Ok(())
    }

    /// Dependency subtyping; first matching convention wins.
    fn apply_semantic_conventions(&self, span: &Span, data: &mut RemoteDependencyData) {
        if span.attr_str(HTTP_METHOD).is_some() {
            self.apply_http_client_span(span, data);
            return;
        }
        if let Some(rpc_system) = span.attr_str(RPC_SYSTEM) {
            apply_rpc_client_span(span, data, rpc_system);
            return;
        }
        if let Some(db_system) = span.attr_str(DB_SYSTEM) {
            apply_database_client_span(span, data, db_system);
            return;
        }
        if let Some(messaging_system) = span.attr_str(MESSAGING_SYSTEM) {
            apply_messaging_client_span(span, data, messaging_system);
            return;
        }
        // The azure SDKs predate the messaging conventions and are matched
        // by span name instead.
        if span.name == "EventHubs.send" || span.name == "EventHubs.message" {
            apply_azure_sdk_span(span, data, "Microsoft.EventHub");
            return;
        }
        if span.name == "ServiceBus.message" || span.name == SERVICE_BUS_PROCESS {
            apply_azure_sdk_span(span, data, "AZURE SERVICE BUS");
            return;
        }
        // No convention matched. A peer-derived target keeps the edge on the
        // service map; otherwise the call is indistinguishable from local
        // work.
        match target_from_peer_attributes(span, 0) {
            Some(target) => data.target = Some(target),
            None => data.dependency_type = Some("InProc".to_string()),
        }
    }

    fn apply_http_client_span(&self, span: &Span, data: &mut RemoteDependencyData) {
        let default_port = match span.attr_str(HTTP_SCHEME) {
            Some("http") => 80,
            Some("https") => 443,
            _ => 0,
        };
        let url = span.attr_str(HTTP_URL);
        let target = target_from_peer_attributes(span, default_port)
            .or_else(|| span.attr_str(HTTP_HOST).map(ToString::to_string))
            .or_else(|| url.and_then(target_from_url))
            // should not happen, just a failsafe
            .unwrap_or_else(|| "Http".to_string());

        match span.attr_str(AI_SPAN_TARGET_APP_ID) {
            Some(target_app_id) if self.app_id.as_deref() != Some(target_app_id) => {
                // A cross-component call; the app id must survive in the
                // target field for the backend to resolve the edge.
                data.dependency_type = Some("Http (tracked component)".to_string());
                data.target = Some(format!("{target} | {target_app_id}"));
            }
            _ => {
                data.dependency_type = Some("Http".to_string());
                data.target = Some(target);
            }
        }

        if let Some(status_code) = span.attr_i64(HTTP_STATUS_CODE) {
            data.result_code = Some(status_code.to_string());
        }
        data.data = url.map(ToString::to_string);
    }

    fn export_log_span(&self, span: &Span, sample_rate: f32, items: &mut Vec<TelemetryItem>) {
        match span.attr_str(AI_LOG_ERROR_STACK) {
            Some(error_stack) => {
                self.export_log_exception(span, error_stack, sample_rate, items);
            }
            None => self.export_log_message(span, sample_rate, items),
        }
    }

    fn export_log_message(&self, span: &Span, sample_rate: f32, items: &mut Vec<TelemetryItem>) {
        let level = span.attr_str(AI_LOG_LEVEL);
        let mut data = MessageData {
            ver: SCHEMA_VERSION,
            message: span.name.clone(),
            severity_level: level.map(to_severity_level),
            ..MessageData::default()
        };
        set_logger_properties(&mut data.properties, level, span.attr_str(AI_LOGGER_NAME));

        let mut item = self.new_item(
            format_instant(i128::from(span.start_epoch_nanos)),
            TelemetryData::Message(data),
        );
        self.tag_operation(&mut item, span);
        self.apply_extra_attributes(&mut item, &span.attributes);
        finish_properties(&mut item);
        item.sample_rate = Some(sample_rate);
        items.push(item);
    }

    fn export_log_exception(
        &self,
        span: &Span,
        error_stack: &str,
        sample_rate: f32,
        items: &mut Vec<TelemetryItem>,
    ) {
        let level = span.attr_str(AI_LOG_LEVEL);
        let mut data = ExceptionData {
            ver: SCHEMA_VERSION,
            exceptions: vec![ExceptionDetails::minimal_parse(error_stack)],
            severity_level: level.map(to_severity_level),
            ..ExceptionData::default()
        };
        data.properties
            .insert("Logger Message".to_string(), span.name.clone());
        set_logger_properties(&mut data.properties, level, span.attr_str(AI_LOGGER_NAME));

        let mut item = self.new_item(
            format_instant(i128::from(span.start_epoch_nanos)),
            TelemetryData::Exception(data),
        );
        self.tag_operation(&mut item, span);
        self.apply_extra_attributes(&mut item, &span.attributes);
        finish_properties(&mut item);
        item.sample_rate = Some(sample_rate);
        items.push(item);
    }

    fn tag_operation(&self, item: &mut TelemetryItem, span: &Span) {
        item.tags
            .insert(context_tags::OPERATION_ID.to_string(), span.trace_id.clone());
        if let Some(parent_span_id) = valid_parent(span) {
            item.tags.insert(
                context_tags::OPERATION_PARENT_ID.to_string(),
                parent_span_id.to_string(),
            );
        }
    }

    fn export_events(&self, span: &Span, sample_rate: f32, items: &mut Vec<TelemetryItem>) {
        let lettuce51 = span.instrumentation_name == LETTUCE_INSTRUMENTATION;
        for event in &span.events {
            if lettuce51 && event.name.starts_with(REDIS_ENCODE_PREFIX) {
                continue;
            }

            let has_exception = event.attributes.contains_key(EXCEPTION_TYPE)
                || event.attributes.contains_key(EXCEPTION_MESSAGE);
            if has_exception {
                items.push(self.exception_from_event(span, event, sample_rate));
            } else {
                items.push(self.event_envelope(span, event, sample_rate));
            }
        }
    }

    fn exception_from_event(
        &self,
        span: &Span,
        event: &SpanEvent,
        sample_rate: f32,
    ) -> TelemetryItem {
        let details = match event
            .attributes
            .get(EXCEPTION_STACKTRACE)
            .and_then(crate::spans::AttributeValue::as_str)
        {
            Some(stacktrace) => ExceptionDetails::minimal_parse(stacktrace),
            None => ExceptionDetails {
                type_name: event
                    .attributes
                    .get(EXCEPTION_TYPE)
                    .and_then(crate::spans::AttributeValue::as_str)
                    .unwrap_or("Exception")
                    .to_string(),
                message: event
                    .attributes
                    .get(EXCEPTION_MESSAGE)
                    .and_then(crate::spans::AttributeValue::as_str)
                    .map(ToString::to_string),
                stack: None,
                has_full_stack: false,
            },
        };

        let data = ExceptionData {
            ver: SCHEMA_VERSION,
            exceptions: vec![details],
            ..ExceptionData::default()
        };
        let mut item = self.new_item(
            format_instant(i128::from(event.epoch_nanos)),
            TelemetryData::Exception(data),
        );
        item.tags
            .insert(context_tags::OPERATION_ID.to_string(), span.trace_id.clone());
        item.tags.insert(
            context_tags::OPERATION_PARENT_ID.to_string(),
            span.span_id.clone(),
        );
        item.sample_rate = Some(sample_rate);
        item
    }

    fn event_envelope(&self, span: &Span, event: &SpanEvent, sample_rate: f32) -> TelemetryItem {
        let data = EventData {
            ver: SCHEMA_VERSION,
            name: event.name.clone(),
            ..EventData::default()
        };
        let mut item = self.new_item(
            format_instant(i128::from(event.epoch_nanos)),
            TelemetryData::Event(data),
        );
        item.tags
            .insert(context_tags::OPERATION_ID.to_string(), span.trace_id.clone());
        item.tags.insert(
            context_tags::OPERATION_PARENT_ID.to_string(),
            span.span_id.clone(),
        );
        self.apply_extra_attributes(&mut item, &event.attributes);
        finish_properties(&mut item);
        item.sample_rate = Some(sample_rate);
        item
    }

    /// Copies attributes outside the standard conventions into the
    /// properties map, applying the special-key mappings first.
    fn apply_extra_attributes(
        &self,
        item: &mut TelemetryItem,
        attributes: &BTreeMap<String, crate::spans::AttributeValue>,
    ) {
        for (key, value) in attributes {
            if key.starts_with(INTERNAL_ATTRIBUTE_PREFIX) {
                continue;
            }
            if key == AZURE_MESSAGE_BUS_DESTINATION || key == AZURE_NAMESPACE {
                continue;
            }
            if key == AI_SPAN_SOURCE_APP_ID || key == AI_SPAN_TARGET_APP_ID || key == AI_SPAN_SOURCE
            {
                continue;
            }
            if key == ENDUSER_ID {
                if let Some(value) = value.as_str() {
                    item.tags
                        .insert(context_tags::USER_ID.to_string(), value.to_string());
                    continue;
                }
            }
            if key == HTTP_USER_AGENT {
                if let Some(value) = value.as_str() {
                    item.tags
                        .insert(context_tags::USER_AGENT.to_string(), value.to_string());
                    continue;
                }
            }
            if key == AI_PREVIEW_INSTRUMENTATION_KEY {
                if let Some(value) = value.as_str() {
                    item.i_key = value.to_string();
                    continue;
                }
            }
            if key == AI_PREVIEW_SERVICE_NAME {
                if let Some(value) = value.as_str() {
                    item.tags
                        .insert(context_tags::CLOUD_ROLE.to_string(), value.to_string());
                    continue;
                }
            }
            if key == AI_PREVIEW_SERVICE_INSTANCE_ID {
                if let Some(value) = value.as_str() {
                    item.tags.insert(
                        context_tags::CLOUD_ROLE_INSTANCE.to_string(),
                        value.to_string(),
                    );
                    continue;
                }
            }
            if key == AI_PREVIEW_SERVICE_VERSION {
                if let Some(value) = value.as_str() {
                    item.tags.insert(
                        context_tags::APPLICATION_VERSION.to_string(),
                        value.to_string(),
                    );
                    continue;
                }
            }

            let prefix = key.split('.').next().unwrap_or(key);
            if STANDARD_ATTRIBUTE_PREFIXES.contains(&prefix) {
                continue;
            }
            item.data
                .base_data
                .properties_mut()
                .insert(key.clone(), value.render());
        }
    }
}

/// Spans named like URL paths get the HTTP method prepended.
fn telemetry_name(span: &Span) -> String {
    if !span.name.starts_with('/') {
        return span.name.clone();
    }
    match span.attr_str(HTTP_METHOD) {
        Some(method) if !method.is_empty() => format!("{method} {}", span.name),
        _ => span.name.clone(),
    }
}

fn parent_is_valid(span: &Span) -> bool {
    valid_parent(span).is_some()
}

fn valid_parent(span: &Span) -> Option<&str> {
    span.parent_span_id
        .as_deref()
        .filter(|id| context_tags::span_id_is_valid(id))
}

/// `peer.service` wins outright and never gets a port; otherwise
/// `net.peer.name`/`net.peer.ip` with `net.peer.port` appended unless it is
/// the scheme default.
fn target_from_peer_attributes(span: &Span, default_port: i64) -> Option<String> {
    if let Some(peer_service) = span.attr_str(PEER_SERVICE) {
        return Some(peer_service.to_string());
    }
    let target = span
        .attr_str(NET_PEER_NAME)
        .or_else(|| span.attr_str(NET_PEER_IP))?;
    match span.attr_i64(NET_PEER_PORT) {
        Some(port) if port != default_port => Some(format!("{target}:{port}")),
        _ => Some(target.to_string()),
    }
}

/// Derives a host[:port] target from `http.url`, omitting default and
/// unspecified ports.
fn target_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();
    // `Url::port` already strips the scheme default.
    match parsed.port() {
        Some(port) => Some(format!("{host}:{port}")),
        None => Some(host),
    }
}

fn apply_rpc_client_span(span: &Span, data: &mut RemoteDependencyData, rpc_system: &str) {
    data.dependency_type = Some(rpc_system.to_string());
    // not appending /rpc.service since that is too fine-grained for a target
    data.target = Some(
        target_from_peer_attributes(span, 0).unwrap_or_else(|| rpc_system.to_string()),
    );
}

fn apply_database_client_span(span: &Span, data: &mut RemoteDependencyData, db_system: &str) {
    let statement = span.attr_str(DB_STATEMENT);
    if SQL_DB_SYSTEMS.contains(&db_system) {
        data.dependency_type = Some("SQL".to_string());
        if let Some(statement) = statement {
            data.name = statement.to_string();
        }
    } else {
        data.dependency_type = Some(db_system.to_string());
    }
    data.data = statement.map(ToString::to_string);
    let target = null_aware_concat(
        target_from_peer_attributes(span, default_port_for_db_system(db_system)),
        span.attr_str(DB_NAME).map(ToString::to_string),
        "/",
    );
    data.target = Some(target.unwrap_or_else(|| db_system.to_string()));
}

fn apply_messaging_client_span(span: &Span, data: &mut RemoteDependencyData, messaging_system: &str) {
    data.dependency_type = if span.kind == SpanKind::Producer {
        Some(format!("Queue Message | {messaging_system}"))
    } else {
        // CONSUMER without a remote parent, and CLIENT polling
        Some(messaging_system.to_string())
    };
    data.target = Some(
        span.attr_str(MESSAGING_DESTINATION)
            .unwrap_or(messaging_system)
            .to_string(),
    );
}

fn apply_azure_sdk_span(span: &Span, data: &mut RemoteDependencyData, dependency_type: &str) {
    data.dependency_type = Some(dependency_type.to_string());
    data.target = null_aware_concat(
        span.attr_str(AZURE_PEER_ADDRESS).map(ToString::to_string),
        span.attr_str(AZURE_MESSAGE_BUS_DESTINATION)
            .map(ToString::to_string),
        "/",
    );
}

fn default_port_for_db_system(db_system: &str) -> i64 {
    match db_system {
        "mongodb" => 27017,
        "cassandra" => 9042,
        "redis" => 6379,
        "mariadb" | "mysql" => 3306,
        "mssql" => 1433,
        "db2" => 50000,
        "oracle" => 1521,
        "h2" => 8082,
        "derby" => 1527,
        "postgresql" => 5432,
        _ => 0,
    }
}

fn null_aware_concat(
    first: Option<String>,
    second: Option<String>,
    separator: &str,
) -> Option<String> {
    match (first, second) {
        (Some(first), Some(second)) => Some(format!("{first}{separator}{second}")),
        (Some(first), None) => Some(first),
        (None, second) => second,
    }
}

fn set_logger_properties(
    properties: &mut BTreeMap<String, String>,
    level: Option<&str>,
    logger_name: Option<&str>,
) {
    if let Some(level) = level {
        properties.insert("SourceType".to_string(), "Logger".to_string());
        properties.insert("LoggingLevel".to_string(), level.to_string());
    }
    if let Some(logger_name) = logger_name {
        properties.insert("LoggerName".to_string(), logger_name.to_string());
    }
}

fn add_links(span: &Span, properties: &mut BTreeMap<String, String>) {
    if span.links.is_empty() {
        return;
    }
    let mut rendered = String::from("[");
    for (i, link) in span.links.iter().enumerate() {
        if i > 0 {
            rendered.push(',');
        }
        rendered.push_str("{\"operation_Id\":\"");
        rendered.push_str(&link.trace_id);
        rendered.push_str("\",\"id\":\"");
        rendered.push_str(&link.span_id);
        rendered.push_str("\"}");
    }
    rendered.push(']');
    properties.insert(LINKS_PROPERTY.to_string(), rendered);
}

/// Sanitizes whatever accumulated in the properties map.
fn finish_properties(item: &mut TelemetryItem) {
    let properties = item.data.base_data.properties_mut();
    if properties.is_empty() {
        return;
    }
    let sanitized = sanitize_properties(properties);
    *properties = sanitized;
}

fn to_severity_level(level: &str) -> SeverityLevel {
    match level {
        "FATAL" => SeverityLevel::Critical,
        "ERROR" | "SEVERE" => SeverityLevel::Error,
        "WARN" | "WARNING" => SeverityLevel::Warning,
        "INFO" => SeverityLevel::Information,
        "DEBUG" | "TRACE" | "CONFIG" | "FINE" | "FINER" | "FINEST" | "ALL" => {
            SeverityLevel::Verbose
        }
        _ => SeverityLevel::Verbose,
    }
}
