//! The QuickPulse control loop.
//!
//! While no subscriber is attached the sender pings the control endpoint
//! every 5 seconds; once the `x-ms-qps-subscribed` header flips to `true` it
//! streams one counter snapshot per second to the post endpoint. A non-200,
//! a missing/false subscribed header, or a send failure falls back to
//! pinging without discarding counters. A redirect header switches the
//! endpoint immediately and a polling-interval hint adjusts the ping
//! cadence.

use crate::config::Config;
use crate::live_metrics::collector::{FinalCounters, QuickPulseDataCollector};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const HEADER_TRANSMISSION_TIME: &str = "x-ms-qps-transmission-time";
const HEADER_STREAM_ID: &str = "x-ms-qps-stream-id";
const HEADER_MACHINE_NAME: &str = "x-ms-qps-machine-name";
const HEADER_ROLE_NAME: &str = "x-ms-qps-role-name";
const HEADER_INSTANCE_NAME: &str = "x-ms-qps-instance-name";
const HEADER_INVARIANT_VERSION: &str = "x-ms-qps-invariant-version";

const HEADER_SUBSCRIBED: &str = "x-ms-qps-subscribed";
const HEADER_POLLING_INTERVAL_HINT: &str = "x-ms-qps-service-polling-interval-hint";
const HEADER_ENDPOINT_REDIRECT: &str = "x-ms-qps-service-endpoint-redirect";

/// Offset between the Unix epoch and the .NET tick epoch (0001-01-01), in
/// 100ns ticks.
const TICKS_AT_EPOCH: u64 = 621_355_968_000_000_000;
const TICKS_PER_MILLI: u64 = 10_000;

const INVARIANT_VERSION: i32 = 1;

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_POST_INTERVAL: Duration = Duration::from_secs(1);

/// Control-loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveMetricsState {
    Disabled,
    PingPending,
    Streaming,
}

/// Signals extracted from a control response's headers.
#[derive(Debug, Default, PartialEq)]
struct HeaderSignal {
    subscribed: Option<bool>,
    redirect: Option<String>,
    polling_hint_ms: Option<u64>,
}

fn parse_headers(headers: &reqwest::header::HeaderMap) -> HeaderSignal {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    HeaderSignal {
        subscribed: header_str(HEADER_SUBSCRIBED).map(|value| value.eq_ignore_ascii_case("true")),
        redirect: header_str(HEADER_ENDPOINT_REDIRECT).map(ToString::to_string),
        polling_hint_ms: header_str(HEADER_POLLING_INTERVAL_HINT)
            .and_then(|value| value.parse().ok()),
    }
}

/// Milliseconds since the Unix epoch rendered as .NET ticks.
fn transmission_time_ticks(now: SystemTime) -> u64 {
    let millis = now
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64);
    millis * TICKS_PER_MILLI + TICKS_AT_EPOCH
}

/// One entry of the post body's metrics array.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MetricPoint {
    name: &'static str,
    value: f64,
    weight: u64,
}

/// The post body document: one snapshot of this instance.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MonitoringDataPoint {
    version: String,
    invariant_version: i32,
    instance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    role_name: Option<String>,
    machine_name: String,
    stream_id: String,
    timestamp: String,
    metrics: Vec<MetricPoint>,
    documents: Vec<serde_json::Value>,
}

fn build_metrics(counters: &FinalCounters) -> Vec<MetricPoint> {
    let average = |total_ms: u64, count: u64| {
        if count == 0 {
            0.0
        } else {
            total_ms as f64 / count as f64
        }
    };
    vec![
        MetricPoint {
            name: "\\ApplicationInsights\\Requests/Sec",
            value: counters.requests as f64,
            weight: 1,
        },
        MetricPoint {
            name: "\\ApplicationInsights\\Request Duration",
            value: average(counters.requests_duration_ms, counters.requests),
            weight: counters.requests.max(1),
        },
        MetricPoint {
            name: "\\ApplicationInsights\\Requests Failed/Sec",
            value: f64::from(counters.unsuccessful_requests),
            weight: 1,
        },
        MetricPoint {
            name: "\\ApplicationInsights\\Dependency Calls/Sec",
            value: counters.dependencies as f64,
            weight: 1,
        },
        MetricPoint {
            name: "\\ApplicationInsights\\Dependency Call Duration",
            value: average(counters.dependencies_duration_ms, counters.dependencies),
            weight: counters.dependencies.max(1),
        },
        MetricPoint {
            name: "\\ApplicationInsights\\Dependency Calls Failed/Sec",
            value: f64::from(counters.unsuccessful_dependencies),
            weight: 1,
        },
        MetricPoint {
            name: "\\ApplicationInsights\\Exceptions/Sec",
            value: f64::from(counters.exceptions),
            weight: 1,
        },
        MetricPoint {
            name: "\\Memory\\Committed Bytes",
            value: counters.memory_committed,
            weight: 1,
        },
        MetricPoint {
            name: "\\Processor(_Total)\\% Processor Time",
            value: counters.cpu_usage,
            weight: 1,
        },
    ]
}

/// Runs the ping/post loop against the live metrics endpoint.
pub struct QuickPulseSender {
    client: reqwest::Client,
    config: Arc<Config>,
    collector: Arc<QuickPulseDataCollector>,
    stream_id: String,
    machine_name: String,
    instance_name: String,
    ping_interval: Duration,
    post_interval: Duration,
}

impl QuickPulseSender {
    /// Creates a sender with a fresh stream id.
    ///
    /// # Arguments
    ///
    /// * `client` - HTTP client shared with the rest of the agent
    /// * `config` - Agent configuration (live endpoint, tenant key, role)
    /// * `collector` - The collector this sender enables and snapshots
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        config: Arc<Config>,
        collector: Arc<QuickPulseDataCollector>,
    ) -> Self {
        let machine_name = machine_name();
        let instance_name = config
            .role_instance
            .clone()
            .unwrap_or_else(|| machine_name.clone());
        Self {
            client,
            config,
            collector,
            stream_id: Uuid::new_v4().simple().to_string(),
            machine_name,
            instance_name,
            ping_interval: DEFAULT_PING_INTERVAL,
            post_interval: DEFAULT_POST_INTERVAL,
        }
    }

    /// Overrides the ping/post cadence; the stub-backend tests shrink both.
    ///
    /// # Arguments
    ///
    /// * `ping_interval` - Idle cadence of the control ping (default 5s)
    /// * `post_interval` - Snapshot cadence while streaming (default 1s)
    #[must_use]
    pub fn with_intervals(mut self, ping_interval: Duration, post_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.post_interval = post_interval;
        self
    }

    /// Drives the control loop until cancelled.
    ///
    /// Consumes the sender; run it on its own task. The collector is
    /// enabled when the service subscribes and disabled when the loop
    /// exits.
    ///
    /// # Arguments
    ///
    /// * `cancel` - Cooperative cancellation; honored between ticks and
    ///   while sleeping
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let sender = QuickPulseSender::new(client, config, collector);
    /// let cancel = CancellationToken::new();
    /// tokio::spawn(sender.run(cancel.clone()));
    /// // later: cancel.cancel();
    /// ```
    pub async fn run(self, cancel: CancellationToken) {
        let mut state = LiveMetricsState::PingPending;
        let mut endpoint = self.config.live_endpoint.clone();
        let mut ping_interval = self.ping_interval;

        loop {
            let sleep_for = match state {
                LiveMetricsState::Streaming => self.post_interval,
                _ => ping_interval,
            };
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(sleep_for) => {}
            }

            let signal = match state {
                LiveMetricsState::Streaming => self.post(&endpoint).await,
                _ => self.ping(&endpoint).await,
            };

            let Some(signal) = signal else {
                // Send failure: drop back to pinging, counters stay.
                if state == LiveMetricsState::Streaming {
                    debug!("live metrics post failed, returning to ping");
                }
                state = LiveMetricsState::PingPending;
                continue;
            };

            if let Some(redirect) = signal.redirect {
                debug!("live metrics endpoint redirected to {redirect}");
                endpoint = redirect.trim_end_matches('/').to_string();
            }
            if let Some(hint_ms) = signal.polling_hint_ms {
                if hint_ms > 0 {
                    ping_interval = Duration::from_millis(hint_ms);
                }
            }

            state = if signal.subscribed == Some(true) {
                self.collector
                    .ensure_enabled(&self.config.instrumentation_key);
                LiveMetricsState::Streaming
            } else {
                LiveMetricsState::PingPending
            };
        }

        self.collector.disable();
        debug!("live metrics sender stopped");
    }

    async fn ping(&self, endpoint: &str) -> Option<HeaderSignal> {
        let url = self.config.quick_pulse_ping_url(endpoint);
        let response = self
            .request(&url)
            .body("{}")
            .send()
            .await
            .map_err(|e| warn!("live metrics ping failed: {e}"))
            .ok()?;
        if response.status() != reqwest::StatusCode::OK {
            return None;
        }
        Some(parse_headers(response.headers()))
    }

    async fn post(&self, endpoint: &str) -> Option<HeaderSignal> {
        let counters = self.collector.get_and_restart()?;
        let body = vec![MonitoringDataPoint {
            version: crate::SDK_VERSION.to_string(),
            invariant_version: INVARIANT_VERSION,
            instance: self.instance_name.clone(),
            role_name: self.config.role_name.clone(),
            machine_name: self.machine_name.clone(),
            stream_id: self.stream_id.clone(),
            timestamp: format!(
                "/Date({})/",
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |elapsed| elapsed.as_millis())
            ),
            metrics: build_metrics(&counters),
            documents: Vec::new(),
        }];

        let url = self.config.quick_pulse_post_url(endpoint);
        let response = self
            .request(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| warn!("live metrics post failed: {e}"))
            .ok()?;
        if response.status() != reqwest::StatusCode::OK {
            return None;
        }
        Some(parse_headers(response.headers()))
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header(
                HEADER_TRANSMISSION_TIME,
                transmission_time_ticks(SystemTime::now()).to_string(),
            )
            .header(HEADER_STREAM_ID, self.stream_id.as_str())
            .header(HEADER_MACHINE_NAME, self.machine_name.as_str())
            .header(
                HEADER_ROLE_NAME,
                self.config.role_name.as_deref().unwrap_or_default(),
            )
            .header(HEADER_INSTANCE_NAME, self.instance_name.as_str())
            .header(HEADER_INVARIANT_VERSION, INVARIANT_VERSION.to_string())
    }
}

fn machine_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
