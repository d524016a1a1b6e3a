//! Live metrics control loop against a stub QuickPulse service.

use appinsights_agent_native::config::Config;
use appinsights_agent_native::live_metrics::{QuickPulseDataCollector, QuickPulseSender};
use appinsights_agent_native::telemetry::envelope::{
    RequestData, TelemetryData, TelemetryItem, SCHEMA_VERSION,
};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct StubState {
    subscribed: Arc<AtomicBool>,
    pings: Arc<AtomicU32>,
    posts: Arc<AtomicU32>,
    post_bodies: Arc<Mutex<Vec<serde_json::Value>>>,
    seen_ikeys: Arc<Mutex<Vec<String>>>,
    last_headers: Arc<Mutex<HashMap<String, String>>>,
}

impl StubState {
    fn new(subscribed: bool) -> Self {
        Self {
            subscribed: Arc::new(AtomicBool::new(subscribed)),
            pings: Arc::new(AtomicU32::new(0)),
            posts: Arc::new(AtomicU32::new(0)),
            post_bodies: Arc::new(Mutex::new(Vec::new())),
            seen_ikeys: Arc::new(Mutex::new(Vec::new())),
            last_headers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn capture(&self, headers: &HeaderMap, query: &HashMap<String, String>) {
        if let Some(ikey) = query.get("ikey") {
            self.seen_ikeys.lock().unwrap().push(ikey.clone());
        }
        let mut captured = self.last_headers.lock().unwrap();
        captured.clear();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                captured.insert(name.as_str().to_string(), value.to_string());
            }
        }
    }

    fn subscribed_header(&self) -> [(&'static str, &'static str); 1] {
        if self.subscribed.load(Ordering::SeqCst) {
            [("x-ms-qps-subscribed", "true")]
        } else {
            [("x-ms-qps-subscribed", "false")]
        }
    }
}

async fn ping_handler(
    State(state): State<StubState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> (StatusCode, [(&'static str, &'static str); 1]) {
    state.pings.fetch_add(1, Ordering::SeqCst);
    state.capture(&headers, &query);
    (StatusCode::OK, state.subscribed_header())
}

async fn post_handler(
    State(state): State<StubState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, [(&'static str, &'static str); 1]) {
    state.posts.fetch_add(1, Ordering::SeqCst);
    state.capture(&headers, &query);
    if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&body) {
        state.post_bodies.lock().unwrap().push(parsed);
    }
    (StatusCode::OK, state.subscribed_header())
}

async fn start_stub(state: StubState) -> SocketAddr {
    let app = Router::new()
        .route("/QuickPulseService.svc/ping", post(ping_handler))
        .route("/QuickPulseService.svc/post", post(post_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr = listener.local_addr().expect("stub local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub");
    });
    addr
}

fn stub_config(addr: SocketAddr) -> Arc<Config> {
    Arc::new(
        Config::from_connection_string(&format!(
            "InstrumentationKey=ikey-1;LiveEndpoint=http://{addr}"
        ))
        .expect("parse connection string"),
    )
}

fn request_item(duration: &str) -> TelemetryItem {
    TelemetryItem::new(
        "ikey-1".to_string(),
        "2021-03-01T12:30:45.123456+00:00".to_string(),
        TelemetryData::Request(RequestData {
            ver: SCHEMA_VERSION,
            id: "00f067aa0ba902b7".to_string(),
            duration: duration.to_string(),
            success: true,
            response_code: "200".to_string(),
            ..RequestData::default()
        }),
    )
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let limit = tokio::time::Instant::now() + deadline;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < limit,
            "condition not met before deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn subscribes_and_streams_snapshots() {
    let state = StubState::new(true);
    let addr = start_stub(state.clone()).await;
    let config = stub_config(addr);
    let collector = Arc::new(QuickPulseDataCollector::new());

    let sender = QuickPulseSender::new(reqwest::Client::new(), config, Arc::clone(&collector))
        .with_intervals(Duration::from_millis(30), Duration::from_millis(30));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(sender.run(cancel.clone()));

    // the first ping subscribes and enables the collector
    wait_until(Duration::from_secs(5), || {
        state.pings.load(Ordering::SeqCst) >= 1 && collector.is_enabled()
    })
    .await;

    collector.add(&request_item("00.00:00:00.150000"));
    let posts_at_add = state.posts.load(Ordering::SeqCst);

    wait_until(Duration::from_secs(5), || {
        state.posts.load(Ordering::SeqCst) >= posts_at_add + 2
    })
    .await;

    cancel.cancel();
    task.await.unwrap();

    // control headers ride on every request
    let headers = state.last_headers.lock().unwrap().clone();
    assert!(headers.contains_key("x-ms-qps-stream-id"));
    assert!(headers.contains_key("x-ms-qps-machine-name"));
    assert!(headers.contains_key("x-ms-qps-instance-name"));
    assert_eq!(headers.get("x-ms-qps-invariant-version").unwrap(), "1");
    assert!(headers.contains_key("x-ms-qps-transmission-time"));

    // the ikey rides in the query string
    let ikeys = state.seen_ikeys.lock().unwrap().clone();
    assert!(ikeys.iter().all(|ikey| ikey == "ikey-1"));

    // some post body carried the recorded request
    let bodies = state.post_bodies.lock().unwrap().clone();
    assert!(!bodies.is_empty());
    let total_requests: f64 = bodies
        .iter()
        .filter_map(|body| body.as_array())
        .flatten()
        .filter_map(|point| point.get("Metrics"))
        .filter_map(|metrics| metrics.as_array())
        .flatten()
        .filter(|metric| metric["Name"] == "\\ApplicationInsights\\Requests/Sec")
        .filter_map(|metric| metric["Value"].as_f64())
        .sum();
    assert!((total_requests - 1.0).abs() < f64::EPSILON);

    // collector is closed on shutdown
    assert!(!collector.is_enabled());
}

#[tokio::test]
async fn unsubscribed_service_keeps_pinging_without_posts() {
    let state = StubState::new(false);
    let addr = start_stub(state.clone()).await;
    let config = stub_config(addr);
    let collector = Arc::new(QuickPulseDataCollector::new());

    let sender = QuickPulseSender::new(reqwest::Client::new(), config, Arc::clone(&collector))
        .with_intervals(Duration::from_millis(20), Duration::from_millis(20));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(sender.run(cancel.clone()));

    wait_until(Duration::from_secs(5), || {
        state.pings.load(Ordering::SeqCst) >= 3
    })
    .await;

    cancel.cancel();
    task.await.unwrap();

    assert_eq!(state.posts.load(Ordering::SeqCst), 0);
    assert!(!collector.is_enabled());
}

#[tokio::test]
async fn losing_the_subscriber_falls_back_to_ping() {
    let state = StubState::new(true);
    let addr = start_stub(state.clone()).await;
    let config = stub_config(addr);
    let collector = Arc::new(QuickPulseDataCollector::new());

    let sender = QuickPulseSender::new(reqwest::Client::new(), config, Arc::clone(&collector))
        .with_intervals(Duration::from_millis(20), Duration::from_millis(20));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(sender.run(cancel.clone()));

    wait_until(Duration::from_secs(5), || {
        state.posts.load(Ordering::SeqCst) >= 1
    })
    .await;

    // subscriber detaches; the loop must return to pinging
    state.subscribed.store(false, Ordering::SeqCst);
    let pings_before = state.pings.load(Ordering::SeqCst);
    wait_until(Duration::from_secs(5), || {
        state.pings.load(Ordering::SeqCst) > pings_before
    })
    .await;

    cancel.cancel();
    task.await.unwrap();
}
