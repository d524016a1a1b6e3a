//! Transmission behavior against a stub ingestion backend.

use appinsights_agent_native::config::Config;
use appinsights_agent_native::telemetry::envelope::{
    EventData, TelemetryData, TelemetryItem, SCHEMA_VERSION,
};
use appinsights_agent_native::transmission::TelemetryChannel;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct StubState {
    /// Remaining requests to answer with the configured failure status.
    fails_remaining: Arc<AtomicU32>,
    failure_status: StatusCode,
    requests: Arc<AtomicU32>,
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl StubState {
    fn new(fail_count: u32, failure_status: StatusCode) -> Self {
        Self {
            fails_remaining: Arc::new(AtomicU32::new(fail_count)),
            failure_status,
            requests: Arc::new(AtomicU32::new(0)),
            bodies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    fn delivered_bodies(&self) -> Vec<Vec<u8>> {
        self.bodies.lock().unwrap().clone()
    }
}

async fn track_handler(State(state): State<StubState>, body: Bytes) -> StatusCode {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let remaining = state.fails_remaining.load(Ordering::SeqCst);
    if remaining > 0 {
        state.fails_remaining.store(remaining - 1, Ordering::SeqCst);
        return state.failure_status;
    }
    state.bodies.lock().unwrap().push(body.to_vec());
    StatusCode::OK
}

async fn start_stub(state: StubState) -> SocketAddr {
    let app = Router::new()
        .route("/v2.1/track", post(track_handler))
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

fn stub_config(addr: SocketAddr, spool_dir: &std::path::Path) -> Config {
    let mut config = Config::from_connection_string(&format!(
        "InstrumentationKey=ikey-1;IngestionEndpoint=http://{addr}"
    ))
    .expect("parse connection string");
    config.spool_dir = spool_dir.to_path_buf();
    config.retry_backoff_base_ms = 5;
    config.retry_backoff_max_ms = 40;
    config
}

fn event_item(name: &str) -> TelemetryItem {
    TelemetryItem::new(
        "ikey-1".to_string(),
        "2021-03-01T12:30:45.123456+00:00".to_string(),
        TelemetryData::Event(EventData {
            ver: SCHEMA_VERSION,
            name: name.to_string(),
            ..EventData::default()
        }),
    )
}

fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).expect("gunzip body");
    out
}

fn spool_file_count(dir: &std::path::Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|extension| extension == "trn")
            })
            .count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn batch_survives_transient_failures_without_duplicates() {
    let state = StubState::new(3, StatusCode::SERVICE_UNAVAILABLE);
    let addr = start_stub(state.clone()).await;
    let spool_dir = tempfile::tempdir().expect("tempdir");
    let channel = TelemetryChannel::new(Arc::new(stub_config(addr, spool_dir.path())));

    for i in 0..10 {
        channel.enqueue(event_item(&format!("event-{i}"))).unwrap();
    }
    channel.flush(Duration::from_secs(10)).await.unwrap();

    // three 503s then one success: exactly one batch delivered, three retries
    assert_eq!(state.request_count(), 4);
    let bodies = state.delivered_bodies();
    assert_eq!(bodies.len(), 1);
    let lines: Vec<String> = String::from_utf8(gunzip(&bodies[0]))
        .unwrap()
        .lines()
        .map(ToString::to_string)
        .collect();
    assert_eq!(lines.len(), 10);
    for (i, line) in lines.iter().enumerate() {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["data"]["baseData"]["name"], format!("event-{i}"));
    }

    // retries happened in memory, nothing was spooled
    assert_eq!(spool_file_count(spool_dir.path()), 0);
    assert_eq!(channel.dropped_count(), 0);
}

#[tokio::test]
async fn permanent_rejection_drops_batch_without_retry() {
    let state = StubState::new(u32::MAX, StatusCode::BAD_REQUEST);
    let addr = start_stub(state.clone()).await;
    let spool_dir = tempfile::tempdir().expect("tempdir");
    let channel = TelemetryChannel::new(Arc::new(stub_config(addr, spool_dir.path())));

    for i in 0..5 {
        channel.enqueue(event_item(&format!("event-{i}"))).unwrap();
    }
    channel.flush(Duration::from_secs(5)).await.unwrap();

    // a 400 is not retried and not spooled
    assert_eq!(state.request_count(), 1);
    assert!(state.delivered_bodies().is_empty());
    assert_eq!(spool_file_count(spool_dir.path()), 0);
}

#[tokio::test]
async fn sustained_outage_spools_then_drainer_replays() {
    let state = StubState::new(3, StatusCode::SERVICE_UNAVAILABLE);
    let addr = start_stub(state.clone()).await;
    let spool_dir = tempfile::tempdir().expect("tempdir");
    let mut config = stub_config(addr, spool_dir.path());
    // give up fast so the batch lands in the spool while the outage is on
    config.max_dispatch_attempts = 3;
    config.spool_drain_interval_ms = 25;
    let channel = TelemetryChannel::new(Arc::new(config));

    channel.enqueue(event_item("survivor")).unwrap();
    channel.flush(Duration::from_secs(5)).await.unwrap();

    // all three attempts failed; the batch is on disk, nothing delivered
    assert_eq!(state.request_count(), 3);
    assert_eq!(spool_file_count(spool_dir.path()), 1);
    assert!(state.delivered_bodies().is_empty());

    // backend is healthy again; the drainer must replay the spooled batch
    channel.spawn_workers();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !state.delivered_bodies().is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "spooled batch was never replayed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let bodies = state.delivered_bodies();
    let text = String::from_utf8(gunzip(&bodies[0])).unwrap();
    assert!(text.contains("survivor"));

    // acknowledged: the spool file is gone
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while spool_file_count(spool_dir.path()) != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "spool file was not removed after ack"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    channel.shutdown().await;
}

#[tokio::test]
async fn shutdown_flushes_buffered_envelopes() {
    let state = StubState::new(0, StatusCode::OK);
    let addr = start_stub(state.clone()).await;
    let spool_dir = tempfile::tempdir().expect("tempdir");
    let channel = TelemetryChannel::new(Arc::new(stub_config(addr, spool_dir.path())));
    channel.spawn_workers();

    for i in 0..3 {
        channel.enqueue(event_item(&format!("event-{i}"))).unwrap();
    }
    channel.shutdown().await;

    let total_lines: usize = state
        .delivered_bodies()
        .iter()
        .map(|body| String::from_utf8(gunzip(body)).unwrap().lines().count())
        .sum();
    assert_eq!(total_lines, 3);
    assert_eq!(spool_file_count(spool_dir.path()), 0);
}
