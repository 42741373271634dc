use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use health::HealthRegistry;
use ingest::api::IngestError;
use ingest::auth::AdmissionGate;
use ingest::event::ProcessedEvent;
use ingest::keys::{MockKeyStore, Quota};
use ingest::redis::MockCounterClient;
use ingest::router::router;
use ingest::sink::Event;
use ingest::time::FixedTime;

const KEY: &str = "ak_test_secret";

#[derive(Clone, Default)]
struct MemorySink {
    events: Arc<Mutex<Vec<ProcessedEvent>>>,
}

impl MemorySink {
    fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn events(&self) -> Vec<ProcessedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Event for MemorySink {
    async fn send(&self, event: ProcessedEvent) -> Result<(), IngestError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), IngestError> {
        self.events.lock().unwrap().extend_from_slice(&events);
        Ok(())
    }
}

/// Sink standing in for an unreachable broker: every hand-off is refused
/// as retryable.
struct BrokenSink {}

#[async_trait]
impl Event for BrokenSink {
    async fn send(&self, _event: ProcessedEvent) -> Result<(), IngestError> {
        Err(IngestError::Unavailable("broker"))
    }

    async fn send_batch(&self, _events: Vec<ProcessedEvent>) -> Result<(), IngestError> {
        Err(IngestError::Unavailable("broker"))
    }
}

fn app<S: Event + Send + Sync + 'static>(
    keys: MockKeyStore,
    counter: MockCounterClient,
    sink: S,
) -> Router {
    let gate = AdmissionGate::new(Arc::new(keys), Arc::new(counter));
    let liveness = HealthRegistry::new("liveness");

    router(
        FixedTime {
            time: "2024-03-01T12:00:01Z".to_string(),
        },
        liveness,
        sink,
        gate,
        false,
    )
}

fn post(path: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }

    let mut request = builder.body(Body::from(body.to_string())).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 7], 45000))));
    request
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn valid_event(id: &str) -> Value {
    json!({
        "event_id": id,
        "event_type": "interaction",
        "event_name": "button_click",
        "event_time": "2024-03-01T12:00:00Z",
        "user_id": "u1",
        "session_id": "s1",
        "page_name": "home",
        "device_type": "mobile",
        "platform": "ios",
        "content": {"title": "hello"}
    })
}

fn valid_batch(ids: &[&str]) -> Value {
    json!({
        "batchId": "batch-1",
        "sentAt": "2024-03-01T12:00:00.500Z",
        "clientInfo": {
            "sdkVersion": "2.1.0",
            "deviceId": "device-42",
            "appBuild": "900"
        },
        "events": ids.iter().map(|id| valid_event(id)).collect::<Vec<_>>()
    })
}

#[tokio::test]
async fn accepts_a_valid_single_event() {
    let keys = MockKeyStore::new().with_key(KEY, Quota::default(), None);
    let sink = MemorySink::default();
    let app = app(keys, MockCounterClient::new(), sink.clone());

    let response = app
        .oneshot(post("/ingest", Some(KEY), valid_event("evt-1")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["eventId"], "evt-1");

    assert_eq!(sink.len(), 1);
    let stored: Value = serde_json::from_str(&sink.events()[0].data).unwrap();
    assert_eq!(stored["event_id"], "evt-1");
    assert_eq!(stored["ingestedAt"], "2024-03-01T12:00:01Z");
}

#[tokio::test]
async fn accepts_a_valid_batch() {
    let keys = MockKeyStore::new().with_key(KEY, Quota::default(), None);
    let sink = MemorySink::default();
    let app = app(keys, MockCounterClient::new(), sink.clone());

    let response = app
        .oneshot(post(
            "/ingest/batch",
            Some(KEY),
            valid_batch(&["evt-1", "evt-2", "evt-3"]),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["batchId"], "batch-1");
    assert_eq!(body["eventsProcessed"], 3);

    assert_eq!(sink.len(), 3);
    let stored: Value = serde_json::from_str(&sink.events()[0].data).unwrap();
    assert_eq!(stored["batchId"], "batch-1");
    assert_eq!(stored["batchSentAt"], "2024-03-01T12:00:00.500Z");
    assert_eq!(stored["clientInfo"]["deviceId"], "device-42");
}

#[tokio::test]
async fn quota_of_two_gives_two_successes_then_429() {
    let keys = MockKeyStore::new().with_key(
        KEY,
        Quota {
            requests: 2,
            window_secs: 60,
        },
        None,
    );
    let sink = MemorySink::default();
    let app = app(keys, MockCounterClient::new(), sink.clone());

    let mut statuses = Vec::new();
    for i in 0..3 {
        let response = app
            .clone()
            .oneshot(post("/ingest", Some(KEY), valid_event(&format!("evt-{i}"))))
            .await
            .unwrap();
        statuses.push(response.status());
    }

    assert_eq!(
        statuses,
        vec![
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );
    assert_eq!(sink.len(), 2);
}

#[tokio::test]
async fn unknown_key_is_401_and_consumes_no_quota() {
    let keys = MockKeyStore::new().with_key(KEY, Quota::default(), None);
    let counter = MockCounterClient::new();
    let sink = MemorySink::default();
    let app = app(keys, counter.clone(), sink.clone());

    let response = app
        .clone()
        .oneshot(post("/ingest", Some("ak_wrong"), valid_event("evt-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(post("/ingest", None, valid_event("evt-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(counter.total_count(), 0);
    assert_eq!(sink.len(), 0);
}

#[tokio::test]
async fn ip_allowlist_is_enforced() {
    let keys = MockKeyStore::new().with_key(
        KEY,
        Quota::default(),
        Some(vec!["198.51.100.1".to_string()]),
    );
    let sink = MemorySink::default();
    let app = app(keys, MockCounterClient::new(), sink.clone());

    let response = app
        .clone()
        .oneshot(post("/ingest", Some(KEY), valid_event("evt-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(sink.len(), 0);

    let mut allowed = post("/ingest", Some(KEY), valid_event("evt-1"));
    allowed
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 1], 45000))));
    let response = app.oneshot(allowed).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn invalid_batch_reports_every_violation() {
    let keys = MockKeyStore::new().with_key(KEY, Quota::default(), None);
    let sink = MemorySink::default();
    let app = app(keys, MockCounterClient::new(), sink.clone());

    // Missing sentAt, one event missing user_id, another with a bogus
    // device type.
    let mut batch = valid_batch(&["evt-1", "evt-2"]);
    batch.as_object_mut().unwrap().remove("sentAt");
    batch["events"][0].as_object_mut().unwrap().remove("user_id");
    batch["events"][1]["device_type"] = json!("smart_fridge");

    let response = app
        .oneshot(post("/ingest/batch", Some(KEY), batch))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    let details = body["details"].as_array().unwrap();
    assert_eq!(details.len(), 3);

    let fields: Vec<&str> = details
        .iter()
        .map(|v| v["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"/sentAt"));
    assert!(fields.contains(&"/events/0/user_id"));
    assert!(fields.contains(&"/events/1/device_type"));

    assert_eq!(sink.len(), 0);
}

#[tokio::test]
async fn rejected_requests_still_consume_quota() {
    let keys = MockKeyStore::new().with_key(
        KEY,
        Quota {
            requests: 2,
            window_secs: 60,
        },
        None,
    );
    let sink = MemorySink::default();
    let app = app(keys, MockCounterClient::new(), sink.clone());

    // Two malformed submissions burn the quota.
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post("/ingest", Some(KEY), json!({"event_id": "evt-1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    let response = app
        .oneshot(post("/ingest", Some(KEY), valid_event("evt-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(sink.len(), 0);
}

#[tokio::test]
async fn counter_outage_fails_closed_with_503() {
    let keys = MockKeyStore::new().with_key(KEY, Quota::default(), None);
    let counter = MockCounterClient::new();
    counter.set_failing(true);
    let sink = MemorySink::default();
    let app = app(keys, counter, sink.clone());

    let response = app
        .oneshot(post("/ingest", Some(KEY), valid_event("evt-1")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(sink.len(), 0);
}

#[tokio::test]
async fn liveness_needs_no_credentials() {
    let keys = MockKeyStore::new();
    let app = app(keys, MockCounterClient::new(), MemorySink::default());

    let mut request = Request::builder()
        .method("GET")
        .uri("/_liveness")
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 7], 45000))));

    let response = app.oneshot(request).await.unwrap();

    // No components registered yet: reachable, but not healthy.
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn broker_outage_fails_the_single_event_as_retryable() {
    let keys = MockKeyStore::new().with_key(KEY, Quota::default(), None);
    let app = app(keys, MockCounterClient::new(), BrokenSink {});

    let response = app
        .oneshot(post("/ingest", Some(KEY), valid_event("evt-1")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Service unavailable");
}

#[tokio::test]
async fn broker_outage_fails_the_whole_batch_as_retryable() {
    let keys = MockKeyStore::new().with_key(KEY, Quota::default(), None);
    let app = app(keys, MockCounterClient::new(), BrokenSink {});

    let response = app
        .oneshot(post(
            "/ingest/batch",
            Some(KEY),
            valid_batch(&["evt-1", "evt-2", "evt-3"]),
        ))
        .await
        .unwrap();

    // The whole submission is reported retryable; no partial success
    // reaches the client.
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Service unavailable");
    assert!(body.get("eventsProcessed").is_none());
}

#[tokio::test]
async fn index_needs_no_credentials() {
    let keys = MockKeyStore::new();
    let app = app(keys, MockCounterClient::new(), MemorySink::default());

    let mut request = Request::builder()
        .method("GET")
        .uri("/")
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 7], 45000))));

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
