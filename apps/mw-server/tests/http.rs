use std::collections::VecDeque;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use mw_core::Config;
use mw_events::LocalBus;
use mw_kernel::{HeartbeatRow, Kernel};
use mw_server::{build_router, AppState};
use mw_topics::TOPIC_TASKS_CHANGED;
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::time::timeout;
use tower::util::ServiceExt;

fn build_state(dir: &std::path::Path) -> AppState {
    let kernel = Kernel::open(dir).expect("init kernel for tests");
    AppState::new(kernel, LocalBus::new(64), Config::default())
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.expect("response");
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn parse_sse_events(buffer: &mut String) -> Vec<SseRecord> {
    let mut out = Vec::new();
    while let Some(idx) = buffer.find("\n\n") {
        let event_chunk = buffer[..idx].to_string();
        *buffer = buffer[idx + 2..].to_string();
        if !event_chunk.trim().is_empty() {
            out.push(SseRecord::from_chunk(&event_chunk));
        }
    }
    out
}

#[derive(Debug, Default, Clone)]
struct SseRecord {
    event: Option<String>,
    retry: Option<String>,
    data: Option<String>,
}

impl SseRecord {
    fn from_chunk(chunk: &str) -> Self {
        let mut record = Self::default();
        for line in chunk.lines() {
            if let Some(rest) = line.strip_prefix("event: ") {
                record.event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("retry: ") {
                record.retry = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data: ") {
                record.data = Some(rest.trim().to_string());
            }
        }
        record
    }

    fn json(&self) -> Value {
        self.data
            .as_ref()
            .and_then(|d| serde_json::from_str(d).ok())
            .expect("event data json")
    }
}

/// Incremental reader over an SSE response body.
struct SseReader {
    body: Body,
    buffer: String,
    queue: VecDeque<SseRecord>,
}

impl SseReader {
    fn new(body: Body) -> Self {
        Self {
            body,
            buffer: String::new(),
            queue: VecDeque::new(),
        }
    }

    async fn next(&mut self) -> SseRecord {
        loop {
            if let Some(ev) = self.queue.pop_front() {
                return ev;
            }
            let frame = timeout(Duration::from_secs(3), self.body.frame())
                .await
                .expect("frame available in time")
                .expect("frame present")
                .expect("frame data");
            let bytes = frame.into_data().expect("data frame");
            self.buffer.push_str(&String::from_utf8_lossy(&bytes));
            self.queue.extend(parse_sse_events(&mut self.buffer));
        }
    }

    async fn next_event(&mut self, event: &str) -> SseRecord {
        loop {
            let ev = self.next().await;
            if ev.event.as_deref() == Some(event) {
                return ev;
            }
        }
    }
}

#[tokio::test]
async fn healthz_reports_ok() {
    let temp = tempdir().expect("tempdir");
    let app = build_router(build_state(temp.path()));
    let (status, body) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
}

#[tokio::test]
async fn worker_status_follows_the_heartbeat_record() {
    let temp = tempdir().expect("tempdir");
    let state = build_state(temp.path());
    let app = build_router(state.clone());

    let (status, body) = send(&app, get("/state/worker")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["online"], json!(false));
    assert!(body["lagMs"].is_null());

    let now = chrono::Utc::now();
    let stamp = |t: chrono::DateTime<chrono::Utc>| {
        t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    };
    state
        .kernel()
        .put_heartbeat_async(&HeartbeatRow {
            last_heartbeat_at: stamp(now - chrono::Duration::seconds(10)),
            started_at: stamp(now - chrono::Duration::hours(1)),
            process_identity: "worker:7".into(),
        })
        .await
        .expect("heartbeat");

    let (_, body) = send(&app, get("/state/worker")).await;
    assert_eq!(body["online"], json!(true));
    let lag = body["lagMs"].as_i64().expect("lag");
    assert!((10_000..15_000).contains(&lag), "lag {lag}");
    assert_eq!(body["processIdentity"], json!("worker:7"));
    assert_eq!(body["staleAfterMs"], json!(90_000));
}

#[tokio::test]
async fn admin_mutations_are_visible_in_snapshots() {
    let temp = tempdir().expect("tempdir");
    let app = build_router(build_state(temp.path()));

    let (status, row) = send(
        &app,
        post_json(
            "/admin/tasks",
            json!({"id": "t1", "sourceChannelId": "chan-a", "taskType": "mirror", "status": "queued"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(row["id"], json!("t1"));

    send(
        &app,
        post_json(
            "/admin/tasks",
            json!({"id": "t2", "sourceChannelId": "chan-b", "taskType": "mirror", "status": "queued"}),
        ),
    )
    .await;

    let (status, row) = send(
        &app,
        post_json(
            "/admin/tasks/t1/status",
            json!({"status": "failed", "error": "upstream timeout"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(row["status"], json!("failed"));
    assert_eq!(row["lastError"], json!("upstream timeout"));

    let (_, snap) = send(&app, get("/state/tasks?channel=chan-a")).await;
    let tasks = snap["tasks"].as_array().expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["id"], json!("t1"));

    let (_, snap) = send(&app, get("/state/tasks?limit=1")).await;
    assert_eq!(snap["tasks"].as_array().map(|t| t.len()), Some(1));
}

#[tokio::test]
async fn unknown_task_status_update_is_not_found() {
    let temp = tempdir().expect("tempdir");
    let app = build_router(build_state(temp.path()));
    let (status, body) = send(
        &app,
        post_json("/admin/tasks/nope/status", json!({"status": "running"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], json!(404));
    assert_eq!(body["title"], json!("Not Found"));
}

#[tokio::test]
async fn empty_ids_are_rejected() {
    let temp = tempdir().expect("tempdir");
    let app = build_router(build_state(temp.path()));
    let (status, body) = send(
        &app,
        post_json(
            "/admin/tasks",
            json!({"id": " ", "taskType": "mirror", "status": "queued"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], json!("about:blank"));
}

#[tokio::test]
async fn task_stream_pushes_baseline_then_changes() {
    let temp = tempdir().expect("tempdir");
    let state = build_state(temp.path());
    let app = build_router(state.clone());

    send(
        &app,
        post_json(
            "/admin/tasks",
            json!({"id": "t1", "sourceChannelId": "chan-a", "taskType": "mirror", "status": "queued"}),
        ),
    )
    .await;

    let resp = app
        .clone()
        .oneshot(get("/events/tasks?channel=chan-a&min_interval_ms=100"))
        .await
        .expect("sse response");
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let mut sse = SseReader::new(resp.into_body());

    let preamble = sse.next().await;
    assert_eq!(preamble.retry.as_deref(), Some("3000"));
    assert!(preamble.event.is_none());

    let baseline = sse.next_event("tasks").await.json();
    assert_eq!(baseline["tasks"][0]["status"], json!("queued"));
    assert_eq!(state.bus().subscriber_count(TOPIC_TASKS_CHANGED), 1);

    send(
        &app,
        post_json("/admin/tasks/t1/status", json!({"status": "running"})),
    )
    .await;
    let update = sse.next_event("tasks").await.json();
    assert_eq!(update["tasks"][0]["status"], json!("running"));
    assert!(update["ts"].as_str().is_some());

    // Disconnecting releases the session's subscription.
    drop(sse);
    let released = timeout(Duration::from_secs(3), async {
        while state.bus().subscriber_count(TOPIC_TASKS_CHANGED) != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "subscription not released");
}

#[tokio::test]
async fn shutdown_token_ends_open_streams() {
    let temp = tempdir().expect("tempdir");
    let state = build_state(temp.path());
    let app = build_router(state.clone());

    let resp = app
        .clone()
        .oneshot(get("/events/tasks"))
        .await
        .expect("sse response");
    let mut sse = SseReader::new(resp.into_body());
    sse.next_event("tasks").await;

    state.shutdown_token().cancel();
    let ended = timeout(Duration::from_secs(3), async {
        while let Some(frame) = sse.body.frame().await {
            if frame.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "stream did not end after shutdown");
    assert_eq!(state.bus().subscriber_count(TOPIC_TASKS_CHANGED), 0);
}
