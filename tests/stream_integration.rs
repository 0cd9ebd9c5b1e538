//! Integration tests for the task API and stream readers.
//!
//! Each test spins up an Axum server on a random port, drives it with
//! reqwest and tokio-tungstenite, and checks the real HTTP / SSE / WS contract.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use stream_relay::JobKey;
use stream_relay::api;
use stream_relay::cache::{Fragment, FragmentCache, FragmentLog};
use stream_relay::executor::{Executor, FragmentStream, ScriptedExecutor, ScriptedStep};
use stream_relay::store::{HistoryStore, LibSqlHistory};
use stream_relay::tasks::supervisor::STOPPED_BY_USER;
use stream_relay::tasks::{
    DescriptorStore, SupervisorConfig, TaskDescriptor, TaskParams, TaskSupervisor,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Executor whose behaviour is picked per request through `options`:
/// `fragments` (array of strings), `delay_ms`, and `hang` to keep the job
/// open after the last fragment.
struct OptionsExecutor;

impl Executor for OptionsExecutor {
    fn name(&self) -> &str {
        "options"
    }

    fn run(&self, key: &JobKey, params: &TaskParams) -> FragmentStream {
        let fragments: Vec<String> = params
            .options
            .get("fragments")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let delay = params
            .options
            .get("delay_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut script = ScriptedExecutor::fragments(fragments, Duration::from_millis(delay));
        if params.options.get("hang").and_then(Value::as_bool) == Some(true) {
            script = script.then(ScriptedStep::Hang);
        }
        script.run(key, params)
    }
}

/// Build storage under `dir`, run startup recovery, and serve on a random port.
async fn start_server_in(dir: &Path) -> (u16, Arc<TaskSupervisor>) {
    let cache = Arc::new(FragmentCache::open(dir.join("wal"), 64).await.unwrap());
    let descriptors = Arc::new(DescriptorStore::open(dir.join("tasks")).await.unwrap());
    let history: Arc<dyn HistoryStore> = Arc::new(LibSqlHistory::new_memory().await.unwrap());

    let supervisor = Arc::new(TaskSupervisor::new(
        cache,
        descriptors,
        history,
        SupervisorConfig::default(),
    ));
    supervisor.recover_on_startup().await.unwrap();

    let app = api::router(Arc::clone(&supervisor), Arc::new(OptionsExecutor));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, supervisor)
}

/// Helper: start a server on fresh storage.
async fn start_server() -> (u16, Arc<TaskSupervisor>, TempDir) {
    let dir = TempDir::new().unwrap();
    let (port, supervisor) = start_server_in(dir.path()).await;
    (port, supervisor, dir)
}

fn start_body(options: Value) -> Value {
    json!({
        "model": "local-model",
        "messages": [{"role": "user", "content": "hello"}],
        "options": options,
    })
}

async fn post_start(port: u16, key: &str, options: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/tasks/{key}"))
        .json(&start_body(options))
        .send()
        .await
        .unwrap()
}

async fn get_json(port: u16, path: &str) -> (u16, Value) {
    let resp = reqwest::get(format!("http://127.0.0.1:{port}{path}"))
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

/// Poll the status endpoint until the task reaches `expected`.
async fn wait_for_status(port: u16, key: &str, expected: &str) -> Value {
    loop {
        let (_, body) = get_json(port, &format!("/api/tasks/{key}")).await;
        if body["status"] == expected {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Read a whole SSE response and return the `data:` payloads in order.
async fn read_sse(port: u16, key: &str) -> Vec<String> {
    let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/tasks/{key}/stream"))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let mut body = String::new();
    let mut chunks = resp.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        body.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
    }

    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data).to_string())
        .collect()
}

/// Read WS frames until the server closes, returning each fragment as JSON.
async fn read_ws_until_close<S>(ws: &mut S) -> Vec<Value>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let mut frames = Vec::new();
    while let Some(msg) = ws.next().await {
        match msg.unwrap() {
            Message::Text(txt) => frames.push(serde_json::from_str(&txt).unwrap()),
            Message::Close(_) => break,
            _ => {}
        }
    }
    frames
}

// ── REST ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let (port, _supervisor, _dir) = start_server().await;

        let (status, body) = get_json(port, "/health").await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_key_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let (port, _supervisor, _dir) = start_server().await;

        let resp = post_start(port, "bad%20key", json!({})).await;
        assert_eq!(resp.status().as_u16(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    timeout(TEST_TIMEOUT, async {
        let (port, _supervisor, _dir) = start_server().await;

        let (status, body) = get_json(port, "/api/tasks/nobody").await;
        assert_eq!(status, 404);
        assert_eq!(body["status"], "unknown");

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/tasks/nobody/stream"))
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);

        let (status, _) = get_json(port, "/api/chats/nobody").await;
        assert_eq!(status, 404);

        let ws = connect_async(format!("ws://127.0.0.1:{port}/ws/tasks/nobody")).await;
        assert!(ws.is_err(), "upgrade should be refused for an unknown job");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn second_start_conflicts_while_running() {
    timeout(TEST_TIMEOUT, async {
        let (port, supervisor, _dir) = start_server().await;

        let resp = post_start(port, "busy", json!({"fragments": ["x"], "hang": true})).await;
        assert_eq!(resp.status().as_u16(), 202);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "running");

        let resp = post_start(port, "busy", json!({"fragments": ["y"]})).await;
        assert_eq!(resp.status().as_u16(), 409);

        supervisor.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── Streaming ───────────────────────────────────────────────────────────

#[tokio::test]
async fn late_readers_see_every_fragment_then_done() {
    timeout(TEST_TIMEOUT, async {
        let (port, _supervisor, _dir) = start_server().await;

        let resp = post_start(
            port,
            "c1",
            json!({"fragments": ["A", "B", "C"], "delay_ms": 100}),
        )
        .await;
        assert_eq!(resp.status().as_u16(), 202);

        let sse = tokio::spawn(read_sse(port, "c1"));

        // Join mid-stream over WebSocket.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/tasks/c1"))
            .await
            .unwrap();
        let frames = read_ws_until_close(&mut ws).await;

        let chunks: Vec<&str> = frames
            .iter()
            .filter(|f| f["type"] == "chunk")
            .map(|f| f["data"].as_str().unwrap())
            .collect();
        assert_eq!(chunks, ["A", "B", "C"]);
        assert_eq!(frames.last().unwrap()["type"], "done");

        let events = sse.await.unwrap();
        assert_eq!(events, ["A", "B", "C", "[DONE]"]);

        let status = wait_for_status(port, "c1", "completed").await;
        assert!(status["completed_at"].is_string());

        // Status is recorded before the stream is discarded.
        let chat = loop {
            let (_, chat) = get_json(port, "/api/chats/c1").await;
            if chat["is_running"] == false {
                break chat;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        let messages = chat["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "hello");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"], "ABC");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_delivers_error_to_open_readers() {
    timeout(TEST_TIMEOUT, async {
        let (port, _supervisor, _dir) = start_server().await;

        let resp = post_start(port, "c2", json!({"fragments": ["partial"], "hang": true})).await;
        assert_eq!(resp.status().as_u16(), 202);

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/tasks/c2"))
            .await
            .unwrap();
        let first = ws.next().await.unwrap().unwrap();
        let Message::Text(txt) = first else {
            panic!("expected Text frame, got {first:?}");
        };
        let first: Value = serde_json::from_str(&txt).unwrap();
        assert_eq!(first["type"], "chunk");
        assert_eq!(first["data"], "partial");

        let (_, chat) = get_json(port, "/api/chats/c2").await;
        assert_eq!(chat["is_running"], true);

        let client = reqwest::Client::new();
        let cancel_url = format!("http://127.0.0.1:{port}/api/tasks/c2/cancel");
        let body: Value = client.post(&cancel_url).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["cancelled"], true);

        let rest = read_ws_until_close(&mut ws).await;
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0]["type"], "error");
        assert_eq!(rest[0]["message"], STOPPED_BY_USER);
        assert_eq!(rest[1]["type"], "done");

        let status = wait_for_status(port, "c2", "interrupted").await;
        assert_eq!(status["error"], STOPPED_BY_USER);

        let body: Value = client.post(&cancel_url).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["cancelled"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn restart_marks_orphaned_job_interrupted() {
    timeout(TEST_TIMEOUT, async {
        let dir = TempDir::new().unwrap();
        let key = JobKey::parse("c3").unwrap();

        // Leave behind what a crashed process would: a running descriptor
        // and a log with no terminator.
        let descriptors = DescriptorStore::open(dir.path().join("tasks")).await.unwrap();
        descriptors
            .create(&TaskDescriptor::running(
                key.clone(),
                TaskParams::new("local-model", vec![]),
            ))
            .await
            .unwrap();
        let log = FragmentLog::open(dir.path().join("wal")).await.unwrap();
        log.append_detached(&key, &Fragment::chunk("half"))
            .await
            .unwrap();

        let (port, _supervisor) = start_server_in(dir.path()).await;

        let (status, body) = get_json(port, "/api/tasks/c3").await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "interrupted");

        let events = read_sse(port, "c3").await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], "half");
        let error: Value = serde_json::from_str(&events[1]).unwrap();
        assert!(error["error"].is_string());
        assert_eq!(events[2], "[DONE]");

        // The key is free again.
        let resp = post_start(port, "c3", json!({"fragments": ["again"]})).await;
        assert_eq!(resp.status().as_u16(), 202);
        wait_for_status(port, "c3", "completed").await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn restart_with_descriptor_only_streams_error_then_done() {
    timeout(TEST_TIMEOUT, async {
        let dir = TempDir::new().unwrap();
        let key = JobKey::parse("c3").unwrap();

        // The previous process recorded the start but no fragment.
        let descriptors = DescriptorStore::open(dir.path().join("tasks")).await.unwrap();
        descriptors
            .create(&TaskDescriptor::running(
                key.clone(),
                TaskParams::new("local-model", vec![]),
            ))
            .await
            .unwrap();

        let (port, _supervisor) = start_server_in(dir.path()).await;

        let (_, body) = get_json(port, "/api/tasks/c3").await;
        assert_eq!(body["status"], "interrupted");

        let events = read_sse(port, "c3").await;
        assert_eq!(events.len(), 2);
        let error: Value = serde_json::from_str(&events[0]).unwrap();
        assert!(error["error"].is_string());
        assert_eq!(events[1], "[DONE]");
    })
    .await
    .expect("test timed out");
}
