//! End-to-end scenarios: the HTTP surface and a real worker sharing one
//! store, with the remote node played by a scripted transport.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use gridq::api::{self, AppState};
use gridq::auth;
use gridq::config::ServerConfig;
use gridq::store::Store;
use gridq::transport::{ExecOutput, Transport, TransportError};
use gridq::worker::{Worker, WorkerConfig};

const BOUNDARY: &str = "gridq-e2e-boundary";
const FAKE_PID: u32 = 31337;

#[derive(Default)]
struct NodeState {
    connected: bool,
    /// Liveness probes answering "running" before the process exits on its
    /// own. Negative means it runs until killed.
    alive_polls: i64,
    killed: bool,
    launches: u32,
}

/// Plays a compute node: launches return a pid, output files read back by
/// suffix once the process is gone.
#[derive(Clone)]
struct FakeNode {
    state: Arc<Mutex<NodeState>>,
}

impl FakeNode {
    fn new(alive_polls: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(NodeState {
                alive_polls,
                ..Default::default()
            })),
        }
    }
}

#[async_trait]
impl Transport for FakeNode {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state.lock().unwrap().connected = false;
    }

    async fn is_channel_alive(&mut self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn exec(&mut self, cmd: &str, _timeout: Duration) -> Result<ExecOutput, TransportError> {
        let mut state = self.state.lock().unwrap();
        let stdout = if cmd.contains("setsid nohup") {
            state.launches += 1;
            format!("{FAKE_PID}\n")
        } else {
            String::new()
        };
        Ok(ExecOutput {
            exit_status: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn put_file(&mut self, _bytes: &[u8], _remote_path: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn read_file(&mut self, remote_path: &str) -> Result<String, TransportError> {
        let state = self.state.lock().unwrap();
        let contents = if remote_path.ends_with("results.jsonl") {
            r#"{"ok":true}"#.to_string()
        } else if remote_path.ends_with(".out") {
            "ok\n".to_string()
        } else if remote_path.ends_with(".exit") {
            if state.killed {
                String::new()
            } else {
                "0\n".to_string()
            }
        } else {
            String::new()
        };
        Ok(contents)
    }

    async fn is_alive_pid(&mut self, _pid: u32) -> Result<bool, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.killed {
            return Ok(false);
        }
        if state.alive_polls < 0 {
            return Ok(true);
        }
        if state.alive_polls > 0 {
            state.alive_polls -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    async fn kill_pid(&mut self, pid: u32) -> Result<bool, TransportError> {
        assert_eq!(pid, FAKE_PID);
        self.state.lock().unwrap().killed = true;
        Ok(true)
    }
}

struct Harness {
    app: Router,
    node: FakeNode,
    shutdown: CancellationToken,
    worker: tokio::task::JoinHandle<()>,
    _jobs_dir: tempfile::TempDir,
}

fn start(alive_polls: i64) -> Harness {
    let jobs_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory(1).unwrap());
    let mut config = ServerConfig {
        node_addresses: vec!["10.0.0.1".into()],
        jobs_dir: jobs_dir.path().to_path_buf(),
        wait_max_seconds: 30,
        worker_poll_interval_ms: 10,
        supervision_poll_interval_ms: 10,
        ..Default::default()
    };
    config.normalize().unwrap();
    let config = Arc::new(config);

    auth::issue_credential(&store, "alice", "alice-secret", false, None, 30).unwrap();

    let node = FakeNode::new(alive_polls);
    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        WorkerConfig::from_server(&config, 0),
        store.clone(),
        Box::new(node.clone()),
        shutdown.clone(),
    );
    let worker = tokio::spawn(worker.run());

    let state = AppState::new(store, config, None);
    Harness {
        app: api::router(state),
        node,
        shutdown,
        worker,
        _jobs_dir: jobs_dir,
    }
}

impl Harness {
    async fn stop(self) {
        self.shutdown.cancel();
        self.worker.await.unwrap();
    }
}

fn submit_request(uri: &str) -> Request<Body> {
    let config = "principal: alice\ntoken: alice-secret\ncompetition: comp-a\nproject: proj-1\nexpected_seconds: 5\n";
    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"code\"; filename=\"artifact.py\"\r\n\
         Content-Type: text/x-python\r\n\r\n\
         print('ok')\n\r\n\
         --{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"config\"\r\n\r\n\
         {config}\r\n\
         --{BOUNDARY}--\r\n"
    );
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn authed(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", "Bearer alice-secret")
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn poll_status_until(app: &Router, job_id: &str, wanted: &str) -> Value {
    for _ in 0..600 {
        let response = app
            .clone()
            .oneshot(authed("GET", &format!("/status/{job_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        if body["status"] == wanted {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} never reached status {wanted}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn synchronous_submit_returns_the_finished_run() {
    let harness = start(2);

    let response = harness
        .app
        .clone()
        .oneshot(submit_request("/submit?wait=true"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;

    assert_eq!(body["status"], "completed");
    assert_eq!(body["exit_status"], 0);
    assert!(body["stdout"].as_str().unwrap().contains(r#""ok":true"#));
    let started: chrono::DateTime<chrono::Utc> =
        body["started_at"].as_str().unwrap().parse().unwrap();
    let finished: chrono::DateTime<chrono::Utc> =
        body["finished_at"].as_str().unwrap().parse().unwrap();
    assert!(started <= finished);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn asynchronous_submit_is_pollable_to_completion() {
    let harness = start(2);

    let response = harness
        .app
        .clone()
        .oneshot(submit_request("/submit"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let status = body["status"].as_str().unwrap();
    assert!(
        status == "queued" || status == "launching",
        "unexpected immediate status {status}"
    );
    let job_id = body["job_id"].as_str().unwrap().to_string();

    poll_status_until(&harness.app, &job_id, "completed").await;

    let response = harness
        .app
        .clone()
        .oneshot(authed("GET", &format!("/results/{job_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let results = json_body(response).await;
    assert_eq!(results["exit_status"], 0);
    assert!(results["stdout"].as_str().unwrap().contains(r#""ok":true"#));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_running_job_terminates_it_promptly() {
    let harness = start(-1);

    let response = harness
        .app
        .clone()
        .oneshot(submit_request("/submit"))
        .await
        .unwrap();
    let body = json_body(response).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    poll_status_until(&harness.app, &job_id, "running").await;

    let cancelled_at = Instant::now();
    let response = harness
        .app
        .clone()
        .oneshot(authed("POST", &format!("/cancel/{job_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    poll_status_until(&harness.app, &job_id, "cancelled").await;
    // Supervision poll is 10ms; two seconds is a generous bound for the
    // poll plus one round-trip.
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    assert!(harness.node.state.lock().unwrap().killed);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_second_job_starts_after_the_first_finishes() {
    let harness = start(1);

    let response = harness
        .app
        .clone()
        .oneshot(submit_request("/submit?wait=true"))
        .await
        .unwrap();
    let first = json_body(response).await;
    assert_eq!(first["status"], "completed");

    // The slot freed up; the same principal may submit again.
    harness.node.state.lock().unwrap().alive_polls = 1;
    harness.node.state.lock().unwrap().killed = false;
    let response = harness
        .app
        .clone()
        .oneshot(submit_request("/submit?wait=true"))
        .await
        .unwrap();
    let second = json_body(response).await;
    assert_eq!(second["status"], "completed");
    assert_ne!(first["job_id"], second["job_id"]);

    harness.stop().await;
}
