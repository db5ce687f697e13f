//! End-to-end tests driving the full router: signed ingest, tenant-scoped
//! queries, rate limiting, maintenance and the admin surface.

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tower::ServiceExt;

use spillway::auth::hmac_sha256_hex;
use spillway::config::Config;
use spillway::event::{day_id_days_ago, fingerprint, now_millis};
use spillway::registry::NewProject;
use spillway::server::{create_router, AppState};
use spillway::store::Store;

const HMAC_SECRET: &str = "0123456789abcdef0123456789abcdef";
const ADMIN_TOKEN: &str = "fedcba9876543210fedcba9876543210";

fn base_config() -> Config {
    Config {
        db_url: String::new(), // filled in by test_state
        server_host: "127.0.0.1".to_string(),
        server_port: 8300,
        hmac_secret: HMAC_SECRET.to_string(),
        admin_token: ADMIN_TOKEN.to_string(),
        default_retention_days: 3,
        max_payload_bytes: 524_288,
        max_events_per_post: 250,
        rate_limit_per_minute: 5000,
        rate_limit_per_ip: 100,
        db_op_timeout_secs: 10,
        auth_lookup_timeout_secs: 10,
    }
}

async fn test_state(
    mutate: impl FnOnce(&mut Config),
) -> (Router, AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config();
    config.db_url = format!("sqlite:{}", dir.path().join("test.db").display());
    mutate(&mut config);

    let store = Store::connect(&config.db_url, Duration::from_secs(10))
        .await
        .unwrap();
    let state = AppState::new(config, store);
    let app = create_router(state.clone());

    (app, state, dir)
}

async fn create_tenant(state: &AppState, slug: &str) -> (i64, String) {
    let created = state
        .registry
        .create(NewProject {
            slug: slug.to_string(),
            name: slug.to_uppercase(),
            retention_days: 3,
            minute_cap: 5000,
        })
        .await
        .unwrap();
    (created.project.id, created.api_key)
}

fn signed_post(api_key: &str, body: &str) -> Request<Body> {
    signed_post_from(api_key, body, [127, 0, 0, 1])
}

fn signed_post_from(api_key: &str, body: &str, ip: [u8; 4]) -> Request<Body> {
    let signature = hmac_sha256_hex(HMAC_SECRET.as_bytes(), body.as_bytes());
    let mut request = Request::builder()
        .method("POST")
        .uri("/api/log")
        .header("content-type", "application/json")
        .header("x-project-key", api_key)
        .header("x-signature", signature)
        .body(Body::from(body.to_string()))
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
    request
}

fn signed_get(api_key: &str, query: &str) -> Request<Body> {
    let signature = hmac_sha256_hex(HMAC_SECRET.as_bytes(), query.as_bytes());
    let uri = if query.is_empty() {
        "/api/log".to_string()
    } else {
        format!("/api/log?{}", query)
    };
    let mut request = Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-project-key", api_key)
        .header("x-signature", signature)
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
    request
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn log_count(state: &AppState) -> i64 {
    use sqlx::Row;
    state
        .store
        .query_one(sqlx::query("SELECT COUNT(*) AS n FROM logs"))
        .await
        .unwrap()
        .unwrap()
        .get("n")
}

#[tokio::test]
async fn round_trip_single_event() {
    let (app, state, _dir) = test_state(|_| {}).await;
    let (_, api_key) = create_tenant(&state, "acme").await;

    let body = r#"{"events":[{"level":"error","message":"boom"}]}"#;
    let response = app.clone().oneshot(signed_post(&api_key, body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let parsed = json_body(response).await;
    assert_eq!(parsed["received"], 1);
    assert_eq!(parsed["processed"], 1);
    assert!(parsed["requestId"].is_string());

    let response = app
        .clone()
        .oneshot(signed_get(&api_key, "level=error&limit=10"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let parsed = json_body(response).await;
    assert_eq!(parsed["total"], 1);
    let log = &parsed["logs"][0];
    assert_eq!(log["message"], "boom");
    assert_eq!(log["level"], "error");
    assert_eq!(log["fingerprint"], fingerprint("boom", None, None).as_str());
    // Submitted without a source; the tenant slug fills in.
    assert_eq!(log["source"], "acme");
}

#[tokio::test]
async fn signature_mismatch_rejected_without_inserting() {
    let (app, state, _dir) = test_state(|_| {}).await;
    let (_, api_key) = create_tenant(&state, "acme").await;

    let body = r#"{"events":[{"level":"error","message":"boom"}]}"#;
    // Sign a different byte sequence than the one transmitted.
    let signature = hmac_sha256_hex(HMAC_SECRET.as_bytes(), format!("{} ", body).as_bytes());
    let mut request = Request::builder()
        .method("POST")
        .uri("/api/log")
        .header("content-type", "application/json")
        .header("x-project-key", &api_key)
        .header("x-signature", signature)
        .body(Body::from(body))
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "SIGNATURE_INVALID");
    assert_eq!(log_count(&state).await, 0);
}

#[tokio::test]
async fn missing_credentials_rejected_without_inserting() {
    let (app, state, _dir) = test_state(|_| {}).await;
    create_tenant(&state, "acme").await;

    let mut request = Request::builder()
        .method("POST")
        .uri("/api/log")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"events":[{"level":"info","message":"m"}]}"#))
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "PROJECT_KEY_MISSING");
    assert_eq!(log_count(&state).await, 0);
}

#[tokio::test]
async fn unknown_project_key_rejected() {
    let (app, _state, _dir) = test_state(|_| {}).await;

    let response = app
        .oneshot(signed_post("not-a-real-key", r#"{"events":[]}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "PROJECT_NOT_FOUND");
}

#[tokio::test]
async fn batch_size_cap_enforced() {
    let (app, state, _dir) = test_state(|c| c.max_events_per_post = 10).await;
    let (_, api_key) = create_tenant(&state, "acme").await;

    let events: Vec<String> = (0..11)
        .map(|i| format!(r#"{{"level":"info","message":"m{}"}}"#, i))
        .collect();
    let body = format!(r#"{{"events":[{}]}}"#, events.join(","));

    let response = app.oneshot(signed_post(&api_key, &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "TOO_MANY_EVENTS");
    assert_eq!(log_count(&state).await, 0);
}

#[tokio::test]
async fn invalid_event_reported_by_index() {
    let (app, state, _dir) = test_state(|_| {}).await;
    let (_, api_key) = create_tenant(&state, "acme").await;

    let body = r#"{"events":[{"level":"info","message":"ok"},{"level":"nope","message":"bad"}]}"#;
    let response = app.oneshot(signed_post(&api_key, body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let parsed = json_body(response).await;
    assert_eq!(parsed["code"], "INVALID_EVENT_DATA");
    assert!(parsed["error"].as_str().unwrap().contains("event 1"));
    assert_eq!(log_count(&state).await, 0);
}

#[tokio::test]
async fn empty_batch_short_circuits() {
    let (app, state, _dir) = test_state(|_| {}).await;
    let (_, api_key) = create_tenant(&state, "acme").await;

    let response = app
        .oneshot(signed_post(&api_key, r#"{"events":[]}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let parsed = json_body(response).await;
    assert_eq!(parsed["received"], 0);
    assert_eq!(parsed["processed"], 0);
    assert_eq!(log_count(&state).await, 0);
}

#[tokio::test]
async fn oversized_body_rejected_before_parsing() {
    let (app, state, _dir) = test_state(|c| c.max_payload_bytes = 256).await;
    let (_, api_key) = create_tenant(&state, "acme").await;

    let body = format!(
        r#"{{"events":[{{"level":"info","message":"{}"}}]}}"#,
        "x".repeat(1024)
    );
    let response = app.oneshot(signed_post(&api_key, &body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(log_count(&state).await, 0);
}

#[tokio::test]
async fn address_rate_limit_trips_with_retry_after() {
    let (app, state, _dir) = test_state(|c| c.rate_limit_per_ip = 3).await;
    let (_, api_key) = create_tenant(&state, "acme").await;

    let body = r#"{"events":[{"level":"info","message":"m"}]}"#;
    let mut last_remaining = i64::MAX;

    for _ in 0..3 {
        let response = app.clone().oneshot(signed_post(&api_key, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let remaining: i64 = response
            .headers()
            .get("x-ratelimit-remaining-address")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(remaining < last_remaining);
        last_remaining = remaining;
    }
    assert_eq!(last_remaining, 0);

    let response = app.clone().oneshot(signed_post(&api_key, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "60");
    assert_eq!(json_body(response).await["code"], "IP_RATE_LIMIT_EXCEEDED");

    // Another address still has quota.
    let response = app
        .oneshot(signed_post_from(&api_key, body, [10, 0, 0, 9]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn tenant_rate_limit_uses_project_cap() {
    let (app, state, _dir) = test_state(|c| c.rate_limit_per_ip = 100).await;
    let created = state
        .registry
        .create(NewProject {
            slug: "tiny".to_string(),
            name: "Tiny".to_string(),
            retention_days: 3,
            minute_cap: 2,
        })
        .await
        .unwrap();

    let body = r#"{"events":[{"level":"info","message":"m"}]}"#;
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(signed_post(&created.api_key, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.oneshot(signed_post(&created.api_key, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        json_body(response).await["code"],
        "PROJECT_RATE_LIMIT_EXCEEDED"
    );
}

#[tokio::test]
async fn rate_limit_headers_present_on_success() {
    let (app, state, _dir) = test_state(|_| {}).await;
    let (_, api_key) = create_tenant(&state, "acme").await;

    let response = app
        .oneshot(signed_post(&api_key, r#"{"events":[{"level":"info","message":"m"}]}"#))
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers["x-ratelimit-limit-address"], "100");
    assert_eq!(headers["x-ratelimit-limit-tenant"], "5000");
    assert_eq!(headers["x-ratelimit-remaining-tenant"], "4999");
    assert!(headers.contains_key("x-ratelimit-reset-address"));
    assert!(headers.contains_key("x-ratelimit-reset-tenant"));
}

#[tokio::test]
async fn maintenance_expires_stale_counters() {
    let (app, state, _dir) = test_state(|_| {}).await;
    let (_, api_key) = create_tenant(&state, "acme").await;

    let stale_minute = now_millis() / 60_000 - 30;
    state
        .store
        .exec(
            sqlx::query(
                "INSERT INTO project_minute_counters (kind, key, minute_utc, count) \
                 VALUES ('address', '10.1.1.1', ?, 42)",
            )
            .bind(stale_minute),
        )
        .await
        .unwrap();

    // Ingest is unaffected by pending housekeeping.
    let response = app
        .oneshot(signed_post(&api_key, r#"{"events":[{"level":"info","message":"m"}]}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state.maintenance.run().await;

    use sqlx::Row;
    let stale_left: i64 = state
        .store
        .query_one(
            sqlx::query(
                "SELECT COUNT(*) AS n FROM project_minute_counters WHERE minute_utc < ?",
            )
            .bind(now_millis() / 60_000 - 2),
        )
        .await
        .unwrap()
        .unwrap()
        .get("n");
    assert_eq!(stale_left, 0);
}

#[tokio::test]
async fn maintenance_purges_expired_day_buckets() {
    let (_app, state, _dir) = test_state(|_| {}).await;
    let (project_id, _) = create_tenant(&state, "acme").await;

    let now = now_millis();
    let expired_day = day_id_days_ago(4).unwrap();
    let today = day_id_days_ago(0).unwrap();

    for day in [expired_day, today] {
        state
            .store
            .insert(
                sqlx::query(
                    "INSERT INTO logs \
                     (project_id, ts, level, message, source, env, fingerprint, day_id, created_at) \
                     VALUES (?, ?, 'info', 'm', 'acme', 'production', 'abcdef0123456789', ?, ?)",
                )
                .bind(project_id)
                .bind(now)
                .bind(day)
                .bind(now),
            )
            .await
            .unwrap();
    }

    state.maintenance.run().await;

    use sqlx::Row;
    let rows = state
        .store
        .query(sqlx::query("SELECT day_id FROM logs"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<i64, _>("day_id"), today);
}

#[tokio::test]
async fn ingest_records_activity_and_trackers() {
    let (app, state, _dir) = test_state(|_| {}).await;
    let (project_id, api_key) = create_tenant(&state, "acme").await;

    let body = r#"{"events":[
        {"level":"error","message":"boom"},
        {"level":"error","message":"boom"},
        {"level":"warn","message":"slow"}
    ]}"#;
    let response = app.oneshot(signed_post(&api_key, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    use sqlx::Row;
    let activity: i64 = state
        .store
        .query_one(
            sqlx::query(
                "SELECT count FROM project_minute_counters WHERE kind = 'activity' AND key = ?",
            )
            .bind(project_id.to_string()),
        )
        .await
        .unwrap()
        .unwrap()
        .get("count");
    assert_eq!(activity, 3);

    let trackers = state
        .store
        .query(sqlx::query(
            "SELECT fingerprint, minute_count FROM fingerprint_trackers ORDER BY minute_count DESC",
        ))
        .await
        .unwrap();
    assert_eq!(trackers.len(), 2);
    assert_eq!(trackers[0].get::<i64, _>("minute_count"), 2);
}

#[tokio::test]
async fn healthz_is_open() {
    let (app, _state, _dir) = test_state(|_| {}).await;

    let request = Request::builder()
        .method("GET")
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
}

fn admin_request(method: &str, uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("x-admin-token", token);
    }
    let mut request = builder.body(Body::from(body.to_string())).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
    request
}

#[tokio::test]
async fn admin_create_then_ingest_with_returned_key() {
    let (app, _state, _dir) = test_state(|_| {}).await;

    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            "/api/admin/projects",
            Some(ADMIN_TOKEN),
            r#"{"slug":"acme","name":"Acme"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let parsed = json_body(response).await;
    let api_key = parsed["api_key"].as_str().unwrap().to_string();
    assert_eq!(api_key.len(), 64);
    assert_eq!(parsed["retention_days"], 3);

    let response = app
        .oneshot(signed_post(&api_key, r#"{"events":[{"level":"info","message":"m"}]}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_create_requires_slug_and_name() {
    let (app, _state, _dir) = test_state(|_| {}).await;

    let response = app
        .oneshot(admin_request(
            "POST",
            "/api/admin/projects",
            Some(ADMIN_TOKEN),
            r#"{"slug":"acme"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "PROJECT_REQUIRED");
}

#[tokio::test]
async fn admin_requires_valid_token() {
    let (app, _state, _dir) = test_state(|_| {}).await;

    let response = app
        .clone()
        .oneshot(admin_request("GET", "/api/admin/projects", None, ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "ADMIN_TOKEN_MISSING");

    let response = app
        .oneshot(admin_request("GET", "/api/admin/projects", Some("wrong"), ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "ADMIN_TOKEN_INVALID");
}

#[tokio::test]
async fn admin_delete_cascades() {
    let (app, state, _dir) = test_state(|_| {}).await;
    let (project_id, api_key) = create_tenant(&state, "acme").await;

    let response = app
        .clone()
        .oneshot(signed_post(&api_key, r#"{"events":[{"level":"info","message":"m"}]}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(log_count(&state).await, 1);

    let response = app
        .oneshot(admin_request(
            "DELETE",
            &format!("/api/admin/projects/{}", project_id),
            Some(ADMIN_TOKEN),
            "",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["deleted"], true);

    assert_eq!(log_count(&state).await, 0);

    use sqlx::Row;
    let counters: i64 = state
        .store
        .query_one(
            sqlx::query(
                "SELECT COUNT(*) AS n FROM project_minute_counters \
                 WHERE kind IN ('tenant', 'activity') AND key = ?",
            )
            .bind(project_id.to_string()),
        )
        .await
        .unwrap()
        .unwrap()
        .get("n");
    assert_eq!(counters, 0);
}
