/// HTTP API: routing, error mapping and admin auth

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration, TimeZone, Utc};
use minecycle_core::{Clock, CycleConfig, CycleSnapshot, ManualClock, Phase};
use minecycle_rewards::api::{router, ApiState};
use minecycle_rewards::notify::MemoryNotifier;
use minecycle_rewards::plans::StaticPlanSource;
use minecycle_rewards::sink::MemoryBalanceSink;
use minecycle_rewards::store::MemoryCycleStore;
use minecycle_rewards::{Collaborators, CycleService, DriverTimings};
use std::sync::Arc;
use tower::ServiceExt;

fn app(admin_token: Option<&str>) -> (Router, ManualClock) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let service = Arc::new(CycleService::new(Collaborators {
        config: CycleConfig::default(),
        clock: shared.clone(),
        local: Arc::new(MemoryCycleStore::new("local")),
        remote: Arc::new(MemoryCycleStore::stamped("remote", shared)),
        sink: Arc::new(MemoryBalanceSink::new()),
        notifier: Arc::new(MemoryNotifier::new()),
        plans: Arc::new(StaticPlanSource::new()),
        timings: DriverTimings::default(),
    }));

    let state = ApiState {
        service,
        storage: None,
        admin_token: admin_token.map(Arc::from),
    };
    (router(state), clock)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_and_metrics() {
    let (app, _) = app(None);

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["redis"].is_null());

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_start_then_snapshot() {
    let (app, clock) = app(None);

    let response = app.clone().oneshot(post("/api/cycle/alice/start")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let started: CycleSnapshot = serde_json::from_value(json_body(response).await).unwrap();
    assert_eq!(started.phase, Phase::Mining);

    clock.advance(Duration::hours(6));
    let response = app.oneshot(get("/api/cycle/alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let snap: CycleSnapshot = serde_json::from_value(json_body(response).await).unwrap();
    assert!((snap.progress_percent - 25.0).abs() < 1e-9);
    assert!((snap.session_yield - 12.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_second_start_is_conflict() {
    let (app, _) = app(None);

    app.clone().oneshot(post("/api/cycle/bob/start")).await.unwrap();
    let response = app.oneshot(post("/api/cycle/bob/start")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["error"], "already_mining");
}

#[tokio::test]
async fn test_cooldown_conflict_reports_remaining() {
    let (app, clock) = app(None);

    app.clone().oneshot(post("/api/cycle/carol/start")).await.unwrap();
    clock.advance(Duration::hours(30));

    let response = app.oneshot(post("/api/cycle/carol/start")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["error"], "cooldown_active");
    assert_eq!(body["remaining_secs"], 18 * 3600);
}

#[tokio::test]
async fn test_stop_returns_idle() {
    let (app, _) = app(None);

    app.clone().oneshot(post("/api/cycle/dave/start")).await.unwrap();
    let response = app.oneshot(post("/api/cycle/dave/stop")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let snap: CycleSnapshot = serde_json::from_value(json_body(response).await).unwrap();
    assert_eq!(snap.phase, Phase::Idle);
}

#[tokio::test]
async fn test_admin_reset_requires_token() {
    let (app, clock) = app(Some("s3cret"));

    app.clone().oneshot(post("/api/cycle/erin/start")).await.unwrap();
    clock.advance(Duration::hours(24));

    let response = app
        .clone()
        .oneshot(post("/api/admin/cycle/erin/reset-cooldown"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .method("POST")
        .uri("/api/admin/cycle/erin/reset-cooldown")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.clone().oneshot(wrong).await.unwrap().status(), StatusCode::UNAUTHORIZED);

    let authorized = Request::builder()
        .method("POST")
        .uri("/api/admin/cycle/erin/reset-cooldown")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(authorized).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let snap: CycleSnapshot = serde_json::from_value(json_body(response).await).unwrap();
    assert_eq!(snap.phase, Phase::Idle);

    let response = app.oneshot(post("/api/cycle/erin/start")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_routes_open_without_token() {
    let (app, _) = app(None);
    let response = app.oneshot(post("/api/admin/cycle/frank/reset-cooldown")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
