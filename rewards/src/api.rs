//! HTTP surface.
//!
//! User routes are public; the admin route is protected by a bearer token
//! when one is configured (open access otherwise, suitable for dev).

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use minecycle_core::{CycleError, CycleSnapshot};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use crate::driver::DriverError;
use crate::metrics;
use crate::service::CycleService;
use crate::storage::RedisStorage;

const MAX_USER_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<CycleService>,
    /// Used by `/health` to report Redis reachability.
    pub storage: Option<Arc<RedisStorage>>,
    pub admin_token: Option<Arc<str>>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error("invalid user id")]
    InvalidUser,
    #[error("cycle service unavailable")]
    Unavailable,
}

impl From<DriverError> for ApiError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Cycle(e) => ApiError::Cycle(e),
            DriverError::Closed => ApiError::Unavailable,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, body) = match self {
            ApiError::Cycle(CycleError::AlreadyMining) => (
                StatusCode::CONFLICT,
                json!({"ok": false, "error": "already_mining", "message": message}),
            ),
            ApiError::Cycle(CycleError::CooldownActive { remaining }) => {
                let ms = remaining.num_milliseconds().max(0);
                (
                    StatusCode::CONFLICT,
                    json!({
                        "ok": false,
                        "error": "cooldown_active",
                        "message": message,
                        "remaining_secs": (ms + 999) / 1000,
                    }),
                )
            }
            ApiError::InvalidUser => (
                StatusCode::BAD_REQUEST,
                json!({"ok": false, "error": "invalid_user", "message": message}),
            ),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"ok": false, "error": "unavailable", "message": message}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let admin = Router::new()
        .route("/api/admin/cycle/:user/reset-cooldown", post(reset_cooldown))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin_token));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/api/cycle/:user", get(snapshot))
        .route("/api/cycle/:user/start", post(start))
        .route("/api/cycle/:user/stop", post(stop))
        .merge(admin)
        .with_state(state)
}

fn check_user(user: &str) -> Result<(), ApiError> {
    if user.is_empty() || user.len() > MAX_USER_ID_LEN || user.chars().any(char::is_control) {
        return Err(ApiError::InvalidUser);
    }
    Ok(())
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let redis_ok = match &state.storage {
        Some(storage) => Some(storage.ping().await.is_ok()),
        None => None,
    };
    let drivers = state.service.active_count().await;
    Json(json!({"status": "ok", "redis": redis_ok, "drivers": drivers}))
}

async fn render_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

async fn snapshot(
    Path(user): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<CycleSnapshot>, ApiError> {
    check_user(&user)?;
    Ok(Json(state.service.snapshot(&user).await?))
}

async fn start(
    Path(user): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<CycleSnapshot>, ApiError> {
    check_user(&user)?;
    Ok(Json(state.service.start(&user).await?))
}

async fn stop(
    Path(user): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<CycleSnapshot>, ApiError> {
    check_user(&user)?;
    Ok(Json(state.service.stop(&user).await?))
}

async fn reset_cooldown(
    Path(user): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<CycleSnapshot>, ApiError> {
    check_user(&user)?;
    tracing::info!(user = %user, "admin cooldown reset");
    Ok(Json(state.service.reset_cooldown(&user).await?))
}

/// Require `Authorization: Bearer <token>` when an admin token is set.
async fn require_admin_token(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(next.run(request).await),
        _ => {
            tracing::warn!("rejected admin request with missing or bad token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
