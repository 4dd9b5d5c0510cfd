/// Health, liveness and metrics endpoints
///
/// `/health` reports storage and cache reachability; `/` is a bare liveness
/// probe; `/metrics` serves Prometheus text.

use crate::{context::AppContext, db, error::ServiceError, metrics};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Health status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Always "alive" when the process answers
    pub status: String,

    /// Application version
    pub version: String,

    /// "ok" or "error"
    pub database: String,

    /// "ok", "error" or "disabled"
    pub cache: String,
}

/// Build health check routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
}

/// Liveness probe
pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "Session": "Online" }))
}

/// Component health check. 503 when the database is unreachable.
pub async fn health(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthStatus>) {
    let start = Instant::now();

    let database = match db::test_connection(&ctx.account_db).await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "health_check: database check failed");
            "error"
        }
    };

    let cache = if !ctx.cache_enabled {
        "disabled"
    } else {
        match ctx.session_cache.ping().await {
            Ok(()) => "ok",
            Err(e) => {
                tracing::warn!(error = %e, "health_check: cache check failed");
                "error"
            }
        }
    };

    let status_code = if database == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    tracing::debug!(
        database,
        cache,
        duration_ms = start.elapsed().as_millis() as u64,
        "health_check_completed"
    );

    (
        status_code,
        Json(HealthStatus {
            status: "alive".to_string(),
            version: ctx.config.service.version.clone(),
            database: database.to_string(),
            cache: cache.to_string(),
        }),
    )
}

/// Prometheus scrape endpoint
pub async fn metrics_handler() -> Result<Response, ServiceError> {
    let body = metrics::render_metrics().map_err(ServiceError::Internal)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
