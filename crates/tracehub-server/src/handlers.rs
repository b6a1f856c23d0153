use axum::{
    Extension, Json,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::json;

use crate::auth::RequestIdentity;
use crate::metrics::render_metrics;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "TraceHub API",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(body))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Ready once the coordination store answers.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.store.ping().await {
        (StatusCode::OK, Json(HealthResponse { status: "ready" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "coordination store unavailable",
            }),
        )
    }
}

pub async fn metrics() -> impl IntoResponse {
    match render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics not initialized").into_response(),
    }
}

/// Who the caller was resolved to.
pub async fn whoami(Extension(identity): Extension<RequestIdentity>) -> impl IntoResponse {
    Json(identity.credentials)
}

/// Remaining permits of the caller's default buckets, without charging them.
pub async fn rate_limits(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
) -> impl IntoResponse {
    let general = &state.config.rate_limit.general;
    let mut buckets = Vec::new();

    let mut scoped = vec![(general, identity.api_key.as_str())];
    if let Some(ref workspace) = state.config.rate_limit.workspace {
        scoped.push((workspace, identity.credentials.workspace_id.as_str()));
    }

    for (bucket, principal) in scoped {
        match state.rate_limiter.remaining(principal, bucket, None).await {
            Ok(outcome) => buckets.push(json!({
                "bucket": bucket.bucket_name,
                "limit": bucket.limit,
                "remaining": outcome.remaining(),
                "reset_in_millis": outcome.reset_in_millis(),
            })),
            Err(e) => {
                tracing::warn!(error = %e, bucket = %bucket.bucket_name, "Rate limit lookup failed");
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "rate limit store unavailable" })),
                );
            }
        }
    }

    (StatusCode::OK, Json(json!({ "buckets": buckets })))
}
