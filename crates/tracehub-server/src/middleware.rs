use std::collections::HashMap;

use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, MatchedPath, RawPathParams, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracehub_coordination::{BucketCheck, BucketDecision, Cost, LimitScope, RateLimitOutcome};

use crate::auth::{AuthError, DEFAULT_WORKSPACE, RequestIdentity};
use crate::metrics;
use crate::server::AppState;

/// Header naming the workspace a request acts on.
pub const WORKSPACE_HEADER: &str = "tracehub-workspace";

// =============================================================================
// Authentication Middleware
// =============================================================================

/// Resolves the caller and stores a [`RequestIdentity`] in request extensions.
///
/// The API key comes from `Authorization` (a `Bearer ` prefix is accepted)
/// and the workspace from `TraceHub-Workspace`, defaulting to `default`.
/// The permissions checked are the ones configured for the matched route.
///
/// Must be installed with `route_layer` so `MatchedPath` is available.
pub async fn authentication_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let workspace = req
        .headers()
        .get(WORKSPACE_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .unwrap_or(DEFAULT_WORKSPACE)
        .to_string();

    let Some(authenticator) = state.authenticator.as_ref() else {
        req.extensions_mut()
            .insert(RequestIdentity::anonymous(&workspace));
        return next.run(req).await;
    };

    let api_key = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim())
        .filter(|key| !key.is_empty())
        .map(str::to_string);
    let Some(api_key) = api_key else {
        return auth_error_response(&AuthError::MissingCredentials);
    };

    let permissions: &[String] = match req.extensions().get::<MatchedPath>() {
        Some(path) => state.permissions_for(req.method(), path.as_str()),
        None => &[],
    };

    match authenticator
        .authenticate(&api_key, &workspace, permissions)
        .await
    {
        Ok(credentials) => {
            tracing::debug!(
                user = %credentials.user_name,
                workspace_id = %credentials.workspace_id,
                "Request authenticated"
            );
            req.extensions_mut().insert(RequestIdentity {
                api_key,
                credentials,
            });
            next.run(req).await
        }
        Err(e) => {
            tracing::debug!(error = %e, workspace = %workspace, "Authentication failed");
            auth_error_response(&e)
        }
    }
}

fn auth_error_response(error: &AuthError) -> Response {
    metrics::record_auth_failure(error.kind());
    let body = json!({
        "error": error.kind(),
        "message": error.to_string(),
    });
    (error.status_code(), Json(body)).into_response()
}

// =============================================================================
// Rate Limit Middleware
// =============================================================================

/// Admission control for authenticated routes.
///
/// Evaluates the route's buckets in declared order. On denial the request is
/// answered with 429 and never reaches the handler. On admission the bucket
/// headers are attached to the handler's response. When the store is down and
/// the limiter fails closed the answer is 503.
///
/// Requests without a [`RequestIdentity`] pass through untouched, so this
/// layer must sit inside [`authentication_middleware`].
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(identity) = req.extensions().get::<RequestIdentity>().cloned() else {
        return next.run(req).await;
    };
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let plan = state.rate_limits.plan(req.method(), &route);

    let (mut parts, body) = req.into_parts();

    let params: HashMap<String, String> = if plan.needs_path_params() {
        RawPathParams::from_request_parts(&mut parts, &())
            .await
            .map(|raw| {
                raw.iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    } else {
        HashMap::new()
    };

    let (cost, body) = match request_cost(&plan.cost, body, state.max_cost_body_bytes).await {
        Ok(measured) => measured,
        Err(response) => return response,
    };
    let req = Request::from_parts(parts, body);

    let checks: Vec<BucketCheck<'_>> = plan
        .limits
        .iter()
        .map(|limit| BucketCheck {
            principal: match limit.scope {
                LimitScope::ApiKey => identity.api_key.as_str(),
                LimitScope::Workspace => identity.credentials.workspace_id.as_str(),
            },
            bucket: &limit.bucket,
            placeholder: limit
                .placeholder_param
                .as_deref()
                .and_then(|name| params.get(name))
                .map(String::as_str),
        })
        .collect();

    let decisions = match state.rate_limiter.check_all(&checks, cost).await {
        Ok(decisions) => decisions,
        Err(e) => {
            tracing::warn!(
                error = %e,
                route = %route,
                "Rate limiter unavailable, rejecting request"
            );
            metrics::record_rejection(503, "rate_limit_store_unavailable");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service Unavailable: rate limiting is temporarily unavailable",
            )
                .into_response();
        }
    };

    if let Some(denial) = decisions.last().filter(|d| !d.outcome.is_allowed()) {
        return too_many_requests(denial, &decisions);
    }

    let mut response = next.run(req).await;
    append_limit_headers(response.headers_mut(), &decisions);
    response
}

fn too_many_requests(denial: &BucketDecision<'_>, decisions: &[BucketDecision<'_>]) -> Response {
    let message = match &denial.outcome {
        RateLimitOutcome::Denied { error_message, .. } => error_message.as_str(),
        RateLimitOutcome::Allowed { .. } => denial.bucket.error_message.as_str(),
    };
    tracing::debug!(
        bucket = %denial.bucket.bucket_name,
        reset_in_millis = denial.outcome.reset_in_millis(),
        "Request rate limited"
    );
    metrics::record_rejection(429, "rate_limited");

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        format!("Too Many Requests: {message}"),
    )
        .into_response();
    let headers = response.headers_mut();
    append_limit_headers(headers, decisions);
    headers.insert(
        HeaderName::from_static("ratelimit-reset"),
        HeaderValue::from(denial.outcome.reset_in_secs()),
    );
    response
}

fn append_limit_headers(headers: &mut HeaderMap, decisions: &[BucketDecision<'_>]) {
    for decision in decisions {
        for (name, value) in decision.outcome.headers(decision.bucket) {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    tracing::debug!(header = %name, "Skipping invalid rate limit header");
                }
            }
        }
    }
}

/// Permits one request costs, buffering the body when the cost depends on it.
///
/// A `JsonArrayLen` cost that cannot be read from the body falls back to 1 and
/// leaves payload validation to the handler. An empty array costs nothing.
async fn request_cost(cost: &Cost, body: Body, limit: usize) -> Result<(u64, Body), Response> {
    match cost {
        Cost::Fixed(n) => Ok((*n, body)),
        Cost::JsonArrayLen(field) => {
            let bytes = axum::body::to_bytes(body, limit).await.map_err(|_| {
                metrics::record_rejection(413, "cost_body_too_large");
                (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response()
            })?;
            let n = json_array_len(&bytes, field).unwrap_or(1);
            Ok((n, Body::from(bytes)))
        }
    }
}

fn json_array_len(bytes: &[u8], field: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value.get(field)?.as_array().map(|items| items.len() as u64)
}

#[cfg(test)]
mod tests {
    use tracehub_coordination::rate_limit::RESET_HEADER;

    use super::*;

    #[test]
    fn test_json_array_len() {
        let body = br#"{"spans": [{"id": 1}, {"id": 2}, {"id": 3}]}"#;
        assert_eq!(json_array_len(body, "spans"), Some(3));
        assert_eq!(json_array_len(br#"{"spans": []}"#, "spans"), Some(0));
        assert_eq!(json_array_len(br#"{"spans": {}}"#, "spans"), None);
        assert_eq!(json_array_len(body, "traces"), None);
        assert_eq!(json_array_len(b"not json", "spans"), None);
    }

    #[test]
    fn test_reset_header_name_matches_constant() {
        assert_eq!(
            HeaderName::from_static("ratelimit-reset"),
            HeaderName::try_from(RESET_HEADER).unwrap()
        );
    }

    #[tokio::test]
    async fn test_fixed_cost_leaves_body_untouched() {
        let (cost, body) = request_cost(&Cost::Fixed(5), Body::from("payload"), 16)
            .await
            .unwrap();
        assert_eq!(cost, 5);
        let bytes = axum::body::to_bytes(body, 16).await.unwrap();
        assert_eq!(&bytes[..], b"payload");
    }

    #[tokio::test]
    async fn test_oversized_cost_body_is_rejected() {
        let cost = Cost::JsonArrayLen("spans".to_string());
        let response = request_cost(&cost, Body::from(vec![b' '; 64]), 16)
            .await
            .unwrap_err();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
