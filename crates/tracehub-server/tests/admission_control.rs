//! End-to-end admission control through the axum router.
//!
//! Requests go through `tower::ServiceExt::oneshot` against an app backed by
//! the in-process store, so each test gets a fresh set of counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    routing::{get, post},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use tracehub_coordination::{
    CoordinationStore, Cost, LimitConfig, LimitScope, RedisConfig, ResolvedIdentity,
    RouteLimitConfig, StoreFailurePolicy,
};
use tracehub_server::{AppConfig, AppState, AuthError, RemoteAuthenticator, build_app_with_routes};

const SPANS_ROUTE: &str = "/v1/projects/{project_id}/spans";

/// Maps API keys to workspaces; any other key is rejected.
struct StaticIdentityService {
    keys: HashMap<&'static str, &'static str>,
}

#[async_trait]
impl RemoteAuthenticator for StaticIdentityService {
    async fn authenticate(
        &self,
        api_key: &str,
        workspace_name: &str,
        _permissions: &[String],
    ) -> Result<ResolvedIdentity, AuthError> {
        let workspace_id = self
            .keys
            .get(api_key)
            .ok_or_else(|| AuthError::unauthorized("Invalid API key"))?;
        if workspace_name == "locked" {
            return Err(AuthError::forbidden("workspace locked"));
        }
        Ok(ResolvedIdentity {
            user_name: format!("user-of-{api_key}"),
            workspace_id: workspace_id.to_string(),
            workspace_name: workspace_name.to_string(),
            quotas: vec![],
        })
    }
}

fn limit(name: &str, header: &str, limit: u64) -> LimitConfig {
    LimitConfig {
        bucket_name: name.to_string(),
        header_name: header.to_string(),
        limit,
        window: Duration::from_secs(60),
        error_message: format!("{name} exceeded"),
    }
}

fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.rate_limit.enabled = true;
    cfg.rate_limit.general = limit("general_events", "User", 100);
    cfg.rate_limit.workspace = Some(limit("workspace_events", "Workspace", 8));
    cfg.rate_limit
        .custom
        .insert("span_ingest".to_string(), limit("span_ingest", "Spans", 4));
    cfg.rate_limit.routes.push(RouteLimitConfig {
        method: "POST".to_string(),
        path: SPANS_ROUTE.to_string(),
        buckets: vec!["span_ingest".to_string()],
        scope: LimitScope::ApiKey,
        placeholder_param: Some("project_id".to_string()),
        cost: Cost::JsonArrayLen("spans".to_string()),
    });
    cfg
}

fn routes() -> Router<AppState> {
    Router::new()
        .route(SPANS_ROUTE, post(|| async { StatusCode::ACCEPTED }))
        .route("/v1/traces", get(|| async { "traces" }))
}

fn app_with(cfg: AppConfig, authenticated: bool) -> Router {
    app_on_store(cfg, authenticated, CoordinationStore::new_local())
}

fn app_on_store(cfg: AppConfig, authenticated: bool, store: CoordinationStore) -> Router {
    let remote: Option<Arc<dyn RemoteAuthenticator>> = authenticated.then(|| {
        Arc::new(StaticIdentityService {
            keys: HashMap::from([("key-a", "ws-1"), ("key-b", "ws-1"), ("key-c", "ws-2")]),
        }) as Arc<dyn RemoteAuthenticator>
    });
    let state = AppState::new(cfg, store, remote).expect("state");
    build_app_with_routes(state, routes())
}

fn spans(project: &str, key: &str, count: usize) -> Request<Body> {
    let batch: Vec<Value> = (0..count).map(|i| json!({ "span_id": i })).collect();
    Request::builder()
        .method("POST")
        .uri(format!("/v1/projects/{project}/spans"))
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "spans": batch }).to_string()))
        .unwrap()
}

fn get_traces(key: &str) -> Request<Body> {
    Request::builder()
        .uri("/v1/traces")
        .header("authorization", key)
        .body(Body::empty())
        .unwrap()
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_batch_is_admitted_all_or_nothing() {
    let app = app_with(config(), true);

    let res = app.clone().oneshot(spans("p1", "key-a", 1)).await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert_eq!(
        header(&res, "tracehub-spans-remaining-limit").as_deref(),
        Some("3")
    );
    assert_eq!(
        header(&res, "tracehub-spans-limit").as_deref(),
        Some("span_ingest")
    );

    let res = app.clone().oneshot(spans("p1", "key-a", 4)).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        header(&res, "tracehub-spans-remaining-limit").as_deref(),
        Some("3")
    );
    let reset: u64 = header(&res, "ratelimit-reset").unwrap().parse().unwrap();
    assert!((1..=60).contains(&reset));
    let ttl: u64 = header(&res, "tracehub-spans-remaining-limit-ttl-millis")
        .unwrap()
        .parse()
        .unwrap();
    assert!(ttl > 0 && ttl <= 60_000);
    assert_eq!(
        header(&res, "tracehub-spans-reset"),
        header(&res, "ratelimit-reset")
    );
    assert_eq!(body_text(res).await, "Too Many Requests: span_ingest exceeded");

    let res = app.clone().oneshot(spans("p1", "key-a", 3)).await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert_eq!(
        header(&res, "tracehub-spans-remaining-limit").as_deref(),
        Some("0")
    );
}

#[tokio::test]
async fn test_placeholder_selects_independent_counters() {
    let app = app_with(config(), true);

    let res = app.clone().oneshot(spans("p1", "key-a", 4)).await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let res = app.clone().oneshot(spans("p1", "key-a", 1)).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

    let res = app.clone().oneshot(spans("p2", "key-a", 4)).await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_workspace_bucket_aggregates_api_keys() {
    let app = app_with(config(), true);

    // key-a and key-b share ws-1, whose aggregate limit is 8
    for _ in 0..5 {
        let res = app.clone().oneshot(get_traces("key-a")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    let res = app.clone().oneshot(get_traces("key-b")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        header(&res, "tracehub-workspace-remaining-limit").as_deref(),
        Some("2")
    );
    assert_eq!(
        header(&res, "tracehub-user-remaining-limit").as_deref(),
        Some("99")
    );

    // ws-2 is untouched
    let res = app.clone().oneshot(get_traces("key-c")).await.unwrap();
    assert_eq!(
        header(&res, "tracehub-workspace-remaining-limit").as_deref(),
        Some("7")
    );
}

#[tokio::test]
async fn test_denial_stops_at_first_bucket_without_rollback() {
    let app = app_with(config(), true);

    let res = app.clone().oneshot(spans("p1", "key-a", 4)).await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    // span_ingest denies, so the defaults after it are not consulted
    let res = app.clone().oneshot(spans("p1", "key-a", 2)).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(header(&res, "tracehub-user-remaining-limit").is_none());

    let res = app.clone().oneshot(get_traces("key-a")).await.unwrap();
    assert_eq!(
        header(&res, "tracehub-user-remaining-limit").as_deref(),
        Some("95")
    );
}

#[tokio::test]
async fn test_empty_batch_costs_nothing() {
    let app = app_with(config(), true);

    let res = app.clone().oneshot(spans("p1", "key-a", 0)).await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert_eq!(
        header(&res, "tracehub-spans-remaining-limit").as_deref(),
        Some("4")
    );
}

#[tokio::test]
async fn test_authentication_failures() {
    let app = app_with(config(), true);

    let missing = Request::builder()
        .uri("/v1/traces")
        .body(Body::empty())
        .unwrap();
    let res = app.clone().oneshot(missing).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app.clone().oneshot(get_traces("unknown")).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_str(&body_text(res).await).unwrap();
    assert_eq!(body["error"], "unauthorized");

    let locked = Request::builder()
        .uri("/v1/traces")
        .header("authorization", "key-a")
        .header("TraceHub-Workspace", "locked")
        .body(Body::empty())
        .unwrap();
    let res = app.clone().oneshot(locked).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_public_endpoints_skip_admission() {
    let app = app_with(config(), true);

    let res = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(header(&res, "tracehub-user-remaining-limit").is_none());

    let res = app
        .clone()
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_disabled_rate_limiting_adds_no_headers() {
    let mut cfg = config();
    cfg.rate_limit.enabled = false;
    let app = app_with(cfg, true);

    for _ in 0..6 {
        let res = app.clone().oneshot(spans("p1", "key-a", 4)).await.unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        assert!(header(&res, "tracehub-spans-remaining-limit").is_none());
    }
}

#[tokio::test]
async fn test_anonymous_mode_uses_requested_workspace() {
    let app = app_with(config(), false);

    let req = Request::builder()
        .uri("/v1/traces")
        .header("tracehub-workspace", "acme")
        .body(Body::empty())
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        header(&res, "tracehub-workspace-remaining-limit").as_deref(),
        Some("7")
    );
}

fn unreachable_store() -> CoordinationStore {
    CoordinationStore::redis_unchecked(&RedisConfig {
        enabled: true,
        url: "redis://127.0.0.1:1".to_string(),
        timeout_ms: 500,
        ..Default::default()
    })
    .expect("pool")
}

#[tokio::test]
async fn test_store_outage_fail_closed_is_service_unavailable() {
    let mut cfg = config();
    cfg.rate_limit.store_failure = StoreFailurePolicy::FailClosed;
    let app = app_on_store(cfg, true, unreachable_store());

    // auth cache misses on the dead store, the identity service still answers
    let res = app.clone().oneshot(get_traces("key-a")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(body_text(res).await.starts_with("Service Unavailable"));

    let res = app
        .clone()
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_store_outage_fail_open_admits_with_full_quota() {
    let mut cfg = config();
    cfg.rate_limit.store_failure = StoreFailurePolicy::FailOpen;
    let app = app_on_store(cfg, true, unreachable_store());

    for _ in 0..3 {
        let res = app.clone().oneshot(get_traces("key-a")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            header(&res, "tracehub-user-remaining-limit").as_deref(),
            Some("100")
        );
    }
}
