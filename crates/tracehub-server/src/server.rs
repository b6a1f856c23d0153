use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, http::Method, middleware, routing::get};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracehub_coordination::{
    CoordinationStore, LockService, RateLimiter, create_auth_cache, create_store,
};

use crate::auth::{CachedAuthenticator, HttpRemoteAuthenticator, RemoteAuthenticator};
use crate::jobs::{SingletonJob, spawn_singleton_job, spawn_store_cleanup};
use crate::rate_limit_table::RateLimitTable;
use crate::{config::AppConfig, handlers, middleware as app_middleware};

/// Shared handles injected into every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: CoordinationStore,
    pub rate_limiter: RateLimiter,
    pub rate_limits: Arc<RateLimitTable>,
    /// `None` when authentication is disabled.
    pub authenticator: Option<Arc<CachedAuthenticator>>,
    pub locks: LockService,
    pub max_cost_body_bytes: usize,
    route_permissions: Arc<HashMap<(Method, String), Vec<String>>>,
}

impl AppState {
    /// Connect to the configured store and identity service.
    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let store = create_store(&config.redis).await?;
        tracing::info!(mode = store.mode(), "Coordination store ready");

        let remote: Option<Arc<dyn RemoteAuthenticator>> = if config.auth.enabled {
            Some(Arc::new(HttpRemoteAuthenticator::from_config(&config.auth)?))
        } else {
            tracing::warn!("Authentication disabled, requests run as anonymous");
            None
        };

        Self::new(config, store, remote)
    }

    /// Assemble state around an existing store.
    ///
    /// A `remote` of `None` disables authentication.
    pub fn new(
        config: AppConfig,
        store: CoordinationStore,
        remote: Option<Arc<dyn RemoteAuthenticator>>,
    ) -> anyhow::Result<Self> {
        let rate_limits =
            RateLimitTable::from_config(&config.rate_limit).map_err(anyhow::Error::msg)?;
        let rate_limiter = RateLimiter::new(store.clone(), config.rate_limit.store_failure);
        let cache = create_auth_cache(&config.auth_cache, store.clone());
        let authenticator = remote.map(|remote| Arc::new(CachedAuthenticator::new(cache, remote)));
        let locks = LockService::new(store.clone(), &config.lock);

        let mut route_permissions = HashMap::new();
        for route in &config.auth.routes {
            let method = Method::from_bytes(route.method.to_ascii_uppercase().as_bytes())
                .map_err(|_| anyhow::anyhow!("auth.routes: invalid method '{}'", route.method))?;
            route_permissions.insert((method, route.path.clone()), route.permissions.clone());
        }

        Ok(Self {
            max_cost_body_bytes: config.rate_limit.max_cost_body_bytes,
            config: Arc::new(config),
            store,
            rate_limiter,
            rate_limits: Arc::new(rate_limits),
            authenticator,
            locks,
            route_permissions: Arc::new(route_permissions),
        })
    }

    /// Permissions the route requires beyond a valid identity.
    pub fn permissions_for(&self, method: &Method, path_template: &str) -> &[String] {
        self.route_permissions
            .get(&(method.clone(), path_template.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Built-in authenticated routes.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/whoami", get(handlers::whoami))
        .route("/v1/rate-limits", get(handlers::rate_limits))
}

pub fn build_app(state: AppState) -> Router {
    build_app_with_routes(state, api_routes())
}

/// Build the router around `api`, which is authenticated and rate limited.
///
/// Health and metrics endpoints stay public.
pub fn build_app_with_routes(state: AppState, api: Router<AppState>) -> Router {
    let body_limit = state.config.server.body_limit_bytes;

    // route_layer: last added runs first, so authentication precedes admission
    let mut api = api;
    if state.config.rate_limit.enabled {
        api = api.route_layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::rate_limit_middleware,
        ));
    }
    let api = api.route_layer(middleware::from_fn_with_state(
        state.clone(),
        app_middleware::authentication_middleware,
    ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .merge(api)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, _span: &tracing::Span| {
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

pub struct TracehubServer {
    addr: SocketAddr,
    state: AppState,
    app: Router,
    jobs: Vec<(Arc<dyn SingletonJob>, Duration)>,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    jobs: Vec<(Arc<dyn SingletonJob>, Duration)>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            jobs: Vec::new(),
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Schedule `job` on every replica; the fleet-wide lock keeps it to one
    /// run per tick.
    pub fn with_job(mut self, job: Arc<dyn SingletonJob>, every: Duration) -> Self {
        self.jobs.push((job, every));
        self
    }

    pub async fn build(self) -> anyhow::Result<TracehubServer> {
        let state = AppState::from_config(self.config).await?;
        let app = build_app(state.clone());

        Ok(TracehubServer {
            addr: self.addr,
            state,
            app,
            jobs: self.jobs,
        })
    }
}

impl TracehubServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        for (job, every) in self.jobs {
            tasks.push(spawn_singleton_job(
                self.state.locks.clone(),
                job,
                every,
                shutdown_rx.clone(),
            ));
        }
        if let Some(cleanup) = spawn_store_cleanup(
            self.state.store.clone(),
            self.state.config.server.local_cleanup_interval,
            shutdown_rx.clone(),
        ) {
            tasks.push(cleanup);
        }

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        let _ = shutdown_tx.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
