pub mod auth;
pub mod config;
pub mod handlers;
pub mod jobs;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod rate_limit_table;
pub mod server;

pub use auth::{
    AuthError, CachedAuthenticator, HttpRemoteAuthenticator, RemoteAuthenticator, RequestIdentity,
};
pub use config::{AppConfig, AuthConfig, LoggingConfig, RoutePermissionConfig, ServerConfig};
pub use jobs::{SingletonJob, run_for_trigger, run_once, spawn_singleton_job};
pub use observability::init_tracing;
pub use rate_limit_table::{RateLimitTable, RouteLimit, RoutePlan};
pub use server::{
    AppState, ServerBuilder, TracehubServer, api_routes, build_app, build_app_with_routes,
};
