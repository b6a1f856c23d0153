//! Configuration sections for the coordination primitives.
//!
//! Every section deserializes with field defaults so an empty table is a
//! valid configuration. Durations use humantime notation (`"60s"`, `"5m"`).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::{LimitConfig, LimitScope};

/// Redis connection settings shared by every primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Use Redis as the coordination store.
    /// When false, an in-process store is used, which only coordinates a
    /// single replica.
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Pool wait/create/recycle timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

/// What the rate limiter does when the store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Admit the request and log the failure.
    #[default]
    FailOpen,
    /// Propagate the error; the HTTP layer answers 503.
    FailClosed,
}

/// How much a single request charges against its buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cost {
    /// A constant number of permits.
    Fixed(u64),
    /// The length of the named top-level JSON array in the request body.
    JsonArrayLen(String),
}

impl Default for Cost {
    fn default() -> Self {
        Cost::Fixed(1)
    }
}

/// A route gated by one or more custom buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteLimitConfig {
    /// HTTP method, e.g. "POST".
    pub method: String,
    /// Route template as registered with the router, e.g. "/v1/projects/{project_id}/spans".
    pub path: String,
    /// Names of entries in [`RateLimitConfig::custom`], evaluated in order.
    pub buckets: Vec<String>,
    #[serde(default)]
    pub scope: LimitScope,
    /// Path parameter whose value selects an independent counter.
    #[serde(default)]
    pub placeholder_param: Option<String>,
    #[serde(default)]
    pub cost: Cost,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Per-API-key bucket applied to every authenticated request.
    #[serde(default = "default_general_limit")]
    pub general: LimitConfig,

    /// Per-workspace aggregate bucket applied to every authenticated request.
    #[serde(default)]
    pub workspace: Option<LimitConfig>,

    /// Named buckets referenced by `routes`.
    #[serde(default)]
    pub custom: BTreeMap<String, LimitConfig>,

    #[serde(default)]
    pub routes: Vec<RouteLimitConfig>,

    #[serde(default)]
    pub store_failure: StoreFailurePolicy,

    /// Maximum request body buffered to compute a JSON array cost.
    #[serde(default = "default_max_cost_body_bytes")]
    pub max_cost_body_bytes: usize,
}

fn default_general_limit() -> LimitConfig {
    LimitConfig {
        bucket_name: "general_events".to_string(),
        header_name: "User".to_string(),
        limit: 10_000,
        window: Duration::from_secs(60),
        error_message: "You have exceeded the limit of events per minute".to_string(),
    }
}

fn default_max_cost_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            general: default_general_limit(),
            workspace: None,
            custom: BTreeMap::new(),
            routes: Vec::new(),
            store_failure: StoreFailurePolicy::default(),
            max_cost_body_bytes: default_max_cost_body_bytes(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.general.validate()?;
        if let Some(ref workspace) = self.workspace {
            workspace.validate()?;
        }
        for (name, bucket) in &self.custom {
            bucket
                .validate()
                .map_err(|e| format!("rate_limit.custom.{name}: {e}"))?;
        }
        for route in &self.routes {
            if route.buckets.is_empty() {
                return Err(format!(
                    "rate_limit.routes {} {} must name at least one bucket",
                    route.method, route.path
                ));
            }
            for name in &route.buckets {
                if !self.custom.contains_key(name) {
                    return Err(format!(
                        "rate_limit.routes {} {} references unknown bucket '{name}'",
                        route.method, route.path
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Auth credentials cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCacheConfig {
    /// When false, every lookup misses and nothing is written.
    #[serde(default = "default_auth_cache_enabled")]
    pub enabled: bool,

    #[serde(default = "default_auth_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

fn default_auth_cache_enabled() -> bool {
    true
}

fn default_auth_cache_ttl() -> Duration {
    Duration::from_secs(5)
}

impl Default for AuthCacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_auth_cache_enabled(),
            ttl: default_auth_cache_ttl(),
        }
    }
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease used by `execute_with_lock`.
    #[serde(default = "default_lock_lease", with = "humantime_serde")]
    pub default_lease: Duration,
}

fn default_lock_lease() -> Duration {
    Duration::from_secs(10)
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_lease: default_lock_lease(),
        }
    }
}
