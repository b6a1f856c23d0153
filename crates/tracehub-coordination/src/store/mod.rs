//! Shared coordination store.
//!
//! ## Store Modes
//!
//! - **Redis**: the fleet-wide source of truth. Every replica talks to the
//!   same Redis through one pooled client handle.
//! - **Local**: an in-process map with the same per-key atomicity, for
//!   single-instance deployments and tests. It coordinates nothing across
//!   processes.
//!
//! No component keeps counters or lock state of its own; every decision is
//! one round trip to the store.
//!
//! ## Key Namespaces
//!
//! ```text
//! ratelimit:<bucket>:<principal>[:<placeholder>]
//! authcache:<api key>:<workspace>:(perm:<permission> | none)
//! lock:<lock key>
//! ```
//!
//! Parts of ratelimit and authcache keys are escaped with [`keys::escape`].

mod local;
mod redis;

pub use local::LocalStore;
pub use redis::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::Pool;

use crate::config::RedisConfig;
use crate::error::Result;

/// Result of an atomic counter operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_in_millis: u64,
}

impl CounterOutcome {
    pub(crate) fn allowed(remaining: u64, reset: Duration) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_in_millis: duration_millis(reset),
        }
    }

    pub(crate) fn denied(remaining: u64, reset: Duration) -> Self {
        Self {
            allowed: false,
            remaining,
            reset_in_millis: duration_millis(reset),
        }
    }
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Millisecond expiry for the store; anything shorter than 1ms rounds up.
fn expiry_millis(duration: Duration) -> u64 {
    duration_millis(duration).max(1)
}

/// Key builders for the three namespaces.
///
/// Caller-supplied parts are escaped so that `:` inside an API key, a
/// workspace name or a permission can never shift a part boundary.
pub mod keys {
    use std::borrow::Cow;

    pub const RATE_LIMIT_PREFIX: &str = "ratelimit";
    pub const AUTH_CACHE_PREFIX: &str = "authcache";
    pub const LOCK_PREFIX: &str = "lock";

    /// Slot of an entry cached for an empty permission set.
    pub const NO_PERMISSION_SLOT: &str = "none";

    /// Percent-escape `%` and `:` in one key part.
    pub fn escape(part: &str) -> Cow<'_, str> {
        if part.contains(['%', ':']) {
            Cow::Owned(part.replace('%', "%25").replace(':', "%3A"))
        } else {
            Cow::Borrowed(part)
        }
    }

    pub fn rate_limit(bucket: &str, principal: &str, placeholder: Option<&str>) -> String {
        let bucket = escape(bucket);
        let principal = escape(principal);
        match placeholder {
            Some(value) => format!(
                "{RATE_LIMIT_PREFIX}:{bucket}:{principal}:{}",
                escape(value)
            ),
            None => format!("{RATE_LIMIT_PREFIX}:{bucket}:{principal}"),
        }
    }

    /// `permission` of `None` addresses the identity-only entry.
    pub fn auth_cache(api_key: &str, workspace_name: &str, permission: Option<&str>) -> String {
        let prefix = format!(
            "{AUTH_CACHE_PREFIX}:{}:{}",
            escape(api_key),
            escape(workspace_name)
        );
        match permission {
            Some(permission) => format!("{prefix}:perm:{}", escape(permission)),
            None => format!("{prefix}:{NO_PERMISSION_SLOT}"),
        }
    }

    pub fn lock(key: &str) -> String {
        format!("{LOCK_PREFIX}:{key}")
    }
}

/// Handle to the coordination store, cheap to clone.
#[derive(Clone)]
pub enum CoordinationStore {
    /// Single-instance: in-process map only
    Local(Arc<LocalStore>),

    /// Multi-instance: shared Redis
    Redis(RedisStore),
}

impl CoordinationStore {
    pub fn new_local() -> Self {
        CoordinationStore::Local(Arc::new(LocalStore::new()))
    }

    pub fn new_redis(pool: Pool) -> Self {
        CoordinationStore::Redis(RedisStore::new(pool))
    }

    /// Atomically charge `cost` permits against a fixed-window counter.
    ///
    /// A missing counter is created with the window as its expiry. An
    /// existing counter is incremented only when the whole cost fits and its
    /// expiry is left untouched. A denial never mutates the counter.
    pub async fn consume(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        cost: u64,
    ) -> Result<CounterOutcome> {
        let window = Duration::from_millis(expiry_millis(window));
        match self {
            CoordinationStore::Local(store) => Ok(store.consume(key, limit, window, cost)),
            CoordinationStore::Redis(store) => store.consume(key, limit, window, cost).await,
        }
    }

    /// Read a counter without charging it. The outcome is always `allowed`.
    pub async fn peek(&self, key: &str, limit: u64) -> Result<CounterOutcome> {
        match self {
            CoordinationStore::Local(store) => Ok(store.peek(key, limit)),
            CoordinationStore::Redis(store) => store.peek(key, limit).await,
        }
    }

    /// Set `key` to `value` with `ttl` unless a live value exists.
    pub async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let ttl = Duration::from_millis(expiry_millis(ttl));
        match self {
            CoordinationStore::Local(store) => Ok(store.set_if_absent(key, value, ttl)),
            CoordinationStore::Redis(store) => store.set_if_absent(key, value, ttl).await,
        }
    }

    /// Delete `key` only if it currently holds `value`.
    pub async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        match self {
            CoordinationStore::Local(store) => Ok(store.delete_if_equals(key, value)),
            CoordinationStore::Redis(store) => store.delete_if_equals(key, value).await,
        }
    }

    /// Fetch several values in one round trip, in key order.
    pub async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            CoordinationStore::Local(store) => Ok(store.get_many(keys)),
            CoordinationStore::Redis(store) => store.get_many(keys).await,
        }
    }

    /// Write several values with the same expiry in one atomic round trip.
    pub async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let ttl = Duration::from_millis(expiry_millis(ttl));
        match self {
            CoordinationStore::Local(store) => {
                store.set_many(entries, ttl);
                Ok(())
            }
            CoordinationStore::Redis(store) => store.set_many(entries, ttl).await,
        }
    }

    pub async fn delete_many(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        match self {
            CoordinationStore::Local(store) => {
                store.delete_many(keys);
                Ok(())
            }
            CoordinationStore::Redis(store) => store.delete_many(keys).await,
        }
    }

    /// Check if the store is reachable (for readiness checks).
    pub async fn ping(&self) -> bool {
        match self {
            CoordinationStore::Local(_) => true,
            CoordinationStore::Redis(store) => store.ping().await,
        }
    }

    /// Sweep expired entries. Redis expires keys natively, so this only
    /// does work in local mode.
    pub fn cleanup_expired(&self) -> usize {
        match self {
            CoordinationStore::Local(store) => store.cleanup_expired(),
            CoordinationStore::Redis(_) => 0,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            CoordinationStore::Local(_) => "local",
            CoordinationStore::Redis(_) => "redis",
        }
    }
}

/// Create the coordination store from configuration.
///
/// With Redis disabled the local store is returned. With Redis enabled the
/// pool must be created and a connection checked out, otherwise this fails:
/// falling back to per-process state would silently break fleet-wide limits
/// and locks.
pub async fn create_store(config: &RedisConfig) -> Result<CoordinationStore> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local coordination store");
        return Ok(CoordinationStore::new_local());
    }

    tracing::info!(url = %config.url, "Connecting to Redis");
    let pool = redis_pool(config)?;

    // Fail fast on an unreachable store
    drop(pool.get().await?);
    tracing::info!(pool_size = config.pool_size, "Connected to Redis");

    Ok(CoordinationStore::new_redis(pool))
}

impl CoordinationStore {
    /// Redis store built from `config` without checking out a connection.
    ///
    /// Connections are opened on first use, so an unreachable server shows
    /// up as errors from the primitives rather than here.
    pub fn redis_unchecked(config: &RedisConfig) -> Result<Self> {
        Ok(CoordinationStore::new_redis(redis_pool(config)?))
    }
}

fn redis_pool(config: &RedisConfig) -> Result<Pool> {
    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let timeout = Some(Duration::from_millis(config.timeout_ms));
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = timeout;
    pool_config.timeouts.create = timeout;
    pool_config.timeouts.recycle = timeout;
    redis_config.pool = Some(pool_config);

    Ok(redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1))?)
}
