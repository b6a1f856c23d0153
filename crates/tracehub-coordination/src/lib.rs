//! Distributed coordination and admission control for the TraceHub fleet.
//!
//! Three primitives share one coordination store and keep no state of their
//! own:
//!
//! - [`RateLimiter`] - fixed-window quotas per API key, per workspace and per
//!   named bucket, with all-or-nothing batch admission
//! - [`AuthCredentialsCache`] - per-permission memoization of authorization
//!   decisions
//! - [`LockService`] - leased mutual exclusion for singleton background jobs
//!
//! ## Example
//!
//! ```ignore
//! use tracehub_coordination::{create_store, LockService, Lock, LockOutcome};
//!
//! let store = create_store(&config.redis).await?;
//! let locks = LockService::new(store.clone(), &config.lock);
//!
//! match locks.execute_with_lock(&Lock::new("daily_usage_report"), report()).await? {
//!     LockOutcome::Executed(result) => result?,
//!     LockOutcome::Skipped => {} // another replica is running it
//! }
//! ```

pub mod auth_cache;
pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod rate_limit;
pub mod store;

pub use auth_cache::{
    AuthCredentials, AuthCredentialsCache, NoOpAuthCredentialsCache, Quota, QuotaType,
    RedisAuthCredentialsCache, ResolvedIdentity, create_auth_cache,
};
pub use config::{
    AuthCacheConfig, Cost, LockConfig, RateLimitConfig, RedisConfig, RouteLimitConfig,
    StoreFailurePolicy,
};
pub use error::CoordinationError;
pub use lock::{Lock, LockOutcome, LockService, LockToken};
pub use rate_limit::{
    BucketCheck, BucketDecision, LimitConfig, LimitScope, RateLimitOutcome, RateLimiter,
};
pub use store::{CoordinationStore, create_store};
