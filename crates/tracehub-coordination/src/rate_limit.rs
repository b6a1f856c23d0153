//! Fixed-window admission control over the shared store.
//!
//! A bucket ([`LimitConfig`]) names a quota family. Each `(bucket,
//! principal[, placeholder])` triple maps to one counter in the store whose
//! window opens on first use and closes by expiry. Admission of a request
//! costing N permits is all-or-nothing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::StoreFailurePolicy;
use crate::error::{CoordinationError, Result};
use crate::metrics;
use crate::store::{CoordinationStore, CounterOutcome, keys};

/// Prefix of the per-bucket response headers.
pub const HEADER_PREFIX: &str = "TraceHub";

/// Standard reset hint header, in whole seconds.
pub const RESET_HEADER: &str = "RateLimit-Reset";

/// Immutable descriptor of a named quota family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    pub bucket_name: String,
    /// Short name used in response headers, e.g. "User" or "Workspace".
    pub header_name: String,
    /// Permits per window.
    pub limit: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub error_message: String,
}

impl LimitConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.bucket_name.is_empty() {
            return Err("bucket_name must not be empty".into());
        }
        if self.bucket_name.contains(':') {
            return Err(format!(
                "bucket_name '{}' must not contain ':'",
                self.bucket_name
            ));
        }
        if self.header_name.is_empty() {
            return Err(format!("{}: header_name must not be empty", self.bucket_name));
        }
        if self.limit == 0 {
            return Err(format!("{}: limit must be > 0", self.bucket_name));
        }
        if self.window.is_zero() {
            return Err(format!("{}: window must be > 0", self.bucket_name));
        }
        Ok(())
    }
}

/// Which identity a bucket counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    /// Isolated per API key, even within one workspace.
    #[default]
    ApiKey,
    /// Aggregated across every key of the workspace.
    Workspace,
}

/// Admission decision for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Allowed {
        remaining: u64,
        reset_in_millis: u64,
    },
    Denied {
        remaining: u64,
        reset_in_millis: u64,
        error_message: String,
    },
}

impl RateLimitOutcome {
    fn from_counter(counter: CounterOutcome, bucket: &LimitConfig) -> Self {
        if counter.allowed {
            RateLimitOutcome::Allowed {
                remaining: counter.remaining,
                reset_in_millis: counter.reset_in_millis,
            }
        } else {
            RateLimitOutcome::Denied {
                remaining: counter.remaining,
                reset_in_millis: counter.reset_in_millis,
                error_message: bucket.error_message.clone(),
            }
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitOutcome::Allowed { .. })
    }

    pub fn remaining(&self) -> u64 {
        match self {
            RateLimitOutcome::Allowed { remaining, .. }
            | RateLimitOutcome::Denied { remaining, .. } => *remaining,
        }
    }

    pub fn reset_in_millis(&self) -> u64 {
        match self {
            RateLimitOutcome::Allowed {
                reset_in_millis, ..
            }
            | RateLimitOutcome::Denied {
                reset_in_millis, ..
            } => *reset_in_millis,
        }
    }

    /// Reset hint in whole seconds, rounded up.
    pub fn reset_in_secs(&self) -> u64 {
        self.reset_in_millis().div_ceil(1000)
    }

    /// Response headers describing this outcome for `bucket`.
    ///
    /// ```text
    /// TraceHub-<header>-Limit: <bucket name>
    /// TraceHub-<header>-Remaining-Limit: <remaining permits>
    /// TraceHub-<header>-Remaining-Limit-TTL-Millis: <remaining window>
    /// TraceHub-<header>-Reset: <remaining window in seconds, rounded up>
    /// ```
    pub fn headers(&self, bucket: &LimitConfig) -> [(String, String); 4] {
        let name = &bucket.header_name;
        [
            (
                format!("{HEADER_PREFIX}-{name}-Limit"),
                bucket.bucket_name.clone(),
            ),
            (
                format!("{HEADER_PREFIX}-{name}-Remaining-Limit"),
                self.remaining().to_string(),
            ),
            (
                format!("{HEADER_PREFIX}-{name}-Remaining-Limit-TTL-Millis"),
                self.reset_in_millis().to_string(),
            ),
            (
                format!("{HEADER_PREFIX}-{name}-Reset"),
                self.reset_in_secs().to_string(),
            ),
        ]
    }
}

/// One bucket to evaluate for a request.
#[derive(Debug, Clone, Copy)]
pub struct BucketCheck<'a> {
    pub principal: &'a str,
    pub bucket: &'a LimitConfig,
    pub placeholder: Option<&'a str>,
}

/// Outcome of one bucket within a multi-bucket evaluation.
#[derive(Debug, Clone)]
pub struct BucketDecision<'a> {
    pub bucket: &'a LimitConfig,
    pub outcome: RateLimitOutcome,
}

/// Admission controller shared by every request handler.
#[derive(Clone)]
pub struct RateLimiter {
    store: CoordinationStore,
    on_store_failure: StoreFailurePolicy,
}

impl RateLimiter {
    pub fn new(store: CoordinationStore, on_store_failure: StoreFailurePolicy) -> Self {
        Self {
            store,
            on_store_failure,
        }
    }

    /// Try to charge `cost` permits for `principal` against `bucket`.
    ///
    /// A cost of zero only reports the counter and never creates it.
    pub async fn check(
        &self,
        principal: &str,
        bucket: &LimitConfig,
        cost: u64,
        placeholder: Option<&str>,
    ) -> Result<RateLimitOutcome> {
        if cost == 0 {
            return self.remaining(principal, bucket, placeholder).await;
        }

        let key = keys::rate_limit(&bucket.bucket_name, principal, placeholder);
        match self
            .store
            .consume(&key, bucket.limit, bucket.window, cost)
            .await
        {
            Ok(counter) => {
                metrics::record_rate_limit_decision(&bucket.bucket_name, counter.allowed);
                tracing::debug!(
                    bucket = %bucket.bucket_name,
                    placeholder = ?placeholder,
                    cost,
                    allowed = counter.allowed,
                    remaining = counter.remaining,
                    reset_in_millis = counter.reset_in_millis,
                    "rate limit decision"
                );
                Ok(RateLimitOutcome::from_counter(counter, bucket))
            }
            Err(e) => self.on_failure(bucket, e),
        }
    }

    /// Report the remaining permits for `principal` without charging.
    pub async fn remaining(
        &self,
        principal: &str,
        bucket: &LimitConfig,
        placeholder: Option<&str>,
    ) -> Result<RateLimitOutcome> {
        let key = keys::rate_limit(&bucket.bucket_name, principal, placeholder);
        match self.store.peek(&key, bucket.limit).await {
            Ok(counter) => Ok(RateLimitOutcome::from_counter(counter, bucket)),
            Err(e) => self.on_failure(bucket, e),
        }
    }

    /// Evaluate several buckets in declared order.
    ///
    /// Each bucket is charged once if it admits the request. Evaluation stops
    /// at the first denial; buckets charged before it stay charged. The
    /// returned decisions cover every bucket consulted, the denying one last.
    pub async fn check_all<'a>(
        &self,
        checks: &[BucketCheck<'a>],
        cost: u64,
    ) -> Result<Vec<BucketDecision<'a>>> {
        let mut decisions = Vec::with_capacity(checks.len());

        for check in checks {
            let outcome = self
                .check(check.principal, check.bucket, cost, check.placeholder)
                .await?;
            let denied = !outcome.is_allowed();
            decisions.push(BucketDecision {
                bucket: check.bucket,
                outcome,
            });
            if denied {
                break;
            }
        }

        Ok(decisions)
    }

    fn on_failure(&self, bucket: &LimitConfig, error: CoordinationError) -> Result<RateLimitOutcome> {
        match self.on_store_failure {
            StoreFailurePolicy::FailOpen if error.is_store_failure() => {
                tracing::warn!(
                    bucket = %bucket.bucket_name,
                    error = %error,
                    "Rate limit store unavailable, admitting request"
                );
                Ok(RateLimitOutcome::Allowed {
                    remaining: bucket.limit,
                    reset_in_millis: 0,
                })
            }
            _ => Err(error),
        }
    }
}
