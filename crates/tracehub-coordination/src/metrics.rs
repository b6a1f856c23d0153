//! Metrics emitted by the coordination primitives.
//!
//! Recording goes through the `metrics` facade; the server installs the
//! Prometheus recorder. Without a recorder these calls are no-ops.

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "rate_limit_decisions_total";
    pub const AUTH_CACHE_LOOKUPS_TOTAL: &str = "auth_cache_lookups_total";
    pub const LOCK_ACQUISITIONS_TOTAL: &str = "lock_acquisitions_total";
    pub const STORE_ERRORS_TOTAL: &str = "coordination_store_errors_total";
}

/// Record an admission decision for a bucket.
pub fn record_rate_limit_decision(bucket: &str, allowed: bool) {
    let outcome = if allowed { "allowed" } else { "denied" };
    counter!(
        names::RATE_LIMIT_DECISIONS_TOTAL,
        "bucket" => bucket.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_auth_cache_hit() {
    counter!(names::AUTH_CACHE_LOOKUPS_TOTAL, "result" => "hit").increment(1);
}

pub fn record_auth_cache_miss() {
    counter!(names::AUTH_CACHE_LOOKUPS_TOTAL, "result" => "miss").increment(1);
}

/// Record a lock acquisition attempt.
pub fn record_lock_attempt(acquired: bool) {
    let result = if acquired { "acquired" } else { "contended" };
    counter!(names::LOCK_ACQUISITIONS_TOTAL, "result" => result).increment(1);
}

/// Record a failed store round trip.
pub fn record_store_error(operation: &'static str) {
    counter!(names::STORE_ERRORS_TOTAL, "operation" => operation).increment(1);
}
