//! Leased mutual exclusion across replicas.
//!
//! A lock is a store key holding the owner's token with an expiry. Acquiring
//! is "set if absent", releasing is "delete if the value is still my token",
//! so a process can never release a lease it does not hold. There is no
//! queueing: a caller that loses the race does not wait or retry.
//!
//! ```text
//! Free ──acquire(token)──▶ Held(token) ──release(token) / expiry──▶ Free
//!                              │
//!                              └─ acquire(other) ─▶ Held(token), returns false
//! ```
//!
//! A crashed holder blocks others for at most one lease. Around that
//! boundary a protected job may run twice, so jobs must be idempotent.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{CoordinationError, Result};
use crate::metrics;
use crate::store::{CoordinationStore, keys};

/// Name of a fleet-wide lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lock {
    key: String,
}

impl Lock {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Lock name built from colon-separated parts, e.g. `job:daily_usage_report`.
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let key = parts
            .into_iter()
            .map(|part| part.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(":");
        Self { key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn store_key(&self) -> String {
        keys::lock(&self.key)
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Proof of ownership for one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to an action guarded by a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was acquired and the action ran to completion.
    Executed(T),
    /// Another holder owns the lock; the action was never polled.
    Skipped,
}

impl<T> LockOutcome<T> {
    pub fn is_executed(&self) -> bool {
        matches!(self, LockOutcome::Executed(_))
    }

    pub fn into_executed(self) -> Option<T> {
        match self {
            LockOutcome::Executed(value) => Some(value),
            LockOutcome::Skipped => None,
        }
    }
}

#[derive(Clone)]
pub struct LockService {
    store: CoordinationStore,
    default_lease: Duration,
}

impl LockService {
    pub fn new(store: CoordinationStore, config: &LockConfig) -> Self {
        Self {
            store,
            default_lease: config.default_lease,
        }
    }

    pub fn default_lease(&self) -> Duration {
        self.default_lease
    }

    /// Try to take `lock` for `lease`, returning whether this call acquired it.
    pub async fn lock_using_token(
        &self,
        lock: &Lock,
        token: &LockToken,
        lease: Duration,
    ) -> Result<bool> {
        if lease.is_zero() {
            return Err(CoordinationError::invalid_argument(format!(
                "lease for lock '{lock}' must be > 0"
            )));
        }

        let acquired = self
            .store
            .set_if_absent(&lock.store_key(), token.as_str(), lease)
            .await?;

        metrics::record_lock_attempt(acquired);
        tracing::debug!(
            lock = %lock,
            acquired,
            lease_ms = lease.as_millis() as u64,
            "lock acquisition attempt"
        );
        Ok(acquired)
    }

    /// Release `lock` if it is still held by `token`.
    ///
    /// Returns false when the lease already expired or belongs to someone
    /// else; neither is an error.
    pub async fn unlock_using_token(&self, lock: &Lock, token: &LockToken) -> Result<bool> {
        let released = self
            .store
            .delete_if_equals(&lock.store_key(), token.as_str())
            .await?;

        if !released {
            tracing::debug!(lock = %lock, "lock no longer held by this token at release");
        }
        Ok(released)
    }

    /// Run `action` under `lock` with the default lease.
    pub async fn execute_with_lock<F, T>(&self, lock: &Lock, action: F) -> Result<LockOutcome<T>>
    where
        F: Future<Output = T>,
    {
        self.execute_with_lock_custom_expire(lock, action, self.default_lease)
            .await
    }

    /// Run `action` under `lock` with an explicit lease.
    ///
    /// If the lock is taken the action is dropped without being polled and
    /// `Skipped` is returned. Otherwise the action runs and the lock is
    /// released afterwards whether the action returns normally or panics; a
    /// panic is resumed after the release. A failed release is logged, since
    /// the lease expires on its own.
    pub async fn execute_with_lock_custom_expire<F, T>(
        &self,
        lock: &Lock,
        action: F,
        lease: Duration,
    ) -> Result<LockOutcome<T>>
    where
        F: Future<Output = T>,
    {
        let token = LockToken::new();

        if !self.lock_using_token(lock, &token, lease).await? {
            tracing::debug!(lock = %lock, "lock held elsewhere, skipping action");
            return Ok(LockOutcome::Skipped);
        }

        let result = AssertUnwindSafe(action).catch_unwind().await;

        if let Err(e) = self.unlock_using_token(lock, &token).await {
            tracing::warn!(
                lock = %lock,
                error = %e,
                "Failed to release lock, it will expire with its lease"
            );
        }

        match result {
            Ok(value) => Ok(LockOutcome::Executed(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
