//! Authorization decision caching.
//!
//! Resolving an API key to an identity and checking its permissions is a
//! remote call. This cache memoizes the outcome in the shared store so that
//! repeated requests from the same caller skip it.
//!
//! ## One Entry Per Permission
//!
//! Entries are keyed by `(api key, workspace, permission)`, not by the whole
//! permission set. Caching `A` and later `B` are independent writes, and a
//! lookup requiring `{A, B}` hits only once both are present. Endpoints that
//! check different permissions therefore populate the cache incrementally.
//! An empty permission set is stored under the `none` sentinel.
//!
//! ## Expiry
//!
//! Each entry lives for the configured TTL from its own write and then
//! disappears. [`AuthCredentialsCache::invalidate`] exists for freshness;
//! correctness never depends on it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AuthCacheConfig;
use crate::metrics;
use crate::store::{CoordinationStore, keys};

/// Kind of long-horizon metered entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    SpanCount,
    TraceCount,
    MonthlyEventCount,
}

/// Metered entitlement carried alongside an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    #[serde(rename = "type")]
    pub quota_type: QuotaType,
    pub limit: u64,
    pub used: u64,
}

impl Quota {
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

/// Identity as resolved by the remote authentication service.
///
/// This is the payload written to every per-permission entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub user_name: String,
    pub workspace_id: String,
    /// Workspace name as returned by the authentication service.
    pub workspace_name: String,
    #[serde(default)]
    pub quotas: Vec<Quota>,
}

/// Credentials attached to an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredentials {
    pub user_name: String,
    pub workspace_id: String,
    /// The workspace name the caller asked for.
    pub workspace_name: String,
    pub quotas: Vec<Quota>,
}

impl AuthCredentials {
    pub fn from_identity(identity: ResolvedIdentity, requested_workspace: &str) -> Self {
        Self {
            user_name: identity.user_name,
            workspace_id: identity.workspace_id,
            workspace_name: requested_workspace.to_string(),
            quotas: identity.quotas,
        }
    }
}

/// Store slots for a permission set, deduplicated and in a stable order.
///
/// `None` is the identity-only slot used for an empty set. It has its own
/// key shape, so a permission literally named `none` stays distinct.
fn permission_slots(permissions: &[String]) -> Vec<Option<&str>> {
    if permissions.is_empty() {
        return vec![None];
    }
    permissions
        .iter()
        .map(String::as_str)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(Some)
        .collect()
}

fn entry_keys(api_key: &str, workspace_name: &str, permissions: &[String]) -> Vec<String> {
    permission_slots(permissions)
        .into_iter()
        .map(|permission| keys::auth_cache(api_key, workspace_name, permission))
        .collect()
}

/// Cache of authorization outcomes.
///
/// Every method is infallible from the caller's point of view: a store
/// failure reads as a miss and a failed write is logged and dropped, leaving
/// the full authorization path authoritative.
#[async_trait]
pub trait AuthCredentialsCache: Send + Sync {
    /// Look up credentials for a caller that must hold every permission in
    /// `permissions`. A hit requires every per-permission entry.
    async fn resolve(
        &self,
        api_key: &str,
        workspace_name: &str,
        permissions: &[String],
    ) -> Option<AuthCredentials>;

    /// Record that `api_key` resolved to `identity` and holds `permissions`
    /// in `workspace_name`. Writes one entry per permission.
    async fn cache(
        &self,
        api_key: &str,
        workspace_name: &str,
        permissions: &[String],
        identity: &ResolvedIdentity,
    );

    /// Drop the entries for `permissions` before their TTL.
    async fn invalidate(&self, api_key: &str, workspace_name: &str, permissions: &[String]);
}

/// Store-backed implementation.
pub struct RedisAuthCredentialsCache {
    store: CoordinationStore,
    ttl: Duration,
}

impl RedisAuthCredentialsCache {
    pub fn new(store: CoordinationStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn merge(
        values: Vec<Option<Vec<u8>>>,
        requested_workspace: &str,
    ) -> Option<AuthCredentials> {
        let mut identities = Vec::with_capacity(values.len());
        for value in values {
            let bytes = value?;
            match rmp_serde::from_slice::<ResolvedIdentity>(&bytes) {
                Ok(identity) => identities.push(identity),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding undecodable auth cache entry");
                    return None;
                }
            }
        }

        let mut identities = identities.into_iter();
        let first = identities.next()?;
        for other in identities {
            if other.user_name != first.user_name || other.workspace_id != first.workspace_id {
                tracing::warn!(
                    workspace = %requested_workspace,
                    "Auth cache entries disagree on identity, treating as miss"
                );
                return None;
            }
        }

        Some(AuthCredentials::from_identity(first, requested_workspace))
    }
}

#[async_trait]
impl AuthCredentialsCache for RedisAuthCredentialsCache {
    async fn resolve(
        &self,
        api_key: &str,
        workspace_name: &str,
        permissions: &[String],
    ) -> Option<AuthCredentials> {
        let keys = entry_keys(api_key, workspace_name, permissions);

        let values = match self.store.get_many(&keys).await {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(error = %e, "Auth cache lookup failed, treating as miss");
                metrics::record_auth_cache_miss();
                return None;
            }
        };

        match Self::merge(values, workspace_name) {
            Some(credentials) => {
                tracing::debug!(workspace = %workspace_name, entries = keys.len(), "auth cache hit");
                metrics::record_auth_cache_hit();
                Some(credentials)
            }
            None => {
                tracing::debug!(workspace = %workspace_name, entries = keys.len(), "auth cache miss");
                metrics::record_auth_cache_miss();
                None
            }
        }
    }

    async fn cache(
        &self,
        api_key: &str,
        workspace_name: &str,
        permissions: &[String],
        identity: &ResolvedIdentity,
    ) {
        let payload = match rmp_serde::to_vec_named(identity) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode auth cache entry");
                return;
            }
        };

        let entries: Vec<(String, Vec<u8>)> = entry_keys(api_key, workspace_name, permissions)
            .into_iter()
            .map(|key| (key, payload.clone()))
            .collect();

        if let Err(e) = self.store.set_many(&entries, self.ttl).await {
            tracing::warn!(error = %e, "Auth cache write failed");
        } else {
            tracing::debug!(
                workspace = %workspace_name,
                entries = entries.len(),
                ttl_ms = self.ttl.as_millis() as u64,
                "auth cache populated"
            );
        }
    }

    async fn invalidate(&self, api_key: &str, workspace_name: &str, permissions: &[String]) {
        let keys = entry_keys(api_key, workspace_name, permissions);
        if let Err(e) = self.store.delete_many(&keys).await {
            tracing::warn!(error = %e, "Auth cache invalidation failed");
        }
    }
}

/// Pass-through implementation for when caching is administratively disabled.
pub struct NoOpAuthCredentialsCache;

#[async_trait]
impl AuthCredentialsCache for NoOpAuthCredentialsCache {
    async fn resolve(
        &self,
        _api_key: &str,
        _workspace_name: &str,
        _permissions: &[String],
    ) -> Option<AuthCredentials> {
        None
    }

    async fn cache(
        &self,
        _api_key: &str,
        _workspace_name: &str,
        _permissions: &[String],
        _identity: &ResolvedIdentity,
    ) {
    }

    async fn invalidate(&self, _api_key: &str, _workspace_name: &str, _permissions: &[String]) {}
}

/// Create the auth cache selected by configuration.
pub fn create_auth_cache(
    config: &AuthCacheConfig,
    store: CoordinationStore,
) -> Arc<dyn AuthCredentialsCache> {
    if config.enabled {
        Arc::new(RedisAuthCredentialsCache::new(store, config.ttl))
    } else {
        tracing::info!("Auth credentials cache disabled");
        Arc::new(NoOpAuthCredentialsCache)
    }
}
