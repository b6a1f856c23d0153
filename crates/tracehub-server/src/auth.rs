//! Request authentication backed by the shared credentials cache.
//!
//! The identity service is authoritative. [`CachedAuthenticator`] asks the
//! cache first and only calls the service on a miss, writing back one entry
//! per permission it just had checked.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::Serialize;
use tracehub_coordination::{AuthCredentials, AuthCredentialsCache, ResolvedIdentity};

use crate::config::AuthConfig;

/// Workspace used when a request does not name one.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Errors that can occur while authenticating a request.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No API key was presented.
    #[error("Authentication required")]
    MissingCredentials,

    /// The identity service rejected the API key.
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// The key is valid but lacks access to the workspace or a permission.
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// The identity service could not be reached or answered unexpectedly.
    #[error("Identity service unavailable: {message}")]
    Unavailable { message: String },
}

impl AuthError {
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredentials | Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}

/// Authenticated caller, stored in request extensions.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    pub api_key: String,
    pub credentials: AuthCredentials,
}

impl RequestIdentity {
    /// Identity used when authentication is disabled.
    pub fn anonymous(workspace_name: &str) -> Self {
        Self {
            api_key: "anonymous".to_string(),
            credentials: AuthCredentials {
                user_name: "anonymous".to_string(),
                workspace_id: workspace_name.to_string(),
                workspace_name: workspace_name.to_string(),
                quotas: Vec::new(),
            },
        }
    }
}

/// The external identity service.
#[async_trait]
pub trait RemoteAuthenticator: Send + Sync {
    /// Resolve `api_key` in `workspace_name` and check every permission.
    async fn authenticate(
        &self,
        api_key: &str,
        workspace_name: &str,
        permissions: &[String],
    ) -> Result<ResolvedIdentity, AuthError>;
}

#[derive(Serialize)]
struct ResolveRequest<'a> {
    workspace_name: &'a str,
    permissions: &'a [String],
}

/// [`RemoteAuthenticator`] over HTTP.
///
/// Sends `POST {service_url}/v1/auth/resolve` with the API key in the
/// `Authorization` header. 200 carries a [`ResolvedIdentity`], 401 and 403
/// map to the matching [`AuthError`].
pub struct HttpRemoteAuthenticator {
    client: reqwest::Client,
    resolve_url: String,
}

impl HttpRemoteAuthenticator {
    pub fn new(service_url: &str, client: reqwest::Client) -> Self {
        Self {
            client,
            resolve_url: format!("{}/v1/auth/resolve", service_url.trim_end_matches('/')),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let service_url = config
            .service_url
            .as_deref()
            .ok_or_else(|| AuthError::unavailable("auth.service_url is not configured"))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AuthError::unavailable(e.to_string()))?;
        Ok(Self::new(service_url, client))
    }
}

#[async_trait]
impl RemoteAuthenticator for HttpRemoteAuthenticator {
    async fn authenticate(
        &self,
        api_key: &str,
        workspace_name: &str,
        permissions: &[String],
    ) -> Result<ResolvedIdentity, AuthError> {
        let response = self
            .client
            .post(&self.resolve_url)
            .header(reqwest::header::AUTHORIZATION, api_key)
            .json(&ResolveRequest {
                workspace_name,
                permissions,
            })
            .send()
            .await
            .map_err(|e| AuthError::unavailable(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::OK => response
                .json::<ResolvedIdentity>()
                .await
                .map_err(|e| AuthError::unavailable(format!("invalid identity payload: {e}"))),
            reqwest::StatusCode::UNAUTHORIZED => Err(AuthError::unauthorized("Invalid API key")),
            reqwest::StatusCode::FORBIDDEN => Err(AuthError::forbidden(format!(
                "Access to workspace '{workspace_name}' denied"
            ))),
            status => Err(AuthError::unavailable(format!(
                "identity service returned {status}"
            ))),
        }
    }
}

/// Cache-first authentication.
pub struct CachedAuthenticator {
    cache: Arc<dyn AuthCredentialsCache>,
    remote: Arc<dyn RemoteAuthenticator>,
}

impl CachedAuthenticator {
    pub fn new(
        cache: Arc<dyn AuthCredentialsCache>,
        remote: Arc<dyn RemoteAuthenticator>,
    ) -> Self {
        Self { cache, remote }
    }

    pub async fn authenticate(
        &self,
        api_key: &str,
        workspace_name: &str,
        permissions: &[String],
    ) -> Result<AuthCredentials, AuthError> {
        if let Some(credentials) = self.cache.resolve(api_key, workspace_name, permissions).await {
            return Ok(credentials);
        }

        let identity = self
            .remote
            .authenticate(api_key, workspace_name, permissions)
            .await?;
        self.cache
            .cache(api_key, workspace_name, permissions, &identity)
            .await;

        tracing::debug!(
            user = %identity.user_name,
            workspace_id = %identity.workspace_id,
            permissions = permissions.len(),
            "credentials resolved by identity service"
        );
        Ok(AuthCredentials::from_identity(identity, workspace_name))
    }
}
