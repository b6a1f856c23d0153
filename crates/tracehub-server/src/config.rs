use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};
use tracehub_coordination::{AuthCacheConfig, LockConfig, RateLimitConfig, RedisConfig};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Shared coordination store
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Remote identity service
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub auth_cache: AuthCacheConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Store validation
        if self.redis.enabled {
            if self.redis.url.is_empty() {
                return Err("redis.enabled=true requires redis.url".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
        }
        self.rate_limit.validate()?;
        if self.auth.enabled && self.auth.service_url.as_deref().unwrap_or("").is_empty() {
            return Err("auth.enabled=true requires auth.service_url".into());
        }
        if self.auth.timeout_ms == 0 {
            return Err("auth.timeout_ms must be > 0".into());
        }
        if self.auth_cache.enabled && self.auth_cache.ttl.is_zero() {
            return Err("auth_cache.ttl must be > 0".into());
        }
        if self.lock.default_lease.is_zero() {
            return Err("lock.default_lease must be > 0".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// How often a replica without Redis sweeps expired entries from its
    /// in-process store.
    #[serde(default = "default_local_cleanup_interval", with = "humantime_serde")]
    pub local_cleanup_interval: Duration,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    10 * 1024 * 1024
}
fn default_local_cleanup_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            local_cleanup_interval: default_local_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Identity service settings.
///
/// With `enabled = false` every request is attributed to an anonymous
/// principal in the requested workspace, which is only meant for local
/// development.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the identity service (e.g., "http://auth.internal:9000")
    #[serde(default)]
    pub service_url: Option<String>,

    /// Request timeout in milliseconds
    #[serde(default = "default_auth_timeout_ms")]
    pub timeout_ms: u64,

    /// Permissions each route requires; routes not listed only need a
    /// valid identity.
    #[serde(default)]
    pub routes: Vec<RoutePermissionConfig>,
}

fn default_auth_timeout_ms() -> u64 {
    3000
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_url: None,
            timeout_ms: default_auth_timeout_ms(),
            routes: Vec::new(),
        }
    }
}

impl AuthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePermissionConfig {
    pub method: String,
    pub path: String,
    pub permissions: Vec<String>,
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("tracehub.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., TRACEHUB__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("TRACEHUB")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
