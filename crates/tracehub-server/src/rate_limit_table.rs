//! Explicit route → bucket table.
//!
//! Routes are keyed by method and the router's path template, so the table
//! is looked up with the `MatchedPath` of a request rather than its URI.
//! Every plan ends with the general per-key bucket, followed by the
//! workspace aggregate when one is configured.

use std::collections::HashMap;

use axum::http::Method;
use tracehub_coordination::{Cost, LimitConfig, LimitScope, RateLimitConfig};

/// One bucket gating a route.
#[derive(Debug, Clone)]
pub struct RouteLimit {
    pub bucket: LimitConfig,
    pub scope: LimitScope,
    /// Path parameter whose value is appended to the counter key.
    pub placeholder_param: Option<String>,
}

/// Buckets to evaluate for a route, in order, and what one request costs.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub limits: Vec<RouteLimit>,
    pub cost: Cost,
}

impl RoutePlan {
    pub fn needs_path_params(&self) -> bool {
        self.limits.iter().any(|l| l.placeholder_param.is_some())
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitTable {
    routes: HashMap<(Method, String), RoutePlan>,
    fallback: RoutePlan,
}

impl RateLimitTable {
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, String> {
        config.validate()?;

        let mut defaults = vec![RouteLimit {
            bucket: config.general.clone(),
            scope: LimitScope::ApiKey,
            placeholder_param: None,
        }];
        if let Some(ref workspace) = config.workspace {
            defaults.push(RouteLimit {
                bucket: workspace.clone(),
                scope: LimitScope::Workspace,
                placeholder_param: None,
            });
        }

        let mut routes = HashMap::new();
        for route in &config.routes {
            let method = Method::from_bytes(route.method.to_ascii_uppercase().as_bytes())
                .map_err(|_| format!("rate_limit.routes: invalid method '{}'", route.method))?;
            if let Some(ref param) = route.placeholder_param {
                if !template_has_param(&route.path, param) {
                    return Err(format!(
                        "rate_limit.routes {} {}: placeholder_param '{param}' is not a path parameter",
                        route.method, route.path
                    ));
                }
            }

            let mut limits: Vec<RouteLimit> = route
                .buckets
                .iter()
                .filter_map(|name| config.custom.get(name))
                .map(|bucket| RouteLimit {
                    bucket: bucket.clone(),
                    scope: route.scope,
                    placeholder_param: route.placeholder_param.clone(),
                })
                .collect();
            limits.extend(defaults.iter().cloned());

            let key = (method, route.path.clone());
            if routes.contains_key(&key) {
                return Err(format!(
                    "rate_limit.routes {} {} is declared twice",
                    route.method, route.path
                ));
            }
            routes.insert(
                key,
                RoutePlan {
                    limits,
                    cost: route.cost.clone(),
                },
            );
        }

        Ok(Self {
            routes,
            fallback: RoutePlan {
                limits: defaults,
                cost: Cost::default(),
            },
        })
    }

    /// Plan for a request; routes without an entry get the defaults at cost 1.
    pub fn plan(&self, method: &Method, path_template: &str) -> &RoutePlan {
        self.routes
            .get(&(method.clone(), path_template.to_string()))
            .unwrap_or(&self.fallback)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Whether `path` captures `param` as `{param}` or `{*param}`.
fn template_has_param(path: &str, param: &str) -> bool {
    path.split('/').any(|segment| {
        segment
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .map(|name| name.strip_prefix('*').unwrap_or(name) == param)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracehub_coordination::RouteLimitConfig;

    use super::*;

    fn bucket(name: &str, header: &str) -> LimitConfig {
        LimitConfig {
            bucket_name: name.to_string(),
            header_name: header.to_string(),
            limit: 100,
            window: Duration::from_secs(60),
            error_message: format!("{name} exceeded"),
        }
    }

    fn config() -> RateLimitConfig {
        let mut config = RateLimitConfig {
            enabled: true,
            workspace: Some(bucket("workspace_events", "Workspace")),
            ..Default::default()
        };
        config
            .custom
            .insert("span_ingest".to_string(), bucket("span_ingest", "Spans"));
        config
            .custom
            .insert("experiments".to_string(), bucket("experiments", "Experiments"));
        config.routes.push(RouteLimitConfig {
            method: "post".to_string(),
            path: "/v1/projects/{project_id}/spans".to_string(),
            buckets: vec!["span_ingest".to_string(), "experiments".to_string()],
            scope: LimitScope::Workspace,
            placeholder_param: Some("project_id".to_string()),
            cost: Cost::JsonArrayLen("spans".to_string()),
        });
        config
    }

    #[test]
    fn test_declared_route_orders_custom_then_defaults() {
        let table = RateLimitTable::from_config(&config()).unwrap();
        let plan = table.plan(&Method::POST, "/v1/projects/{project_id}/spans");

        let names: Vec<_> = plan
            .limits
            .iter()
            .map(|l| l.bucket.bucket_name.as_str())
            .collect();
        assert_eq!(
            names,
            ["span_ingest", "experiments", "general_events", "workspace_events"]
        );
        assert_eq!(plan.limits[0].scope, LimitScope::Workspace);
        assert_eq!(plan.limits[2].scope, LimitScope::ApiKey);
        assert_eq!(plan.limits[2].placeholder_param, None);
        assert!(plan.needs_path_params());
        assert_eq!(plan.cost, Cost::JsonArrayLen("spans".to_string()));
    }

    #[test]
    fn test_undeclared_route_gets_defaults() {
        let table = RateLimitTable::from_config(&config()).unwrap();
        let plan = table.plan(&Method::GET, "/v1/projects/{project_id}/spans");

        assert_eq!(plan.limits.len(), 2);
        assert_eq!(plan.cost, Cost::Fixed(1));
        assert!(!plan.needs_path_params());
    }

    #[test]
    fn test_duplicate_route_is_rejected() {
        let mut config = config();
        let duplicate = config.routes[0].clone();
        config.routes.push(duplicate);
        assert!(
            RateLimitTable::from_config(&config)
                .unwrap_err()
                .contains("declared twice")
        );
    }

    #[test]
    fn test_placeholder_must_be_a_path_parameter() {
        let mut config = config();
        config.routes[0].placeholder_param = Some("projectId".to_string());
        let err = RateLimitTable::from_config(&config).unwrap_err();
        assert!(err.contains("not a path parameter"), "unexpected error: {err}");

        assert!(template_has_param("/v1/projects/{project_id}/spans", "project_id"));
        assert!(template_has_param("/v1/files/{*path}", "path"));
        assert!(!template_has_param("/v1/projects/project_id/spans", "project_id"));
    }

    #[test]
    fn test_unknown_bucket_is_rejected() {
        let mut config = config();
        config.routes[0].buckets.push("missing".to_string());
        assert!(RateLimitTable::from_config(&config).is_err());
    }
}
