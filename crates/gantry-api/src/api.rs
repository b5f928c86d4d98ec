//! API objects group routes and attach cross-cutting behavior to them.

use serde::{Deserialize, Serialize};

use crate::shared::Duration;
use crate::ObjectMeta;

/// A managed API: a named group of HTTPRoutes deployed to an environment.
///
/// Policies on an API (external authorization, CORS) apply to every route the
/// API references. Routes are matched by name prefix after translation, so an
/// API only needs to know the names of its routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Api {
    pub metadata: ObjectMeta,
    pub spec: ApiSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// The names of the HTTPRoutes in this API's namespace that make up the
    /// API.
    #[serde(default)]
    pub route_refs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_auth: Option<ExtAuth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsPolicy>,
}

/// An external authorization service consulted before requests are routed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtAuth {
    pub host: String,
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Allow requests through when the authorization service is unreachable.
    #[serde(default)]
    pub fail_open: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers_to_forward: Vec<String>,
}

/// A cross-origin resource sharing policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsPolicy {
    /// Allowed origins. Each entry is an exact origin or `*`.
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default)]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<Duration>,
    #[serde(default)]
    pub allow_credentials: bool,
}
