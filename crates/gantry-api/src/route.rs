//! Routes attach to Gateway listeners and describe how matching traffic is
//! forwarded to backends.
//!
//! Every concrete route kind implements [Route], a small accessor interface
//! the translator uses to resolve parents and backends without caring which
//! kind of route it's looking at. [RouteKind] is the sum of all the kinds a
//! Resource Graph can carry.

use serde::{Deserialize, Serialize};

use crate::api::CorsPolicy;
use crate::shared::Duration;
use crate::status::Condition;
use crate::ObjectMeta;

/// The kind name of an HTTPRoute.
pub const KIND_HTTP_ROUTE: &str = "HTTPRoute";

/// The kind name of a GRPCRoute.
pub const KIND_GRPC_ROUTE: &str = "GRPCRoute";

/// Shared accessors for every kind of route.
pub trait Route {
    /// The kind of this route, as it would appear in a `RouteGroupKind`.
    fn kind(&self) -> &'static str;

    fn metadata(&self) -> &ObjectMeta;

    /// The Gateways (and optionally listener sections) this route wants to
    /// attach to.
    fn parent_refs(&self) -> &[ParentReference];

    /// Every backend referenced by any rule of this route.
    fn backend_refs(&self) -> Vec<&BackendRef>;

    fn hostnames(&self) -> &[String];

    fn status(&self) -> &RouteStatus;

    fn status_mut(&mut self) -> &mut RouteStatus;
}

/// A route of any supported kind.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteKind {
    Http(HttpRoute),
    Grpc(GrpcRoute),
}

impl RouteKind {
    fn as_route(&self) -> &dyn Route {
        match self {
            RouteKind::Http(r) => r,
            RouteKind::Grpc(r) => r,
        }
    }

    fn as_route_mut(&mut self) -> &mut dyn Route {
        match self {
            RouteKind::Http(r) => r,
            RouteKind::Grpc(r) => r,
        }
    }
}

impl Route for RouteKind {
    fn kind(&self) -> &'static str {
        self.as_route().kind()
    }

    fn metadata(&self) -> &ObjectMeta {
        self.as_route().metadata()
    }

    fn parent_refs(&self) -> &[ParentReference] {
        self.as_route().parent_refs()
    }

    fn backend_refs(&self) -> Vec<&BackendRef> {
        self.as_route().backend_refs()
    }

    fn hostnames(&self) -> &[String] {
        self.as_route().hostnames()
    }

    fn status(&self) -> &RouteStatus {
        self.as_route().status()
    }

    fn status_mut(&mut self) -> &mut RouteStatus {
        self.as_route_mut().status_mut()
    }
}

/// A reference from a route to the Gateway it attaches to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// The namespace of the parent. Defaults to the namespace of the route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub name: String,

    /// The name of a single listener to attach to. When unset, the route
    /// attaches to every listener that allows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// A reference from a route rule to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// The kind of the backend. Defaults to `Service`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// The namespace of the backend. Defaults to the namespace of the route.
    /// Referencing a backend in another namespace requires a ReferenceGrant
    /// in the backend's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// The proportion of traffic sent to this backend relative to the other
    /// backends of the same rule. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl BackendRef {
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(crate::backend::KIND_SERVICE)
    }

    pub fn group(&self) -> &str {
        self.group.as_deref().unwrap_or("")
    }

    pub fn weight(&self) -> u32 {
        self.weight.unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    #[serde(default)]
    pub parents: Vec<RouteParentStatus>,
}

impl RouteStatus {
    /// Get the status for a parent ref, creating it if it doesn't exist.
    pub fn parent_mut(
        &mut self,
        parent_ref: &ParentReference,
        controller_name: &str,
    ) -> &mut RouteParentStatus {
        let idx = match self.parents.iter().position(|p| &p.parent_ref == parent_ref) {
            Some(idx) => idx,
            None => {
                self.parents.push(RouteParentStatus {
                    parent_ref: parent_ref.clone(),
                    controller_name: controller_name.to_string(),
                    conditions: vec![],
                });
                self.parents.len() - 1
            }
        };
        &mut self.parents[idx]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteParentStatus {
    pub parent_ref: ParentReference,
    pub controller_name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// An HTTP route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    pub metadata: ObjectMeta,
    pub spec: HttpRouteSpec,
    #[serde(default)]
    pub status: RouteStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteSpec {
    #[serde(default)]
    pub parent_refs: Vec<ParentReference>,

    /// Hostnames matched against the HTTP Host header. Hostnames may be
    /// prefixed with a single wildcard label, like `*.example.com`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,

    #[serde(default)]
    pub rules: Vec<HttpRouteRule>,
}

/// Matches, filters, and backends for a subset of the traffic on a route.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteRule {
    /// Conditions for matching this rule. Each match is independent: a
    /// request matches the rule if it satisfies any one of them.
    ///
    /// If no matches are specified, the default is a prefix path match on
    /// `/`, which matches every request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<HttpRouteMatch>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<HttpRouteFilter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_refs: Vec<BackendRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<HttpRouteTimeouts>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteTimeouts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_request: Option<Duration>,
}

/// A set of conditions that must all hold for a request to match.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<HttpPathMatch>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HttpHeaderMatch>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_params: Vec<HttpQueryParamMatch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PathMatchType {
    Exact,
    #[default]
    PathPrefix,
    RegularExpression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpPathMatch {
    #[serde(default, rename = "type")]
    pub type_: PathMatchType,
    #[serde(default = "default_path")]
    pub value: String,
}

fn default_path() -> String {
    "/".to_string()
}

impl Default for HttpPathMatch {
    fn default() -> Self {
        Self {
            type_: PathMatchType::PathPrefix,
            value: default_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StringMatchType {
    #[default]
    Exact,
    RegularExpression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeaderMatch {
    #[serde(default, rename = "type")]
    pub type_: StringMatchType,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpQueryParamMatch {
    #[serde(default, rename = "type")]
    pub type_: StringMatchType,
    pub name: String,
    pub value: String,
}

/// Processing applied to requests matching a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum HttpRouteFilter {
    RequestHeaderModifier {
        request_header_modifier: HttpHeaderFilter,
    },
    RequestRedirect {
        request_redirect: HttpRequestRedirectFilter,
    },
    #[serde(rename = "URLRewrite")]
    UrlRewrite { url_rewrite: HttpUrlRewriteFilter },
    #[serde(rename = "CORS")]
    Cors { cors: CorsPolicy },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeaderFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<HttpHeader>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<HttpHeader>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum HttpPathModifier {
    ReplaceFullPath { replace_full_path: String },
    ReplacePrefixMatch { replace_prefix_match: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestRedirectFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<HttpPathModifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpUrlRewriteFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<HttpPathModifier>,
}

impl Route for HttpRoute {
    fn kind(&self) -> &'static str {
        KIND_HTTP_ROUTE
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn parent_refs(&self) -> &[ParentReference] {
        &self.spec.parent_refs
    }

    fn backend_refs(&self) -> Vec<&BackendRef> {
        self.spec
            .rules
            .iter()
            .flat_map(|r| r.backend_refs.iter())
            .collect()
    }

    fn hostnames(&self) -> &[String] {
        &self.spec.hostnames
    }

    fn status(&self) -> &RouteStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut RouteStatus {
        &mut self.status
    }
}

/// A gRPC route. gRPC routes are served as HTTP/2 routes that match on the
/// `/<service>/<method>` request path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcRoute {
    pub metadata: ObjectMeta,
    pub spec: GrpcRouteSpec,
    #[serde(default)]
    pub status: RouteStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcRouteSpec {
    #[serde(default)]
    pub parent_refs: Vec<ParentReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub rules: Vec<GrpcRouteRule>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcRouteRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<GrpcRouteMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_refs: Vec<BackendRef>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcRouteMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<GrpcMethodMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HttpHeaderMatch>,
}

/// Matches a gRPC service and method. A missing method matches every method
/// of the service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcMethodMatch {
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl Route for GrpcRoute {
    fn kind(&self) -> &'static str {
        KIND_GRPC_ROUTE
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn parent_refs(&self) -> &[ParentReference] {
        &self.spec.parent_refs
    }

    fn backend_refs(&self) -> Vec<&BackendRef> {
        self.spec
            .rules
            .iter()
            .flat_map(|r| r.backend_refs.iter())
            .collect()
    }

    fn hostnames(&self) -> &[String] {
        &self.spec.hostnames
    }

    fn status(&self) -> &RouteStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut RouteStatus {
        &mut self.status
    }
}
