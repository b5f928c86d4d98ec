//! Intermediate representations.
//!
//! Translation produces two IRs per logical gateway. [Infra] describes the
//! proxy fleet that needs to exist, and [Xds] describes the traffic behavior
//! that fleet should be configured with. Both are protocol agnostic: they
//! know nothing about Kubernetes objects or Envoy protobufs.
//!
//! IRs are always replaced wholesale. Nothing downstream of the translator
//! ever mutates one in place.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::api::CorsPolicy;
use crate::error::{Error, ErrorContext};
use crate::shared::{Duration, Regex};

/// The infrastructure needed to run a proxy fleet for a logical gateway.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Infra {
    /// The name of the proxy fleet. Also the logical gateway key.
    pub name: String,

    pub labels: BTreeMap<String, String>,

    pub annotations: BTreeMap<String, String>,

    pub ports: Vec<InfraPort>,

    /// Static addresses requested for the fleet's service.
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfraProtocol {
    Http,
    Https,
}

/// A port exposed by the proxy fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraPort {
    pub name: String,
    pub protocol: InfraProtocol,

    /// The port clients connect to.
    pub service_port: u16,

    /// The port the proxy container binds. Well known ports are shifted into
    /// the ephemeral range so the proxy can run unprivileged.
    pub container_port: u16,
}

/// The traffic configuration of a logical gateway.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Xds {
    pub http: Vec<HttpListener>,
}

impl Xds {
    pub fn listener(&self, name: &str) -> Option<&HttpListener> {
        self.http.iter().find(|l| l.name == name)
    }

    pub fn listener_mut(&mut self, name: &str) -> Option<&mut HttpListener> {
        self.http.iter_mut().find(|l| l.name == name)
    }

    /// Check that this IR is structurally valid.
    ///
    /// Validation only covers structure that translation can't express in the
    /// type system: names are unique and non-empty, ports are set, and every
    /// route has exactly one action.
    pub fn validate(&self) -> Result<(), Error> {
        let mut names = BTreeSet::new();
        let mut addrs = BTreeSet::new();

        for (i, listener) in self.http.iter().enumerate() {
            if !names.insert(listener.name.as_str()) {
                return Err(Error::new(format!(
                    "duplicate listener name: {}",
                    listener.name
                )))
                .with_field_index("http", i);
            }

            // listeners with the same address share a filter chain and can't
            // disagree about TLS.
            if !addrs.insert((listener.address.as_str(), listener.port)) {
                return Err(Error::new(format!(
                    "listener address {}:{} is already in use",
                    listener.address, listener.port
                )))
                .with_field_index("http", i);
            }

            listener.validate().with_field_index("http", i)?;
        }

        Ok(())
    }
}

/// A listener that terminates HTTP (or HTTPS) traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpListener {
    /// A unique name, `<gateway-namespace>/<gateway-name>/<listener-name>`.
    pub name: String,

    pub address: String,

    pub port: u16,

    /// Hostnames this listener accepts. `*` matches everything.
    pub hostnames: Vec<String>,

    /// TLS termination, one entry per SNI hostname. A listener with any TLS
    /// config only accepts HTTPS.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<ListenerTls>,

    pub routes: Vec<HttpRoute>,
}

impl HttpListener {
    pub fn is_https(&self) -> bool {
        !self.tls.is_empty()
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::new_static("listener name must not be empty")).with_field("name");
        }
        if self.port == 0 {
            return Err(Error::new_static("listener port must be set")).with_field("port");
        }
        if self.hostnames.is_empty() {
            return Err(Error::new_static("listener must have at least one hostname"))
                .with_field("hostnames");
        }

        let mut server_names = BTreeSet::new();
        for (i, tls) in self.tls.iter().enumerate() {
            if !server_names.insert(tls.hostname.as_str()) {
                return Err(Error::new(format!("duplicate tls hostname: {}", tls.hostname)))
                    .with_field_index("tls", i);
            }
            tls.validate().with_field_index("tls", i)?;
        }

        let mut names = BTreeSet::new();
        for (i, route) in self.routes.iter().enumerate() {
            if !names.insert(route.name.as_str()) {
                return Err(Error::new(format!("duplicate route name: {}", route.name)))
                    .with_field_index("routes", i);
            }
            route.validate().with_field_index("routes", i)?;
        }

        Ok(())
    }
}

/// The certificates served to clients that ask for `hostname` over SNI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerTls {
    /// The SNI hostname. `*` matches any client, including clients that don't
    /// send SNI at all.
    pub hostname: String,
    pub certificates: Vec<TlsCertificate>,
}

impl ListenerTls {
    fn validate(&self) -> Result<(), Error> {
        if self.hostname.is_empty() {
            return Err(Error::new_static("tls hostname must not be empty"))
                .with_field("hostname");
        }
        if self.certificates.is_empty() {
            return Err(Error::new_static("at least one certificate is required"))
                .with_field("certificates");
        }
        for (i, cert) in self.certificates.iter().enumerate() {
            cert.validate().with_field_index("certificates", i)?;
        }
        Ok(())
    }
}

/// A certificate and private key, both PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsCertificate {
    /// A unique name, `<secret-namespace>/<secret-name>`.
    pub name: String,
    pub certificate_chain: String,
    pub private_key: String,
}

impl TlsCertificate {
    fn validate(&self) -> Result<(), Error> {
        if self.certificate_chain.is_empty() {
            return Err(Error::new_static("certificate chain must not be empty"))
                .with_field("certificateChain");
        }
        if self.private_key.is_empty() {
            return Err(Error::new_static("private key must not be empty"))
                .with_field("privateKey");
        }
        Ok(())
    }
}

/// How a request path is matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum PathMatch {
    Exact(String),
    RegularExpression(Regex),
    Prefix(String),
}

impl PathMatch {
    /// The match string as written in the declarative resource.
    pub fn value(&self) -> &str {
        match self {
            PathMatch::Exact(s) | PathMatch::Prefix(s) => s,
            PathMatch::RegularExpression(r) => r.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum StringMatch {
    Exact(String),
    RegularExpression(Regex),
}

/// A match against a named header or query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedMatch {
    pub name: String,
    pub value: StringMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddHeader {
    pub name: String,
    pub value: String,

    /// Append to existing values instead of replacing them.
    pub append: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redirect {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub path: Option<PathRewrite>,
    pub port: Option<u16>,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathRewrite {
    FullPath(String),
    PrefixMatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlRewrite {
    pub hostname: Option<String>,
    pub path: Option<PathRewrite>,
}

/// A fixed response returned without contacting any backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectResponse {
    pub status_code: u32,
}

/// External authorization attached to a route by an API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtAuth {
    /// The `<namespace>/<name>` of the API that attached this policy.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub timeout: Option<Duration>,
    pub fail_open: bool,
    pub headers_to_forward: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retry {
    pub attempts: u32,
    pub per_try_timeout: Option<Duration>,
    pub status_codes: Vec<u32>,
}

/// A single routing rule: a set of matches and what to do with a request
/// that satisfies all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    /// A unique name,
    /// `<kind>/<route-namespace>/<route-name>/rule/<rule-idx>/match/<match-idx>/<hostname>`.
    pub name: String,

    pub hostname: String,

    pub path_match: Option<PathMatch>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_matches: Vec<NamedMatch>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_param_matches: Vec<NamedMatch>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_request_headers: Vec<AddHeader>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_request_headers: Vec<String>,

    pub redirect: Option<Redirect>,

    pub url_rewrite: Option<UrlRewrite>,

    pub direct_response: Option<DirectResponse>,

    pub destination: Option<RouteDestination>,

    pub cors: Option<CorsPolicy>,

    pub ext_auth: Option<ExtAuth>,

    pub timeout: Option<Duration>,

    pub retry: Option<Retry>,
}

impl HttpRoute {
    /// Create a new route with a name and hostname and nothing else set.
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            path_match: None,
            header_matches: vec![],
            query_param_matches: vec![],
            add_request_headers: vec![],
            remove_request_headers: vec![],
            redirect: None,
            url_rewrite: None,
            direct_response: None,
            destination: None,
            cors: None,
            ext_auth: None,
            timeout: None,
            retry: None,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::new_static("route name must not be empty")).with_field("name");
        }
        if self.hostname.is_empty() {
            return Err(Error::new_static("route hostname must not be empty"))
                .with_field("hostname");
        }

        let actions = [
            self.destination.is_some(),
            self.redirect.is_some(),
            self.direct_response.is_some(),
        ];
        if actions.iter().filter(|a| **a).count() != 1 {
            return Err(Error::new_static(
                "route must have exactly one of destination, redirect, or directResponse",
            ));
        }

        if let Some(destination) = &self.destination {
            destination.validate().with_field("destination")?;
        }

        for (i, m) in self.header_matches.iter().enumerate() {
            if m.name.is_empty() {
                return Err(Error::new_static("header name must not be empty"))
                    .with_field_index("headerMatches", i);
            }
        }

        for (i, m) in self.query_param_matches.iter().enumerate() {
            if m.name.is_empty() {
                return Err(Error::new_static("query param name must not be empty"))
                    .with_field_index("queryParamMatches", i);
            }
        }

        Ok(())
    }
}

/// Where matching traffic is sent: one or more weighted backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDestination {
    pub name: String,
    pub settings: Vec<DestinationSetting>,
}

impl RouteDestination {
    fn validate(&self) -> Result<(), Error> {
        if self.settings.is_empty() {
            return Err(Error::new_static("destination must have at least one backend"))
                .with_field("settings");
        }

        for (i, setting) in self.settings.iter().enumerate() {
            setting.validate().with_field_index("settings", i)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AppProtocol {
    #[default]
    Http,
    Http2,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreaker {
    pub max_connections: Option<u32>,
    pub max_pending_requests: Option<u32>,
    pub max_requests: Option<u32>,
    pub max_retries: Option<u32>,
}

/// A single weighted backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSetting {
    pub weight: u32,
    pub endpoints: Vec<DestinationEndpoint>,
    pub protocol: AppProtocol,

    /// Originate TLS to the backend, with an optional SNI override.
    pub tls: Option<UpstreamTls>,

    pub circuit_breaker: Option<CircuitBreaker>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamTls {
    pub sni: Option<String>,
}

impl DestinationSetting {
    /// The name of the cluster that serves this backend.
    ///
    /// Names are derived from the sorted set of endpoints, each rendered as
    /// `host_port`, so the same backend referenced from different routes
    /// always maps to the same cluster.
    pub fn cluster_name(&self) -> String {
        let endpoints: BTreeSet<_> = self.endpoints.iter().collect();
        let parts: Vec<_> = endpoints
            .into_iter()
            .map(|e| format!("{}_{}", e.host, e.port))
            .collect();
        parts.join("-")
    }

    fn validate(&self) -> Result<(), Error> {
        if self.endpoints.is_empty() {
            return Err(Error::new_static("backend must have at least one endpoint"))
                .with_field("endpoints");
        }
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.host.is_empty() || endpoint.port == 0 {
                return Err(Error::new(format!(
                    "invalid endpoint address: {}:{}",
                    endpoint.host, endpoint.port
                )))
                .with_field_index("endpoints", i);
            }
        }
        Ok(())
    }
}
