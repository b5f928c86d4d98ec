//! Compile XDS IR into Envoy resources.
//!
//! Every resource is named after the IR element it came from, so compiling
//! the same IR twice produces the same table. Compilation is best effort: a
//! route that can't be expressed is left out of its route table and reported,
//! and everything else is still compiled.

use std::collections::BTreeMap;
use std::net::IpAddr;

use gantry_api::api::CorsPolicy;
use gantry_api::ir;
use gantry_api::shared::Duration;
use xds_api::pb::envoy::config::{
    cluster::v3 as xds_cluster, core::v3 as xds_core, endpoint::v3 as xds_endpoint,
    listener::v3 as xds_listener, route::v3 as xds_route,
};
use xds_api::pb::envoy::extensions::filters::http::{
    cors::v3 as xds_cors, ext_authz::v3 as xds_ext_authz, router::v3::Router,
};
use xds_api::pb::envoy::extensions::filters::network::http_connection_manager::v3 as xds_http;
use xds_api::pb::envoy::extensions::transport_sockets::tls::v3 as xds_tls;
use xds_api::pb::envoy::extensions::upstreams::http::v3 as xds_upstream_http;
use xds_api::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, ListStringMatcher, RegexMatchAndSubstitute, RegexMatcher,
    StringMatcher,
};
use xds_api::pb::google::protobuf;

use crate::xds::{ResourceType, ResourceVersionTable};
use crate::Error;

const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
const ROUTER_FILTER: &str = "envoy.filters.http.router";
const CORS_FILTER: &str = "envoy.filters.http.cors";
const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";
const HTTP_PROTOCOL_OPTIONS: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

/// The typed filter metadata key ext-auth config is attached to routes under.
pub const EXT_AUTHZ_METADATA: &str = "gantry.ext_authz";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The output of compiling a single XDS IR.
#[derive(Debug, Default)]
pub struct CompileResult {
    pub table: ResourceVersionTable,

    /// Everything that was left out of the table.
    pub errors: Vec<Error>,
}

impl CompileResult {
    /// Returns `true` if any part of the IR failed to compile. The table is
    /// still usable, but it's missing whatever failed.
    pub fn validation_failed(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Compile an XDS IR into a resource table.
pub fn compile(xds: &ir::Xds) -> CompileResult {
    let mut result = CompileResult::default();

    for listener in &xds.http {
        compile_listener(listener, &mut result);
    }

    result
}

fn compile_listener(listener: &ir::HttpListener, result: &mut CompileResult) {
    let table = &mut result.table;

    for cert in listener.tls.iter().flat_map(|t| t.certificates.iter()) {
        table.insert(ResourceType::Secret, &cert.name, &secret(cert));
    }

    let mut routes: BTreeMap<&str, Vec<xds_route::Route>> = BTreeMap::new();
    for route in &listener.routes {
        let compiled = match compile_route(route) {
            Ok(compiled) => compiled,
            Err(e) => {
                result.errors.push(e);
                continue;
            }
        };
        routes.entry(&route.hostname).or_default().push(compiled);

        for setting in route.destination.iter().flat_map(|d| d.settings.iter()) {
            add_cluster(table, &setting.cluster_name(), setting);
        }
        if let Some(ext_auth) = &route.ext_auth {
            add_cluster(table, &ext_auth_cluster_name(ext_auth), &ext_auth_setting(ext_auth));
        }
    }

    let virtual_hosts = routes
        .into_iter()
        .map(|(hostname, routes)| xds_route::VirtualHost {
            name: format!("{}/{}", listener.name, hostname),
            domains: vec![hostname.to_string()],
            routes,
            ..Default::default()
        })
        .collect();

    let route_config = xds_route::RouteConfiguration {
        name: listener.name.clone(),
        virtual_hosts,
        ..Default::default()
    };
    table.insert(ResourceType::RouteConfiguration, &listener.name, &route_config);

    let has_cors = listener.routes.iter().any(|r| r.cors.is_some());
    table.insert(ResourceType::Listener, &listener.name, &envoy_listener(listener, has_cors));
}

fn envoy_listener(listener: &ir::HttpListener, cors: bool) -> xds_listener::Listener {
    use xds_http::{http_connection_manager::RouteSpecifier, http_filter::ConfigType, Rds};

    let mut http_filters = vec![];
    if cors {
        http_filters.push(xds_http::HttpFilter {
            name: CORS_FILTER.to_string(),
            config_type: Some(ConfigType::TypedConfig(to_any(&xds_cors::Cors::default()))),
            ..Default::default()
        });
    }
    http_filters.push(xds_http::HttpFilter {
        name: ROUTER_FILTER.to_string(),
        config_type: Some(ConfigType::TypedConfig(to_any(&Router::default()))),
        ..Default::default()
    });

    let http_connection_manager = xds_http::HttpConnectionManager {
        stat_prefix: listener.name.clone(),
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            config_source: Some(ads_config_source()),
            route_config_name: listener.name.clone(),
        })),
        http_filters,
        ..Default::default()
    };

    let filters = vec![xds_listener::Filter {
        name: HTTP_CONNECTION_MANAGER.to_string(),
        config_type: Some(xds_listener::filter::ConfigType::TypedConfig(to_any(
            &http_connection_manager,
        ))),
        ..Default::default()
    }];

    // HTTPS listeners get a filter chain per SNI hostname. every chain routes
    // through the same route table.
    let filter_chains = match listener.is_https() {
        true => listener
            .tls
            .iter()
            .map(|tls| xds_listener::FilterChain {
                filter_chain_match: server_names(&tls.hostname),
                filters: filters.clone(),
                transport_socket: Some(downstream_tls(tls)),
                ..Default::default()
            })
            .collect(),
        false => vec![xds_listener::FilterChain {
            filters,
            ..Default::default()
        }],
    };

    xds_listener::Listener {
        name: listener.name.clone(),
        address: Some(socket_address(&listener.address, listener.port)),
        filter_chains,
        ..Default::default()
    }
}

// a wildcard chain has no match at all so it also catches clients that don't
// send SNI.
fn server_names(hostname: &str) -> Option<xds_listener::FilterChainMatch> {
    (hostname != "*").then(|| xds_listener::FilterChainMatch {
        server_names: vec![hostname.to_string()],
        ..Default::default()
    })
}

fn downstream_tls(tls: &ir::ListenerTls) -> xds_core::TransportSocket {
    let tls_context = xds_tls::DownstreamTlsContext {
        common_tls_context: Some(xds_tls::CommonTlsContext {
            tls_certificate_sds_secret_configs: tls
                .certificates
                .iter()
                .map(|cert| xds_tls::SdsSecretConfig {
                    name: cert.name.clone(),
                    sds_config: Some(ads_config_source()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        ..Default::default()
    };
    tls_transport_socket(to_any(&tls_context))
}

fn secret(cert: &ir::TlsCertificate) -> xds_tls::Secret {
    let inline = |s: &str| xds_core::DataSource {
        specifier: Some(xds_core::data_source::Specifier::InlineString(s.to_string())),
        ..Default::default()
    };

    xds_tls::Secret {
        name: cert.name.clone(),
        r#type: Some(xds_tls::secret::Type::TlsCertificate(xds_tls::TlsCertificate {
            certificate_chain: Some(inline(&cert.certificate_chain)),
            private_key: Some(inline(&cert.private_key)),
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn compile_route(route: &ir::HttpRoute) -> Result<xds_route::Route, Error> {
    let compile_err = |reason: String| Error::Compile {
        name: route.name.clone(),
        reason,
    };

    let action = match (&route.redirect, &route.direct_response, &route.destination) {
        (Some(redirect), _, _) => {
            xds_route::route::Action::Redirect(redirect_action(redirect).map_err(compile_err)?)
        }
        (_, Some(direct), _) => {
            if !(200..600).contains(&direct.status_code) {
                return Err(compile_err(format!("invalid status code {}", direct.status_code)));
            }
            xds_route::route::Action::DirectResponse(xds_route::DirectResponseAction {
                status: direct.status_code,
                ..Default::default()
            })
        }
        (_, _, Some(destination)) => {
            xds_route::route::Action::Route(route_action(route, destination))
        }
        (None, None, None) => return Err(compile_err("route has no action".to_string())),
    };

    let request_headers_to_add = route
        .add_request_headers
        .iter()
        .map(|h| {
            use xds_core::header_value_option::HeaderAppendAction;
            let append_action = match h.append {
                true => HeaderAppendAction::AppendIfExistsOrAdd,
                false => HeaderAppendAction::OverwriteIfExistsOrAdd,
            };
            xds_core::HeaderValueOption {
                header: Some(xds_core::HeaderValue {
                    key: h.name.clone(),
                    value: h.value.clone(),
                    ..Default::default()
                }),
                append_action: append_action.into(),
                ..Default::default()
            }
        })
        .collect();

    let mut typed_per_filter_config = std::collections::HashMap::new();
    if let Some(cors) = &route.cors {
        typed_per_filter_config.insert(CORS_FILTER.to_string(), to_any(&cors_policy(cors)));
    }

    let metadata = route.ext_auth.as_ref().map(|ext_auth| xds_core::Metadata {
        typed_filter_metadata: [(
            EXT_AUTHZ_METADATA.to_string(),
            to_any(&ext_authz(ext_auth)),
        )]
        .into(),
        ..Default::default()
    });

    Ok(xds_route::Route {
        name: route.name.clone(),
        r#match: Some(route_match(route)),
        action: Some(action),
        request_headers_to_add,
        request_headers_to_remove: route.remove_request_headers.clone(),
        typed_per_filter_config,
        metadata,
        ..Default::default()
    })
}

fn route_match(route: &ir::HttpRoute) -> xds_route::RouteMatch {
    use xds_route::route_match::PathSpecifier;

    let path_specifier = match &route.path_match {
        Some(ir::PathMatch::Exact(p)) => PathSpecifier::Path(p.clone()),
        Some(ir::PathMatch::Prefix(p)) => PathSpecifier::Prefix(p.clone()),
        Some(ir::PathMatch::RegularExpression(r)) => {
            PathSpecifier::SafeRegex(regex_matcher(r.as_str()))
        }
        None => PathSpecifier::Prefix("/".to_string()),
    };

    let headers = route
        .header_matches
        .iter()
        .map(|m| {
            use xds_route::header_matcher::HeaderMatchSpecifier;
            let specifier = match &m.value {
                ir::StringMatch::Exact(v) => HeaderMatchSpecifier::ExactMatch(v.clone()),
                ir::StringMatch::RegularExpression(r) => {
                    HeaderMatchSpecifier::SafeRegexMatch(regex_matcher(r.as_str()))
                }
            };
            xds_route::HeaderMatcher {
                name: m.name.clone(),
                header_match_specifier: Some(specifier),
                ..Default::default()
            }
        })
        .collect();

    let query_parameters = route
        .query_param_matches
        .iter()
        .map(|m| {
            use xds_route::query_parameter_matcher::QueryParameterMatchSpecifier;
            xds_route::QueryParameterMatcher {
                name: m.name.clone(),
                query_parameter_match_specifier: Some(QueryParameterMatchSpecifier::StringMatch(
                    string_matcher(&m.value),
                )),
            }
        })
        .collect();

    xds_route::RouteMatch {
        path_specifier: Some(path_specifier),
        headers,
        query_parameters,
        ..Default::default()
    }
}

fn route_action(
    route: &ir::HttpRoute,
    destination: &ir::RouteDestination,
) -> xds_route::RouteAction {
    use xds_route::route_action::{ClusterSpecifier, HostRewriteSpecifier};

    // the same backend can show up more than once in a destination. envoy
    // wants every weighted cluster name to be unique.
    let mut clusters: Vec<(String, u32)> = vec![];
    for setting in &destination.settings {
        let name = setting.cluster_name();
        match clusters.iter_mut().find(|(n, _)| *n == name) {
            Some((_, weight)) => *weight += setting.weight,
            None => clusters.push((name, setting.weight)),
        }
    }

    let cluster_specifier = match clusters.as_slice() {
        [(name, _)] => ClusterSpecifier::Cluster(name.clone()),
        clusters => ClusterSpecifier::WeightedClusters(xds_route::WeightedCluster {
            clusters: clusters
                .iter()
                .map(|(name, weight)| xds_route::weighted_cluster::ClusterWeight {
                    name: name.clone(),
                    weight: Some((*weight).into()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
    };

    let mut action = xds_route::RouteAction {
        cluster_specifier: Some(cluster_specifier),
        timeout: route.timeout.map(duration),
        retry_policy: route.retry.as_ref().map(retry_policy),
        ..Default::default()
    };

    if let Some(rewrite) = &route.url_rewrite {
        if let Some(hostname) = &rewrite.hostname {
            action.host_rewrite_specifier =
                Some(HostRewriteSpecifier::HostRewriteLiteral(hostname.clone()));
        }
        match &rewrite.path {
            Some(ir::PathRewrite::PrefixMatch(prefix)) => action.prefix_rewrite = prefix.clone(),
            Some(ir::PathRewrite::FullPath(path)) => {
                action.regex_rewrite = Some(RegexMatchAndSubstitute {
                    pattern: Some(regex_matcher("^/.*$")),
                    substitution: path.clone(),
                })
            }
            None => (),
        }
    }

    action
}

fn redirect_action(redirect: &ir::Redirect) -> Result<xds_route::RedirectAction, String> {
    use xds_route::redirect_action::{
        PathRewriteSpecifier, RedirectResponseCode, SchemeRewriteSpecifier,
    };

    let response_code = match redirect.status_code.unwrap_or(302) {
        301 => RedirectResponseCode::MovedPermanently,
        302 => RedirectResponseCode::Found,
        303 => RedirectResponseCode::SeeOther,
        307 => RedirectResponseCode::TemporaryRedirect,
        308 => RedirectResponseCode::PermanentRedirect,
        code => return Err(format!("unsupported redirect status code {code}")),
    };

    let path_rewrite_specifier = redirect.path.as_ref().map(|p| match p {
        ir::PathRewrite::FullPath(path) => PathRewriteSpecifier::PathRedirect(path.clone()),
        ir::PathRewrite::PrefixMatch(prefix) => PathRewriteSpecifier::PrefixRewrite(prefix.clone()),
    });

    Ok(xds_route::RedirectAction {
        scheme_rewrite_specifier: redirect
            .scheme
            .clone()
            .map(SchemeRewriteSpecifier::SchemeRedirect),
        host_redirect: redirect.hostname.clone().unwrap_or_default(),
        port_redirect: redirect.port.map(u32::from).unwrap_or_default(),
        path_rewrite_specifier,
        response_code: response_code.into(),
        ..Default::default()
    })
}

fn retry_policy(retry: &ir::Retry) -> xds_route::RetryPolicy {
    let mut retry_on = "connect-failure,refused-stream,reset".to_string();
    if !retry.status_codes.is_empty() {
        retry_on.push_str(",retriable-status-codes");
    }

    xds_route::RetryPolicy {
        retry_on,
        num_retries: Some(retry.attempts.into()),
        per_try_timeout: retry.per_try_timeout.map(duration),
        retriable_status_codes: retry.status_codes.clone(),
        ..Default::default()
    }
}

fn cors_policy(cors: &CorsPolicy) -> xds_cors::CorsPolicy {
    let allow_origin_string_match = cors
        .allow_origins
        .iter()
        .map(|origin| match origin.as_str() {
            "*" => StringMatcher {
                match_pattern: Some(MatchPattern::SafeRegex(regex_matcher(".*"))),
                ignore_case: false,
            },
            origin => StringMatcher {
                match_pattern: Some(MatchPattern::Exact(origin.to_string())),
                ignore_case: false,
            },
        })
        .collect();

    xds_cors::CorsPolicy {
        allow_origin_string_match,
        allow_methods: cors.allow_methods.join(","),
        allow_headers: cors.allow_headers.join(","),
        expose_headers: cors.expose_headers.join(","),
        max_age: cors
            .max_age
            .map(|d| d.as_secs().to_string())
            .unwrap_or_default(),
        allow_credentials: Some(cors.allow_credentials.into()),
        ..Default::default()
    }
}

fn ext_auth_cluster_name(ext_auth: &ir::ExtAuth) -> String {
    ext_auth_setting(ext_auth).cluster_name()
}

// ext-auth services are called over gRPC, and get a cluster just like any
// other backend.
fn ext_auth_setting(ext_auth: &ir::ExtAuth) -> ir::DestinationSetting {
    ir::DestinationSetting {
        weight: 1,
        endpoints: vec![ir::DestinationEndpoint {
            host: ext_auth.host.clone(),
            port: ext_auth.port,
        }],
        protocol: ir::AppProtocol::Http2,
        tls: None,
        circuit_breaker: None,
    }
}

fn ext_authz(ext_auth: &ir::ExtAuth) -> xds_ext_authz::ExtAuthz {
    use xds_core::grpc_service::{EnvoyGrpc, TargetSpecifier};

    let grpc_service = xds_core::GrpcService {
        target_specifier: Some(TargetSpecifier::EnvoyGrpc(EnvoyGrpc {
            cluster_name: ext_auth_cluster_name(ext_auth),
            ..Default::default()
        })),
        timeout: ext_auth.timeout.map(duration),
        ..Default::default()
    };

    let allowed_headers = (!ext_auth.headers_to_forward.is_empty()).then(|| ListStringMatcher {
        patterns: ext_auth
            .headers_to_forward
            .iter()
            .map(|h| StringMatcher {
                match_pattern: Some(MatchPattern::Exact(h.clone())),
                ignore_case: true,
            })
            .collect(),
    });

    xds_ext_authz::ExtAuthz {
        services: Some(xds_ext_authz::ext_authz::Services::GrpcService(grpc_service)),
        failure_mode_allow: ext_auth.fail_open,
        allowed_headers,
        ..Default::default()
    }
}

fn add_cluster(table: &mut ResourceVersionTable, name: &str, setting: &ir::DestinationSetting) {
    if table.contains(ResourceType::Cluster, name) {
        return;
    }

    let load_assignment = xds_endpoint::ClusterLoadAssignment {
        cluster_name: name.to_string(),
        endpoints: vec![xds_endpoint::LocalityLbEndpoints {
            lb_endpoints: setting.endpoints.iter().map(lb_endpoint).collect(),
            ..Default::default()
        }],
        ..Default::default()
    };

    // envoy can only resolve hostnames with a DNS cluster. addresses that are
    // already IPs go through EDS.
    let eds = setting.endpoints.iter().all(|e| e.host.parse::<IpAddr>().is_ok());

    let mut cluster = xds_cluster::Cluster {
        name: name.to_string(),
        connect_timeout: Some(duration(CONNECT_TIMEOUT)),
        ..Default::default()
    };

    if eds {
        use xds_cluster::cluster::{ClusterDiscoveryType, DiscoveryType, EdsClusterConfig};
        cluster.cluster_discovery_type =
            Some(ClusterDiscoveryType::Type(DiscoveryType::Eds.into()));
        cluster.eds_cluster_config = Some(EdsClusterConfig {
            eds_config: Some(ads_config_source()),
            service_name: name.to_string(),
            ..Default::default()
        });
        table.insert(ResourceType::ClusterLoadAssignment, name, &load_assignment);
    } else {
        use xds_cluster::cluster::{ClusterDiscoveryType, DiscoveryType};
        cluster.cluster_discovery_type =
            Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns.into()));
        cluster.load_assignment = Some(load_assignment);
    }

    if setting.protocol == ir::AppProtocol::Http2 {
        cluster.typed_extension_protocol_options =
            [(HTTP_PROTOCOL_OPTIONS.to_string(), to_any(&http2_protocol_options()))].into();
    }

    if let Some(tls) = &setting.tls {
        let sni = tls
            .sni
            .clone()
            .or_else(|| setting.endpoints.first().map(|e| e.host.clone()))
            .unwrap_or_default();
        let tls_context = xds_tls::UpstreamTlsContext {
            sni,
            ..Default::default()
        };
        cluster.transport_socket = Some(tls_transport_socket(to_any(&tls_context)));
    }

    if let Some(cb) = &setting.circuit_breaker {
        cluster.circuit_breakers = Some(xds_cluster::CircuitBreakers {
            thresholds: vec![xds_cluster::circuit_breakers::Thresholds {
                max_connections: cb.max_connections.map(Into::into),
                max_pending_requests: cb.max_pending_requests.map(Into::into),
                max_requests: cb.max_requests.map(Into::into),
                max_retries: cb.max_retries.map(Into::into),
                ..Default::default()
            }],
            ..Default::default()
        });
    }

    table.insert(ResourceType::Cluster, name, &cluster);
}

fn http2_protocol_options() -> xds_upstream_http::HttpProtocolOptions {
    use xds_upstream_http::http_protocol_options::{
        explicit_http_config::ProtocolConfig, ExplicitHttpConfig, UpstreamProtocolOptions,
    };

    xds_upstream_http::HttpProtocolOptions {
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig {
                protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(Default::default())),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

fn lb_endpoint(endpoint: &ir::DestinationEndpoint) -> xds_endpoint::LbEndpoint {
    xds_endpoint::LbEndpoint {
        host_identifier: Some(xds_endpoint::lb_endpoint::HostIdentifier::Endpoint(
            xds_endpoint::Endpoint {
                address: Some(socket_address(&endpoint.host, endpoint.port)),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

fn socket_address(address: &str, port: u16) -> xds_core::Address {
    xds_core::Address {
        address: Some(xds_core::address::Address::SocketAddress(xds_core::SocketAddress {
            address: address.to_string(),
            port_specifier: Some(xds_core::socket_address::PortSpecifier::PortValue(port.into())),
            ..Default::default()
        })),
    }
}

fn tls_transport_socket(typed_config: protobuf::Any) -> xds_core::TransportSocket {
    xds_core::TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(xds_core::transport_socket::ConfigType::TypedConfig(typed_config)),
        ..Default::default()
    }
}

pub(crate) fn ads_config_source() -> xds_core::ConfigSource {
    xds_core::ConfigSource {
        config_source_specifier: Some(xds_core::config_source::ConfigSourceSpecifier::Ads(
            xds_core::AggregatedConfigSource {},
        )),
        resource_api_version: xds_core::ApiVersion::V3 as i32,
        ..Default::default()
    }
}

fn regex_matcher(regex: &str) -> RegexMatcher {
    RegexMatcher {
        regex: regex.to_string(),
        engine_type: None,
    }
}

fn string_matcher(m: &ir::StringMatch) -> StringMatcher {
    let match_pattern = match m {
        ir::StringMatch::Exact(v) => MatchPattern::Exact(v.clone()),
        ir::StringMatch::RegularExpression(r) => MatchPattern::SafeRegex(regex_matcher(r.as_str())),
    };
    StringMatcher {
        match_pattern: Some(match_pattern),
        ignore_case: false,
    }
}

fn duration(d: Duration) -> protobuf::Duration {
    protobuf::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

fn to_any<M: prost::Name>(m: &M) -> protobuf::Any {
    protobuf::Any::from_msg(m).expect("generated invalid xds")
}
