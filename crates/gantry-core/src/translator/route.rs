use std::str::FromStr;

use gantry_api::backend::{
    BackendProtocol, GANTRY_GROUP, GATEWAY_GROUP, KIND_BACKEND, KIND_GATEWAY, KIND_SERVICE,
};
use gantry_api::ir;
use gantry_api::route::{
    BackendRef, GrpcRoute, HttpHeaderMatch, HttpPathModifier, HttpRoute, HttpRouteFilter,
    HttpRouteMatch, ParentReference, PathMatchType, Route, RouteKind, StringMatchType,
};
use gantry_api::shared::Regex;
use gantry_api::status::{condition_type, reason, set_condition, Condition, ConditionStatus};
use gantry_api::Resources;

use super::context::GatewayContext;
use super::{reference_granted, ObjectRef, Translator, XdsIrMap};

/// The prefix every IR route generated from a route shares. API objects use
/// this to find the IR routes that belong to them.
pub(crate) fn ir_route_prefix(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}/{namespace}/{name}/", kind.to_lowercase())
}

/// A problem resolving part of a route. Problems degrade the route instead of
/// rejecting it.
#[derive(Debug, Clone, PartialEq)]
struct Degraded {
    condition_type: &'static str,
    reason: &'static str,
    message: String,
}

impl Degraded {
    fn resolved_refs(reason: &'static str, message: String) -> Self {
        Self {
            condition_type: condition_type::RESOLVED_REFS,
            reason,
            message,
        }
    }

    fn invalid(message: String) -> Self {
        Self {
            condition_type: condition_type::ACCEPTED,
            reason: reason::INVALID,
            message,
        }
    }
}

/// An IR route that hasn't been assigned a hostname yet.
struct RouteTemplate {
    // the name of the route, without a hostname suffix
    name: String,
    route: ir::HttpRoute,
}

impl Translator {
    /// Attach every route in the graph to the listeners it targets.
    ///
    /// Returns the routes that referenced at least one in-scope Gateway, with
    /// their statuses updated. Routes that only reference Gateways this
    /// translator doesn't own are not returned, so their statuses are left
    /// alone.
    pub(super) fn process_routes(
        &self,
        resources: &Resources,
        gateways: &mut [GatewayContext],
        xds_ir: &mut XdsIrMap,
    ) -> Vec<RouteKind> {
        let routes = resources
            .http_routes
            .iter()
            .cloned()
            .map(RouteKind::Http)
            .chain(resources.grpc_routes.iter().cloned().map(RouteKind::Grpc));

        let mut processed = vec![];
        for mut route in routes {
            if self.process_route(&mut route, resources, gateways, xds_ir) {
                processed.push(route);
            }
        }

        processed
    }

    fn process_route(
        &self,
        route: &mut RouteKind,
        resources: &Resources,
        gateways: &mut [GatewayContext],
        xds_ir: &mut XdsIrMap,
    ) -> bool {
        // statuses are rebuilt on every pass. keep whatever other controllers
        // have written.
        route
            .status_mut()
            .parents
            .retain(|p| p.controller_name != self.controller_name);

        let (templates, degraded) = match &*route {
            RouteKind::Http(r) => http_route_templates(r, resources),
            RouteKind::Grpc(r) => grpc_route_templates(r, resources),
        };

        let mut relevant = false;
        let generation = route.metadata().generation;
        let parent_refs = route.parent_refs().to_vec();
        for parent_ref in &parent_refs {
            let Some(gateway) = find_parent(route, parent_ref, gateways) else {
                continue;
            };
            relevant = true;

            let accepted =
                attach_to_gateway(route, parent_ref, gateway, resources, &templates, xds_ir);
            let parent_status = route.status_mut().parent_mut(parent_ref, &self.controller_name);

            let accepted = match accepted {
                Ok(()) => match degraded
                    .iter()
                    .find(|d| d.condition_type == condition_type::ACCEPTED)
                {
                    Some(d) => Err((d.reason, d.message.clone())),
                    None => Ok(()),
                },
                Err(e) => Err(e),
            };

            let condition = match accepted {
                Ok(()) => Condition::new(
                    condition_type::ACCEPTED,
                    true,
                    reason::ACCEPTED,
                    "Route is accepted",
                    generation,
                ),
                Err((why, message)) => {
                    Condition::new(condition_type::ACCEPTED, false, why, message, generation)
                }
            };
            set_condition(&mut parent_status.conditions, condition);

            let resolved = degraded
                .iter()
                .find(|d| d.condition_type == condition_type::RESOLVED_REFS);
            let condition = match resolved {
                Some(d) => Condition::new(
                    condition_type::RESOLVED_REFS,
                    ConditionStatus::False,
                    d.reason,
                    d.message.clone(),
                    generation,
                ),
                None => Condition::new(
                    condition_type::RESOLVED_REFS,
                    true,
                    reason::RESOLVED_REFS,
                    "Resolved all the Object references for the Route",
                    generation,
                ),
            };
            set_condition(&mut parent_status.conditions, condition);
        }

        relevant
    }
}

/// Find the in-scope Gateway a parent ref points at.
fn find_parent<'a>(
    route: &RouteKind,
    parent_ref: &ParentReference,
    gateways: &'a mut [GatewayContext],
) -> Option<&'a mut GatewayContext> {
    let group = parent_ref.group.as_deref().unwrap_or(GATEWAY_GROUP);
    let kind = parent_ref.kind.as_deref().unwrap_or(KIND_GATEWAY);
    if group != GATEWAY_GROUP || kind != KIND_GATEWAY {
        return None;
    }

    let namespace = parent_ref
        .namespace
        .as_deref()
        .unwrap_or(&route.metadata().namespace);

    gateways
        .iter_mut()
        .find(|g| g.namespace() == namespace && g.name() == parent_ref.name)
}

/// Attach a route to every matching listener of a Gateway, adding IR routes
/// to the Gateway's IR. Returns the reason the route wasn't accepted if it
/// couldn't attach to any listener.
fn attach_to_gateway(
    route: &RouteKind,
    parent_ref: &ParentReference,
    gateway: &mut GatewayContext,
    resources: &Resources,
    templates: &[RouteTemplate],
    xds_ir: &mut XdsIrMap,
) -> Result<(), (&'static str, String)> {
    let candidates: Vec<usize> = match &parent_ref.section_name {
        Some(section) => match gateway.listener_index(section) {
            Some(idx) => vec![idx],
            None => {
                return Err((
                    reason::NO_MATCHING_PARENT,
                    format!("no listener named {section}"),
                ))
            }
        },
        None => (0..gateway.listeners().len()).collect(),
    };

    let candidates: Vec<usize> = candidates
        .into_iter()
        .filter(|&idx| parent_ref.port.map_or(true, |p| gateway.listeners()[idx].port == p))
        .collect();
    if candidates.is_empty() {
        return Err((
            reason::NO_MATCHING_PARENT,
            "no listener matches the parentRef".to_string(),
        ));
    }

    let route_namespace = &route.metadata().namespace;
    let namespace = resources.get_namespace(route_namespace);

    let allowed: Vec<usize> = candidates
        .into_iter()
        .filter(|&idx| {
            gateway.is_ready(idx)
                && gateway.allows_kind(idx, route.kind())
                && gateway.allows_namespace(idx, route_namespace, namespace)
        })
        .collect();
    if allowed.is_empty() {
        return Err((
            reason::NOT_ALLOWED_BY_LISTENERS,
            "no ready listener allows this route".to_string(),
        ));
    }

    let mut attached = false;
    for idx in allowed {
        let hosts = compute_hosts(route.hostnames(), gateway.listeners()[idx].hostname.as_deref());
        if hosts.is_empty() {
            continue;
        }

        attached = true;
        gateway.increment_attached_routes(idx);

        let Some(listener_name) = gateway.ir_listener(idx).map(str::to_string) else {
            continue;
        };
        let Some(listener) = xds_ir
            .get_mut(&gateway.ir_key)
            .and_then(|xds| xds.listener_mut(&listener_name))
        else {
            continue;
        };

        for host in &hosts {
            for template in templates {
                let name = format!("{}/{}", template.name, host);
                // merged gateways can send the same route to one listener
                // twice. the first one wins.
                if listener.routes.iter().any(|r| r.name == name) {
                    continue;
                }

                let mut ir_route = template.route.clone();
                ir_route.name = name;
                ir_route.hostname = host.clone();
                if let Some(destination) = &mut ir_route.destination {
                    destination.name = ir_route.name.clone();
                }
                listener.routes.push(ir_route);
            }
        }
    }

    if !attached {
        return Err((
            reason::NO_MATCHING_LISTENER_HOSTNAME,
            "no listener hostname matches the route's hostnames".to_string(),
        ));
    }

    Ok(())
}

/// Intersect a route's hostnames with a listener's hostname.
///
/// When one side is a wildcard, the more specific hostname wins. A route
/// without hostnames inherits the listener's, and a listener without a
/// hostname accepts everything.
pub(crate) fn compute_hosts(
    route_hostnames: &[String],
    listener_hostname: Option<&str>,
) -> Vec<String> {
    let listener_hostname = listener_hostname.unwrap_or("");

    if route_hostnames.is_empty() {
        return match listener_hostname {
            "" => vec!["*".to_string()],
            h => vec![h.to_string()],
        };
    }

    let mut hosts = vec![];
    for route_hostname in route_hostnames {
        let host = if listener_hostname.is_empty() || listener_hostname == route_hostname {
            Some(route_hostname.as_str())
        } else if listener_hostname.starts_with('*') {
            wildcard_matches(route_hostname, listener_hostname).then_some(route_hostname.as_str())
        } else if route_hostname.starts_with('*') {
            wildcard_matches(listener_hostname, route_hostname).then_some(listener_hostname)
        } else {
            None
        };

        if let Some(host) = host {
            if !hosts.iter().any(|h| h == host) {
                hosts.push(host.to_string());
            }
        }
    }
    hosts
}

// a wildcard matches at least one label: *.example.com matches
// foo.example.com and foo.bar.example.com but not example.com.
fn wildcard_matches(hostname: &str, wildcard: &str) -> bool {
    let suffix = wildcard.trim_start_matches('*');
    hostname
        .strip_suffix(suffix)
        .is_some_and(|label| !label.is_empty())
}

fn http_route_templates(
    route: &HttpRoute,
    resources: &Resources,
) -> (Vec<RouteTemplate>, Vec<Degraded>) {
    let namespace = &route.metadata.namespace;
    let prefix = ir_route_prefix(route.kind(), namespace, &route.metadata.name);

    let mut templates = vec![];
    let mut degraded = vec![];

    for (rule_idx, rule) in route.spec.rules.iter().enumerate() {
        let mut base = ir::HttpRoute::new("", "");
        for filter in &rule.filters {
            apply_filter(&mut base, filter);
        }
        base.timeout = rule.timeouts.as_ref().and_then(|t| t.request);

        if base.redirect.is_none() {
            let backends = resolve_backends(route, &rule.backend_refs, resources, &mut degraded);
            base.retry = backends.retry;
            set_destination(&mut base, backends.settings);
        }

        let default_match = [HttpRouteMatch::default()];
        let matches = match rule.matches.is_empty() {
            true => &default_match[..],
            false => &rule.matches[..],
        };

        for (match_idx, route_match) in matches.iter().enumerate() {
            let mut ir_route = base.clone();
            if let Err(message) = apply_match(&mut ir_route, route_match) {
                degraded.push(Degraded::invalid(message));
                continue;
            }
            templates.push(RouteTemplate {
                name: format!("{prefix}rule/{rule_idx}/match/{match_idx}"),
                route: ir_route,
            });
        }
    }

    (templates, degraded)
}

fn grpc_route_templates(
    route: &GrpcRoute,
    resources: &Resources,
) -> (Vec<RouteTemplate>, Vec<Degraded>) {
    let prefix = ir_route_prefix(route.kind(), &route.metadata.namespace, &route.metadata.name);

    let mut templates = vec![];
    let mut degraded = vec![];

    for (rule_idx, rule) in route.spec.rules.iter().enumerate() {
        let mut base = ir::HttpRoute::new("", "");
        let mut backends = resolve_backends(route, &rule.backend_refs, resources, &mut degraded);
        for setting in &mut backends.settings {
            setting.protocol = ir::AppProtocol::Http2;
        }
        base.retry = backends.retry;
        set_destination(&mut base, backends.settings);

        if rule.matches.is_empty() {
            base.path_match = Some(ir::PathMatch::Prefix("/".to_string()));
            templates.push(RouteTemplate {
                name: format!("{prefix}rule/{rule_idx}/match/0"),
                route: base,
            });
            continue;
        }

        for (match_idx, grpc_match) in rule.matches.iter().enumerate() {
            let mut ir_route = base.clone();
            ir_route.path_match = Some(match &grpc_match.method {
                Some(m) => match &m.method {
                    Some(method) => ir::PathMatch::Exact(format!("/{}/{}", m.service, method)),
                    None => ir::PathMatch::Prefix(format!("/{}/", m.service)),
                },
                None => ir::PathMatch::Prefix("/".to_string()),
            });

            match header_matches(&grpc_match.headers) {
                Ok(headers) => ir_route.header_matches = headers,
                Err(message) => {
                    degraded.push(Degraded::invalid(message));
                    continue;
                }
            }

            templates.push(RouteTemplate {
                name: format!("{prefix}rule/{rule_idx}/match/{match_idx}"),
                route: ir_route,
            });
        }
    }

    (templates, degraded)
}

// a rule whose backends all failed to resolve still matches traffic, it just
// answers with an error instead of silently falling through to another route.
fn set_destination(route: &mut ir::HttpRoute, settings: Vec<ir::DestinationSetting>) {
    if settings.is_empty() {
        route.direct_response = Some(ir::DirectResponse { status_code: 500 });
    } else {
        route.destination = Some(ir::RouteDestination {
            name: String::new(),
            settings,
        });
    }
}

fn apply_match(route: &mut ir::HttpRoute, route_match: &HttpRouteMatch) -> Result<(), String> {
    let path = route_match.path.clone().unwrap_or_default();
    route.path_match = Some(match path.type_ {
        PathMatchType::Exact => ir::PathMatch::Exact(path.value),
        PathMatchType::PathPrefix => ir::PathMatch::Prefix(path.value),
        PathMatchType::RegularExpression => {
            let regex =
                Regex::from_str(&path.value).map_err(|e| format!("invalid path regex: {e}"))?;
            ir::PathMatch::RegularExpression(regex)
        }
    });

    route.header_matches = header_matches(&route_match.headers)?;
    if let Some(method) = &route_match.method {
        route.header_matches.push(ir::NamedMatch {
            name: ":method".to_string(),
            value: ir::StringMatch::Exact(method.clone()),
        });
    }

    route.query_param_matches = route_match
        .query_params
        .iter()
        .map(|q| {
            Ok(ir::NamedMatch {
                name: q.name.clone(),
                value: string_match(q.type_, &q.value)?,
            })
        })
        .collect::<Result<_, String>>()?;

    Ok(())
}

fn header_matches(headers: &[HttpHeaderMatch]) -> Result<Vec<ir::NamedMatch>, String> {
    headers
        .iter()
        .map(|h| {
            Ok(ir::NamedMatch {
                name: h.name.clone(),
                value: string_match(h.type_, &h.value)?,
            })
        })
        .collect()
}

fn string_match(type_: StringMatchType, value: &str) -> Result<ir::StringMatch, String> {
    match type_ {
        StringMatchType::Exact => Ok(ir::StringMatch::Exact(value.to_string())),
        StringMatchType::RegularExpression => Regex::from_str(value)
            .map(ir::StringMatch::RegularExpression)
            .map_err(|e| format!("invalid regex {value}: {e}")),
    }
}

fn path_rewrite(modifier: &HttpPathModifier) -> ir::PathRewrite {
    match modifier {
        HttpPathModifier::ReplaceFullPath { replace_full_path } => {
            ir::PathRewrite::FullPath(replace_full_path.clone())
        }
        HttpPathModifier::ReplacePrefixMatch {
            replace_prefix_match,
        } => ir::PathRewrite::PrefixMatch(replace_prefix_match.clone()),
    }
}

fn apply_filter(route: &mut ir::HttpRoute, filter: &HttpRouteFilter) {
    match filter {
        HttpRouteFilter::RequestHeaderModifier {
            request_header_modifier,
        } => {
            let set = request_header_modifier.set.iter().map(|h| (h, false));
            let add = request_header_modifier.add.iter().map(|h| (h, true));
            for (header, append) in set.chain(add) {
                route.add_request_headers.push(ir::AddHeader {
                    name: header.name.clone(),
                    value: header.value.clone(),
                    append,
                });
            }
            route
                .remove_request_headers
                .extend(request_header_modifier.remove.iter().cloned());
        }
        HttpRouteFilter::RequestRedirect { request_redirect } => {
            route.redirect = Some(ir::Redirect {
                scheme: request_redirect.scheme.clone(),
                hostname: request_redirect.hostname.clone(),
                path: request_redirect.path.as_ref().map(path_rewrite),
                port: request_redirect.port,
                status_code: request_redirect.status_code,
            });
        }
        HttpRouteFilter::UrlRewrite { url_rewrite } => {
            route.url_rewrite = Some(ir::UrlRewrite {
                hostname: url_rewrite.hostname.clone(),
                path: url_rewrite.path.as_ref().map(path_rewrite),
            });
        }
        HttpRouteFilter::Cors { cors } => {
            route.cors = Some(cors.clone());
        }
    }
}

/// The backends of a rule that resolved.
#[derive(Debug, Default)]
struct ResolvedBackends {
    settings: Vec<ir::DestinationSetting>,

    /// The retry policy of the first resolved Backend that sets one. Services
    /// have no retry settings.
    retry: Option<ir::Retry>,
}

/// Resolve a rule's backend refs into destination settings.
///
/// Backends that can't be resolved are left out and recorded as a degraded
/// condition on the route. This never fails the whole rule.
fn resolve_backends(
    route: &dyn Route,
    backend_refs: &[BackendRef],
    resources: &Resources,
    degraded: &mut Vec<Degraded>,
) -> ResolvedBackends {
    let route_namespace = &route.metadata().namespace;
    let mut resolved = ResolvedBackends::default();

    for backend_ref in backend_refs {
        match resolve_backend(route, route_namespace, backend_ref, resources) {
            Ok(Some((setting, retry))) => {
                resolved.settings.push(setting);
                if resolved.retry.is_none() {
                    resolved.retry = retry;
                }
            }
            Ok(None) => (),
            Err(d) => degraded.push(d),
        }
    }

    resolved
}

fn resolve_backend(
    route: &dyn Route,
    route_namespace: &str,
    backend_ref: &BackendRef,
    resources: &Resources,
) -> Result<Option<(ir::DestinationSetting, Option<ir::Retry>)>, Degraded> {
    let kind = backend_ref.kind();
    let group = backend_ref.group();
    let allowed = matches!(
        (group, kind),
        ("", KIND_SERVICE) | (GANTRY_GROUP, KIND_BACKEND)
    );
    if !allowed {
        return Err(Degraded::resolved_refs(
            reason::INVALID_KIND,
            format!("unsupported backend kind {group}/{kind}"),
        ));
    }

    let namespace = backend_ref.namespace.as_deref().unwrap_or(route_namespace);
    let name = &backend_ref.name;

    if namespace != route_namespace {
        let from = ObjectRef {
            group: GATEWAY_GROUP,
            kind: route.kind(),
            namespace: route_namespace,
            name: &route.metadata().name,
        };
        let to = ObjectRef {
            group,
            kind,
            namespace,
            name,
        };
        if !reference_granted(resources, &from, &to) {
            return Err(Degraded::resolved_refs(
                reason::REF_NOT_PERMITTED,
                format!("backend {namespace}/{name} is not permitted by any ReferenceGrant"),
            ));
        }
    }

    if backend_ref.weight() == 0 {
        return Ok(None);
    }

    let (setting, retry) = match kind {
        KIND_SERVICE => {
            let not_found = || {
                Degraded::resolved_refs(
                    reason::BACKEND_NOT_FOUND,
                    format!("service {namespace}/{name} not found"),
                )
            };
            let service = resources
                .get_service(namespace, name)
                .ok_or_else(not_found)?;
            let port = backend_ref.port.ok_or_else(|| {
                Degraded::resolved_refs(
                    reason::BACKEND_NOT_FOUND,
                    format!("a port is required for service {namespace}/{name}"),
                )
            })?;
            let service_port = service
                .spec
                .ports
                .iter()
                .find(|p| p.port == port)
                .ok_or_else(|| {
                    Degraded::resolved_refs(
                        reason::BACKEND_NOT_FOUND,
                        format!("service {namespace}/{name} has no port {port}"),
                    )
                })?;

            let protocol = match service_port.app_protocol.as_deref() {
                Some("kubernetes.io/h2c" | "grpc" | "http2") => ir::AppProtocol::Http2,
                _ => ir::AppProtocol::Http,
            };

            let setting = ir::DestinationSetting {
                weight: backend_ref.weight(),
                endpoints: vec![ir::DestinationEndpoint {
                    host: service.hostname(),
                    port,
                }],
                protocol,
                tls: None,
                circuit_breaker: None,
            };
            (setting, None)
        }
        _ => {
            let backend = resources.get_backend(namespace, name).ok_or_else(|| {
                Degraded::resolved_refs(
                    reason::BACKEND_NOT_FOUND,
                    format!("backend {namespace}/{name} not found"),
                )
            })?;

            let tls = match (&backend.spec.tls, backend.spec.protocol) {
                (Some(tls), _) => Some(ir::UpstreamTls {
                    sni: tls.sni.clone(),
                }),
                (None, BackendProtocol::Https) => Some(ir::UpstreamTls::default()),
                (None, _) => None,
            };

            let circuit_breaker = backend.spec.circuit_breaker.as_ref().map(|cb| {
                ir::CircuitBreaker {
                    max_connections: cb.max_connections,
                    max_pending_requests: cb.max_pending_requests,
                    max_requests: cb.max_requests,
                    max_retries: cb.max_retries,
                }
            });

            let setting = ir::DestinationSetting {
                weight: backend_ref.weight(),
                endpoints: backend
                    .spec
                    .services
                    .iter()
                    .map(|e| ir::DestinationEndpoint {
                        host: e.host.clone(),
                        port: e.port,
                    })
                    .collect(),
                protocol: match backend.spec.protocol {
                    BackendProtocol::Http2 => ir::AppProtocol::Http2,
                    _ => ir::AppProtocol::Http,
                },
                tls,
                circuit_breaker,
            };
            let retry = backend.spec.retry.as_ref().map(|r| ir::Retry {
                attempts: r.attempts,
                per_try_timeout: r.per_try_timeout,
                status_codes: r.status_codes.clone(),
            });
            (setting, retry)
        }
    };

    // a backend with nothing to send traffic to is as good as missing.
    if setting.endpoints.is_empty() {
        return Err(Degraded::resolved_refs(
            reason::BACKEND_NOT_FOUND,
            format!("{kind} {namespace}/{name} has no endpoints"),
        ));
    }
    if let Some(e) = setting
        .endpoints
        .iter()
        .find(|e| e.host.is_empty() || e.port == 0)
    {
        return Err(Degraded::resolved_refs(
            reason::BACKEND_NOT_FOUND,
            format!(
                "{kind} {namespace}/{name} has an invalid endpoint {}:{}",
                e.host, e.port
            ),
        ));
    }

    Ok(Some((setting, retry)))
}
