use std::collections::BTreeMap;

use gantry_api::backend::{
    GATEWAY_GROUP, KIND_GATEWAY, KIND_SECRET, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
};
use gantry_api::gateway::{Listener, ProtocolType, RouteGroupKind, TlsMode};
use gantry_api::ir;
use gantry_api::route::{KIND_GRPC_ROUTE, KIND_HTTP_ROUTE};
use gantry_api::status::{condition_type, reason};
use gantry_api::Resources;

use super::context::GatewayContext;
use super::{reference_granted, InfraIrMap, ObjectRef, Translator, XdsIrMap};

// Well known ports are shifted into the ephemeral range so the proxy can bind
// them without privileges.
const MIN_EPHEMERAL_PORT: u16 = 1024;
const WELL_KNOWN_PORT_SHIFT: u16 = 10000;

pub(super) fn container_port(port: u16) -> u16 {
    if port < MIN_EPHEMERAL_PORT {
        port + WELL_KNOWN_PORT_SHIFT
    } else {
        port
    }
}

impl Translator {
    /// Translate every Gateway listener into an IR listener and an infra
    /// port, recording listener conditions along the way.
    ///
    /// Listeners that can't be programmed are left out of the IR entirely.
    pub(super) fn process_listeners(
        &self,
        gateways: &mut [GatewayContext],
        xds_ir: &mut XdsIrMap,
        infra_ir: &mut InfraIrMap,
        resources: &Resources,
    ) {
        for gateway in gateways.iter_mut() {
            let conflicts = listener_conflicts(gateway.listeners());

            for (idx, conflict) in conflicts.into_iter().enumerate() {
                let listener = gateway.listeners()[idx].clone();

                if !matches!(listener.protocol, ProtocolType::Http | ProtocolType::Https) {
                    gateway.set_listener_condition(
                        idx,
                        condition_type::ACCEPTED,
                        false,
                        reason::UNSUPPORTED_PROTOCOL,
                        format!("{:?} listeners are not supported", listener.protocol),
                    );
                    not_programmed(gateway, idx);
                    continue;
                }

                if let Some((conflict_reason, message)) = conflict {
                    gateway.set_listener_condition(
                        idx,
                        condition_type::ACCEPTED,
                        false,
                        conflict_reason,
                        message,
                    );
                    not_programmed(gateway, idx);
                    continue;
                }

                if !self.set_supported_kinds(gateway, idx, &listener) {
                    not_programmed(gateway, idx);
                    continue;
                }

                let port = container_port(listener.port);
                let hostname = listener.hostname.clone().unwrap_or_else(|| "*".to_string());

                let tls = match listener.protocol {
                    ProtocolType::Https => match resolve_tls(gateway, &listener, resources) {
                        Ok(certificates) => Some(ir::ListenerTls {
                            hostname: hostname.clone(),
                            certificates,
                        }),
                        Err(message) => {
                            gateway.set_listener_condition(
                                idx,
                                condition_type::RESOLVED_REFS,
                                false,
                                reason::INVALID_CERTIFICATE_REF,
                                message,
                            );
                            not_programmed(gateway, idx);
                            continue;
                        }
                    },
                    _ => None,
                };

                let Some(xds) = xds_ir.get_mut(&gateway.ir_key) else {
                    continue;
                };

                let existing = xds.http.iter().position(|l| l.port == port);
                let ir_name = match existing.map(|i| &mut xds.http[i]) {
                    // listeners on the same port share a single IR listener.
                    // plain HTTP listeners are told apart by Host, HTTPS
                    // listeners by SNI.
                    Some(existing) if existing.is_https() == tls.is_some() => {
                        if let Some(tls) = tls {
                            if existing.tls.iter().any(|t| t.hostname == tls.hostname) {
                                let message = format!(
                                    "hostname {} on port {} is already served by listener {}",
                                    tls.hostname, listener.port, existing.name
                                );
                                gateway.set_listener_condition(
                                    idx,
                                    condition_type::ACCEPTED,
                                    false,
                                    reason::HOSTNAME_CONFLICT,
                                    message,
                                );
                                not_programmed(gateway, idx);
                                continue;
                            }
                            existing.tls.push(tls);
                        }
                        if !existing.hostnames.contains(&hostname) {
                            existing.hostnames.push(hostname);
                        }
                        existing.name.clone()
                    }
                    Some(existing) => {
                        let message = format!(
                            "port {} is already in use by listener {}",
                            listener.port, existing.name
                        );
                        gateway.set_listener_condition(
                            idx,
                            condition_type::ACCEPTED,
                            false,
                            reason::PROTOCOL_CONFLICT,
                            message,
                        );
                        not_programmed(gateway, idx);
                        continue;
                    }
                    None => {
                        let name =
                            format!("{}/{}/{}", gateway.namespace(), gateway.name(), listener.name);
                        let protocol = match tls.is_some() {
                            true => ir::InfraProtocol::Https,
                            false => ir::InfraProtocol::Http,
                        };

                        xds.http.push(ir::HttpListener {
                            name: name.clone(),
                            address: "0.0.0.0".to_string(),
                            port,
                            hostnames: vec![hostname],
                            tls: tls.into_iter().collect(),
                            routes: vec![],
                        });

                        if let Some(infra) = infra_ir.get_mut(&gateway.ir_key) {
                            infra.ports.push(ir::InfraPort {
                                name: name.clone(),
                                protocol,
                                service_port: listener.port,
                                container_port: port,
                            });
                        }

                        name
                    }
                };

                gateway.set_ir_listener(idx, ir_name);
                gateway.set_listener_condition(
                    idx,
                    condition_type::ACCEPTED,
                    true,
                    reason::ACCEPTED,
                    "Listener is accepted",
                );
                gateway.set_listener_condition(
                    idx,
                    condition_type::RESOLVED_REFS,
                    true,
                    reason::RESOLVED_REFS,
                    "Listener references are resolved",
                );
                gateway.set_listener_condition(
                    idx,
                    condition_type::PROGRAMMED,
                    true,
                    reason::PROGRAMMED,
                    "Listener is programmed",
                );
            }
        }
    }

    /// Compute the route kinds a listener supports. Returns `false` if the
    /// listener doesn't support any kind at all.
    fn set_supported_kinds(
        &self,
        gateway: &mut GatewayContext,
        idx: usize,
        listener: &Listener,
    ) -> bool {
        let all_kinds = [KIND_HTTP_ROUTE, KIND_GRPC_ROUTE];

        let requested = listener
            .allowed_routes
            .as_ref()
            .map(|r| r.kinds.as_slice())
            .unwrap_or_default();

        if requested.is_empty() {
            let kinds = all_kinds
                .iter()
                .map(|kind| RouteGroupKind {
                    group: Some(GATEWAY_GROUP.to_string()),
                    kind: kind.to_string(),
                })
                .collect();
            gateway.set_supported_kinds(idx, kinds);
            return true;
        }

        let (supported, unsupported): (Vec<_>, Vec<_>) = requested.iter().cloned().partition(|k| {
            k.group.as_deref().unwrap_or(GATEWAY_GROUP) == GATEWAY_GROUP
                && all_kinds.contains(&k.kind.as_str())
        });

        if !unsupported.is_empty() {
            let names: Vec<_> = unsupported.iter().map(|k| k.kind.as_str()).collect();
            gateway.set_listener_condition(
                idx,
                condition_type::RESOLVED_REFS,
                false,
                reason::INVALID_KIND,
                format!("unsupported route kinds: {}", names.join(", ")),
            );
        }

        let any_supported = !supported.is_empty();
        gateway.set_supported_kinds(idx, supported);
        any_supported
    }
}

fn not_programmed(gateway: &mut GatewayContext, idx: usize) {
    gateway.set_listener_condition(
        idx,
        condition_type::PROGRAMMED,
        false,
        reason::INVALID,
        "Listener is invalid, see other conditions for details",
    );
}

/// Find listeners in the same Gateway that can't coexist.
///
/// Listeners on the same port have to agree on protocol, and listeners with
/// the same port and protocol need distinct hostnames.
fn listener_conflicts(listeners: &[Listener]) -> Vec<Option<(&'static str, String)>> {
    let mut by_port: BTreeMap<u16, Vec<usize>> = BTreeMap::new();
    for (idx, listener) in listeners.iter().enumerate() {
        by_port.entry(listener.port).or_default().push(idx);
    }

    let mut conflicts = vec![None; listeners.len()];
    for (port, idxs) in by_port {
        let first_protocol = listeners[idxs[0]].protocol;
        if idxs.iter().any(|&i| listeners[i].protocol != first_protocol) {
            for &i in &idxs {
                conflicts[i] = Some((
                    reason::PROTOCOL_CONFLICT,
                    format!("listeners on port {port} use different protocols"),
                ));
            }
            continue;
        }

        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for &i in &idxs {
            let hostname = listeners[i].hostname.as_deref().unwrap_or("*");
            if let Some(&other) = seen.get(hostname) {
                for j in [other, i] {
                    conflicts[j] = Some((
                        reason::HOSTNAME_CONFLICT,
                        format!("listeners on port {port} share hostname {hostname}"),
                    ));
                }
            } else {
                seen.insert(hostname, i);
            }
        }
    }

    conflicts
}

/// Resolve the certificates for an HTTPS listener.
fn resolve_tls(
    gateway: &GatewayContext,
    listener: &Listener,
    resources: &Resources,
) -> Result<Vec<ir::TlsCertificate>, String> {
    let tls = listener
        .tls
        .as_ref()
        .ok_or_else(|| "HTTPS listeners must configure tls".to_string())?;

    if tls.mode != TlsMode::Terminate {
        return Err("only TLS termination is supported".to_string());
    }

    if tls.certificate_refs.is_empty() {
        return Err("at least one certificateRef is required".to_string());
    }

    let mut certs = Vec::with_capacity(tls.certificate_refs.len());
    for cert_ref in &tls.certificate_refs {
        let group = cert_ref.group.as_deref().unwrap_or("");
        let kind = cert_ref.kind.as_deref().unwrap_or(KIND_SECRET);
        if !group.is_empty() || kind != KIND_SECRET {
            return Err(format!("unsupported certificateRef kind {group}/{kind}"));
        }

        let namespace = cert_ref.namespace.as_deref().unwrap_or(gateway.namespace());
        let name = &cert_ref.name;

        if namespace != gateway.namespace() {
            let from = ObjectRef {
                group: GATEWAY_GROUP,
                kind: KIND_GATEWAY,
                namespace: gateway.namespace(),
                name: gateway.name(),
            };
            let to = ObjectRef {
                group: "",
                kind: KIND_SECRET,
                namespace,
                name,
            };
            if !reference_granted(resources, &from, &to) {
                return Err(format!(
                    "certificateRef to {namespace}/{name} is not permitted by a ReferenceGrant"
                ));
            }
        }

        let secret = resources
            .get_secret(namespace, name)
            .ok_or_else(|| format!("secret {namespace}/{name} does not exist"))?;

        let cert = secret.data.get(TLS_CERT_KEY).map(String::as_str).unwrap_or("");
        let key = secret.data.get(TLS_PRIVATE_KEY_KEY).map(String::as_str).unwrap_or("");

        if !cert.contains("-----BEGIN CERTIFICATE-----") {
            return Err(format!(
                "secret {namespace}/{name} must contain a PEM encoded certificate in {TLS_CERT_KEY}"
            ));
        }
        if !(key.contains("-----BEGIN") && key.contains("PRIVATE KEY-----")) {
            return Err(format!(
                "secret {namespace}/{name} must hold a PEM private key in {TLS_PRIVATE_KEY_KEY}"
            ));
        }

        certs.push(ir::TlsCertificate {
            name: format!("{namespace}/{name}"),
            certificate_chain: cert.to_string(),
            private_key: key.to_string(),
        });
    }

    Ok(certs)
}

#[cfg(test)]
mod test {
    use super::*;

    fn listener(name: &str, port: u16, protocol: ProtocolType, hostname: Option<&str>) -> Listener {
        Listener {
            name: name.to_string(),
            hostname: hostname.map(str::to_string),
            port,
            protocol,
            tls: None,
            allowed_routes: None,
        }
    }

    #[test]
    fn test_container_port() {
        assert_eq!(container_port(80), 10080);
        assert_eq!(container_port(443), 10443);
        assert_eq!(container_port(1024), 1024);
        assert_eq!(container_port(8080), 8080);
    }

    #[test]
    fn test_listener_conflicts() {
        let listeners = vec![
            listener("a", 80, ProtocolType::Http, Some("a.example.com")),
            listener("b", 80, ProtocolType::Http, Some("b.example.com")),
            listener("c", 8080, ProtocolType::Http, None),
            listener("d", 8080, ProtocolType::Http, None),
            listener("e", 443, ProtocolType::Https, None),
            listener("f", 443, ProtocolType::Http, None),
        ];

        let conflicts: Vec<_> = listener_conflicts(&listeners)
            .into_iter()
            .map(|c| c.map(|(reason, _)| reason))
            .collect();

        assert_eq!(
            conflicts,
            vec![
                None,
                None,
                Some(reason::HOSTNAME_CONFLICT),
                Some(reason::HOSTNAME_CONFLICT),
                Some(reason::PROTOCOL_CONFLICT),
                Some(reason::PROTOCOL_CONFLICT),
            ]
        );
    }
}
