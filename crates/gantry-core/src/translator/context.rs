use gantry_api::backend::Namespace;
use gantry_api::gateway::{FromNamespaces, Gateway, Listener, ListenerStatus, RouteGroupKind};
use gantry_api::status::{set_condition, Condition, ConditionStatus};

/// A Gateway selected for translation, along with the state translation
/// builds up about it.
///
/// The Gateway is a copy of the input with its listener statuses reset, so
/// statuses are always rebuilt from scratch and never carry conditions from a
/// previous pass.
#[derive(Debug, Clone)]
pub(crate) struct GatewayContext {
    pub(crate) gateway: Gateway,

    /// The key of the IRs this Gateway is translated into.
    pub(crate) ir_key: String,

    /// The IR listener each Gateway listener was translated into, by index.
    /// Listeners that aren't programmed have no IR listener.
    ir_listeners: Vec<Option<String>>,
}

impl GatewayContext {
    pub(crate) fn new(gateway: &Gateway, ir_key: String) -> Self {
        let mut gateway = gateway.clone();

        gateway.status.conditions.clear();
        gateway.status.listeners = gateway
            .spec
            .listeners
            .iter()
            .map(|l| ListenerStatus {
                name: l.name.clone(),
                ..Default::default()
            })
            .collect();

        let ir_listeners = vec![None; gateway.spec.listeners.len()];
        Self {
            gateway,
            ir_key,
            ir_listeners,
        }
    }

    pub(crate) fn namespace(&self) -> &str {
        &self.gateway.metadata.namespace
    }

    pub(crate) fn name(&self) -> &str {
        &self.gateway.metadata.name
    }

    pub(crate) fn listeners(&self) -> &[Listener] {
        &self.gateway.spec.listeners
    }

    pub(crate) fn listener_index(&self, section_name: &str) -> Option<usize> {
        self.listeners().iter().position(|l| l.name == section_name)
    }

    pub(crate) fn set_listener_condition(
        &mut self,
        idx: usize,
        type_: &str,
        status: impl Into<ConditionStatus>,
        reason: &str,
        message: impl Into<String>,
    ) {
        let generation = self.gateway.metadata.generation;
        let condition = Condition::new(type_, status, reason, message, generation);
        set_condition(&mut self.gateway.status.listeners[idx].conditions, condition);
    }

    pub(crate) fn set_condition(
        &mut self,
        type_: &str,
        status: impl Into<ConditionStatus>,
        reason: &str,
        message: impl Into<String>,
    ) {
        let generation = self.gateway.metadata.generation;
        let condition = Condition::new(type_, status, reason, message, generation);
        set_condition(&mut self.gateway.status.conditions, condition);
    }

    pub(crate) fn set_supported_kinds(&mut self, idx: usize, kinds: Vec<RouteGroupKind>) {
        self.gateway.status.listeners[idx].supported_kinds = kinds;
    }

    pub(crate) fn increment_attached_routes(&mut self, idx: usize) {
        self.gateway.status.listeners[idx].attached_routes += 1;
    }

    pub(crate) fn set_ir_listener(&mut self, idx: usize, name: String) {
        self.ir_listeners[idx] = Some(name);
    }

    /// The IR listener for a Gateway listener, if it was programmed.
    pub(crate) fn ir_listener(&self, idx: usize) -> Option<&str> {
        self.ir_listeners[idx].as_deref()
    }

    pub(crate) fn is_ready(&self, idx: usize) -> bool {
        self.ir_listeners[idx].is_some()
    }

    pub(crate) fn allows_kind(&self, idx: usize, kind: &str) -> bool {
        self.gateway.status.listeners[idx]
            .supported_kinds
            .iter()
            .any(|k| k.kind == kind)
    }

    /// Returns `true` if a listener allows routes from a namespace.
    ///
    /// Listeners only accept routes from their own namespace unless they say
    /// otherwise. Selecting namespaces by label requires the Namespace object
    /// to be present in the graph.
    pub(crate) fn allows_namespace(
        &self,
        idx: usize,
        route_namespace: &str,
        namespace: Option<&Namespace>,
    ) -> bool {
        let route_namespaces = self.listeners()[idx]
            .allowed_routes
            .as_ref()
            .and_then(|r| r.namespaces.as_ref());

        let Some(route_namespaces) = route_namespaces else {
            return self.namespace() == route_namespace;
        };

        match route_namespaces.from {
            FromNamespaces::All => true,
            FromNamespaces::Same => self.namespace() == route_namespace,
            FromNamespaces::Selector => match (&route_namespaces.selector, namespace) {
                (Some(selector), Some(namespace)) => selector.matches(&namespace.metadata.labels),
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use gantry_api::gateway::{
        AllowedRoutes, GatewaySpec, LabelSelector, ProtocolType, RouteNamespaces,
    };
    use gantry_api::status::{condition_type, reason};
    use gantry_api::ObjectMeta;

    fn gateway(allowed: Option<RouteNamespaces>) -> Gateway {
        Gateway {
            metadata: ObjectMeta::new("infra", "gw"),
            spec: GatewaySpec {
                gateway_class_name: "gantry".to_string(),
                listeners: vec![Listener {
                    name: "http".to_string(),
                    hostname: None,
                    port: 80,
                    protocol: ProtocolType::Http,
                    tls: None,
                    allowed_routes: allowed.map(|namespaces| AllowedRoutes {
                        namespaces: Some(namespaces),
                        kinds: vec![],
                    }),
                }],
                addresses: vec![],
                infrastructure: None,
            },
            status: Default::default(),
        }
    }

    #[test]
    fn test_reset_listener_status() {
        let mut gw = gateway(None);
        gw.status.listeners = vec![ListenerStatus {
            name: "stale".to_string(),
            attached_routes: 12,
            ..Default::default()
        }];

        let mut ctx = GatewayContext::new(&gw, "infra/gw".to_string());
        assert_eq!(ctx.gateway.status.listeners.len(), 1);
        assert_eq!(ctx.gateway.status.listeners[0].name, "http");
        assert_eq!(ctx.gateway.status.listeners[0].attached_routes, 0);
        assert!(!ctx.is_ready(0));

        ctx.set_listener_condition(0, condition_type::ACCEPTED, true, reason::ACCEPTED, "");
        ctx.set_listener_condition(0, condition_type::ACCEPTED, true, reason::ACCEPTED, "");
        assert_eq!(ctx.gateway.status.listeners[0].conditions.len(), 1);
    }

    #[test]
    fn test_allows_namespace() {
        let same = GatewayContext::new(&gateway(None), "infra/gw".to_string());
        assert!(same.allows_namespace(0, "infra", None));
        assert!(!same.allows_namespace(0, "default", None));

        let all = GatewayContext::new(
            &gateway(Some(RouteNamespaces {
                from: FromNamespaces::All,
                selector: None,
            })),
            "infra/gw".to_string(),
        );
        assert!(all.allows_namespace(0, "default", None));

        let selector = GatewayContext::new(
            &gateway(Some(RouteNamespaces {
                from: FromNamespaces::Selector,
                selector: Some(LabelSelector {
                    match_labels: [("team".to_string(), "a".to_string())].into(),
                }),
            })),
            "infra/gw".to_string(),
        );
        let mut ns = Namespace {
            metadata: ObjectMeta::new("", "default"),
        };
        assert!(!selector.allows_namespace(0, "default", None));
        assert!(!selector.allows_namespace(0, "default", Some(&ns)));
        ns.metadata
            .labels
            .insert("team".to_string(), "a".to_string());
        assert!(selector.allows_namespace(0, "default", Some(&ns)));
    }
}
