//! The Resource Graph: every declarative object a controller translates in a
//! single pass.

use serde::{Deserialize, Serialize};

use crate::api::Api;
use crate::backend::{Backend, Namespace, ReferenceGrant, Secret, Service};
use crate::gateway::{Gateway, GatewayClass};
use crate::route::{GrpcRoute, HttpRoute};

/// All of the resources a controller is responsible for, grouped by
/// GatewayClass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControllerResources(pub Vec<Resources>);

impl std::ops::Deref for ControllerResources {
    type Target = Vec<Resources>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ControllerResources {
    /// Sort every `Resources` by its GatewayClass name so that two graphs
    /// with the same contents compare equal regardless of discovery order.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| a.class_name().cmp(b.class_name()));
    }
}

/// The resources reachable from a single GatewayClass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_class: Option<GatewayClass>,
    #[serde(default)]
    pub gateways: Vec<Gateway>,
    #[serde(default)]
    pub http_routes: Vec<HttpRoute>,
    #[serde(default)]
    pub grpc_routes: Vec<GrpcRoute>,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
    #[serde(default)]
    pub reference_grants: Vec<ReferenceGrant>,
    #[serde(default)]
    pub apis: Vec<Api>,
}

macro_rules! lookup_by_name {
    ($($(#[$attr:meta])* $method:ident: $field:ident => $ty:ty),* $(,)*) => {
        impl Resources {
            $(
            $(#[$attr])*
            pub fn $method(&self, namespace: &str, name: &str) -> Option<&$ty> {
                self.$field
                    .iter()
                    .find(|o| o.metadata.namespace == namespace && o.metadata.name == name)
            }
            )*
        }
    };
}

lookup_by_name! {
    get_service: services => Service,
    get_backend: backends => Backend,
    get_secret: secrets => Secret,
}

impl Resources {
    /// The name of the GatewayClass these resources belong to, or the empty
    /// string if there isn't one.
    pub fn class_name(&self) -> &str {
        self.gateway_class
            .as_ref()
            .map(|c| c.metadata.name.as_str())
            .unwrap_or("")
    }

    pub fn get_namespace(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.iter().find(|n| n.metadata.name == name)
    }

    /// The APIs in this graph with duplicates removed. The first occurrence
    /// of a `namespace/name` wins.
    pub fn unique_apis(&self) -> Vec<&Api> {
        let mut seen = std::collections::BTreeSet::new();
        self.apis
            .iter()
            .filter(|a| seen.insert((&a.metadata.namespace, &a.metadata.name)))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::ApiSpec;
    use crate::ObjectMeta;

    #[test]
    fn test_resources_yaml() {
        let resources: ControllerResources = serde_yml::from_str(
            r#"
- gatewayClass:
    metadata:
      name: gantry
    spec:
      controllerName: gantry.io/gateway-controller
  namespaces:
    - metadata:
        name: default
  services:
    - metadata:
        namespace: default
        name: svc-a
      spec:
        ports:
          - port: 8080
  backends:
    - metadata:
        namespace: default
        name: svc-b
      spec:
        services:
          - host: svc-b
            port: 8080
"#,
        )
        .unwrap();

        assert_eq!(resources.len(), 1);
        let r = &resources[0];
        assert_eq!(r.class_name(), "gantry");
        assert!(r.get_namespace("default").is_some());
        assert!(r.get_service("default", "svc-a").is_some());
        assert!(r.get_service("other", "svc-a").is_none());
        assert_eq!(
            r.get_backend("default", "svc-b").unwrap().spec.services[0].host,
            "svc-b"
        );
        assert!(r.get_secret("default", "svc-a").is_none());
    }

    #[test]
    fn test_unique_apis() {
        let api = |name: &str, env: &str| Api {
            metadata: ObjectMeta::new("default", name),
            spec: ApiSpec {
                environment: Some(env.to_string()),
                ..Default::default()
            },
        };

        let resources = Resources {
            apis: vec![api("a", "prod"), api("b", "prod"), api("a", "dev")],
            ..Default::default()
        };

        let apis = resources.unique_apis();
        assert_eq!(apis.len(), 2);
        assert_eq!(apis[0].spec.environment.as_deref(), Some("prod"));
        assert_eq!(apis[1].metadata.name, "b");
    }
}
