//! Backends, Services, Secrets, and the grants that allow referencing them
//! across namespaces.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::shared::Duration;
use crate::ObjectMeta;

pub const KIND_SERVICE: &str = "Service";
pub const KIND_BACKEND: &str = "Backend";
pub const KIND_SECRET: &str = "Secret";
pub const KIND_GATEWAY: &str = "Gateway";

/// The API group Gantry's own kinds (like `Backend`) belong to.
pub const GANTRY_GROUP: &str = "gantry.io";

/// The gateway API group. Routes and Gateways belong here.
pub const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";

/// The data key of a PEM encoded certificate chain in a TLS secret.
pub const TLS_CERT_KEY: &str = "tls.crt";

/// The data key of a PEM encoded private key in a TLS secret.
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub metadata: ObjectMeta,
}

/// A Kubernetes style Service. Services resolve to their cluster DNS name,
/// `<name>.<namespace>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
}

impl Service {
    /// The hostname traffic to this Service should be sent to.
    pub fn hostname(&self) -> String {
        format!("{}.{}", self.metadata.name, self.metadata.namespace)
    }

    pub fn has_port(&self, port: u16) -> bool {
        self.spec.ports.iter().any(|p| p.port == port)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,

    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
}

/// A statically configured upstream: a set of `host:port` endpoints and the
/// connection settings used to talk to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub metadata: ObjectMeta,
    pub spec: BackendSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    pub services: Vec<BackendEndpoint>,

    #[serde(default)]
    pub protocol: BackendProtocol,

    /// Originate TLS to every endpoint of this Backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<BackendTls>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreaker>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendProtocol {
    #[default]
    Http,
    Https,
    Http2,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendTls {
    /// The SNI to send. Defaults to the endpoint host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_codes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreaker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Opaque key material. TLS secrets carry PEM data under [TLS_CERT_KEY] and
/// [TLS_PRIVATE_KEY_KEY].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Allows objects in other namespaces to reference objects in this
/// ReferenceGrant's namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceGrant {
    pub metadata: ObjectMeta,
    pub spec: ReferenceGrantSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceGrantSpec {
    pub from: Vec<ReferenceGrantFrom>,
    pub to: Vec<ReferenceGrantTo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceGrantFrom {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceGrantTo {
    #[serde(default)]
    pub group: String,
    pub kind: String,

    /// A specific object name. When unset, every object of `kind` in the
    /// grant's namespace may be referenced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ReferenceGrant {
    /// Returns `true` if this grant allows an object of `from_kind` in
    /// `from_namespace` to reference the object `to_kind/to_name` in the
    /// grant's own namespace.
    pub fn permits(
        &self,
        from_group: &str,
        from_kind: &str,
        from_namespace: &str,
        to_group: &str,
        to_kind: &str,
        to_name: &str,
    ) -> bool {
        let from_ok = self.spec.from.iter().any(|f| {
            f.group == from_group && f.kind == from_kind && f.namespace == from_namespace
        });

        let to_ok = self.spec.to.iter().any(|t| {
            t.group == to_group
                && t.kind == to_kind
                && t.name.as_deref().map_or(true, |n| n == to_name)
        });

        from_ok && to_ok
    }
}
