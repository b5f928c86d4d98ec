use std::collections::BTreeMap;

use enum_map::EnumMap;
use xds_api::pb::google::protobuf;

use crate::hash::thread_local_xxhash;

/// The xDS resource types served to proxies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, enum_map::Enum)]
pub enum ResourceType {
    Listener,
    RouteConfiguration,
    Cluster,
    ClusterLoadAssignment,
    Secret,
    Runtime,
}

impl ResourceType {
    pub fn all() -> &'static [Self] {
        &[
            Self::Cluster,
            Self::ClusterLoadAssignment,
            Self::Listener,
            Self::RouteConfiguration,
            Self::Secret,
            Self::Runtime,
        ]
    }

    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceType::Listener => "type.googleapis.com/envoy.config.listener.v3.Listener",
            ResourceType::RouteConfiguration => {
                "type.googleapis.com/envoy.config.route.v3.RouteConfiguration"
            }
            ResourceType::Cluster => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            ResourceType::ClusterLoadAssignment => {
                "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment"
            }
            ResourceType::Secret => {
                "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret"
            }
            ResourceType::Runtime => "type.googleapis.com/envoy.service.runtime.v3.Runtime",
        }
    }

    pub fn from_type_url(type_url: &str) -> Option<Self> {
        Self::all().iter().find(|t| t.type_url() == type_url).copied()
    }
}

/// A complete set of compiled resources for a logical gateway.
///
/// Resources are kept sorted by name within each type, so two tables built
/// from the same IR compare equal and encode identically. Tables are
/// immutable once they've been handed to the snapshot cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceVersionTable {
    resources: EnumMap<ResourceType, BTreeMap<String, protobuf::Any>>,
}

impl ResourceVersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource to the table, replacing any resource of the same type
    /// with the same name.
    pub fn insert<M: prost::Name>(
        &mut self,
        resource_type: ResourceType,
        name: impl Into<String>,
        resource: &M,
    ) {
        let any = protobuf::Any::from_msg(resource).expect("generated invalid xds");
        self.resources[resource_type].insert(name.into(), any);
    }

    pub fn contains(&self, resource_type: ResourceType, name: &str) -> bool {
        self.resources[resource_type].contains_key(name)
    }

    pub fn names(&self, resource_type: ResourceType) -> impl Iterator<Item = &str> + '_ {
        self.resources[resource_type].keys().map(String::as_str)
    }

    pub fn get(&self, resource_type: ResourceType, name: &str) -> Option<&protobuf::Any> {
        self.resources[resource_type].get(name)
    }

    /// The resources of a type a proxy asked for.
    ///
    /// An empty list of names is a wildcard subscription and returns every
    /// resource of the type. Names that don't exist are skipped.
    pub fn resources(&self, resource_type: ResourceType, names: &[String]) -> Vec<protobuf::Any> {
        let resources = &self.resources[resource_type];
        match names {
            [] => resources.values().cloned().collect(),
            names => names.iter().filter_map(|n| resources.get(n)).cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.resources.values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.values().all(|r| r.is_empty())
    }

    /// A fingerprint of the contents of this table. Tables with the same
    /// resources always have the same fingerprint.
    pub fn fingerprint(&self) -> u64 {
        let entries = self.resources.iter().flat_map(|(resource_type, resources)| {
            resources
                .iter()
                .map(move |(name, any)| (resource_type.type_url(), name, &any.value))
        });
        thread_local_xxhash::hash_iter(entries)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use xds_api::pb::envoy::config::cluster::v3 as xds_cluster;

    fn cluster(name: &str) -> xds_cluster::Cluster {
        xds_cluster::Cluster {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_type_url_roundtrip() {
        for resource_type in ResourceType::all() {
            assert_eq!(
                ResourceType::from_type_url(resource_type.type_url()),
                Some(*resource_type)
            );
        }
        assert_eq!(ResourceType::from_type_url("type.googleapis.com/nope"), None);
    }

    #[test]
    fn test_resources_by_name() {
        let mut table = ResourceVersionTable::new();
        table.insert(ResourceType::Cluster, "b", &cluster("b"));
        table.insert(ResourceType::Cluster, "a", &cluster("a"));

        assert_eq!(table.len(), 2);
        assert_eq!(table.names(ResourceType::Cluster).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(table.resources(ResourceType::Cluster, &[]).len(), 2);
        assert_eq!(
            table
                .resources(ResourceType::Cluster, &["b".to_string(), "c".to_string()])
                .len(),
            1
        );
        assert!(table.resources(ResourceType::Listener, &[]).is_empty());
    }

    #[test]
    fn test_fingerprint() {
        let mut a = ResourceVersionTable::new();
        a.insert(ResourceType::Cluster, "a", &cluster("a"));
        a.insert(ResourceType::Cluster, "b", &cluster("b"));

        let mut b = ResourceVersionTable::new();
        b.insert(ResourceType::Cluster, "b", &cluster("b"));
        b.insert(ResourceType::Cluster, "a", &cluster("a"));

        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.insert(ResourceType::Cluster, "c", &cluster("c"));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
