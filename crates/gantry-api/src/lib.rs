//! Gantry API types.
//!
//! This crate contains the declarative input model (the Resource Graph), the
//! status types written back to it, and the intermediate representations the
//! translator produces. Nothing in here does any I/O.

mod error;
pub use error::Error;

pub mod api;
pub mod backend;
pub mod gateway;
pub mod ir;
pub mod resources;
pub mod route;
pub mod shared;
pub mod status;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use resources::{ControllerResources, Resources};
pub use shared::NamespacedName;

/// Metadata common to every declarative object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// The namespace of the object. Cluster-scoped objects leave this empty.
    #[serde(default)]
    pub namespace: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// A sequence number for the object's desired state. Conditions record
    /// the generation they were observed at.
    #[serde(default)]
    pub generation: i64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.name)
    }
}
