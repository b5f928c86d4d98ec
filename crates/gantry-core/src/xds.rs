//! Compiling XDS IR into xDS resources and serving them to proxies.
//!
//! [compile] turns an [ir::Xds][gantry_api::ir::Xds] into a
//! [ResourceVersionTable] of Envoy resources. Tables are published into a
//! [SnapshotCache] which assigns them a version and serves them over ADS or
//! the per-type discovery services with [serve].

mod cache;
mod compile;
mod resources;
mod server;


pub use cache::{Node, Snapshot, SnapshotCache, StreamHandle};
pub use compile::{compile, CompileResult, EXT_AUTHZ_METADATA};
pub use resources::{ResourceType, ResourceVersionTable};
pub use server::{serve, ServerConfig, TlsConfig};
