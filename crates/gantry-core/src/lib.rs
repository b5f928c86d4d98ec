//! The Gantry control-plane pipeline.
//!
//! Gantry turns a graph of Gateway API style resources into xDS for a fleet of
//! Envoy proxies. The pipeline is a chain of [runner]s connected by
//! [watchable] stores:
//!
//! ```text
//! provider -> translator -> infra manager
//!                        -> xds compiler -> snapshot cache -> proxies
//! ```
//!
//! Each stage can also be used on its own. [translator::Translator] is a pure
//! function from a [gantry_api::Resources] graph to IR, [xds::compile] turns
//! XDS IR into Envoy resources, and [xds::SnapshotCache] serves them.

mod error;
mod hash;
mod rand;

pub use error::{Error, Result};

pub mod backoff;
pub mod infra;
pub mod runner;
pub mod translator;
pub mod watchable;
pub mod xds;
