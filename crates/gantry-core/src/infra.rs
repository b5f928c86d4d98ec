//! The interface to whatever runs proxies.
//!
//! Gantry doesn't deploy proxies itself. An [InfraManager] is handed the
//! [Infra IR][ir::Infra] for every logical gateway and is responsible for
//! making a proxy fleet that matches it exist.

use std::future::Future;

use gantry_api::ir;

use crate::Result;

/// Reconciles Infra IR against a deployment backend.
///
/// Both operations must be idempotent. The infra runner calls them once per
/// change, but calls are repeated with the same value whenever the pipeline
/// restarts.
pub trait InfraManager: Send + Sync + 'static {
    /// Create the infrastructure for a logical gateway or update it in place.
    fn create_or_update(&self, infra: &ir::Infra) -> impl Future<Output = Result<()>> + Send;

    /// Remove the infrastructure for a logical gateway.
    fn delete(&self, infra: &ir::Infra) -> impl Future<Output = Result<()>> + Send;
}
