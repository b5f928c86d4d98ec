use gantry_api::ir;
use gantry_core::infra::InfraManager;

/// An [InfraManager] that only logs what it would do.
///
/// The proxy fleet is managed outside of the controller. This keeps a record
/// of the ports and labels each fleet is expected to have.
pub(crate) struct LoggingInfraManager;

impl InfraManager for LoggingInfraManager {
    async fn create_or_update(&self, infra: &ir::Infra) -> gantry_core::Result<()> {
        let ports: Vec<_> = infra
            .ports
            .iter()
            .map(|p| format!("{}:{}->{}", p.name, p.service_port, p.container_port))
            .collect();

        tracing::info!(
            name = %infra.name,
            ?ports,
            addresses = ?infra.addresses,
            labels = ?infra.labels,
            "proxy infrastructure updated"
        );
        Ok(())
    }

    async fn delete(&self, infra: &ir::Infra) -> gantry_core::Result<()> {
        tracing::info!(name = %infra.name, "proxy infrastructure deleted");
        Ok(())
    }
}
