use tokio_util::sync::CancellationToken;

use crate::infra::InfraManager;
use crate::runner::{next_updates, InfraIrStore};
use crate::Result;

/// Hands Infra IR to an [InfraManager].
pub(super) struct InfraRunner<M> {
    pub(super) infra_ir: InfraIrStore,
    pub(super) manager: M,
}

impl<M: InfraManager> InfraRunner<M> {
    pub(super) async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut sub = self.infra_ir.subscribe();

        while let Some(snapshot) = next_updates(&mut sub, &cancel).await {
            for update in snapshot.updates {
                let infra = &update.value;
                let result = match update.delete {
                    true => self.manager.delete(infra).await,
                    false => self.manager.create_or_update(infra).await,
                };

                match result {
                    Ok(()) => tracing::debug!(
                        key = %update.key,
                        delete = update.delete,
                        "reconciled infra"
                    ),
                    Err(e) if e.is_fatal_to_runner() => return Err(e),
                    // the next update for this key retries
                    Err(e) => {
                        tracing::error!(key = %update.key, err = %e, "failed to reconcile infra")
                    }
                }
            }
        }

        Ok(())
    }
}
