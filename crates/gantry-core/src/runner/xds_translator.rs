use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::runner::{next_updates, XdsIrStore, XdsStore};
use crate::xds;
use crate::Result;

/// Compiles XDS IR into xDS resources.
pub(super) struct XdsTranslatorRunner {
    pub(super) xds_ir: XdsIrStore,
    pub(super) xds: XdsStore,
}

impl XdsTranslatorRunner {
    pub(super) async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut sub = self.xds_ir.subscribe();

        while let Some(snapshot) = next_updates(&mut sub, &cancel).await {
            for update in snapshot.updates {
                if update.delete {
                    tracing::debug!(key = %update.key, "deleting xds resources");
                    self.xds.delete(&update.key);
                    continue;
                }

                let result = xds::compile(&update.value);
                for err in &result.errors {
                    tracing::error!(key = %update.key, err = %err, "dropping invalid xds resource");
                }

                tracing::debug!(
                    key = %update.key,
                    resources = result.table.len(),
                    "compiled xds resources"
                );
                self.xds.store(update.key, Arc::new(result.table));
            }
        }

        Ok(())
    }
}
