use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::runner::{next_updates, XdsStore};
use crate::xds::{self, ServerConfig, SnapshotCache};
use crate::Result;

/// Publishes compiled resources into the snapshot cache and serves them.
pub(super) struct XdsServerRunner {
    pub(super) xds: XdsStore,
    pub(super) cache: SnapshotCache,
    pub(super) server: Option<ServerConfig>,
    pub(super) backoff: Backoff,
}

impl XdsServerRunner {
    pub(super) async fn run(self, cancel: CancellationToken) -> Result<()> {
        let updates = self.publish_snapshots(&cancel);

        let Some(config) = &self.server else {
            updates.await;
            return Ok(());
        };

        // if the server gives up, stop publishing too. nobody is listening.
        tokio::select! {
            _ = updates => Ok(()),
            res = self.serve(config, &cancel) => res,
        }
    }

    async fn publish_snapshots(&self, cancel: &CancellationToken) {
        let mut sub = self.xds.subscribe();

        while let Some(snapshot) = next_updates(&mut sub, cancel).await {
            for update in snapshot.updates {
                let resources = (!update.delete).then(|| update.value.as_ref().clone());
                self.cache.generate_new_snapshot(&update.key, resources);
            }
        }
    }

    async fn serve(&self, config: &ServerConfig, cancel: &CancellationToken) -> Result<()> {
        let serve = self.backoff.retry(|attempt| {
            let cache = self.cache.clone();
            let shutdown = cancel.clone().cancelled_owned();
            async move {
                if attempt > 1 {
                    tracing::info!(attempt, "restarting xds server");
                }
                xds::serve(cache, config, shutdown).await
            }
        });

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Ok(()),
            res = serve => res,
        }
    }
}
