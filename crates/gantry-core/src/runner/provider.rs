use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;

use gantry_api::ControllerResources;
use tokio_util::sync::CancellationToken;

use crate::runner::{next_updates, Stores};
use crate::translator::{TranslateResult, Translator};
use crate::watchable::WatchableStore;
use crate::{Error, Result};

/// Translates the Resource Graph for a single controller into IR and
/// statuses.
pub(super) struct ProviderRunner {
    pub(super) controller_name: String,
    pub(super) merge_gateways: bool,
    pub(super) stores: Stores,
}

impl ProviderRunner {
    pub(super) async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut sub = self.stores.provider.subscribe();

        while let Some(snapshot) = next_updates(&mut sub, &cancel).await {
            for update in snapshot.updates {
                if update.key != self.controller_name {
                    tracing::debug!(key = %update.key, "ignoring resources for another controller");
                    continue;
                }

                let resources = (!update.delete).then_some(update.value);
                self.reconcile(resources.as_deref());
            }
        }

        Ok(())
    }

    fn reconcile(&self, resources: Option<&ControllerResources>) {
        let result = resources.map(|r| self.translate(r)).unwrap_or_default();

        // keep the last good IR for anything that failed validation instead of
        // deleting it out from under the proxies.
        let mut invalid = BTreeSet::new();
        for err in &result.errors {
            if let Error::InvalidIr { key, .. } = err {
                invalid.insert(key.clone());
            }
            tracing::error!(err = %err, "dropping invalid ir");
        }

        let stores = &self.stores;
        replace_all(
            &stores.gateway_statuses,
            result
                .gateways
                .into_iter()
                .map(|g| (g.metadata.namespaced_name(), g.status)),
            |_| false,
        );
        replace_all(
            &stores.http_route_statuses,
            result
                .http_routes
                .into_iter()
                .map(|r| (r.metadata.namespaced_name(), r.status)),
            |_| false,
        );
        replace_all(
            &stores.grpc_route_statuses,
            result
                .grpc_routes
                .into_iter()
                .map(|r| (r.metadata.namespaced_name(), r.status)),
            |_| false,
        );

        replace_all(
            &stores.infra_ir,
            result.infra_ir.into_iter().map(|(k, v)| (k, Arc::new(v))),
            |k| invalid.contains(k),
        );
        replace_all(
            &stores.xds_ir,
            result.xds_ir.into_iter().map(|(k, v)| (k, Arc::new(v))),
            |k| invalid.contains(k),
        );
    }

    fn translate(&self, resources: &ControllerResources) -> TranslateResult {
        let mut merged = TranslateResult::default();

        for resources in resources.iter() {
            let translator = Translator::new(
                &self.controller_name,
                resources.class_name(),
                self.merge_gateways,
            );
            let result = translator.translate(resources);

            merged.gateways.extend(result.gateways);
            merged.http_routes.extend(result.http_routes);
            merged.grpc_routes.extend(result.grpc_routes);
            merged.xds_ir.extend(result.xds_ir);
            merged.infra_ir.extend(result.infra_ir);
            merged.errors.extend(result.errors);
        }

        tracing::debug!(
            gateways = merged.gateways.len(),
            xds_ir = merged.xds_ir.len(),
            "translated resources"
        );
        merged
    }
}

/// Replace the contents of a store with `values`.
///
/// Keys that are in the store but not in `values` are deleted, unless `keep`
/// returns true for them. The list of keys to delete is computed before
/// anything is stored.
fn replace_all<K, V>(
    store: &WatchableStore<K, V>,
    values: impl IntoIterator<Item = (K, V)>,
    keep: impl Fn(&K) -> bool,
) where
    K: Ord + Clone + Display,
    V: Clone + PartialEq,
{
    let mut stale: BTreeSet<K> = store.load_all().into_keys().collect();

    for (key, value) in values {
        stale.remove(&key);
        store.store(key, value);
    }

    for key in stale.iter().filter(|k| !keep(k)) {
        tracing::debug!(%key, "deleting stale key");
        store.delete(key);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_replace_all() {
        let store: WatchableStore<String, u32> = WatchableStore::new();
        store.store("a".to_string(), 1);
        store.store("b".to_string(), 2);
        store.store("c".to_string(), 3);

        replace_all(
            &store,
            [("a".to_string(), 10), ("d".to_string(), 4)],
            |k| k == "c",
        );

        let all: Vec<_> = store.load_all().into_iter().collect();
        assert_eq!(
            all,
            vec![
                ("a".to_string(), 10),
                ("c".to_string(), 3),
                ("d".to_string(), 4)
            ]
        );
    }
}
