//! Pipeline runners.
//!
//! A runner subscribes to one [WatchableStore], performs a side effect for
//! every update it sees, and publishes the results into the next store. Runners
//! share nothing but the stores they're wired to, and each one runs as its own
//! task so a runner that fails doesn't take its siblings down with it.
//!
//! [Pipeline] wires every store and runner together.

use std::future::Future;
use std::sync::Arc;

use gantry_api::gateway::GatewayStatus;
use gantry_api::ir;
use gantry_api::route::RouteStatus;
use gantry_api::{ControllerResources, NamespacedName};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backoff::Backoff;
use crate::infra::InfraManager;
use crate::watchable::{self, Subscription, WatchableStore};
use crate::xds::{ResourceVersionTable, ServerConfig, SnapshotCache};
use crate::Result;

mod infra;
mod provider;
mod xds_server;
mod xds_translator;

/// Resource Graphs, keyed by the name of the controller they belong to.
pub type ProviderStore = WatchableStore<String, Arc<ControllerResources>>;

/// XDS IR, keyed by logical gateway.
pub type XdsIrStore = WatchableStore<String, Arc<ir::Xds>>;

/// Infra IR, keyed by logical gateway.
pub type InfraIrStore = WatchableStore<String, Arc<ir::Infra>>;

/// Compiled xDS resources, keyed by logical gateway.
pub type XdsStore = WatchableStore<String, Arc<ResourceVersionTable>>;

pub type GatewayStatusStore = WatchableStore<NamespacedName, GatewayStatus>;

pub type RouteStatusStore = WatchableStore<NamespacedName, RouteStatus>;

/// Every store in the pipeline.
///
/// Cloning `Stores` is cheap, and clones share the same underlying stores.
#[derive(Clone, Default)]
pub struct Stores {
    pub provider: ProviderStore,
    pub xds_ir: XdsIrStore,
    pub infra_ir: InfraIrStore,
    pub xds: XdsStore,
    pub gateway_statuses: GatewayStatusStore,
    pub http_route_statuses: RouteStatusStore,
    pub grpc_route_statuses: RouteStatusStore,
}

impl Stores {
    /// Close every store, ending all subscriptions.
    pub fn close(&self) {
        self.provider.close();
        self.xds_ir.close();
        self.infra_ir.close();
        self.xds.close();
        self.gateway_statuses.close();
        self.http_route_statuses.close();
        self.grpc_route_statuses.close();
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The name this controller writes into statuses. Only the Resource Graph
    /// stored under this name in the provider store is translated.
    pub controller_name: String,

    pub merge_gateways: bool,

    /// Serve xDS. When unset, snapshots are still generated but nothing
    /// listens for proxies.
    pub xds_server: Option<ServerConfig>,

    /// How to retry binding the xDS server.
    pub backoff: Backoff,
}

/// Every store and runner in a Gantry controller.
#[derive(Clone, Default)]
pub struct Pipeline {
    pub stores: Stores,
    pub cache: SnapshotCache,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn every runner. Runners stop when `cancel` is cancelled.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn start<M: InfraManager>(
        &self,
        config: PipelineConfig,
        infra: M,
        cancel: &CancellationToken,
    ) -> RunningPipeline {
        let provider = provider::ProviderRunner {
            controller_name: config.controller_name,
            merge_gateways: config.merge_gateways,
            stores: self.stores.clone(),
        };
        let infra = infra::InfraRunner {
            infra_ir: self.stores.infra_ir.clone(),
            manager: infra,
        };
        let xds_translator = xds_translator::XdsTranslatorRunner {
            xds_ir: self.stores.xds_ir.clone(),
            xds: self.stores.xds.clone(),
        };
        let xds_server = xds_server::XdsServerRunner {
            xds: self.stores.xds.clone(),
            cache: self.cache.clone(),
            server: config.xds_server,
            backoff: config.backoff,
        };

        let handles = vec![
            spawn("provider", provider.run(cancel.child_token())),
            spawn("infra", infra.run(cancel.child_token())),
            spawn("xds-translator", xds_translator.run(cancel.child_token())),
            spawn("xds-server", xds_server.run(cancel.child_token())),
        ];

        RunningPipeline { handles }
    }
}

/// The runners of a started [Pipeline].
pub struct RunningPipeline {
    handles: Vec<JoinHandle<()>>,
}

impl RunningPipeline {
    /// Wait for every runner to exit.
    pub async fn wait(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(err = %e, "runner panicked");
            }
        }
    }
}

fn spawn<F>(name: &'static str, runner: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let span = tracing::info_span!("runner", runner = name);
    tokio::spawn(
        async move {
            tracing::info!("runner started");
            match runner.await {
                Ok(()) => tracing::info!("runner stopped"),
                Err(e) => tracing::error!(err = %e, "runner failed"),
            }
        }
        .instrument(span),
    )
}

/// Wait for the next batch of updates on a subscription. Returns `None` when
/// the runner should stop, either because it was cancelled or because the
/// store was closed.
async fn next_updates<K, V>(
    sub: &mut Subscription<K, V>,
    cancel: &CancellationToken,
) -> Option<watchable::Snapshot<K, V>> {
    tokio::select! {
        biased;

        _ = cancel.cancelled() => None,
        snapshot = sub.recv() => snapshot,
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    const CONTROLLER: &str = "gantry.io/gateway-controller";

    const RESOURCES: &str = r#"
- gatewayClass:
    metadata:
      name: gantry
    spec:
      controllerName: gantry.io/gateway-controller
  gateways:
    - metadata:
        namespace: default
        name: gw
      spec:
        gatewayClassName: gantry
        listeners:
          - name: http
            port: 80
            protocol: HTTP
  httpRoutes:
    - metadata:
        namespace: default
        name: route-a
      spec:
        parentRefs:
          - name: gw
        rules:
          - backendRefs:
              - group: gantry.io
                kind: Backend
                name: svc-a
  backends:
    - metadata:
        namespace: default
        name: svc-a
      spec:
        services:
          - host: 10.0.0.1
            port: 8080
"#;

    #[derive(Clone, Default)]
    struct RecordingInfra {
        live: Arc<Mutex<BTreeSet<String>>>,
    }

    impl InfraManager for RecordingInfra {
        async fn create_or_update(&self, infra: &ir::Infra) -> Result<()> {
            self.live.lock().unwrap().insert(infra.name.clone());
            Ok(())
        }

        async fn delete(&self, infra: &ir::Infra) -> Result<()> {
            self.live.lock().unwrap().remove(&infra.name);
            Ok(())
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            controller_name: CONTROLLER.to_string(),
            merge_gateways: false,
            xds_server: None,
            backoff: Backoff::default(),
        }
    }

    async fn eventually(mut f: impl FnMut() -> bool) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_pipeline_propagates_deletes() {
        let pipeline = Pipeline::new();
        let infra = RecordingInfra::default();
        let cancel = CancellationToken::new();
        let running = pipeline.start(config(), infra.clone(), &cancel);

        let resources: ControllerResources = serde_yml::from_str(RESOURCES).unwrap();
        pipeline
            .stores
            .provider
            .store(CONTROLLER.to_string(), Arc::new(resources));

        eventually(|| pipeline.cache.snapshot("default/gw").is_some()).await;
        assert_eq!(pipeline.cache.last_version("default/gw").as_deref(), Some("1"));
        assert_eq!(pipeline.stores.xds_ir.len(), 1);
        assert_eq!(pipeline.stores.gateway_statuses.len(), 1);
        assert_eq!(pipeline.stores.http_route_statuses.len(), 1);
        eventually(|| infra.live.lock().unwrap().contains("default/gw")).await;

        let snapshot = pipeline.cache.snapshot("default/gw").unwrap();
        assert!(snapshot
            .resources
            .contains(crate::xds::ResourceType::Cluster, "10.0.0.1_8080"));

        pipeline.stores.provider.delete(&CONTROLLER.to_string());

        eventually(|| pipeline.cache.snapshot("default/gw").is_none()).await;
        assert!(pipeline.stores.xds_ir.is_empty());
        assert!(pipeline.stores.infra_ir.is_empty());
        assert!(pipeline.stores.xds.is_empty());
        assert!(pipeline.stores.gateway_statuses.is_empty());
        assert!(pipeline.stores.http_route_statuses.is_empty());
        eventually(|| infra.live.lock().unwrap().is_empty()).await;

        cancel.cancel();
        running.wait().await;
    }

    #[tokio::test]
    async fn test_invalid_ir_keeps_last_good_value() {
        let pipeline = Pipeline::new();
        let cancel = CancellationToken::new();
        let running = pipeline.start(config(), RecordingInfra::default(), &cancel);

        let mut resources: ControllerResources = serde_yml::from_str(RESOURCES).unwrap();
        let mut other = resources.0[0].gateways[0].clone();
        other.metadata.name = "gw-2".to_string();
        resources.0[0].gateways.push(other);
        pipeline
            .stores
            .provider
            .store(CONTROLLER.to_string(), Arc::new(resources.clone()));

        eventually(|| pipeline.stores.xds_ir.len() == 2).await;
        let last_good = pipeline.stores.xds_ir.load(&"default/gw".to_string());
        assert!(last_good.is_some());

        // break gw with a header match IR validation rejects, and change gw-2
        resources.0[0].http_routes[0].spec.rules[0].matches =
            serde_yml::from_str("- headers:\n    - name: \"\"\n      value: x").unwrap();
        resources.0[0].gateways[1].spec.listeners[0].hostname = Some("example.com".to_string());
        pipeline
            .stores
            .provider
            .store(CONTROLLER.to_string(), Arc::new(resources));

        eventually(|| {
            pipeline
                .stores
                .xds_ir
                .load(&"default/gw-2".to_string())
                .is_some_and(|x| x.http[0].hostnames == vec!["example.com"])
        })
        .await;
        assert_eq!(
            pipeline.stores.xds_ir.load(&"default/gw".to_string()),
            last_good
        );
        assert!(pipeline.cache.snapshot("default/gw").is_some());

        cancel.cancel();
        running.wait().await;
    }

    #[tokio::test]
    async fn test_other_controllers_ignored() {
        let pipeline = Pipeline::new();
        let cancel = CancellationToken::new();
        let running = pipeline.start(config(), RecordingInfra::default(), &cancel);

        let resources: ControllerResources = serde_yml::from_str(RESOURCES).unwrap();
        pipeline
            .stores
            .provider
            .store("someone-else".to_string(), Arc::new(resources));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pipeline.stores.xds_ir.is_empty());
        assert!(pipeline.cache.snapshot("default/gw").is_none());

        cancel.cancel();
        running.wait().await;
    }

    #[tokio::test]
    async fn test_closed_stores_stop_runners() {
        let pipeline = Pipeline::new();
        let cancel = CancellationToken::new();
        let running = pipeline.start(config(), RecordingInfra::default(), &cancel);

        pipeline.stores.close();
        tokio::time::timeout(Duration::from_secs(5), running.wait())
            .await
            .expect("runners should stop when their stores close");
    }
}
