//! The xDS gRPC server.
//!
//! Every proxy stream, whether it's an aggregated ADS stream or one of the
//! per-type discovery services, is handled by the same [XdsConnection] state
//! machine. The per-type services only accept requests for their own type.
//!
//! Only state-of-the-world xDS is served. Delta and unary fetch requests are
//! rejected as unimplemented.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};
use xds_api::pb::envoy::service::cluster::v3::cluster_discovery_service_server::{
    ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use xds_api::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::{
        AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
    },
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use xds_api::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::{
    EndpointDiscoveryService, EndpointDiscoveryServiceServer,
};
use xds_api::pb::envoy::service::listener::v3::listener_discovery_service_server::{
    ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};
use xds_api::pb::envoy::service::route::v3::route_discovery_service_server::{
    RouteDiscoveryService, RouteDiscoveryServiceServer,
};
use xds_api::pb::envoy::service::runtime::v3::runtime_discovery_service_server::{
    RuntimeDiscoveryService, RuntimeDiscoveryServiceServer,
};
use xds_api::pb::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};

use crate::xds::cache::{Node, Snapshot, SnapshotCache, StreamHandle};
use crate::xds::ResourceType;
use crate::Error;

/// Configuration for the xDS server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,

    /// How often to send HTTP/2 keepalive pings to connected proxies.
    pub keepalive_interval: Option<Duration>,

    /// How long to wait for a keepalive ping to be acknowledged before
    /// closing the connection.
    pub keepalive_timeout: Option<Duration>,

    /// Serve over mutual TLS. When unset the server is plaintext, which is
    /// only fit for local development and tests.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 18000)),
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_timeout: Some(Duration::from_secs(5)),
            tls: None,
        }
    }
}

/// PEM encoded server credentials. Proxies must present a certificate signed
/// by `client_ca`.
#[derive(Clone)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
    pub client_ca: String,
}

impl TlsConfig {
    /// Load PEM encoded credentials from disk.
    pub fn from_files(
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
        client_ca: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        Ok(Self {
            cert: read_pem(cert.as_ref())?,
            key: read_pem(key.as_ref())?,
            client_ca: read_pem(client_ca.as_ref())?,
        })
    }
}

fn read_pem(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.display().to_string(),
        source,
    })
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

/// Serve xDS from `cache` until `shutdown` completes.
pub async fn serve(
    cache: SnapshotCache,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Error> {
    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(xds_api::FILE_DESCRIPTOR_SET)
        .with_service_name("envoy.service.discovery.v3.AggregatedDiscoveryService")
        .build()
        .expect("xds_api contains a valid file descriptor set");

    let mut builder = tonic::transport::Server::builder()
        .http2_keepalive_interval(config.keepalive_interval)
        .http2_keepalive_timeout(config.keepalive_timeout);

    match &config.tls {
        Some(tls) => {
            let tls_config = ServerTlsConfig::new()
                .identity(Identity::from_pem(&tls.cert, &tls.key))
                .client_ca_root(Certificate::from_pem(&tls.client_ca));
            builder = builder.tls_config(tls_config)?;
        }
        None => tracing::warn!("serving xds without TLS"),
    }

    let server = Server { cache };

    tracing::info!(
        address = %config.address,
        tls = config.tls.is_some(),
        "starting xds server"
    );
    builder
        .add_service(reflection)
        .add_service(AggregatedDiscoveryServiceServer::new(server.clone()))
        .add_service(ClusterDiscoveryServiceServer::new(server.clone()))
        .add_service(EndpointDiscoveryServiceServer::new(server.clone()))
        .add_service(ListenerDiscoveryServiceServer::new(server.clone()))
        .add_service(RouteDiscoveryServiceServer::new(server.clone()))
        .add_service(SecretDiscoveryServiceServer::new(server.clone()))
        .add_service(RuntimeDiscoveryServiceServer::new(server))
        .serve_with_shutdown(config.address, shutdown)
        .await?;

    tracing::info!("xds server stopped");
    Ok(())
}

#[derive(Clone)]
struct Server {
    cache: SnapshotCache,
}

type DiscoveryResponseStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;

type DeltaDiscoveryResponseStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

impl Server {
    fn stream(
        &self,
        requests: Streaming<DiscoveryRequest>,
        only: Option<ResourceType>,
    ) -> DiscoveryResponseStream {
        let (tx, rx) = mpsc::channel(16);
        let conn = XdsConnection::new(self.cache.open_stream(), only);

        tokio::spawn(async move {
            if let Err(status) = conn.run(requests, &tx).await {
                let _ = tx.send(Err(status)).await;
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for Server {
    type StreamAggregatedResourcesStream = DiscoveryResponseStream;
    type DeltaAggregatedResourcesStream = DeltaDiscoveryResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        tracing::debug!(remote_addr = ?request.remote_addr(), "new ads stream");
        Ok(Response::new(self.stream(request.into_inner(), None)))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xds is not supported"))
    }
}

/// Implement a single-type discovery service by delegating to the shared
/// stream handler.
macro_rules! typed_discovery_service {
    (
        $service:ident,
        $resource_type:expr,
        $stream_ty:ident => $stream_fn:ident,
        $delta_ty:ident => $delta_fn:ident,
        $fetch_fn:ident $(,)?
    ) => {
        #[tonic::async_trait]
        impl $service for Server {
            type $stream_ty = DiscoveryResponseStream;
            type $delta_ty = DeltaDiscoveryResponseStream;

            async fn $stream_fn(
                &self,
                request: Request<Streaming<DiscoveryRequest>>,
            ) -> Result<Response<Self::$stream_ty>, Status> {
                tracing::debug!(
                    remote_addr = ?request.remote_addr(),
                    type_url = $resource_type.type_url(),
                    "new xds stream",
                );
                Ok(Response::new(
                    self.stream(request.into_inner(), Some($resource_type)),
                ))
            }

            async fn $delta_fn(
                &self,
                _request: Request<Streaming<DeltaDiscoveryRequest>>,
            ) -> Result<Response<Self::$delta_ty>, Status> {
                Err(Status::unimplemented("delta xds is not supported"))
            }

            async fn $fetch_fn(
                &self,
                _request: Request<DiscoveryRequest>,
            ) -> Result<Response<DiscoveryResponse>, Status> {
                Err(Status::unimplemented("fetching xds is not supported"))
            }
        }
    };
}

typed_discovery_service!(
    ClusterDiscoveryService,
    ResourceType::Cluster,
    StreamClustersStream => stream_clusters,
    DeltaClustersStream => delta_clusters,
    fetch_clusters,
);

typed_discovery_service!(
    EndpointDiscoveryService,
    ResourceType::ClusterLoadAssignment,
    StreamEndpointsStream => stream_endpoints,
    DeltaEndpointsStream => delta_endpoints,
    fetch_endpoints,
);

typed_discovery_service!(
    ListenerDiscoveryService,
    ResourceType::Listener,
    StreamListenersStream => stream_listeners,
    DeltaListenersStream => delta_listeners,
    fetch_listeners,
);

typed_discovery_service!(
    RouteDiscoveryService,
    ResourceType::RouteConfiguration,
    StreamRoutesStream => stream_routes,
    DeltaRoutesStream => delta_routes,
    fetch_routes,
);

typed_discovery_service!(
    SecretDiscoveryService,
    ResourceType::Secret,
    StreamSecretsStream => stream_secrets,
    DeltaSecretsStream => delta_secrets,
    fetch_secrets,
);

typed_discovery_service!(
    RuntimeDiscoveryService,
    ResourceType::Runtime,
    StreamRuntimeStream => stream_runtime,
    DeltaRuntimeStream => delta_runtime,
    fetch_runtime,
);

macro_rules! log_request {
    ($node:expr, $request:expr) => {
        tracing::trace!(
            node_id = $node.map(|n: &Node| n.id.as_str()),
            nack = $request.error_detail.is_some(),
            "DiscoveryRequest(v={:?}, n={:?}, ty={:?}, r={:?})",
            $request.version_info,
            $request.response_nonce,
            $request.type_url,
            $request.resource_names,
        );
    };
}

/// What a stream has asked for and been sent for a single resource type.
#[derive(Debug, Default)]
struct Subscription {
    names: Vec<String>,
    sent_version: Option<String>,
    nonce: Option<String>,
}

/// The protocol state of a single proxy stream.
///
/// Handling requests and snapshots never blocks and never does IO: every
/// call returns the responses that should be sent to the proxy.
pub(crate) struct XdsConnection {
    handle: StreamHandle,
    only: Option<ResourceType>,
    node: Option<Node>,
    subscriptions: BTreeMap<ResourceType, Subscription>,
}

impl XdsConnection {
    pub(crate) fn new(handle: StreamHandle, only: Option<ResourceType>) -> Self {
        Self {
            handle,
            only,
            node: None,
            subscriptions: BTreeMap::new(),
        }
    }

    async fn run(
        mut self,
        mut requests: Streaming<DiscoveryRequest>,
        tx: &mpsc::Sender<Result<DiscoveryResponse, Status>>,
    ) -> Result<(), Status> {
        loop {
            let responses = tokio::select! {
                biased;

                _ = tx.closed() => return Ok(()),
                request = requests.message() => match request {
                    Ok(Some(request)) => self.handle_request(request)?,
                    Ok(None) => return Ok(()),
                    Err(status) => {
                        tracing::debug!(
                            node_id = self.node_id(),
                            err = %status,
                            "xds stream closed with an error",
                        );
                        return Ok(());
                    }
                },
                changed = self.handle.changed() => {
                    // the cache is gone, the server is shutting down
                    if changed.is_err() {
                        return Ok(());
                    }
                    self.handle_snapshot()
                },
            };

            for response in responses {
                if tx.send(Ok(response)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    fn node_id(&self) -> Option<&str> {
        self.node.as_ref().map(|n| n.id.as_str())
    }

    /// Handle a request from the proxy.
    ///
    /// Returns an error if the request breaks the protocol badly enough that
    /// the stream should be closed.
    pub(crate) fn handle_request(
        &mut self,
        request: DiscoveryRequest,
    ) -> Result<Vec<DiscoveryResponse>, Status> {
        log_request!(self.node.as_ref(), request);

        if self.node.is_none() {
            match self.handle.identify(request.node.as_ref()) {
                Ok(node) => {
                    tracing::info!(node_id = %node.id, cluster = %node.cluster, "node connected");
                    self.node = Some(node);
                }
                Err(e) => {
                    tracing::warn!(err = %e, "closing xds stream");
                    return Err(Status::invalid_argument(e.to_string()));
                }
            }
        }

        let resource_type = match (self.only, request.type_url.as_str()) {
            (Some(only), "") => only,
            (only, type_url) => match ResourceType::from_type_url(type_url) {
                Some(rtype) if only.is_none() || only == Some(rtype) => rtype,
                _ => {
                    let err = Error::UnknownResourceType(type_url.to_string());
                    tracing::warn!(node_id = self.node_id(), err = %err, "ignoring request");
                    return Ok(vec![]);
                }
            },
        };

        let sub = self.subscriptions.entry(resource_type).or_default();

        if !request.response_nonce.is_empty() {
            // a response to something other than the latest push. the proxy
            // will get around to the latest one.
            if sub.nonce.as_deref() != Some(request.response_nonce.as_str()) {
                tracing::trace!(
                    node_id = self.node.as_ref().map(|n| n.id.as_str()),
                    nonce = %request.response_nonce,
                    "ignoring stale request",
                );
                return Ok(vec![]);
            }

            if let Some(error) = &request.error_detail {
                tracing::warn!(
                    node_id = self.node.as_ref().map(|n| n.id.as_str()),
                    type_url = resource_type.type_url(),
                    version = %request.version_info,
                    nonce = %request.response_nonce,
                    err = %error.message,
                    "proxy rejected config",
                );
                sub.names = request.resource_names;
                return Ok(vec![]);
            }

            tracing::debug!(
                node_id = self.node.as_ref().map(|n| n.id.as_str()),
                type_url = resource_type.type_url(),
                version = %request.version_info,
                "proxy accepted config",
            );
        }

        // a new subscription always gets a response. a changed subscription
        // gets one even if the version hasn't moved.
        let force = request.response_nonce.is_empty() || sub.names != request.resource_names;
        sub.names = request.resource_names;

        let snapshot = self.handle.current();
        Ok(self.respond(snapshot.as_deref(), resource_type, force).into_iter().collect())
    }

    /// Handle a new snapshot being assigned to this stream, returning
    /// a response for every subscribed type that hasn't been sent this
    /// version yet.
    pub(crate) fn handle_snapshot(&mut self) -> Vec<DiscoveryResponse> {
        let snapshot = self.handle.current();
        let types: Vec<_> = self.subscriptions.keys().copied().collect();

        types
            .into_iter()
            .filter_map(|rtype| self.respond(snapshot.as_deref(), rtype, false))
            .collect()
    }

    fn respond(
        &mut self,
        snapshot: Option<&Snapshot>,
        resource_type: ResourceType,
        force: bool,
    ) -> Option<DiscoveryResponse> {
        let snapshot = snapshot?;
        let sub = self.subscriptions.get_mut(&resource_type)?;

        if !force && sub.sent_version.as_deref() == Some(snapshot.version.as_str()) {
            return None;
        }

        let nonce = self.handle.next_nonce();

        let response = DiscoveryResponse {
            version_info: snapshot.version.clone(),
            resources: snapshot.resources.resources(resource_type, &sub.names),
            type_url: resource_type.type_url().to_string(),
            nonce: nonce.clone(),
            ..Default::default()
        };

        tracing::debug!(
            node_id = self.node.as_ref().map(|n| n.id.as_str()),
            "DiscoveryResponse(v={:?}, n={:?}, ty={:?}, r={})",
            response.version_info,
            response.nonce,
            response.type_url,
            response.resources.len(),
        );

        sub.sent_version = Some(snapshot.version.clone());
        sub.nonce = Some(nonce);
        Some(response)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xds::test::{ack, discovery_request, nack, node, table};

    fn connect(
        cache: &SnapshotCache,
        rtype: ResourceType,
        cluster: &str,
    ) -> (XdsConnection, Vec<DiscoveryResponse>) {
        let mut conn = XdsConnection::new(cache.open_stream(), None);
        let responses = conn
            .handle_request(discovery_request!(rtype, node = node("envoy-1", cluster)))
            .unwrap();
        (conn, responses)
    }

    #[test]
    fn test_tls_config_missing_file() {
        let err = TlsConfig::from_files(
            "/does/not/exist.crt",
            "/does/not/exist.key",
            "/does/not/exist-ca.crt",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io { path, .. } if path == "/does/not/exist.crt"));
    }

    #[test]
    fn test_first_request_needs_node() {
        let cache = SnapshotCache::new();
        let mut conn = XdsConnection::new(cache.open_stream(), None);

        let err = conn
            .handle_request(discovery_request!(ResourceType::Cluster))
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(cache.nodes().is_empty());
    }

    #[test]
    fn test_snapshot_assignment() {
        let cache = SnapshotCache::new();

        // nothing is sent until there's a snapshot
        let (mut conn, responses) = connect(&cache, ResourceType::Cluster, "default/gw");
        assert!(responses.is_empty());
        assert!(conn.handle_snapshot().is_empty());

        cache.generate_new_snapshot("default/gw", Some(table(&["svc-a_8080"])));
        let responses = conn.handle_snapshot();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].version_info, "1");
        assert_eq!(responses[0].resources.len(), 1);

        // exactly once
        assert!(conn.handle_snapshot().is_empty());
    }

    #[test]
    fn test_existing_snapshot_sent_on_subscribe() {
        let cache = SnapshotCache::new();
        cache.generate_new_snapshot("default/gw", Some(table(&["svc-a_8080", "svc-b_8080"])));

        let (_conn, responses) = connect(&cache, ResourceType::Cluster, "default/gw");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].version_info, "1");
        assert_eq!(responses[0].resources.len(), 2);
    }

    #[test]
    fn test_empty_type_answers_at_version() {
        let cache = SnapshotCache::new();
        cache.generate_new_snapshot("default/gw", Some(table(&["svc-a_8080"])));

        let (_conn, responses) = connect(&cache, ResourceType::Secret, "default/gw");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].version_info, "1");
        assert!(responses[0].resources.is_empty());
    }

    #[test]
    fn test_ack_and_nack() {
        let cache = SnapshotCache::new();
        cache.generate_new_snapshot("default/gw", Some(table(&["svc-a_8080"])));
        let (mut conn, responses) = connect(&cache, ResourceType::Cluster, "default/gw");

        // ACKs don't trigger a response
        let responses = conn.handle_request(ack(&responses[0], &[])).unwrap();
        assert!(responses.is_empty());

        cache.generate_new_snapshot("default/gw", Some(table(&["svc-b_8080"])));
        let responses = conn.handle_snapshot();
        assert_eq!(responses[0].version_info, "2");

        // NACKs don't either, and the rejected version isn't resent
        let next = conn.handle_request(nack(&responses[0], "1")).unwrap();
        assert!(next.is_empty());
        assert!(conn.handle_snapshot().is_empty());

        // a new version goes out after a NACK
        cache.generate_new_snapshot("default/gw", Some(table(&["svc-c_8080"])));
        let responses = conn.handle_snapshot();
        assert_eq!(responses[0].version_info, "3");
    }

    #[test]
    fn test_stale_nonce_ignored() {
        let cache = SnapshotCache::new();
        cache.generate_new_snapshot("default/gw", Some(table(&["svc-a_8080"])));
        let (mut conn, first) = connect(&cache, ResourceType::Cluster, "default/gw");

        cache.generate_new_snapshot("default/gw", Some(table(&["svc-b_8080"])));
        let second = conn.handle_snapshot();
        assert_eq!(second.len(), 1);

        // an ACK for the first response with different names is stale
        let responses = conn.handle_request(ack(&first[0], &["svc-a_8080"])).unwrap();
        assert!(responses.is_empty());
    }

    #[test]
    fn test_resource_names_change() {
        let cache = SnapshotCache::new();
        cache.generate_new_snapshot("default/gw", Some(table(&["svc-a_8080", "svc-b_8080"])));
        let (mut conn, responses) = connect(&cache, ResourceType::Cluster, "default/gw");
        assert_eq!(responses[0].resources.len(), 2);

        let responses = conn.handle_request(ack(&responses[0], &["svc-b_8080"])).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].version_info, "1");
        assert_eq!(responses[0].resources.len(), 1);
    }

    #[test]
    fn test_typed_stream_rejects_other_types() {
        let cache = SnapshotCache::new();
        cache.generate_new_snapshot("default/gw", Some(table(&["svc-a_8080"])));
        let mut conn = XdsConnection::new(cache.open_stream(), Some(ResourceType::Cluster));

        let responses = conn
            .handle_request(discovery_request!(
                ResourceType::Listener,
                node = node("envoy-1", "default/gw")
            ))
            .unwrap();
        assert!(responses.is_empty());

        let mut request = discovery_request!(ResourceType::Cluster);
        request.type_url = String::new();
        let responses = conn.handle_request(request).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].type_url, ResourceType::Cluster.type_url());
    }

    #[test]
    fn test_clusters_isolated() {
        let cache = SnapshotCache::new();
        let (mut a, _) = connect(&cache, ResourceType::Cluster, "default/a");
        let (mut b, _) = connect(&cache, ResourceType::Cluster, "default/b");

        cache.generate_new_snapshot("default/a", Some(table(&["svc-a_8080"])));
        assert_eq!(a.handle_snapshot().len(), 1);
        assert!(b.handle_snapshot().is_empty());
    }
}
