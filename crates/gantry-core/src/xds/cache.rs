//! The snapshot cache.
//!
//! The cache keeps the latest [Snapshot] for every logical gateway and the
//! set of proxies currently connected. Proxies are grouped by the cluster
//! label they present on their first request, and every proxy in a cluster
//! is always offered the same snapshot.
//!
//! Nothing is retained per proxy once its stream closes. A proxy that
//! reconnects is simply offered the latest snapshot for its cluster again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use xds_api::pb::envoy::config::core::v3 as xds_core;

use crate::xds::ResourceVersionTable;
use crate::{Error, Result};

macro_rules! no_poison {
    ($guard:expr) => {
        $guard.expect("snapshot cache was poisoned: this is a bug in Gantry")
    };
}

/// An immutable, versioned set of resources.
#[derive(Debug, PartialEq)]
pub struct Snapshot {
    pub version: String,
    pub resources: ResourceVersionTable,
    fingerprint: u64,
}

/// The identity a proxy presents on its first request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Node {
    pub id: String,

    /// The cluster label of the proxy. This is the key of the logical
    /// gateway it serves.
    pub cluster: String,
}

impl Node {
    fn from_xds(node: &xds_core::Node) -> Option<Self> {
        if node.id.is_empty() {
            return None;
        }

        Some(Self {
            id: node.id.clone(),
            cluster: node.cluster.clone(),
        })
    }
}

type StreamId = u64;

#[derive(Debug, Default)]
struct CacheState {
    // the last version handed out. never reused, even across clusters.
    version: i64,
    snapshots: BTreeMap<String, Arc<Snapshot>>,
    streams: BTreeMap<StreamId, StreamRecord>,
}

#[derive(Debug)]
struct StreamRecord {
    node: Option<Node>,
    snapshots: watch::Sender<Option<Arc<Snapshot>>>,
}

impl CacheState {
    fn next_version(&mut self) -> i64 {
        self.version = match self.version {
            i64::MAX => 1,
            v => v + 1,
        };
        self.version
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    state: Mutex<CacheState>,
    next_stream: AtomicU64,
    next_nonce: AtomicU64,
}

/// A cache of snapshots and the proxies they're served to.
///
/// Cloning a `SnapshotCache` is cheap, and every clone shares the same
/// state.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCache {
    inner: Arc<CacheInner>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new proxy stream.
    ///
    /// The stream is unregistered when the returned handle is dropped.
    pub fn open_stream(&self) -> StreamHandle {
        let id = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);

        let mut state = no_poison!(self.inner.state.lock());
        state.streams.insert(
            id,
            StreamRecord {
                node: None,
                snapshots: tx,
            },
        );
        tracing::trace!(stream_id = id, "stream opened");

        StreamHandle {
            id,
            cache: self.clone(),
            snapshots: rx,
        }
    }

    fn close_stream(&self, id: StreamId) {
        let mut state = no_poison!(self.inner.state.lock());
        if let Some(record) = state.streams.remove(&id) {
            tracing::debug!(
                stream_id = id,
                node_id = record.node.as_ref().map(|n| n.id.as_str()),
                "stream closed",
            );
        }
    }

    /// Record the node identity for a stream and assign it the latest
    /// snapshot for its cluster, if there is one.
    fn set_node(&self, id: StreamId, node: Node) {
        let mut state = no_poison!(self.inner.state.lock());
        let snapshot = state.snapshots.get(&node.cluster).cloned();

        let Some(record) = state.streams.get_mut(&id) else {
            return;
        };

        match &snapshot {
            Some(snapshot) => tracing::debug!(
                node_id = %node.id,
                cluster = %node.cluster,
                version = %snapshot.version,
                "assigned snapshot to node",
            ),
            None => tracing::debug!(
                node_id = %node.id,
                cluster = %node.cluster,
                "no snapshot for node cluster yet",
            ),
        }

        record.node = Some(node);
        record.snapshots.send_replace(snapshot);
    }

    /// Publish a new snapshot for a logical gateway and push it to every
    /// connected proxy in that cluster. Passing `None` deletes the
    /// gateway's snapshot.
    ///
    /// Publishing resources identical to the current snapshot doesn't create
    /// a new version.
    pub fn generate_new_snapshot(&self, cluster: &str, resources: Option<ResourceVersionTable>) {
        let mut state = no_poison!(self.inner.state.lock());

        let snapshot = match resources {
            Some(resources) => {
                let fingerprint = resources.fingerprint();
                if let Some(current) = state.snapshots.get(cluster) {
                    if current.fingerprint == fingerprint && current.resources == resources {
                        tracing::debug!(%cluster, version = %current.version, "snapshot unchanged");
                        return;
                    }
                }

                let version = state.next_version().to_string();
                let snapshot = Arc::new(Snapshot {
                    version,
                    resources,
                    fingerprint,
                });
                state.snapshots.insert(cluster.to_string(), snapshot.clone());
                Some(snapshot)
            }
            None => {
                if state.snapshots.remove(cluster).is_none() {
                    return;
                }
                None
            }
        };

        let mut pushed = 0;
        for record in state.streams.values() {
            if record.node.as_ref().is_some_and(|n| n.cluster == cluster) {
                record.snapshots.send_replace(snapshot.clone());
                pushed += 1;
            }
        }

        match &snapshot {
            Some(snapshot) => tracing::info!(
                %cluster,
                version = %snapshot.version,
                resources = snapshot.resources.len(),
                nodes = pushed,
                "generated snapshot",
            ),
            None => tracing::info!(%cluster, nodes = pushed, "deleted snapshot"),
        }
    }

    /// The latest snapshot for a cluster.
    pub fn snapshot(&self, cluster: &str) -> Option<Arc<Snapshot>> {
        let state = no_poison!(self.inner.state.lock());
        state.snapshots.get(cluster).cloned()
    }

    /// The version of the latest snapshot for a cluster.
    pub fn last_version(&self, cluster: &str) -> Option<String> {
        self.snapshot(cluster).map(|s| s.version.clone())
    }

    /// Every connected node that has identified itself.
    pub fn nodes(&self) -> Vec<Node> {
        let state = no_poison!(self.inner.state.lock());
        state.streams.values().filter_map(|r| r.node.clone()).collect()
    }

    pub(crate) fn next_nonce(&self) -> String {
        self.inner.next_nonce.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// A registered proxy stream.
///
/// Dropping the handle removes the stream and its node from the cache.
#[derive(Debug)]
pub struct StreamHandle {
    id: StreamId,
    cache: SnapshotCache,
    snapshots: watch::Receiver<Option<Arc<Snapshot>>>,
}

impl StreamHandle {
    /// Identify the proxy on the other end of this stream.
    ///
    /// The first request on every stream must carry a node with an id. This
    /// is a protocol error otherwise.
    pub fn identify(&self, node: Option<&xds_core::Node>) -> Result<Node> {
        let node = node
            .and_then(Node::from_xds)
            .ok_or(Error::Protocol("the first request on a stream must identify its node"))?;

        self.cache.set_node(self.id, node.clone());
        Ok(node)
    }

    /// The snapshot currently assigned to this stream.
    pub fn current(&mut self) -> Option<Arc<Snapshot>> {
        self.snapshots.borrow_and_update().clone()
    }

    /// Wait for a new snapshot to be assigned to this stream.
    ///
    /// Returns an error if the cache has been dropped.
    pub async fn changed(&mut self) -> std::result::Result<(), watch::error::RecvError> {
        self.snapshots.changed().await
    }

    pub(crate) fn next_nonce(&self) -> String {
        self.cache.next_nonce()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cache.close_stream(self.id);
    }
}
