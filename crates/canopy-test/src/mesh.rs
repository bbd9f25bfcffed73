//! In-process mesh of real nodes
//!
//! Every node runs its full event loop over a shared `MemoryNetwork`, so
//! handshakes, interest aggregation and publication routing all go through
//! the same code paths as over UDP. Nodes are addressed by port.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::time::Instant;

use canopy_core::{CanopyResult, KeyId, PubId, SubscriptionId};
use canopy_routing::{LinkId, LinkState};
use canopy_runtime::{MemoryNetwork, Node, NodeConfig, KeyStore, LinkSnapshot, NodeSnapshot};

/// How often wait helpers re-check their condition
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default bound for wait helpers
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// One delivery seen by a harness subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    pub subscription: SubscriptionId,
    pub pub_id: PubId,
    pub seq: u32,
    pub topics: Vec<String>,
    pub matched: Vec<String>,
    pub payload: Vec<u8>,
}

struct MeshNode {
    node: Node,
    addr: SocketAddr,
    inbox: Arc<Mutex<Vec<Received>>>,
}

/// A set of nodes sharing one network key
pub struct MeshHarness {
    network: MemoryNetwork,
    network_key: (KeyId, [u8; 32]),
    nodes: BTreeMap<u16, MeshNode>,
}

impl Default for MeshHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshHarness {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut key_id = [0u8; 16];
        let mut material = [0u8; 32];
        rng.fill_bytes(&mut key_id);
        rng.fill_bytes(&mut material);
        MeshHarness {
            network: MemoryNetwork::new(),
            network_key: (KeyId(key_id), material),
            nodes: BTreeMap::new(),
        }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Loopback address for `port`
    pub fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// A key store holding this mesh's network key
    pub fn keystore(&self) -> CanopyResult<KeyStore> {
        let store = KeyStore::new();
        store.set_network_key(self.network_key.0, &self.network_key.1)?;
        Ok(store)
    }

    /// Start a node on `port` with default configuration
    pub fn add_node(&mut self, port: u16) -> CanopyResult<SocketAddr> {
        let keystore = self.keystore()?;
        self.add_node_with(port, NodeConfig::default(), keystore)
    }

    /// Start a node with its own configuration and key store
    pub fn add_node_with(
        &mut self,
        port: u16,
        config: NodeConfig,
        keystore: KeyStore,
    ) -> CanopyResult<SocketAddr> {
        let node = Node::new(config, keystore)?;
        let addr = node.start_memory(&self.network, port)?;
        tracing::debug!(node = %node.node_id(), %addr, "mesh node started");
        self.nodes.insert(
            port,
            MeshNode {
                node,
                addr,
                inbox: Arc::new(Mutex::new(Vec::new())),
            },
        );
        Ok(addr)
    }

    /// Panics if no node runs on `port`
    pub fn node(&self, port: u16) -> &Node {
        &self.entry(port).node
    }

    fn entry(&self, port: u16) -> &MeshNode {
        match self.nodes.get(&port) {
            Some(entry) => entry,
            None => panic!("no mesh node on port {}", port),
        }
    }

    pub fn ports(&self) -> Vec<u16> {
        self.nodes.keys().copied().collect()
    }

    /// Give every node the same content key
    pub fn add_content_key(&self, key_id: KeyId, material: &[u8]) -> CanopyResult<()> {
        for entry in self.nodes.values() {
            entry.node.keystore().add_content_key(key_id, material)?;
        }
        Ok(())
    }

    /// Link `from` to `to` and wait for the handshake
    pub async fn link(&self, from: u16, to: u16) -> CanopyResult<LinkId> {
        self.node(from).link(self.entry(to).addr, None).await
    }

    /// Link each `(child, parent)` pair in order
    pub async fn build_tree(&self, edges: &[(u16, u16)]) -> CanopyResult<()> {
        for &(child, parent) in edges {
            self.link(child, parent).await?;
        }
        Ok(())
    }

    /// Subscribe on `port`, recording deliveries in that node's inbox
    pub async fn subscribe(&self, port: u16, patterns: &[&str]) -> CanopyResult<SubscriptionId> {
        self.subscribe_inner(port, patterns, false).await
    }

    /// As `subscribe`, answering every acknowledgement request with the
    /// publication's own payload
    pub async fn subscribe_acking(
        &self,
        port: u16,
        patterns: &[&str],
    ) -> CanopyResult<SubscriptionId> {
        self.subscribe_inner(port, patterns, true).await
    }

    async fn subscribe_inner(
        &self,
        port: u16,
        patterns: &[&str],
        acking: bool,
    ) -> CanopyResult<SubscriptionId> {
        let entry = self.entry(port);
        let inbox = Arc::clone(&entry.inbox);
        entry
            .node
            .subscribe(patterns, move |info, meta, payload, acker| {
                if acking {
                    acker.ack(payload.to_vec());
                }
                inbox.lock().push(Received {
                    subscription: info.id,
                    pub_id: meta.pub_id,
                    seq: meta.seq,
                    topics: meta.topics.iter().map(ToString::to_string).collect(),
                    matched: meta.matched.iter().map(ToString::to_string).collect(),
                    payload: payload.to_vec(),
                });
            })
            .await
    }

    /// Deliveries recorded on `port` so far
    pub fn received(&self, port: u16) -> Vec<Received> {
        self.entry(port).inbox.lock().clone()
    }

    pub fn clear_received(&self) {
        for entry in self.nodes.values() {
            entry.inbox.lock().clear();
        }
    }

    pub async fn snapshot(&self, port: u16) -> CanopyResult<NodeSnapshot> {
        self.node(port).snapshot().await
    }

    /// `port`'s view of its link to `peer`
    pub async fn link_snapshot(&self, port: u16, peer: u16) -> Option<LinkSnapshot> {
        let peer_addr = self.entry(peer).addr;
        let snapshot = self.snapshot(port).await.ok()?;
        snapshot.link_to(peer_addr).cloned()
    }

    /// Interest `port` has received from `peer`, rendered and sorted
    pub async fn interest_from(&self, port: u16, peer: u16) -> Vec<String> {
        let mut patterns: Vec<String> = match self.link_snapshot(port, peer).await {
            Some(link) => link.interest_received.iter().map(ToString::to_string).collect(),
            None => Vec::new(),
        };
        patterns.sort();
        patterns
    }

    /// Wait until `port` holds exactly `expected` as `peer`'s interest
    pub async fn wait_interest(&self, port: u16, peer: u16, expected: &[&str]) -> bool {
        let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        expected.sort();
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            if self.interest_from(port, peer).await == expected {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until `port` has recorded at least `count` deliveries
    pub async fn wait_received(&self, port: u16, count: usize) -> bool {
        let inbox = Arc::clone(&self.entry(port).inbox);
        eventually(SETTLE_TIMEOUT, move || {
            let inbox = Arc::clone(&inbox);
            async move { inbox.lock().len() >= count }
        })
        .await
    }

    /// Wait until every node reports every live link established and its
    /// latest advertisement acknowledged, twice in a row
    pub async fn settle(&self) -> bool {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        let mut quiet_rounds = 0;
        while quiet_rounds < 2 {
            if self.all_acknowledged().await {
                quiet_rounds += 1;
            } else {
                quiet_rounds = 0;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL * 5).await;
        }
        true
    }

    async fn all_acknowledged(&self) -> bool {
        for entry in self.nodes.values() {
            let Ok(snapshot) = entry.node.snapshot().await else {
                continue;
            };
            let quiet = snapshot
                .links
                .iter()
                .all(|l| l.state == LinkState::Established && l.acknowledged);
            if !quiet {
                return false;
            }
        }
        true
    }

    /// Stop every node still running
    pub async fn shutdown(&self) {
        for entry in self.nodes.values() {
            let _ = entry.node.stop().await;
        }
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
