//! Canopy Node - handle to one overlay participant
//!
//! ```text
//! Created ──start──► Started ──stop──► Stopped
//! ```
//!
//! A `Node` in `Created` holds its configuration, key store and identity.
//! Starting it binds a transport and spawns the event loop; every traffic
//! operation then becomes a command to that loop. `Stopped` is terminal.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use canopy_core::{
    AckInfo, CanopyError, CanopyResult, KeyId, NodeId, PubId, PublicationId, PublicationMeta,
    SubscriptionId, Topic, TopicPattern,
};
use canopy_crypto::{CryptoEnvelope, Identity, KeyStore};
use canopy_routing::LinkId;
use canopy_transport::{MemoryNetwork, PacketReceiver, Transport, UdpTransport};

use crate::actor::{Command, NodeActor, Outgoing};
use crate::{NodeConfig, NodeEvent, NodeSnapshot};

/// Called for every publication matching a subscription, on the node's own
/// event loop
pub type SubscriptionHandler =
    Box<dyn FnMut(&SubscriptionInfo, &PublicationMeta, &[u8], &Acknowledger) + Send + 'static>;

/// Called for every acknowledgement reaching a publisher
pub type AckHandler = Box<dyn FnMut(&AckInfo) + Send + 'static>;

/// The subscription a delivery is for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub patterns: Vec<TopicPattern>,
}

/// Lets a subscription handler acknowledge the publication it was given
#[derive(Debug)]
pub struct Acknowledger {
    requested: bool,
    payload: RefCell<Option<Vec<u8>>>,
}

impl Acknowledger {
    pub(crate) fn new(requested: bool) -> Self {
        Acknowledger {
            requested,
            payload: RefCell::new(None),
        }
    }

    /// Did the publisher ask for acknowledgements
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    /// Send `payload` back to the publisher. Returns false if no
    /// acknowledgement was requested. A second call replaces the first.
    pub fn ack(&self, payload: impl Into<Vec<u8>>) -> bool {
        if !self.requested {
            return false;
        }
        *self.payload.borrow_mut() = Some(payload.into());
        true
    }

    pub(crate) fn take(&self) -> Option<Vec<u8>> {
        self.payload.borrow_mut().take()
    }
}

/// Lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Started,
    Stopped,
}

enum Lifecycle {
    Created,
    Started {
        cmd_tx: mpsc::Sender<Command>,
        local_addr: SocketAddr,
        task: JoinHandle<()>,
    },
    Stopped,
}

/// One overlay participant
pub struct Node {
    config: NodeConfig,
    identity: Identity,
    keystore: KeyStore,
    events: broadcast::Sender<NodeEvent>,
    lifecycle: Mutex<Lifecycle>,
}

impl Node {
    /// Create a node with a fresh identity. The key store is shared with
    /// the host, which provisions keys before traffic flows.
    pub fn new(config: NodeConfig, keystore: KeyStore) -> CanopyResult<Self> {
        Self::with_identity(config, keystore, Identity::generate())
    }

    pub fn with_identity(
        config: NodeConfig,
        keystore: KeyStore,
        identity: Identity,
    ) -> CanopyResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_buffer);
        Ok(Node {
            config,
            identity,
            keystore,
            events,
            lifecycle: Mutex::new(Lifecycle::Created),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    pub fn state(&self) -> NodeState {
        match &*self.lifecycle.lock() {
            Lifecycle::Created => NodeState::Created,
            Lifecycle::Started { .. } => NodeState::Started,
            Lifecycle::Stopped => NodeState::Stopped,
        }
    }

    /// Bound address while started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lifecycle.lock() {
            Lifecycle::Started { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    /// Subscribe to node events. Works in any state.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start on UDP `bind_ip:port`; port 0 picks an ephemeral port
    pub async fn start(&self, port: u16) -> CanopyResult<SocketAddr> {
        self.check_startable()?;
        let addr = SocketAddr::new(self.config.bind_ip, port);
        let (transport, packets) =
            UdpTransport::bind_with_receiver(addr, self.config.packet_buffer).await?;
        self.start_with(transport.into(), packets)
    }

    /// Start on an in-process network. Must be called within a tokio runtime.
    pub fn start_memory(&self, network: &MemoryNetwork, port: u16) -> CanopyResult<SocketAddr> {
        self.check_startable()?;
        let addr = SocketAddr::new(self.config.bind_ip, port);
        let (transport, packets) = network.bind(addr, self.config.packet_buffer)?;
        self.start_with(transport.into(), packets)
    }

    /// Start on an already bound transport
    pub fn start_with(&self, transport: Transport, packets: PacketReceiver) -> CanopyResult<SocketAddr> {
        let mut lifecycle = self.lifecycle.lock();
        match &*lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Started { .. } => return Err(CanopyError::AlreadyStarted),
            Lifecycle::Stopped => return Err(CanopyError::Closed),
        }
        self.keystore.network_key()?;

        let local_addr = transport.local_addr();
        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.command_buffer);
        let actor = NodeActor::new(
            self.config.clone(),
            self.identity.clone(),
            CryptoEnvelope::new(self.keystore.clone()),
            transport,
            self.events.clone(),
        );
        let task = tokio::spawn(actor.run(cmd_rx, packets));

        *lifecycle = Lifecycle::Started {
            cmd_tx,
            local_addr,
            task,
        };
        Ok(local_addr)
    }

    fn check_startable(&self) -> CanopyResult<()> {
        match &*self.lifecycle.lock() {
            Lifecycle::Created => {}
            Lifecycle::Started { .. } => return Err(CanopyError::AlreadyStarted),
            Lifecycle::Stopped => return Err(CanopyError::Closed),
        }
        self.keystore.network_key().map(|_| ())
    }

    /// Close every link, revoke every subscription and end the event loop.
    /// Stopping a node that never started just marks it stopped.
    pub async fn stop(&self) -> CanopyResult<()> {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        match previous {
            Lifecycle::Created => Ok(()),
            Lifecycle::Stopped => Err(CanopyError::Closed),
            Lifecycle::Started { cmd_tx, task, .. } => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if cmd_tx
                    .send(Command::Stop {
                        reply: Some(reply_tx),
                    })
                    .await
                    .is_ok()
                {
                    let _ = reply_rx.await;
                }
                drop(cmd_tx);
                if let Err(e) = task.await {
                    tracing::warn!(node = %self.node_id(), error = %e, "event loop ended abnormally");
                }
                Ok(())
            }
        }
    }

    fn sender(&self) -> CanopyResult<mpsc::Sender<Command>> {
        match &*self.lifecycle.lock() {
            Lifecycle::Created => Err(CanopyError::NotStarted),
            Lifecycle::Started { cmd_tx, .. } => Ok(cmd_tx.clone()),
            Lifecycle::Stopped => Err(CanopyError::Closed),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> CanopyResult<T> {
        let cmd_tx = self.sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| CanopyError::Closed)?;
        reply_rx.await.map_err(|_| CanopyError::Closed)
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Subscribe to a set of topic patterns. `+` matches one segment, a
    /// trailing `#` any number; misplaced wildcards fail with
    /// `MalformedTopic`.
    pub async fn subscribe<F>(&self, patterns: &[&str], handler: F) -> CanopyResult<SubscriptionId>
    where
        F: FnMut(&SubscriptionInfo, &PublicationMeta, &[u8], &Acknowledger) + Send + 'static,
    {
        let patterns = self.parse_patterns(patterns)?;
        let handler: SubscriptionHandler = Box::new(handler);
        self.request(|reply| Command::Subscribe {
            patterns,
            handler,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> CanopyResult<()> {
        self.request(|reply| Command::Unsubscribe { id, reply })
            .await?
    }

    fn parse_patterns(&self, patterns: &[&str]) -> CanopyResult<Vec<TopicPattern>> {
        if patterns.is_empty() {
            return Err(CanopyError::MalformedTopic("empty pattern set".into()));
        }
        patterns
            .iter()
            .map(|p| TopicPattern::parse(p, &self.config.separators))
            .collect()
    }

    fn parse_topics(&self, topics: &[&str]) -> CanopyResult<Vec<Topic>> {
        if topics.is_empty() {
            return Err(CanopyError::MalformedTopic("empty topic set".into()));
        }
        topics
            .iter()
            .map(|t| Topic::parse(t, &self.config.separators))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// A publisher for a fixed topic set. Payloads are sealed under `key_id`
    /// when given.
    pub async fn publisher(&self, topics: &[&str], key_id: Option<KeyId>) -> CanopyResult<Publisher> {
        let topics = self.parse_topics(topics)?;
        Ok(Publisher {
            pub_id: PubId::generate(),
            topics,
            key_id,
            ack_requested: false,
            last_seq: 0,
            cmd_tx: self.sender()?,
        })
    }

    /// A publisher that asks subscribers for acknowledgements and hands them
    /// to `on_ack`
    pub async fn publisher_with_acks<F>(
        &self,
        topics: &[&str],
        key_id: Option<KeyId>,
        on_ack: F,
    ) -> CanopyResult<Publisher>
    where
        F: FnMut(&AckInfo) + Send + 'static,
    {
        let mut publisher = self.publisher(topics, key_id).await?;
        publisher.ack_requested = true;
        publisher
            .cmd_tx
            .send(Command::RegisterPublisher {
                pub_id: publisher.pub_id,
                handler: Box::new(on_ack),
            })
            .await
            .map_err(|_| CanopyError::Closed)?;
        Ok(publisher)
    }

    /// Publish one payload under a fresh publisher identity
    pub async fn publish(
        &self,
        topics: &[&str],
        payload: impl Into<Vec<u8>>,
        key_id: Option<KeyId>,
    ) -> CanopyResult<PublicationId> {
        let mut publisher = self.publisher(topics, key_id).await?;
        let seq = publisher.publish(payload).await?;
        Ok(PublicationId::new(publisher.pub_id(), seq))
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    /// Link to the node at `remote`, waiting up to `timeout` (or the
    /// configured default) for its acknowledgement.
    ///
    /// Dropping the returned future cancels the attempt.
    pub async fn link(&self, remote: SocketAddr, timeout: Option<Duration>) -> CanopyResult<LinkId> {
        let timeout = timeout.unwrap_or(self.config.link_timeout);
        self.request(|reply| Command::Link {
            addr: remote,
            timeout,
            reply,
        })
        .await?
    }

    pub async fn unlink(&self, link: LinkId) -> CanopyResult<()> {
        self.request(|reply| Command::Unlink { link, reply })
            .await?
    }

    pub async fn snapshot(&self) -> CanopyResult<NodeSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Lifecycle::Started { cmd_tx, .. } = &*self.lifecycle.lock() {
            let _ = cmd_tx.try_send(Command::Stop { reply: None });
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id())
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Publishes a sequence of publications under one identity
pub struct Publisher {
    pub_id: PubId,
    topics: Vec<Topic>,
    key_id: Option<KeyId>,
    ack_requested: bool,
    last_seq: u32,
    cmd_tx: mpsc::Sender<Command>,
}

impl Publisher {
    pub fn pub_id(&self) -> PubId {
        self.pub_id
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Sequence number of the last publication, 0 before the first
    pub fn last_seq(&self) -> u32 {
        self.last_seq
    }

    /// Publish the next payload. Returns once it has been routed locally;
    /// propagation to peers continues asynchronously.
    pub async fn publish(&mut self, payload: impl Into<Vec<u8>>) -> CanopyResult<u32> {
        let seq = self
            .last_seq
            .checked_add(1)
            .ok_or(CanopyError::SequenceExhausted)?;
        self.last_seq = seq;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish {
                publication: Outgoing {
                    pub_id: self.pub_id,
                    seq,
                    topics: self.topics.clone(),
                    key_id: self.key_id,
                    ack_requested: self.ack_requested,
                    payload: payload.into(),
                },
                reply: reply_tx,
            })
            .await
            .map_err(|_| CanopyError::Closed)?;
        reply_rx.await.map_err(|_| CanopyError::Closed)??;
        Ok(seq)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.ack_requested {
            let _ = self.cmd_tx.try_send(Command::DropPublisher {
                pub_id: self.pub_id,
            });
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("pub_id", &self.pub_id)
            .field("topics", &self.topics)
            .field("last_seq", &self.last_seq)
            .finish_non_exhaustive()
    }
}
