//! Node event loop
//!
//! One task per node owns every piece of protocol state. Handles talk to it
//! through `Command`s; peers talk to it through authenticated frames. Each
//! turn of the loop handles exactly one command, one datagram, or one tick,
//! so routing and interest state never race.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use canopy_core::{
    AckInfo, CanopyError, CanopyResult, KeyId, NodeId, PubId, PublicationMeta,
    SubscriptionId, Topic, TopicPattern,
};
use canopy_crypto::{random_nonce, CryptoEnvelope, Identity, PublicIdentity};
use canopy_routing::{
    Advertisement, InboundUpdate, InterestTable, LinkId, LinkState, LinkTable, Origin, PublicationRouter,
    RouteDecision,
};
use canopy_transport::{PacketReceiver, Transport};
use canopy_wire::{
    FixedHeader, FrameFlags, Handshake, HandshakeAck, InterestAck, InterestAdvertisement,
    LinkStatus, Message, MessageType, PublicationAck, PublicationBody, MAX_FRAME_SIZE,
};

use crate::{
    AckHandler, Acknowledger, LinkSnapshot, NodeConfig, NodeEvent, NodeSnapshot, RuntimeStats,
    SubscriptionHandler, SubscriptionInfo,
};

// ============================================================================
// Commands sent from handles to the actor
// ============================================================================

/// A publication as handed over by a `Publisher`
pub(crate) struct Outgoing {
    pub pub_id: PubId,
    pub seq: u32,
    pub topics: Vec<Topic>,
    pub key_id: Option<KeyId>,
    pub ack_requested: bool,
    pub payload: Vec<u8>,
}

pub(crate) enum Command {
    Subscribe {
        patterns: Vec<TopicPattern>,
        handler: SubscriptionHandler,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<CanopyResult<()>>,
    },
    RegisterPublisher {
        pub_id: PubId,
        handler: AckHandler,
    },
    DropPublisher {
        pub_id: PubId,
    },
    Publish {
        publication: Outgoing,
        reply: oneshot::Sender<CanopyResult<()>>,
    },
    Link {
        addr: SocketAddr,
        timeout: Duration,
        reply: oneshot::Sender<CanopyResult<LinkId>>,
    },
    Unlink {
        link: LinkId,
        reply: oneshot::Sender<CanopyResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<NodeSnapshot>,
    },
    Stop {
        reply: Option<oneshot::Sender<()>>,
    },
}

// ============================================================================
// Actor
// ============================================================================

struct Subscription {
    info: SubscriptionInfo,
    handler: SubscriptionHandler,
}

/// An outbound link awaiting the peer's acknowledgement
struct PendingLink {
    reply: oneshot::Sender<CanopyResult<LinkId>>,
    last_sent: Instant,
}

pub(crate) struct NodeActor {
    config: NodeConfig,
    identity: Identity,
    envelope: CryptoEnvelope,
    transport: Transport,
    local_addr: SocketAddr,
    links: LinkTable,
    interest: InterestTable,
    router: PublicationRouter,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    ack_handlers: HashMap<PubId, AckHandler>,
    pending: HashMap<LinkId, PendingLink>,
    next_subscription: u64,
    events: broadcast::Sender<NodeEvent>,
    stats: RuntimeStats,
}

impl NodeActor {
    pub(crate) fn new(
        config: NodeConfig,
        identity: Identity,
        envelope: CryptoEnvelope,
        transport: Transport,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        let router = PublicationRouter::new(
            envelope.clone(),
            config.dedup_capacity,
            config.dedup_ttl,
        );
        let local_addr = transport.local_addr();
        let interest = InterestTable::new(identity.node_id());
        NodeActor {
            config,
            identity,
            envelope,
            transport,
            local_addr,
            links: LinkTable::new(),
            interest,
            router,
            subscriptions: HashMap::new(),
            ack_handlers: HashMap::new(),
            pending: HashMap::new(),
            next_subscription: 1,
            events,
            stats: RuntimeStats::default(),
        }
    }

    fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub(crate) async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut packets: PacketReceiver,
    ) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        tracing::info!(node = %self.node_id(), addr = %self.local_addr, "node started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Stop { reply }) => {
                        self.shutdown().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                packet = packets.recv() => match packet {
                    Some((bytes, from)) => self.handle_packet(&bytes, from).await,
                    None => {
                        tracing::warn!(node = %self.node_id(), "transport closed");
                        self.shutdown().await;
                        break;
                    }
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }

        tracing::info!(node = %self.node_id(), "node stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe {
                patterns,
                handler,
                reply,
            } => {
                let id = SubscriptionId::new(self.next_subscription);
                self.next_subscription += 1;
                self.interest.add_local(id, patterns.clone());
                self.subscriptions.insert(
                    id,
                    Subscription {
                        info: SubscriptionInfo { id, patterns },
                        handler,
                    },
                );
                tracing::debug!(node = %self.node_id(), subscription = %id, "subscribed");
                let _ = reply.send(id);
                self.readvertise().await;
            }
            Command::Unsubscribe { id, reply } => {
                if self.subscriptions.remove(&id).is_none() {
                    let _ = reply.send(Err(CanopyError::SubscriptionNotFound(id)));
                    return;
                }
                self.interest.remove_local(id);
                tracing::debug!(node = %self.node_id(), subscription = %id, "unsubscribed");
                let _ = reply.send(Ok(()));
                self.readvertise().await;
            }
            Command::RegisterPublisher { pub_id, handler } => {
                self.ack_handlers.insert(pub_id, handler);
            }
            Command::DropPublisher { pub_id } => {
                self.ack_handlers.remove(&pub_id);
            }
            Command::Publish { publication, reply } => {
                let result = self.publish(publication).await;
                let _ = reply.send(result);
            }
            Command::Link {
                addr,
                timeout,
                reply,
            } => self.open_link(addr, timeout, reply).await,
            Command::Unlink { link, reply } => {
                if self.links.get(link).is_none() {
                    let _ = reply.send(Err(CanopyError::LinkNotFound));
                    return;
                }
                self.close_link(link, true).await;
                let _ = reply.send(Ok(()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the loop itself
            Command::Stop { .. } => {}
        }
    }

    // ------------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------------

    async fn handle_packet(&mut self, bytes: &[u8], from: SocketAddr) {
        self.stats.packets_in += 1;
        let opened = match self.envelope.open_frame(bytes) {
            Ok(opened) => opened,
            Err(CanopyError::Authentication) => {
                self.auth_failed(from, CanopyError::Authentication);
                return;
            }
            Err(e) => {
                self.stats.malformed += 1;
                tracing::debug!(node = %self.node_id(), remote = %from, error = %e, "malformed frame dropped");
                return;
            }
        };

        let header = opened.header;
        match opened.message {
            Message::Handshake(hs) => self.on_handshake(from, &header, hs).await,
            Message::HandshakeAck(ack) => self.on_handshake_ack(from, &header, ack).await,
            message => self.on_link_message(from, &header, message).await,
        }
    }

    async fn on_handshake(&mut self, from: SocketAddr, header: &FixedHeader, hs: Handshake) {
        let remote = match PublicIdentity::verify_handshake(
            &hs,
            header.node_id,
            MessageType::Handshake,
            &header.nonce,
        ) {
            Ok(identity) => identity.node_id(),
            Err(e) => {
                self.auth_failed(from, e);
                return;
            }
        };

        if remote == self.node_id() {
            self.send_handshake_ack(from, LinkStatus::Rejected).await;
            return;
        }

        let existing = self
            .links
            .by_addr(&from)
            .map(|l| (l.id, l.state, l.remote_node));
        match existing {
            None => match self.links.accept(from, remote, header.seq, Instant::now()) {
                Ok(id) => {
                    self.send_handshake_ack(from, LinkStatus::Accepted).await;
                    self.on_established(id).await;
                }
                Err(e) => {
                    tracing::debug!(node = %self.node_id(), remote = %from, error = %e, "inbound link not accepted");
                }
            },
            // Both ends linking at once converge on one link
            Some((id, LinkState::Pending, _)) => {
                self.send_handshake_ack(from, LinkStatus::Accepted).await;
                self.establish_pending(id, remote, header.seq).await;
            }
            // Our acknowledgement was lost or the peer restarted; either way
            // it starts from nothing
            Some((id, LinkState::Established, Some(node))) if node == remote => {
                if !self.links.restart(id, header.seq, Instant::now()) {
                    self.stats.replayed += 1;
                    tracing::debug!(node = %self.node_id(), link = %id, remote = %from, "stale handshake dropped");
                    return;
                }
                tracing::debug!(node = %self.node_id(), link = %id, remote = %from, "peer handshook again, restarting link");
                self.interest.reset(id);
                self.send_handshake_ack(from, LinkStatus::Accepted).await;
                self.readvertise().await;
            }
            Some(_) => {
                self.send_handshake_ack(from, LinkStatus::AlreadyLinked).await;
            }
        }
    }

    async fn on_handshake_ack(&mut self, from: SocketAddr, header: &FixedHeader, ack: HandshakeAck) {
        let remote = match PublicIdentity::verify_handshake(
            &ack.identity,
            header.node_id,
            MessageType::HandshakeAck,
            &header.nonce,
        ) {
            Ok(identity) => identity.node_id(),
            Err(e) => {
                self.auth_failed(from, e);
                return;
            }
        };

        let Some(link) = self
            .links
            .by_addr(&from)
            .filter(|l| l.state == LinkState::Pending)
            .map(|l| l.id)
        else {
            tracing::trace!(node = %self.node_id(), remote = %from, "handshake ack without pending link");
            return;
        };

        match ack.status {
            LinkStatus::Accepted => self.establish_pending(link, remote, header.seq).await,
            LinkStatus::AlreadyLinked => self.fail_pending(link, CanopyError::AlreadyLinked).await,
            LinkStatus::Rejected => self.fail_pending(link, CanopyError::LinkRejected).await,
        }
    }

    /// Frames that are only valid on an established link from that peer
    async fn on_link_message(&mut self, from: SocketAddr, header: &FixedHeader, message: Message) {
        let link = self
            .links
            .by_addr(&from)
            .filter(|l| l.state == LinkState::Established && l.remote_node == Some(header.node_id))
            .map(|l| l.id);
        let Some(link) = link else {
            self.stats.unexpected += 1;
            tracing::trace!(
                node = %self.node_id(),
                remote = %from,
                kind = ?message.message_type(),
                "frame outside an established link dropped"
            );
            return;
        };
        if !self.links.admit(link, header.seq, Instant::now()) {
            self.stats.replayed += 1;
            tracing::debug!(
                node = %self.node_id(),
                %link,
                seq = header.seq,
                kind = ?message.message_type(),
                "replayed frame dropped"
            );
            return;
        }

        match message {
            Message::Interest(adv) => self.on_interest(link, adv).await,
            Message::InterestAck(ack) => {
                self.interest.acknowledge(link, ack.revision);
            }
            Message::Teardown => {
                tracing::debug!(node = %self.node_id(), %link, remote = %from, "link torn down by peer");
                self.close_link(link, false).await;
            }
            Message::Publication(body) => {
                let _ = self.route(body, Origin::Link(link)).await;
            }
            Message::PublicationAck(ack) => self.route_ack(ack).await,
            Message::Keepalive => {
                self.send(from, &Message::KeepaliveAck, FrameFlags::NONE).await;
            }
            // Admission already marked the link alive
            Message::KeepaliveAck => {}
            Message::Handshake(_) | Message::HandshakeAck(_) => {}
        }
    }

    async fn on_interest(&mut self, link: LinkId, adv: InterestAdvertisement) {
        if self.config.debug {
            tracing::trace!(
                node = %self.node_id(),
                %link,
                revision = adv.revision,
                patterns = ?adv.patterns().collect::<Vec<_>>(),
                "interest received"
            );
        }
        let revision = adv.revision;
        let update = self.interest.apply_inbound(link, revision, adv.routes);
        if update.needs_ack() {
            if let Some(addr) = self.remote_addr(link) {
                let ack = Message::InterestAck(InterestAck { revision });
                self.send(addr, &ack, FrameFlags::NONE).await;
            }
        }
        if update == InboundUpdate::Applied {
            self.readvertise().await;
        }
    }

    // ------------------------------------------------------------------------
    // Link lifecycle
    // ------------------------------------------------------------------------

    async fn open_link(
        &mut self,
        addr: SocketAddr,
        timeout: Duration,
        reply: oneshot::Sender<CanopyResult<LinkId>>,
    ) {
        let now = Instant::now();
        let id = match self.links.open(addr, now + timeout, now) {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        self.pending.insert(
            id,
            PendingLink {
                reply,
                last_sent: now,
            },
        );
        tracing::debug!(node = %self.node_id(), link = %id, remote = %addr, "linking");
        self.emit(NodeEvent::LinkStateChanged {
            link: id,
            remote: addr,
            state: LinkState::Pending,
        });
        self.send_handshake(addr, FrameFlags::NONE).await;
    }

    async fn establish_pending(&mut self, link: LinkId, remote: NodeId, floor: u64) {
        if let Err(e) = self.links.establish(link, remote, floor, Instant::now()) {
            tracing::debug!(node = %self.node_id(), %link, error = %e, "establish failed");
            return;
        }
        if let Some(pending) = self.pending.remove(&link) {
            let _ = pending.reply.send(Ok(link));
        }
        self.on_established(link).await;
    }

    async fn on_established(&mut self, link: LinkId) {
        let Some((remote, Some(node))) = self.links.get(link).map(|l| (l.remote_addr, l.remote_node))
        else {
            return;
        };
        self.interest.attach(link, node);
        tracing::info!(node = %self.node_id(), %link, %remote, "link established");
        self.emit(NodeEvent::LinkStateChanged {
            link,
            remote,
            state: LinkState::Established,
        });
        self.readvertise().await;
    }

    async fn fail_pending(&mut self, link: LinkId, reason: CanopyError) {
        let Some(record) = self.links.remove(link) else {
            return;
        };
        tracing::debug!(node = %self.node_id(), %link, remote = %record.remote_addr, error = %reason, "link failed");
        if let Some(pending) = self.pending.remove(&link) {
            let _ = pending.reply.send(Err(reason));
        }
        self.emit(NodeEvent::LinkStateChanged {
            link,
            remote: record.remote_addr,
            state: record.state,
        });
    }

    /// Tear a link down and withdraw its interest. `notify` sends the peer a
    /// teardown first.
    async fn close_link(&mut self, link: LinkId, notify: bool) {
        let established = self.links.is_established(link);
        if notify && established {
            if let Some(addr) = self.remote_addr(link) {
                self.send(addr, &Message::Teardown, FrameFlags::NONE).await;
            }
        }
        let Some(record) = self.links.remove(link) else {
            return;
        };
        if let Some(pending) = self.pending.remove(&link) {
            let _ = pending.reply.send(Err(CanopyError::LinkCancelled));
        }
        self.interest.detach(link);
        tracing::info!(node = %self.node_id(), %link, remote = %record.remote_addr, state = ?record.state, "link closed");
        self.emit(NodeEvent::LinkStateChanged {
            link,
            remote: record.remote_addr,
            state: record.state,
        });
        if established {
            self.readvertise().await;
        }
    }

    fn remote_addr(&self, link: LinkId) -> Option<SocketAddr> {
        self.links.get(link).map(|l| l.remote_addr)
    }

    // ------------------------------------------------------------------------
    // Interest propagation
    // ------------------------------------------------------------------------

    /// Send every link whose advertisement changed its new one
    async fn readvertise(&mut self) {
        let adverts = self.interest.refresh(Instant::now());
        for advert in adverts {
            self.send_advertisement(advert, FrameFlags::NONE).await;
        }
    }

    async fn send_advertisement(&mut self, advert: Advertisement, flags: FrameFlags) {
        let Some(addr) = self.remote_addr(advert.link) else {
            return;
        };
        if self.config.debug {
            tracing::trace!(
                node = %self.node_id(),
                link = %advert.link,
                revision = advert.revision,
                patterns = ?advert.patterns(),
                "advertising interest"
            );
        }
        let link = advert.link;
        let message = Message::Interest(InterestAdvertisement {
            revision: advert.revision,
            routes: advert.routes,
        });
        if self.send(addr, &message, flags).await {
            self.stats.advertisements_sent += 1;
        } else {
            self.interest.unsent(link);
        }
    }

    // ------------------------------------------------------------------------
    // Publications
    // ------------------------------------------------------------------------

    async fn publish(&mut self, publication: Outgoing) -> CanopyResult<()> {
        let mut body = PublicationBody {
            pub_id: publication.pub_id,
            seq: publication.seq,
            ack_requested: publication.ack_requested,
            topics: publication.topics,
            seal: None,
            payload: publication.payload,
        };
        if let Some(key_id) = publication.key_id {
            self.envelope.seal_publication(&mut body, key_id)?;
        }

        let size = body.frame_size();
        if size > MAX_FRAME_SIZE {
            return Err(CanopyError::InvalidWireFormat(format!(
                "Publication too large: {} > {}",
                size, MAX_FRAME_SIZE
            )));
        }
        self.route(body, Origin::Local).await
    }

    async fn route(&mut self, body: PublicationBody, origin: Origin) -> CanopyResult<()> {
        let decision = match self
            .router
            .route(&body, origin, &self.links, &self.interest)
        {
            Ok(decision) => decision,
            Err(reason) => {
                tracing::debug!(
                    node = %self.node_id(),
                    pub_id = %body.pub_id,
                    seq = body.seq,
                    error = %reason,
                    "publication dropped"
                );
                self.emit(NodeEvent::PublicationDropped {
                    id: body.id(),
                    reason: reason.clone(),
                });
                return Err(reason);
            }
        };
        if decision.duplicate {
            return Ok(());
        }
        if self.config.debug {
            tracing::trace!(
                node = %self.node_id(),
                pub_id = %body.pub_id,
                seq = body.seq,
                topics = ?body.topics,
                deliveries = decision.deliveries.len(),
                forwards = decision.forwards.len(),
                "routing publication"
            );
        }

        self.forward(&body, &decision, origin).await;
        self.deliver(&body, &decision).await;
        Ok(())
    }

    async fn forward(&mut self, body: &PublicationBody, decision: &RouteDecision, origin: Origin) {
        if decision.forwards.is_empty() {
            return;
        }
        let mut flags = FrameFlags::NONE;
        flags.set_relayed(origin != Origin::Local);
        let message = Message::Publication(body.clone());
        for link in &decision.forwards {
            if let Some(addr) = self.remote_addr(*link) {
                if self.send(addr, &message, flags).await {
                    self.stats.publications_sent += 1;
                }
            }
        }
    }

    async fn deliver(&mut self, body: &PublicationBody, decision: &RouteDecision) {
        let Some(plaintext) = decision.plaintext.as_deref() else {
            return;
        };

        let mut acks = Vec::new();
        for delivery in &decision.deliveries {
            let Some(sub) = self.subscriptions.get_mut(&delivery.subscription) else {
                continue;
            };
            let meta = PublicationMeta {
                pub_id: body.pub_id,
                seq: body.seq,
                topics: body.topics.clone(),
                matched: delivery.matched.clone(),
                key_id: body.key_id(),
                ack_requested: body.ack_requested,
            };
            let acknowledger = Acknowledger::new(body.ack_requested);
            (sub.handler)(&sub.info, &meta, plaintext, &acknowledger);
            if let Some(payload) = acknowledger.take() {
                acks.push(payload);
            }
        }

        let node = self.node_id();
        for payload in acks {
            self.route_ack(PublicationAck {
                pub_id: body.pub_id,
                seq: body.seq,
                acker: node,
                payload,
            })
            .await;
        }
    }

    /// Move an acknowledgement one hop closer to its publisher
    async fn route_ack(&mut self, ack: PublicationAck) {
        match self.router.route_ack(ack.id(), &self.links) {
            Some(Origin::Local) => match self.ack_handlers.get_mut(&ack.pub_id) {
                Some(handler) => handler(&AckInfo {
                    pub_id: ack.pub_id,
                    seq: ack.seq,
                    from: ack.acker,
                    payload: ack.payload,
                }),
                None => {
                    tracing::trace!(node = %self.node_id(), pub_id = %ack.pub_id, "ack for unknown publisher");
                }
            },
            Some(Origin::Link(link)) => {
                if let Some(addr) = self.remote_addr(link) {
                    self.send(addr, &Message::PublicationAck(ack), FrameFlags::NONE)
                        .await;
                }
            }
            None => {}
        }
    }

    // ------------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------------

    async fn on_tick(&mut self) {
        self.stats.ticks += 1;
        let now = Instant::now();

        for link in self.links.expired(now) {
            self.fail_pending(link, CanopyError::Timeout).await;
        }

        let cancelled: Vec<LinkId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.reply.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for link in cancelled {
            self.fail_pending(link, CanopyError::LinkCancelled).await;
        }

        let retry = self.config.interest_retry_interval;
        let mut handshakes = Vec::new();
        for (link, pending) in self.pending.iter_mut() {
            if now.saturating_duration_since(pending.last_sent) >= retry {
                pending.last_sent = now;
                handshakes.push(*link);
            }
        }
        for link in handshakes {
            if let Some(addr) = self.remote_addr(link) {
                self.stats.retransmits += 1;
                self.send_handshake(addr, retransmit()).await;
            }
        }

        let (resend, exhausted) =
            self.interest
                .due_retransmits(now, retry, self.config.max_interest_retries);
        for advert in resend {
            self.stats.retransmits += 1;
            self.send_advertisement(advert, retransmit()).await;
        }
        for link in exhausted {
            tracing::warn!(node = %self.node_id(), %link, "interest never acknowledged, closing link");
            self.close_link(link, true).await;
        }
        if self.interest.needs_refresh() {
            self.readvertise().await;
        }

        let (due, dead) = self.links.keepalive(
            now,
            self.config.keepalive_interval,
            self.config.max_interest_retries,
        );
        for link in due {
            if let Some(addr) = self.remote_addr(link) {
                if self.send(addr, &Message::Keepalive, FrameFlags::NONE).await {
                    self.stats.keepalives_sent += 1;
                }
            }
        }
        for link in dead {
            tracing::warn!(node = %self.node_id(), %link, "peer went silent, closing link");
            self.close_link(link, true).await;
        }

        self.router.expire(now);
    }

    async fn shutdown(&mut self) {
        let ids: Vec<LinkId> = self.links.iter().map(|l| l.id).collect();
        for link in ids {
            if self.links.is_established(link) {
                if let Some(addr) = self.remote_addr(link) {
                    self.send(addr, &Message::Teardown, FrameFlags::NONE).await;
                }
            }
            if let Some(pending) = self.pending.remove(&link) {
                let _ = pending.reply.send(Err(CanopyError::Closed));
            }
            if let Some(record) = self.links.remove(link) {
                self.interest.detach(link);
                self.emit(NodeEvent::LinkStateChanged {
                    link,
                    remote: record.remote_addr,
                    state: record.state,
                });
            }
        }
        for id in self.subscriptions.keys().copied().collect::<Vec<_>>() {
            self.interest.remove_local(id);
        }
        self.subscriptions.clear();
        self.ack_handlers.clear();
    }

    fn snapshot(&self) -> NodeSnapshot {
        let links = self
            .links
            .iter()
            .map(|l| {
                let (sent_revision, acknowledged) =
                    self.interest.sent_revision(l.id).unwrap_or((0, false));
                LinkSnapshot {
                    id: l.id,
                    remote_addr: l.remote_addr,
                    remote_node: l.remote_node,
                    direction: l.direction,
                    state: l.state,
                    interest_sent: self.interest.sent(l.id).unwrap_or_default(),
                    interest_received: self
                        .interest
                        .received(l.id)
                        .map(|s| s.to_vec())
                        .unwrap_or_default(),
                    sent_revision,
                    acknowledged,
                }
            })
            .collect();
        NodeSnapshot {
            node_id: self.node_id(),
            local_addr: self.local_addr,
            links,
            subscriptions: self.subscriptions.len(),
            runtime: self.stats,
            router: self.router.stats(),
        }
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    async fn send_handshake(&mut self, addr: SocketAddr, flags: FrameFlags) {
        let nonce = random_nonce();
        let hs = self
            .identity
            .handshake(MessageType::Handshake, self.local_addr.port(), &nonce);
        let frame = self.envelope.seal_frame_with_nonce(
            self.node_id(),
            &Message::Handshake(hs),
            flags,
            nonce,
        );
        if self.transmit(addr, frame).await {
            self.stats.handshakes_sent += 1;
        }
    }

    async fn send_handshake_ack(&mut self, addr: SocketAddr, status: LinkStatus) {
        let nonce = random_nonce();
        let identity =
            self.identity
                .handshake(MessageType::HandshakeAck, self.local_addr.port(), &nonce);
        let message = Message::HandshakeAck(HandshakeAck { status, identity });
        let frame =
            self.envelope
                .seal_frame_with_nonce(self.node_id(), &message, FrameFlags::NONE, nonce);
        self.transmit(addr, frame).await;
    }

    async fn send(&mut self, addr: SocketAddr, message: &Message, flags: FrameFlags) -> bool {
        let frame = self.envelope.seal_frame(self.node_id(), message, flags);
        self.transmit(addr, frame).await
    }

    async fn transmit(&mut self, addr: SocketAddr, frame: CanopyResult<Vec<u8>>) -> bool {
        let result = match frame {
            Ok(bytes) => self.transport.send_to(&bytes, addr).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.stats.packets_out += 1;
                true
            }
            Err(e) => {
                self.stats.send_errors += 1;
                tracing::debug!(node = %self.node_id(), remote = %addr, error = %e, "send failed");
                false
            }
        }
    }

    fn auth_failed(&mut self, from: SocketAddr, reason: CanopyError) {
        self.stats.auth_failures += 1;
        tracing::warn!(node = %self.node_id(), remote = %from, error = %reason, "authentication failed, frame dropped");
        self.emit(NodeEvent::AuthenticationFailed {
            remote: from,
            reason,
        });
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn retransmit() -> FrameFlags {
    let mut flags = FrameFlags::NONE;
    flags.set_retransmit(true);
    flags
}
