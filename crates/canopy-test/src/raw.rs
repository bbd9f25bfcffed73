//! Hand-driven protocol endpoint
//!
//! A `RawPeer` sends and receives individual frames without an event loop,
//! for exercising a node's reaction to specific handshakes, to peers that go
//! silent, and to frames sent twice.

use std::net::SocketAddr;
use std::time::Duration;

use canopy_core::{CanopyError, CanopyResult, NodeId};
use canopy_crypto::{random_nonce, CryptoEnvelope, Identity, KeyStore, OpenedFrame};
use canopy_transport::{MemoryNetwork, MemoryTransport, PacketReceiver};
use canopy_wire::{FrameFlags, HandshakeAck, InterestAck, LinkStatus, Message, MessageType};

pub struct RawPeer {
    identity: Identity,
    envelope: CryptoEnvelope,
    transport: MemoryTransport,
    packets: PacketReceiver,
}

impl RawPeer {
    pub fn bind(network: &MemoryNetwork, port: u16, keystore: KeyStore) -> CanopyResult<Self> {
        let (transport, packets) = network.bind_port(port, 64)?;
        Ok(RawPeer {
            identity: Identity::generate(),
            envelope: CryptoEnvelope::new(keystore),
            transport,
            packets,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Continue under a new identity from the same address
    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = identity;
    }

    pub fn send_handshake(&self, dest: SocketAddr) -> CanopyResult<()> {
        let nonce = random_nonce();
        let hs = self
            .identity
            .handshake(MessageType::Handshake, self.local_addr().port(), &nonce);
        let frame = self.envelope.seal_frame_with_nonce(
            self.node_id(),
            &Message::Handshake(hs),
            FrameFlags::NONE,
            nonce,
        )?;
        self.transport.send_to(&frame, dest)
    }

    pub fn send_handshake_ack(&self, dest: SocketAddr, status: LinkStatus) -> CanopyResult<()> {
        let nonce = random_nonce();
        let identity =
            self.identity
                .handshake(MessageType::HandshakeAck, self.local_addr().port(), &nonce);
        let message = Message::HandshakeAck(HandshakeAck { status, identity });
        let frame =
            self.envelope
                .seal_frame_with_nonce(self.node_id(), &message, FrameFlags::NONE, nonce)?;
        self.transport.send_to(&frame, dest)
    }

    /// Seal `message` as the next frame from this peer
    pub fn seal(&self, message: &Message) -> CanopyResult<Vec<u8>> {
        self.envelope
            .seal_frame(self.node_id(), message, FrameFlags::NONE)
    }

    pub fn send(&self, dest: SocketAddr, message: &Message) -> CanopyResult<()> {
        let frame = self.seal(message)?;
        self.transport.send_to(&frame, dest)
    }

    /// Put already sealed bytes on the wire unchanged
    pub fn send_bytes(&self, bytes: &[u8], dest: SocketAddr) -> CanopyResult<()> {
        self.transport.send_to(bytes, dest)
    }

    /// Handshake with `dest` and wait for its answer
    pub async fn handshake(&mut self, dest: SocketAddr, timeout: Duration) -> CanopyResult<LinkStatus> {
        self.send_handshake(dest)?;
        let (frame, _) = self.recv_type(MessageType::HandshakeAck, timeout).await?;
        match frame.message {
            Message::HandshakeAck(ack) => Ok(ack.status),
            _ => Err(CanopyError::InvalidWireFormat("expected handshake ack".into())),
        }
    }

    /// Wait for the next interest advertisement and acknowledge it
    pub async fn ack_interest(&mut self, timeout: Duration) -> CanopyResult<u64> {
        let (frame, from) = self.recv_type(MessageType::Interest, timeout).await?;
        let Message::Interest(adv) = frame.message else {
            return Err(CanopyError::InvalidWireFormat("expected interest".into()));
        };
        self.send(from, &Message::InterestAck(InterestAck { revision: adv.revision }))?;
        Ok(adv.revision)
    }

    /// Next authenticated frame, or `Timeout`
    pub async fn recv(&mut self, timeout: Duration) -> CanopyResult<(OpenedFrame, SocketAddr)> {
        let (bytes, from) = tokio::time::timeout(timeout, self.packets.recv())
            .await
            .map_err(|_| CanopyError::Timeout)?
            .ok_or(CanopyError::Closed)?;
        Ok((self.envelope.open_frame(&bytes)?, from))
    }

    /// Skip frames until one of `message_type` arrives
    pub async fn recv_type(
        &mut self,
        message_type: MessageType,
        timeout: Duration,
    ) -> CanopyResult<(OpenedFrame, SocketAddr)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (frame, from) = self.recv(left).await?;
            if frame.message.message_type() == message_type {
                return Ok((frame, from));
            }
        }
    }
}
