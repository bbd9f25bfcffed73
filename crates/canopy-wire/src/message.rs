//! Message bodies carried inside frames
//!
//! All integers are little-endian. Topic and pattern lists are encoded as
//! a u16 count followed by segment lists; a segment list is a u8 count
//! followed by u16-length-prefixed UTF-8 segments. Decoding validates every
//! topic so malformed traffic is rejected as a whole.

use bytes::{Buf, BufMut};

use canopy_core::{
    CanopyError, CanopyResult, KeyId, NodeId, PubId, PublicationId, Topic, TopicPattern,
    ID128_SIZE, MAX_SEGMENTS, MAX_SEGMENT_LEN,
};

use crate::{MessageType, AUTH_TAG_SIZE, FIXED_HEADER_SIZE};

/// Longest node path an interest route may carry
pub const MAX_ROUTE_HOPS: usize = 64;

/// Ed25519 verifying key size
pub const VERIFYING_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Payload nonce size for content-key sealing
pub const SEAL_NONCE_SIZE: usize = 12;

fn need(buf: &[u8], n: usize) -> CanopyResult<()> {
    if buf.remaining() < n {
        return Err(CanopyError::BufferTooShort {
            expected: n,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn get_array<const N: usize>(buf: &mut &[u8]) -> CanopyResult<[u8; N]> {
    need(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

// Topic validation bounds the segment count by `MAX_SEGMENTS` and each
// segment by `MAX_SEGMENT_LEN`, so both prefixes fit their width.
fn put_segments(buf: &mut Vec<u8>, segments: &[String]) {
    debug_assert!(segments.len() <= MAX_SEGMENTS);
    buf.put_u8(segments.len() as u8);
    for seg in segments {
        debug_assert!(seg.len() <= MAX_SEGMENT_LEN);
        buf.put_u16_le(seg.len() as u16);
        buf.put_slice(seg.as_bytes());
    }
}

fn get_segments(buf: &mut &[u8]) -> CanopyResult<Vec<String>> {
    need(buf, 1)?;
    let count = buf.get_u8() as usize;
    let mut segments = Vec::with_capacity(count);
    for _ in 0..count {
        need(buf, 2)?;
        let len = buf.get_u16_le() as usize;
        need(buf, len)?;
        let seg = std::str::from_utf8(&buf[..len])
            .map_err(|_| CanopyError::InvalidWireFormat("Segment is not UTF-8".into()))?
            .to_string();
        buf.advance(len);
        segments.push(seg);
    }
    Ok(segments)
}

fn put_topics(buf: &mut Vec<u8>, topics: &[Topic]) {
    buf.put_u16_le(topics.len() as u16);
    for t in topics {
        put_segments(buf, t.segments());
    }
}

fn get_topics(buf: &mut &[u8]) -> CanopyResult<Vec<Topic>> {
    need(buf, 2)?;
    let count = buf.get_u16_le() as usize;
    (0..count)
        .map(|_| Topic::from_segments(get_segments(buf)?))
        .collect()
}

fn put_routes(buf: &mut Vec<u8>, routes: &[InterestRoute]) {
    buf.put_u16_le(routes.len() as u16);
    for route in routes {
        put_segments(buf, route.pattern.segments());
        debug_assert!(!route.path.is_empty() && route.path.len() <= MAX_ROUTE_HOPS);
        buf.put_u8(route.path.len() as u8);
        for hop in &route.path {
            buf.put_slice(&hop.to_bytes());
        }
    }
}

fn get_routes(buf: &mut &[u8]) -> CanopyResult<Vec<InterestRoute>> {
    need(buf, 2)?;
    let count = buf.get_u16_le() as usize;
    let mut routes = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let pattern = TopicPattern::from_segments(get_segments(buf)?)?;
        need(buf, 1)?;
        let hops = buf.get_u8() as usize;
        if hops == 0 || hops > MAX_ROUTE_HOPS {
            return Err(CanopyError::InvalidWireFormat(format!(
                "Interest route with {} hops",
                hops
            )));
        }
        let path = (0..hops)
            .map(|_| get_array::<8>(buf).map(NodeId::from_bytes))
            .collect::<CanopyResult<Vec<_>>>()?;
        routes.push(InterestRoute { pattern, path });
    }
    Ok(routes)
}

fn get_bytes(buf: &mut &[u8]) -> CanopyResult<Vec<u8>> {
    need(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    need(buf, len)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

fn finish(buf: &[u8]) -> CanopyResult<()> {
    if buf.has_remaining() {
        return Err(CanopyError::InvalidWireFormat(format!(
            "{} trailing bytes in message body",
            buf.remaining()
        )));
    }
    Ok(())
}

/// Outcome of a handshake, carried in the acknowledgement
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkStatus {
    Accepted = 0,
    AlreadyLinked = 1,
    Rejected = 2,
}

impl LinkStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(LinkStatus::Accepted),
            1 => Some(LinkStatus::AlreadyLinked),
            2 => Some(LinkStatus::Rejected),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Link handshake: proves the sender's identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// Port the sender listens on
    pub port: u16,
    pub verifying_key: [u8; VERIFYING_KEY_SIZE],
    /// Signature over [`handshake_transcript`]
    pub signature: [u8; SIGNATURE_SIZE],
}

/// Handshake acknowledgement, carrying the responder's identity proof
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeAck {
    pub status: LinkStatus,
    pub identity: Handshake,
}

/// Bytes a handshake signature covers
pub fn handshake_transcript(
    message_type: MessageType,
    node_id: NodeId,
    port: u16,
    nonce: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + nonce.len());
    buf.put_slice(b"canopy-handshake-v1");
    buf.put_u8(message_type.to_byte());
    buf.put_slice(&node_id.to_bytes());
    buf.put_u16_le(port);
    buf.put_slice(nonce);
    buf
}

/// One advertised pattern and the nodes its interest passed through.
///
/// `path[0]` is the advertising node and the last entry is where the
/// subscription lives; a node never accepts a route that already names it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InterestRoute {
    pub pattern: TopicPattern,
    pub path: Vec<NodeId>,
}

/// Interest advertisement: the full set of routes reachable through the
/// sender, replacing whatever was advertised before. An empty set means "no
/// interest".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterestAdvertisement {
    pub revision: u64,
    pub routes: Vec<InterestRoute>,
}

impl InterestAdvertisement {
    /// Bytes on the wire once framed and tagged
    pub fn frame_size(&self) -> usize {
        let mut buf = Vec::new();
        buf.put_u64_le(self.revision);
        put_routes(&mut buf, &self.routes);
        FIXED_HEADER_SIZE + buf.len() + AUTH_TAG_SIZE
    }

    pub fn patterns(&self) -> impl Iterator<Item = &TopicPattern> {
        self.routes.iter().map(|r| &r.pattern)
    }
}

/// Acknowledges an interest advertisement revision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterestAck {
    pub revision: u64,
}

/// Content-key seal carried next to an encrypted payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Seal {
    pub key_id: KeyId,
    pub nonce: [u8; SEAL_NONCE_SIZE],
}

/// Publication body. The payload is ciphertext when `seal` is present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicationBody {
    pub pub_id: PubId,
    pub seq: u32,
    pub ack_requested: bool,
    pub topics: Vec<Topic>,
    pub seal: Option<Seal>,
    pub payload: Vec<u8>,
}

const PUB_ACK_REQUESTED: u8 = 0b01;
const PUB_SEALED: u8 = 0b10;

impl PublicationBody {
    #[inline]
    pub fn id(&self) -> PublicationId {
        PublicationId::new(self.pub_id, self.seq)
    }

    #[inline]
    pub fn key_id(&self) -> Option<KeyId> {
        self.seal.map(|s| s.key_id)
    }

    /// Identity, flags, topics and key id; authenticated by the content seal.
    /// The seal nonce is excluded so it can be chosen after the AAD is fixed.
    pub fn associated_data(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.put_prefix(&mut buf);
        if let Some(seal) = &self.seal {
            buf.put_slice(&seal.key_id.to_bytes());
        }
        buf
    }

    fn put_prefix(&self, buf: &mut Vec<u8>) {
        buf.put_slice(&self.pub_id.to_bytes());
        buf.put_u32_le(self.seq);
        let mut flags = 0u8;
        if self.ack_requested {
            flags |= PUB_ACK_REQUESTED;
        }
        if self.seal.is_some() {
            flags |= PUB_SEALED;
        }
        buf.put_u8(flags);
        put_topics(buf, &self.topics);
    }

    /// Bytes on the wire once framed and tagged
    pub fn frame_size(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        FIXED_HEADER_SIZE + buf.len() + AUTH_TAG_SIZE
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        self.put_prefix(buf);
        if let Some(seal) = &self.seal {
            buf.put_slice(&seal.key_id.to_bytes());
            buf.put_slice(&seal.nonce);
        }
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    fn decode(buf: &mut &[u8]) -> CanopyResult<Self> {
        let pub_id = PubId::from_bytes(get_array::<ID128_SIZE>(buf)?);
        need(buf, 5)?;
        let seq = buf.get_u32_le();
        let flags = buf.get_u8();
        let topics = get_topics(buf)?;
        if topics.is_empty() {
            return Err(CanopyError::MalformedTopic(
                "publication without topics".into(),
            ));
        }
        let seal = if flags & PUB_SEALED != 0 {
            Some(Seal {
                key_id: KeyId::new(get_array::<ID128_SIZE>(buf)?),
                nonce: get_array::<SEAL_NONCE_SIZE>(buf)?,
            })
        } else {
            None
        };
        let payload = get_bytes(buf)?;
        Ok(PublicationBody {
            pub_id,
            seq,
            ack_requested: flags & PUB_ACK_REQUESTED != 0,
            topics,
            seal,
            payload,
        })
    }
}

/// Acknowledgement travelling back toward a publisher
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicationAck {
    pub pub_id: PubId,
    pub seq: u32,
    /// Node whose subscriber acknowledged
    pub acker: NodeId,
    pub payload: Vec<u8>,
}

impl PublicationAck {
    #[inline]
    pub fn id(&self) -> PublicationId {
        PublicationId::new(self.pub_id, self.seq)
    }
}

/// Any message body
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    Interest(InterestAdvertisement),
    InterestAck(InterestAck),
    Teardown,
    /// Liveness check on an idle link
    Keepalive,
    KeepaliveAck,
    Publication(PublicationBody),
    PublicationAck(PublicationAck),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::HandshakeAck(_) => MessageType::HandshakeAck,
            Message::Interest(_) => MessageType::Interest,
            Message::InterestAck(_) => MessageType::InterestAck,
            Message::Teardown => MessageType::Teardown,
            Message::Keepalive => MessageType::Keepalive,
            Message::KeepaliveAck => MessageType::KeepaliveAck,
            Message::Publication(_) => MessageType::Publication,
            Message::PublicationAck(_) => MessageType::PublicationAck,
        }
    }

    /// Encode the body (without frame header or tag)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Handshake(h) => put_handshake(&mut buf, h),
            Message::HandshakeAck(ack) => {
                buf.put_u8(ack.status.to_byte());
                put_handshake(&mut buf, &ack.identity);
            }
            Message::Interest(adv) => {
                buf.put_u64_le(adv.revision);
                put_routes(&mut buf, &adv.routes);
            }
            Message::InterestAck(ack) => buf.put_u64_le(ack.revision),
            Message::Teardown | Message::Keepalive | Message::KeepaliveAck => {}
            Message::Publication(p) => p.encode(&mut buf),
            Message::PublicationAck(ack) => {
                buf.put_slice(&ack.pub_id.to_bytes());
                buf.put_u32_le(ack.seq);
                buf.put_slice(&ack.acker.to_bytes());
                buf.put_u32_le(ack.payload.len() as u32);
                buf.put_slice(&ack.payload);
            }
        }
        buf
    }

    /// Decode a body of the given type; the whole body must be consumed
    pub fn decode(message_type: MessageType, body: &[u8]) -> CanopyResult<Self> {
        let mut buf = body;
        let message = match message_type {
            MessageType::Handshake => Message::Handshake(get_handshake(&mut buf)?),
            MessageType::HandshakeAck => {
                need(buf, 1)?;
                let b = buf.get_u8();
                let status = LinkStatus::from_byte(b).ok_or_else(|| {
                    CanopyError::InvalidWireFormat(format!("Unknown link status {}", b))
                })?;
                Message::HandshakeAck(HandshakeAck {
                    status,
                    identity: get_handshake(&mut buf)?,
                })
            }
            MessageType::Interest => {
                need(buf, 8)?;
                let revision = buf.get_u64_le();
                let routes = get_routes(&mut buf)?;
                Message::Interest(InterestAdvertisement { revision, routes })
            }
            MessageType::InterestAck => {
                need(buf, 8)?;
                Message::InterestAck(InterestAck {
                    revision: buf.get_u64_le(),
                })
            }
            MessageType::Teardown => Message::Teardown,
            MessageType::Keepalive => Message::Keepalive,
            MessageType::KeepaliveAck => Message::KeepaliveAck,
            MessageType::Publication => Message::Publication(PublicationBody::decode(&mut buf)?),
            MessageType::PublicationAck => {
                let pub_id = PubId::from_bytes(get_array::<ID128_SIZE>(&mut buf)?);
                need(buf, 4)?;
                let seq = buf.get_u32_le();
                let acker = NodeId::from_bytes(get_array::<8>(&mut buf)?);
                let payload = get_bytes(&mut buf)?;
                Message::PublicationAck(PublicationAck {
                    pub_id,
                    seq,
                    acker,
                    payload,
                })
            }
        };
        finish(buf)?;
        Ok(message)
    }
}

fn put_handshake(buf: &mut Vec<u8>, h: &Handshake) {
    buf.put_u16_le(h.port);
    buf.put_slice(&h.verifying_key);
    buf.put_slice(&h.signature);
}

fn get_handshake(buf: &mut &[u8]) -> CanopyResult<Handshake> {
    need(buf, 2)?;
    let port = buf.get_u16_le();
    Ok(Handshake {
        port,
        verifying_key: get_array::<VERIFYING_KEY_SIZE>(buf)?,
        signature: get_array::<SIGNATURE_SIZE>(buf)?,
    })
}
