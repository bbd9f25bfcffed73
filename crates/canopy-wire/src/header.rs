//! Fixed header for the Canopy wire protocol
//!
//! Fixed header is 36 bytes:
//! - Byte 0: Version (4 bits) + Crypto Suite (4 bits)
//! - Byte 1: Message type
//! - Byte 2: Flags
//! - Byte 3: Reserved (zero)
//! - Bytes 4-11: Sender node ID (LE)
//! - Bytes 12-15: Body length (LE)
//! - Bytes 16-27: Auth nonce
//! - Bytes 28-35: Sender frame sequence (LE)

use canopy_core::{CanopyError, CanopyResult, NodeId};

use crate::FrameFlags;

pub const FIXED_HEADER_SIZE: usize = 36;

/// Nonce size carried in every header
pub const HEADER_NONCE_SIZE: usize = 12;

pub const WIRE_VERSION: u8 = 1;

/// Algorithms a frame was produced with
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CryptoSuite {
    /// ChaCha20-Poly1305 + Ed25519 + HKDF-SHA256
    #[default]
    Suite0 = 0,
}

impl CryptoSuite {
    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0 => Some(CryptoSuite::Suite0),
            _ => None,
        }
    }

    #[inline]
    pub fn to_nibble(self) -> u8 {
        self as u8
    }
}

/// Message type carried in byte 1
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    Interest = 0x03,
    InterestAck = 0x04,
    Teardown = 0x05,
    Keepalive = 0x06,
    KeepaliveAck = 0x07,
    Publication = 0x10,
    PublicationAck = 0x11,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(MessageType::Handshake),
            0x02 => Some(MessageType::HandshakeAck),
            0x03 => Some(MessageType::Interest),
            0x04 => Some(MessageType::InterestAck),
            0x05 => Some(MessageType::Teardown),
            0x06 => Some(MessageType::Keepalive),
            0x07 => Some(MessageType::KeepaliveAck),
            0x10 => Some(MessageType::Publication),
            0x11 => Some(MessageType::PublicationAck),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Link-management and interest traffic
    #[inline]
    pub fn is_control(self) -> bool {
        !matches!(self, MessageType::Publication | MessageType::PublicationAck)
    }
}

/// Header in front of every frame, covered by the frame's auth tag
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedHeader {
    /// High nibble of byte 0
    pub version: u8,
    /// Low nibble of byte 0
    pub crypto_suite: CryptoSuite,
    pub message_type: MessageType,
    pub flags: FrameFlags,
    /// Sender node ID (the hop, not necessarily the publisher)
    pub node_id: NodeId,
    /// Body length in bytes
    pub body_len: u32,
    /// Nonce for the network-key auth tag
    pub nonce: [u8; HEADER_NONCE_SIZE],
    /// Strictly increasing per sender; receivers reject replays per link
    pub seq: u64,
}

impl FixedHeader {
    /// Header for `message_type` from `node_id`; zero nonce and length
    pub fn new(message_type: MessageType, node_id: NodeId) -> Self {
        FixedHeader {
            version: WIRE_VERSION,
            crypto_suite: CryptoSuite::default(),
            message_type,
            flags: FrameFlags::NONE,
            node_id,
            body_len: 0,
            nonce: [0u8; HEADER_NONCE_SIZE],
            seq: 0,
        }
    }

    pub fn parse(buf: &[u8]) -> CanopyResult<Self> {
        if buf.len() < FIXED_HEADER_SIZE {
            return Err(CanopyError::BufferTooShort {
                expected: FIXED_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let version = buf[0] >> 4;
        if version != WIRE_VERSION {
            return Err(CanopyError::InvalidWireFormat(format!(
                "Unsupported wire version {}",
                version
            )));
        }
        let crypto_suite = CryptoSuite::from_nibble(buf[0] & 0x0F)
            .ok_or_else(|| CanopyError::InvalidWireFormat("Unknown crypto suite".into()))?;

        // Byte 1: Message type
        let message_type =
            MessageType::from_byte(buf[1]).ok_or(CanopyError::UnknownMessageType(buf[1]))?;

        // Byte 2: Flags
        let flags = FrameFlags::new(buf[2]);

        // Bytes 4-11: Node ID
        let mut node_bytes = [0u8; 8];
        node_bytes.copy_from_slice(&buf[4..12]);
        let node_id = NodeId::from_bytes(node_bytes);

        // Bytes 12-15: Body length
        let body_len = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        // Bytes 16-27: Nonce
        let mut nonce = [0u8; HEADER_NONCE_SIZE];
        nonce.copy_from_slice(&buf[16..28]);

        // Bytes 28-35: Sequence
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&buf[28..FIXED_HEADER_SIZE]);
        let seq = u64::from_le_bytes(seq_bytes);

        Ok(FixedHeader {
            version,
            crypto_suite,
            message_type,
            flags,
            node_id,
            body_len,
            nonce,
            seq,
        })
    }

    /// Write into the first `FIXED_HEADER_SIZE` bytes of `buf`
    pub fn serialize(&self, buf: &mut [u8]) -> CanopyResult<()> {
        if buf.len() < FIXED_HEADER_SIZE {
            return Err(CanopyError::BufferTooShort {
                expected: FIXED_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        buf[..FIXED_HEADER_SIZE].copy_from_slice(&self.to_bytes());
        Ok(())
    }

    /// Serialize header to a new array
    pub fn to_bytes(&self) -> [u8; FIXED_HEADER_SIZE] {
        let mut buf = [0u8; FIXED_HEADER_SIZE];
        buf[0] = (self.version << 4) | self.crypto_suite.to_nibble();
        buf[1] = self.message_type.to_byte();
        buf[2] = self.flags.0;
        buf[4..12].copy_from_slice(&self.node_id.to_bytes());
        buf[12..16].copy_from_slice(&self.body_len.to_le_bytes());
        buf[16..28].copy_from_slice(&self.nonce);
        buf[28..FIXED_HEADER_SIZE].copy_from_slice(&self.seq.to_le_bytes());
        buf
    }
}
