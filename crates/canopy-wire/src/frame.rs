//! Complete frame structure for the Canopy wire protocol
//!
//! Frame = Fixed Header + Body + Auth Tag

use canopy_core::{CanopyError, CanopyResult, NodeId};

use crate::{FixedHeader, FrameFlags, Message, FIXED_HEADER_SIZE, HEADER_NONCE_SIZE};

/// Auth tag size (network key)
pub const AUTH_TAG_SIZE: usize = 16;

/// Maximum frame size (fits a UDP datagram)
pub const MAX_FRAME_SIZE: usize = 65_000;

/// Header plus tag, for an empty body
pub const MIN_FRAME_SIZE: usize = FIXED_HEADER_SIZE + AUTH_TAG_SIZE;

/// Complete Canopy frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Fixed header
    pub header: FixedHeader,
    /// Encoded message body
    pub body: Vec<u8>,
    /// Authentication tag over header and body
    pub auth_tag: [u8; AUTH_TAG_SIZE],
}

impl Frame {
    /// Create a new frame
    pub fn new(header: FixedHeader) -> Self {
        Frame {
            header,
            body: Vec::new(),
            auth_tag: [0u8; AUTH_TAG_SIZE],
        }
    }

    /// Parse frame from bytes (without verifying the tag)
    pub fn parse(buf: &[u8]) -> CanopyResult<Self> {
        if buf.len() < MIN_FRAME_SIZE {
            return Err(CanopyError::BufferTooShort {
                expected: MIN_FRAME_SIZE,
                actual: buf.len(),
            });
        }
        if buf.len() > MAX_FRAME_SIZE {
            return Err(CanopyError::InvalidWireFormat(format!(
                "Frame too large: {} > {}",
                buf.len(),
                MAX_FRAME_SIZE
            )));
        }

        let header = FixedHeader::parse(buf)?;

        let body_end = buf.len() - AUTH_TAG_SIZE;
        if header.body_len as usize != body_end - FIXED_HEADER_SIZE {
            return Err(CanopyError::InvalidWireFormat(
                "Body length does not match frame".into(),
            ));
        }
        let body = buf[FIXED_HEADER_SIZE..body_end].to_vec();

        let mut auth_tag = [0u8; AUTH_TAG_SIZE];
        auth_tag.copy_from_slice(&buf[body_end..]);

        Ok(Frame {
            header,
            body,
            auth_tag,
        })
    }

    /// Serialize frame to bytes (tag should already be computed)
    pub fn serialize(&self) -> CanopyResult<Vec<u8>> {
        let total_size = self.size();
        if total_size > MAX_FRAME_SIZE {
            return Err(CanopyError::InvalidWireFormat(format!(
                "Frame too large: {} > {}",
                total_size, MAX_FRAME_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(total_size);
        buf.extend_from_slice(&self.associated_data());
        buf.extend_from_slice(&self.auth_tag);
        Ok(buf)
    }

    /// Bytes covered by the auth tag: header (with final body length) + body
    pub fn associated_data(&self) -> Vec<u8> {
        let mut header = self.header.clone();
        header.body_len = self.body.len() as u32;

        let mut aad = Vec::with_capacity(FIXED_HEADER_SIZE + self.body.len());
        aad.extend_from_slice(&header.to_bytes());
        aad.extend_from_slice(&self.body);
        aad
    }

    /// Decode the body according to the header's message type
    pub fn message(&self) -> CanopyResult<Message> {
        Message::decode(self.header.message_type, &self.body)
    }

    /// Bytes on the wire
    pub fn size(&self) -> usize {
        FIXED_HEADER_SIZE + self.body.len() + AUTH_TAG_SIZE
    }
}

/// Builds a frame around an encoded message
pub struct FrameBuilder {
    frame: Frame,
}

impl FrameBuilder {
    /// Start a frame carrying `message` from `node_id`
    pub fn new(node_id: NodeId, message: &Message) -> Self {
        let mut frame = Frame::new(FixedHeader::new(message.message_type(), node_id));
        frame.body = message.encode();
        frame.header.body_len = frame.body.len() as u32;
        FrameBuilder { frame }
    }

    pub fn flags(mut self, flags: FrameFlags) -> Self {
        self.frame.header.flags = flags;
        self
    }

    pub fn nonce(mut self, nonce: [u8; HEADER_NONCE_SIZE]) -> Self {
        self.frame.header.nonce = nonce;
        self
    }

    pub fn seq(mut self, seq: u64) -> Self {
        self.frame.header.seq = seq;
        self
    }

    pub fn auth_tag(mut self, tag: [u8; AUTH_TAG_SIZE]) -> Self {
        self.frame.auth_tag = tag;
        self
    }

    pub fn build(self) -> Frame {
        self.frame
    }
}
