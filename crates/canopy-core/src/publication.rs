//! Publication metadata handed to subscribers and acknowledgement handlers

use crate::{KeyId, NodeId, PubId, PublicationId, Topic};

/// What a subscriber learns about a delivered publication
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicationMeta {
    /// Publisher-chosen 128-bit identity
    pub pub_id: PubId,
    /// Per-publisher sequence number
    pub seq: u32,
    /// Full topic set of the publication
    pub topics: Vec<Topic>,
    /// Topics that matched the receiving subscription
    pub matched: Vec<Topic>,
    /// Content key the payload was sealed under, if any
    pub key_id: Option<KeyId>,
    /// Publisher asked for acknowledgements
    pub ack_requested: bool,
}

impl PublicationMeta {
    #[inline]
    pub fn id(&self) -> PublicationId {
        PublicationId::new(self.pub_id, self.seq)
    }
}

/// Acknowledgement received by a publisher
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckInfo {
    pub pub_id: PubId,
    pub seq: u32,
    /// Node that issued the acknowledgement
    pub from: NodeId,
    pub payload: Vec<u8>,
}
