//! Observable node state: events, counters and snapshots

use std::net::SocketAddr;

use canopy_core::{CanopyError, NodeId, PublicationId, TopicPattern};
use canopy_routing::{LinkDirection, LinkId, LinkState, RouterStats};

/// Something that happened inside a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    /// A link moved to a new state
    LinkStateChanged {
        link: LinkId,
        remote: SocketAddr,
        state: LinkState,
    },
    /// A frame failed network-key or identity verification and was dropped
    AuthenticationFailed { remote: SocketAddr, reason: CanopyError },
    /// A publication was admitted but could not be opened
    PublicationDropped {
        id: PublicationId,
        reason: CanopyError,
    },
}

/// Event loop counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub ticks: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    /// Frames dropped for a bad tag or identity proof
    pub auth_failures: u64,
    /// Frames that did not parse or decode
    pub malformed: u64,
    /// Frames that verified but made no sense in the link's state
    pub unexpected: u64,
    /// Frames whose sequence the link had already admitted
    pub replayed: u64,
    pub keepalives_sent: u64,
    pub send_errors: u64,
    pub handshakes_sent: u64,
    pub advertisements_sent: u64,
    pub retransmits: u64,
    pub publications_sent: u64,
}

/// One link as seen from its node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub id: LinkId,
    pub remote_addr: SocketAddr,
    pub remote_node: Option<NodeId>,
    pub direction: LinkDirection,
    pub state: LinkState,
    /// What we last advertised on this link
    pub interest_sent: Vec<TopicPattern>,
    /// What the peer advertised to us
    pub interest_received: Vec<TopicPattern>,
    /// Revision of `interest_sent` and whether the peer acknowledged it
    pub sent_revision: u64,
    pub acknowledged: bool,
}

/// Point-in-time view of a running node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub local_addr: SocketAddr,
    pub links: Vec<LinkSnapshot>,
    pub subscriptions: usize,
    pub runtime: RuntimeStats,
    pub router: RouterStats,
}

impl NodeSnapshot {
    pub fn link_to(&self, remote: SocketAddr) -> Option<&LinkSnapshot> {
        self.links.iter().find(|l| l.remote_addr == remote)
    }

    pub fn established(&self) -> impl Iterator<Item = &LinkSnapshot> {
        self.links
            .iter()
            .filter(|l| l.state == LinkState::Established)
    }
}
