//! Link arena and state machine
//!
//! Links are addressed by `LinkId` = (slot index, generation). Removing a
//! link bumps its slot's generation, so a stale id can never reach the link
//! that later reuses the slot.
//!
//! ```text
//! Pending ──► Established ──► Closed
//!    │
//!    └──────► Failed
//! ```
//!
//! An established link admits each sender sequence once, and only those
//! above the sequence of the frame that established it. Silent links are
//! pinged with keepalives and closed once too many go unanswered.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use canopy_core::{CanopyError, CanopyResult, NodeId};
use canopy_crypto::ReplayWindow;

/// Stable link handle
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId {
    index: u32,
    generation: u32,
}

impl LinkId {
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({}.{})", self.index, self.generation)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Where a publication entered this node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Published by this node
    Local,
    /// Received on a link
    Link(LinkId),
}

impl Origin {
    #[inline]
    pub fn link(self) -> Option<LinkId> {
        match self {
            Origin::Local => None,
            Origin::Link(id) => Some(id),
        }
    }
}

/// Link state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Handshake sent, awaiting acknowledgement
    Pending,
    /// Both ends authenticated; carries interest and publications
    Established,
    /// Torn down after being established
    Closed,
    /// Never established (timeout, rejection, cancellation)
    Failed,
}

impl LinkState {
    #[inline]
    pub fn is_live(self) -> bool {
        matches!(self, LinkState::Pending | LinkState::Established)
    }
}

/// Which end initiated the link
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkDirection {
    Outbound,
    Inbound,
}

/// Link record
#[derive(Clone, Debug)]
pub struct Link {
    pub id: LinkId,
    pub remote_addr: SocketAddr,
    pub remote_node: Option<NodeId>,
    pub direction: LinkDirection,
    pub state: LinkState,
    pub opened_at: Instant,
    /// Handshake deadline while pending
    pub deadline: Option<Instant>,
    /// Last time an admitted frame arrived
    pub last_heard: Instant,
    /// Keepalives sent since the link was last heard from
    pub keepalives_missed: u32,
    keepalive_sent_at: Option<Instant>,
    replay: ReplayWindow,
}

impl Link {
    fn new(remote_addr: SocketAddr, direction: LinkDirection, now: Instant) -> Self {
        Link {
            id: LinkId {
                index: 0,
                generation: 0,
            },
            remote_addr,
            remote_node: None,
            direction,
            state: LinkState::Pending,
            opened_at: now,
            deadline: None,
            last_heard: now,
            keepalives_missed: 0,
            keepalive_sent_at: None,
            replay: ReplayWindow::new(0),
        }
    }

    fn heard(&mut self, now: Instant) {
        self.last_heard = now;
        self.keepalives_missed = 0;
        self.keepalive_sent_at = None;
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    link: Option<Link>,
}

/// Arena of this node's links, at most one live link per remote address
#[derive(Debug, Default)]
pub struct LinkTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_addr: HashMap<SocketAddr, LinkId>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, mut link: Link) -> LinkId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = LinkId {
            index,
            generation: slot.generation,
        };
        link.id = id;
        self.by_addr.insert(link.remote_addr, id);
        slot.link = Some(link);
        id
    }

    fn ensure_unlinked(&self, remote_addr: &SocketAddr) -> CanopyResult<()> {
        if self.by_addr.contains_key(remote_addr) {
            return Err(CanopyError::AlreadyLinked);
        }
        Ok(())
    }

    /// Start an outbound link; `Pending` until acknowledged or `deadline`
    pub fn open(
        &mut self,
        remote_addr: SocketAddr,
        deadline: Instant,
        now: Instant,
    ) -> CanopyResult<LinkId> {
        self.ensure_unlinked(&remote_addr)?;
        let mut link = Link::new(remote_addr, LinkDirection::Outbound, now);
        link.deadline = Some(deadline);
        Ok(self.insert(link))
    }

    /// Record an authenticated inbound link; established immediately.
    /// `floor` is the sequence of the handshake that opened it.
    pub fn accept(
        &mut self,
        remote_addr: SocketAddr,
        remote_node: NodeId,
        floor: u64,
        now: Instant,
    ) -> CanopyResult<LinkId> {
        self.ensure_unlinked(&remote_addr)?;
        let mut link = Link::new(remote_addr, LinkDirection::Inbound, now);
        link.remote_node = Some(remote_node);
        link.state = LinkState::Established;
        link.replay = ReplayWindow::new(floor);
        Ok(self.insert(link))
    }

    /// `Pending -> Established`, admitting only sequences above `floor`.
    /// Idempotent for an established link.
    pub fn establish(
        &mut self,
        id: LinkId,
        remote_node: NodeId,
        floor: u64,
        now: Instant,
    ) -> CanopyResult<&Link> {
        let link = self.get_mut(id).ok_or(CanopyError::LinkNotFound)?;
        match link.state {
            LinkState::Pending => {
                link.state = LinkState::Established;
                link.remote_node = Some(remote_node);
                link.deadline = None;
                link.replay = ReplayWindow::new(floor);
                link.heard(now);
            }
            LinkState::Established => {}
            LinkState::Closed | LinkState::Failed => return Err(CanopyError::LinkNotFound),
        }
        Ok(&*link)
    }

    /// The peer handshook again on an established link. Only a handshake
    /// newer than every frame admitted so far restarts the link; from then
    /// on only sequences above `seq` count.
    pub fn restart(&mut self, id: LinkId, seq: u64, now: Instant) -> bool {
        match self.get_mut(id) {
            Some(link)
                if link.state == LinkState::Established && seq > link.replay.highest() =>
            {
                link.replay = ReplayWindow::new(seq);
                link.heard(now);
                true
            }
            _ => false,
        }
    }

    /// Admit a frame with sender sequence `seq` on an established link.
    /// False for a replay, an unknown link, or one not yet established.
    pub fn admit(&mut self, id: LinkId, seq: u64, now: Instant) -> bool {
        let Some(link) = self.get_mut(id) else {
            return false;
        };
        if link.state != LinkState::Established || !link.replay.accept(seq) {
            return false;
        }
        link.heard(now);
        true
    }

    /// Established links that have been quiet for `interval` and are due a
    /// keepalive, and links that left `max_missed` keepalives unanswered
    pub fn keepalive(
        &mut self,
        now: Instant,
        interval: Duration,
        max_missed: u32,
    ) -> (Vec<LinkId>, Vec<LinkId>) {
        let mut due = Vec::new();
        let mut dead = Vec::new();
        for link in self.slots.iter_mut().filter_map(|s| s.link.as_mut()) {
            if link.state != LinkState::Established
                || now.saturating_duration_since(link.last_heard) < interval
            {
                continue;
            }
            let waiting = link
                .keepalive_sent_at
                .is_some_and(|t| now.saturating_duration_since(t) < interval);
            if waiting {
                continue;
            }
            if link.keepalives_missed >= max_missed {
                dead.push(link.id);
                continue;
            }
            link.keepalives_missed += 1;
            link.keepalive_sent_at = Some(now);
            due.push(link.id);
        }
        due.sort();
        dead.sort();
        (due, dead)
    }

    /// Terminate a link and free its slot.
    ///
    /// A pending link ends `Failed`, an established one `Closed`. Returns the
    /// final record, or `None` for an unknown or stale id.
    pub fn remove(&mut self, id: LinkId) -> Option<Link> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let mut link = slot.link.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.by_addr.remove(&link.remote_addr);

        link.state = match link.state {
            LinkState::Pending | LinkState::Failed => LinkState::Failed,
            LinkState::Established | LinkState::Closed => LinkState::Closed,
        };
        link.deadline = None;
        Some(link)
    }

    pub fn get(&self, id: LinkId) -> Option<&Link> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.link.as_ref()
    }

    fn get_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.link.as_mut()
    }

    /// Live link to a remote address
    pub fn by_addr(&self, remote_addr: &SocketAddr) -> Option<&Link> {
        self.by_addr.get(remote_addr).and_then(|id| self.get(*id))
    }

    pub fn is_established(&self, id: LinkId) -> bool {
        self.get(id)
            .is_some_and(|l| l.state == LinkState::Established)
    }

    /// All live links
    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.slots.iter().filter_map(|s| s.link.as_ref())
    }

    pub fn established(&self) -> impl Iterator<Item = &Link> {
        self.iter().filter(|l| l.state == LinkState::Established)
    }

    /// Pending links whose handshake deadline has passed
    pub fn expired(&self, now: Instant) -> Vec<LinkId> {
        self.iter()
            .filter(|l| l.state == LinkState::Pending && l.deadline.is_some_and(|d| d <= now))
            .map(|l| l.id)
            .collect()
    }

    /// Number of live links
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}
