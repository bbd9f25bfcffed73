//! Publication routing
//!
//! For one incoming publication the router decides, in order:
//! 1. drop it if its (uuid, seq) was already seen
//! 2. remember it and the link it arrived on
//! 3. open the payload; an undecryptable publication goes nowhere
//! 4. deliver to every local subscription it matches
//! 5. forward on every other established link whose received interest
//!    matches
//!
//! The decision is returned to the caller; frames are built elsewhere.

use std::time::{Duration, Instant};

use canopy_core::{matched_topics, CanopyResult, PublicationId, SubscriptionId, Topic};
use canopy_crypto::CryptoEnvelope;
use canopy_wire::PublicationBody;

use crate::{DedupCache, InterestTable, LinkId, LinkTable, Origin};

/// A local subscription that should see the publication
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    /// Publication topics matched by this subscription
    pub matched: Vec<Topic>,
}

/// Routing outcome for one publication
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDecision {
    pub id: PublicationId,
    /// Already seen; nothing else is populated
    pub duplicate: bool,
    pub deliveries: Vec<Delivery>,
    pub forwards: Vec<LinkId>,
    /// Opened payload, present unless duplicate
    pub plaintext: Option<Vec<u8>>,
}

impl RouteDecision {
    fn duplicate(id: PublicationId) -> Self {
        RouteDecision {
            id,
            duplicate: true,
            deliveries: Vec::new(),
            forwards: Vec::new(),
            plaintext: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty() && self.forwards.is_empty()
    }
}

/// Router counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Publications admitted (not duplicates)
    pub routed: u64,
    pub duplicates: u64,
    /// Local deliveries decided
    pub delivered: u64,
    /// Link forwards decided
    pub forwarded: u64,
    /// Dropped because the payload could not be opened
    pub undecryptable: u64,
    pub acks_routed: u64,
    /// Acks with no remembered path back
    pub acks_dropped: u64,
}

/// Dedup, decrypt and fan-out for one node
#[derive(Debug)]
pub struct PublicationRouter {
    dedup: DedupCache,
    envelope: CryptoEnvelope,
    stats: RouterStats,
}

impl PublicationRouter {
    pub fn new(envelope: CryptoEnvelope, dedup_capacity: usize, dedup_ttl: Duration) -> Self {
        PublicationRouter {
            dedup: DedupCache::new(dedup_capacity, dedup_ttl),
            envelope,
            stats: RouterStats::default(),
        }
    }

    pub fn route(
        &mut self,
        body: &PublicationBody,
        origin: Origin,
        links: &LinkTable,
        interest: &InterestTable,
    ) -> CanopyResult<RouteDecision> {
        self.route_at(body, origin, links, interest, Instant::now())
    }

    /// Route a publication that entered at `origin`.
    ///
    /// Fails with `KeyNotFound` or `Authentication` when a sealed payload
    /// cannot be opened; the publication is then neither delivered nor
    /// forwarded, but stays recorded so retransmissions are suppressed too.
    pub fn route_at(
        &mut self,
        body: &PublicationBody,
        origin: Origin,
        links: &LinkTable,
        interest: &InterestTable,
        now: Instant,
    ) -> CanopyResult<RouteDecision> {
        let id = body.id();
        if self.dedup.seen_at(id, now) {
            self.stats.duplicates += 1;
            tracing::trace!(pub_id = %id.pub_id, seq = id.seq, ?origin, "duplicate publication");
            return Ok(RouteDecision::duplicate(id));
        }
        self.dedup.record_at(id, origin, now);

        let plaintext = match self.envelope.open_publication(body) {
            Ok(p) => p,
            Err(e) => {
                self.stats.undecryptable += 1;
                tracing::debug!(pub_id = %id.pub_id, seq = id.seq, error = %e, "publication not opened");
                return Err(e);
            }
        };

        let deliveries: Vec<Delivery> = interest
            .local_subscriptions()
            .filter_map(|(subscription, patterns)| {
                let matched = matched_topics(patterns, &body.topics);
                if matched.is_empty() {
                    return None;
                }
                Some(Delivery {
                    subscription,
                    matched: matched.into_iter().cloned().collect(),
                })
            })
            .collect();

        let forwards: Vec<LinkId> = interest
            .forward_targets(&body.topics, origin.link())
            .into_iter()
            .filter(|link| links.is_established(*link))
            .collect();

        self.stats.routed += 1;
        self.stats.delivered += deliveries.len() as u64;
        self.stats.forwarded += forwards.len() as u64;

        Ok(RouteDecision {
            id,
            duplicate: false,
            deliveries,
            forwards,
            plaintext: Some(plaintext),
        })
    }

    /// Next hop for an acknowledgement of `id`: the origin the publication
    /// arrived from. `Origin::Local` means the ack reached its publisher.
    pub fn route_ack(&mut self, id: PublicationId, links: &LinkTable) -> Option<Origin> {
        let hop = match self.dedup.origin(&id) {
            Some(Origin::Local) => Some(Origin::Local),
            Some(Origin::Link(link)) if links.is_established(link) => Some(Origin::Link(link)),
            _ => None,
        };
        match hop {
            Some(_) => self.stats.acks_routed += 1,
            None => {
                self.stats.acks_dropped += 1;
                tracing::trace!(pub_id = %id.pub_id, seq = id.seq, "ack has no path back");
            }
        }
        hop
    }

    /// Age out dedup records
    pub fn expire(&mut self, now: Instant) {
        self.dedup.expire(now);
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn envelope(&self) -> &CryptoEnvelope {
        &self.envelope
    }
}
