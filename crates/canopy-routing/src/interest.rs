//! Interest aggregation
//!
//! Every link carries interest in both directions. What this node advertises
//! on link `L` is its local subscriptions plus the interest received on every
//! link other than `L`, so a link's own interest is never echoed back to it.
//!
//! Each advertised pattern travels as a route naming the nodes it passed
//! through. A node drops routes that already name it and never sends a route
//! naming the receiver, so interest cannot circle back through a cycle and
//! keep itself alive after the subscription behind it is gone. Per pattern
//! only the shortest known route is passed on.
//!
//! Advertisements are revisioned per link. A revision only moves when the
//! advertised set changes; the peer acknowledges each revision it applies and
//! unacknowledged revisions are retransmitted. A set too large for one frame
//! is generalized until it fits.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use canopy_core::{NodeId, SubscriptionId, Topic, TopicPattern};
use canopy_wire::{InterestAdvertisement, InterestRoute, MAX_FRAME_SIZE, MAX_ROUTE_HOPS};

use crate::LinkId;

/// A compacted set of topic patterns.
///
/// No member covers another, so the set is the smallest equivalent
/// description of the topics it matches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterestSet {
    patterns: BTreeSet<TopicPattern>,
}

impl InterestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_patterns<I>(patterns: I) -> Self
    where
        I: IntoIterator<Item = TopicPattern>,
    {
        let mut set = InterestSet::new();
        set.extend(patterns);
        set
    }

    /// Add a pattern. Returns false if an existing pattern already covers it.
    pub fn insert(&mut self, pattern: TopicPattern) -> bool {
        if self.patterns.iter().any(|p| p.covers(&pattern)) {
            return false;
        }
        self.patterns.retain(|p| !pattern.covers(p));
        self.patterns.insert(pattern);
        true
    }

    pub fn extend<I>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = TopicPattern>,
    {
        for p in patterns {
            self.insert(p);
        }
    }

    /// Does any pattern match any of the topics
    pub fn matches(&self, topics: &[Topic]) -> bool {
        self.patterns
            .iter()
            .any(|p| topics.iter().any(|t| p.matches(t)))
    }

    /// Is every topic matched by `pattern` also matched by this set
    pub fn covers(&self, pattern: &TopicPattern) -> bool {
        self.patterns.iter().any(|p| p.covers(pattern))
    }

    /// Is `pattern` itself a member
    pub fn contains(&self, pattern: &TopicPattern) -> bool {
        self.patterns.contains(pattern)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &TopicPattern> {
        self.patterns.iter()
    }

    pub fn to_vec(&self) -> Vec<TopicPattern> {
        self.patterns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Outcome of an inbound advertisement
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundUpdate {
    /// Newer revision; the link's interest was replaced
    Applied,
    /// Same revision as last applied; acknowledge again, change nothing
    Duplicate,
    /// Older than last applied; ignore
    Stale,
    /// Link is not attached
    UnknownLink,
}

impl InboundUpdate {
    /// Should the sender get an `InterestAck`
    pub fn needs_ack(self) -> bool {
        matches!(self, InboundUpdate::Applied | InboundUpdate::Duplicate)
    }
}

/// An advertisement to put on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub link: LinkId,
    pub revision: u64,
    pub routes: Vec<InterestRoute>,
}

impl Advertisement {
    pub fn patterns(&self) -> Vec<TopicPattern> {
        self.routes.iter().map(|r| r.pattern.clone()).collect()
    }
}

/// Pattern to the path (excluding this node) of the route it came by
type RouteMap = BTreeMap<TopicPattern, Vec<NodeId>>;

fn is_better(path: &[NodeId], than: &[NodeId]) -> bool {
    (path.len(), path) < (than.len(), than)
}

/// Drop every route whose pattern another route covers
fn compact(routes: &mut RouteMap) {
    let set = InterestSet::from_patterns(routes.keys().cloned());
    routes.retain(|pattern, _| set.contains(pattern));
}

/// Cut every pattern to `depth` segments, merging the paths of routes that
/// collapse into one. A merged path names every node any of them named.
fn generalize(routes: RouteMap, depth: usize) -> RouteMap {
    let mut merged = RouteMap::new();
    for (pattern, path) in routes {
        let into = merged.entry(pattern.generalize(depth)).or_default();
        for hop in path {
            if !into.contains(&hop) {
                into.push(hop);
            }
        }
    }
    compact(&mut merged);
    merged
}

#[derive(Debug)]
struct Inbound {
    remote: NodeId,
    revision: u64,
    routes: RouteMap,
    interest: InterestSet,
}

#[derive(Debug, Default)]
struct Outbound {
    revision: u64,
    sent: Option<Vec<InterestRoute>>,
    acked: bool,
    retries: u32,
    last_sent_at: Option<Instant>,
}

impl Outbound {
    fn advertisement(&self, link: LinkId) -> Advertisement {
        Advertisement {
            link,
            revision: self.revision,
            routes: self.sent.clone().unwrap_or_default(),
        }
    }
}

/// Per-node interest state: local subscriptions and per-link interest
#[derive(Debug)]
pub struct InterestTable {
    node: NodeId,
    frame_budget: usize,
    local: BTreeMap<SubscriptionId, Vec<TopicPattern>>,
    inbound: HashMap<LinkId, Inbound>,
    outbound: HashMap<LinkId, Outbound>,
}

impl InterestTable {
    /// Interest state for the node `node`
    pub fn new(node: NodeId) -> Self {
        InterestTable {
            node,
            frame_budget: MAX_FRAME_SIZE,
            local: BTreeMap::new(),
            inbound: HashMap::new(),
            outbound: HashMap::new(),
        }
    }

    /// Largest advertisement frame to produce, in bytes
    pub fn set_frame_budget(&mut self, bytes: usize) {
        self.frame_budget = bytes.min(MAX_FRAME_SIZE);
    }

    /// Register (or replace) a local subscription's patterns
    pub fn add_local(&mut self, id: SubscriptionId, patterns: Vec<TopicPattern>) {
        self.local.insert(id, patterns);
    }

    pub fn remove_local(&mut self, id: SubscriptionId) -> bool {
        self.local.remove(&id).is_some()
    }

    pub fn local(&self, id: SubscriptionId) -> Option<&[TopicPattern]> {
        self.local.get(&id).map(Vec::as_slice)
    }

    /// Union of every local subscription, compacted
    pub fn local_patterns(&self) -> InterestSet {
        InterestSet::from_patterns(self.local.values().flatten().cloned())
    }

    /// Local subscriptions in id order
    pub fn local_subscriptions(&self) -> impl Iterator<Item = (SubscriptionId, &[TopicPattern])> {
        self.local.iter().map(|(id, p)| (*id, p.as_slice()))
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    /// Start tracking interest for a newly established link to `remote`
    pub fn attach(&mut self, link: LinkId, remote: NodeId) {
        self.inbound.entry(link).or_insert_with(|| Inbound {
            remote,
            revision: 0,
            routes: RouteMap::new(),
            interest: InterestSet::new(),
        });
        self.outbound.entry(link).or_default();
    }

    /// Forget a link and everything it contributed
    pub fn detach(&mut self, link: LinkId) -> bool {
        let had_in = self.inbound.remove(&link).is_some();
        let had_out = self.outbound.remove(&link).is_some();
        had_in || had_out
    }

    /// Start the link over as if just attached; the peer lost its state
    pub fn reset(&mut self, link: LinkId) -> bool {
        let Some(remote) = self.inbound.get(&link).map(|i| i.remote) else {
            return false;
        };
        self.detach(link);
        self.attach(link, remote);
        true
    }

    pub fn is_attached(&self, link: LinkId) -> bool {
        self.inbound.contains_key(&link)
    }

    /// Apply a peer's advertisement for `link`. A newer revision replaces the
    /// link's interest as a whole. Routes that do not start at the peer or
    /// that already passed through this node are discarded.
    pub fn apply_inbound(
        &mut self,
        link: LinkId,
        revision: u64,
        routes: Vec<InterestRoute>,
    ) -> InboundUpdate {
        let node = self.node;
        let Some(entry) = self.inbound.get_mut(&link) else {
            return InboundUpdate::UnknownLink;
        };
        if revision < entry.revision {
            return InboundUpdate::Stale;
        }
        if revision == entry.revision {
            return InboundUpdate::Duplicate;
        }

        let mut kept = RouteMap::new();
        let mut looped = 0usize;
        for route in routes {
            if route.path.first() != Some(&entry.remote) || route.path.contains(&node) {
                looped += 1;
                continue;
            }
            match kept.get(&route.pattern) {
                Some(current) if !is_better(&route.path, current) => {}
                _ => {
                    kept.insert(route.pattern, route.path);
                }
            }
        }
        entry.revision = revision;
        entry.interest = InterestSet::from_patterns(kept.keys().cloned());
        entry.routes = kept;
        tracing::trace!(
            %link,
            revision,
            patterns = entry.interest.len(),
            looped,
            "inbound interest applied"
        );
        InboundUpdate::Applied
    }

    /// Interest the peer on `link` advertised to us
    pub fn received(&self, link: LinkId) -> Option<&InterestSet> {
        self.inbound.get(&link).map(|i| &i.interest)
    }

    /// Patterns we last advertised on `link`
    pub fn sent(&self, link: LinkId) -> Option<Vec<TopicPattern>> {
        self.outbound
            .get(&link)
            .and_then(|o| o.sent.as_ref())
            .map(|routes| routes.iter().map(|r| r.pattern.clone()).collect())
    }

    /// Revision last advertised on `link` and whether the peer acknowledged it
    pub fn sent_revision(&self, link: LinkId) -> Option<(u64, bool)> {
        self.outbound.get(&link).map(|o| (o.revision, o.acked))
    }

    /// What `link` should currently be told: local interest plus the best
    /// route per pattern from every other link, leaving out routes that
    /// already passed through the peer. Generalized if it would not fit in
    /// one frame.
    pub fn advertisement_for(&self, link: LinkId) -> Vec<InterestRoute> {
        let remote = self.inbound.get(&link).map(|i| i.remote);

        let mut best = RouteMap::new();
        for pattern in self.local.values().flatten() {
            best.insert(pattern.clone(), Vec::new());
        }
        for (other, inbound) in &self.inbound {
            if *other == link {
                continue;
            }
            for (pattern, path) in &inbound.routes {
                if remote.is_some_and(|r| path.contains(&r)) || path.len() >= MAX_ROUTE_HOPS {
                    continue;
                }
                match best.get(pattern) {
                    Some(current) if !is_better(path, current) => {}
                    _ => {
                        best.insert(pattern.clone(), path.clone());
                    }
                }
            }
        }
        compact(&mut best);
        self.fit(best)
    }

    fn fit(&self, mut routes: RouteMap) -> Vec<InterestRoute> {
        let mut depth = routes.keys().map(|p| p.segments().len()).max().unwrap_or(0);
        loop {
            let wire = self.to_wire(&routes);
            let size = InterestAdvertisement {
                revision: 0,
                routes: wire.clone(),
            }
            .frame_size();
            if size <= self.frame_budget || depth == 0 {
                return wire;
            }
            depth -= 1;
            routes = generalize(routes, depth);
            tracing::debug!(
                node = %self.node,
                depth,
                patterns = routes.len(),
                "advertisement too large, generalizing"
            );
        }
    }

    fn to_wire(&self, routes: &RouteMap) -> Vec<InterestRoute> {
        routes
            .iter()
            .filter_map(|(pattern, path)| {
                if path.len() >= MAX_ROUTE_HOPS {
                    tracing::warn!(node = %self.node, %pattern, hops = path.len(), "route too long, not advertised");
                    return None;
                }
                let mut full = Vec::with_capacity(path.len() + 1);
                full.push(self.node);
                full.extend_from_slice(path);
                Some(InterestRoute {
                    pattern: pattern.clone(),
                    path: full,
                })
            })
            .collect()
    }

    /// Recompute every link's advertisement and return the ones that changed
    /// since last sent, each with a fresh revision. A link that has never
    /// been advertised to gets one even if it is empty.
    pub fn refresh(&mut self, now: Instant) -> Vec<Advertisement> {
        let mut links: Vec<LinkId> = self.outbound.keys().copied().collect();
        links.sort();

        let mut out = Vec::new();
        for link in links {
            let next = self.advertisement_for(link);
            let Some(outbound) = self.outbound.get_mut(&link) else {
                continue;
            };
            if outbound.sent.as_ref() == Some(&next) {
                continue;
            }
            outbound.revision += 1;
            outbound.sent = Some(next);
            outbound.acked = false;
            outbound.retries = 0;
            outbound.last_sent_at = Some(now);
            out.push(outbound.advertisement(link));
        }
        out
    }

    /// The advertisement on `link` never left this node; the next refresh
    /// sends it again under a new revision
    pub fn unsent(&mut self, link: LinkId) {
        if let Some(o) = self.outbound.get_mut(&link) {
            o.sent = None;
            o.acked = false;
        }
    }

    /// Some link is owed an advertisement
    pub fn needs_refresh(&self) -> bool {
        self.outbound.values().any(|o| o.sent.is_none())
    }

    /// Mark `revision` acknowledged on `link`. Acks for superseded
    /// revisions are ignored.
    pub fn acknowledge(&mut self, link: LinkId, revision: u64) -> bool {
        match self.outbound.get_mut(&link) {
            Some(o) if o.revision == revision && o.sent.is_some() => {
                o.acked = true;
                true
            }
            _ => false,
        }
    }

    /// Unacknowledged advertisements due for retransmission, and links that
    /// have used up their retries
    pub fn due_retransmits(
        &mut self,
        now: Instant,
        interval: Duration,
        max_retries: u32,
    ) -> (Vec<Advertisement>, Vec<LinkId>) {
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();
        for (link, o) in self.outbound.iter_mut() {
            if o.acked || o.sent.is_none() {
                continue;
            }
            let due = o
                .last_sent_at
                .map_or(true, |t| now.saturating_duration_since(t) >= interval);
            if !due {
                continue;
            }
            if o.retries >= max_retries {
                exhausted.push(*link);
                continue;
            }
            o.retries += 1;
            o.last_sent_at = Some(now);
            resend.push(o.advertisement(*link));
        }
        resend.sort_by_key(|a| a.link);
        exhausted.sort();
        (resend, exhausted)
    }

    /// Links whose received interest matches any of `topics`, except
    /// `exclude`
    pub fn forward_targets(&self, topics: &[Topic], exclude: Option<LinkId>) -> Vec<LinkId> {
        let mut targets: Vec<LinkId> = self
            .inbound
            .iter()
            .filter(|(link, _)| Some(**link) != exclude)
            .filter(|(_, i)| i.interest.matches(topics))
            .map(|(link, _)| *link)
            .collect();
        targets.sort();
        targets
    }

    /// Attached links in id order
    pub fn links(&self) -> Vec<LinkId> {
        let mut links: Vec<LinkId> = self.inbound.keys().copied().collect();
        links.sort();
        links
    }
}
