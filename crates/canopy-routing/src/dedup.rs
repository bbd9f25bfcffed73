//! Duplicate suppression for publications
//!
//! Remembers (uuid, seq) identities in insertion order, bounded by both a
//! capacity and a time-to-live. The oldest record goes first whichever
//! limit is hit. Each record also keeps the link the publication arrived
//! on so acknowledgements can retrace the path.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use canopy_core::PublicationId;

use crate::Origin;

/// Default number of remembered publications
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// Default retention window
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(120);

/// A remembered publication
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DedupRecord {
    pub id: PublicationId,
    pub inserted_at: Instant,
    pub origin: Origin,
}

/// Bounded ring of recently seen publication identities
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    ttl: Duration,
    records: HashMap<PublicationId, DedupRecord>,
    /// Insertion order; each id appears once
    order: VecDeque<PublicationId>,
    evicted: u64,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        DedupCache {
            capacity,
            ttl,
            records: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            evicted: 0,
        }
    }

    /// Has this identity been recorded within the retention window
    pub fn seen(&mut self, id: PublicationId) -> bool {
        self.seen_at(id, Instant::now())
    }

    pub fn seen_at(&mut self, id: PublicationId, now: Instant) -> bool {
        self.expire(now);
        self.records.contains_key(&id)
    }

    /// Remember an identity. Returns false if it was already present, in
    /// which case the original record (and its origin) is kept.
    pub fn record(&mut self, id: PublicationId, origin: Origin) -> bool {
        self.record_at(id, origin, Instant::now())
    }

    pub fn record_at(&mut self, id: PublicationId, origin: Origin, now: Instant) -> bool {
        self.expire(now);
        if self.records.contains_key(&id) {
            return false;
        }
        while self.records.len() >= self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }
        self.records.insert(
            id,
            DedupRecord {
                id,
                inserted_at: now,
                origin,
            },
        );
        self.order.push_back(id);
        true
    }

    /// Where a remembered publication came from
    pub fn origin(&self, id: &PublicationId) -> Option<Origin> {
        self.records.get(id).map(|r| r.origin)
    }

    pub fn get(&self, id: &PublicationId) -> Option<&DedupRecord> {
        self.records.get(id)
    }

    /// Drop every record older than the retention window
    pub fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.order.front() {
            let expired = self
                .records
                .get(oldest)
                .map_or(true, |r| now.saturating_duration_since(r.inserted_at) >= self.ttl);
            if !expired {
                break;
            }
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) -> bool {
        match self.order.pop_front() {
            Some(id) => {
                self.records.remove(&id);
                self.evicted += 1;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Records dropped by capacity or age so far
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        DedupCache::new(DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL)
    }
}
