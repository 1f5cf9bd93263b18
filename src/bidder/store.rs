//! Demand Store and Creative Cache
//!
//! Parsed bids are folded into per-slot targeting (Demand Store) and their
//! markup into the Creative Cache. Slots are consumed one at a time.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::error::PartnerError;
use super::parser::ParsedBid;
use super::types::{AuctionId, AuctionTargeting, Correlator, Demand, Dimensions};

// ============================================================================
// Auction ids
// ============================================================================

/// Monotonic auction id source. First id is 1; ids are never reused.
#[derive(Debug, Default)]
pub struct AuctionIdAllocator {
    last: u64,
}

impl AuctionIdAllocator {
    pub fn next_id(&mut self) -> AuctionId {
        self.last += 1;
        AuctionId(self.last)
    }

    pub fn current(&self) -> u64 {
        self.last
    }
}

// ============================================================================
// Creative Cache
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CreativeEntry {
    pub markup: String,
}

/// Markup keyed by `(auction id, dimensions)`. Entries are never evicted.
#[derive(Debug, Default)]
pub struct CreativeCache {
    entries: HashMap<(AuctionId, Dimensions), CreativeEntry>,
    /// slot id -> auction id of its most recent targeting entry
    latest: HashMap<String, AuctionId>,
}

impl CreativeCache {
    pub fn insert(&mut self, auction_id: AuctionId, dims: Dimensions, markup: String) {
        self.entries.insert((auction_id, dims), CreativeEntry { markup });
    }

    pub fn get(&self, auction_id: AuctionId, dims: Dimensions) -> Option<&CreativeEntry> {
        self.entries.get(&(auction_id, dims))
    }

    pub fn note_slot(&mut self, slot_id: &str, auction_id: AuctionId) {
        self.latest.insert(slot_id.to_string(), auction_id);
    }

    pub fn latest_auction(&self, slot_id: &str) -> Option<AuctionId> {
        self.latest.get(slot_id).copied()
    }

    /// Creative for the slot's most recent auction at the given size.
    pub fn lookup(&self, slot_id: &str, dims: Dimensions) -> Option<&CreativeEntry> {
        self.latest_auction(slot_id).and_then(|id| self.get(id, dims))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Merge
// ============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub accepted: usize,
    pub duplicates: usize,
    pub new_slots: usize,
}

/// Fold parsed bids into `targets`, writing creatives as a side effect.
///
/// The first bid for a `(slot, dimensions)` pair wins within one call. A slot
/// already present in `targets` keeps its timestamp and auction id.
pub fn merge_demand(
    bids: Vec<ParsedBid>,
    targets: &mut Demand,
    creatives: &mut CreativeCache,
    auction_ids: &mut AuctionIdAllocator,
    now_ms: u64,
) -> MergeStats {
    let mut stats = MergeStats::default();
    let mut seen: HashSet<(String, Dimensions)> = HashSet::new();

    for bid in bids {
        let label = bid.label();
        let dims = bid.record.dimensions();
        let slot_id = bid.record.slot_request_id;

        if !seen.insert((slot_id.clone(), dims)) {
            let dup = PartnerError::DuplicateRecord { slot_id, dimensions: dims.to_string() };
            debug!("[STORE] {}", dup);
            stats.duplicates += 1;
            continue;
        }

        let entry = targets.slot.entry(slot_id.clone()).or_insert_with(|| {
            stats.new_slots += 1;
            let id = auction_ids.next_id();
            creatives.note_slot(&slot_id, id);
            AuctionTargeting::new(now_ms, id)
        });
        entry.labels.push(label);
        creatives.insert(entry.auction_id, dims, bid.record.creative_markup);
        stats.accepted += 1;
    }

    stats
}

// ============================================================================
// Demand Store
// ============================================================================

/// Result of consuming cached slots.
#[derive(Debug, Default)]
pub struct TakeOutcome {
    pub demand: Demand,
    /// Entries dropped because they outlived the demand expiry
    pub expired: usize,
    /// Nothing left under the correlator
    pub exhausted: bool,
}

/// Targeting per correlator per slot.
#[derive(Debug, Default)]
pub struct DemandStore {
    by_correlator: HashMap<Correlator, Demand>,
}

impl DemandStore {
    /// Mutable targets for a correlator, created empty on first use.
    pub fn targets_mut(&mut self, correlator: &Correlator) -> &mut Demand {
        self.by_correlator.entry(correlator.clone()).or_default()
    }

    pub fn get(&self, correlator: &Correlator) -> Option<&Demand> {
        self.by_correlator.get(correlator)
    }

    pub fn contains(&self, correlator: &Correlator) -> bool {
        self.by_correlator.contains_key(correlator)
    }

    /// Consume the requested slots cached under `correlator`.
    ///
    /// Satisfied ids are removed from `slot_ids`; unsatisfied ones keep their
    /// order. Every looked-up entry is deleted whether or not it was fresh.
    /// Returns `None` when nothing was ever stored under the correlator.
    pub fn take(
        &mut self,
        correlator: &Correlator,
        slot_ids: &mut Vec<String>,
        demand_expiry_ms: i64,
        now_ms: u64,
    ) -> Option<TakeOutcome> {
        let targets = self.by_correlator.get_mut(correlator)?;
        let mut outcome = TakeOutcome::default();

        let mut i = slot_ids.len();
        while i > 0 {
            i -= 1;
            let Some(entry) = targets.slot.remove(&slot_ids[i]) else {
                continue;
            };
            if entry.is_fresh(now_ms, demand_expiry_ms) {
                let id = slot_ids.remove(i);
                outcome.demand.slot.insert(id, entry);
            } else {
                debug!("[STORE] {} expired after {}ms", slot_ids[i], entry.age_ms(now_ms));
                outcome.expired += 1;
            }
        }

        if targets.is_empty() {
            outcome.exhausted = true;
            self.by_correlator.remove(correlator);
        }
        Some(outcome)
    }
}
