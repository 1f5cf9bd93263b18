//! Prefetch Session - lifecycle of one outstanding prefetch
//!
//! Tracks the active correlator, the slots still in flight, and the demand
//! calls parked until the in-flight fetch resolves.

use std::collections::{HashSet, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::types::{Correlator, DemandResponse};

// ============================================================================
// Prefetch States
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefetchState {
    /// No prefetch launched yet
    New,
    /// Fetch issued, awaiting transport
    InProgress,
    /// Fetch resolved, cache may be consumed
    Ready,
    /// Every cached slot of the active correlator consumed
    Used,
}

impl PrefetchState {
    /// Cache lookups only happen in this state.
    pub fn serves_cache(&self) -> bool {
        matches!(self, PrefetchState::Ready)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SessionTransition {
    Launch,  // any -> InProgress
    Resolve, // InProgress -> Ready
    Exhaust, // Ready -> Used
}

// ============================================================================
// Deferred demand calls
// ============================================================================

/// A demand call parked while its slots were in flight. Replayed in FIFO
/// order once the session is ready.
#[derive(Debug)]
pub struct DeferredDemand {
    pub correlator: Correlator,
    pub slot_ids: Vec<String>,
    pub reply: oneshot::Sender<DemandResponse>,
}

// ============================================================================
// Prefetch Session
// ============================================================================

#[derive(Debug)]
pub struct PrefetchSession {
    state: PrefetchState,
    correlator: Option<Correlator>,
    pending: HashSet<String>,
    deferred: VecDeque<DeferredDemand>,
    /// Bumped on every launch so late resolutions can be recognized
    cycle: u64,
}

impl PrefetchSession {
    pub fn new() -> Self {
        Self {
            state: PrefetchState::New,
            correlator: None,
            pending: HashSet::new(),
            deferred: VecDeque::new(),
            cycle: 0,
        }
    }

    pub fn state(&self) -> PrefetchState {
        self.state
    }

    pub fn correlator(&self) -> Option<&Correlator> {
        self.correlator.as_ref()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn pending(&self) -> &HashSet<String> {
        &self.pending
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn transition(&mut self, transition: SessionTransition) -> Result<PrefetchState, &'static str> {
        let new_state = match (self.state, transition) {
            (_, SessionTransition::Launch) => PrefetchState::InProgress,
            (PrefetchState::InProgress, SessionTransition::Resolve) => PrefetchState::Ready,
            (PrefetchState::Ready, SessionTransition::Exhaust) => PrefetchState::Used,
            _ => return Err("Invalid prefetch transition"),
        };

        debug!("[PREFETCH] {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
        Ok(new_state)
    }

    /// Start a new cycle. Calls deferred by earlier cycles stay queued.
    pub fn launch(&mut self, correlator: Correlator, slot_ids: &[String]) -> u64 {
        if let Err(e) = self.transition(SessionTransition::Launch) {
            warn!("[PREFETCH] launch from {:?}: {}", self.state, e);
            self.state = PrefetchState::InProgress;
        }
        self.correlator = Some(correlator);
        self.pending = slot_ids.iter().cloned().collect();
        self.cycle += 1;
        self.cycle
    }

    /// Remove requested ids that are still in flight. True if any were.
    pub fn claim_pending(&mut self, slot_ids: &[String]) -> bool {
        let mut overlap = false;
        for id in slot_ids {
            if self.pending.remove(id) {
                overlap = true;
            }
        }
        overlap
    }

    pub fn defer(&mut self, call: DeferredDemand) {
        self.deferred.push_back(call);
    }

    /// Resolve the fetch launched in `cycle`.
    ///
    /// Returns the released calls in enqueue order, or `None` when a newer
    /// cycle has started since (the late result is not the active one).
    pub fn resolve(&mut self, cycle: u64) -> Option<Vec<DeferredDemand>> {
        if cycle != self.cycle {
            return None;
        }
        self.transition(SessionTransition::Resolve).ok()?;
        Some(self.deferred.drain(..).collect())
    }

    pub fn exhaust(&mut self) -> Result<PrefetchState, &'static str> {
        self.transition(SessionTransition::Exhaust)
    }
}

impl Default for PrefetchSession {
    fn default() -> Self {
        Self::new()
    }
}
