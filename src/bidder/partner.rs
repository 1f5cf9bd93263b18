//! Partner - prefetch coordinator and demand entry point
//!
//! One `Partner` per ad-network integration. Session, Demand Store, Creative
//! Cache, requested-impression ledger and auction ids live behind a single
//! mutex that is never held across a transport call, so every transition is
//! atomic with respect to other partner operations.
//!
//! Demand calls that overlap an in-flight prefetch are parked as
//! `DeferredDemand` continuations and replayed in FIFO order once the
//! prefetch resolves.

use anyhow::Context;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::{PartnerConfig, PartnerSettings};
use super::error::PartnerError;
use super::parser::{parse_demand, RequestedImpressions};
use super::rounding::RoundingConfiguration;
use super::session::{DeferredDemand, PrefetchSession, PrefetchState};
use super::store::{merge_demand, AuctionIdAllocator, CreativeCache, DemandStore};
use super::traits::{AnalyticsSink, BidTransport};
use super::types::*;

type Reply = oneshot::Sender<DemandResponse>;

/// What a demand call does after its synchronous phase.
enum Step {
    /// Fully served from cache
    Resolved(Demand, Reply),
    /// Cached part plus a request for the rest
    Fetch(Demand, BidRequest, Reply),
}

struct PartnerState {
    targeting_type: TargetingType,
    session: PrefetchSession,
    store: DemandStore,
    creatives: CreativeCache,
    requested: RequestedImpressions,
    auction_ids: AuctionIdAllocator,
}

struct Inner {
    settings: PartnerSettings,
    transport: Arc<dyn BidTransport>,
    analytics: Arc<dyn AnalyticsSink>,
    state: Mutex<PartnerState>,
}

#[derive(Clone)]
pub struct Partner {
    inner: Arc<Inner>,
}

impl Partner {
    pub fn new(
        settings: PartnerSettings,
        transport: Arc<dyn BidTransport>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        info!("[PARTNER] {} slots configured, transport={}, expiry={}ms",
              settings.slots.len(), transport.name(), settings.demand_expiry_ms);
        let state = PartnerState {
            targeting_type: settings.targeting_type,
            session: PrefetchSession::new(),
            store: DemandStore::default(),
            creatives: CreativeCache::default(),
            requested: RequestedImpressions::new(),
            auction_ids: AuctionIdAllocator::default(),
        };
        Self {
            inner: Arc::new(Inner { settings, transport, analytics, state: Mutex::new(state) }),
        }
    }

    /// Validate `config` and build a partner on it.
    pub fn from_config(
        config: &PartnerConfig,
        transport: Arc<dyn BidTransport>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Result<Self, PartnerError> {
        Ok(Self::new(config.validate()?, transport, analytics))
    }

    // === Capabilities ===

    pub fn settings(&self) -> &PartnerSettings {
        &self.inner.settings
    }

    pub fn target_keys(&self) -> &TargetKeys {
        &self.inner.settings.target_keys
    }

    pub fn demand_expiry_ms(&self) -> i64 {
        self.inner.settings.demand_expiry_ms
    }

    pub fn supported_analytics(&self) -> SupportedAnalytics {
        SupportedAnalytics { time: true, demand: true }
    }

    pub fn supported_options(&self) -> SupportedOptions {
        SupportedOptions { prefetch: true, demand_expiry_ms: self.demand_expiry_ms() }
    }

    pub async fn targeting_type(&self) -> TargetingType {
        self.inner.state.lock().await.targeting_type
    }

    /// False (and unchanged) when `tt` is not a supported targeting type.
    pub async fn set_targeting_type(&self, tt: &str) -> bool {
        match TargetingType::parse(tt) {
            Some(t) => {
                self.inner.state.lock().await.targeting_type = t;
                true
            }
            None => false,
        }
    }

    // === Introspection ===

    pub async fn prefetch_state(&self) -> PrefetchState {
        self.inner.state.lock().await.session.state()
    }

    pub async fn pending_slot_ids(&self) -> Vec<String> {
        let st = self.inner.state.lock().await;
        let mut ids: Vec<String> = st.session.pending().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn cached_slot_ids(&self, correlator: &Correlator) -> Vec<String> {
        let st = self.inner.state.lock().await;
        st.store.get(correlator).map(|d| d.slot_ids()).unwrap_or_default()
    }

    // === Prefetch ===

    /// Launch a prefetch cycle for `slot_ids` under `correlator`.
    ///
    /// Returns once the session is in progress; the fetch runs on the
    /// returned task.
    pub async fn prefetch_demand(&self, correlator: Correlator, slot_ids: Vec<String>) -> JoinHandle<()> {
        let (cycle, request) = {
            let mut st = self.inner.state.lock().await;
            let cycle = st.session.launch(correlator.clone(), &slot_ids);
            let request = build_request(&self.inner.settings, &mut st.requested, &slot_ids);
            (cycle, request)
        };
        info!("[PREFETCH] {} launched for {} slots ({} impressions)",
              correlator, slot_ids.len(), request.slots.len());

        let this = self.clone();
        tokio::spawn(async move {
            let result = this.submit_tracked(request).await;
            this.finish_prefetch(cycle, correlator, result).await;
        })
    }

    async fn finish_prefetch(&self, cycle: u64, correlator: Correlator, result: Result<String, PartnerError>) {
        let released = {
            let mut st = self.inner.state.lock().await;
            if let Ok(payload) = &result {
                let PartnerState { store, creatives, requested, auction_ids, .. } = &mut *st;
                ingest(payload, &self.inner.settings.rounding, requested, creatives, auction_ids,
                       store.targets_mut(&correlator));
            }
            st.session.resolve(cycle)
        };

        let error = result.err();
        if let Some(e) = &error {
            warn!("[PREFETCH] {} failed: {}", correlator, e);
        }
        self.inner.analytics.prefetch_complete(&correlator, error.as_ref());

        match released {
            None => debug!("[PREFETCH] {} resolved after a newer cycle started", correlator),
            Some(calls) => {
                info!("[PREFETCH] {} ready, releasing {} deferred calls", correlator, calls.len());
                for call in calls {
                    let this = self.clone();
                    let step = {
                        let mut st = self.inner.state.lock().await;
                        this.begin(&mut st, call.correlator, call.slot_ids, call.reply)
                    };
                    if let Some(step) = step {
                        tokio::spawn(async move { this.complete(step).await });
                    }
                }
            }
        }
    }

    // === Demand ===

    /// Demand for `slot_ids`, from the prefetch cache where possible.
    ///
    /// Waits for an in-flight prefetch when it covers any requested slot.
    pub async fn get_demand(&self, correlator: Correlator, slot_ids: Vec<String>) -> DemandResponse {
        let (tx, rx) = oneshot::channel();
        let step = {
            let mut st = self.inner.state.lock().await;
            self.begin(&mut st, correlator, slot_ids, tx)
        };
        if let Some(step) = step {
            self.complete(step).await;
        }
        rx.await.unwrap_or_default()
    }

    /// Synchronous phase of a demand call. `None` when the call was parked.
    fn begin(
        &self,
        st: &mut PartnerState,
        correlator: Correlator,
        mut slot_ids: Vec<String>,
        reply: Reply,
    ) -> Option<Step> {
        if st.session.state() == PrefetchState::InProgress && st.session.claim_pending(&slot_ids) {
            debug!("[DEMAND] {} deferred until prefetch resolves", correlator);
            st.session.defer(DeferredDemand { correlator, slot_ids, reply });
            return None;
        }

        let mut demand = Demand::default();
        if st.session.state().serves_cache() {
            if let Some(active) = st.session.correlator().cloned() {
                let taken = st.store.take(&active, &mut slot_ids, self.demand_expiry_ms(), now_ms());
                if let Some(out) = taken {
                    debug!("[DEMAND] {} served {} slots from cache, {} expired",
                           active, out.demand.len(), out.expired);
                    demand = out.demand;
                    if out.exhausted && st.session.exhaust().is_ok() {
                        info!("[PREFETCH] {} fully consumed", active);
                    }
                }
            }
            if slot_ids.is_empty() {
                return Some(Step::Resolved(demand, reply));
            }
        }

        let request = build_request(&self.inner.settings, &mut st.requested, &slot_ids);
        Some(Step::Fetch(demand, request, reply))
    }

    async fn complete(&self, step: Step) {
        match step {
            Step::Resolved(demand, reply) => {
                let _ = reply.send(DemandResponse::ok(demand));
            }
            Step::Fetch(demand, request, reply) => {
                let resp = self.fetch(demand, request).await;
                let _ = reply.send(resp);
            }
        }
    }

    async fn fetch(&self, mut demand: Demand, request: BidRequest) -> DemandResponse {
        match self.submit_tracked(request).await {
            Ok(payload) => {
                let mut st = self.inner.state.lock().await;
                let PartnerState { creatives, requested, auction_ids, .. } = &mut *st;
                ingest(&payload, &self.inner.settings.rounding, requested, creatives, auction_ids, &mut demand);
                DemandResponse::ok(demand)
            }
            Err(e) => {
                warn!("[DEMAND] fetch failed: {}", e);
                DemandResponse { demand, error: Some(e) }
            }
        }
    }

    /// Submit `request`; on failure its ids leave the requested ledger.
    async fn submit_tracked(&self, request: BidRequest) -> Result<String, PartnerError> {
        let sent = request.clone();
        let result = self.submit(request).await;
        if result.is_err() {
            self.inner.state.lock().await.requested.release(&sent);
        }
        result
    }

    async fn submit(&self, request: BidRequest) -> Result<String, PartnerError> {
        if request.slots.is_empty() {
            debug!("[DEMAND] nothing to request");
            return Ok(String::new());
        }
        self.inner.transport.submit_bid_request(request).await
    }

    // === Render ===

    /// Write the cached creative for `target` into `out`.
    ///
    /// Returns false, writing nothing, when there is no creative for the
    /// slot's latest auction at that size.
    pub async fn render_creative<W: Write>(&self, target: &RenderTarget, out: &mut W) -> anyhow::Result<bool> {
        if target.slot_id.is_empty() || target.width == 0 || target.height == 0 {
            warn!("[RENDER] Missing slot, width or height");
            return Ok(false);
        }

        let dims = Dimensions::new(target.width, target.height);
        let markup = {
            let st = self.inner.state.lock().await;
            st.creatives
                .lookup(&target.slot_id, dims)
                .map(|e| e.markup.clone())
                .filter(|m| !m.is_empty())
        };
        let Some(markup) = markup else {
            debug!("[RENDER] No ad for slot {} at {}", target.slot_id, dims);
            return Ok(false);
        };

        out.write_all(markup.as_bytes()).context("writing creative")?;
        out.flush().context("closing creative")?;
        Ok(true)
    }
}

/// One slot spec per configured zone; unconfigured slots are skipped.
fn build_request(settings: &PartnerSettings, requested: &mut RequestedImpressions, slot_ids: &[String]) -> BidRequest {
    let mut slots = Vec::new();
    for slot_id in slot_ids {
        let Some(zones) = settings.slots.get(slot_id) else {
            debug!("[DEMAND] slot {} is not configured", slot_id);
            continue;
        };
        for zone_id in zones {
            requested.record(slot_id);
            slots.push(SlotSpec { consuming_slot_id: slot_id.clone(), zone_id: *zone_id });
        }
    }
    BidRequest { profile_id: settings.profile_id, audit: settings.is_audit, slots }
}

fn ingest(
    payload: &str,
    rounding: &RoundingConfiguration,
    requested: &mut RequestedImpressions,
    creatives: &mut CreativeCache,
    auction_ids: &mut AuctionIdAllocator,
    targets: &mut Demand,
) {
    let parsed = parse_demand(payload, requested, rounding);
    let stats = merge_demand(parsed.bids, targets, creatives, auction_ids, now_ms());
    debug!("[STORE] accepted {} bids ({} new slots), dropped {} duplicates, {} rejects, {} no-bids",
           stats.accepted, stats.new_slots, stats.duplicates, parsed.rejects.len(), parsed.no_bids);
}
