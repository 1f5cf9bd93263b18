use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use demand_prefetch::bidder::{
    AnalyticsSink, AuctionId, BidRequest, BidTransport, Correlator, ErrorKind, Partner,
    PartnerError, PartnerSettings, PrefetchState,
};

// ============================================================================
// Scripted transport
// ============================================================================

/// Answers every requested slot with its scripted bids.
#[derive(Default)]
struct ScriptedTransport {
    bids: HashMap<String, Vec<(u32, u32, f64)>>,
    extra: Vec<String>,
    requests: Mutex<Vec<BidRequest>>,
    fail_next: Mutex<Option<PartnerError>>,
    hold_first: AtomicBool,
    gate: Notify,
}

impl ScriptedTransport {
    fn with_bids(bids: &[(&str, u32, u32, f64)]) -> Self {
        let mut map: HashMap<String, Vec<(u32, u32, f64)>> = HashMap::new();
        for (slot, w, h, cpm) in bids {
            map.entry(slot.to_string()).or_default().push((*w, *h, *cpm));
        }
        Self { bids: map, ..Self::default() }
    }

    fn held(self) -> Self {
        self.hold_first.store(true, Ordering::SeqCst);
        self
    }

    fn release(&self) {
        self.gate.notify_one();
    }

    fn fail_next(&self, err: PartnerError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn requested_slots(&self, call: usize) -> Vec<String> {
        self.requests.lock().unwrap()[call]
            .slots
            .iter()
            .map(|s| s.consuming_slot_id.clone())
            .collect()
    }

    fn payload_for(&self, request: &BidRequest) -> String {
        let mut records = Vec::new();
        let mut answered = Vec::new();
        for spec in &request.slots {
            if answered.contains(&spec.consuming_slot_id) {
                continue;
            }
            answered.push(spec.consuming_slot_id.clone());
            for (w, h, cpm) in self.bids.get(&spec.consuming_slot_id).into_iter().flatten() {
                records.push(format!(
                    r#"{{"impid":"{}","width":{},"height":{},"cpm":{},"creative":"<div>{}</div>"}}"#,
                    spec.consuming_slot_id, w, h, cpm, spec.consuming_slot_id
                ));
            }
        }
        records.extend(self.extra.iter().cloned());
        format!(r#"{{"slots":[{}]}}"#, records.join(","))
    }
}

#[async_trait]
impl BidTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit_bid_request(&self, request: BidRequest) -> Result<String, PartnerError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.hold_first.swap(false, Ordering::SeqCst) {
            self.gate.notified().await;
        }
        let failure = self.fail_next.lock().unwrap().take();
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(self.payload_for(&request))
    }
}

#[derive(Default)]
struct RecordingAnalytics {
    events: Mutex<Vec<(Correlator, Option<ErrorKind>)>>,
}

impl AnalyticsSink for RecordingAnalytics {
    fn prefetch_complete(&self, correlator: &Correlator, error: Option<&PartnerError>) {
        self.events.lock().unwrap().push((correlator.clone(), error.map(|e| e.kind())));
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn settings(slots: &[(&str, &[u64])]) -> PartnerSettings {
    PartnerSettings::with_slots(
        slots.iter().map(|(id, zones)| (id.to_string(), zones.to_vec())).collect(),
    )
}

fn abc_settings() -> PartnerSettings {
    settings(&[("A", &[1]), ("B", &[2]), ("C", &[3])])
}

fn abc_transport() -> ScriptedTransport {
    ScriptedTransport::with_bids(&[("A", 300, 250, 1.25), ("B", 728, 90, 0.5), ("C", 160, 600, 3.0)])
}

fn build(
    settings: PartnerSettings,
    transport: ScriptedTransport,
) -> (Partner, Arc<ScriptedTransport>, Arc<RecordingAnalytics>) {
    let transport = Arc::new(transport);
    let analytics = Arc::new(RecordingAnalytics::default());
    let partner = Partner::new(settings, transport.clone(), analytics.clone());
    (partner, transport, analytics)
}

fn ids(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never reached");
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn overlapping_demand_waits_for_prefetch() {
    let (partner, transport, analytics) = build(abc_settings(), abc_transport().held());
    let c = Correlator::from("c1");

    let prefetch = partner.prefetch_demand(c.clone(), ids(&["A", "B", "C"])).await;
    assert_eq!(partner.prefetch_state().await, PrefetchState::InProgress);

    let p = partner.clone();
    let pending = tokio::spawn({
        let c = c.clone();
        async move { p.get_demand(c, ids(&["A", "B"])).await }
    });

    let p = partner.clone();
    wait_for(|| {
        let p = p.clone();
        async move { p.pending_slot_ids().await == vec!["C".to_string()] }
    })
    .await;
    assert!(!pending.is_finished());
    assert_eq!(transport.calls(), 1);

    transport.release();
    prefetch.await.unwrap();
    let resp = tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();

    assert!(resp.error.is_none());
    assert_eq!(resp.demand.slot_ids(), vec!["A", "B"]);
    assert_eq!(resp.demand.get("A").unwrap().labels, vec!["300x250_125"]);
    assert_eq!(resp.demand.get("B").unwrap().labels, vec!["728x90_50"]);
    // served from the prefetch, no second request
    assert_eq!(transport.calls(), 1);
    assert_eq!(partner.prefetch_state().await, PrefetchState::Ready);
    assert_eq!(partner.cached_slot_ids(&c).await, vec!["C"]);
    assert_eq!(analytics.events.lock().unwrap().as_slice(), &[(c, None)]);
}

#[tokio::test]
async fn deferred_calls_all_release_from_cache() {
    let (partner, transport, _) = build(abc_settings(), abc_transport().held());
    let c = Correlator::from("c1");
    let prefetch = partner.prefetch_demand(c.clone(), ids(&["A", "B", "C"])).await;

    let mut waiting = Vec::new();
    for slot in ["A", "B"] {
        let p = partner.clone();
        let c = c.clone();
        waiting.push(tokio::spawn(async move { p.get_demand(c, ids(&[slot])).await }));
        let p = partner.clone();
        wait_for(|| {
            let p = p.clone();
            async move { !p.pending_slot_ids().await.contains(&slot.to_string()) }
        })
        .await;
    }

    transport.release();
    prefetch.await.unwrap();
    for (handle, slot) in waiting.into_iter().zip(["A", "B"]) {
        let resp = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(resp.demand.slot_ids(), vec![slot]);
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn new_partner_always_fetches() {
    let (partner, transport, _) = build(abc_settings(), abc_transport());

    let resp = partner.get_demand("c0".into(), ids(&["C"])).await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(transport.requested_slots(0), vec!["C"]);
    assert_eq!(resp.demand.get("C").unwrap().labels, vec!["160x600_300"]);
    assert_eq!(partner.prefetch_state().await, PrefetchState::New);
}

#[tokio::test]
async fn consumed_slots_leave_cache_then_used() {
    let (partner, transport, _) = build(abc_settings(), abc_transport());
    let c = Correlator::from("c1");

    partner.prefetch_demand(c.clone(), ids(&["A", "B"])).await.await.unwrap();
    assert_eq!(partner.prefetch_state().await, PrefetchState::Ready);
    assert_eq!(partner.cached_slot_ids(&c).await, vec!["A", "B"]);

    let first = partner.get_demand(c.clone(), ids(&["A"])).await;
    assert_eq!(first.demand.get("A").unwrap().labels, vec!["300x250_125"]);
    assert_eq!(first.demand.get("A").unwrap().auction_id, AuctionId(1));
    assert_eq!(partner.cached_slot_ids(&c).await, vec!["B"]);
    assert_eq!(partner.prefetch_state().await, PrefetchState::Ready);

    partner.get_demand(c.clone(), ids(&["B"])).await;
    assert_eq!(partner.prefetch_state().await, PrefetchState::Used);
    assert!(partner.cached_slot_ids(&c).await.is_empty());
    assert_eq!(transport.calls(), 1);

    // nothing cached anymore: unconditional fetch
    let again = partner.get_demand(c, ids(&["A"])).await;
    assert_eq!(transport.calls(), 2);
    assert_eq!(again.demand.get("A").unwrap().auction_id, AuctionId(3));
}

#[tokio::test]
async fn partial_cache_hit_fetches_only_the_rest() {
    let (partner, transport, _) = build(abc_settings(), abc_transport());
    let c = Correlator::from("c1");
    partner.prefetch_demand(c.clone(), ids(&["A"])).await.await.unwrap();

    let resp = partner.get_demand(c, ids(&["A", "C"])).await;

    assert_eq!(transport.calls(), 2);
    assert_eq!(transport.requested_slots(1), vec!["C"]);
    assert_eq!(resp.demand.slot_ids(), vec!["A", "C"]);
    assert_eq!(partner.prefetch_state().await, PrefetchState::Used);
}

#[tokio::test]
async fn expired_demand_is_purged_not_returned() {
    let mut s = abc_settings();
    s.demand_expiry_ms = 20;
    let (partner, transport, _) = build(s, abc_transport());
    let c = Correlator::from("c1");
    partner.prefetch_demand(c.clone(), ids(&["A"])).await.await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    let resp = partner.get_demand(c.clone(), ids(&["A"])).await;

    // stale prefetch entry (auction 1) dropped, fresh fetch answered
    assert_eq!(transport.calls(), 2);
    assert_eq!(resp.demand.get("A").unwrap().auction_id, AuctionId(2));
    assert!(partner.cached_slot_ids(&c).await.is_empty());
    assert_eq!(partner.prefetch_state().await, PrefetchState::Used);
}

#[tokio::test]
async fn negative_expiry_never_expires() {
    let mut s = abc_settings();
    s.demand_expiry_ms = -1;
    let (partner, transport, _) = build(s, abc_transport());
    let c = Correlator::from("c1");
    partner.prefetch_demand(c.clone(), ids(&["A"])).await.await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let resp = partner.get_demand(c, ids(&["A"])).await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(resp.demand.get("A").unwrap().auction_id, AuctionId(1));
}

#[tokio::test]
async fn prefetch_timeout_still_releases_callers() {
    let transport = abc_transport().held();
    transport.fail_next(PartnerError::TransportTimeout);
    let (partner, transport, analytics) = build(abc_settings(), transport);
    let c = Correlator::from("c1");

    let prefetch = partner.prefetch_demand(c.clone(), ids(&["A", "B"])).await;
    let p = partner.clone();
    let c2 = c.clone();
    let waiting = tokio::spawn(async move { p.get_demand(c2, ids(&["A"])).await });
    let p = partner.clone();
    wait_for(|| {
        let p = p.clone();
        async move { p.pending_slot_ids().await == vec!["B".to_string()] }
    })
    .await;

    transport.release();
    prefetch.await.unwrap();
    let resp = tokio::time::timeout(Duration::from_secs(2), waiting).await.unwrap().unwrap();

    assert_eq!(partner.prefetch_state().await, PrefetchState::Ready);
    assert_eq!(
        analytics.events.lock().unwrap().as_slice(),
        &[(c, Some(ErrorKind::TransportTimeout))]
    );
    // nothing cached, so the replayed call fetched for itself
    assert!(resp.error.is_none());
    assert_eq!(transport.calls(), 2);
    assert_eq!(resp.demand.slot_ids(), vec!["A"]);
}

#[tokio::test]
async fn fetch_error_reported_with_partial_demand() {
    let (partner, transport, _) = build(abc_settings(), abc_transport());
    let c = Correlator::from("c1");
    partner.prefetch_demand(c.clone(), ids(&["A"])).await.await.unwrap();

    transport.fail_next(PartnerError::TransportStatus { status: 500, detail: String::new() });
    let resp = partner.get_demand(c, ids(&["A", "B"])).await;

    assert_eq!(resp.error.as_ref().map(|e| e.kind()), Some(ErrorKind::TransportStatus));
    assert_eq!(resp.demand.slot_ids(), vec!["A"]);
}

#[tokio::test]
async fn failed_fetches_do_not_widen_the_requested_ledger() {
    let transport = ScriptedTransport::with_bids(&[
        ("A", 300, 250, 1.0),
        ("A", 728, 90, 1.0),
        ("A", 160, 600, 1.0),
    ]);
    let (partner, transport, _) = build(settings(&[("A", &[1])]), transport);
    let c = Correlator::from("c1");

    transport.fail_next(PartnerError::TransportTimeout);
    partner.prefetch_demand(c.clone(), ids(&["A"])).await.await.unwrap();
    for _ in 0..2 {
        transport.fail_next(PartnerError::TransportTimeout);
        let resp = partner.get_demand(c.clone(), ids(&["A"])).await;
        assert_eq!(resp.error, Some(PartnerError::TransportTimeout));
        assert!(resp.demand.is_empty());
    }

    // one zone requested, so only the first record is solicited
    let resp = partner.get_demand(c, ids(&["A"])).await;
    assert!(resp.error.is_none());
    assert_eq!(transport.calls(), 4);
    assert_eq!(resp.demand.get("A").unwrap().labels, vec!["300x250_100"]);
}

#[tokio::test]
async fn unsolicited_and_duplicate_records_dropped() {
    let mut transport = ScriptedTransport::with_bids(&[
        ("D", 300, 250, 1.0),
        ("D", 300, 250, 2.0),
    ]);
    transport.extra.push(
        r#"{"impid":"Z","width":300,"height":250,"cpm":9.0,"creative":"<i/>"}"#.to_string(),
    );
    // two zones so both 300x250 records are solicited
    let (partner, _, _) = build(settings(&[("D", &[1, 2])]), transport);
    let c = Correlator::from("c1");
    partner.prefetch_demand(c.clone(), ids(&["D"])).await.await.unwrap();

    assert_eq!(partner.cached_slot_ids(&c).await, vec!["D"]);
    let resp = partner.get_demand(c, ids(&["D"])).await;
    assert_eq!(resp.demand.get("D").unwrap().labels, vec!["300x250_100"]);
    assert!(resp.demand.get("Z").is_none());
}

#[tokio::test]
async fn relaunch_keeps_earlier_cycles_indexable() {
    let (partner, transport, _) = build(abc_settings(), abc_transport());
    let first = Correlator::from("c1");
    let second = Correlator::from("c2");

    partner.prefetch_demand(first.clone(), ids(&["A"])).await.await.unwrap();
    partner.prefetch_demand(second.clone(), ids(&["B"])).await.await.unwrap();

    assert_eq!(partner.cached_slot_ids(&first).await, vec!["A"]);
    // lookups go through the active correlator only
    let resp = partner.get_demand(first.clone(), ids(&["A"])).await;
    assert_eq!(transport.calls(), 3);
    assert_eq!(resp.demand.get("A").unwrap().auction_id, AuctionId(3));
    assert_eq!(partner.cached_slot_ids(&first).await, vec!["A"]);
    assert_eq!(partner.cached_slot_ids(&second).await, vec!["B"]);
}
