//! Bidder types
//!
//! Core types for correlators, slot specs, targeting and demand results.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::error::PartnerError;

// ======================= IDENTIFIERS =======================

/// Opaque token identifying one prefetch cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Correlator(String);

impl Correlator {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Fresh random correlator
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Correlator {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-partner auction identifier, shared by every dimension variant of one
/// slot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuctionId(pub u64);

impl fmt::Display for AuctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creative size, rendered as `WxH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ======================= TARGETING KEYS =======================

pub const DEFAULT_OM_KEY: &str = "ix_cdb_om";
pub const DEFAULT_ID_KEY: &str = "ix_cdb_id";
pub const MAX_TARGET_KEY_LEN: usize = 20;

/// Key names under which targeting is exported to the ad server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetKeys {
    /// Order-metadata key, carries the `WxH_bucket` labels
    pub om: String,
    /// Carries the auction id
    pub id: String,
}

impl Default for TargetKeys {
    fn default() -> Self {
        Self { om: DEFAULT_OM_KEY.to_string(), id: DEFAULT_ID_KEY.to_string() }
    }
}

// ======================= TARGETING TYPE =======================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetingType {
    Slot,
}

impl TargetingType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "slot" => Some(TargetingType::Slot),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetingType::Slot => "slot",
        }
    }
}

// ======================= REQUESTS =======================

/// One impression in a bid request: a consuming slot served from one zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSpec {
    #[serde(rename = "impId")]
    pub consuming_slot_id: String,
    pub zone_id: u64,
}

/// Bid request handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BidRequest {
    pub profile_id: u32,
    pub audit: bool,
    pub slots: Vec<SlotSpec>,
}

/// Where a cached creative should be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTarget {
    pub slot_id: String,
    pub width: u32,
    pub height: u32,
}

// ======================= DEMAND =======================

/// Aggregated targeting for one consuming slot.
#[derive(Debug, Clone, PartialEq)]
pub struct AuctionTargeting {
    pub timestamp_ms: u64,
    pub auction_id: AuctionId,
    /// `WxH_bucket` labels in payload order
    pub labels: Vec<String>,
}

impl AuctionTargeting {
    pub fn new(timestamp_ms: u64, auction_id: AuctionId) -> Self {
        Self { timestamp_ms, auction_id, labels: Vec::new() }
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }

    /// Fresh when expiry is disabled (negative) or the age is within it.
    pub fn is_fresh(&self, now_ms: u64, demand_expiry_ms: i64) -> bool {
        demand_expiry_ms < 0 || self.age_ms(now_ms) <= demand_expiry_ms as u64
    }

    /// Ad server key/values: `{om: [labels...], id: [auction id]}`
    pub fn key_values(&self, keys: &TargetKeys) -> BTreeMap<String, Vec<String>> {
        let mut kv = BTreeMap::new();
        kv.insert(keys.om.clone(), self.labels.clone());
        kv.insert(keys.id.clone(), vec![self.auction_id.to_string()]);
        kv
    }
}

/// Targeting per consuming slot id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Demand {
    pub slot: HashMap<String, AuctionTargeting>,
}

impl Demand {
    pub fn is_empty(&self) -> bool {
        self.slot.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slot.len()
    }

    pub fn get(&self, slot_id: &str) -> Option<&AuctionTargeting> {
        self.slot.get(slot_id)
    }

    pub fn slot_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slot.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn key_values(&self, keys: &TargetKeys) -> BTreeMap<String, BTreeMap<String, Vec<String>>> {
        self.slot
            .iter()
            .map(|(id, t)| (id.clone(), t.key_values(keys)))
            .collect()
    }
}

/// Outcome of a demand call: whatever demand was assembled, plus the
/// transport error of the fetch it issued, if any.
#[derive(Debug, Clone, Default)]
pub struct DemandResponse {
    pub demand: Demand,
    pub error: Option<PartnerError>,
}

impl DemandResponse {
    pub fn ok(demand: Demand) -> Self {
        Self { demand, error: None }
    }
}

// ======================= CAPABILITIES =======================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedAnalytics {
    pub time: bool,
    pub demand: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedOptions {
    pub prefetch: bool,
    pub demand_expiry_ms: i64,
}

/// Wall clock in epoch milliseconds
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
