//! Partner configuration
//!
//! `PartnerConfig` mirrors the TOML file. `validate` collects every problem
//! and produces the immutable `PartnerSettings` the partner runs on.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::warn;

use super::error::PartnerError;
use super::rounding::RoundingConfiguration;
use super::types::{TargetKeys, TargetingType, MAX_TARGET_KEY_LEN};

pub const DEFAULT_PROFILE_ID: u32 = 154;
pub const DEFAULT_DEMAND_EXPIRY_MS: i64 = 30_000;
pub const DEFAULT_ENDPOINT: &str = "https://bidder.criteo.com/cdb";
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;

// ======================= FILE FORMAT =======================

/// Zone id as written in config: an integer or a quoted integer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ZoneIdValue {
    Int(i64),
    Text(String),
}

impl ZoneIdValue {
    pub fn to_zone_id(&self) -> Option<u64> {
        match self {
            ZoneIdValue::Int(n) if *n >= 0 => Some(*n as u64),
            ZoneIdValue::Int(_) => None,
            ZoneIdValue::Text(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s.parse().ok(),
            ZoneIdValue::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub zone_id: Option<ZoneIdValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetKeyOverride {
    pub om: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { endpoint: DEFAULT_ENDPOINT.to_string(), timeout_ms: DEFAULT_TIMEOUT_MS }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartnerConfig {
    pub targeting_type: Option<String>,
    #[serde(default)]
    pub slots: BTreeMap<String, Vec<ZoneConfig>>,
    pub target_key_override: Option<TargetKeyOverride>,
    pub is_audit: Option<bool>,
    pub rounding_buckets: Option<RoundingConfiguration>,
    pub demand_expiry_ms: Option<i64>,
    pub profile_id: Option<u32>,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl PartnerConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("parsing partner config")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<PartnerSettings, PartnerError> {
        let mut errs = Vec::new();

        let targeting_type = match self.targeting_type.as_deref().and_then(TargetingType::parse) {
            Some(tt) => Some(tt),
            None => {
                errs.push("targetingType either not provided or invalid.".to_string());
                None
            }
        };

        if self.slots.is_empty() {
            errs.push("slots either not provided or invalid.".to_string());
        }
        let mut slots = HashMap::new();
        for (slot_id, zones) in &self.slots {
            if zones.is_empty() {
                errs.push(format!("slotID {} in config.slots is not an array", slot_id));
                continue;
            }
            let mut zone_ids = Vec::with_capacity(zones.len());
            for zone in zones {
                match &zone.zone_id {
                    None => errs.push(format!("slotID {} in config.slots does not have zoneID key", slot_id)),
                    Some(z) => match z.to_zone_id() {
                        Some(id) => zone_ids.push(id),
                        None => errs.push(format!("slotID {} in config.slots has non-integer zoneID", slot_id)),
                    },
                }
            }
            slots.insert(slot_id.clone(), zone_ids);
        }

        let rounding = self.rounding_buckets.clone().unwrap_or_default();
        errs.extend(rounding.problems());
        for (a, b) in rounding.overlapping_pairs() {
            warn!("[CONFIG] rounding buckets {} and {} overlap, bucket {} wins", a, b, a);
        }

        if !errs.is_empty() {
            return Err(PartnerError::Configuration(errs));
        }

        Ok(PartnerSettings {
            targeting_type: targeting_type.unwrap_or(TargetingType::Slot),
            slots,
            target_keys: self.target_keys(),
            is_audit: self.is_audit.unwrap_or(false),
            rounding,
            demand_expiry_ms: self.demand_expiry_ms.unwrap_or(DEFAULT_DEMAND_EXPIRY_MS),
            profile_id: self.profile_id.unwrap_or(DEFAULT_PROFILE_ID),
        })
    }

    /// Defaults with valid overrides applied. Invalid overrides are ignored.
    fn target_keys(&self) -> TargetKeys {
        let mut keys = TargetKeys::default();
        let Some(over) = &self.target_key_override else {
            return keys;
        };
        if let Some(om) = valid_key(over.om.as_deref(), "om") {
            keys.om = om;
        }
        if let Some(id) = valid_key(over.id.as_deref(), "id") {
            keys.id = id;
        }
        keys
    }
}

fn valid_key(key: Option<&str>, which: &str) -> Option<String> {
    let key = key?;
    if key.is_empty() || key.chars().count() > MAX_TARGET_KEY_LEN {
        warn!("[CONFIG] ignoring targetKeyOverride.{} {:?}", which, key);
        return None;
    }
    Some(key.to_string())
}

// ======================= VALIDATED =======================

#[derive(Debug, Clone)]
pub struct PartnerSettings {
    pub targeting_type: TargetingType,
    /// Consuming slot id -> zone ids
    pub slots: HashMap<String, Vec<u64>>,
    pub target_keys: TargetKeys,
    pub is_audit: bool,
    pub rounding: RoundingConfiguration,
    /// Negative disables expiry
    pub demand_expiry_ms: i64,
    pub profile_id: u32,
}

impl PartnerSettings {
    /// Settings for `slots` with every other option at its default.
    pub fn with_slots(slots: HashMap<String, Vec<u64>>) -> Self {
        Self {
            targeting_type: TargetingType::Slot,
            slots,
            target_keys: TargetKeys::default(),
            is_audit: false,
            rounding: RoundingConfiguration::default(),
            demand_expiry_ms: DEFAULT_DEMAND_EXPIRY_MS,
            profile_id: DEFAULT_PROFILE_ID,
        }
    }

    pub fn slot_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.keys().cloned().collect();
        ids.sort();
        ids
    }
}
