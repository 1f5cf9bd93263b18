//! Bid response decoding
//!
//! Turns a raw payload into bucketed bids. Nothing here fails: malformed
//! payloads and records are dropped and reported as rejects.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use super::error::PartnerError;
use super::rounding::RoundingConfiguration;
use super::types::{BidRequest, Dimensions};

/// One bid as it appears in the payload. All five fields are required.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawBidRecord {
    #[serde(rename = "impid")]
    pub slot_request_id: String,
    #[serde(rename = "width")]
    pub width_px: u32,
    #[serde(rename = "height")]
    pub height_px: u32,
    #[serde(rename = "cpm")]
    pub cpm_dollars: f64,
    #[serde(rename = "creative")]
    pub creative_markup: String,
}

impl RawBidRecord {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width_px, self.height_px)
    }
}

/// A solicited, non-zero bid with its bucket label value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBid {
    pub record: RawBidRecord,
    pub bucket: i64,
}

impl ParsedBid {
    pub fn label(&self) -> String {
        format!("{}_{}", self.record.dimensions(), self.bucket)
    }
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub bids: Vec<ParsedBid>,
    /// Why records (or the whole payload) were dropped
    pub rejects: Vec<PartnerError>,
    /// Records that bucketized to zero
    pub no_bids: usize,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    slots: Vec<serde_json::Value>,
}

/// Impression ids sent out and not yet answered.
///
/// A multiset: a slot with several zones is requested (and may be answered)
/// once per zone.
#[derive(Debug, Default, Clone)]
pub struct RequestedImpressions {
    outstanding: HashMap<String, usize>,
}

impl RequestedImpressions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, imp_id: &str) {
        *self.outstanding.entry(imp_id.to_string()).or_insert(0) += 1;
    }

    /// Consume one occurrence. False when the id was never requested.
    pub fn consume(&mut self, imp_id: &str) -> bool {
        match self.outstanding.get_mut(imp_id) {
            Some(n) if *n > 1 => {
                *n -= 1;
                true
            }
            Some(_) => {
                self.outstanding.remove(imp_id);
                true
            }
            None => false,
        }
    }

    /// Give back the ids of a request that was never answered.
    pub fn release(&mut self, request: &BidRequest) {
        for spec in &request.slots {
            self.consume(&spec.consuming_slot_id);
        }
    }

    pub fn contains(&self, imp_id: &str) -> bool {
        self.outstanding.contains_key(imp_id)
    }

    pub fn outstanding(&self, imp_id: &str) -> usize {
        self.outstanding.get(imp_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

/// Decode a payload into bucketed bids, consuming requested ids as they match.
pub fn parse_demand(
    payload: &str,
    requested: &mut RequestedImpressions,
    rounding: &RoundingConfiguration,
) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();

    if payload.trim().is_empty() {
        return outcome;
    }

    let envelope: ResponseEnvelope = match serde_json::from_str(payload) {
        Ok(env) => env,
        Err(e) => {
            debug!("[PARSE] returned demand is not a valid json: {}", e);
            outcome.rejects.push(PartnerError::MalformedResponse(e.to_string()));
            return outcome;
        }
    };

    for (i, value) in envelope.slots.into_iter().enumerate() {
        let record: RawBidRecord = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                debug!("[PARSE] record {} has missing parameters: {}", i, e);
                outcome.rejects.push(PartnerError::MalformedResponse(format!("record {}: {}", i, e)));
                continue;
            }
        };

        if !requested.consume(&record.slot_request_id) {
            debug!("[PARSE] impid {} returned is invalid", record.slot_request_id);
            outcome.rejects.push(PartnerError::UnsolicitedRecord(record.slot_request_id));
            continue;
        }

        let bucket = rounding.bucketize(record.cpm_dollars);
        if bucket == 0 {
            outcome.no_bids += 1;
            continue;
        }

        outcome.bids.push(ParsedBid { record, bucket });
    }

    outcome
}
