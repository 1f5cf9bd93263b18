//! Collaborator boundaries
//!
//! The partner only talks to the ad network and to analytics through these
//! traits. The network side is asynchronous; analytics is fire-and-forget.

use async_trait::async_trait;
use tracing::{info, warn};

use super::error::{PartnerError, Result};
use super::types::{BidRequest, Correlator};

/// Sends a bid request and yields the raw response body.
///
/// Implementations report timeouts as `PartnerError::TransportTimeout` and
/// every other failure as `PartnerError::TransportStatus`.
#[async_trait]
pub trait BidTransport: Send + Sync {
    /// Transport name (e.g., "http")
    fn name(&self) -> &str;

    async fn submit_bid_request(&self, request: BidRequest) -> Result<String>;
}

/// Receives prefetch completion events.
pub trait AnalyticsSink: Send + Sync {
    fn prefetch_complete(&self, correlator: &Correlator, error: Option<&PartnerError>);
}

/// Analytics sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnalytics;

impl AnalyticsSink for LogAnalytics {
    fn prefetch_complete(&self, correlator: &Correlator, error: Option<&PartnerError>) {
        match error {
            None => info!("[ANALYTICS] prefetch {} complete", correlator),
            Some(e) => warn!("[ANALYTICS] prefetch {} complete with {}: {}", correlator, e.kind().as_str(), e),
        }
    }
}
