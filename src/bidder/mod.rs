//! Bidder partner
//!
//! Prefetches bid demand, caches it per correlator, coalesces overlapping
//! demand calls and buckets prices into targeting labels.

pub mod config;
pub mod error;
pub mod parser;
pub mod partner;
pub mod rest;
pub mod rounding;
pub mod session;
pub mod store;
pub mod traits;
pub mod types;

pub use config::{PartnerConfig, PartnerSettings, TransportConfig};
pub use error::{ErrorKind, PartnerError};
pub use partner::Partner;
pub use rest::HttpBidTransport;
pub use rounding::{RoundingBucket, RoundingConfiguration};
pub use session::PrefetchState;
pub use traits::{AnalyticsSink, BidTransport, LogAnalytics};
pub use types::*;
