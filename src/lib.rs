//! Bid-demand prefetch cache with price bucketing.

pub mod bidder;
