//! demand_prefetch: prefetch and consume demand for every configured slot
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use demand_prefetch::bidder::{
    Correlator, HttpBidTransport, LogAnalytics, Partner, PartnerConfig, RenderTarget,
};

const CONFIG_ENV: &str = "DEMAND_PREFETCH_CONFIG";
const DEFAULT_CONFIG: &str = "bidder.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).with_target(false).init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    info!("[CONFIG] loading {}", path);

    let config = PartnerConfig::load(&path)?;
    let transport = HttpBidTransport::new(&config.transport)?;
    info!("[HTTP] endpoint {}", transport.endpoint());

    let partner = Partner::from_config(&config, Arc::new(transport), Arc::new(LogAnalytics))?;
    let slots = partner.settings().slot_ids();

    let correlator = Correlator::generate();
    let prefetch = partner.prefetch_demand(correlator.clone(), slots.clone()).await;

    // Overlaps the prefetch, so this waits for it and reads the cache.
    let resp = partner.get_demand(correlator, slots).await;
    prefetch.await?;

    if let Some(e) = &resp.error {
        warn!("[DEMAND] {}", e);
    }
    info!("[DEMAND] {} slots with demand", resp.demand.len());

    for (slot_id, kv) in resp.demand.key_values(partner.target_keys()) {
        for (key, values) in kv {
            info!("[TARGETING] {} {}={}", slot_id, key, values.join(","));
        }
    }

    for slot_id in resp.demand.slot_ids() {
        let Some(targeting) = resp.demand.get(&slot_id) else { continue };
        if let Some(first) = targeting.labels.first() {
            if let Some((w, h)) = parse_size(first) {
                let mut page = Vec::new();
                let target = RenderTarget { slot_id: slot_id.clone(), width: w, height: h };
                if partner.render_creative(&target, &mut page).await? {
                    info!("[RENDER] {} {}x{}: {} bytes", slot_id, w, h, page.len());
                }
            }
        }
    }

    Ok(())
}

/// `300x250_125` -> (300, 250)
fn parse_size(label: &str) -> Option<(u32, u32)> {
    let dims = label.split('_').next()?;
    let (w, h) = dims.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}
