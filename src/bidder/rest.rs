//! HTTP bid transport

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::time::{Duration, Instant};
use tracing::debug;

use super::config::TransportConfig;
use super::error::PartnerError;
use super::traits::BidTransport;
use super::types::BidRequest;

pub struct HttpBidTransport {
    client: Client,
    endpoint: String,
}

impl HttpBidTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_nodelay(true)
            .default_headers(Self::default_headers())
            .build()?;
        Ok(Self { client, endpoint: config.endpoint.clone() })
    }

    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn map_send_error(e: reqwest::Error) -> PartnerError {
    if e.is_timeout() {
        PartnerError::TransportTimeout
    } else {
        PartnerError::TransportStatus {
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            detail: e.to_string(),
        }
    }
}

#[async_trait]
impl BidTransport for HttpBidTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit_bid_request(&self, request: BidRequest) -> Result<String, PartnerError> {
        let start = Instant::now();
        debug!("[HTTP] POST {} | {} slots | audit={}", self.endpoint, request.slots.len(), request.audit);

        let resp = self.client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(map_send_error)?;

        debug!("[HTTP] Response: {} in {}ms | {} bytes", status, start.elapsed().as_millis(), body.len());

        if !status.is_success() {
            return Err(PartnerError::TransportStatus { status: status.as_u16(), detail: body });
        }
        // 204: no demand
        Ok(body)
    }
}
