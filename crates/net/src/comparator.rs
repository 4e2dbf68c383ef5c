//! HTTP client for the external segment comparison service.

use crate::NetError;
use quorumkv_kv::{CompareRequest, CompareResponse, ComparisonError, SegmentComparator};
use std::time::Duration;

/// Calls `POST {base_url}/compare`.
#[derive(Debug, Clone)]
pub struct HttpSegmentComparator {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSegmentComparator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NetError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl SegmentComparator for HttpSegmentComparator {
    async fn compare(&self, request: &CompareRequest) -> Result<CompareResponse, ComparisonError> {
        let _timer = quorumkv_metrics::start_rpc_timer("compare", "outbound");

        let resp = self
            .http
            .post(format!("{}/compare", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| ComparisonError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ComparisonError::Status(status.as_u16()));
        }
        resp.json()
            .await
            .map_err(|e| ComparisonError::InvalidResponse(e.to_string()))
    }
}
