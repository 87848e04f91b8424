use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use super::{
    decode, endpoint, guarded, EngineAdapter, EngineError, HttpRequest, HttpTransport, PollPolicy,
    RequestBody,
};
use crate::{
    config::MultiScanConfig,
    model::{AnalysisRequest, EngineResult, ResourceKind},
};

/// Source name of the secondary scanner.
pub const SOURCE: &str = "multiscan";

#[derive(Debug, Deserialize)]
struct FileReport {
    #[serde(default)]
    data_id: Option<String>,
    #[serde(default)]
    scan_results: Option<ScanResults>,
}

#[derive(Debug, Deserialize)]
struct ScanResults {
    #[serde(default)]
    total_detected_avs: Option<u32>,
    #[serde(default)]
    total_avs: Option<u32>,
    #[serde(default)]
    progress_percentage: Option<u32>,
    #[serde(default)]
    scan_all_result_a: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadAck {
    data_id: String,
}

#[derive(Debug, Deserialize)]
struct UrlReport {
    lookup_results: LookupResults,
}

#[derive(Debug, Deserialize)]
struct LookupResults {
    detected_by: u32,
    #[serde(default)]
    sources: Vec<serde_json::Value>,
    #[serde(default)]
    start_time: Option<String>,
}

impl ScanResults {
    /// Finished scans must carry both counters.
    fn finished(&self) -> Result<Option<(u32, u32)>, EngineError> {
        if self.progress_percentage.is_some_and(|progress| progress < 100) {
            return Ok(None);
        }
        match (self.total_detected_avs, self.total_avs) {
            (Some(detected), Some(total)) if detected <= total => Ok(Some((detected, total))),
            (Some(detected), Some(total)) => Err(EngineError::Malformed(format!(
                "detected {detected} exceeds engines {total}"
            ))),
            _ => Err(EngineError::Malformed("scan results without counters".into())),
        }
    }

    fn to_result(&self, positives: u32, total: u32, link: String) -> EngineResult {
        let mut result = EngineResult::success(SOURCE, positives, total)
            .with_link(link)
            .with_scanned_at(self.start_time.clone());
        if let Some(verdict) = self.scan_all_result_a.as_deref().filter(|v| !v.is_empty()) {
            result = result.with_status(format!("{verdict} ({positives}/{total})"));
        }
        result
    }
}

/// Secondary multi-scanner, used as failover for the primary aggregator.
pub struct MultiScanAdapter {
    config: MultiScanConfig,
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for MultiScanAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiScanAdapter")
            .field("base_url", &self.config.base_url)
            .field("configured", &self.config.api_key.is_some())
            .finish()
    }
}

impl MultiScanAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new(config: MultiScanConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self { config, transport }
    }

    fn api_key(&self) -> Result<&str, EngineError> {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(EngineError::NotConfigured("multiscan api key"))
    }

    fn get(&self, url: String) -> Result<HttpRequest, EngineError> {
        Ok(HttpRequest::get(url)
            .header("apikey", self.api_key()?)
            .timeout(Duration::from_millis(self.config.request_timeout_ms)))
    }

    /// `{base}/url/{url}` with the URL as one percent-encoded path segment.
    fn url_lookup_endpoint(&self, url: &str) -> Result<String, EngineError> {
        let mut endpoint = Url::parse(&self.config.base_url)
            .map_err(|err| EngineError::InvalidEndpoint(err.to_string()))?;
        endpoint
            .path_segments_mut()
            .map_err(|()| EngineError::InvalidEndpoint(self.config.base_url.clone()))?
            .pop_if_empty()
            .push("url")
            .push(url);
        Ok(endpoint.into())
    }

    async fn analyze_url(&self, url: &str) -> Result<EngineResult, EngineError> {
        let reply = self
            .transport
            .send(self.get(self.url_lookup_endpoint(url)?)?)
            .await?;
        let report: UrlReport = decode(&reply)?;
        let lookup = report.lookup_results;
        let total = u32::try_from(lookup.sources.len()).unwrap_or(u32::MAX);
        Ok(EngineResult::success(SOURCE, lookup.detected_by, total)
            .with_scanned_at(lookup.start_time))
    }

    async fn analyze_file(&self, request: &AnalysisRequest) -> Result<EngineResult, EngineError> {
        let sha256 = request.identifier();
        let reply = self
            .transport
            .send(self.get(endpoint(&self.config.base_url, &format!("hash/{sha256}")))?)
            .await?;
        if reply.status != 404 {
            let report: FileReport = decode(&reply)?;
            let link = endpoint(&self.config.base_url, &format!("hash/{sha256}"));
            if let Some(results) = report.scan_results.as_ref() {
                if let Some((positives, total)) = results.finished()? {
                    return Ok(results.to_result(positives, total, link));
                }
                if let Some(data_id) = report.data_id {
                    return self.poll_scan(&data_id).await;
                }
            }
        }
        let Some(content) = request.raw_content() else {
            return Err(EngineError::NotFound("hash not known to source".into()));
        };
        let reply = self
            .transport
            .send(
                HttpRequest::post(endpoint(&self.config.base_url, "file"))
                    .header("apikey", self.api_key()?)
                    .header("filename", request.display_name())
                    .body(RequestBody::Bytes(content.to_vec()))
                    .timeout(Duration::from_millis(self.config.request_timeout_ms)),
            )
            .await?;
        let ack: UploadAck = decode(&reply)?;
        debug!(source = SOURCE, data_id = %ack.data_id, "file uploaded");
        self.poll_scan(&ack.data_id).await
    }

    async fn poll_scan(&self, data_id: &str) -> Result<EngineResult, EngineError> {
        let policy = PollPolicy {
            interval: Duration::from_millis(self.config.poll_interval_ms),
            max_attempts: self.config.max_poll_attempts,
        };
        let link = endpoint(&self.config.base_url, &format!("file/{data_id}"));
        policy
            .run(SOURCE, |_| {
                let link = link.clone();
                async move {
                    let reply = self.transport.send(self.get(link.clone())?).await?;
                    let report: FileReport = decode(&reply)?;
                    let Some(results) = report.scan_results else {
                        return Ok(None);
                    };
                    Ok::<_, EngineError>(
                        results
                            .finished()?
                            .map(|(positives, total)| results.to_result(positives, total, link)),
                    )
                }
            })
            .await
    }

    async fn run(&self, request: &AnalysisRequest) -> Result<EngineResult, EngineError> {
        self.api_key()?;
        match request.kind() {
            ResourceKind::Url => self.analyze_url(request.identifier()).await,
            ResourceKind::File => self.analyze_file(request).await,
        }
    }
}

#[async_trait]
impl EngineAdapter for MultiScanAdapter {
    fn name(&self) -> &str {
        SOURCE
    }

    fn supports(&self, _kind: ResourceKind) -> bool {
        true
    }

    async fn analyze(&self, request: &AnalysisRequest, timeout: Duration) -> EngineResult {
        guarded(SOURCE, timeout, self.run(request)).await
    }
}
