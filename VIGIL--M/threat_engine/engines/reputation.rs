use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{
    check_status, decode, endpoint, guarded, EngineAdapter, EngineError, HttpReply, HttpRequest,
    HttpTransport, PollPolicy, RequestBody,
};
use crate::{
    config::ReputationConfig,
    model::{AnalysisRequest, EngineResult, ResourceKind},
};

/// Source name of the primary aggregator.
pub const SOURCE: &str = "reputation";

/// Report as returned by the aggregator, validated on decode.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawReport")]
enum Report {
    Ready {
        positives: u32,
        total: u32,
        permalink: Option<String>,
        scan_date: Option<String>,
    },
    Queued,
    Unknown,
}

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(default)]
    response_code: i64,
    #[serde(default)]
    positives: Option<u32>,
    #[serde(default)]
    total: Option<u32>,
    #[serde(default)]
    permalink: Option<String>,
    #[serde(default)]
    scan_date: Option<String>,
}

impl TryFrom<RawReport> for Report {
    type Error = String;

    fn try_from(raw: RawReport) -> Result<Self, Self::Error> {
        match raw.response_code {
            1 => {
                let (Some(positives), Some(total)) = (raw.positives, raw.total) else {
                    return Err("ready report without positives/total".into());
                };
                if positives > total {
                    return Err(format!("positives {positives} exceed total {total}"));
                }
                Ok(Self::Ready {
                    positives,
                    total,
                    permalink: raw.permalink,
                    scan_date: raw.scan_date,
                })
            }
            -2 => Ok(Self::Queued),
            _ => Ok(Self::Unknown),
        }
    }
}

impl Report {
    fn into_result(self) -> Option<EngineResult> {
        match self {
            Self::Ready {
                positives,
                total,
                permalink,
                scan_date,
            } => Some(
                EngineResult::success(SOURCE, positives, total)
                    .with_link(permalink.unwrap_or_default())
                    .with_scanned_at(scan_date),
            ),
            Self::Queued | Self::Unknown => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitAck {
    #[serde(default)]
    scan_id: Option<String>,
}

/// Primary reputation aggregator (submit-then-poll for URLs, hash lookup then upload for files).
pub struct ReputationAdapter {
    config: ReputationConfig,
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for ReputationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationAdapter")
            .field("base_url", &self.config.base_url)
            .field("configured", &self.config.api_key.is_some())
            .finish()
    }
}

impl ReputationAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new(config: ReputationConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self { config, transport }
    }

    fn api_key(&self) -> Result<&str, EngineError> {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(EngineError::NotConfigured("reputation api key"))
    }

    const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    /// Maps the 204 rate-limit signal before the generic status check.
    fn accept(reply: &HttpReply) -> Result<(), EngineError> {
        if reply.status == 204 {
            return Err(EngineError::RateLimited(204));
        }
        check_status(reply)
    }

    async fn fetch_report(&self, kind: ResourceKind, resource: &str) -> Result<Report, EngineError> {
        let path = match kind {
            ResourceKind::Url => "url/report",
            ResourceKind::File => "file/report",
        };
        let reply = self
            .transport
            .send(
                HttpRequest::get(endpoint(&self.config.base_url, path))
                    .query("apikey", self.api_key()?)
                    .query("resource", resource)
                    .timeout(self.request_timeout()),
            )
            .await?;
        Self::accept(&reply)?;
        decode(&reply)
    }

    async fn poll_report(
        &self,
        kind: ResourceKind,
        resource: &str,
        max_attempts: u32,
    ) -> Result<EngineResult, EngineError> {
        let policy = PollPolicy {
            interval: Duration::from_millis(self.config.poll_interval_ms),
            max_attempts,
        };
        policy
            .run(SOURCE, |_| async move {
                Ok::<_, EngineError>(self.fetch_report(kind, resource).await?.into_result())
            })
            .await
    }

    async fn analyze_url(&self, url: &str) -> Result<EngineResult, EngineError> {
        let reply = self
            .transport
            .send(
                HttpRequest::post(endpoint(&self.config.base_url, "url/scan"))
                    .body(RequestBody::Form(vec![
                        ("apikey".into(), self.api_key()?.to_string()),
                        ("url".into(), url.to_string()),
                    ]))
                    .timeout(self.request_timeout()),
            )
            .await?;
        Self::accept(&reply)?;
        let ack: SubmitAck = decode(&reply)?;
        let resource = ack.scan_id.unwrap_or_else(|| url.to_string());
        debug!(source = SOURCE, %resource, "url submitted");
        self.poll_report(ResourceKind::Url, &resource, self.config.max_poll_attempts)
            .await
    }

    async fn analyze_file(&self, request: &AnalysisRequest) -> Result<EngineResult, EngineError> {
        let sha256 = request.identifier();
        match self.fetch_report(ResourceKind::File, sha256).await? {
            ready @ Report::Ready { .. } => {
                return ready
                    .into_result()
                    .ok_or_else(|| EngineError::Malformed("empty ready report".into()))
            }
            Report::Queued => {
                return self
                    .poll_report(ResourceKind::File, sha256, self.config.max_file_poll_attempts)
                    .await
            }
            Report::Unknown => {}
        }
        let Some(content) = request.raw_content() else {
            return Err(EngineError::NotFound("hash not known to source".into()));
        };
        let reply = self
            .transport
            .send(
                HttpRequest::post(endpoint(&self.config.base_url, "file/scan"))
                    .query("apikey", self.api_key()?)
                    .body(RequestBody::Multipart {
                        field: "file".into(),
                        file_name: request.display_name().to_string(),
                        data: content.to_vec(),
                    })
                    .timeout(self.request_timeout()),
            )
            .await?;
        Self::accept(&reply)?;
        let ack: SubmitAck = decode(&reply)?;
        let resource = ack.scan_id.unwrap_or_else(|| sha256.to_string());
        debug!(source = SOURCE, %resource, "file uploaded");
        self.poll_report(ResourceKind::File, &resource, self.config.max_file_poll_attempts)
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
impl EngineAdapter for ReputationAdapter {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engines::HttpMethod,
        model::ErrorKind,
        testing::ScriptedTransport,
    };
    use serde_json::json;

    const BUDGET: Duration = Duration::from_secs(120);

    fn config() -> ReputationConfig {
        ReputationConfig {
            base_url: "https://rep.test/api/".into(),
            api_key: Some("k".into()),
            ..ReputationConfig::default()
        }
    }

    fn ready(positives: u32, total: u32) -> HttpReply {
        HttpReply::json(
            200,
            &json!({
                "response_code": 1,
                "positives": positives,
                "total": total,
                "permalink": "https://rep.test/report/1",
                "scan_date": "2024-05-01 10:00:00"
            }),
        )
    }

    fn pending() -> HttpReply {
        HttpReply::json(200, &json!({ "response_code": -2, "verbose_msg": "queued" }))
    }

    #[tokio::test(start_paused = true)]
    async fn url_is_submitted_then_polled() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route(HttpMethod::Post, "/url/scan", vec![Ok(HttpReply::json(200, &json!({ "response_code": 1, "scan_id": "scan-1" })))])
                .route(HttpMethod::Get, "/url/report", vec![Ok(pending()), Ok(ready(65, 90))]),
        );
        let adapter = ReputationAdapter::new(config(), transport.clone());
        let result = adapter
            .analyze(&AnalysisRequest::url("http://malware.testing.google.test/testing/malware/"), BUDGET)
            .await;
        assert_eq!(result.error, None);
        assert_eq!((result.positives, result.total), (65, 90));
        assert_eq!(result.reference_link, "https://rep.test/report/1");
        assert_eq!(result.scanned_at.as_deref(), Some("2024-05-01 10:00:00"));
        let requests = transport.requests();
        assert_eq!(requests[0].url, "https://rep.test/api/url/scan");
        assert_eq!(requests[1].query_value("resource"), Some("scan-1"));
        assert_eq!(transport.calls_to("/url/report"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_polling_is_timeout() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route(HttpMethod::Post, "/url/scan", vec![Ok(HttpReply::json(200, &json!({})))])
                .route(HttpMethod::Get, "/url/report", vec![Ok(pending())]),
        );
        let adapter = ReputationAdapter::new(config(), transport.clone());
        let result = adapter.analyze(&AnalysisRequest::url("https://slow.test"), BUDGET).await;
        assert_eq!(result.error, Some(ErrorKind::Timeout));
        assert_eq!(transport.calls_to("/url/report"), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn no_content_status_is_rate_limit() {
        let transport = Arc::new(
            ScriptedTransport::new().route(HttpMethod::Post, "/url/scan", vec![Ok(HttpReply::empty(204))]),
        );
        let adapter = ReputationAdapter::new(config(), transport);
        let result = adapter.analyze(&AnalysisRequest::url("https://busy.test"), BUDGET).await;
        assert_eq!(result.error, Some(ErrorKind::RateLimited));
        assert_eq!((result.positives, result.total), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_report_without_counts_is_malformed() {
        let transport = Arc::new(ScriptedTransport::new().route(
            HttpMethod::Get,
            "/file/report",
            vec![Ok(HttpReply::json(200, &json!({ "response_code": 1 })))],
        ));
        let adapter = ReputationAdapter::new(config(), transport);
        let result = adapter
            .analyze(&AnalysisRequest::file_hash("a.bin", "ab".repeat(32)), BUDGET)
            .await;
        assert_eq!(result.error, Some(ErrorKind::MalformedResponse));
    }

    #[tokio::test(start_paused = true)]
    async fn known_hash_needs_no_upload() {
        let transport = Arc::new(
            ScriptedTransport::new().route(HttpMethod::Get, "/file/report", vec![Ok(ready(0, 70))]),
        );
        let adapter = ReputationAdapter::new(config(), transport.clone());
        let result = adapter
            .analyze(&AnalysisRequest::file("notes.txt", b"hello".to_vec()), BUDGET)
            .await;
        assert_eq!((result.positives, result.total), (0, 70));
        assert!(!result.detected);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_hash_is_uploaded_when_content_exists() {
        let unknown = HttpReply::json(200, &json!({ "response_code": 0 }));
        let transport = Arc::new(
            ScriptedTransport::new()
                .route(HttpMethod::Get, "/file/report", vec![Ok(unknown), Ok(ready(3, 70))])
                .route(HttpMethod::Post, "/file/scan", vec![Ok(HttpReply::json(200, &json!({ "scan_id": "s-9" })))]),
        );
        let adapter = ReputationAdapter::new(config(), transport.clone());
        let result = adapter
            .analyze(&AnalysisRequest::file("tool.exe", b"MZ...".to_vec()), BUDGET)
            .await;
        assert_eq!((result.positives, result.total), (3, 70));
        let requests = transport.requests();
        let upload = &requests[1];
        assert!(matches!(&upload.body, RequestBody::Multipart { file_name, .. } if file_name == "tool.exe"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_hash_without_content_is_unreachable() {
        let transport = Arc::new(ScriptedTransport::new().route(
            HttpMethod::Get,
            "/file/report",
            vec![Ok(HttpReply::json(200, &json!({ "response_code": 0 })))],
        ));
        let adapter = ReputationAdapter::new(config(), transport);
        let result = adapter
            .analyze(&AnalysisRequest::file_hash("x", "cd".repeat(32)), BUDGET)
            .await;
        assert_eq!(result.error, Some(ErrorKind::Unreachable));
        assert!(result.status_text.contains("not known"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_key_skips_network() {
        let transport = Arc::new(ScriptedTransport::new());
        let adapter = ReputationAdapter::new(
            ReputationConfig {
                api_key: None,
                ..config()
            },
            transport.clone(),
        );
        let result = adapter.analyze(&AnalysisRequest::url("https://a.test"), BUDGET).await;
        assert_eq!(result.error, Some(ErrorKind::Unreachable));
        assert!(result.status_text.contains("not configured"));
        assert!(transport.requests().is_empty());
    }
}
