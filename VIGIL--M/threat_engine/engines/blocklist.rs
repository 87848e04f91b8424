use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{check_status, endpoint, guarded, EngineAdapter, EngineError, HttpRequest, HttpTransport, RequestBody};
use crate::{
    config::BlocklistConfig,
    model::{AnalysisRequest, EngineResult, ResourceKind},
};

/// Source name of the blocklist lookup.
pub const SOURCE: &str = "blocklist";

const THREAT_TYPES: [&str; 4] = [
    "MALWARE",
    "SOCIAL_ENGINEERING",
    "UNWANTED_SOFTWARE",
    "POTENTIALLY_HARMFUL_APPLICATION",
];

#[derive(Debug, Default, Deserialize)]
struct MatchResponse {
    #[serde(default)]
    matches: Vec<ThreatMatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreatMatch {
    threat_type: String,
}

/// Blocklist match query. A binary source: it reports listed or not, never engine counts.
pub struct BlocklistAdapter {
    config: BlocklistConfig,
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for BlocklistAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlocklistAdapter")
            .field("base_url", &self.config.base_url)
            .field("configured", &self.config.api_key.is_some())
            .finish()
    }
}

impl BlocklistAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new(config: BlocklistConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self { config, transport }
    }

    fn query_body(&self, url: &str) -> serde_json::Value {
        json!({
            "client": {
                "clientId": self.config.client_id,
                "clientVersion": self.config.client_version,
            },
            "threatInfo": {
                "threatTypes": THREAT_TYPES,
                "platformTypes": ["ANY_PLATFORM"],
                "threatEntryTypes": ["URL"],
                "threatEntries": [{ "url": url }],
            }
        })
    }

    async fn run(&self, url: &str) -> Result<EngineResult, EngineError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(EngineError::NotConfigured("blocklist api key"))?;
        let reply = self
            .transport
            .send(
                HttpRequest::post(endpoint(&self.config.base_url, "threatMatches:find"))
                    .query("key", key)
                    .body(RequestBody::Json(self.query_body(url)))
                    .timeout(Duration::from_millis(self.config.request_timeout_ms)),
            )
            .await?;
        check_status(&reply)?;
        // an empty body is how the service says "no match"
        let response: MatchResponse = if reply.body.iter().all(u8::is_ascii_whitespace) {
            MatchResponse::default()
        } else {
            reply
                .decode()
                .map_err(|err| EngineError::Malformed(err.to_string()))?
        };
        if response.matches.is_empty() {
            return Ok(EngineResult::listing(SOURCE, false, "no blocklist match"));
        }
        let mut kinds: Vec<&str> = response
            .matches
            .iter()
            .map(|found| found.threat_type.as_str())
            .collect();
        kinds.sort_unstable();
        kinds.dedup();
        let result = EngineResult::listing(SOURCE, true, format!("listed as {}", kinds.join(", ")));
        Ok(result)
    }
}

#[async_trait]
impl EngineAdapter for BlocklistAdapter {
    fn name(&self) -> &str {
        SOURCE
    }

    fn supports(&self, kind: ResourceKind) -> bool {
        kind == ResourceKind::Url
    }

    async fn analyze(&self, request: &AnalysisRequest, timeout: Duration) -> EngineResult {
        if request.kind() != ResourceKind::Url {
            return EngineResult::failure(
                SOURCE,
                crate::model::ErrorKind::Unreachable,
                "files are not listed by this source",
            );
        }
        guarded(SOURCE, timeout, self.run(request.identifier())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engines::{HttpMethod, HttpReply},
        model::ErrorKind,
        testing::ScriptedTransport,
    };

    const BUDGET: Duration = Duration::from_secs(10);

    fn adapter(transport: Arc<ScriptedTransport>) -> BlocklistAdapter {
        BlocklistAdapter::new(
            BlocklistConfig {
                base_url: "https://lists.test/v4".into(),
                api_key: Some("bk".into()),
                ..BlocklistConfig::default()
            },
            transport,
        )
    }

    #[tokio::test]
    async fn match_is_detected_without_counts() {
        let transport = Arc::new(ScriptedTransport::new().route(
            HttpMethod::Post,
            "threatMatches:find",
            vec![Ok(HttpReply::json(
                200,
                &json!({ "matches": [{ "threatType": "MALWARE", "platformType": "ANY_PLATFORM", "threat": { "url": "x" } }] }),
            ))],
        ));
        let result = adapter(transport.clone())
            .analyze(&AnalysisRequest::url("http://malware.testing.google.test/testing/malware/"), BUDGET)
            .await;
        assert!(result.detected);
        assert_eq!((result.positives, result.total), (0, 0));
        assert_eq!(result.detection_rate(), Some(0.0));
        assert_eq!(result.status_text, "listed as MALWARE");

        let requests = transport.requests();
        let sent = &requests[0];
        assert_eq!(sent.query_value("key"), Some("bk"));
        let RequestBody::Json(body) = &sent.body else {
            panic!("expected json body");
        };
        assert_eq!(
            body["threatInfo"]["threatEntries"][0]["url"],
            "http://malware.testing.google.test/testing/malware/"
        );
        assert_eq!(body["threatInfo"]["threatTypes"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn empty_object_is_clean() {
        let transport = Arc::new(ScriptedTransport::new().route(
            HttpMethod::Post,
            "threatMatches:find",
            vec![Ok(HttpReply::json(200, &json!({})))],
        ));
        let result = adapter(transport)
            .analyze(&AnalysisRequest::url("https://www.google.com"), BUDGET)
            .await;
        assert!(!result.detected);
        assert_eq!(result.error, None);
    }

    #[tokio::test]
    async fn files_are_not_supported() {
        let transport = Arc::new(ScriptedTransport::new());
        let blocklist = adapter(transport.clone());
        assert!(!blocklist.supports(ResourceKind::File));
        let result = blocklist
            .analyze(&AnalysisRequest::file_hash("a", "22".repeat(32)), BUDGET)
            .await;
        assert_eq!(result.error, Some(ErrorKind::Unreachable));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn server_error_is_unreachable() {
        let transport = Arc::new(ScriptedTransport::new().route(
            HttpMethod::Post,
            "threatMatches:find",
            vec![Ok(HttpReply::empty(503))],
        ));
        let result = adapter(transport)
            .analyze(&AnalysisRequest::url("https://x.test"), BUDGET)
            .await;
        assert_eq!(result.error, Some(ErrorKind::Unreachable));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_service_hits_request_timeout() {
        let transport = Arc::new(ScriptedTransport::new().route_delayed(
            HttpMethod::Post,
            "threatMatches:find",
            Duration::from_secs(60),
            vec![Ok(HttpReply::json(200, &json!({})))],
        ));
        let started = tokio::time::Instant::now();
        let result = adapter(transport.clone())
            .analyze(&AnalysisRequest::url("https://x.test"), Duration::from_secs(30))
            .await;
        assert_eq!(result.error, Some(ErrorKind::Timeout));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
        assert_eq!(transport.requests()[0].timeout, Some(Duration::from_secs(10)));
    }
}
