//! Reputation source adapters normalizing each protocol into [`EngineResult`].

/// Blocklist match query (URLs only).
pub mod blocklist;
/// Secondary multi-scanner: hash lookup, upload-then-poll, URL lookup.
pub mod multiscan;
/// Primary reputation aggregator: submit-then-poll.
pub mod reputation;
/// HTTP seam shared by the adapters.
pub mod transport;

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::model::{AnalysisRequest, EngineResult, ErrorKind, ResourceKind};

pub use blocklist::BlocklistAdapter;
pub use multiscan::MultiScanAdapter;
pub use reputation::ReputationAdapter;
pub use transport::{HttpMethod, HttpReply, HttpRequest, HttpTransport, ReqwestTransport, RequestBody, TransportError};

/// One reputation source.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Stable source name reported in results.
    fn name(&self) -> &str;

    /// Whether the source can assess this kind of resource.
    fn supports(&self, kind: ResourceKind) -> bool;

    /// Runs the source protocol within `timeout`. Failures come back as tagged results.
    async fn analyze(&self, request: &AnalysisRequest, timeout: Duration) -> EngineResult;
}

/// Adapter-internal failure, converted to an [`ErrorKind`] at the boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The source signalled rate limiting.
    #[error("rate limited (http {0})")]
    RateLimited(u16),
    /// Non-success status.
    #[error("unexpected http status {0}")]
    Status(u16),
    /// Body could not be decoded or failed validation.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Credentials missing.
    #[error("not configured: missing {0}")]
    NotConfigured(&'static str),
    /// Base URL cannot be used.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// The source has no record and nothing can be submitted.
    #[error("{0}")]
    NotFound(String),
    /// Poll budget exhausted.
    #[error("no final report after {0} poll attempts")]
    PollExhausted(u32),
}

impl EngineError {
    /// Normalized tag.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(TransportError::Timeout(_)) | Self::PollExhausted(_) => ErrorKind::Timeout,
            Self::Transport(_)
            | Self::Status(_)
            | Self::NotConfigured(_)
            | Self::InvalidEndpoint(_)
            | Self::NotFound(_) => ErrorKind::Unreachable,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Malformed(_) => ErrorKind::MalformedResponse,
        }
    }
}

/// Rejects rate-limit and non-success replies.
pub(crate) fn check_status(reply: &HttpReply) -> Result<(), EngineError> {
    match reply.status {
        429 => Err(EngineError::RateLimited(429)),
        status if !reply.is_success() => Err(EngineError::Status(status)),
        _ => Ok(()),
    }
}

/// Status check followed by JSON decoding.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(reply: &HttpReply) -> Result<T, EngineError> {
    check_status(reply)?;
    reply
        .decode()
        .map_err(|err| EngineError::Malformed(err.to_string()))
}

/// Fixed-interval polling with a capped attempt count.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Waits one interval before each check; `Ok(None)` means not ready yet.
    pub(crate) async fn run<T, F, Fut>(self, source: &str, mut check: F) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, EngineError>> + Send,
    {
        for attempt in 1..=self.max_attempts {
            sleep(self.interval).await;
            if let Some(found) = check(attempt).await? {
                return Ok(found);
            }
            debug!(source, attempt, max = self.max_attempts, "report not ready");
        }
        Err(EngineError::PollExhausted(self.max_attempts))
    }
}

/// Runs an adapter protocol under its overall budget and normalizes the outcome.
pub(crate) async fn guarded<F>(source: &str, timeout: Duration, protocol: F) -> EngineResult
where
    F: Future<Output = Result<EngineResult, EngineError>> + Send,
{
    match tokio::time::timeout(timeout, protocol).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            warn!(source, error = %err, kind = %err.kind(), "engine lookup failed");
            EngineResult::failure(source, err.kind(), err.to_string())
        }
        Err(_) => {
            warn!(source, ?timeout, "engine lookup exceeded its budget");
            EngineResult::failure(
                source,
                ErrorKind::Timeout,
                format!("no answer within {}ms", timeout.as_millis()),
            )
        }
    }
}

/// Trims the trailing slash of a configured base URL.
pub(crate) fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_kinds() {
        assert_eq!(EngineError::RateLimited(204).kind(), ErrorKind::RateLimited);
        assert_eq!(EngineError::PollExhausted(6).kind(), ErrorKind::Timeout);
        assert_eq!(
            EngineError::Transport(TransportError::Timeout("slow".into())).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            EngineError::Transport(TransportError::Connect("refused".into())).kind(),
            ErrorKind::Unreachable
        );
        assert_eq!(EngineError::NotConfigured("api key").kind(), ErrorKind::Unreachable);
        assert_eq!(EngineError::Malformed("x".into()).kind(), ErrorKind::MalformedResponse);
    }

    #[test]
    fn status_mapping() {
        assert!(check_status(&HttpReply::empty(200)).is_ok());
        assert!(matches!(
            check_status(&HttpReply::empty(429)),
            Err(EngineError::RateLimited(429))
        ));
        assert!(matches!(
            check_status(&HttpReply::empty(503)),
            Err(EngineError::Status(503))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_is_bounded() {
        let policy = PollPolicy {
            interval: Duration::from_secs(5),
            max_attempts: 3,
        };
        let started = tokio::time::Instant::now();
        let mut calls = 0;
        let outcome: Result<(), EngineError> = policy
            .run("test", |_| {
                calls += 1;
                async { Ok(None) }
            })
            .await;
        assert!(matches!(outcome, Err(EngineError::PollExhausted(3))));
        assert_eq!(calls, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn guarded_converts_overrun_to_timeout() {
        let result = guarded("slow", Duration::from_secs(2), async {
            sleep(Duration::from_secs(10)).await;
            Ok(EngineResult::success("slow", 1, 2))
        })
        .await;
        assert_eq!(result.error, Some(ErrorKind::Timeout));
        assert_eq!(result.source_name, "slow");
    }

    #[test]
    fn endpoint_joins_cleanly() {
        assert_eq!(endpoint("https://api.test/v4/", "/hash/abc"), "https://api.test/v4/hash/abc");
    }
}
