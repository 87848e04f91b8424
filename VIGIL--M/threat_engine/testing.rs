//! In-crate fakes shared by the unit tests.

use std::{
    collections::VecDeque,
    io::{Cursor, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::{
    engines::{guarded, EngineAdapter, HttpMethod, HttpReply, HttpRequest, HttpTransport, TransportError},
    explainer::{GeneratorError, TextGenerator},
    model::{AnalysisRequest, EngineResult, ResourceKind},
};

type Reply = Result<HttpReply, TransportError>;

struct Route {
    method: HttpMethod,
    fragment: String,
    replies: VecDeque<Reply>,
    delay: Option<Duration>,
}

/// Transport answering from per-route reply queues. The last reply of a queue repeats.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers requests whose URL contains `fragment`.
    pub fn route(self, method: HttpMethod, fragment: &str, replies: Vec<Reply>) -> Self {
        self.push(method, fragment, replies, None)
    }

    /// Same as [`Self::route`], answering after `delay` (or timing out at the request timeout).
    pub fn route_delayed(self, method: HttpMethod, fragment: &str, delay: Duration, replies: Vec<Reply>) -> Self {
        self.push(method, fragment, replies, Some(delay))
    }

    fn push(self, method: HttpMethod, fragment: &str, replies: Vec<Reply>, delay: Option<Duration>) -> Self {
        self.routes.lock().push(Route {
            method,
            fragment: fragment.to_string(),
            replies: replies.into(),
            delay,
        });
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn calls_to(&self, fragment: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.url.contains(fragment))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpReply, TransportError> {
        self.requests.lock().push(request.clone());
        let (reply, delay) = {
            let mut routes = self.routes.lock();
            let Some(route) = routes
                .iter_mut()
                .find(|route| route.method == request.method && request.url.contains(&route.fragment))
            else {
                return Err(TransportError::Connect(format!("no route for {}", request.url)));
            };
            let reply = if route.replies.len() > 1 {
                route.replies.pop_front()
            } else {
                route.replies.front().cloned()
            };
            (reply, route.delay)
        };
        if let Some(delay) = delay {
            match request.timeout {
                Some(limit) if limit < delay => {
                    tokio::time::sleep(limit).await;
                    return Err(TransportError::Timeout(format!("{} timed out", request.url)));
                }
                _ => tokio::time::sleep(delay).await,
            }
        }
        reply.unwrap_or_else(|| Err(TransportError::Connect("route has no replies".into())))
    }
}

/// Adapter returning a fixed result and counting invocations.
pub struct StubAdapter {
    name: String,
    result: EngineResult,
    delay: Option<Duration>,
    kinds: Vec<ResourceKind>,
    honour_budget: bool,
    calls: AtomicUsize,
    budgets: Mutex<Vec<Duration>>,
}

impl StubAdapter {
    pub fn new(result: EngineResult) -> Self {
        Self {
            name: result.source_name.clone(),
            result,
            delay: None,
            kinds: vec![ResourceKind::Url, ResourceKind::File],
            honour_budget: true,
            calls: AtomicUsize::new(0),
            budgets: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn urls_only(mut self) -> Self {
        self.kinds = vec![ResourceKind::Url];
        self
    }

    /// Keeps sleeping past the budget it is given.
    pub fn ignoring_budget(mut self) -> Self {
        self.honour_budget = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Budgets received, one per call.
    pub fn budgets(&self) -> Vec<Duration> {
        self.budgets.lock().clone()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl EngineAdapter for StubAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, kind: ResourceKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn analyze(&self, _request: &AnalysisRequest, timeout: Duration) -> EngineResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.budgets.lock().push(timeout);
        let delay = self.delay.unwrap_or_default();
        let result = self.result.clone();
        if self.honour_budget {
            guarded(&self.name, timeout, async move {
                tokio::time::sleep(delay).await;
                Ok(result)
            })
            .await
        } else {
            tokio::time::sleep(delay).await;
            result
        }
    }
}

/// Generator returning canned text and recording prompts.
pub struct CannedGenerator {
    reply: Option<String>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl CannedGenerator {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl TextGenerator for CannedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GeneratorError> {
        self.prompts.lock().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply
            .clone()
            .ok_or_else(|| GeneratorError::Unavailable("service down".into()))
    }
}

/// Single stored entry archive.
pub fn plain_zip() -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    writer.start_file("payload.txt", options).unwrap();
    writer.write_all(b"quarterly numbers").unwrap();
    writer.finish().unwrap().into_inner()
}

/// [`plain_zip`] with the encryption bit set in every local and central header.
pub fn encrypted_zip() -> Vec<u8> {
    let mut data = plain_zip();
    let mut offset = 0;
    while offset + 4 <= data.len() {
        let flag_at = match data[offset..offset + 4] {
            [0x50, 0x4b, 0x03, 0x04] => Some(offset + 6),
            [0x50, 0x4b, 0x01, 0x02] => Some(offset + 8),
            _ => None,
        };
        if let Some(at) = flag_at {
            data[at] |= 0x01;
        }
        offset += 1;
    }
    data
}
