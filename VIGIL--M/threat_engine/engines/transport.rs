use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{
    header::{HeaderName, HeaderValue, CONTENT_TYPE},
    multipart::{Form, Part},
    Client,
};
use serde::de::DeserializeOwned;

/// Supported HTTP verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// HTTP GET.
    Get,
    /// HTTP POST.
    Post,
}

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// No body.
    Empty,
    /// JSON document.
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded` pairs.
    Form(Vec<(String, String)>),
    /// Raw bytes sent as `application/octet-stream`.
    Bytes(Vec<u8>),
    /// Single-file multipart upload.
    Multipart {
        /// Form field name.
        field: String,
        /// File name reported to the server.
        file_name: String,
        /// File content.
        data: Vec<u8>,
    },
}

/// Declarative outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// HTTP verb.
    pub method: HttpMethod,
    /// Fully qualified URL without query string.
    pub url: String,
    /// Query parameters, appended in order.
    pub query: Vec<(String, String)>,
    /// Extra headers.
    pub headers: BTreeMap<String, String>,
    /// Payload.
    pub body: RequestBody,
    /// Per-request timeout.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    /// GET request.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// POST request.
    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Value of a query parameter.
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Raw reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpReply {
    /// Reply with a JSON body.
    #[must_use]
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string().into_bytes(),
        }
    }

    /// Reply without body.
    #[must_use]
    pub const fn empty(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    /// True for 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Errors surfaced by transports.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The request did not finish in time.
    #[error("request timed out: {0}")]
    Timeout(String),
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Any other transport failure.
    #[error("transport error: {0}")]
    Io(String),
}

/// Abstraction over concrete HTTP clients.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends the request and returns the reply, whatever its status.
    async fn send(&self, request: HttpRequest) -> Result<HttpReply, TransportError>;
}

/// Production transport backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestTransport").finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    /// Builds a client with the engine user agent.
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("vigil-threat-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpReply, TransportError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let mut builder = self.client.request(method, &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| TransportError::Io(format!("invalid header {key}: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| TransportError::Io(format!("invalid header {key}: {err}")))?;
            builder = builder.header(name, value);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(pairs) => builder.form(&pairs),
            RequestBody::Bytes(data) => builder
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(data),
            RequestBody::Multipart {
                field,
                file_name,
                data,
            } => builder.multipart(Form::new().part(field, Part::bytes(data).file_name(file_name))),
        };
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder.send().await.map_err(|err| classify(&err))?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|err| classify(&err))?;
        Ok(HttpReply {
            status,
            body: body.to_vec(),
        })
    }
}
