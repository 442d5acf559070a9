//! The `HttpClient` external collaborator. Only the interface the core
//! calls is fixed here; `ReqwestHttpClient` is a concrete, swappable
//! implementation.

use crate::error::AgentError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, AgentError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A plain request, independent of whatever transport executes it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), headers: BTreeMap::new(), body: Vec::new() }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, AgentError>;
}

/// Production `HttpClient` backed by `reqwest`. `compression_level > 0`
/// gzips POST bodies and sets `Content-Encoding: gzip`.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    compression_level: u32,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration, compression_level: u32) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Bootstrap(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, compression_level })
    }

    fn gzip(&self, body: Vec<u8>) -> Result<Vec<u8>, AgentError> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let level = self.compression_level.clamp(1, 9);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
        encoder.write_all(&body)?;
        encoder.finish().map_err(AgentError::from)
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, AgentError> {
        let compress = self.compression_level > 0 && request.method == Method::Post && !request.body.is_empty();
        let body = if compress { self.gzip(request.body.clone())? } else { request.body.clone() };

        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url).body(body),
            Method::Head => self.client.head(&request.url),
        };
        for (k, v) in &request.headers {
            builder = builder.header(k, v);
        }
        if compress {
            builder = builder.header("Content-Encoding", "gzip");
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                AgentError::Transient(e.to_string())
            } else {
                AgentError::Transient(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.bytes().await.map_err(AgentError::transient)?.to_vec();

        Ok(HttpResponse { status, retry_after, body })
    }
}

/// Test double for `HttpClient`, kept outside `#[cfg(test)]` so both unit
/// tests and the `tests/` integration binaries can script responses.
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Scripted responses for one or more calls, for sender/identity/
    /// register/command-channel tests.
    pub struct FakeHttpClient {
        responses: Mutex<std::collections::VecDeque<Result<HttpResponse, AgentError>>>,
        pub requests: Mutex<Vec<HttpRequest>>,
    }

    impl FakeHttpClient {
        pub fn new(responses: Vec<Result<HttpResponse, AgentError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn ok(body: serde_json::Value) -> HttpResponse {
            HttpResponse {
                status: 200,
                retry_after: None,
                body: serde_json::to_vec(&body).unwrap(),
            }
        }
    }

    #[async_trait]
    impl HttpClient for FakeHttpClient {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, AgentError> {
            self.requests.lock().unwrap_or_else(|e| e.into_inner()).push(request);
            let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
            responses.pop_front().unwrap_or_else(|| {
                Ok(HttpResponse { status: 200, retry_after: None, body: b"{}".to_vec() })
            })
        }
    }
}
