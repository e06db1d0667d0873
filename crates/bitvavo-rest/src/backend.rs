//! HTTP execution layer
//!
//! [`RestTransport`](crate::RestTransport) builds fully signed requests and
//! hands them to an [`HttpBackend`]. The real backend is reqwest; tests use
//! [`MockBackend`] to script responses and inspect what was sent.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use tracing::debug;

use crate::error::{RestError, RestResult};

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl Method {
    /// Upper-case method name, as signed
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A request ready to go on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Extra headers (lower-case names)
    pub headers: Vec<(&'static str, String)>,
    /// Serialized JSON body
    pub body: Option<String>,
}

impl HttpRequest {
    /// Value of a header set on this request
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers (case-insensitive lookup)
    pub headers: HeaderMap,
    /// Body text
    pub body: String,
}

/// Executes HTTP requests
///
/// Errors returned here are transport failures (no response at all) and
/// should be [`RestError::Network`].
#[async_trait]
pub trait HttpBackend: Send + Sync {
    /// Send a request and return whatever the server answered
    async fn execute(&self, request: HttpRequest) -> RestResult<HttpResponse>;
}

/// reqwest-based backend
#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    /// Create a backend with a request timeout
    pub fn new(timeout: Duration) -> RestResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bitvavo-rest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RestError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: HttpRequest) -> RestResult<HttpResponse> {
        debug!(method = %request.method, url = %request.url, "Sending request");

        let mut builder = self.client.request(request.method.into(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RestError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| RestError::Network(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Scripted backend for tests
///
/// Responses are returned in the order they were pushed. Every executed
/// request is recorded.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct MockBackend {
    script: parking_lot::Mutex<std::collections::VecDeque<MockReply>>,
    requests: parking_lot::Mutex<Vec<HttpRequest>>,
}

#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
enum MockReply {
    Response(HttpResponse),
    NetworkError(String),
}

#[cfg(any(test, feature = "test-utils"))]
impl MockBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response
    pub fn push_response(&self, status: u16, headers: &[(&str, &str)], body: impl Into<String>) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                map.insert(name, value);
            }
        }
        self.script.lock().push_back(MockReply::Response(HttpResponse {
            status,
            headers: map,
            body: body.into(),
        }));
    }

    /// Queue a `200 OK` JSON response
    pub fn push_json(&self, body: serde_json::Value) {
        self.push_response(200, &[], body.to_string());
    }

    /// Queue a transport failure
    pub fn push_network_error(&self, message: impl Into<String>) {
        self.script
            .lock()
            .push_back(MockReply::NetworkError(message.into()));
    }

    /// Requests executed so far
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests executed so far
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl HttpBackend for MockBackend {
    async fn execute(&self, request: HttpRequest) -> RestResult<HttpResponse> {
        self.requests.lock().push(request);
        match self.script.lock().pop_front() {
            Some(MockReply::Response(response)) => Ok(response),
            Some(MockReply::NetworkError(message)) => Err(RestError::Network(message)),
            None => Err(RestError::Network("no scripted response".into())),
        }
    }
}
