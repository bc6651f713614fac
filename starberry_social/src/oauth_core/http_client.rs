use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use super::types::OAuthError;

/// HTTP methods used against provider endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    GET,
    POST,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP redirect policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectPolicy {
    /// Do not follow redirections.
    None,
    /// Follow up to `u32` redirections.
    Limit(u32),
}

/// HTTP request for executing a call.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method (GET, POST).
    pub method: HttpMethod,
    /// Target URL, including any query string.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
    /// Optional timeout duration.
    pub timeout: Option<Duration>,
    /// Redirect policy to use for this request.
    pub redirect_policy: RedirectPolicy,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            redirect_policy: RedirectPolicy::None,
        }
    }

    /// POST with an `application/x-www-form-urlencoded` body.
    pub fn post_form(url: impl Into<String>, body: String) -> Self {
        Self {
            method: HttpMethod::POST,
            url: url.into(),
            headers: vec![(
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )],
            body: Some(body.into_bytes()),
            timeout: None,
            redirect_policy: RedirectPolicy::None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Request body as UTF-8 text.
    pub fn body_text(&self) -> Option<String> {
        self.body.as_ref().map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

/// HTTP response from executing a call.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Builds a JSON response, mostly for mocks.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    /// Builds a form-encoded response, mostly for mocks.
    pub fn form(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/x-www-form-urlencoded".into())],
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Error type for HTTP client operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpClientError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http client has been closed")]
    Closed,
}

impl From<HttpClientError> for OAuthError {
    fn from(err: HttpClientError) -> Self {
        OAuthError::ProviderUnavailable(err.to_string())
    }
}

pub type HttpFuture =
    Pin<Box<dyn Future<Output = Result<HttpResponse, HttpClientError>> + Send + 'static>>;

/// Outbound HTTP client shared by every flow.
///
/// Implementations must be safe to call concurrently and should reuse connections.
pub trait OAuthHttpClient: Send + Sync + 'static {
    /// Execute an HTTP request asynchronously.
    fn execute(&self, request: HttpRequest) -> HttpFuture;

    /// Releases pooled connections. Later calls fail with [`HttpClientError::Closed`].
    fn close(&self) {}
}

fn url_key(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}

/// In-memory HTTP client stub for testing.
///
/// Responses are matched on the URL without its query string. Every executed request is
/// recorded and can be inspected with [`InMemoryHttpClient::requests`].
#[derive(Clone, Default)]
pub struct InMemoryHttpClient {
    responses: Arc<DashMap<String, Result<HttpResponse, HttpClientError>>>,
    default_response: Option<HttpResponse>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryHttpClient {
    /// Creates a new in-memory HTTP client with no default response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory HTTP client with a default response on miss.
    pub fn with_default(response: HttpResponse) -> Self {
        Self { default_response: Some(response), ..Self::default() }
    }

    /// Register a mock response for a specific URL.
    pub fn insert_response(&self, url: impl Into<String>, response: HttpResponse) {
        self.responses.insert(url.into(), Ok(response));
    }

    /// Register a transport failure for a specific URL.
    pub fn insert_error(&self, url: impl Into<String>, error: HttpClientError) {
        self.responses.insert(url.into(), Err(error));
    }

    /// Requests executed so far, oldest first.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Number of requests sent to `url` (query string ignored).
    pub fn request_count(&self, url: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| url_key(&r.url) == url_key(url))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl OAuthHttpClient for InMemoryHttpClient {
    fn execute(&self, request: HttpRequest) -> HttpFuture {
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        let closed = self.is_closed();
        let responses = self.responses.clone();
        let default = self.default_response.clone();
        let key = url_key(&request.url).to_string();
        Box::pin(async move {
            if closed {
                return Err(HttpClientError::Closed);
            }
            if let Some(entry) = responses.get(&key) {
                entry.value().clone()
            } else if let Some(resp) = default {
                Ok(resp)
            } else {
                Err(HttpClientError::Transport(format!("no mock response for {}", key)))
            }
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// HTTP client backed by a pooled `reqwest::Client`.
///
/// Clones share the pool. [`OAuthHttpClient::close`] drops the shared client, which releases
/// its pooled connections once in-flight requests finish.
#[cfg(feature = "reqwest-client")]
#[derive(Clone)]
pub struct ReqwestHttpClient {
    inner: Arc<std::sync::RwLock<Option<reqwest::Client>>>,
}

#[cfg(feature = "reqwest-client")]
impl ReqwestHttpClient {
    /// Create a client that never follows redirects on its own; see [`RedirectPolicy`].
    pub fn new() -> Result<Self, HttpClientError> {
        let inner = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| HttpClientError::Transport(e.to_string()))?;
        Ok(Self::with_client(inner))
    }

    /// Wrap an existing client. It should be built with redirects disabled.
    pub fn with_client(inner: reqwest::Client) -> Self {
        Self { inner: Arc::new(std::sync::RwLock::new(Some(inner))) }
    }

    fn classify(err: reqwest::Error) -> HttpClientError {
        if err.is_timeout() {
            HttpClientError::Timeout
        } else {
            HttpClientError::Transport(err.to_string())
        }
    }

    async fn send_once(
        client: &reqwest::Client,
        request: &HttpRequest,
    ) -> Result<HttpResponse, HttpClientError> {
        let method = match request.method {
            HttpMethod::GET => reqwest::Method::GET,
            HttpMethod::POST => reqwest::Method::POST,
        };
        let mut builder = client.request(method, &request.url);
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        let resp = builder.send().await.map_err(Self::classify)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = resp.bytes().await.map_err(Self::classify)?.to_vec();
        Ok(HttpResponse { status, headers, body })
    }
}

#[cfg(feature = "reqwest-client")]
impl OAuthHttpClient for ReqwestHttpClient {
    fn execute(&self, request: HttpRequest) -> HttpFuture {
        let client = self.inner.read().ok().and_then(|guard| guard.clone());
        Box::pin(async move {
            let Some(client) = client else {
                return Err(HttpClientError::Closed);
            };
            let mut request = request;
            let mut remaining = match request.redirect_policy {
                RedirectPolicy::None => 0,
                RedirectPolicy::Limit(n) => n,
            };
            loop {
                let resp = Self::send_once(&client, &request).await?;
                let location = resp.header("location").map(str::to_string);
                match (resp.status, location) {
                    (301 | 302 | 303 | 307 | 308, Some(location)) if remaining > 0 => {
                        remaining -= 1;
                        let next = url::Url::parse(&request.url)
                            .and_then(|base| base.join(&location))
                            .map_err(|e| HttpClientError::Transport(e.to_string()))?;
                        request.url = next.to_string();
                        if !matches!(resp.status, 307 | 308) {
                            request.method = HttpMethod::GET;
                            request.body = None;
                        }
                    }
                    _ => return Ok(resp),
                }
            }
        })
    }

    fn close(&self) {
        if let Ok(mut guard) = self.inner.write() {
            guard.take();
        }
    }
}

/// Parses a response body that may be JSON or `application/x-www-form-urlencoded`.
///
/// The content type decides when present; otherwise JSON is tried first.
pub fn parse_token_body(response: &HttpResponse) -> Option<HashMap<String, serde_json::Value>> {
    let is_form = response
        .content_type()
        .map(|ct| ct.contains("x-www-form-urlencoded") || ct.starts_with("text/plain"))
        .unwrap_or(false);
    if !is_form {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(&response.body) {
            return Some(map.into_iter().collect());
        }
    }
    let text = response.text();
    let pairs = starberry_lib::parse_pairs(text.trim());
    if pairs.is_empty() || pairs.iter().all(|(_, v)| v.is_empty()) {
        return None;
    }
    Some(
        pairs
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect(),
    )
}
