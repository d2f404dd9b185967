//! # PrayerKit Net
//!
//! HTTP networking for PrayerKit.
//!
//! ## Design Goals
//!
//! 1. **Async HTTP**: Non-blocking network requests through reqwest
//! 2. **Single-use bodies**: a [`Response`] is consumed when its body is read
//!    or when it is handed to a cache; using it twice requires an explicit
//!    [`Response::duplicate`]
//! 3. **Fetcher seam**: everything above this crate fetches through the
//!    [`Fetcher`] trait, so the network can be swapped for a disconnected one

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use prayerkit_common::PrayerKitError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};

pub use url::Url;

pub mod fetcher;

pub use fetcher::{DisconnectedFetcher, Fetcher};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unavailable: {0}")]
    Offline(String),

    #[error("Body decode error: {0}")]
    Decode(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl NetError {
    /// Whether the failure happened below HTTP (no response at all).
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            NetError::Offline(_) | NetError::Timeout(_) | NetError::HttpError(_)
        )
    }
}

impl From<NetError> for PrayerKitError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Timeout(duration) => PrayerKitError::Timeout(duration),
            NetError::InvalidUrl(url) => PrayerKitError::InvalidArgument(url),
            other => PrayerKitError::network_with_source("fetch failed", other),
        }
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, deciding how cross-origin responses are exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// Top-level navigation.
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Cross-origin with CORS; the response is readable.
    Cors,
    /// Cross-origin without CORS; the response is opaque.
    #[default]
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub mode: RequestMode,
    pub referrer: Option<Url>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(body);
        request
    }

    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: Some(Duration::from_secs(30)),
            mode: RequestMode::default(),
            referrer: None,
        }
    }

    /// Parse a URL and create a GET request.
    pub fn get_str(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set referrer (the page issuing the request).
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Whether the request targets a different origin than its referrer.
    pub fn is_cross_origin(&self) -> bool {
        match &self.referrer {
            Some(referrer) => referrer.origin() != self.url.origin(),
            None => false,
        }
    }

    /// The response type a browser would expose for this request.
    pub fn response_type(&self) -> ResponseType {
        if !self.is_cross_origin() {
            return ResponseType::Basic;
        }
        match self.mode {
            RequestMode::NoCors => ResponseType::Opaque,
            _ => ResponseType::Cors,
        }
    }
}

/// How much of a response the page may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response allowed by CORS.
    Cors,
    /// Cross-origin no-cors response; status and body are not readable.
    Opaque,
}

/// HTTP response.
///
/// Not `Clone`: the body is consumed by [`Response::bytes`] or by moving the
/// response into a cache. Call [`Response::duplicate`] to get a second,
/// independent response before using one for two purposes.
#[derive(Debug)]
pub struct Response {
    pub request_id: RequestId,
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub content_type: Option<Mime>,
    pub content_length: Option<u64>,
    /// Served from a local cache rather than the network.
    pub from_cache: bool,
    body: ResponseBody,
}

/// Response body variants.
#[derive(Debug)]
enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Empty.
    Empty,
}

impl Response {
    /// Build a response from parts.
    pub fn from_parts(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok());

        let content_length = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        Self {
            request_id: RequestId::new(),
            url,
            status,
            headers,
            response_type: ResponseType::Basic,
            content_type,
            content_length,
            from_cache: false,
            body: if body.is_empty() {
                ResponseBody::Empty
            } else {
                ResponseBody::Full(body)
            },
        }
    }

    /// Build a `200 OK` response with the given body.
    pub fn ok_with_body(url: Url, body: impl Into<Bytes>) -> Self {
        Self::from_parts(url, StatusCode::OK, HeaderMap::new(), body.into())
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Mark the response as served from a cache.
    pub fn with_from_cache(mut self, from_cache: bool) -> Self {
        self.from_cache = from_cache;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether this is an opaque cross-origin response.
    pub fn is_opaque(&self) -> bool {
        self.response_type == ResponseType::Opaque
    }

    /// Length of the body in bytes.
    pub fn body_len(&self) -> usize {
        match &self.body {
            ResponseBody::Full(b) => b.len(),
            ResponseBody::Empty => 0,
        }
    }

    /// Create an independent copy of this response, body included.
    pub fn duplicate(&self) -> Response {
        Response {
            request_id: self.request_id,
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            response_type: self.response_type,
            content_type: self.content_type.clone(),
            content_length: self.content_length,
            from_cache: self.from_cache,
            body: match &self.body {
                ResponseBody::Full(b) => ResponseBody::Full(b.clone()),
                ResponseBody::Empty => ResponseBody::Empty,
            },
        }
    }

    /// Get the body as bytes.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        Ok(self.into_body())
    }

    /// Consume the response and return its body.
    pub fn into_body(self) -> Bytes {
        match self.body {
            ResponseBody::Full(b) => b,
            ResponseBody::Empty => Bytes::new(),
        }
    }

    /// Get the body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::Decode(e.to_string()))
    }
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("PrayerKit/", env!("CARGO_PKG_VERSION")).to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: false,
        }
    }
}

/// Resource loader backed by reqwest.
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load a request from the network.
    pub async fn load(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let response_type = request.response_type();
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(ref referrer) = request.referrer {
            req_builder = req_builder.header("Referer", referrer.as_str());
        }

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        req_builder = req_builder.timeout(timeout);

        let response = req_builder.send().await.map_err(|e| classify(e, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        let body = response.bytes().await.map_err(|e| classify(e, timeout))?;

        let mut response = Response::from_parts(url, status, headers, body);
        response.request_id = request.id;
        response.response_type = response_type;

        trace!(
            url = %response.url,
            status = %response.status,
            content_type = ?response.content_type,
            body_len = response.body_len(),
            "Response received"
        );

        Ok(response)
    }
}

fn classify(error: reqwest::Error, timeout: Duration) -> NetError {
    if error.is_timeout() {
        NetError::Timeout(timeout)
    } else if error.is_connect() {
        NetError::Offline(error.to_string())
    } else {
        NetError::HttpError(error)
    }
}
