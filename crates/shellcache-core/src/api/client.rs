//! HTTP client for the admin API.
//!
//! Every request goes through the same two interceptors: the outbound one
//! attaches the stored bearer token, the inbound one times the call and
//! classifies failures into `ApiError`. An unauthorized response evicts the
//! stored token and sends the user back to the login page.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{join_all, AbortHandle, Abortable};
use futures::{FutureExt, StreamExt};
use reqwest::{header, multipart, Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::ApiError;
use crate::reporting::{tracing_reporter, ErrorReport, ReportSource, SharedReporter};
use crate::storage::LocalStore;
use crate::util::retry_with_backoff;

// ============================================================================
// Constants
// ============================================================================

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Health checks fail faster than ordinary calls.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Where an unauthorized response sends the user.
pub const LOGIN_PATH: &str = "/login";

/// First delay of `retry_request`; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Upload body chunk size; progress is reported once per chunk.
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

const DEFAULT_DOWNLOAD_NAME: &str = "download";

/// Upload/download progress callback, called with a percentage.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

// ============================================================================
// Requests and responses
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base URL, or an absolute URL
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body; a non-JSON body is kept as a string, an empty one is null
    pub data: Value,
    pub duration: Duration,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_value(self.data.clone()).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub request: ApiRequest,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ApiError>,
}

/// The seam resources fetch through.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError>;
}

// ============================================================================
// Cancellation
// ============================================================================

/// Aborts the request it was created with. Clone is cheap.
#[derive(Debug, Clone)]
pub struct CancelHandle(AbortHandle);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_aborted()
    }
}

/// Wrap a request future so it can be aborted; an aborted call resolves to
/// `ApiError::Cancelled`.
pub fn cancellable<F, T>(future: F) -> (CancelHandle, impl Future<Output = Result<T, ApiError>>)
where
    F: Future<Output = Result<T, ApiError>>,
{
    let (handle, registration) = AbortHandle::new_pair();
    let future = Abortable::new(future, registration).map(|result| result.unwrap_or(Err(ApiError::Cancelled)));
    (CancelHandle(handle), future)
}

// ============================================================================
// Navigation
// ============================================================================

/// Where the user currently is, and how to send them elsewhere.
pub trait Navigator: Send + Sync {
    fn current_path(&self) -> String;
    fn navigate(&self, path: &str);
}

/// Navigator without a UI: records the path and logs each move.
#[derive(Debug, Clone)]
pub struct LoggingNavigator {
    path: Arc<Mutex<String>>,
}

impl LoggingNavigator {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Arc::new(Mutex::new(path.into())),
        }
    }
}

impl Default for LoggingNavigator {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Navigator for LoggingNavigator {
    fn current_path(&self) -> String {
        self.path.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn navigate(&self, path: &str) {
        let mut current = self.path.lock().unwrap_or_else(|e| e.into_inner());
        info!(from = %current, to = path, "Navigating");
        *current = path.to_string();
    }
}

// ============================================================================
// Client
// ============================================================================

/// API client. Clone is cheap - reqwest::Client uses Arc internally for
/// connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    health_timeout: Duration,
    store: LocalStore,
    navigator: Arc<dyn Navigator>,
    reporter: SharedReporter,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration, store: LocalStore) -> Result<Self, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            store,
            navigator: Arc::new(LoggingNavigator::default()),
            reporter: tracing_reporter(),
        })
    }

    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth_headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = self.store.get_token() {
            match header::HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(value) => {
                    headers.insert(header::AUTHORIZATION, value);
                }
                Err(_) => warn!("Stored token is not a valid header value, sending without it"),
            }
        }
        headers
    }

    /// Response interceptor: log the timing and turn failures into `ApiError`.
    async fn check(
        &self,
        method: &Method,
        url: &str,
        started: Instant,
        result: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response, ApiError> {
        let duration_ms = started.elapsed().as_millis() as u64;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(method = %method, url, duration_ms, error = %e, "Request failed");
                return Err(e.into());
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!(method = %method, url, status = status.as_u16(), duration_ms, "Request completed");
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        let error = ApiError::from_status(status.as_u16(), retry_after.as_deref(), &body);
        warn!(method = %method, url, status = status.as_u16(), duration_ms, error = %error, "Request failed");

        if error == ApiError::Unauthorized {
            self.handle_unauthorized(url);
        }
        Err(error)
    }

    /// The session is unusable for every caller: drop the token and go to login.
    fn handle_unauthorized(&self, url: &str) {
        if let Err(e) = self.store.remove_token() {
            warn!(error = %e, "Failed to clear stored token");
        }
        self.reporter.report(
            ErrorReport::new(ReportSource::Request, "Unauthorized response, stored token cleared")
                .with_context(url.to_string()),
        );
        if self.navigator.current_path() != LOGIN_PATH {
            self.navigator.navigate(LOGIN_PATH);
        }
    }

    async fn read_response(response: reqwest::Response, started: Instant) -> Result<ApiResponse, ApiError> {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let text = response.text().await?;
        let data = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(ApiResponse {
            status,
            headers,
            data,
            duration: started.elapsed(),
        })
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.path);
        let started = Instant::now();

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(self.auth_headers());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = self.check(&request.method, &url, started, builder.send().await).await?;
        Self::read_response(response, started).await
    }

    /// `send` bound to a cancel handle.
    pub fn send_cancellable(
        &self,
        request: ApiRequest,
    ) -> (CancelHandle, impl Future<Output = Result<ApiResponse, ApiError>> + '_) {
        cancellable(self.send(request))
    }

    // ===== Verbs =====

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::new(Method::GET, path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::new(Method::POST, path).with_body(body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::new(Method::PUT, path).with_body(body)).await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::new(Method::PATCH, path).with_body(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::new(Method::DELETE, path)).await
    }

    // ===== Files =====

    /// Upload `file` as multipart field `file`, streaming it in chunks.
    pub async fn upload_file(
        &self,
        path: &str,
        file: &Path,
        on_progress: Option<ProgressFn>,
    ) -> Result<ApiResponse, ApiError> {
        let contents = tokio::fs::read(file).await?;
        let total = contents.len() as u64;
        let file_name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let chunks: Vec<Vec<u8>> = contents.chunks(UPLOAD_CHUNK_BYTES).map(<[u8]>::to_vec).collect();
        let mut sent = 0u64;
        let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            if let Some(on_progress) = &on_progress {
                on_progress(percent(sent, total));
            }
            Ok::<_, std::io::Error>(chunk)
        }));

        let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), total).file_name(file_name);
        let form = multipart::Form::new().part("file", part);

        let url = self.url(path);
        let started = Instant::now();
        let result = self
            .client
            .post(&url)
            .headers(self.auth_headers())
            .multipart(form)
            .send()
            .await;
        let response = self.check(&Method::POST, &url, started, result).await?;
        Self::read_response(response, started).await
    }

    /// Stream a download to `dest_dir/filename` (default `download`).
    /// Progress is only reported when the server sends a content length.
    pub async fn download_file(
        &self,
        path: &str,
        dest_dir: &Path,
        filename: Option<&str>,
        on_progress: Option<ProgressFn>,
    ) -> Result<PathBuf, ApiError> {
        let url = self.url(path);
        let started = Instant::now();
        let result = self.client.get(&url).headers(self.auth_headers()).send().await;
        let response = self.check(&Method::GET, &url, started, result).await?;

        // Only the final component, so a server-suggested name cannot escape dest_dir
        let name = filename
            .and_then(|n| Path::new(n).file_name())
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_DOWNLOAD_NAME);
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(name);

        let total = response.content_length();
        let mut file = tokio::fs::File::create(&dest).await?;
        let mut received = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let (Some(on_progress), Some(total)) = (&on_progress, total) {
                on_progress(percent(received, total));
            }
        }
        file.flush().await?;

        debug!(url, dest = %dest.display(), bytes = received, "Download saved");
        Ok(dest)
    }

    // ===== Composite calls =====

    /// Run every request concurrently. Never fails as a whole.
    pub async fn batch(&self, requests: Vec<ApiRequest>) -> Vec<BatchResult> {
        let outcomes = join_all(requests.iter().cloned().map(|request| self.send(request))).await;
        requests
            .into_iter()
            .zip(outcomes)
            .map(|(request, outcome)| match outcome {
                Ok(response) => BatchResult {
                    request,
                    success: true,
                    data: Some(response.data),
                    error: None,
                },
                Err(error) => BatchResult {
                    request,
                    success: false,
                    data: None,
                    error: Some(error),
                },
            })
            .collect()
    }

    /// GET `/health`. Failures are folded into `{"status": "unhealthy"}`.
    pub async fn health_check(&self) -> Value {
        let url = self.url("/health");
        let started = Instant::now();
        let result = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .timeout(self.health_timeout)
            .send()
            .await;

        let outcome = match self.check(&Method::GET, &url, started, result).await {
            Ok(response) => Self::read_response(response, started).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(response) => response.data,
            Err(e) => json!({ "status": "unhealthy", "error": e.to_string() }),
        }
    }

    /// Issue `request` up to `attempts` times, waiting `2^i` seconds after
    /// the i-th failure. The last error is returned.
    pub async fn retry_request(&self, request: ApiRequest, attempts: u32) -> Result<ApiResponse, ApiError> {
        retry_with_backoff(
            || self.send(request.clone()),
            attempts.saturating_sub(1),
            RETRY_BASE_DELAY,
        )
        .await
    }
}

#[async_trait]
impl Transport for ApiClient {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        ApiClient::send(self, request).await
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 * 100.0 / total as f64).round() as u64).min(100) as u8
}
