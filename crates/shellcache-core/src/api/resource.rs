//! Reactive API resource.
//!
//! A `Resource` owns one logical fetch. State (data, loading, error, last
//! fetch time) is published on a `watch` channel. Starting a new fetch
//! aborts the previous one, and a superseded fetch never touches state: each
//! fetch takes a generation number and can only commit while that number is
//! still current.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{AbortHandle, Abortable};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::client::{ApiRequest, Transport};
use super::ApiError;
use crate::clock::{system_clock, SharedClock};
use crate::reporting::{spawn_reported, tracing_reporter, SharedReporter};

/// Data older than this is reported stale. Staleness never triggers a fetch.
pub const STALE_AFTER_MINUTES: i64 = 5;

/// Default base delay between retries; attempt `n` waits `n` times this.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

pub type Transform<T> = Arc<dyn Fn(Value) -> Result<T, ApiError> + Send + Sync>;
pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ApiError) + Send + Sync>;

/// Endpoint path, fixed or computed at fetch time. A resolver returning
/// `None` means there is nothing to fetch yet.
#[derive(Clone)]
pub enum Endpoint {
    Literal(String),
    Resolver(Arc<dyn Fn() -> Option<String> + Send + Sync>),
}

impl Endpoint {
    pub fn resolver(f: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        Endpoint::Resolver(Arc::new(f))
    }

    pub fn resolve(&self) -> Option<String> {
        match self {
            Endpoint::Literal(path) if path.is_empty() => None,
            Endpoint::Literal(path) => Some(path.clone()),
            Endpoint::Resolver(f) => f(),
        }
    }
}

impl From<&str> for Endpoint {
    fn from(path: &str) -> Self {
        Endpoint::Literal(path.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(path: String) -> Self {
        Endpoint::Literal(path)
    }
}

pub struct ResourceOptions<T> {
    pub method: Method,
    /// Fetch on `start` and whenever dependencies change
    pub immediate: bool,
    pub retry: u32,
    pub retry_delay: Duration,
    pub transform: Option<Transform<T>>,
    pub on_success: Option<SuccessCallback<T>>,
    pub on_error: Option<ErrorCallback>,
    pub clock: SharedClock,
    pub reporter: SharedReporter,
}

impl<T> Clone for ResourceOptions<T> {
    fn clone(&self) -> Self {
        Self {
            method: self.method.clone(),
            immediate: self.immediate,
            retry: self.retry,
            retry_delay: self.retry_delay,
            transform: self.transform.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            clock: self.clock.clone(),
            reporter: self.reporter.clone(),
        }
    }
}

impl<T> Default for ResourceOptions<T> {
    fn default() -> Self {
        Self {
            method: Method::GET,
            immediate: true,
            retry: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
            transform: None,
            on_success: None,
            on_error: None,
            clock: system_clock(),
            reporter: tracing_reporter(),
        }
    }
}

impl<T> ResourceOptions<T> {
    pub fn get() -> Self {
        Self::default()
    }

    /// Mutating presets never fetch on their own.
    pub fn post() -> Self {
        Self::mutating(Method::POST)
    }

    pub fn put() -> Self {
        Self::mutating(Method::PUT)
    }

    pub fn delete() -> Self {
        Self::mutating(Method::DELETE)
    }

    fn mutating(method: Method) -> Self {
        Self {
            method,
            immediate: false,
            ..Self::default()
        }
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn transform(mut self, f: impl Fn(Value) -> Result<T, ApiError> + Send + Sync + 'static) -> Self {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn on_success(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ApiError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = reporter;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<ApiError>,
    /// Time of the last successful fetch
    pub last_fetch: Option<DateTime<Utc>>,
}

impl<T> Default for ResourceState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            last_fetch: None,
        }
    }
}

struct Current {
    generation: u64,
    abort: Option<AbortHandle>,
}

struct Inner<T> {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    options: ResourceOptions<T>,
    state: watch::Sender<ResourceState<T>>,
    current: Mutex<Current>,
    dependencies: Mutex<Vec<Value>>,
}

/// Clone is cheap and shares state.
pub struct Resource<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Resource<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<Endpoint>, options: ResourceOptions<T>) -> Self {
        let (state, _) = watch::channel(ResourceState::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                endpoint: endpoint.into(),
                options,
                state,
                current: Mutex::new(Current {
                    generation: 0,
                    abort: None,
                }),
                dependencies: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceState<T>> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> ResourceState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn data(&self) -> Option<T> {
        self.inner.state.borrow().data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    pub fn is_stale(&self) -> bool {
        match self.inner.state.borrow().last_fetch {
            Some(last) => self.inner.options.clock.now() - last > chrono::Duration::minutes(STALE_AFTER_MINUTES),
            None => false,
        }
    }

    fn current(&self) -> std::sync::MutexGuard<'_, Current> {
        self.inner.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Supersede whatever is in flight and claim a new generation.
    fn begin(&self, abort: AbortHandle) -> u64 {
        let mut current = self.current();
        if let Some(previous) = current.abort.replace(abort) {
            previous.abort();
        }
        current.generation += 1;
        self.inner.state.send_modify(|s| {
            s.loading = true;
            s.error = None;
        });
        current.generation
    }

    /// Apply `f` only if `generation` is still the latest fetch.
    fn commit(&self, generation: u64, f: impl FnOnce(&mut ResourceState<T>)) -> bool {
        let mut current = self.current();
        if current.generation != generation {
            return false;
        }
        current.abort = None;
        self.inner.state.send_modify(f);
        true
    }

    /// Spawn the initial fetch when the resource is immediate.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        self.inner.options.immediate.then(|| self.spawn_fetch())
    }

    fn spawn_fetch(&self) -> JoinHandle<()> {
        let resource = self.clone();
        spawn_reported(self.inner.options.reporter.clone(), "resource fetch", async move {
            match resource.fetch().await {
                Ok(_) | Err(ApiError::Cancelled) => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    pub async fn fetch(&self) -> Result<Option<T>, ApiError> {
        self.refetch(None).await
    }

    /// Fetch with an optional request body, cancelling any fetch in flight.
    /// `Ok(None)` when the endpoint has nothing to fetch. A fetch superseded
    /// by a newer one resolves to `ApiError::Cancelled` and changes nothing.
    pub async fn refetch(&self, body: Option<Value>) -> Result<Option<T>, ApiError> {
        let Some(path) = self.inner.endpoint.resolve() else {
            return Ok(None);
        };

        let (abort, registration) = AbortHandle::new_pair();
        let generation = self.begin(abort);

        match Abortable::new(self.run(generation, path, body), registration).await {
            Ok(result) => result.map(Some),
            Err(_) => Err(ApiError::Cancelled),
        }
    }

    async fn run(&self, generation: u64, path: String, body: Option<Value>) -> Result<T, ApiError> {
        let options = &self.inner.options;
        let mut attempt = 0;

        loop {
            let mut request = ApiRequest::new(options.method.clone(), path.clone());
            request.body = body.clone();

            let outcome = match self.inner.transport.send(request).await {
                Ok(response) => match &options.transform {
                    Some(transform) => transform(response.data),
                    None => serde_json::from_value(response.data)
                        .map_err(|e| ApiError::InvalidResponse(e.to_string())),
                },
                Err(e) => Err(e),
            };

            match outcome {
                Ok(data) => {
                    let now = options.clock.now();
                    let committed = self.commit(generation, |s| {
                        s.data = Some(data.clone());
                        s.loading = false;
                        s.error = None;
                        s.last_fetch = Some(now);
                    });
                    if !committed {
                        return Err(ApiError::Cancelled);
                    }
                    if let Some(on_success) = &options.on_success {
                        on_success(&data);
                    }
                    return Ok(data);
                }
                Err(ApiError::Cancelled) => return Err(ApiError::Cancelled),
                Err(e) if e.is_retryable() && attempt < options.retry => {
                    attempt += 1;
                    let delay = options.retry_delay.saturating_mul(attempt);
                    warn!(path = %path, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let committed = self.commit(generation, |s| {
                        s.loading = false;
                        s.error = Some(e.clone());
                    });
                    if !committed {
                        return Err(ApiError::Cancelled);
                    }
                    if let Some(on_error) = &options.on_error {
                        on_error(&e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Overwrite local data without a request (optimistic update).
    pub fn mutate(&self, data: T) {
        self.inner.state.send_modify(|s| s.data = Some(data));
    }

    /// Cancel anything in flight and return to the initial state.
    pub fn reset(&self) {
        let mut current = self.current();
        if let Some(previous) = current.abort.take() {
            previous.abort();
        }
        current.generation += 1;
        self.inner.state.send_replace(ResourceState::default());
        debug!("Resource reset");
    }

    /// Record the values this resource depends on. When they differ from
    /// the last recorded ones and the resource is immediate, a background
    /// fetch is started and its handle returned.
    pub fn set_dependencies(&self, dependencies: Vec<Value>) -> Option<JoinHandle<()>> {
        {
            let mut current = self.inner.dependencies.lock().unwrap_or_else(|e| e.into_inner());
            if *current == dependencies {
                return None;
            }
            *current = dependencies;
        }
        self.start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::ApiResponse;
    use crate::clock::{Clock, ManualClock};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;
    use tokio::time::Instant;

    fn ok(data: Value) -> Result<ApiResponse, ApiError> {
        Ok(ApiResponse {
            status: 200,
            headers: BTreeMap::new(),
            data,
            duration: Duration::ZERO,
        })
    }

    /// Plays back scripted outcomes, then repeats the last one.
    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<ApiResponse, ApiError>>>,
        calls: AtomicU32,
        call_times: Mutex<Vec<Instant>>,
        requests: Mutex<Vec<ApiRequest>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<ApiResponse, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
                call_times: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().unwrap().push(Instant::now());
            self.requests.lock().unwrap().push(request);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                outcomes.pop_front().unwrap()
            } else {
                outcomes.front().cloned().unwrap()
            }
        }
    }

    /// First call blocks until released; later calls answer immediately.
    struct GatedTransport {
        gate: Notify,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                self.gate.notified().await;
                return ok(json!(format!("stale {}", request.path)));
            }
            ok(json!(format!("fresh {}", request.path)))
        }
    }

    #[tokio::test]
    async fn test_fetch_updates_state() {
        let transport = ScriptedTransport::new(vec![ok(json!({"users": 3}))]);
        let clock = Arc::new(ManualClock::default());
        let resource: Resource<Value> =
            Resource::new(transport.clone(), "/stats", ResourceOptions::get().clock(clock.clone()));

        let data = resource.fetch().await.unwrap();
        assert_eq!(data, Some(json!({"users": 3})));

        let state = resource.snapshot();
        assert!(!state.loading);
        assert_eq!(state.error, None);
        assert_eq!(state.last_fetch, Some(clock.now()));
        assert_eq!(transport.requests.lock().unwrap()[0].method, Method::GET);
    }

    #[tokio::test]
    async fn test_transform_and_callbacks() {
        let transport = ScriptedTransport::new(vec![ok(json!({"items": [1, 2, 3]}))]);
        let seen = Arc::new(Mutex::new(None));
        let options = ResourceOptions::get()
            .transform(|v| Ok(v["items"].as_array().map(|a| a.len()).unwrap_or(0)))
            .on_success({
                let seen = seen.clone();
                move |n: &usize| *seen.lock().unwrap() = Some(*n)
            });
        let resource = Resource::new(transport, "/items", options);

        assert_eq!(resource.fetch().await.unwrap(), Some(3));
        assert_eq!(*seen.lock().unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_superseded_fetch_never_mutates_state() {
        let transport = Arc::new(GatedTransport {
            gate: Notify::new(),
            calls: AtomicU32::new(0),
        });
        let resource: Resource<String> = Resource::new(transport.clone(), "/users", ResourceOptions::get());

        let first = tokio::spawn({
            let resource = resource.clone();
            async move { resource.fetch().await }
        });
        while transport.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = resource.fetch().await.unwrap();
        assert_eq!(second.as_deref(), Some("fresh /users"));

        transport.gate.notify_one();
        assert_eq!(first.await.unwrap(), Err(ApiError::Cancelled));
        assert_eq!(resource.data().as_deref(), Some("fresh /users"));
        assert!(!resource.is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_and_linear_backoff() {
        let transport = ScriptedTransport::new(vec![Err(ApiError::Network("down".into()))]);
        let errors = Arc::new(AtomicU32::new(0));
        let options = ResourceOptions::get()
            .retry(3)
            .retry_delay(Duration::from_millis(100))
            .on_error({
                let errors = errors.clone();
                move |_| {
                    errors.fetch_add(1, Ordering::SeqCst);
                }
            });
        let resource: Resource<Value> = Resource::new(transport.clone(), "/flaky", options);

        let err = resource.fetch().await.unwrap_err();
        assert!(matches!(err, ApiError::Network(_)));
        assert_eq!(transport.calls(), 4);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(resource.snapshot().error, Some(err));

        let times = transport.call_times.lock().unwrap().clone();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let transport = ScriptedTransport::new(vec![
            Err(ApiError::from_status(503, None, "")),
            ok(json!("up")),
        ]);
        let resource: Resource<String> = Resource::new(transport.clone(), "/status", ResourceOptions::get().retry(2));

        assert_eq!(resource.fetch().await.unwrap().as_deref(), Some("up"));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_surfaces_immediately() {
        let transport = ScriptedTransport::new(vec![Err(ApiError::from_status(404, None, ""))]);
        let resource: Resource<Value> = Resource::new(transport.clone(), "/gone", ResourceOptions::get().retry(5));

        assert!(matches!(resource.fetch().await, Err(ApiError::NotFound(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_invalid_response() {
        let transport = ScriptedTransport::new(vec![ok(json!("not a number"))]);
        let resource: Resource<u32> = Resource::new(transport, "/count", ResourceOptions::get());
        assert!(matches!(resource.fetch().await, Err(ApiError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_staleness_is_advisory() {
        let transport = ScriptedTransport::new(vec![ok(json!(1))]);
        let clock = Arc::new(ManualClock::default());
        let resource: Resource<u32> = Resource::new(transport.clone(), "/n", ResourceOptions::get().clock(clock.clone()));

        assert!(!resource.is_stale());
        resource.fetch().await.unwrap();
        clock.advance(chrono::Duration::minutes(5));
        assert!(!resource.is_stale());
        clock.advance(chrono::Duration::seconds(1));
        assert!(resource.is_stale());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_mutate_and_reset() {
        let transport = ScriptedTransport::new(vec![ok(json!([1]))]);
        let resource: Resource<Vec<u32>> = Resource::new(transport, "/ids", ResourceOptions::get());
        resource.fetch().await.unwrap();

        resource.mutate(vec![1, 2]);
        assert_eq!(resource.data(), Some(vec![1, 2]));

        resource.reset();
        assert_eq!(resource.snapshot(), ResourceState::default());
    }

    #[tokio::test]
    async fn test_resolver_without_endpoint_skips() {
        let transport = ScriptedTransport::new(vec![ok(json!(null))]);
        let resource: Resource<Value> =
            Resource::new(transport.clone(), Endpoint::resolver(|| None), ResourceOptions::get());
        assert_eq!(resource.fetch().await.unwrap(), None);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_refetch_sends_body_with_preset_method() {
        let transport = ScriptedTransport::new(vec![ok(json!({"id": 9}))]);
        let resource: Resource<Value> = Resource::new(transport.clone(), "/users", ResourceOptions::post());

        assert!(resource.start().is_none());
        resource.refetch(Some(json!({"name": "Ada"}))).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].method, Method::POST);
        assert_eq!(requests[0].body, Some(json!({"name": "Ada"})));
    }

    #[tokio::test]
    async fn test_dependency_change_refetches() {
        let transport = ScriptedTransport::new(vec![ok(json!("v"))]);
        let resource: Resource<String> = Resource::new(transport.clone(), "/v", ResourceOptions::get());

        resource.set_dependencies(vec![json!(1)]).unwrap().await.unwrap();
        assert!(resource.set_dependencies(vec![json!(1)]).is_none());
        resource.set_dependencies(vec![json!(2)]).unwrap().await.unwrap();

        assert_eq!(transport.calls(), 2);
        let mut rx = resource.subscribe();
        assert_eq!(rx.borrow_and_update().data.as_deref(), Some("v"));
    }
}
