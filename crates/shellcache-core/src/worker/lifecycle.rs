//! Install / activate / fetch / message lifecycle of the cache worker.
//!
//! Lifecycle:
//! `Parsed -> Installing -> Installed (waiting) -> Activating -> Activated`,
//! or `Installing -> Redundant` when any manifest asset cannot be fetched.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::route::{route, FetchRequest, Route, SHELL_PATH};
use super::{CacheStorage, Network, WorkerError, WorkerResponse};
use crate::util::TaskQueue;

/// Assets pre-populated into every generation at install time.
pub const SHELL_MANIFEST: [&str; 4] = [
    "/",
    "/static/js/bundle.js",
    "/static/css/main.css",
    "/manifest.json",
];

/// Generation name the shipped worker installs.
pub const DEFAULT_GENERATION: &str = "admin-panel-v1";

/// Concurrent manifest downloads during install.
const INSTALL_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    /// Installed and waiting to activate
    Installed,
    Activating,
    Activated,
    Redundant,
}

/// Messages a page may post to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SkipWaiting,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(FetchRequest),
    Message(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    State(WorkerState),
    /// `None` when the worker left the request to default handling
    Response(Option<WorkerResponse>),
}

pub type ClientId = u64;

/// Open pages and the generation that controls each.
#[derive(Debug, Default)]
pub struct Clients {
    controllers: Mutex<BTreeMap<ClientId, Option<String>>>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ClientId) {
        self.lock().entry(id).or_insert(None);
    }

    pub fn unregister(&self, id: ClientId) {
        self.lock().remove(&id);
    }

    pub fn controller(&self, id: ClientId) -> Option<String> {
        self.lock().get(&id).cloned().flatten()
    }

    /// Take control of every registered page. Returns how many changed hands.
    pub fn claim(&self, generation: &str) -> usize {
        let mut claimed = 0;
        for controller in self.lock().values_mut() {
            if controller.as_deref() != Some(generation) {
                *controller = Some(generation.to_string());
                claimed += 1;
            }
        }
        claimed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ClientId, Option<String>>> {
        self.controllers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct CacheWorker {
    generation: String,
    origin: Url,
    manifest: Vec<String>,
    storage: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<Clients>,
    state: Mutex<WorkerState>,
    skip_waiting: Mutex<bool>,
}

impl CacheWorker {
    pub fn new(
        generation: impl Into<String>,
        origin: Url,
        storage: Arc<CacheStorage>,
        network: Arc<dyn Network>,
        clients: Arc<Clients>,
    ) -> Self {
        Self {
            generation: generation.into(),
            origin,
            manifest: SHELL_MANIFEST.iter().map(|s| s.to_string()).collect(),
            storage,
            network,
            clients,
            state: Mutex::new(WorkerState::Parsed),
            skip_waiting: Mutex::new(false),
        }
    }

    /// A worker for a generation stored by an earlier run. It comes back
    /// `Installed` (waiting) while older generations remain, `Activated` when
    /// it is the only one, and `Parsed` when it is not stored at all.
    pub fn resume(
        generation: impl Into<String>,
        origin: Url,
        storage: Arc<CacheStorage>,
        network: Arc<dyn Network>,
        clients: Arc<Clients>,
    ) -> Result<Self, WorkerError> {
        let worker = Self::new(generation, origin, storage, network, clients);
        let stored = worker.storage.keys()?;
        if stored.iter().any(|name| *name == worker.generation) {
            let state = if stored.len() > 1 {
                WorkerState::Installed
            } else {
                WorkerState::Activated
            };
            worker.set_state(state);
        }
        Ok(worker)
    }

    pub fn generation(&self) -> &str {
        &self.generation
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn manifest(&self) -> &[String] {
        &self.manifest
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: WorkerState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug!(from = ?*current, to = ?state, generation = %self.generation, "Worker state change");
        *current = state;
    }

    fn expect_state(&self, expected: WorkerState, operation: &'static str) -> Result<(), WorkerError> {
        let state = self.state();
        if state != expected {
            return Err(WorkerError::InvalidState { state, operation });
        }
        Ok(())
    }

    fn skip_waiting_requested(&self) -> bool {
        *self.skip_waiting.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, WorkerError> {
        match event {
            WorkerEvent::Install => {
                self.install().await?;
                Ok(EventOutcome::State(self.state()))
            }
            WorkerEvent::Activate => {
                self.activate()?;
                Ok(EventOutcome::State(self.state()))
            }
            WorkerEvent::Fetch(request) => Ok(EventOutcome::Response(self.handle_fetch(&request).await?)),
            WorkerEvent::Message(message) => {
                self.handle_message(&message)?;
                Ok(EventOutcome::State(self.state()))
            }
        }
    }

    // ===== Install =====

    /// Fetch every manifest asset and store them as this generation. Any
    /// failure leaves nothing stored under the generation name and marks
    /// the worker redundant.
    pub async fn install(&self) -> Result<(), WorkerError> {
        self.expect_state(WorkerState::Parsed, "install")?;
        self.set_state(WorkerState::Installing);
        info!(generation = %self.generation, assets = self.manifest.len(), "Installing");

        let stored = match self.populate().await {
            Ok(entries) => self.storage.put_generation(&self.generation, entries),
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            warn!(generation = %self.generation, error = %e, "Install failed");
            self.set_state(WorkerState::Redundant);
            return Err(e);
        }
        self.set_state(WorkerState::Installed);

        if self.skip_waiting_requested() {
            self.activate()?;
        }
        Ok(())
    }

    async fn populate(&self) -> Result<BTreeMap<String, WorkerResponse>, WorkerError> {
        let queue = TaskQueue::new(INSTALL_CONCURRENCY);
        let fetches = self.manifest.iter().map(|path| {
            let queue = queue.clone();
            async move {
                let url = self.origin.join(path)?;
                let response = queue.add(self.network.fetch("GET", &url)).await?;
                if !response.is_success() {
                    return Err(WorkerError::BadStatus {
                        url: url.to_string(),
                        status: response.status,
                    });
                }
                Ok((path.clone(), response))
            }
        });
        Ok(try_join_all(fetches).await?.into_iter().collect())
    }

    // ===== Activate =====

    /// Purge every other generation and take control of open pages.
    /// Returns the names of the purged generations.
    pub fn activate(&self) -> Result<Vec<String>, WorkerError> {
        self.expect_state(WorkerState::Installed, "activate")?;
        self.set_state(WorkerState::Activating);

        let mut purged = Vec::new();
        for name in self.storage.keys()? {
            if name != self.generation && self.storage.delete(&name)? {
                purged.push(name);
            }
        }

        let claimed = self.clients.claim(&self.generation);
        self.set_state(WorkerState::Activated);
        info!(generation = %self.generation, purged = purged.len(), claimed, "Activated");
        Ok(purged)
    }

    // ===== Message =====

    pub fn handle_message(&self, message: &Value) -> Result<(), WorkerError> {
        let message = match serde_json::from_value::<WorkerMessage>(message.clone()) {
            Ok(message) => message,
            Err(_) => {
                debug!(message = %message, "Ignoring unknown worker message");
                return Ok(());
            }
        };

        match message {
            WorkerMessage::SkipWaiting => {
                *self.skip_waiting.lock().unwrap_or_else(|e| e.into_inner()) = true;
                if self.state() == WorkerState::Installed {
                    self.activate()?;
                }
            }
        }
        Ok(())
    }

    // ===== Fetch =====

    /// Answer an intercepted request. `Ok(None)` means the worker did not
    /// intercept it (cross-origin, or the worker is not active yet).
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<Option<WorkerResponse>, WorkerError> {
        if self.state() != WorkerState::Activated {
            return Ok(None);
        }

        let response = match route(request, &self.origin) {
            Route::Ignore => return Ok(None),
            Route::RedirectToRoot => {
                debug!(url = %request.url, "Redirecting parameterized navigation to shell");
                WorkerResponse::redirect(SHELL_PATH)
            }
            Route::ServeShell => match self.storage.match_in(&self.generation, SHELL_PATH)? {
                Some(cached) => cached,
                None => self.network.fetch("GET", &self.origin.join(SHELL_PATH)?).await?,
            },
            Route::CacheFirst { key } => match self.storage.match_in(&self.generation, &key)? {
                Some(cached) => {
                    debug!(key = %key, "Cache hit");
                    cached
                }
                None => self.network.fetch(&request.method, &request.url).await?,
            },
            Route::Passthrough => self.network.fetch(&request.method, &request.url).await?,
        };
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves `body of <path>` for every path except those listed as failing.
    #[derive(Default)]
    struct FakeNetwork {
        failing: Vec<String>,
        not_found: Vec<String>,
        offline: bool,
        calls: Mutex<Vec<String>>,
        methods: Mutex<Vec<String>>,
        count: AtomicUsize,
    }

    impl FakeNetwork {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn methods(&self) -> Vec<String> {
            self.methods.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Network for FakeNetwork {
        async fn fetch(&self, method: &str, url: &Url) -> Result<WorkerResponse, WorkerError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            let key = super::super::route::cache_key(url);
            self.calls.lock().unwrap().push(key.clone());
            self.methods.lock().unwrap().push(method.to_string());
            if self.offline || self.failing.contains(&key) {
                return Err(WorkerError::Network {
                    url: url.to_string(),
                    message: "connection refused".to_string(),
                });
            }
            if self.not_found.contains(&key) {
                return Ok(WorkerResponse::new(404, "missing"));
            }
            Ok(WorkerResponse::new(200, format!("network {}", key)))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        storage: Arc<CacheStorage>,
        clients: Arc<Clients>,
        origin: Url,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let storage = Arc::new(CacheStorage::new(dir.path()).unwrap());
            Self {
                _dir: dir,
                storage,
                clients: Arc::new(Clients::new()),
                origin: Url::parse("https://admin.example.com").unwrap(),
            }
        }

        fn worker(&self, generation: &str, network: Arc<FakeNetwork>) -> CacheWorker {
            CacheWorker::new(
                generation,
                self.origin.clone(),
                self.storage.clone(),
                network,
                self.clients.clone(),
            )
        }

        fn url(&self, path: &str) -> Url {
            self.origin.join(path).unwrap()
        }
    }

    async fn active_worker(harness: &Harness, network: Arc<FakeNetwork>) -> CacheWorker {
        let worker = harness.worker(DEFAULT_GENERATION, network);
        worker.install().await.unwrap();
        worker.activate().unwrap();
        worker
    }

    #[tokio::test]
    async fn test_install_populates_manifest() {
        let harness = Harness::new();
        let network = Arc::new(FakeNetwork::default());
        let worker = harness.worker(DEFAULT_GENERATION, network.clone());

        worker.install().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Installed);

        let generation = harness.storage.open(DEFAULT_GENERATION).unwrap().unwrap();
        assert_eq!(generation.len(), SHELL_MANIFEST.len());
        for path in SHELL_MANIFEST {
            assert_eq!(generation.get(path).unwrap().body, format!("network {}", path).into_bytes());
        }
    }

    #[tokio::test]
    async fn test_install_is_atomic() {
        let harness = Harness::new();
        let network = Arc::new(FakeNetwork {
            failing: vec!["/static/css/main.css".to_string()],
            ..Default::default()
        });
        let worker = harness.worker("admin-panel-v2", network);

        assert!(worker.install().await.is_err());
        assert_eq!(worker.state(), WorkerState::Redundant);
        assert!(!harness.storage.has("admin-panel-v2").unwrap());
        assert!(harness.storage.keys().unwrap().is_empty());

        // A redundant worker cannot advance
        assert!(matches!(worker.activate(), Err(WorkerError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_install_rejects_error_status() {
        let harness = Harness::new();
        let network = Arc::new(FakeNetwork {
            not_found: vec!["/manifest.json".to_string()],
            ..Default::default()
        });
        let worker = harness.worker(DEFAULT_GENERATION, network);

        let err = worker.install().await.unwrap_err();
        assert!(matches!(err, WorkerError::BadStatus { status: 404, .. }));
        assert!(!harness.storage.has(DEFAULT_GENERATION).unwrap());
    }

    #[tokio::test]
    async fn test_activate_purges_old_generations() {
        let harness = Harness::new();
        harness.storage.put_generation("admin-panel-v0", BTreeMap::new()).unwrap();
        harness.storage.put_generation("legacy", BTreeMap::new()).unwrap();

        let worker = harness.worker(DEFAULT_GENERATION, Arc::new(FakeNetwork::default()));
        worker.install().await.unwrap();
        let purged = worker.activate().unwrap();

        assert_eq!(purged, vec!["admin-panel-v0", "legacy"]);
        assert_eq!(harness.storage.keys().unwrap(), vec![DEFAULT_GENERATION]);
        assert_eq!(worker.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_activate_claims_open_pages() {
        let harness = Harness::new();
        harness.clients.register(1);
        harness.clients.register(2);

        let worker = active_worker(&harness, Arc::new(FakeNetwork::default())).await;
        assert_eq!(harness.clients.controller(1).as_deref(), Some(worker.generation()));
        assert_eq!(harness.clients.controller(2).as_deref(), Some(worker.generation()));
    }

    #[tokio::test]
    async fn test_skip_waiting_before_install_activates_immediately() {
        let harness = Harness::new();
        let worker = harness.worker(DEFAULT_GENERATION, Arc::new(FakeNetwork::default()));

        worker.handle_message(&json!({"type": "SKIP_WAITING"})).unwrap();
        assert_eq!(worker.state(), WorkerState::Parsed);

        worker.install().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_skip_waiting_while_waiting() {
        let harness = Harness::new();
        let worker = harness.worker(DEFAULT_GENERATION, Arc::new(FakeNetwork::default()));
        worker.install().await.unwrap();

        let outcome = worker
            .dispatch(WorkerEvent::Message(json!({"type": "SKIP_WAITING"})))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::State(WorkerState::Activated));
    }

    #[tokio::test]
    async fn test_unknown_message_ignored() {
        let harness = Harness::new();
        let worker = harness.worker(DEFAULT_GENERATION, Arc::new(FakeNetwork::default()));
        worker.install().await.unwrap();

        worker.handle_message(&json!({"type": "PING"})).unwrap();
        worker.handle_message(&json!("SKIP_WAITING")).unwrap();
        assert_eq!(worker.state(), WorkerState::Installed);
    }

    #[tokio::test]
    async fn test_navigation_with_query_redirects() {
        let harness = Harness::new();
        let network = Arc::new(FakeNetwork::default());
        let worker = active_worker(&harness, network.clone()).await;
        let before = network.count.load(Ordering::SeqCst);

        let response = worker
            .handle_fetch(&FetchRequest::navigate(harness.url("/x?y=1")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 302);
        assert_eq!(response.header("location"), Some("/"));
        assert_eq!(network.count.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_subresource_with_query_serves_cached_shell() {
        let harness = Harness::new();
        let network = Arc::new(FakeNetwork::default());
        let worker = active_worker(&harness, network.clone()).await;

        let request = FetchRequest::subresource(harness.url("/x?y=1"), super::super::Destination::Empty);
        let response = worker.handle_fetch(&request).await.unwrap().unwrap();
        assert_eq!(response.body, b"network /");
        // Served from the generation stored at install, not refetched
        assert_eq!(network.calls().iter().filter(|c| c.as_str() == "/").count(), 1);
    }

    #[tokio::test]
    async fn test_subresource_with_query_falls_back_to_network_shell() {
        let harness = Harness::new();
        let network = Arc::new(FakeNetwork::default());
        let worker = active_worker(&harness, network.clone()).await;

        // Replace the generation with one lacking the shell document
        harness.storage.put_generation(DEFAULT_GENERATION, BTreeMap::new()).unwrap();

        let request = FetchRequest::subresource(harness.url("/x?y=1"), super::super::Destination::Empty);
        let response = worker.handle_fetch(&request).await.unwrap().unwrap();
        assert_eq!(response.body, b"network /");
        assert_eq!(network.calls().last().map(String::as_str), Some("/"));
    }

    #[tokio::test]
    async fn test_plain_request_cache_hit_and_miss() {
        let harness = Harness::new();
        let network = Arc::new(FakeNetwork::default());
        let worker = active_worker(&harness, network.clone()).await;
        let cached = harness.storage.match_in(DEFAULT_GENERATION, "/static/js/bundle.js").unwrap();

        let hit = worker
            .handle_fetch(&FetchRequest::subresource(
                harness.url("/static/js/bundle.js"),
                super::super::Destination::Script,
            ))
            .await
            .unwrap();
        assert_eq!(hit, cached);

        let before = network.count.load(Ordering::SeqCst);
        let miss = worker
            .handle_fetch(&FetchRequest::subresource(
                harness.url("/logo.png"),
                super::super::Destination::Image,
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(miss.body, b"network /logo.png");
        assert_eq!(network.count.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test]
    async fn test_network_failure_propagates() {
        let harness = Harness::new();
        let worker = active_worker(&harness, Arc::new(FakeNetwork::default())).await;
        let offline = Arc::new(FakeNetwork {
            offline: true,
            ..Default::default()
        });
        let worker = CacheWorker::resume(
            worker.generation(),
            harness.origin.clone(),
            harness.storage.clone(),
            offline,
            harness.clients.clone(),
        )
        .unwrap();
        assert_eq!(worker.state(), WorkerState::Activated);

        let request = FetchRequest::subresource(harness.url("/uncached.js"), super::super::Destination::Script);
        assert!(matches!(worker.handle_fetch(&request).await, Err(WorkerError::Network { .. })));

        // Cached entries still work offline
        let shell = worker.handle_fetch(&FetchRequest::navigate(harness.url("/"))).await.unwrap();
        assert!(shell.is_some());
    }

    #[tokio::test]
    async fn test_resume_waits_while_old_generations_remain() {
        let harness = Harness::new();
        harness.storage.put_generation("admin-panel-v0", BTreeMap::new()).unwrap();
        let worker = harness.worker("admin-panel-v2", Arc::new(FakeNetwork::default()));
        worker.install().await.unwrap();

        let resumed = CacheWorker::resume(
            "admin-panel-v2",
            harness.origin.clone(),
            harness.storage.clone(),
            Arc::new(FakeNetwork::default()),
            harness.clients.clone(),
        )
        .unwrap();
        assert_eq!(resumed.state(), WorkerState::Installed);
        assert_eq!(resumed.activate().unwrap(), vec!["admin-panel-v0".to_string()]);

        let missing = CacheWorker::resume(
            "admin-panel-v3",
            harness.origin.clone(),
            harness.storage.clone(),
            Arc::new(FakeNetwork::default()),
            harness.clients.clone(),
        )
        .unwrap();
        assert_eq!(missing.state(), WorkerState::Parsed);
    }

    #[tokio::test]
    async fn test_cross_origin_and_inactive_not_intercepted() {
        let harness = Harness::new();
        let worker = harness.worker(DEFAULT_GENERATION, Arc::new(FakeNetwork::default()));
        let local = FetchRequest::navigate(harness.url("/"));
        assert_eq!(worker.handle_fetch(&local).await.unwrap(), None);

        worker.install().await.unwrap();
        worker.activate().unwrap();
        let foreign = FetchRequest::navigate(Url::parse("https://elsewhere.example.org/?a=1").unwrap());
        assert_eq!(worker.handle_fetch(&foreign).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_passthrough_keeps_request_method() {
        let harness = Harness::new();
        let network = Arc::new(FakeNetwork::default());
        let worker = active_worker(&harness, network.clone()).await;
        assert!(network.methods().iter().all(|m| m == "GET"));

        let request = FetchRequest::subresource(harness.url("/api/users/7"), super::super::Destination::Empty)
            .with_method("delete");
        let response = worker.handle_fetch(&request).await.unwrap().unwrap();
        assert_eq!(response.body, b"network /api/users/7");
        assert_eq!(network.methods().last().map(String::as_str), Some("DELETE"));
    }

    #[tokio::test]
    async fn test_failed_store_marks_worker_redundant() {
        let harness = Harness::new();
        // A directory in the way of the temp file makes the write fail
        std::fs::create_dir(harness.storage.dir().join(format!("{}.json.tmp", DEFAULT_GENERATION))).unwrap();
        let worker = harness.worker(DEFAULT_GENERATION, Arc::new(FakeNetwork::default()));

        assert!(matches!(worker.install().await, Err(WorkerError::Io(_))));
        assert_eq!(worker.state(), WorkerState::Redundant);
        assert!(!harness.storage.has(DEFAULT_GENERATION).unwrap());
    }
}
