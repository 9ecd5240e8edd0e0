//! Offline cache worker.
//!
//! Runs apart from the billing code and talks to it only through fetch
//! interception and [`WorkerMessage`]s. Exactly one cache generation is
//! current; `activate` deletes every other one.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

pub const DEFAULT_CACHE_NAME: &str = "anand-cycle-bills-v4";
pub const SHELL_PATHS: [&str; 2] = ["/", "/manifest.json"];

const STATIC_EXTENSIONS: [&str; 10] = [
    ".css", ".js", ".png", ".jpg", ".jpeg", ".svg", ".ico", ".woff", ".woff2", ".webp",
];

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network unreachable: {0}")]
    Unreachable(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
#[error("cache storage error: {0}")]
pub struct CacheError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    Cors,
    NoCors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub mode: RequestMode,
    pub destination: Destination,
}

impl FetchRequest {
    pub fn navigate(url: impl Into<String>) -> Self {
        Self { url: url.into(), mode: RequestMode::Navigate, destination: Destination::Document }
    }

    pub fn get(url: impl Into<String>, destination: Destination) -> Self {
        Self { url: url.into(), mode: RequestMode::Cors, destination }
    }

    /// Path plus query, without the origin. Used as the cache key.
    pub fn cache_key(&self) -> &str {
        let rest = match self.url.find("://") {
            Some(i) => &self.url[i + 3..],
            None => return strip_fragment(&self.url),
        };
        match rest.find('/') {
            Some(i) => strip_fragment(&rest[i..]),
            None => "/",
        }
    }

    fn path(&self) -> &str {
        let key = self.cache_key();
        key.split('?').next().unwrap_or(key)
    }

    pub fn is_static_asset(&self) -> bool {
        if matches!(
            self.destination,
            Destination::Style | Destination::Script | Destination::Image | Destination::Font
        ) {
            return true;
        }
        let path = self.path();
        path.contains("/assets/") || STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate || self.destination == Destination::Document
    }
}

fn strip_fragment(s: &str) -> &str {
    s.split('#').next().unwrap_or(s)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body: body.into(),
        }
    }

    /// Last resort for a navigation with neither network nor cached shell.
    pub fn offline_page() -> Self {
        Self::new(200, "text/html", "Offline")
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
    }
}

#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse, NetworkError>;
}

#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn open(&self, generation: &str) -> Result<(), CacheError>;
    async fn put(&self, generation: &str, key: &str, response: CachedResponse) -> Result<(), CacheError>;
    async fn get(&self, generation: &str, key: &str) -> Option<CachedResponse>;
    /// Looks in every generation, in name order.
    async fn match_any(&self, key: &str) -> Option<CachedResponse>;
    async fn generations(&self) -> Vec<String>;
    async fn delete(&self, generation: &str) -> bool;
}

// ==========================================
// Background writes
// ==========================================

/// Spawn-and-forget tasks whose failures are logged, never returned.
/// Finished tasks are reaped on each spawn, so only running ones are held.
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F, E>(&self, what: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        while let Some(done) = tasks.try_join_next() {
            log_join(done);
        }
        tasks.spawn(async move {
            if let Err(err) = task.await {
                warn!(task = what, error = %err, "background task failed");
            }
        });
    }

    /// Tasks spawned and not yet reaped.
    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Waits for everything spawned so far.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        while let Some(done) = tasks.join_next().await {
            log_join(done);
        }
    }
}

fn log_join(done: Result<(), JoinError>) {
    if let Err(err) = done {
        warn!(error = %err, "background task panicked");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ==========================================
// Worker
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    Waiting,
    Activating,
    Activated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
    SkipWaiting,
}

impl WorkerMessage {
    /// Page messages look like `{"type": "SKIP_WAITING"}`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value.get("type").and_then(Value::as_str) {
            Some("SKIP_WAITING") => Some(WorkerMessage::SkipWaiting),
            _ => None,
        }
    }
}

pub struct OfflineWorker<N, C> {
    generation: String,
    origin: String,
    network: Arc<N>,
    cache: Arc<C>,
    background: BackgroundTasks,
    state: Mutex<WorkerState>,
    skip_waiting: AtomicBool,
    controls_clients: AtomicBool,
}

impl<N: Network, C: CacheStorage + 'static> OfflineWorker<N, C> {
    pub fn new(generation: impl Into<String>, origin: impl Into<String>, network: Arc<N>, cache: Arc<C>) -> Self {
        Self {
            generation: generation.into(),
            origin: origin.into().trim_end_matches('/').to_string(),
            network,
            cache,
            background: BackgroundTasks::new(),
            state: Mutex::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            controls_clients: AtomicBool::new(false),
        }
    }

    /// Activate straight after install instead of waiting for old pages to close.
    pub fn skip_waiting_on_install(self, enabled: bool) -> Self {
        self.skip_waiting.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn generation(&self) -> &str {
        &self.generation
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    pub fn controls_clients(&self) -> bool {
        self.controls_clients.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: WorkerState) {
        debug!(generation = %self.generation, ?state, "worker state");
        *lock(&self.state) = state;
    }

    /// Opens the current generation and tries to cache the shell. Shell
    /// failures are logged; install always completes.
    pub async fn install(&self) {
        self.set_state(WorkerState::Installing);
        info!(generation = %self.generation, "installing offline cache");

        match self.cache.open(&self.generation).await {
            Ok(()) => self.precache_shell().await,
            Err(err) => warn!(error = %err, "could not open cache generation"),
        }

        self.set_state(WorkerState::Waiting);
        if self.skip_waiting.load(Ordering::SeqCst) {
            self.activate().await;
        }
    }

    /// All or nothing, like `cache.addAll`.
    async fn precache_shell(&self) {
        let mut fetched = Vec::with_capacity(SHELL_PATHS.len());
        for path in SHELL_PATHS {
            let request = FetchRequest::get(format!("{}{}", self.origin, path), Destination::Empty);
            match self.network.fetch(&request).await {
                Ok(response) if response.is_ok() => fetched.push((path, response)),
                Ok(response) => {
                    warn!(path, status = response.status, "shell precache skipped");
                    return;
                }
                Err(err) => {
                    warn!(path, error = %err, "shell precache skipped");
                    return;
                }
            }
        }
        for (path, response) in fetched {
            if let Err(err) = self.cache.put(&self.generation, path, response).await {
                warn!(path, error = %err, "shell precache write failed");
            }
        }
    }

    /// Deletes every other generation, then takes control of open pages.
    pub async fn activate(&self) {
        self.set_state(WorkerState::Activating);
        for generation in self.cache.generations().await {
            if generation != self.generation {
                info!(%generation, "deleting old cache");
                self.cache.delete(&generation).await;
            }
        }
        self.controls_clients.store(true, Ordering::SeqCst);
        self.set_state(WorkerState::Activated);
    }

    pub async fn on_message(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::SkipWaiting => {
                self.skip_waiting.store(true, Ordering::SeqCst);
                if self.state() == WorkerState::Waiting {
                    self.activate().await;
                }
            }
        }
    }

    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<CachedResponse, NetworkError> {
        if request.is_static_asset() {
            return self.network.fetch(request).await;
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                if response.is_ok() {
                    self.store_in_background(request.cache_key(), &response);
                }
                Ok(response)
            }
            Err(err) if request.is_navigation() => {
                debug!(url = %request.url, error = %err, "navigation offline, serving shell");
                Ok(self.cache.match_any("/").await.unwrap_or_else(CachedResponse::offline_page))
            }
            Err(err) => match self.cache.match_any(request.cache_key()).await {
                Some(cached) => Ok(cached),
                None => Err(err),
            },
        }
    }

    fn store_in_background(&self, key: &str, response: &CachedResponse) {
        let cache = Arc::clone(&self.cache);
        let generation = self.generation.clone();
        let key = key.to_string();
        let response = response.clone();
        self.background
            .spawn("cache write", async move { cache.put(&generation, &key, response).await });
    }

    /// Waits for pending cache writes.
    pub async fn settle(&self) {
        self.background.drain().await;
    }
}

// ==========================================
// Implementations
// ==========================================

#[derive(Default)]
pub struct MemoryCacheStorage {
    generations: Mutex<BTreeMap<String, HashMap<String, CachedResponse>>>,
    fail_puts: AtomicBool,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn entry_count(&self, generation: &str) -> usize {
        lock(&self.generations).get(generation).map_or(0, HashMap::len)
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, generation: &str) -> Result<(), CacheError> {
        lock(&self.generations).entry(generation.to_string()).or_default();
        Ok(())
    }

    async fn put(&self, generation: &str, key: &str, response: CachedResponse) -> Result<(), CacheError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(CacheError("quota exceeded".into()));
        }
        lock(&self.generations)
            .entry(generation.to_string())
            .or_default()
            .insert(key.to_string(), response);
        Ok(())
    }

    async fn get(&self, generation: &str, key: &str) -> Option<CachedResponse> {
        lock(&self.generations).get(generation)?.get(key).cloned()
    }

    async fn match_any(&self, key: &str) -> Option<CachedResponse> {
        lock(&self.generations).values().find_map(|entries| entries.get(key).cloned())
    }

    async fn generations(&self) -> Vec<String> {
        lock(&self.generations).keys().cloned().collect()
    }

    async fn delete(&self, generation: &str) -> bool {
        lock(&self.generations).remove(generation).is_some()
    }
}

pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
        Ok(Self { client: reqwest::Client::builder().timeout(timeout).build()? })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse, NetworkError> {
        let response = self.client.get(&request.url).send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response.bytes().await?.to_vec();
        Ok(CachedResponse { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const ORIGIN: &str = "https://anandcycle.example";

    #[derive(Default)]
    struct FakeNetwork {
        pages: Mutex<HashMap<String, CachedResponse>>,
        offline: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeNetwork {
        fn serving(pages: &[(&str, &str)]) -> Arc<Self> {
            let net = FakeNetwork::default();
            for (path, body) in pages {
                lock(&net.pages).insert(format!("{ORIGIN}{path}"), CachedResponse::new(200, "text/html", *body));
            }
            Arc::new(net)
        }

        fn go_offline(&self) {
            self.offline.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Network for FakeNetwork {
        async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(NetworkError::Unreachable("offline".into()));
            }
            lock(&self.pages)
                .get(&request.url)
                .cloned()
                .ok_or_else(|| NetworkError::Unreachable(format!("no route to {}", request.url)))
        }
    }

    fn worker(
        net: Arc<FakeNetwork>,
        cache: Arc<MemoryCacheStorage>,
    ) -> OfflineWorker<FakeNetwork, MemoryCacheStorage> {
        OfflineWorker::new(DEFAULT_CACHE_NAME, ORIGIN, net, cache).skip_waiting_on_install(true)
    }

    #[test]
    fn request_classification() {
        assert_eq!(FetchRequest::navigate(format!("{ORIGIN}/billing?x=1#top")).cache_key(), "/billing?x=1");
        assert_eq!(FetchRequest::navigate(ORIGIN).cache_key(), "/");
        assert!(FetchRequest::get(format!("{ORIGIN}/assets/index-4f2.css"), Destination::Empty).is_static_asset());
        assert!(FetchRequest::get(format!("{ORIGIN}/logo.png?v=2"), Destination::Empty).is_static_asset());
        assert!(FetchRequest::get(format!("{ORIGIN}/x"), Destination::Font).is_static_asset());
        assert!(!FetchRequest::get(format!("{ORIGIN}/rest/v1/bills"), Destination::Empty).is_static_asset());
        assert!(FetchRequest::get(format!("{ORIGIN}/"), Destination::Document).is_navigation());
    }

    #[test]
    fn skip_waiting_message_parses() {
        assert_eq!(
            WorkerMessage::from_json(&serde_json::json!({"type": "SKIP_WAITING"})),
            Some(WorkerMessage::SkipWaiting)
        );
        assert_eq!(WorkerMessage::from_json(&serde_json::json!({"type": "PING"})), None);
    }

    #[tokio::test]
    async fn install_precaches_shell_and_activates() {
        let net = FakeNetwork::serving(&[("/", "<html>shell</html>"), ("/manifest.json", "{}")]);
        let cache = Arc::new(MemoryCacheStorage::new());
        let sw = worker(net, cache.clone());

        sw.install().await;
        assert_eq!(sw.state(), WorkerState::Activated);
        assert!(sw.controls_clients());
        assert_eq!(cache.entry_count(DEFAULT_CACHE_NAME), 2);
    }

    #[tokio::test]
    async fn shell_failure_does_not_block_install() {
        let net = FakeNetwork::serving(&[("/", "<html>shell</html>")]);
        let cache = Arc::new(MemoryCacheStorage::new());
        let sw = worker(net, cache.clone());

        sw.install().await;
        assert_eq!(sw.state(), WorkerState::Activated);
        assert_eq!(cache.entry_count(DEFAULT_CACHE_NAME), 0);
    }

    #[tokio::test]
    async fn activation_drops_previous_generations() {
        let cache = Arc::new(MemoryCacheStorage::new());
        cache.put("anand-cycle-bills-v3", "/", CachedResponse::new(200, "text/html", "old")).await.unwrap();
        cache.put("anand-cycle-bills-v3", "/billing", CachedResponse::new(200, "text/html", "old")).await.unwrap();

        let net = FakeNetwork::serving(&[("/", "new"), ("/manifest.json", "{}")]);
        let sw = worker(net, cache.clone());
        sw.install().await;

        assert_eq!(cache.generations().await, [DEFAULT_CACHE_NAME]);
        assert!(cache.get("anand-cycle-bills-v3", "/").await.is_none());
        assert!(cache.match_any("/billing").await.is_none());
        assert_eq!(cache.match_any("/").await.unwrap().body, b"new");
    }

    #[tokio::test]
    async fn waiting_worker_activates_on_skip_waiting() {
        let net = FakeNetwork::serving(&[("/", "s"), ("/manifest.json", "{}")]);
        let cache = Arc::new(MemoryCacheStorage::new());
        let sw = OfflineWorker::new("v5", ORIGIN, net, cache);

        sw.install().await;
        assert_eq!(sw.state(), WorkerState::Waiting);
        assert!(!sw.controls_clients());

        sw.on_message(WorkerMessage::SkipWaiting).await;
        assert_eq!(sw.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn navigation_is_network_first_and_cached_in_background() {
        let net = FakeNetwork::serving(&[("/", "s"), ("/manifest.json", "{}"), ("/billing", "billing page")]);
        let cache = Arc::new(MemoryCacheStorage::new());
        let sw = worker(net, cache.clone());
        sw.install().await;

        let response = sw.handle_fetch(&FetchRequest::navigate(format!("{ORIGIN}/billing"))).await.unwrap();
        assert_eq!(response.body, b"billing page");
        sw.settle().await;
        assert_eq!(cache.get(DEFAULT_CACHE_NAME, "/billing").await.unwrap().body, b"billing page");
    }

    #[tokio::test]
    async fn failed_background_write_is_not_fatal() {
        let net = FakeNetwork::serving(&[("/billing", "billing page")]);
        let cache = Arc::new(MemoryCacheStorage::new());
        cache.fail_puts(true);
        let sw = worker(net, cache.clone());

        let response = sw.handle_fetch(&FetchRequest::navigate(format!("{ORIGIN}/billing"))).await.unwrap();
        assert_eq!(response.body, b"billing page");
        sw.settle().await;
        assert_eq!(cache.entry_count(DEFAULT_CACHE_NAME), 0);
    }

    #[tokio::test]
    async fn offline_navigation_serves_shell_then_placeholder() {
        let net = FakeNetwork::serving(&[("/", "<html>shell</html>"), ("/manifest.json", "{}")]);
        let cache = Arc::new(MemoryCacheStorage::new());
        let sw = worker(net.clone(), cache.clone());
        sw.install().await;
        net.go_offline();

        let response = sw.handle_fetch(&FetchRequest::navigate(format!("{ORIGIN}/dashboard"))).await.unwrap();
        assert_eq!(response.body, b"<html>shell</html>");

        cache.delete(DEFAULT_CACHE_NAME).await;
        let response = sw.handle_fetch(&FetchRequest::navigate(format!("{ORIGIN}/dashboard"))).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type(), Some("text/html"));
        assert_eq!(response.body, b"Offline");
    }

    #[tokio::test]
    async fn other_requests_fall_back_to_cache() {
        let net = FakeNetwork::serving(&[("/api/products", "[1]")]);
        let cache = Arc::new(MemoryCacheStorage::new());
        let sw = worker(net.clone(), cache);
        let request = FetchRequest::get(format!("{ORIGIN}/api/products"), Destination::Empty);

        sw.handle_fetch(&request).await.unwrap();
        sw.settle().await;
        net.go_offline();
        assert_eq!(sw.handle_fetch(&request).await.unwrap().body, b"[1]");

        let missing = FetchRequest::get(format!("{ORIGIN}/api/orders"), Destination::Empty);
        assert!(sw.handle_fetch(&missing).await.is_err());
    }

    #[tokio::test]
    async fn static_assets_bypass_cache() {
        let net = FakeNetwork::serving(&[("/assets/app.js", "js")]);
        let cache = Arc::new(MemoryCacheStorage::new());
        let sw = worker(net.clone(), cache.clone());
        let request = FetchRequest::get(format!("{ORIGIN}/assets/app.js"), Destination::Script);

        assert_eq!(sw.handle_fetch(&request).await.unwrap().body, b"js");
        sw.settle().await;
        assert_eq!(cache.entry_count(DEFAULT_CACHE_NAME), 0);

        net.go_offline();
        assert!(sw.handle_fetch(&request).await.is_err());
    }

    #[tokio::test]
    async fn finished_background_tasks_are_not_held() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..500 {
            let done = done.clone();
            tasks.spawn("cache write", async move {
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<(), CacheError>(())
            });
        }
        while done.load(Ordering::SeqCst) < 500 {
            tokio::task::yield_now().await;
        }

        tasks.spawn("cache write", async { Ok::<(), CacheError>(()) });
        assert_eq!(tasks.pending(), 1);

        tasks.drain().await;
        assert_eq!(tasks.pending(), 0);
    }
}
