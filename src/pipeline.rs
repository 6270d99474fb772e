//! Per-request simulation pipeline.
//!
//! Stages run in a fixed order and each may end the request:
//! delay, injected error, backend forward, fixture lookup.

use crate::backend::{Backend, BackendError, ForwardRequest, HttpBackend};
use crate::config::{GlobalSettings, ServerConfig};
use crate::keys::{self, CandidateKey};
use crate::options::{self, ErrorMode, RequestOption};
use crate::store::FixtureStore;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const X_DEBUG_PATHS: &str = "x-debug-paths";
pub const X_PATH: &str = "x-path";
pub const X_RESOURCE: &str = "x-resource";

const CONTENT_TYPE: &str = "content-type";
const JSON: &str = "application/json";

/// An inbound request with its body already buffered.
#[derive(Debug, Clone)]
pub struct SimRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SimRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Path plus query string, as the client sent it.
    pub fn url(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri.path())
    }
}

/// Which stage produced the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    InjectedError,
    Backend,
    Fixture,
    NotFound,
}

/// Response produced by the pipeline.
#[derive(Debug, Clone)]
pub struct SimResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub outcome: Outcome,
}

impl SimResponse {
    fn new(status: StatusCode, outcome: Outcome) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            outcome,
        }
    }

    fn json(status: StatusCode, outcome: Outcome) -> Self {
        Self::new(status, outcome).with_header(CONTENT_TYPE, JSON)
    }

    fn with_header(mut self, name: &'static str, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(HeaderName::from_static(name), value);
            }
            Err(_) => debug!(header = name, value, "Dropping header with invalid value"),
        }
        self
    }

    fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl IntoResponse for SimResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

#[derive(Serialize)]
struct NotFoundBody<'a> {
    result: bool,
    message: &'a str,
    #[serde(rename = "checkedPaths")]
    checked_paths: Vec<String>,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub requests: u64,
    pub errors_injected: u64,
    pub backend_relayed: u64,
    pub backend_misses: u64,
    pub fixtures_served: u64,
    pub fixtures_missing: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    errors_injected: AtomicU64,
    backend_relayed: AtomicU64,
    backend_misses: AtomicU64,
    fixtures_served: AtomicU64,
    fixtures_missing: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Runs the simulation stages for each request.
pub struct Simulator {
    store: FixtureStore,
    backend: Option<Arc<dyn Backend>>,
    defaults: RequestOption,
    override_header: HeaderName,
    settings: GlobalSettings,
    counters: Counters,
}

impl Simulator {
    /// Build a simulator from configuration, connecting the HTTP backend if one
    /// is configured.
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let override_header = HeaderName::try_from(config.fixtures.override_header.as_str())?;
        let backend = match &config.backend {
            Some(backend) => Some(Arc::new(HttpBackend::new(backend)?) as Arc<dyn Backend>),
            None => None,
        };

        info!(
            root = %config.fixtures.root.display(),
            backend = config.backend.as_ref().map(|b| b.url.as_str()).unwrap_or("none"),
            "Fixture simulator initialized"
        );

        Ok(Self {
            store: FixtureStore::new(config.fixtures.root.clone()),
            backend,
            defaults: config.defaults.to_request_option(),
            override_header,
            settings: config.settings.clone(),
            counters: Counters::default(),
        })
    }

    /// Replace the backend.
    pub fn with_backend(mut self, backend: Option<Arc<dyn Backend>>) -> Self {
        self.backend = backend;
        self
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn stats(&self) -> Stats {
        let c = &self.counters;
        Stats {
            requests: c.requests.load(Ordering::Relaxed),
            errors_injected: c.errors_injected.load(Ordering::Relaxed),
            backend_relayed: c.backend_relayed.load(Ordering::Relaxed),
            backend_misses: c.backend_misses.load(Ordering::Relaxed),
            fixtures_served: c.fixtures_served.load(Ordering::Relaxed),
            fixtures_missing: c.fixtures_missing.load(Ordering::Relaxed),
        }
    }

    /// Options for a request: configured defaults overlaid with query directives.
    pub fn resolve_options(&self, url: &str) -> RequestOption {
        options::merge(&self.defaults, options::parse(url))
    }

    fn directory_override<'r>(&self, request: &'r SimRequest) -> Option<&'r str> {
        request
            .headers
            .get(&self.override_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Run the pipeline for one request.
    ///
    /// Dropping the returned future (client gone) abandons whatever stage is
    /// pending; nothing after it runs.
    pub async fn handle(&self, request: SimRequest) -> SimResponse {
        bump(&self.counters.requests);

        let option = self.resolve_options(request.url());
        let directory_override = self.directory_override(&request);

        if option.delay_ms > 0 {
            debug!(delay_ms = option.delay_ms, path = %request.uri.path(), "Applying delay");
            tokio::time::sleep(Duration::from_millis(option.delay_ms)).await;
        }

        if let Some(mode) = option.error {
            return self.inject_error(mode, directory_override).await;
        }

        match self.try_backend(&request, &option).await {
            Some(response) => response,
            None => self.serve_fixture(&request, directory_override).await,
        }
    }

    async fn inject_error(&self, mode: ErrorMode, directory_override: Option<&str>) -> SimResponse {
        bump(&self.counters.errors_injected);

        let code = mode.status();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let response = SimResponse::json(status, Outcome::InjectedError);

        match self.store.error_fixture(code, directory_override).await {
            Some(fixture) => {
                debug!(status = code, file = %fixture.filename, "Injecting error with fixture body");
                response
                    .with_header(X_PATH, &fixture.filename)
                    .with_body(fixture.body)
            }
            None => {
                debug!(status = code, "Injecting error with empty body");
                response
            }
        }
    }

    /// Forward to the backend. `None` means fall through to fixtures.
    async fn try_backend(&self, request: &SimRequest, option: &RequestOption) -> Option<SimResponse> {
        let backend = self.backend.as_ref()?;
        if option.force_mock {
            debug!(path = %request.uri.path(), "Force-mock set, skipping backend");
            return None;
        }

        let forward = ForwardRequest {
            method: request.method.clone(),
            path_and_query: request.url().to_string(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        };

        match backend.forward(forward).await {
            Ok(response) if response.is_miss() => {
                bump(&self.counters.backend_misses);
                debug!(path = %request.uri.path(), "Backend returned 404, falling back to fixtures");
                None
            }
            Ok(response) => {
                bump(&self.counters.backend_relayed);
                debug!(
                    path = %request.uri.path(),
                    status = response.status.as_u16(),
                    "Relaying backend response"
                );
                Some(SimResponse {
                    status: response.status,
                    headers: response.headers,
                    body: response.body,
                    outcome: Outcome::Backend,
                })
            }
            Err(e) => {
                bump(&self.counters.backend_misses);
                warn!(error = %e, path = %request.uri.path(), "Backend unreachable, falling back to fixtures");
                if let BackendError::Transport(inner) = &e {
                    debug!(timeout = inner.is_timeout(), connect = inner.is_connect(), "Transport failure detail");
                }
                None
            }
        }
    }

    async fn serve_fixture(&self, request: &SimRequest, directory_override: Option<&str>) -> SimResponse {
        let candidates = keys::generate(request.method.as_str(), request.url());
        let debug_paths = keys::join_candidates(&candidates);

        match self.store.resolve(&candidates, directory_override).await {
            Some(hit) => {
                bump(&self.counters.fixtures_served);
                if self.settings.log_matches {
                    info!(
                        method = %request.method,
                        path = %request.uri.path(),
                        file = %hit.fixture.filename,
                        "Serving fixture"
                    );
                }
                SimResponse::json(StatusCode::OK, Outcome::Fixture)
                    .with_header(X_DEBUG_PATHS, &debug_paths)
                    .with_header(X_PATH, &hit.fixture.filename)
                    .with_header(X_RESOURCE, &hit.candidate.to_string())
                    .with_body(hit.fixture.body)
            }
            None => {
                bump(&self.counters.fixtures_missing);
                if self.settings.log_unmatched {
                    warn!(
                        method = %request.method,
                        path = %request.uri.path(),
                        checked = %debug_paths,
                        "No fixture found"
                    );
                }
                SimResponse::json(StatusCode::NOT_FOUND, Outcome::NotFound)
                    .with_header(X_DEBUG_PATHS, &debug_paths)
                    .with_body(not_found_body(&candidates))
            }
        }
    }
}

fn not_found_body(candidates: &[CandidateKey]) -> String {
    let body = NotFoundBody {
        result: false,
        message: "JSON not found.",
        checked_paths: candidates.iter().map(|c| c.to_string()).collect(),
    };
    serde_json::to_string_pretty(&body).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendResponse;
    use crate::config::BackendConfig;
    use async_trait::async_trait;
    use axum::http::header;
    use std::fs;
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::TempDir;

    /// Backend stand-in answering from a fixed table, recording calls.
    #[derive(Default)]
    struct FakeBackend {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn forward(&self, request: ForwardRequest) -> Result<BackendResponse, BackendError> {
            self.calls.lock().unwrap().push(request.path_and_query.clone());
            if self.fail {
                let err = reqwest::Client::new()
                    .get("http://[::1")
                    .build()
                    .unwrap_err();
                return Err(BackendError::Transport(err));
            }
            let (status, body) = match request.path_and_query.as_str() {
                "/foo" => (StatusCode::OK, r#"{"path":"/foo"}"#),
                "/bar" => (StatusCode::NOT_FOUND, ""),
                "/boom" => (StatusCode::INTERNAL_SERVER_ERROR, r#"{"path":"/boom"}"#),
                _ => (StatusCode::NOT_FOUND, ""),
            };
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON));
            headers.insert("x-backend", HeaderValue::from_static("yes"));
            Ok(BackendResponse {
                status,
                headers,
                body: Bytes::from_static(body.as_bytes()),
            })
        }
    }

    fn fixtures(files: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
        dir
    }

    fn simulator(dir: &TempDir) -> Simulator {
        let mut config = ServerConfig::default();
        config.fixtures.root = dir.path().to_path_buf();
        Simulator::new(&config).unwrap()
    }

    fn with_fake(sim: Simulator, fake: &Arc<FakeBackend>) -> Simulator {
        sim.with_backend(Some(fake.clone() as Arc<dyn Backend>))
    }

    fn get(url: &str) -> SimRequest {
        SimRequest::new(Method::GET, url.parse().unwrap())
    }

    #[tokio::test]
    async fn test_fixture_hit_scenario() {
        let dir = fixtures(&[
            ("get-foo-bar-_.json", r#"{"id":"bar"}"#),
            ("get-foo-_-_.json", r#"{"id":"any"}"#),
        ]);
        let sim = simulator(&dir);

        let response = sim.handle(get("/foo/bar/1")).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.outcome, Outcome::Fixture);
        assert_eq!(&response.body[..], br#"{"id":"bar"}"#);
        assert_eq!(response.header(CONTENT_TYPE), Some(JSON));
        assert_eq!(
            response.header(X_DEBUG_PATHS),
            Some("get-foo-bar-1,get-foo-bar-_,get-foo-_-_")
        );
        assert_eq!(response.header(X_PATH), Some("get-foo-bar-_.json"));
        assert_eq!(response.header(X_RESOURCE), Some("get-foo-bar-_"));
    }

    #[tokio::test]
    async fn test_not_found_lists_checked_paths() {
        let dir = fixtures(&[]);
        let sim = simulator(&dir);

        let response = sim.handle(get("/unknown")).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.outcome, Outcome::NotFound);
        assert_eq!(response.header(X_DEBUG_PATHS), Some("get-unknown"));

        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["result"], false);
        assert_eq!(body["message"], "JSON not found.");
        assert_eq!(body["checkedPaths"], serde_json::json!(["get-unknown"]));
        assert_eq!(sim.stats().fixtures_missing, 1);
    }

    #[tokio::test]
    async fn test_same_request_same_result() {
        let dir = fixtures(&[("get-a-_.json", r#"{"n":1}"#), ("get-a-_x.json", r#"{"n":2}"#)]);
        let sim = simulator(&dir);

        let first = sim.handle(get("/a/1")).await;
        let second = sim.handle(get("/a/1")).await;
        assert_eq!(first.body, second.body);
        assert_eq!(first.header(X_PATH), second.header(X_PATH));
    }

    #[tokio::test]
    async fn test_error_with_status() {
        let dir = fixtures(&[("get-tea.json", "{}")]);
        let sim = simulator(&dir);

        let response = sim.handle(get("/tea?_error=418")).await;
        assert_eq!(response.status.as_u16(), 418);
        assert_eq!(response.outcome, Outcome::InjectedError);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_error_without_value_is_500() {
        let dir = fixtures(&[("get-tea.json", "{}")]);
        let sim = simulator(&dir);

        let response = sim.handle(get("/tea?_error")).await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(sim.stats().errors_injected, 1);
        assert_eq!(sim.stats().fixtures_served, 0);
    }

    #[tokio::test]
    async fn test_error_body_from_fixture() {
        let dir = fixtures(&[("503.json", r#"{"error":"maintenance"}"#)]);
        let sim = simulator(&dir);

        let response = sim.handle(get("/anything?_error=503")).await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(&response.body[..], br#"{"error":"maintenance"}"#);
        assert_eq!(response.header(X_PATH), Some("503.json"));
    }

    #[tokio::test]
    async fn test_error_skips_backend() {
        let dir = fixtures(&[]);
        let fake = Arc::new(FakeBackend::default());
        let sim = with_fake(simulator(&dir), &fake);

        let response = sim.handle(get("/foo?_error=502")).await;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delay_postpones_response() {
        let dir = fixtures(&[("get-slow.json", r#"{"slow":true}"#)]);
        let sim = simulator(&dir);

        let started = Instant::now();
        let fast = sim.handle(get("/slow")).await;
        let fast_elapsed = started.elapsed();

        let started = Instant::now();
        let slow = sim.handle(get("/slow?_delay=100")).await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() >= fast_elapsed);
        assert_eq!(fast.body, slow.body);
        assert_eq!(slow.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dropped_request_abandons_pipeline() {
        let dir = fixtures(&[("get-slow.json", "{}")]);
        let sim = simulator(&dir);

        let pending = sim.handle(get("/slow?_delay=5000"));
        let raced = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(raced.is_err());
        assert_eq!(sim.stats().requests, 1);
        assert_eq!(sim.stats().fixtures_served, 0);
    }

    #[tokio::test]
    async fn test_backend_response_relayed() {
        let dir = fixtures(&[("get-foo.json", r#"{"from":"fixture"}"#)]);
        let fake = Arc::new(FakeBackend::default());
        let sim = with_fake(simulator(&dir), &fake);

        let response = sim.handle(get("/foo")).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.outcome, Outcome::Backend);
        assert_eq!(&response.body[..], br#"{"path":"/foo"}"#);
        assert_eq!(response.header("x-backend"), Some("yes"));
        assert_eq!(response.header(X_DEBUG_PATHS), None);
    }

    #[tokio::test]
    async fn test_backend_error_status_relayed() {
        let dir = fixtures(&[("get-boom.json", "{}")]);
        let fake = Arc::new(FakeBackend::default());
        let sim = with_fake(simulator(&dir), &fake);

        let response = sim.handle(get("/boom")).await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.outcome, Outcome::Backend);
    }

    #[tokio::test]
    async fn test_backend_404_falls_through() {
        let dir = fixtures(&[("get-bar.json", r#"{"from":"fixture"}"#)]);
        let fake = Arc::new(FakeBackend::default());
        let sim = with_fake(simulator(&dir), &fake);

        let response = sim.handle(get("/bar")).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.outcome, Outcome::Fixture);
        assert_eq!(&response.body[..], br#"{"from":"fixture"}"#);
        assert_eq!(*fake.calls.lock().unwrap(), vec!["/bar".to_string()]);
        assert_eq!(sim.stats().backend_misses, 1);
    }

    #[tokio::test]
    async fn test_backend_transport_error_falls_through() {
        let dir = fixtures(&[("get-foo.json", r#"{"from":"fixture"}"#)]);
        let fake = Arc::new(FakeBackend {
            fail: true,
            ..Default::default()
        });
        let sim = with_fake(simulator(&dir), &fake);

        let response = sim.handle(get("/foo")).await;
        assert_eq!(response.outcome, Outcome::Fixture);
        assert_eq!(fake.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_force_mock_skips_backend() {
        let dir = fixtures(&[("get-foo.json", r#"{"from":"fixture"}"#)]);
        let fake = Arc::new(FakeBackend::default());
        let sim = with_fake(simulator(&dir), &fake);

        let response = sim.handle(get("/foo?_mock=true")).await;
        assert_eq!(response.outcome, Outcome::Fixture);
        assert_eq!(&response.body[..], br#"{"from":"fixture"}"#);
        assert!(fake.calls.lock().unwrap().is_empty());

        let response = sim.handle(get("/foo?_mock=false")).await;
        assert_eq!(response.outcome, Outcome::Backend);
    }

    #[tokio::test]
    async fn test_directory_override_header() {
        let dir = fixtures(&[
            ("get-me.json", r#"{"set":"root"}"#),
            ("scenario/get-me.json", r#"{"set":"scenario"}"#),
        ]);
        let sim = simulator(&dir);

        let mut request = get("/me");
        request.headers.insert("dist", HeaderValue::from_static("scenario"));
        let response = sim.handle(request).await;
        assert_eq!(&response.body[..], br#"{"set":"scenario"}"#);

        let mut request = get("/me");
        request.headers.insert("dist", HeaderValue::from_static("missing"));
        let response = sim.handle(request).await;
        assert_eq!(&response.body[..], br#"{"set":"root"}"#);
    }

    #[tokio::test]
    async fn test_configured_defaults_apply() {
        let dir = fixtures(&[("get-x.json", "{}")]);
        let mut config = ServerConfig::default();
        config.fixtures.root = dir.path().to_path_buf();
        config.defaults.error = Some(503);
        let sim = Simulator::new(&config).unwrap();

        assert_eq!(sim.handle(get("/x")).await.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(sim.handle(get("/x?_error=404")).await.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_new_rejects_bad_backend() {
        let mut config = ServerConfig::default();
        config.backend = Some(BackendConfig::new("not a url"));
        assert!(Simulator::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_empty_path_is_not_found() {
        let dir = fixtures(&[("get.json", "{}")]);
        let sim = simulator(&dir);

        let response = sim.handle(get("//")).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["checkedPaths"], serde_json::json!([]));
    }
}
