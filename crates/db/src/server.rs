//! HTTP endpoint for inspecting a running VM.
//!
//! Routes are served by an `axum::Router`. The scheduler keeps running on
//! its own thread; the server only reads the shared loader and folds the
//! events the observer forwards.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use strand_vm::Loader;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::encode::encode_modules;
use crate::observer::DebugEvent;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub address: String,
    /// How long browsers may cache a CORS preflight answer, in seconds.
    pub cors_max_age: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9432".to_string(),
            cors_max_age: 600,
        }
    }
}

/// Counters folded from observer events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DebugStats {
    pub spawned: u64,
    pub exited: u64,
    pub errors: u64,
    pub breaks: u64,
    pub links: u64,
}

impl DebugStats {
    fn record(&mut self, event: &DebugEvent) {
        match event {
            DebugEvent::Spawned(_) => self.spawned += 1,
            DebugEvent::Exited { .. } => self.exited += 1,
            DebugEvent::Thrown { .. } => self.errors += 1,
            DebugEvent::Break { .. } => self.breaks += 1,
            DebugEvent::Linked { .. } => self.links += 1,
        }
    }
}

/// State shared by every request handler.
#[derive(Clone)]
pub struct DebugState {
    loader: Arc<RwLock<Loader>>,
    events: Receiver<DebugEvent>,
    stats: Arc<Mutex<DebugStats>>,
}

impl DebugState {
    pub fn new(loader: Arc<RwLock<Loader>>, events: Receiver<DebugEvent>) -> Self {
        Self {
            loader,
            events,
            stats: Arc::default(),
        }
    }

    /// Fold pending observer events into the counters and return a copy.
    pub fn stats(&self) -> DebugStats {
        let mut stats = self.stats.lock();
        for event in self.events.try_iter() {
            stats.record(&event);
        }
        stats.clone()
    }
}

/// Build the inspection routes.
///
/// Unknown paths answer 404 and known paths answer 405 for methods other
/// than GET. Any OPTIONS request is a CORS preflight and answers 200.
pub fn router(state: DebugState, config: &DbConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONNECTION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(config.cors_max_age));

    Router::new()
        .route("/modules", get(modules))
        .route("/stats", get(stats))
        .fallback(not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn modules(State(state): State<DebugState>) -> impl IntoResponse {
    let body = encode_modules(&state.loader.read());
    no_cache(Json(body))
}

async fn stats(State(state): State<DebugState>) -> impl IntoResponse {
    no_cache(Json(state.stats()))
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn no_cache(body: impl IntoResponse) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))],
        body,
    )
}

pub struct DebugServer {
    listener: TcpListener,
    router: Router,
    state: DebugState,
}

impl DebugServer {
    /// Listen on `config.address`.
    pub async fn bind(
        config: DbConfig,
        loader: Arc<RwLock<Loader>>,
        events: Receiver<DebugEvent>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.address).await?;
        debug!(address = %config.address, "debug server listening");
        let state = DebugState::new(loader, events);
        Ok(Self {
            listener,
            router: router(state.clone(), &config),
            state,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the counters, usable after `serve` took the server.
    pub fn state(&self) -> DebugState {
        self.state.clone()
    }

    /// Serve requests until the task is dropped.
    pub async fn serve(self) -> io::Result<()> {
        info!(address = %self.local_addr()?, "debug server started");
        axum::serve(self.listener, self.router).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use crossbeam_channel::unbounded;
    use strand_vm::Pid;
    use tower::ServiceExt;

    fn state() -> (DebugState, crossbeam_channel::Sender<DebugEvent>) {
        let (tx, rx) = unbounded();
        let loader = Arc::new(RwLock::new(Loader::with_std().unwrap()));
        (DebugState::new(loader, rx), tx)
    }

    async fn call(state: &DebugState, method: Method, uri: &str) -> axum::response::Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::ORIGIN, "http://localhost")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap();
        router(state.clone(), &DbConfig::default())
            .oneshot(request)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_routes() {
        let (s, _tx) = state();
        assert_eq!(call(&s, Method::OPTIONS, "/anything").await.status(), StatusCode::OK);
        assert_eq!(call(&s, Method::GET, "/nowhere").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            call(&s, Method::POST, "/modules").await.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );

        let response = call(&s, Method::GET, "/modules").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"[]");
    }

    #[tokio::test]
    async fn test_preflight_headers() {
        let (s, _tx) = state();
        let response = call(&s, Method::OPTIONS, "/modules").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_MAX_AGE], "600");
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn test_stats_fold_events() {
        let (s, tx) = state();
        tx.send(DebugEvent::Spawned(Pid(1))).unwrap();
        tx.send(DebugEvent::Thrown { pid: Pid(1), error: "x".into() }).unwrap();
        tx.send(DebugEvent::Exited { pid: Pid(1), normal: false }).unwrap();

        let response = call(&s, Method::GET, "/stats").await;
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["spawned"], 1);
        assert_eq!(v["errors"], 1);
        assert_eq!(v["exited"], 1);
        assert_eq!(v["links"], 0);
    }

    #[test]
    fn test_stats_accumulate_across_reads() {
        let (s, tx) = state();
        tx.send(DebugEvent::Break { pid: Pid(1), ip: 0 }).unwrap();
        assert_eq!(s.stats().breaks, 1);
        tx.send(DebugEvent::Break { pid: Pid(1), ip: 4 }).unwrap();
        assert_eq!(s.stats().breaks, 2);
    }
}
