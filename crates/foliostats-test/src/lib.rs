//! Helpers for testing the foliostats service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory
//!    is held for the entire lifetime of the test. To avoid dropping it too
//!    early, assign it to a variable (e.g. `let _cache_dir = tempdir()`).
//!
//!  - When using [`Server`] or [`HitCounter`], make sure that the server is
//!    held until all requests to it have been made. If the server is dropped,
//!    the ports remain open and all connections to it will time out.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{OriginalUri, Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the foliostats
///    crates and mutes all other logs (such as hyper's).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("foliostats_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically
/// clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Shared state of the canned routes.
#[derive(Clone, Default)]
struct RouterState {
    /// Per-URI access counts used by the `/flaky` routes.
    attempts: Arc<Mutex<BTreeMap<String, usize>>>,
}

/// The canned routes every test server responds to.
///
///  - `/respond_statuscode/{num}/...`: responds with the given status code.
///  - `/garbage_data/{tail}`: responds with `tail` as a plain (non-JSON) body.
///  - `/delay/{ms}/{tail}`: responds with `tail` after a delay.
///  - `/json/{tail}`: responds with the JSON `{"path": tail}`.
///  - `/flaky/{failures}/...`: responds 503 for the first `failures`
///    accesses of a URI and with `{"attempt": n, "authorization": ...}`
///    afterwards.
///  - `/bearer/...`: echoes the request's `Authorization` header as JSON.
///  - anything else: responds with `{"path": ...}` like `/json` does.
fn routes() -> Router {
    Router::new()
        .route(
            "/respond_statuscode/:num/*tail",
            get(|Path((num, _)): Path<(u16, String)>| async move {
                StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }),
        )
        .route(
            "/garbage_data/*tail",
            get(|Path(tail): Path<String>| async move { tail }),
        )
        .route(
            "/delay/:ms/*tail",
            get(|Path((ms, tail)): Path<(u64, String)>| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                tail
            }),
        )
        .route(
            "/json/*tail",
            get(|Path(tail): Path<String>| async move { Json(json!({ "path": tail })) }),
        )
        .route("/flaky/:failures/*tail", get(flaky))
        .route(
            "/bearer/*tail",
            get(|headers: HeaderMap| async move {
                let authorization = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default();
                Json(json!({ "authorization": authorization }))
            }),
        )
        .fallback(|OriginalUri(uri): OriginalUri| async move {
            Json(json!({ "path": uri.path() }))
        })
        .with_state(RouterState::default())
}

async fn flaky(
    State(state): State<RouterState>,
    OriginalUri(uri): OriginalUri,
    Path((failures, _tail)): Path<(usize, String)>,
    headers: HeaderMap,
) -> Response {
    let attempt = {
        let mut attempts = state.attempts.lock().unwrap();
        let attempt = attempts.entry(uri.to_string()).or_default();
        *attempt += 1;
        *attempt
    };

    if attempt <= failures {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    } else {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        Json(json!({ "attempt": attempt, "authorization": authorization })).into_response()
    }
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a
/// `tokio::test`. It automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Creates a new test server with the canned [`routes`].
    pub fn new() -> Self {
        Self::with_router(routes())
    }

    /// Creates a new test server from the given `axum` router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A [`Server`] that counts how often each of its URIs is requested.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |OriginalUri(uri): OriginalUri, req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = routes().layer(middleware::from_fn(hitcounter));
        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the total number of accesses recorded so far and resets the
    /// counts.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the number of accesses per URI recorded so far and resets
    /// the counts.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
