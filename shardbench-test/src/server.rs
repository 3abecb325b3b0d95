//! Exposes an in-process fake shard service for use in integration tests.
//!
//! ```
//! use shardbench_test::server::TestServer;
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = TestServer::new().await;
//!    let url = server.url("/shard");
//!    // use the URL in tests...
//! }
//! ```
//!
//! The service stores objects in memory under the hex SHA-256 digest of their contents and
//! answers on both `/shard` and `/api/shard`. Its `/admin/metrics` document mimics the
//! DropWizard JSON reporter with timers for inserts and gets.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// Timer name of uploads in the metrics document.
pub const INSERT_TIMER: &str = "edu.stanford.cs244b.Shard.insertItem";
/// Timer name of downloads in the metrics document.
pub const GET_TIMER: &str = "edu.stanford.cs244b.Shard.getItem";
/// The shard id reported in upload responses.
pub const SHARD_ID: &str = "7f000001";

/// Behavior switches of a [`TestServer`].
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Include the uploaded file name in upload responses, like the router does.
    pub echo_filename: bool,
    /// Answer the metrics endpoint with `503 Service Unavailable`.
    pub metrics_unavailable: bool,
    /// Leave the `id` out of upload responses.
    pub omit_id: bool,
    /// Answer uploads with an HTML page instead of JSON.
    pub html_receipts: bool,
    /// Hold every upload response for this long.
    pub upload_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Store {
    objects: HashMap<String, Vec<u8>>,
    corrupted: HashSet<String>,
    failing_uploads: usize,
    uploads: usize,
    gets: usize,
    insert_timings: Vec<f64>,
    get_timings: Vec<f64>,
}

#[derive(Clone, Debug)]
struct AppState {
    options: Options,
    store: Arc<Mutex<Store>>,
}

/// An in-process fake shard for use in integration tests.
///
/// It listens on a random available port on localhost and is stopped when dropped.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    store: Arc<Mutex<Store>>,
}

impl TestServer {
    /// Starts a server with default [`Options`].
    pub async fn new() -> Self {
        Self::with_options(Options::default()).await
    }

    /// Starts a server with the given behavior.
    pub async fn with_options(options: Options) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let store = Arc::new(Mutex::new(Store::default()));
        let state = AppState {
            options,
            store: Arc::clone(&store),
        };

        let app = Router::new()
            .route("/shard", post(insert_item))
            .route("/shard/{id}", get(get_item))
            .route("/api/shard", post(insert_item))
            .route("/api/shard/{id}", get(get_item))
            .route("/admin/metrics", get(metrics))
            .with_state(state);

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            store,
        }
    }

    /// Returns the base URL of the server.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.socket.port())
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url(), path)
    }

    /// Answers the next `count` uploads with `500 Internal Server Error`.
    pub fn fail_next_uploads(&self, count: usize) {
        self.store.lock().unwrap().failing_uploads += count;
    }

    /// Makes gets of `id` fail the integrity check with `410 Gone`.
    pub fn corrupt(&self, id: &str) {
        self.store.lock().unwrap().corrupted.insert(id.to_owned());
    }

    /// Number of distinct stored objects.
    pub fn object_count(&self) -> usize {
        self.store.lock().unwrap().objects.len()
    }

    /// Number of upload requests received, including failed ones.
    pub fn upload_count(&self) -> usize {
        self.store.lock().unwrap().uploads
    }

    /// Number of get requests received.
    pub fn get_count(&self) -> usize {
        self.store.lock().unwrap().gets
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn insert_item(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let start = Instant::now();

    let mut upload = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        };
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().map(str::to_owned);
        match field.bytes().await {
            Ok(data) => upload = Some((filename, data)),
            Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        }
    }

    let Some((filename, data)) = upload else {
        return (StatusCode::BAD_REQUEST, "missing `file` field").into_response();
    };

    if let Some(delay) = state.options.upload_delay {
        tokio::time::sleep(delay).await;
    }

    let mut store = state.store.lock().unwrap();
    store.uploads += 1;
    if store.failing_uploads > 0 {
        store.failing_uploads -= 1;
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }

    let id = hex::encode(Sha256::digest(&data));
    store.objects.insert(id.clone(), data.to_vec());
    store.insert_timings.push(start.elapsed().as_secs_f64());

    if state.options.html_receipts {
        return Html("<html><body>stored</body></html>").into_response();
    }

    let mut body = json!({ "shard": SHARD_ID, "id": id });
    if state.options.omit_id {
        body.as_object_mut().unwrap().remove("id");
    }
    if state.options.echo_filename {
        body["filename"] = json!(filename);
    }
    axum::Json(body).into_response()
}

async fn get_item(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let start = Instant::now();

    let mut store = state.store.lock().unwrap();
    store.gets += 1;

    let Some(data) = store.objects.get(&id).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if store.corrupted.contains(&id) {
        let body = json!({
            "shard": SHARD_ID,
            "hits": store.gets,
            "error": format!("request for {id} does not match computed checksum"),
        });
        return (StatusCode::GONE, axum::Json(body)).into_response();
    }

    store.get_timings.push(start.elapsed().as_secs_f64());
    data.into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    if state.options.metrics_unavailable {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let store = state.store.lock().unwrap();
    let body = json!({
        "version": "3.0.0",
        "gauges": {},
        "counters": {},
        "timers": {
            INSERT_TIMER: timer(&store.insert_timings),
            GET_TIMER: timer(&store.get_timings),
        },
    });
    axum::Json(body).into_response()
}

fn timer(timings: &[f64]) -> Value {
    let mut sorted = timings.to_vec();
    sorted.sort_by(f64::total_cmp);

    let quantile = |q: f64| match sorted.len() {
        0 => 0.0,
        len => sorted[((len - 1) as f64 * q).round() as usize],
    };
    let mean = match sorted.len() {
        0 => 0.0,
        len => sorted.iter().sum::<f64>() / len as f64,
    };

    json!({
        "count": sorted.len(),
        "min": quantile(0.0),
        "max": quantile(1.0),
        "mean": mean,
        "p50": quantile(0.5),
        "p75": quantile(0.75),
        "p95": quantile(0.95),
        "p98": quantile(0.98),
        "p99": quantile(0.99),
        "p999": quantile(0.999),
        "duration_units": "seconds",
        "rate_units": "calls/second",
    })
}
