//! In-process HTTP server for downloader and manager tests.
//!
//! Serves one blob with `Range` support at `/superpack.dvpk`, the same blob
//! with a delay at `/slow`, and an oversized `200` body at `/garbage`.
//! While offline every route answers `503`. The next N ranged reads of the
//! blob can be made to fail with `500` or to carry a flipped first byte.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

struct ServerState {
    blob: RwLock<Vec<u8>>,
    offline: AtomicBool,
    requests: AtomicUsize,
    fail_next: AtomicUsize,
    corrupt_next: AtomicUsize,
}

pub struct TestServer {
    base: String,
    state: Arc<ServerState>,
    _runtime: tokio::runtime::Runtime,
}

impl TestServer {
    pub fn start(blob: Vec<u8>) -> Self {
        let state = Arc::new(ServerState {
            blob: RwLock::new(blob),
            offline: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            corrupt_next: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/superpack.dvpk", get(serve_blob).head(head_blob))
            .route("/slow", get(serve_slow))
            .route("/garbage", get(serve_garbage))
            .with_state(state.clone());

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("test server runtime");
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .expect("bind test server");
        let addr = listener.local_addr().expect("test server address");
        runtime.spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base: format!("http://{}", addr),
            state,
            _runtime: runtime,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_blob(&self, blob: Vec<u8>) {
        *self.state.blob.write().unwrap() = blob;
    }

    /// Answer the next `count` ranged reads with `500`.
    pub fn fail_next_ranges(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    /// Flip the first byte of the next `count` ranged reads.
    pub fn corrupt_next_ranges(&self, count: usize) {
        self.state.corrupt_next.store(count, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

fn unavailable(state: &ServerState) -> Option<Response> {
    state.requests.fetch_add(1, Ordering::SeqCst);
    state
        .offline
        .load(Ordering::SeqCst)
        .then(|| StatusCode::SERVICE_UNAVAILABLE.into_response())
}

async fn serve_blob(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if let Some(response) = unavailable(&state) {
        return response;
    }
    let requested = requested_range(&headers);
    if requested.is_some() && take_one(&state.fail_next) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let mut blob = state.blob.read().unwrap().clone();
    if let Some((start, _)) = requested {
        let start = start as usize;
        if start < blob.len() && take_one(&state.corrupt_next) {
            blob[start] ^= 0xFF;
        }
    }
    ranged_response(&blob, &headers)
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn requested_range(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range)
}

async fn head_blob(State(state): State<Arc<ServerState>>) -> Response {
    if let Some(response) = unavailable(&state) {
        return response;
    }
    let len = state.blob.read().unwrap().len();
    (StatusCode::OK, [(header::CONTENT_LENGTH, len.to_string())]).into_response()
}

async fn serve_slow(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    tokio::time::sleep(Duration::from_millis(300)).await;
    serve_blob(State(state), headers).await
}

async fn serve_garbage(State(state): State<Arc<ServerState>>) -> Response {
    if let Some(response) = unavailable(&state) {
        return response;
    }
    (StatusCode::OK, vec![0xEE_u8; 100]).into_response()
}

fn ranged_response(data: &[u8], headers: &HeaderMap) -> Response {
    let len = data.len() as u64;
    let Some((start, end)) = requested_range(headers) else {
        return (StatusCode::OK, data.to_vec()).into_response();
    };

    let end = end.unwrap_or(u64::MAX).min(len.saturating_sub(1));
    if start >= len || end < start {
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{}", len))],
        )
            .into_response();
    }

    (
        StatusCode::PARTIAL_CONTENT,
        [(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len))],
        data[start as usize..=end as usize].to_vec(),
    )
        .into_response()
}

fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let range = value.strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        e => Some(e.parse().ok()?),
    };
    Some((start, end))
}
