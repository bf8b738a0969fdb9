//! HTTP Server
//!
//! Routes the wire protocol onto the storage layer:
//!
//! | Method      | Path                          | Operation              |
//! |-------------|-------------------------------|------------------------|
//! | POST        | `/<ns>`                       | Insert                 |
//! | GET         | `/<ns>/<blob-id>`             | Read                   |
//! | DELETE      | `/<ns>/<fid>`                 | Replica delete         |
//! | HEARTBEAT   | `/<ns>/<fid>`                 | Replica liveness       |
//! | INITIALIZE  | `/<ns>/<fid>`                 | Replica create         |
//! | REPLICATE   | `/<ns>/<fid>`                 | Replica append         |
//! | BLASTSTATUS | `/<ns>`                       | Resident file listing  |
//! | BLASTGET    | `/<ns>/<fid>/<start>/<end>`   | Raw range read         |
//!
//! The non-standard verbs are dispatched by hand off `any` routes. Once
//! shutdown begins, non-replica responses carry `Shutting-Down: true` so
//! clients drain off the node.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::fid::BlobId;
use crate::replication::{
    HDR_END, HDR_HASH, HDR_LOCAL_ONLY, HDR_OWNER, HDR_SHUTTING_DOWN, HDR_START, VERB_BLASTGET,
    VERB_BLASTSTATUS, VERB_HEARTBEAT, VERB_INITIALIZE, VERB_REPLICATE,
};
use crate::storage::{InsertData, Node, ReadConfig};

/// Largest replica append accepted in one call; owners chunk far below this
const MAX_REPLICATE_BODY: usize = 16 * 1024 * 1024;

/// Shared handler state
#[derive(Clone)]
struct AppState {
    node: Arc<Node>,
}

/// HTTP server for one node
pub struct HttpServer {
    config: ApiConfig,
    node: Arc<Node>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, node: Arc<Node>) -> Self {
        Self { config, node }
    }

    /// Serve until `shutdown` resolves
    pub async fn start(
        &self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = router(Arc::clone(&self.node));
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))?;
        Ok(())
    }
}

/// Build the router (exposed separately for in-process tests)
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/statusz", get(handle_statusz))
        .route("/metrics", get(handle_metrics))
        .route("/debug/:ns/:id", get(handle_debug_id))
        .route("/:ns", any(handle_namespace))
        .route("/:ns/:file", any(handle_file))
        .route("/:ns/:file/:start/:end", any(handle_range))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { node })
}

// ============ Namespace-level verbs ============

async fn handle_namespace(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let response = match method.as_str() {
        "POST" => handle_insert(&state, &ns, request).await,
        VERB_BLASTSTATUS => handle_blast_status(&state, &ns).await,
        _ => Err(method_not_allowed(&method)),
    };
    finish(&state, true, response)
}

async fn handle_insert(state: &AppState, ns: &str, request: Request) -> Result<Response> {
    let storage = state.node.namespace(ns)?;
    if state.node.is_shutting_down() {
        return Err(Error::ShuttingDown);
    }

    let length = content_length(request.headers());
    let stream = request.into_body().into_data_stream();
    let reader = tokio_util::io::StreamReader::new(Box::pin(
        futures::TryStreamExt::map_err(stream, |e| {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        }),
    ));

    let id = storage
        .insert(InsertData::new(length, Box::new(reader)))
        .await?;
    Ok((StatusCode::OK, id.to_hex()).into_response())
}

async fn handle_blast_status(state: &AppState, ns: &str) -> Result<Response> {
    let storage = state.node.namespace(ns)?;
    Ok(Json(storage.blast_status()).into_response())
}

// ============ File-level verbs ============

async fn handle_file(
    State(state): State<AppState>,
    Path((ns, file)): Path<(String, String)>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let (replica_call, response) = match method.as_str() {
        "GET" => (false, handle_read(&state, &ns, &file, request).await),
        "DELETE" => (true, handle_replica_delete(&state, &ns, &file).await),
        VERB_HEARTBEAT => (true, handle_heartbeat(&state, &ns, &file, request).await),
        VERB_INITIALIZE => (true, handle_initialize(&state, &ns, &file, request).await),
        VERB_REPLICATE => (true, handle_replicate(&state, &ns, &file, request).await),
        _ => (false, Err(method_not_allowed(&method))),
    };
    finish(&state, !replica_call, response)
}

async fn handle_read(state: &AppState, ns: &str, id: &str, request: Request) -> Result<Response> {
    let storage = state.node.namespace(ns)?;
    let id = BlobId::parse(id)?;
    let local_only = request.headers().contains_key(HDR_LOCAL_ONLY);

    let blob = storage.read(ReadConfig { id, local_only }).await?;
    let body = Body::from_stream(ReaderStream::new(blob.reader));
    Ok((
        StatusCode::OK,
        [(header::CONTENT_LENGTH, blob.length.to_string())],
        body,
    )
        .into_response())
}

async fn handle_replica_delete(state: &AppState, ns: &str, fid: &str) -> Result<Response> {
    let storage = state.node.namespace(ns)?;
    storage.replica_queue_delete(fid).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_heartbeat(
    state: &AppState,
    ns: &str,
    fid: &str,
    request: Request,
) -> Result<Response> {
    let storage = state.node.namespace(ns)?;
    let owner = header_string(request.headers(), HDR_OWNER);
    storage.replica_heartbeat(fid, &owner).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_initialize(
    state: &AppState,
    ns: &str,
    fid: &str,
    request: Request,
) -> Result<Response> {
    let storage = state.node.namespace(ns)?;
    let owner = header_string(request.headers(), HDR_OWNER);
    storage.replica_initialize(fid, &owner).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_replicate(
    state: &AppState,
    ns: &str,
    fid: &str,
    request: Request,
) -> Result<Response> {
    let storage = state.node.namespace(ns)?;
    let start = header_u64(request.headers(), HDR_START)?;
    let end = header_u64(request.headers(), HDR_END)?;
    let hash = header_u64(request.headers(), HDR_HASH)? as u32;

    let body = axum::body::to_bytes(request.into_body(), MAX_REPLICATE_BODY)
        .await
        .map_err(|e| Error::Transient(format!("replicate body: {}", e)))?;

    storage
        .replica_replicate(fid, start, end, hash, body)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ============ Raw range reads ============

async fn handle_range(
    State(state): State<AppState>,
    Path((ns, fid, start, end)): Path<(String, String, u64, u64)>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let response = match method.as_str() {
        VERB_BLASTGET => handle_blast_get(&state, &ns, &fid, start, end).await,
        _ => Err(method_not_allowed(&method)),
    };
    finish(&state, true, response)
}

async fn handle_blast_get(
    state: &AppState,
    ns: &str,
    fid: &str,
    start: u64,
    end: u64,
) -> Result<Response> {
    let storage = state.node.namespace(ns)?;
    let bytes = storage.blast_read(fid, start, end)?;
    Ok((StatusCode::OK, bytes).into_response())
}

// ============ Operator endpoints ============

async fn handle_healthz(State(state): State<AppState>) -> Response {
    let mut healthy = true;
    let mut reasons = Vec::new();
    for ns in state.node.namespaces() {
        let (ok, reason) = ns.health();
        if !ok {
            healthy = false;
            reasons.push(format!("{}: {}", ns.name(), reason));
        }
    }

    let response = if healthy {
        (StatusCode::OK, "ok".to_string()).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, reasons.join("\n")).into_response()
    };
    finish(&state, true, Ok(response))
}

async fn handle_statusz(State(state): State<AppState>) -> Response {
    let statuses: Vec<_> = state.node.namespaces().map(|ns| ns.status()).collect();
    finish(&state, true, Ok(Json(statuses).into_response()))
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    let prefix = &state.node.config().metrics.prometheus_tag_prefix;
    let mut out = String::new();
    for ns in state.node.namespaces() {
        ns.get_metrics().render_prometheus(prefix, ns.name(), &mut out);
    }
    finish(
        &state,
        true,
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            out,
        )
            .into_response()),
    )
}

async fn handle_debug_id(
    State(state): State<AppState>,
    Path((ns, id)): Path<(String, String)>,
) -> Response {
    let response = match state.node.namespace(&ns) {
        Ok(storage) => storage.debug_id(&id).map(|text| text.into_response()),
        Err(e) => Err(e),
    };
    finish(&state, true, response)
}

// ============ Helpers ============

fn method_not_allowed(method: &Method) -> Error {
    Error::NotPossible(format!("method {} not supported here", method))
}

fn content_length(headers: &HeaderMap) -> i64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(-1)
}

fn header_string(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::InvalidId(format!("missing or malformed {} header", name)))
}

/// Convert handler results to responses and stamp the shutdown header on
/// non-replica traffic.
fn finish(state: &AppState, client_facing: bool, result: Result<Response>) -> Response {
    let mut response = match result {
        Ok(response) => response,
        Err(e) => {
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if status.is_server_error() {
                tracing::warn!(error = %e, "request failed");
            }
            (status, e.to_string()).into_response()
        }
    };

    if client_facing && state.node.is_shutting_down() {
        if let Ok(name) = header::HeaderName::from_bytes(HDR_SHUTTING_DOWN.as_bytes()) {
            response
                .headers_mut()
                .insert(name, header::HeaderValue::from_static("true"));
        }
    }
    response
}
