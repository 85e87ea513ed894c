//! HTTP surface: health checks, relay info, the REST bridge, and blobs.

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Path, Query as AxumQuery, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::error;

use crate::blossom::{sniff, BlobStore};
use crate::config::{csv_strings, csv_u16};
use crate::error::RelayError;
use crate::event::Event;
use crate::filter::Filter;
use crate::relay::Relay;

#[derive(Clone)]
struct HttpState {
    relay: Arc<Relay>,
    blobs: BlobStore,
}

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    software: String,
    version: String,
}

/// Descriptor returned for an uploaded blob.
#[derive(Serialize, Deserialize)]
struct BlobDescriptor {
    url: String,
    sha256: String,
    size: u64,
    #[serde(rename = "type")]
    content_type: String,
    uploaded: u64,
}

/// Start the HTTP server.
pub async fn serve_http(
    addr: SocketAddr,
    relay: Arc<Relay>,
    blobs: BlobStore,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = router(relay, blobs);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(relay: Arc<Relay>, blobs: BlobStore) -> Router {
    Router::new()
        .route("/", get(relay_info).post(bridge))
        .route("/healthz", get(healthz))
        .route("/query", get(query))
        .route("/upload", post(upload))
        .route("/:name", get(get_blob))
        .with_state(HttpState { relay, blobs })
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// Basic NIP-11 relay information document.
async fn relay_info() -> impl IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: "castr".into(),
            software: "castr".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }),
    )
}

fn ndjson(events: Vec<Event>) -> Response {
    let body = events
        .into_iter()
        .map(|e| serde_json::to_string(&e).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\n");
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from(body))
        .unwrap()
}

fn abort_if_fatal(e: &RelayError) {
    if e.is_fatal() {
        error!(error = %e, "aborting on storage failure");
        std::process::abort();
    }
}

/// REST bridge: a body carrying `id` and `sig` is a one-shot EVENT
/// submission; any other JSON object is a one-shot filter query.
async fn bridge(State(st): State<HttpState>, Json(body): Json<serde_json::Value>) -> Response {
    let is_event = body.get("id").is_some() && body.get("sig").is_some();
    if is_event {
        let ev = match Event::from_value(&body) {
            Ok(ev) => ev,
            Err(e) => {
                let id = body.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                return Json(serde_json::json!(["OK", id, false, e.reason()])).into_response();
            }
        };
        return match st.relay.publish(&ev).await {
            Ok(()) => {
                st.relay.after_write(&ev);
                Json(serde_json::json!(["OK", ev.id, true, ""])).into_response()
            }
            Err(e) => {
                abort_if_fatal(&e);
                Json(serde_json::json!(["OK", ev.id, false, e.reason()])).into_response()
            }
        };
    }
    let filter = match Filter::from_value(&body) {
        Ok(f) => f,
        Err(e) => return (StatusCode::BAD_REQUEST, e.reason()).into_response(),
    };
    let plan = st.relay.compile(std::slice::from_ref(&filter));
    match st.relay.run_historical(&plan) {
        Ok(events) => ndjson(events),
        Err(e) => {
            abort_if_fatal(&e);
            (StatusCode::SERVICE_UNAVAILABLE, e.reason()).into_response()
        }
    }
}

#[derive(Deserialize)]
struct QueryParams {
    authors: Option<String>,
    kinds: Option<String>,
    d: Option<String>,
    t: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<String>,
    search: Option<String>,
}

/// Parse query parameters and return matching events as NDJSON.
async fn query(
    State(st): State<HttpState>,
    AxumQuery(params): AxumQuery<QueryParams>,
) -> Response {
    let mut f = Filter::default();
    f.authors = params.authors.map(csv_strings);
    f.kinds = params.kinds.map(csv_u16);
    if let Some(d) = params.d {
        f.tags.insert('d', vec![d]);
    }
    if let Some(t) = params.t {
        f.tags.insert('t', vec![t]);
    }
    f.since = params.since.as_deref().and_then(|v| v.parse().ok());
    f.until = params.until.as_deref().and_then(|v| v.parse().ok());
    f.limit = params.limit.as_deref().and_then(|v| v.parse().ok());
    f.search = params.search;
    let plan = st.relay.compile(std::slice::from_ref(&f));
    match st.relay.run_historical(&plan) {
        Ok(events) => ndjson(events),
        Err(e) => {
            abort_if_fatal(&e);
            (StatusCode::SERVICE_UNAVAILABLE, e.reason()).into_response()
        }
    }
}

/// Serve a stored blob by its SHA-256, content type sniffed from the bytes.
async fn get_blob(State(st): State<HttpState>, Path(name): Path<String>) -> Response {
    let Some(path) = st.blobs.resolve(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => Response::builder()
            .header(header::CONTENT_TYPE, sniff(&bytes))
            .header(header::CONTENT_LENGTH, bytes.len())
            .body(Body::from(bytes))
            .unwrap(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Stream an upload to a temp file, hash it, and adopt it into the store.
async fn upload(State(st): State<HttpState>, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    let mut writer = match st.blobs.writer() {
        Ok(w) => w,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let mut stream = req.into_body().into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };
        if let Err(e) = writer.write(&chunk) {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }
    let blob = match writer.finish(&st.blobs, None) {
        Ok(b) => b,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let file_name = blob
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| blob.sha256.clone());
    let uploaded = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Json(BlobDescriptor {
        url: format!("http://{host}/{file_name}"),
        sha256: blob.sha256,
        size: blob.size,
        content_type: blob.content_type.to_string(),
        uploaded,
    })
    .into_response()
}
