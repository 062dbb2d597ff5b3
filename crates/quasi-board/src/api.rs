//! HTTP surface of the board: WebFinger, actor document, outbox, inbox,
//! ledger views and the GitHub webhook.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use quasi_types::{BoardError, GENESIS_SLOTS};

use crate::node::{BoardNode, InboxOutcome};
use crate::webhook;

const AP_CONTENT_TYPE: &str = "application/activity+json";
const JRD_CONTENT_TYPE: &str = "application/jrd+json";

/// Inbound request bodies are bounded to 1 MiB.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<BoardNode>,
}

pub fn router(node: Arc<BoardNode>) -> Router {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/quasi-board", get(actor_document))
        .route("/quasi-board/outbox", get(outbox))
        .route("/quasi-board/inbox", post(inbox))
        .route("/quasi-board/ledger", get(ledger))
        .route("/quasi-board/ledger/verify", get(ledger_verify))
        .route("/quasi-board/github-webhook", post(github_webhook))
        .route("/quasi-board/health", get(health))
        .route("/metrics", get(metrics_text))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(AppState { node })
}

/// Bind and serve in a background task.
pub async fn start_api_server(node: Arc<BoardNode>, bind_addr: &str) -> Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(addr = bind_addr, "API server listening");

    let app = router(node);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            error!(error = %e, "API server failed");
        }
    }))
}

#[derive(Deserialize)]
struct WebfingerQuery {
    #[serde(default)]
    resource: String,
}

async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebfingerQuery>,
) -> Response {
    match state.node.webfinger_document(&query.resource) {
        Some(doc) => typed_json(StatusCode::OK, JRD_CONTENT_TYPE, &doc),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown resource"})),
        )
            .into_response(),
    }
}

async fn actor_document(State(state): State<AppState>) -> Response {
    typed_json(StatusCode::OK, AP_CONTENT_TYPE, &state.node.actor_document())
}

async fn outbox(State(state): State<AppState>) -> Response {
    let node = &state.node;
    let items = node.projector.notes(&node.ledger).await;
    let collection = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": node.outbox_url(),
        "totalItems": items.len(),
        "orderedItems": items,
    });
    typed_json(StatusCode::OK, AP_CONTENT_TYPE, &collection)
}

/// Activity intake. Signed requests are verified; unsigned requests are
/// honored only from loopback (local tooling).
async fn inbox(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let node = &state.node;
    let header_map = lowercase_headers(&headers);

    if header_map.contains_key("signature") {
        node.metrics.signature_verifications.inc();
        if let Err(e) = node
            .signatures
            .verify_request("POST", "/quasi-board/inbox", &header_map, &body)
            .await
        {
            node.metrics.signature_failures.inc();
            warn!(error = %e, peer = %addr, "Inbox signature rejected");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    } else if !addr.ip().is_loopback() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "signature required"})),
        )
            .into_response();
    }

    let activity: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid JSON: {}", e)})),
            )
                .into_response()
        }
    };

    match node.handle_activity(&activity).await {
        Ok(InboxOutcome::Recorded { status, entry }) => (
            StatusCode::OK,
            Json(json!({
                "status": status,
                "ledger_entry": entry.id,
                "entry_hash": entry.entry_hash,
            })),
        )
            .into_response(),
        Ok(InboxOutcome::Following) => (
            StatusCode::OK,
            Json(json!({"status": "following", "outbox": node.outbox_url()})),
        )
            .into_response(),
        Ok(InboxOutcome::Ignored) => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "accepted"})),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn ledger(State(state): State<AppState>) -> Json<Value> {
    let node = &state.node;
    let chain = node.ledger.chain().await;
    let report = node.ledger.verify_chain().await;

    Json(json!({
        "quasi:ledger": node.ledger_url(),
        "quasi:valid": report.valid,
        "quasi:entries": chain.len(),
        "quasi:genesisSlots": GENESIS_SLOTS,
        "quasi:slotsRemaining": node.ledger.slots_remaining().await,
        "chain": chain,
    }))
}

async fn ledger_verify(State(state): State<AppState>) -> Json<Value> {
    let node = &state.node;
    let report = node.ledger.verify_chain().await;
    let entries = node.ledger.len().await;

    let mut value = serde_json::to_value(&report).unwrap_or_else(|_| json!({"valid": false}));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("entries".to_string(), json!(entries));
    }
    Json(value)
}

async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok());
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());

    let (status, value) = webhook::process(&state.node, event, signature, &body).await;
    (status, Json(value)).into_response()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let node = &state.node;
    Json(json!({
        "status": "ok",
        "domain": node.domain(),
        "ledger_entries": node.ledger.len().await,
    }))
}

async fn metrics_text(State(state): State<AppState>) -> String {
    state.node.metrics.gather()
}

fn typed_json(status: StatusCode, content_type: &'static str, value: &Value) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => (status, [(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn error_response(e: &BoardError) -> Response {
    let status = match e {
        BoardError::Validation(_) => StatusCode::BAD_REQUEST,
        BoardError::Auth(_) => StatusCode::UNAUTHORIZED,
        BoardError::Conflict { .. } => StatusCode::CONFLICT,
        BoardError::AlreadyDone(_) => StatusCode::GONE,
        BoardError::Storage(_) | BoardError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        BoardError::Upstream(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({"error": e.to_string()}))).into_response()
}
