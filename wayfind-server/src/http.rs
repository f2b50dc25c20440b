//! Wayfind HTTP API
//!
//! Axum-based HTTP server exposing search, embedding job submission, and the
//! streaming chat endpoint.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a
//! directly testable inner function. The chat endpoint is the exception; it
//! spawns a session task and hands axum the receiving end of the event
//! channel as an SSE stream.
//!
//! Endpoints:
//! - GET  /health  — health check with DB status
//! - GET  /version — server version info
//! - POST /search  — semantic entity search
//! - POST /embed   — queue an embedding job (202 Accepted)
//! - POST /chat    — streaming answer via server-sent events

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;
use wayfind_core::embeddings::EmbeddingBackend;
use wayfind_core::generation::GenerationProvider;
use wayfind_core::models::conversation::NewMessage;
use wayfind_core::models::entity::EntityKind;
use wayfind_core::store::MessageStore;
use wayfind_core::WayfindConfig;

use crate::subsystems::embedder::EmbeddingJob;
use crate::subsystems::retrieve;
use crate::subsystems::session::{run_session, ChannelSink, StreamEvent};

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub pool: PgPool,
    pub config: WayfindConfig,
    pub messages: Arc<dyn MessageStore>,
    pub embedder: Arc<dyn EmbeddingBackend>,
    pub provider: Arc<dyn GenerationProvider>,
    pub jobs: mpsc::Sender<EmbeddingJob>,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/search", post(search_handler))
        .route("/embed", post(embed_handler))
        .route("/chat", post(chat_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.service.host, state.config.service.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Wayfind HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    #[serde(rename = "entityKind")]
    pub entity_kind: Option<String>,
    #[serde(rename = "entityId")]
    pub entity_id: Option<Uuid>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub query: Option<String>,
    #[serde(rename = "conversationId")]
    pub conversation_id: Option<Uuid>,
}

fn error_body(msg: impl Into<String>) -> serde_json::Value {
    serde_json::json!({
        "error": msg.into(),
        "status": "error",
    })
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check — queries DB and returns (status_code, json_body).
pub async fn health_inner(pool: &PgPool) -> (StatusCode, serde_json::Value) {
    let pg_ver = match wayfind_core::db::health_check(pool).await {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                }),
            );
        }
    };

    let pgvector_ver = match wayfind_core::db::check_pgvector(pool).await {
        Ok(v) => v,
        Err(e) => format!("unavailable: {}", e),
    };

    let schema = match wayfind_core::db::check_embedding_columns(pool).await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("degraded: {}", e),
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "postgresql": pg_ver,
            "pgvector": pgvector_ver,
            "embedding_schema": schema,
        }),
    )
}

/// Inner version — returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "wayfind/1",
    })
}

/// Inner search — validates the query and runs retrieval.
pub async fn search_inner(
    pool: &PgPool,
    backend: &dyn EmbeddingBackend,
    req: SearchRequest,
) -> (StatusCode, serde_json::Value) {
    let query = match req.query {
        Some(q) if !q.trim().is_empty() => q,
        _ => {
            return (StatusCode::BAD_REQUEST, error_body("query field is required"));
        }
    };

    let start = Instant::now();

    match retrieve::search_entities(&query, req.limit, pool, backend).await {
        Ok(mut data) => {
            let status = if data.get("status").and_then(|s| s.as_str()) == Some("error") {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                if let Some(obj) = data.as_object_mut() {
                    obj.insert(
                        "took_ms".to_string(),
                        serde_json::json!(start.elapsed().as_millis() as u64),
                    );
                }
                StatusCode::OK
            };
            (status, data)
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body(e.to_string()),
        ),
    }
}

/// Inner embed — validates the job and pushes it onto the queue.
///
/// Submission is fire-and-forget: a well-formed job gets 202 regardless of
/// whether the entity exists; the worker resolves that.
pub async fn embed_inner(
    jobs: &mpsc::Sender<EmbeddingJob>,
    req: EmbedRequest,
) -> (StatusCode, serde_json::Value) {
    let kind = match req.entity_kind {
        Some(k) => k,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("entityKind field is required"),
            );
        }
    };
    if EntityKind::parse(&kind).is_none() {
        return (
            StatusCode::BAD_REQUEST,
            error_body(format!("unknown entity kind: {}", kind)),
        );
    }
    let entity_id = match req.entity_id {
        Some(id) => id,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("entityId field is required"),
            );
        }
    };

    let job = EmbeddingJob {
        kind,
        entity_id,
        force: req.force,
    };

    match jobs.try_send(job) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            serde_json::json!({
                "queued": true,
                "entityId": entity_id,
            }),
        ),
        Err(mpsc::error::TrySendError::Full(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("embedding queue is full"),
        ),
        Err(mpsc::error::TrySendError::Closed(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("embedding worker is not running"),
        ),
    }
}

/// Resolve the conversation and persist the user turn before streaming.
pub async fn prepare_chat(
    store: &dyn MessageStore,
    req: ChatRequest,
) -> Result<(Uuid, String), (StatusCode, serde_json::Value)> {
    let query = match req.query {
        Some(q) if !q.trim().is_empty() => q,
        _ => {
            return Err((StatusCode::BAD_REQUEST, error_body("query field is required")));
        }
    };

    let conversation_id = match req.conversation_id {
        Some(id) => id,
        None => store.create_conversation().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to create conversation");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("failed to create conversation"),
            )
        })?,
    };

    store
        .insert_message(conversation_id, &NewMessage::user(&query))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to persist user message");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("failed to persist message"),
            )
        })?;

    Ok((conversation_id, query))
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.pool).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn search_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<SearchRequest>,
) -> impl IntoResponse {
    let (status, body) = search_inner(&state.pool, state.embedder.as_ref(), req).await;
    (status, Json(body))
}

pub async fn embed_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<EmbedRequest>,
) -> impl IntoResponse {
    let (status, body) = embed_inner(&state.jobs, req).await;
    (status, Json(body))
}

/// Streaming chat: persists the user turn, spawns the session driver, and
/// relays its events as SSE until the terminal event closes the channel.
pub async fn chat_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<ChatRequest>,
) -> axum::response::Response {
    let (conversation_id, query) = match prepare_chat(state.messages.as_ref(), req).await {
        Ok(prepared) => prepared,
        Err((status, body)) => return (status, Json(body)).into_response(),
    };

    let (tx, rx) = mpsc::channel::<StreamEvent>(32);

    let messages = state.messages.clone();
    let provider = state.provider.clone();
    let chat_config = state.config.chat.clone();
    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        run_session(
            &query,
            conversation_id,
            messages.as_ref(),
            provider.as_ref(),
            &mut sink,
            &chat_config,
        )
        .await;
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let sse = Event::default().json_data(&event);
        Some((sse, rx))
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ============================================================================
// Unit Tests — call inner functions directly
// ============================================================================
