//! Streaming response session.
//!
//! Owns one query's lifecycle: INIT -> READY -> STREAMING -> {COMPLETE |
//! ERROR}. The driver loop is the only place with persistence and emission
//! side effects; the provider hands it a side-effect-free chunk stream.
//!
//! Checkpointing rules:
//! - the assistant message row is created on the first non-empty content,
//!   never before;
//! - it is re-persisted every `checkpoint_chars` of accumulated content, not
//!   on every chunk, bounding both crash loss and write amplification;
//! - at the instant of the terminal event the stored content equals the
//!   concatenation of every emitted token text.
//!
//! Failures never escape as raw errors: provider error chunks, local faults,
//! abrupt stream ends, and checkpoint write failures all converge on the same
//! path that persists a fresh apology message (the partial row is left as-is)
//! and emits a single `error` event. A failed emission means the client is
//! gone; the session stops emitting and still finishes its cleanup writes.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;
use wayfind_core::config::ChatConfig;
use wayfind_core::generation::{
    prefers_fast_model, GenerationChunk, GenerationProvider,
};
use wayfind_core::models::conversation::{NewMessage, Role};
use wayfind_core::store::MessageStore;

/// Fixed user-facing text for any failed session. Technical detail goes into
/// message metadata and logs, never to the end user.
pub const APOLOGY_TEXT: &str =
    "I'm sorry, something went wrong while answering your question. Please try again.";

/// Typed event vocabulary of the streaming wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Ready,
    Start,
    Token {
        text: String,
    },
    Complete {
        #[serde(rename = "stopReason")]
        stop_reason: String,
    },
    Error {
        message: String,
    },
}

/// The caller's side of the event channel went away.
#[derive(Error, Debug)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Where session events go. One implementation per transport.
#[async_trait]
pub trait EventSink: Send {
    async fn emit(&mut self, event: StreamEvent) -> Result<(), SinkClosed>;
}

/// Sink backed by an mpsc channel; send failure means client disconnect.
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}

/// Exactly one terminal outcome per session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Complete {
        stop_reason: String,
    },
    /// The answer was fully persisted but the client went away before the
    /// `complete` event could be delivered. The conversation is intact.
    Disconnected {
        stop_reason: String,
    },
    Error {
        message: String,
    },
}

/// In-memory assistant message under construction.
#[derive(Debug, Default)]
struct AssistantDraft {
    buffer: String,
    model: Option<String>,
    token_count: Option<i32>,
    message_id: Option<Uuid>,
    checkpointed_len: usize,
}

/// Drive one streaming session to its terminal outcome.
pub async fn run_session(
    query: &str,
    conversation_id: Uuid,
    store: &dyn MessageStore,
    provider: &dyn GenerationProvider,
    sink: &mut dyn EventSink,
    config: &ChatConfig,
) -> SessionOutcome {
    // INIT -> READY: establish context before any provider call.
    let mut history = match store
        .recent_messages(conversation_id, config.history_limit as i64)
        .await
    {
        Ok(history) => history,
        Err(e) => {
            let detail = format!("failed to load conversation history: {e}");
            return fail(store, conversation_id, Some(sink), None, detail).await;
        }
    };
    // The caller persists the user turn before the session starts, so the
    // freshly loaded history ends with the query itself. Drop it; the
    // provider request carries the query exactly once.
    if history
        .last()
        .map_or(false, |m| m.role == Role::User && m.content == query)
    {
        history.pop();
    }
    let prefer_fast = prefers_fast_model(query);

    if sink.emit(StreamEvent::Ready).await.is_err() {
        return fail(store, conversation_id, None, None, "client disconnected".into()).await;
    }

    // READY -> STREAMING: open the lazy chunk sequence.
    if sink.emit(StreamEvent::Start).await.is_err() {
        return fail(store, conversation_id, None, None, "client disconnected".into()).await;
    }

    let mut stream = match provider.generate(query, &history, prefer_fast).await {
        Ok(stream) => stream,
        Err(e) => {
            let detail = format!("generation provider refused the request: {e}");
            return fail(store, conversation_id, Some(sink), None, detail).await;
        }
    };

    let mut draft = AssistantDraft::default();
    let checkpoint_chars = config.checkpoint_chars as usize;

    while let Some(chunk) = stream.next().await {
        match chunk {
            GenerationChunk::Content { text, model } => {
                if draft.model.is_none() && !model.is_empty() {
                    draft.model = Some(model);
                }
                draft.buffer.push_str(&text);

                if sink.emit(StreamEvent::Token { text }).await.is_err() {
                    // Client gone: stop emitting, still leave a terminal record.
                    return fail(
                        store,
                        conversation_id,
                        None,
                        Some(&draft),
                        "client disconnected".into(),
                    )
                    .await;
                }

                // The checkpoint write completes before the next chunk is
                // consumed; at most one write is outstanding per session.
                if let Err(e) = checkpoint(store, conversation_id, &mut draft, checkpoint_chars).await
                {
                    let detail = format!("checkpoint write failed: {e}");
                    return fail(store, conversation_id, Some(sink), Some(&draft), detail).await;
                }
            }
            GenerationChunk::Metadata { usage } => {
                // Recorded in memory only; flushed with the next persistence.
                if let Some(tokens) = usage.output_tokens {
                    draft.token_count = Some(tokens as i32);
                }
            }
            GenerationChunk::Stop { stop_reason } => {
                if let Err(e) = finalize(store, conversation_id, &draft).await {
                    let detail = format!("finalize write failed: {e}");
                    return fail(store, conversation_id, Some(sink), Some(&draft), detail).await;
                }
                if sink
                    .emit(StreamEvent::Complete {
                        stop_reason: stop_reason.clone(),
                    })
                    .await
                    .is_err()
                {
                    // The answer is already persisted; this is not a failure.
                    tracing::info!(
                        conversation = %conversation_id,
                        "Client disconnected after the answer was finalized"
                    );
                    return SessionOutcome::Disconnected { stop_reason };
                }
                tracing::info!(
                    conversation = %conversation_id,
                    stop_reason = %stop_reason,
                    chars = draft.buffer.len(),
                    "Streaming session complete"
                );
                return SessionOutcome::Complete { stop_reason };
            }
            GenerationChunk::Error { message } => {
                return fail(store, conversation_id, Some(sink), Some(&draft), message).await;
            }
        }
    }

    // The sequence ended without a stop or error chunk.
    fail(
        store,
        conversation_id,
        Some(sink),
        Some(&draft),
        "generation stream ended unexpectedly".into(),
    )
    .await
}

/// Persist the draft according to the checkpoint cadence.
async fn checkpoint(
    store: &dyn MessageStore,
    conversation_id: Uuid,
    draft: &mut AssistantDraft,
    checkpoint_chars: usize,
) -> Result<(), wayfind_core::store::StoreError> {
    match draft.message_id {
        None => {
            // no persisted record -> has content: persist immediately
            if !draft.buffer.is_empty() {
                let id = store
                    .insert_message(
                        conversation_id,
                        &NewMessage {
                            role: Role::Assistant,
                            content: draft.buffer.clone(),
                            model: draft.model.clone(),
                            token_count: draft.token_count,
                            metadata: None,
                        },
                    )
                    .await?;
                draft.message_id = Some(id);
                draft.checkpointed_len = draft.buffer.len();
            }
        }
        Some(id) => {
            if draft.buffer.len() - draft.checkpointed_len >= checkpoint_chars {
                store
                    .update_message(id, &draft.buffer, draft.token_count)
                    .await?;
                draft.checkpointed_len = draft.buffer.len();
            }
        }
    }
    Ok(())
}

/// Terminal persist on a stop chunk: create if never created, else update.
async fn finalize(
    store: &dyn MessageStore,
    conversation_id: Uuid,
    draft: &AssistantDraft,
) -> Result<(), wayfind_core::store::StoreError> {
    match draft.message_id {
        Some(id) => {
            store
                .update_message(id, &draft.buffer, draft.token_count)
                .await
        }
        None => {
            // A contentless stream still leaves its terminal artifact.
            store
                .insert_message(
                    conversation_id,
                    &NewMessage {
                        role: Role::Assistant,
                        content: draft.buffer.clone(),
                        model: draft.model.clone(),
                        token_count: draft.token_count,
                        metadata: None,
                    },
                )
                .await
                .map(|_| ())
        }
    }
}

/// Error cleanup: persist a fresh apology message (never an edit of the
/// partial one), emit the single `error` event if the sink is still open.
async fn fail(
    store: &dyn MessageStore,
    conversation_id: Uuid,
    sink: Option<&mut dyn EventSink>,
    draft: Option<&AssistantDraft>,
    detail: String,
) -> SessionOutcome {
    tracing::warn!(conversation = %conversation_id, error = %detail, "Streaming session failed");

    let apology = NewMessage {
        role: Role::Assistant,
        content: APOLOGY_TEXT.to_string(),
        model: draft.and_then(|d| d.model.clone()),
        token_count: None,
        metadata: Some(serde_json::json!({ "error": detail })),
    };

    if let Err(e) = store.insert_message(conversation_id, &apology).await {
        tracing::error!(
            conversation = %conversation_id,
            error = %e,
            "Failed to persist apology message"
        );
    }

    if let Some(sink) = sink {
        let _ = sink
            .emit(StreamEvent::Error {
                message: detail.clone(),
            })
            .await;
    }

    SessionOutcome::Error { message: detail }
}

// ============================================================================
// TESTS
// ============================================================================
