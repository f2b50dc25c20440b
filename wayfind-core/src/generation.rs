//! Generation provider client.
//!
//! The provider yields a finite, lazy sequence of `GenerationChunk`s ending
//! in exactly one stop or error chunk (an abrupt end is treated as an
//! implicit error by the session driver). The shipped implementation speaks
//! an Anthropic-style streaming messages API over SSE; the decoder is a
//! separate struct so the wire parsing is testable without a network.

use crate::models::conversation::{ChatMessage, Role};
use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Queries at or below these sizes route to the fast model.
const FAST_MODEL_MAX_WORDS: usize = 12;
const FAST_MODEL_MAX_CHARS: usize = 80;

/// Heuristic "prefer fast model" signal: short, single-line queries don't
/// need the stronger (slower, costlier) model.
pub fn prefers_fast_model(query: &str) -> bool {
    let query = query.trim();
    query.len() <= FAST_MODEL_MAX_CHARS
        && query.split_whitespace().count() <= FAST_MODEL_MAX_WORDS
        && !query.contains('\n')
}

/// Usage figures reported by the provider mid-stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub output_tokens: Option<u32>,
}

/// One element of the provider's lazy chunk sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationChunk {
    Content { text: String, model: String },
    Metadata { usage: Usage },
    Stop { stop_reason: String },
    Error { message: String },
}

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Missing API key")]
    MissingApiKey,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = GenerationChunk> + Send>>;

/// Abstraction over the generation provider.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Open a streaming generation for `query` grounded in `history`
    /// (oldest-first). `prefer_fast` selects the cheaper model.
    async fn generate(
        &self,
        query: &str,
        history: &[ChatMessage],
        prefer_fast: bool,
    ) -> Result<ChunkStream, GenerationError>;
}

// ============================================================================
// SSE wire decoding
// ============================================================================

/// Extract complete SSE event payloads from `buf`, leaving any partial event
/// in place. Returns the concatenated `data:` payload of each event.
pub fn drain_sse_events(buf: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();

    while let Some(pos) = buf.find("\n\n") {
        let block: String = buf[..pos].to_string();
        buf.drain(..pos + 2);

        let mut data_lines = Vec::new();
        for line in block.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start().to_string());
            }
        }
        if !data_lines.is_empty() {
            payloads.push(data_lines.join("\n"));
        }
    }

    payloads
}

/// Move the longest decodable UTF-8 prefix of `pending` into `out`.
///
/// Network chunk boundaries fall anywhere, including inside a multibyte
/// character; the incomplete suffix stays in `pending` until its remaining
/// bytes arrive. Genuinely invalid bytes become one replacement character so
/// the stream keeps moving.
pub fn drain_valid_utf8(pending: &mut Vec<u8>, out: &mut String) {
    loop {
        match std::str::from_utf8(pending) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                return;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                if let Ok(s) = std::str::from_utf8(&pending[..valid]) {
                    out.push_str(s);
                }
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SseEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<SseMessageStart>,
    #[serde(default)]
    delta: Option<SseDelta>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<SseError>,
}

#[derive(Debug, Deserialize)]
struct SseMessageStart {
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseError {
    message: String,
}

/// Stateful decoder from SSE event payloads to `GenerationChunk`s.
///
/// The model identifier arrives once in `message_start` and the stop reason
/// in `message_delta`, so the decoder carries both across events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    model: Option<String>,
    stop_reason: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one event payload. Returns `None` for events that don't map to
    /// a chunk (pings, message_start, content block boundaries).
    pub fn decode(&mut self, payload: &str) -> Option<GenerationChunk> {
        let envelope: SseEnvelope = match serde_json::from_str(payload) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping undecodable stream event");
                return None;
            }
        };

        match envelope.kind.as_str() {
            "message_start" => {
                self.model = envelope.message.and_then(|m| m.model);
                None
            }
            "content_block_delta" => {
                let text = envelope.delta.and_then(|d| d.text)?;
                Some(GenerationChunk::Content {
                    text,
                    model: self.model.clone().unwrap_or_default(),
                })
            }
            "message_delta" => {
                if let Some(reason) = envelope.delta.and_then(|d| d.stop_reason) {
                    self.stop_reason = Some(reason);
                }
                envelope
                    .usage
                    .map(|usage| GenerationChunk::Metadata { usage })
            }
            "message_stop" => Some(GenerationChunk::Stop {
                stop_reason: self
                    .stop_reason
                    .take()
                    .unwrap_or_else(|| "end_turn".to_string()),
            }),
            "error" => Some(GenerationChunk::Error {
                message: envelope
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unknown provider error".to_string()),
            }),
            _ => None,
        }
    }
}

// ============================================================================
// AnthropicGenerationClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub fast_model: String,
    pub max_tokens: u32,
}

impl AnthropicConfig {
    pub fn new(api_key: Option<String>, model: String, fast_model: String, max_tokens: u32) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .unwrap_or_default();

        Self {
            api_key,
            model,
            fast_model,
            max_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

/// Streaming generation client for an Anthropic-style messages API.
#[derive(Debug, Clone)]
pub struct AnthropicGenerationClient {
    client: Client,
    config: AnthropicConfig,
    base_url: String,
}

impl AnthropicGenerationClient {
    pub fn new(config: AnthropicConfig) -> Result<Self, GenerationError> {
        Self::with_base_url(config, "https://api.anthropic.com".to_string())
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(
        config: AnthropicConfig,
        base_url: String,
    ) -> Result<Self, GenerationError> {
        if config.api_key.is_empty() {
            return Err(GenerationError::MissingApiKey);
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    fn build_request(&self, query: &str, history: &[ChatMessage], prefer_fast: bool) -> MessagesRequest {
        let mut messages: Vec<WireMessage> = history
            .iter()
            .filter_map(|m| match m.role {
                Role::User => Some(WireMessage {
                    role: "user",
                    content: m.content.clone(),
                }),
                Role::Assistant => Some(WireMessage {
                    role: "assistant",
                    content: m.content.clone(),
                }),
                Role::System => None,
            })
            .collect();

        messages.push(WireMessage {
            role: "user",
            content: query.to_string(),
        });

        let model = if prefer_fast {
            self.config.fast_model.clone()
        } else {
            self.config.model.clone()
        };

        MessagesRequest {
            model,
            max_tokens: self.config.max_tokens,
            stream: true,
            messages,
        }
    }
}

#[async_trait]
impl GenerationProvider for AnthropicGenerationClient {
    async fn generate(
        &self,
        query: &str,
        history: &[ChatMessage],
        prefer_fast: bool,
    ) -> Result<ChunkStream, GenerationError> {
        let request = self.build_request(query, history, prefer_fast);
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let (tx, rx) = mpsc::channel::<GenerationChunk>(32);

        tokio::spawn(async move {
            use futures::StreamExt;

            let mut byte_stream = response.bytes_stream();
            let mut pending: Vec<u8> = Vec::new();
            let mut buf = String::new();
            let mut decoder = SseDecoder::new();

            while let Some(part) = byte_stream.next().await {
                let bytes = match part {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(GenerationChunk::Error {
                                message: format!("stream transport error: {e}"),
                            })
                            .await;
                        return;
                    }
                };

                pending.extend_from_slice(&bytes);
                drain_valid_utf8(&mut pending, &mut buf);

                for payload in drain_sse_events(&mut buf) {
                    if let Some(chunk) = decoder.decode(&payload) {
                        let terminal = matches!(
                            chunk,
                            GenerationChunk::Stop { .. } | GenerationChunk::Error { .. }
                        );
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                        if terminal {
                            return;
                        }
                    }
                }
            }
            // Channel closes here; a sequence without a terminal chunk is the
            // session driver's implicit-error case.
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn fast_model_heuristic() {
        assert!(prefers_fast_model("best beaches in Portugal?"));
        assert!(!prefers_fast_model(
            "I am planning a three week honeymoon across southeast Asia with my partner \
             and want a detailed day by day itinerary with budget estimates"
        ));
        assert!(!prefers_fast_model("short\nbut multi-line"));
    }

    #[test]
    fn drain_handles_partial_and_multiple_events() {
        let mut buf = String::from(
            "event: ping\ndata: {\"type\":\"ping\"}\n\ndata: {\"a\":1}\n\ndata: {\"par",
        );
        let events = drain_sse_events(&mut buf);
        assert_eq!(events, vec!["{\"type\":\"ping\"}", "{\"a\":1}"]);
        assert_eq!(buf, "data: {\"par");

        buf.push_str("tial\":2}\n\n");
        let events = drain_sse_events(&mut buf);
        assert_eq!(events, vec!["{\"partial\":2}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_multibyte_char_survives_chunk_boundary() {
        let mut pending: Vec<u8> = Vec::new();
        let mut out = String::new();

        // "café" split mid-character across two network chunks
        pending.extend_from_slice(b"caf\xC3");
        drain_valid_utf8(&mut pending, &mut out);
        assert_eq!(out, "caf");
        assert_eq!(pending, vec![0xC3]);

        pending.extend_from_slice(b"\xA9 au lait");
        drain_valid_utf8(&mut pending, &mut out);
        assert_eq!(out, "café au lait");
        assert!(pending.is_empty());
    }

    #[test]
    fn invalid_byte_becomes_single_replacement_char() {
        let mut pending: Vec<u8> = b"ok\xFFok".to_vec();
        let mut out = String::new();
        drain_valid_utf8(&mut pending, &mut out);
        assert_eq!(out, "ok\u{FFFD}ok");
        assert!(pending.is_empty());
    }

    #[test]
    fn decoder_maps_events_to_chunks() {
        let mut decoder = SseDecoder::new();

        assert_eq!(
            decoder.decode(r#"{"type":"message_start","message":{"model":"sonnet-x"}}"#),
            None
        );
        assert_eq!(
            decoder.decode(
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello"}}"#
            ),
            Some(GenerationChunk::Content {
                text: "Hello".to_string(),
                model: "sonnet-x".to_string(),
            })
        );
        assert_eq!(
            decoder.decode(
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#
            ),
            Some(GenerationChunk::Metadata {
                usage: Usage {
                    output_tokens: Some(7)
                }
            })
        );
        assert_eq!(
            decoder.decode(r#"{"type":"message_stop"}"#),
            Some(GenerationChunk::Stop {
                stop_reason: "end_turn".to_string()
            })
        );
    }

    #[test]
    fn decoder_maps_error_events() {
        let mut decoder = SseDecoder::new();
        assert_eq!(
            decoder.decode(r#"{"type":"error","error":{"type":"overloaded","message":"busy"}}"#),
            Some(GenerationChunk::Error {
                message: "busy".to_string()
            })
        );
    }

    #[test]
    fn decoder_skips_garbage_and_pings() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.decode("not json"), None);
        assert_eq!(decoder.decode(r#"{"type":"ping"}"#), None);
        assert_eq!(
            decoder.decode(r#"{"type":"content_block_start","index":0}"#),
            None
        );
    }

    fn sse_body() -> String {
        [
            r#"data: {"type":"message_start","message":{"model":"haiku-x"}}"#,
            "",
            r#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello"}}"#,
            "",
            r#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":" world"}}"#,
            "",
            r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            "",
            r#"data: {"type":"message_stop"}"#,
            "",
            "",
        ]
        .join("\n")
    }

    fn test_client(base_url: String) -> AnthropicGenerationClient {
        AnthropicGenerationClient::with_base_url(
            AnthropicConfig {
                api_key: "test-key".to_string(),
                model: "sonnet-x".to_string(),
                fast_model: "haiku-x".to_string(),
                max_tokens: 512,
            },
            base_url,
        )
        .expect("Failed to create client")
    }

    #[tokio::test]
    async fn generate_yields_full_chunk_sequence() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body()),
            )
            .mount(&mock_server)
            .await;

        let client = test_client(mock_server.uri());
        let stream = client
            .generate("hi", &[], true)
            .await
            .expect("generate should open a stream");

        let chunks: Vec<GenerationChunk> = stream.collect().await;
        assert_eq!(chunks.len(), 4);
        assert_eq!(
            chunks[0],
            GenerationChunk::Content {
                text: "Hello".to_string(),
                model: "haiku-x".to_string()
            }
        );
        assert_eq!(
            chunks[3],
            GenerationChunk::Stop {
                stop_reason: "end_turn".to_string()
            }
        );
    }

    #[tokio::test]
    async fn generate_surfaces_http_error_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&mock_server)
            .await;

        let client = test_client(mock_server.uri());
        match client.generate("hi", &[], false).await {
            Err(GenerationError::Api { code, .. }) => assert_eq!(code, 401),
            other => panic!("Expected Api error, got {:?}", other.map(|_| "stream")),
        }
    }
}
