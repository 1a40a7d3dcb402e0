//! Anthropic Messages API Transport
//!
//! Blocking and server-sent-event streaming calls against `/v1/messages`.
//! Images are placed before the text block in the user turn.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    EventStream, ImageAttachment, ModelReply, ModelRequest, ModelTransport, StopReason,
    StreamEvent, TokenUsage,
};
use crate::config::LlmConfig;
use crate::constants::network as net_constants;
use crate::types::{ErrorCategory, ErrorClassifier, LlmError, LoomError, Result};

const PROVIDER: &str = "anthropic";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic transport with secure API key handling
pub struct AnthropicTransport {
    /// Never exposed in logs or debug output
    api_key: SecretString,
    endpoint: url::Url,
    model: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicTransport")
            .field("api_key", &"[REDACTED]")
            .field("endpoint", &self.endpoint.as_str())
            .field("model", &self.model)
            .finish()
    }
}

impl AnthropicTransport {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                LoomError::Config(
                    "Anthropic API key not found. Set ANTHROPIC_API_KEY env var or llm.api_key"
                        .to_string(),
                )
            })?;

        let mut base = config.api_base.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = url::Url::parse(&base)
            .and_then(|u| u.join("v1/messages"))
            .map_err(|e| LoomError::Config(format!("Invalid llm.api_base '{}': {}", base, e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(net_constants::CONNECTION_TIMEOUT_SECS))
            .build()
            .map_err(|e| LoomError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key: SecretString::from(api_key),
            endpoint,
            model: config.model.clone(),
            client,
        })
    }

    fn build_body<'a>(&'a self, request: &'a ModelRequest, stream: bool) -> MessagesRequest<'a> {
        // Images first; some backends are sensitive to content ordering
        let mut content: Vec<ContentPart<'a>> = request
            .images
            .iter()
            .map(|img: &'a ImageAttachment| ContentPart::Image {
                source: ImageSource {
                    source_type: "base64",
                    media_type: &img.media_type,
                    data: &img.data_base64,
                },
            })
            .collect();
        content.push(ContentPart::Text {
            text: &request.user,
        });

        MessagesRequest {
            model: &self.model,
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages: vec![UserMessage {
                role: "user",
                content,
            }],
            stream,
        }
    }

    async fn post(&self, body: &MessagesRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ErrorClassifier::classify_request_error(&e, PROVIDER))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorEnvelope>(&text)
            .map(|e| format!("{}: {}", e.error.error_type, e.error.message))
            .unwrap_or(text);

        warn!(status = status.as_u16(), "Anthropic API error: {}", message);
        let mut err = ErrorClassifier::classify_http_status(
            status.as_u16(),
            &format!("Anthropic API error ({}): {}", status, message),
            PROVIDER,
        );
        if let Some(delay) = retry_after {
            err = err.retry_after(delay);
        }
        Err(err.into())
    }
}

#[async_trait]
impl ModelTransport for AnthropicTransport {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &ModelRequest) -> Result<ModelReply> {
        info!(
            "Calling Anthropic (model: {}, max_tokens: {})",
            self.model, request.max_output_tokens
        );
        let body = self.build_body(request, false);
        let response = self.post(&body).await?;

        let parsed: MessagesResponse = response.json().await.map_err(|e| {
            LlmError::with_provider(
                ErrorCategory::Transient,
                format!("Failed to decode Anthropic response: {}", e),
                PROVIDER,
            )
        })?;

        let text = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text.as_str()),
                ResponseBlock::Other => None,
            })
            .collect::<String>();

        debug!(
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            "Anthropic response received"
        );

        Ok(ModelReply {
            text,
            usage: TokenUsage::new(parsed.usage.input_tokens, parsed.usage.output_tokens),
            stop: StopReason::from_api(parsed.stop_reason.as_deref()),
        })
    }

    async fn send_streaming(&self, request: &ModelRequest) -> Result<EventStream> {
        info!(
            "Streaming from Anthropic (model: {}, max_tokens: {})",
            self.model, request.max_output_tokens
        );
        let body = self.build_body(request, true);
        let response = self.post(&body).await?;

        let bytes: BoxStream<'static, std::result::Result<Vec<u8>, reqwest::Error>> = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();

        Ok(sse_events(bytes))
    }
}

// =============================================================================
// SSE decoding
// =============================================================================

struct SseState<E> {
    bytes: BoxStream<'static, std::result::Result<Vec<u8>, E>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<StreamEvent>>,
    usage: TokenUsage,
    stop: Option<String>,
    finished: bool,
}

/// Decode an SSE byte stream into ordered stream events.
///
/// Fails with a transport error if the body ends before `message_stop`.
fn sse_events<E>(bytes: BoxStream<'static, std::result::Result<Vec<u8>, E>>) -> EventStream
where
    E: std::fmt::Display + Send + 'static,
{
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        usage: TokenUsage::default(),
        stop: None,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                if event.is_err() || matches!(event, Ok(StreamEvent::Completed { .. })) {
                    state.finished = true;
                    state.pending.clear();
                }
                return Some((event, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    while let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line);
                        if let Some(event) = decode_line(line.trim_end(), &mut state) {
                            state.pending.push_back(event);
                        }
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    let err = LlmError::with_provider(
                        ErrorCategory::Network,
                        format!("Stream interrupted: {}", e),
                        PROVIDER,
                    );
                    return Some((Err(err.into()), state));
                }
                None => {
                    state.finished = true;
                    let err = LlmError::with_provider(
                        ErrorCategory::Transient,
                        "Stream ended before message_stop",
                        PROVIDER,
                    );
                    return Some((Err(err.into()), state));
                }
            }
        }
    })
    .boxed()
}

fn decode_line<E>(line: &str, state: &mut SseState<E>) -> Option<Result<StreamEvent>> {
    // `event:` lines repeat the type carried in the data payload
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    let event: SseEvent = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(e) => {
            debug!("Skipping undecodable SSE payload: {}", e);
            return None;
        }
    };

    match event {
        SseEvent::MessageStart { message } => {
            state.usage.input_tokens = message.usage.input_tokens;
            state.usage.output_tokens = message.usage.output_tokens;
            None
        }
        SseEvent::ContentBlockDelta { delta } => match delta {
            Delta::TextDelta { text } => Some(Ok(StreamEvent::TextDelta(text))),
            Delta::Other => None,
        },
        SseEvent::MessageDelta { delta, usage } => {
            if let Some(reason) = delta.stop_reason {
                state.stop = Some(reason);
            }
            // output_tokens here is cumulative for the message
            if let Some(usage) = usage {
                state.usage.output_tokens = usage.output_tokens;
                if let Some(input) = usage.input_tokens {
                    state.usage.input_tokens = input;
                }
            }
            None
        }
        SseEvent::MessageStop => Some(Ok(StreamEvent::Completed {
            usage: state.usage,
            stop: StopReason::from_api(state.stop.as_deref()),
        })),
        SseEvent::Error { error } => Some(Err(ErrorClassifier::classify_stream_error(
            &error.error_type,
            &error.message,
            PROVIDER,
        )
        .into())),
        SseEvent::Other => None,
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<UserMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Image { source: ImageSource<'a> },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        usage: Option<DeltaUsage>,
    },
    MessageStop,
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
