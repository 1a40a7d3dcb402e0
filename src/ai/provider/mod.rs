//! Model Transport Abstraction
//!
//! Defines the `ModelTransport` trait: send system + user text (optionally
//! with images) and get back text plus token usage. Transports never parse
//! structured output and never persist anything.
//!
//! Two call shapes are exposed: a blocking call returning the full reply,
//! and a streaming call returning ordered text fragments followed by a
//! terminal event carrying usage and the stop reason.

mod anthropic;

pub use anthropic::AnthropicTransport;

// Re-export error types from centralized location
pub use crate::types::{ErrorCategory, ErrorClassifier, LlmError};

use async_trait::async_trait;
use base64::Engine;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::types::{LoomError, Result};

// =============================================================================
// Request / Reply
// =============================================================================

/// Base64 image sent ahead of the text content
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    /// e.g. "image/png"
    pub media_type: String,
    pub data_base64: String,
}

impl std::fmt::Debug for ImageAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAttachment")
            .field("media_type", &self.media_type)
            .field("bytes_base64", &self.data_base64.len())
            .finish()
    }
}

impl ImageAttachment {
    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            data_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Load an image file, inferring the media type from its extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let media_type = match ext.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            other => {
                return Err(LoomError::Config(format!(
                    "Unsupported image type '{}' for {}",
                    other,
                    path.display()
                )));
            }
        };
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(media_type, &bytes))
    }
}

/// One model call
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    pub user: String,
    pub images: Vec<ImageAttachment>,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// Token usage metrics for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens (prompt)
    pub input_tokens: u32,
    /// Output tokens (response)
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens used (input + output)
    pub fn total(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

/// Why the model stopped generating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    /// Content-safety stop
    Refusal,
    Other(String),
}

impl StopReason {
    pub fn from_api(reason: Option<&str>) -> Self {
        match reason {
            Some("end_turn") | None => Self::EndTurn,
            Some("max_tokens") => Self::MaxTokens,
            Some("stop_sequence") => Self::StopSequence,
            Some("refusal") => Self::Refusal,
            Some(other) => Self::Other(other.to_string()),
        }
    }

    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Refusal)
    }
}

/// Full reply from a blocking call
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub usage: TokenUsage,
    pub stop: StopReason,
}

/// Streaming event, in emission order
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    /// Terminal event; nothing follows it
    Completed { usage: TokenUsage, stop: StopReason },
}

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

// =============================================================================
// Transport Trait
// =============================================================================

#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Transport name for logging and error attribution
    fn name(&self) -> &str;

    /// Model identifier used for pricing
    fn model(&self) -> &str;

    /// Single blocking call
    async fn send(&self, request: &ModelRequest) -> Result<ModelReply>;

    /// Incremental call for large outputs
    async fn send_streaming(&self, request: &ModelRequest) -> Result<EventStream>;
}

/// Shared transport type for the pipeline's lifetime.
pub type SharedTransport = Arc<dyn ModelTransport>;

/// Build the transport named by the configuration
pub fn create_transport(config: &LlmConfig) -> Result<SharedTransport> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicTransport::new(config)?)),
        other => Err(LoomError::Config(format!(
            "Unknown LLM provider: {}. Valid values: anthropic",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_from_api() {
        assert_eq!(StopReason::from_api(Some("refusal")), StopReason::Refusal);
        assert_eq!(StopReason::from_api(None), StopReason::EndTurn);
        assert_eq!(StopReason::from_api(Some("max_tokens")), StopReason::MaxTokens);
        assert!(matches!(StopReason::from_api(Some("pause_turn")), StopReason::Other(_)));
    }

    #[test]
    fn test_image_from_bytes_and_debug() {
        let img = ImageAttachment::from_bytes("image/png", b"abc");
        assert_eq!(img.data_base64, "YWJj");
        assert!(!format!("{:?}", img).contains("YWJj"));
    }

    #[test]
    fn test_image_from_path_rejects_unknown_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "x").unwrap();
        assert!(ImageAttachment::from_path(&path).is_err());

        let png = dir.path().join("sketch.PNG");
        std::fs::write(&png, [0u8, 1, 2]).unwrap();
        let img = ImageAttachment::from_path(&png).unwrap();
        assert_eq!(img.media_type, "image/png");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = LlmConfig {
            provider: "openai".to_string(),
            ..Default::default()
        };
        assert!(create_transport(&config).is_err());
    }
}
