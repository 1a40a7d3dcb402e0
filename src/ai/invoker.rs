//! Model Invoker
//!
//! One model call: picks blocking or streaming transport by requested output
//! size, accumulates streamed text in order, prices the call, and flags a
//! safety stop. [`ModelInvoker::invoke`] turns that flag into
//! `LoomError::Refusal`; [`ModelInvoker::dispatch`] hands it back with the
//! call's usage so a caller can account for the refused call first. It never
//! touches pipeline state or storage.

use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::ai::pricing;
use crate::ai::provider::{
    ModelRequest, SharedTransport, StopReason, StreamEvent, TokenUsage,
};
use crate::ai::timeout::with_timeout;
use crate::config::Config;
use crate::types::{ErrorCategory, LlmError, LoomError, Result};

/// Result of one completed call
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub text: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub streamed: bool,
    /// Safety stop; `text` must not be parsed
    pub refused: bool,
    pub fingerprint: String,
}

impl Invocation {
    /// Refusal error for a refused call, `Ok` otherwise
    pub fn accept(self, stage: &str) -> Result<Self> {
        if self.refused {
            return Err(LoomError::Refusal {
                stage: Some(stage.to_string()),
                detail: format!("stop_reason=refusal request={}", self.fingerprint),
            });
        }
        Ok(self)
    }
}

pub struct ModelInvoker {
    transport: SharedTransport,
    streaming_threshold_tokens: u32,
    request_timeout: Duration,
}

impl ModelInvoker {
    pub fn new(transport: SharedTransport, streaming_threshold_tokens: u32) -> Self {
        Self {
            transport,
            streaming_threshold_tokens,
            request_timeout: Duration::from_secs(crate::constants::network::DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn from_config(transport: SharedTransport, config: &Config) -> Self {
        Self::new(transport, config.pipeline.streaming_threshold_tokens)
            .with_request_timeout(Duration::from_secs(config.llm.timeout_secs))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        self.transport.model()
    }

    /// Whether a request of this size goes through the streaming transport
    pub fn uses_streaming(&self, max_output_tokens: u32) -> bool {
        max_output_tokens > self.streaming_threshold_tokens
    }

    /// Call the model; a refusal comes back as `LoomError::Refusal`
    pub async fn invoke(&self, stage: &str, request: &ModelRequest) -> Result<Invocation> {
        self.dispatch(request).await?.accept(stage)
    }

    /// Call the model and report a refusal as a flagged, priced invocation
    #[instrument(skip(self, request), fields(max_output = request.max_output_tokens))]
    pub async fn dispatch(&self, request: &ModelRequest) -> Result<Invocation> {
        let fingerprint = request_fingerprint(request);
        let streamed = self.uses_streaming(request.max_output_tokens);
        let start = Instant::now();

        debug!(
            %fingerprint,
            streamed,
            images = request.images.len(),
            "Dispatching model call"
        );

        let (text, usage, stop) = if streamed {
            with_timeout(self.request_timeout, self.collect_stream(request), "model stream").await?
        } else {
            let reply =
                with_timeout(self.request_timeout, self.transport.send(request), "model call")
                    .await?;
            (reply.text, reply.usage, reply.stop)
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        let refused = stop.is_refusal();
        if refused {
            warn!(
                %fingerprint,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Model refused the request"
            );
        } else if stop == StopReason::MaxTokens {
            warn!(%fingerprint, "Model output hit max_tokens; result may be truncated");
        }

        let cost_usd = pricing::estimate_cost_usd(
            self.transport.model(),
            usage.input_tokens,
            usage.output_tokens,
        );

        info!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            latency_ms,
            "Model call complete"
        );

        Ok(Invocation {
            text,
            usage,
            cost_usd,
            latency_ms,
            streamed,
            refused,
            fingerprint,
        })
    }

    async fn collect_stream(&self, request: &ModelRequest) -> Result<(String, TokenUsage, StopReason)> {
        let mut events = self.transport.send_streaming(request).await?;
        let mut text = String::new();

        while let Some(event) = events.next().await {
            match event? {
                StreamEvent::TextDelta(fragment) => text.push_str(&fragment),
                StreamEvent::Completed { usage, stop } => return Ok((text, usage, stop)),
            }
        }

        Err(LlmError::with_provider(
            ErrorCategory::Transient,
            "Stream closed without a completion event",
            self.transport.name(),
        )
        .into())
    }
}

/// Short stable hash of a request, for correlating retries in logs
pub fn request_fingerprint(request: &ModelRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.system.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.user.as_bytes());
    for image in &request.images {
        hasher.update([0u8]);
        hasher.update(image.data_base64.as_bytes());
    }
    hasher.update(request.max_output_tokens.to_le_bytes());
    let digest = hasher.finalize();
    digest.iter().take(6).map(|b| format!("{:02x}", b)).collect()
}
