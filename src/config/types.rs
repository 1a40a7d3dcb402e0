//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global and project (.reportloom/) level configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::{budget, model, network, pipeline, projection};
use crate::types::{LoomError, Result};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Model service settings
    pub llm: LlmConfig,

    /// Stage scheduling, budget and clarification settings
    pub pipeline: PipelineConfig,

    /// Context projection bounds
    pub projection: ProjectionConfig,

    /// Report database settings
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            llm: LlmConfig::default(),
            pipeline: PipelineConfig::default(),
            projection: ProjectionConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `LoomError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.llm.temperature) {
            return Err(LoomError::Config(format!(
                "LLM temperature must be between 0.0 and 1.0, got {}",
                self.llm.temperature
            )));
        }

        if self.llm.timeout_secs == 0 {
            return Err(LoomError::Config(
                "LLM timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.llm.provider != "anthropic" {
            return Err(LoomError::Config(format!(
                "Unknown LLM provider: {}. Valid values: anthropic",
                self.llm.provider
            )));
        }

        if self.pipeline.token_ceiling == 0 {
            return Err(LoomError::Config(
                "pipeline.token_ceiling must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.clarification_timeout_secs == 0 {
            return Err(LoomError::Config(
                "pipeline.clarification_timeout_secs must be greater than 0".to_string(),
            ));
        }

        // Bounded small so an answer can never loop the framing stage
        if self.pipeline.max_clarification_rounds > 3 {
            return Err(LoomError::Config(format!(
                "pipeline.max_clarification_rounds must be at most 3, got {}",
                self.pipeline.max_clarification_rounds
            )));
        }

        if self.projection.max_items_per_list == 0
            || self.projection.max_item_chars < 16
            || self.projection.max_section_chars < self.projection.max_item_chars
            || self.projection.max_input_chars < self.projection.max_section_chars
        {
            return Err(LoomError::Config(
                "projection limits must be positive and max_input_chars >= max_section_chars >= max_item_chars"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// LLM Configuration
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name
    pub provider: String,

    /// Model name
    pub model: String,

    /// API base URL
    pub api_base: String,

    /// API key; falls back to ANTHROPIC_API_KEY. Never written back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Default sampling temperature for stages that don't set their own
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: model::DEFAULT_MODEL.to_string(),
            api_base: "https://api.anthropic.com".to_string(),
            api_key: None,
            timeout_secs: network::DEFAULT_TIMEOUT_SECS,
            temperature: model::DEFAULT_TEMPERATURE,
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_secs", &self.timeout_secs)
            .field("temperature", &self.temperature)
            .finish()
    }
}

// =============================================================================
// Pipeline Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Hard ceiling on cumulative tokens per run
    pub token_ceiling: u64,

    /// Max output size above which the streaming transport is used
    pub streaming_threshold_tokens: u32,

    /// How long a report waits for a clarification answer
    pub clarification_timeout_secs: u64,

    /// Answers that may be fed back into the framing stage
    pub max_clarification_rounds: u8,

    /// Scheduler retries for retryable transport failures
    pub transport_max_retries: usize,

    /// Identical resends after unparseable output
    pub malformed_output_retries: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            token_ceiling: budget::DEFAULT_TOKEN_CEILING,
            streaming_threshold_tokens: model::STREAMING_THRESHOLD_TOKENS,
            clarification_timeout_secs: pipeline::CLARIFICATION_TIMEOUT_SECS,
            max_clarification_rounds: pipeline::MAX_CLARIFICATION_ROUNDS,
            transport_max_retries: pipeline::TRANSPORT_MAX_RETRIES,
            malformed_output_retries: pipeline::MALFORMED_OUTPUT_RETRIES,
        }
    }
}

impl PipelineConfig {
    pub fn clarification_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.clarification_timeout_secs)
    }
}

// =============================================================================
// Projection Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectionConfig {
    pub max_items_per_list: usize,
    pub max_item_chars: usize,
    pub max_section_chars: usize,
    /// Raw problem text sent to framing
    pub max_input_chars: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            max_items_per_list: projection::MAX_ITEMS_PER_LIST,
            max_item_chars: projection::MAX_ITEM_CHARS,
            max_section_chars: projection::MAX_SECTION_CHARS,
            max_input_chars: projection::MAX_INPUT_CHARS,
        }
    }
}

// =============================================================================
// Storage Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding report rows and clarification waits
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".reportloom/reports.db"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
