//! Unified Error Type System
//!
//! Centralized error types for the entire application.
//! Provides error classification for retry decisions and a sanitized
//! user-facing message per failure kind.
//!
//! ## Error Categories
//!
//! - **Transient**: Temporary service issues (scheduler may retry)
//! - **RateLimit**: API rate limiting (scheduler may retry after a wait)
//! - **Network**: Connectivity issues (scheduler may retry)
//! - **Auth**: Authentication failures (fail fast)
//! - **BadRequest**: Request rejected by the service (fail fast)
//!
//! ## Failure Kinds
//!
//! Every terminal pipeline error maps to a [`FailureKind`], whose
//! [`FailureKind::user_message`] is the only text ever persisted as the
//! report's `error_message`. Technical detail stays in the logs.

use std::time::Duration;
use thiserror::Error;

use crate::ai::budget::BudgetExceeded;

// =============================================================================
// Error Categories
// =============================================================================

/// Transport error categories for retry routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rate limited - wait then retry
    RateLimit,
    /// Authentication failed - fail fast, don't retry
    Auth,
    /// Network/connectivity issues - retry with backoff
    Network,
    /// Invalid request - don't retry, fix request
    BadRequest,
    /// Temporary server issues (5xx, overloaded) - retry
    Transient,
    /// Unknown error - conservative retry
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit => write!(f, "RATE_LIMIT"),
            Self::Auth => write!(f, "AUTH"),
            Self::Network => write!(f, "NETWORK"),
            Self::BadRequest => write!(f, "BAD_REQUEST"),
            Self::Transient => write!(f, "TRANSIENT"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl ErrorCategory {
    /// Check if the step scheduler may retry this category
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Network | Self::Transient | Self::Unknown
        )
    }

    /// Get recommended retry delay for this category
    pub fn recommended_delay(&self) -> Duration {
        match self {
            Self::RateLimit => Duration::from_secs(30),
            Self::Network => Duration::from_secs(5),
            Self::Transient => Duration::from_secs(2),
            _ => Duration::from_millis(500),
        }
    }
}

// =============================================================================
// LLM Transport Error
// =============================================================================

/// Transport-level model error with category and retry hints
#[derive(Debug, Clone)]
pub struct LlmError {
    /// Error category for routing decisions
    pub category: ErrorCategory,
    /// Detailed error message (diagnostic only)
    pub message: String,
    /// Transport that produced the error
    pub provider: Option<String>,
    /// Suggested wait time before retry (if applicable)
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(provider) = &self.provider {
            write!(f, "[{}:{}] {}", provider, self.category, self.message)
        } else {
            write!(f, "[{}] {}", self.category, self.message)
        }
    }
}

impl std::error::Error for LlmError {}

impl LlmError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            provider: None,
            retry_after: None,
        }
    }

    pub fn with_provider(
        category: ErrorCategory,
        message: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            provider: Some(provider.into()),
            retry_after: None,
        }
    }

    /// Add suggested retry delay
    pub fn retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    pub fn recommended_delay(&self) -> Duration {
        self.retry_after
            .unwrap_or_else(|| self.category.recommended_delay())
    }
}

// =============================================================================
// Error Classifier
// =============================================================================

/// Maps raw transport failures onto categories
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify HTTP status code directly
    pub fn classify_http_status(status: u16, message: &str, provider: &str) -> LlmError {
        match status {
            429 => LlmError::with_provider(ErrorCategory::RateLimit, message, provider)
                .retry_after(Duration::from_secs(30)),
            401 | 403 => LlmError::with_provider(ErrorCategory::Auth, message, provider),
            400 | 404 | 413 | 422 => {
                LlmError::with_provider(ErrorCategory::BadRequest, message, provider)
            }
            // 529 is the "overloaded" status
            500 | 502 | 503 | 504 | 529 => {
                LlmError::with_provider(ErrorCategory::Transient, message, provider)
                    .retry_after(Duration::from_secs(5))
            }
            _ => LlmError::with_provider(ErrorCategory::Unknown, message, provider),
        }
    }

    /// Classify a reqwest failure that never produced a status code
    pub fn classify_request_error(err: &reqwest::Error, provider: &str) -> LlmError {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            LlmError::with_provider(ErrorCategory::Network, err.to_string(), provider)
                .retry_after(Duration::from_secs(5))
        } else if err.is_decode() {
            LlmError::with_provider(ErrorCategory::Transient, err.to_string(), provider)
        } else {
            LlmError::with_provider(ErrorCategory::Unknown, err.to_string(), provider)
        }
    }

    /// Classify an in-band error event from a streaming response
    pub fn classify_stream_error(error_type: &str, message: &str, provider: &str) -> LlmError {
        match error_type {
            "overloaded_error" | "api_error" => {
                LlmError::with_provider(ErrorCategory::Transient, message, provider)
            }
            "rate_limit_error" => {
                LlmError::with_provider(ErrorCategory::RateLimit, message, provider)
                    .retry_after(Duration::from_secs(30))
            }
            "authentication_error" | "permission_error" => {
                LlmError::with_provider(ErrorCategory::Auth, message, provider)
            }
            "invalid_request_error" => {
                LlmError::with_provider(ErrorCategory::BadRequest, message, provider)
            }
            _ => LlmError::with_provider(ErrorCategory::Unknown, message, provider),
        }
    }
}

// =============================================================================
// Failure Kinds
// =============================================================================

/// Terminal failure classification used for persistence and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Content-safety stop from the model service
    Refusal,
    /// Network or service fault that exhausted its retries
    Transport,
    /// Model output could not be parsed into the stage's shape
    MalformedOutput,
    /// Cumulative token ceiling crossed
    BudgetExceeded,
    /// No clarification answer before the deadline
    ClarificationExpired,
    /// Storage, configuration, or state-consistency fault
    Internal,
}

impl FailureKind {
    /// Short sanitized message shown to the report's owner
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Refusal => {
                "This request could not be processed because it was flagged by our content \
                 safety checks. Please rephrase the problem and try again."
            }
            Self::Transport => {
                "The report could not be generated because the analysis service was \
                 unavailable. Please try again later."
            }
            Self::MalformedOutput => {
                "The analysis produced an unreadable result. Please try again."
            }
            Self::BudgetExceeded => {
                "This report exceeded its processing budget and was stopped. Please narrow \
                 the problem statement and try again."
            }
            Self::ClarificationExpired => {
                "This report expired while waiting for your answer to the clarification \
                 question. Please start a new report."
            }
            Self::Internal => "An internal error stopped this report. Please try again.",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refusal => "refusal",
            Self::Transport => "transport",
            Self::MalformedOutput => "malformed_output",
            Self::BudgetExceeded => "budget_exceeded",
            Self::ClarificationExpired => "clarification_expired",
            Self::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "refusal" => Some(Self::Refusal),
            "transport" => Some(Self::Transport),
            "malformed_output" => Some(Self::MalformedOutput),
            "budget_exceeded" => Some(Self::BudgetExceeded),
            "clarification_expired" => Some(Self::ClarificationExpired),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum LoomError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // -------------------------------------------------------------------------
    // Model Errors
    // -------------------------------------------------------------------------
    /// Network or service fault talking to the model
    #[error("Transport error: {0}")]
    Transport(LlmError),

    /// Content-safety stop; never retried with the same request
    #[error("Model refused the request{}", stage.as_deref().map(|s| format!(" in stage {s}")).unwrap_or_default())]
    Refusal { stage: Option<String>, detail: String },

    /// Stage output failed to parse or validate
    #[error("Malformed output in stage {stage}: {message}")]
    MalformedOutput { stage: String, message: String },

    // -------------------------------------------------------------------------
    // Pipeline Errors
    // -------------------------------------------------------------------------
    #[error("Token budget exceeded in stage {stage}: {consumed} of {ceiling} tokens")]
    BudgetExceeded {
        stage: String,
        ceiling: u64,
        consumed: u64,
    },

    #[error("Clarification for report {report_id} expired at {deadline}")]
    ClarificationTimeout { report_id: String, deadline: String },

    /// Operation timeout with context
    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Persisted or in-memory pipeline state broke an invariant
    #[error("Invalid pipeline state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // -------------------------------------------------------------------------
    // Infrastructure Errors
    // -------------------------------------------------------------------------
    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<LlmError> for LoomError {
    fn from(err: LlmError) -> Self {
        LoomError::Transport(err)
    }
}

impl From<BudgetExceeded> for LoomError {
    fn from(err: BudgetExceeded) -> Self {
        LoomError::BudgetExceeded {
            stage: err.stage,
            ceiling: err.ceiling,
            consumed: err.consumed,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoomError>;

// =============================================================================
// Helper Functions
// =============================================================================

impl LoomError {
    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a malformed-output error
    pub fn malformed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedOutput {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Attach a stage name to a refusal raised below the stage runner
    pub fn in_stage(self, stage_name: &str) -> Self {
        match self {
            Self::Refusal { stage: None, detail } => Self::Refusal {
                stage: Some(stage_name.to_string()),
                detail,
            },
            Self::MalformedOutput { message, .. } => Self::MalformedOutput {
                stage: stage_name.to_string(),
                message,
            },
            other => other,
        }
    }

    /// Whether the step scheduler may re-run the failed step
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Terminal classification of this error
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Refusal { .. } => FailureKind::Refusal,
            Self::Transport(_) | Self::Timeout { .. } => FailureKind::Transport,
            Self::MalformedOutput { .. } => FailureKind::MalformedOutput,
            Self::BudgetExceeded { .. } => FailureKind::BudgetExceeded,
            Self::ClarificationTimeout { .. } => FailureKind::ClarificationExpired,
            _ => FailureKind::Internal,
        }
    }

    /// Sanitized message safe to persist as the report's `error_message`
    pub fn user_message(&self) -> &'static str {
        self.failure_kind().user_message()
    }
}

/// Context extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn with_context<C: Into<String>>(self, context: C) -> Result<T>;

    /// Add context using a closure (lazy evaluation)
    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| LoomError::Storage(format!("{}: {}", context.into(), e)))
    }

    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| LoomError::Storage(format!("{}: {}", f().into(), e)))
    }
}

// =============================================================================
// Tests
// =============================================================================
