//! Global Constants
//!
//! Centralized constants for configuration and tuning.
//! All magic numbers should be defined here with documentation.

/// Token budget constants
pub mod budget {
    /// Hard ceiling on cumulative input+output tokens for one pipeline run
    pub const DEFAULT_TOKEN_CEILING: u64 = 1_500_000;

    /// Warning threshold (fraction of ceiling)
    pub const WARNING_THRESHOLD: f64 = 0.75;

    /// Critical threshold (fraction of ceiling)
    pub const CRITICAL_THRESHOLD: f64 = 0.90;
}

/// Model invocation constants
pub mod model {
    /// Requested output sizes above this use the streaming transport
    pub const STREAMING_THRESHOLD_TOKENS: u32 = 16_000;

    /// Default model identifier
    pub const DEFAULT_MODEL: &str = "claude-opus-4-5-20251101";

    /// Default sampling temperature when a stage does not override it
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;

    /// Characters of raw model text kept in diagnostic logs
    pub const LOG_PREVIEW_CHARS: usize = 300;
}

/// Pipeline constants
pub mod pipeline {
    /// How long a report may wait for a clarification answer (24 hours)
    pub const CLARIFICATION_TIMEOUT_SECS: u64 = 24 * 60 * 60;

    /// Answers that may be fed back into the framing stage
    pub const MAX_CLARIFICATION_ROUNDS: u8 = 1;

    /// Retries granted to retryable transport failures by the step scheduler
    pub const TRANSPORT_MAX_RETRIES: usize = 2;

    /// Local resends of an identical request after unparseable output
    pub const MALFORMED_OUTPUT_RETRIES: u8 = 1;

    /// How often a parked run re-reads storage for an answer
    pub const ANSWER_POLL_SECS: u64 = 30;

    /// Base delay for scheduler backoff (milliseconds)
    pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

    /// Maximum delay between scheduler retries (seconds)
    pub const RETRY_MAX_DELAY_SECS: u64 = 30;
}

/// Context projection limits
pub mod projection {
    /// Maximum entries rendered from any list (corpus items, concepts, findings)
    pub const MAX_ITEMS_PER_LIST: usize = 8;

    /// Maximum characters rendered per list entry
    pub const MAX_ITEM_CHARS: usize = 600;

    /// Maximum characters for a free-text section (summaries, statements)
    pub const MAX_SECTION_CHARS: usize = 6_000;

    /// Maximum characters of the user's own problem text
    pub const MAX_INPUT_CHARS: usize = 24_000;

    /// Marker rendered for a dependency that produced nothing
    pub const NOT_AVAILABLE: &str = "[not available: this step ran but produced no usable results]";
}

/// Retrieval constants
pub mod retrieval {
    /// Items requested per namespace
    pub const TOP_K_PER_NAMESPACE: usize = 10;

    /// Minimum similarity score kept from the corpus
    pub const MIN_SCORE: f32 = 0.2;
}

/// HTTP/Network constants
pub mod network {
    /// Default request timeout (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

    /// Connection timeout (seconds)
    pub const CONNECTION_TIMEOUT_SECS: u64 = 30;
}
