//! Model Integration Layer
//!
//! Transport, invocation, budget, metrics and output validation for the
//! report pipeline.

pub mod budget;
pub mod invoker;
pub mod metrics;
pub mod pricing;
pub mod prompt;
pub mod provider;
pub mod timeout;
pub mod validation;

pub use budget::{BudgetExceeded, BudgetStats, CumulativeUsage, SharedBudget, TokenBudgetGuard};
pub use invoker::{Invocation, ModelInvoker, request_fingerprint};
pub use metrics::{MetricsCollector, MetricsSummary, SharedMetrics, StageMetrics, create_shared_metrics};
pub use prompt::PromptBuilder;
pub use provider::{
    AnthropicTransport, EventStream, ImageAttachment, ModelReply, ModelRequest, ModelTransport,
    SharedTransport, StopReason, StreamEvent, TokenUsage, create_transport,
};
pub use timeout::{with_timeout, with_timeout_map};
pub use validation::{Validate, decode, extract_json};
