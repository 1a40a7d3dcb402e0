//! reportloom - Resumable Engineering-Design Report Pipeline
//!
//! Turns one problem statement (text plus optional images) into a structured
//! engineering-design report through a fixed sequence of model and retrieval
//! stages, checkpointing state after every stage.
//!
//! ## Core Features
//!
//! - **Durable State**: Every merged stage is persisted with a checksum;
//!   resume starts at the first stage neither completed nor skipped
//! - **Clarification Gate**: Framing may ask one question and suspend for up
//!   to 24 hours
//! - **Token Budget**: Cumulative per-run ceiling, charged once per call
//! - **Streaming Selection**: Large outputs stream to avoid idle timeouts
//! - **Sanitized Failures**: Refusal, transport, budget and expiry each
//!   persist a short user-facing message
//!
//! ## Quick Start
//!
//! ```ignore
//! use reportloom::{Config, Database, PipelineOrchestrator, ReportTrigger};
//! use reportloom::ai::create_transport;
//! use reportloom::pipeline::InMemoryRetriever;
//!
//! let config = Config::default();
//! let db = Arc::new(Database::open(&config.storage.db_path)?);
//! db.initialize()?;
//! let orchestrator = PipelineOrchestrator::new(
//!     &config,
//!     create_transport(&config.llm)?,
//!     Arc::new(InMemoryRetriever::default()),
//!     db,
//! );
//! let outcome = orchestrator.start(trigger).await?;
//! ```
//!
//! ## Modules
//!
//! - [`ai`]: Model transport, invocation, token budget, metrics, validation
//! - [`pipeline`]: State, stages, projection, runner, clarification, orchestrator
//! - [`storage`]: SQLite persistence with connection pooling
//! - [`config`]: Layered configuration

pub mod ai;
pub mod cli;
pub mod config;
pub mod constants;
pub mod pipeline;
pub mod storage;
pub mod types;

// =============================================================================
// Core Re-exports
// =============================================================================

// Configuration
pub use config::{Config, ConfigLoader, LlmConfig, PipelineConfig, ProjectionConfig, StorageConfig};

// Error Types
pub use types::error::{ErrorCategory, FailureKind, LoomError, Result, ResultExt};
pub use types::ReportId;

// Storage
pub use storage::{Database, PoolConfig, SharedDatabase};

// =============================================================================
// Pipeline Re-exports
// =============================================================================

pub use pipeline::{
    PipelineOrchestrator, PipelineState, ReportSink, ReportStatus, ReportTrigger, ResumeEvent,
    RetryPolicy, RunOutcome, StageName, WaitMode,
};

// =============================================================================
// AI Re-exports
// =============================================================================

pub use ai::{
    CumulativeUsage, MetricsCollector, ModelInvoker, ModelTransport, SharedBudget, SharedMetrics,
    SharedTransport, TokenBudgetGuard, with_timeout,
};
