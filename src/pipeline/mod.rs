//! Report Pipeline
//!
//! Durable, resumable state machine that turns one problem statement into
//! an engineering-design report.
//!
//! ## Stages
//!
//! ```text
//! problem_framing ──(clarification gate)──> corpus_retrieval
//!   → exemplar_selection (skipped when retrieval is empty)
//!   → literature_review → briefing → concept_generation
//!   → evaluation → report_synthesis
//! ```
//!
//! ## Guarantees
//!
//! - Stages run strictly in order; state is checkpointed after every merge
//! - Resume re-enters at the first stage neither completed nor skipped
//! - Token usage is charged once per call and never re-charged on resume
//! - Persisted error messages are sanitized per failure kind

pub mod clarification;
pub mod outputs;
pub mod progress;
pub mod projector;
pub mod prompts;
pub mod retrieval;
pub mod runner;
pub mod stages;
pub mod state;

pub use clarification::{AnswerInbox, ClarificationGate, GateState, SharedInbox, WaitOutcome};
pub use progress::{
    ClarificationWait, ProgressUpdate, ReportSink, ReportStatusView, SharedSink, TerminalResult,
};
pub use retrieval::{
    CorpusDocument, CorpusHit, InMemoryRetriever, Namespace, RetrievalQuery, Retriever,
    SharedRetriever,
};
pub use runner::{RunContext, RunnerSettings, StageError, StageRunner, StageStep};
pub use stages::{STAGES, StageDefinition, StageKind, StageName};
pub use state::{
    ClarificationExchange, PipelineState, ReportIdentity, ReportInput, ReportStatus,
    STATE_VERSION, StageOutput, StateError, state_checksum,
};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::ai::{
    CumulativeUsage, ImageAttachment, ModelInvoker, SharedTransport, TokenBudgetGuard, create_shared_metrics,
};
use crate::config::Config;
use crate::constants::pipeline as pipeline_constants;
use crate::types::{FailureKind, LoomError, ReportId, Result};

// =============================================================================
// External events
// =============================================================================

/// Starts one run
#[derive(Debug, Clone)]
pub struct ReportTrigger {
    pub conversation_id: String,
    pub report_id: ReportId,
    pub account_id: String,
    pub user_id: String,
    pub user_input: String,
    pub images: Vec<ImageAttachment>,
}

/// Resumes a run suspended on clarification
#[derive(Debug, Clone)]
pub struct ResumeEvent {
    pub report_id: ReportId,
    pub answer: String,
}

/// Where a run stopped
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(PipelineState),
    Failed {
        state: PipelineState,
        kind: FailureKind,
    },
    /// Detached run left a durable wait behind
    AwaitingClarification {
        state: PipelineState,
        question: String,
        deadline: DateTime<Utc>,
    },
}

impl RunOutcome {
    pub fn state(&self) -> &PipelineState {
        match self {
            Self::Completed(state) => state,
            Self::Failed { state, .. } => state,
            Self::AwaitingClarification { state, .. } => state,
        }
    }

    pub fn status(&self) -> ReportStatus {
        self.state().status()
    }
}

// =============================================================================
// Scheduler retry
// =============================================================================

/// Step-level retry for retryable transport failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.pipeline.transport_max_retries,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
            .with_jitter()
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: pipeline_constants::TRANSPORT_MAX_RETRIES,
            min_delay: Duration::from_millis(pipeline_constants::RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_secs(pipeline_constants::RETRY_MAX_DELAY_SECS),
        }
    }
}

/// Whether a run parks on the clarification gate or returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    /// Park in-process until answered or expired
    #[default]
    Block,
    /// Persist the wait and return; `resume` continues later
    Detach,
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct PipelineOrchestrator {
    runner: StageRunner,
    gate: ClarificationGate,
    sink: SharedSink,
    retry: RetryPolicy,
    token_ceiling: u64,
    wait_mode: WaitMode,
}

impl PipelineOrchestrator {
    pub fn new(
        config: &Config,
        transport: SharedTransport,
        retriever: SharedRetriever,
        sink: SharedSink,
    ) -> Self {
        let invoker = Arc::new(ModelInvoker::from_config(transport, config));
        let runner = StageRunner::new(
            invoker,
            retriever,
            sink.clone(),
            RunnerSettings::from_config(config),
        );
        let gate = ClarificationGate::new(
            sink.clone(),
            Arc::new(AnswerInbox::new()),
            config.pipeline.clarification_timeout(),
        );
        Self {
            runner,
            gate,
            sink,
            retry: RetryPolicy::from_config(config),
            token_ceiling: config.pipeline.token_ceiling,
            wait_mode: WaitMode::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_wait_mode(mut self, wait_mode: WaitMode) -> Self {
        self.wait_mode = wait_mode;
        self
    }

    pub fn inbox(&self) -> SharedInbox {
        self.gate.inbox().clone()
    }

    /// Create the report and run it
    #[instrument(skip_all, fields(report_id = %trigger.report_id))]
    pub async fn start(&self, trigger: ReportTrigger) -> Result<RunOutcome> {
        let state = PipelineState::new(
            ReportIdentity {
                report_id: trigger.report_id,
                conversation_id: trigger.conversation_id,
                account_id: trigger.account_id,
                user_id: trigger.user_id,
            },
            ReportInput {
                text: trigger.user_input,
                images: trigger.images,
            },
        );
        self.sink.create_report(&state).await?;
        info!(images = state.input.images.len(), "Report run started");

        let budget = Arc::new(TokenBudgetGuard::new(self.token_ceiling));
        self.drive(state, budget).await
    }

    /// Re-enter a persisted run at its first unsettled stage
    #[instrument(skip_all, fields(report_id = %report_id))]
    pub async fn resume(&self, report_id: &ReportId) -> Result<RunOutcome> {
        let state = self
            .sink
            .load_state(report_id)
            .await?
            .ok_or_else(|| LoomError::NotFound(format!("report {}", report_id)))?;

        if let Some(outcome) = terminal_outcome(&state) {
            info!(status = %state.status(), "Report already finished, nothing to resume");
            return Ok(outcome);
        }

        info!(
            completed = state.completed_stages.len(),
            skipped = state.skipped_stages.len(),
            tokens = state.usage.total(),
            "Resuming report run"
        );
        let budget = Arc::new(TokenBudgetGuard::resume(self.token_ceiling, &state.usage));
        self.drive(state, budget).await
    }

    /// Store an answer durably and wake an in-process waiter if there is one.
    ///
    /// Returns whether a parked run was woken.
    #[instrument(skip_all, fields(report_id = %event.report_id))]
    pub async fn submit_answer(&self, event: ResumeEvent) -> Result<bool> {
        let parked = self.gate.inbox().is_waiting(&event.report_id);
        let answer = record_answer(self.sink.as_ref(), &event.report_id, &event.answer, parked).await?;
        let woke = self.gate.inbox().deliver(&event.report_id, &answer);
        info!(woke, "Clarification answer recorded");
        Ok(woke)
    }

    /// Fail every report whose clarification deadline has passed
    #[instrument(skip(self))]
    pub async fn expire_overdue(&self) -> Result<Vec<ReportId>> {
        expire_overdue(self.sink.as_ref(), Utc::now()).await
    }

    // =========================================================================
    // Sequencing
    // =========================================================================

    async fn drive(&self, mut state: PipelineState, budget: Arc<TokenBudgetGuard>) -> Result<RunOutcome> {
        let ctx = RunContext {
            budget,
            metrics: create_shared_metrics(state.report_id().as_str()),
        };

        loop {
            if let GateState::AwaitingAnswer { question } = GateState::of(&state) {
                match self.await_clarification(state, question).await? {
                    Gate::Continue(next) => state = next,
                    Gate::Stop(outcome) => return Ok(outcome),
                }
                continue;
            }

            let Some(def) = state.next_stage() else {
                let outcome = self.complete(state).await?;
                debug!("{}", ctx.metrics.summary().display());
                debug!("{}", ctx.budget.stats().summary());
                return Ok(outcome);
            };

            match self.run_with_retry(def, state.clone(), &ctx).await {
                Ok(StageStep::Completed(next)) | Ok(StageStep::Skipped(next)) => {
                    self.sink.save_state(&next).await?;
                    state = next;
                }
                Ok(StageStep::NeedsClarification { state: next, question }) => {
                    let deadline = self.gate.suspend(&next, &question).await?;
                    if self.wait_mode == WaitMode::Detach {
                        return Ok(RunOutcome::AwaitingClarification {
                            state: next,
                            question,
                            deadline,
                        });
                    }
                    state = next;
                }
                Err(err) => {
                    debug!("{}", ctx.budget.stats().summary());
                    let failed_at = state.with_usage(&err.spent);
                    return self.fail(failed_at, err.error).await;
                }
            }
        }
    }

    /// Scheduler-owned retry around one stage
    async fn run_with_retry(
        &self,
        def: &'static StageDefinition,
        mut state: PipelineState,
        ctx: &RunContext,
    ) -> std::result::Result<StageStep, StageError> {
        let mut delays = self.retry.backoff();
        let mut carried = CumulativeUsage::default();
        let mut attempt = 0usize;
        loop {
            match self.runner.run(def, &state, ctx).await {
                Ok(step) => return Ok(step),
                Err(err) if err.error.is_retryable() => {
                    let Some(backoff) = delays.next() else {
                        warn!(stage = %def.name, attempts = attempt + 1, "Retries exhausted");
                        return Err(StageError::new(err.error, carried.merge(&err.spent)));
                    };
                    let delay = retry_delay(backoff, &err.error);
                    attempt += 1;
                    warn!(
                        stage = %def.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.error,
                        "Retryable stage failure, rescheduling"
                    );
                    // Spend from the failed attempt stays on the books
                    carried = carried.merge(&err.spent);
                    state = state.with_usage(&err.spent);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(StageError::new(err.error, carried.merge(&err.spent))),
            }
        }
    }

    async fn await_clarification(&self, state: PipelineState, question: String) -> Result<Gate> {
        let report_id = state.report_id().clone();

        let deadline = match self.sink.clarification_wait(&report_id).await? {
            Some(wait) => wait.deadline,
            // State says clarifying but the wait record is gone: re-arm it
            None => self.gate.suspend(&state, &question).await?,
        };

        let outcome = match self.wait_mode {
            WaitMode::Block => self.gate.wait(&report_id, deadline).await?,
            // Only an answer stored before the deadline counts
            WaitMode::Detach => match self.sink.pending_answer(&report_id).await? {
                Some(answer) => WaitOutcome::Answered(answer),
                None if Utc::now() >= deadline => WaitOutcome::Expired,
                None => {
                    return Ok(Gate::Stop(RunOutcome::AwaitingClarification {
                        state,
                        question,
                        deadline,
                    }));
                }
            },
        };

        match outcome {
            WaitOutcome::Answered(answer) => {
                let next = state.with_clarification_answer(&answer);
                self.sink.save_state(&next).await?;
                self.sink.close_wait(&report_id).await?;
                info!(
                    round = next.clarification.answer_round_count,
                    "Clarification answered, re-running framing"
                );
                Ok(Gate::Continue(next))
            }
            WaitOutcome::Expired => {
                let outcome = self
                    .fail(
                        state,
                        LoomError::ClarificationTimeout {
                            report_id: report_id.to_string(),
                            deadline: deadline.to_rfc3339(),
                        },
                    )
                    .await?;
                Ok(Gate::Stop(outcome))
            }
        }
    }

    // =========================================================================
    // Terminal transitions
    // =========================================================================

    async fn complete(&self, state: PipelineState) -> Result<RunOutcome> {
        let done = state.into_complete();
        self.sink.save_state(&done).await?;
        self.sink
            .finish(done.report_id(), &TerminalResult::from_state(&done))
            .await?;
        info!(
            tokens = done.usage.total(),
            calls = done.usage.calls,
            cost_usd = format!("{:.4}", done.usage.cost_usd),
            "Report complete"
        );
        Ok(RunOutcome::Completed(done))
    }

    async fn fail(&self, state: PipelineState, err: LoomError) -> Result<RunOutcome> {
        self.gate.inbox().forget(state.report_id());
        fail_run(self.sink.as_ref(), state, err).await
    }
}

/// Record a terminal failure: sanitized message on the row, detail in the log
async fn fail_run(sink: &dyn ReportSink, state: PipelineState, err: LoomError) -> Result<RunOutcome> {
    let kind = err.failure_kind();
    error!(
        report_id = %state.report_id(),
        stage = state.current_stage.map(|s| s.as_str()).unwrap_or("none"),
        kind = %kind,
        error = %err,
        "Report run failed"
    );

    let failed = state.into_failed(kind);
    sink.save_state(&failed).await?;
    sink.close_wait(failed.report_id()).await?;
    sink.finish(failed.report_id(), &TerminalResult::from_state(&failed))
        .await?;
    Ok(RunOutcome::Failed {
        state: failed,
        kind,
    })
}

/// Validate and durably store a clarification answer; returns the trimmed text.
///
/// A reply to a wait whose deadline has passed is rejected, and the report is
/// failed as expired unless `parked` says an in-process run will expire it
/// on its own timer.
pub async fn record_answer(
    sink: &dyn ReportSink,
    report_id: &ReportId,
    answer: &str,
    parked: bool,
) -> Result<String> {
    let answer = answer.trim();
    if answer.is_empty() {
        return Err(LoomError::InvalidState("clarification answer is empty".to_string()));
    }
    if sink.record_answer(report_id, answer).await? {
        return Ok(answer.to_string());
    }

    let overdue = sink
        .clarification_wait(report_id)
        .await?
        .is_some_and(|wait| wait.is_overdue(Utc::now()));
    if !overdue {
        return Err(LoomError::InvalidState(format!(
            "report {} is not awaiting clarification",
            report_id
        )));
    }
    warn!(report_id = %report_id, "Clarification answer arrived after the deadline");
    if !parked {
        expire_report(sink, report_id).await?;
    }
    Err(LoomError::InvalidState(format!(
        "clarification window for report {} has expired",
        report_id
    )))
}

/// Fail every report whose clarification wait is past `now`.
///
/// Needs only the sink, so a sweeper can run without a model transport.
pub async fn expire_overdue(sink: &dyn ReportSink, now: DateTime<Utc>) -> Result<Vec<ReportId>> {
    let mut expired = Vec::new();
    for report_id in sink.overdue_waits(now).await? {
        if expire_report(sink, &report_id).await? {
            expired.push(report_id);
        }
    }
    if !expired.is_empty() {
        info!(count = expired.len(), "Expired overdue clarification waits");
    }
    Ok(expired)
}

/// Fail one clarifying report as expired; false when it was not clarifying
async fn expire_report(sink: &dyn ReportSink, report_id: &ReportId) -> Result<bool> {
    let Some(state) = sink.load_state(report_id).await? else {
        warn!(report_id = %report_id, "Overdue wait without state, closing it");
        sink.close_wait(report_id).await?;
        return Ok(false);
    };
    if state.status() != ReportStatus::Clarifying {
        sink.close_wait(report_id).await?;
        return Ok(false);
    }
    let deadline = sink
        .clarification_wait(report_id)
        .await?
        .map(|w| w.deadline.to_rfc3339())
        .unwrap_or_default();
    fail_run(
        sink,
        state,
        LoomError::ClarificationTimeout {
            report_id: report_id.to_string(),
            deadline,
        },
    )
    .await?;
    Ok(true)
}

/// Backoff delay, stretched to any wait the service asked for
fn retry_delay(backoff: Duration, error: &LoomError) -> Duration {
    match error {
        LoomError::Transport(e) => e.retry_after.map_or(backoff, |hint| backoff.max(hint)),
        _ => backoff,
    }
}

enum Gate {
    Continue(PipelineState),
    Stop(RunOutcome),
}

/// Outcome for a state that already reached a terminal status
fn terminal_outcome(state: &PipelineState) -> Option<RunOutcome> {
    match state.status() {
        ReportStatus::Complete => Some(RunOutcome::Completed(state.clone())),
        ReportStatus::Failed => {
            let kind = state
                .error
                .as_ref()
                .and_then(|e| FailureKind::parse(&e.kind))
                .unwrap_or(FailureKind::Internal);
            Some(RunOutcome::Failed {
                state: state.clone(),
                kind,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::tests::sample_state;

    #[test]
    fn test_backoff_yields_one_delay_per_retry() {
        let policy = RetryPolicy {
            max_retries: 2,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        let delays: Vec<Duration> = policy.backoff().collect();
        assert_eq!(delays.len(), 2);
        // jitter adds at most one more delay's worth
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(100)));
    }

    #[test]
    fn test_retry_delay_honors_service_hint() {
        use crate::types::{ErrorCategory, LlmError};

        let backoff = Duration::from_millis(200);
        let limited: LoomError = LlmError::new(ErrorCategory::RateLimit, "slow down")
            .retry_after(Duration::from_secs(20))
            .into();
        assert_eq!(retry_delay(backoff, &limited), Duration::from_secs(20));

        let short_hint: LoomError = LlmError::new(ErrorCategory::Transient, "busy")
            .retry_after(Duration::from_millis(50))
            .into();
        assert_eq!(retry_delay(backoff, &short_hint), backoff);

        let no_hint: LoomError = LlmError::new(ErrorCategory::Network, "reset").into();
        assert_eq!(retry_delay(backoff, &no_hint), backoff);
    }

    #[test]
    fn test_retry_policy_reads_config() {
        let mut config = Config::default();
        config.pipeline.transport_max_retries = 5;
        assert_eq!(RetryPolicy::from_config(&config).max_retries, 5);
    }

    #[test]
    fn test_terminal_outcome_only_for_finished_states() {
        let state = sample_state();
        assert!(terminal_outcome(&state).is_none());

        let failed = state.into_failed(FailureKind::BudgetExceeded);
        assert!(matches!(
            terminal_outcome(&failed),
            Some(RunOutcome::Failed {
                kind: FailureKind::BudgetExceeded,
                ..
            })
        ));

        let clarifying = state.with_clarification_request("Which climate?");
        assert!(terminal_outcome(&clarifying).is_none());
        assert_eq!(clarifying.status(), ReportStatus::Clarifying);
    }
}
