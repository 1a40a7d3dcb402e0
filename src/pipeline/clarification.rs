//! Clarification Gate
//!
//! Suspend point after problem framing. Suspension writes a durable wait
//! record (question + deadline) and then parks on an in-process
//! [`AnswerInbox`] slot. An answer can arrive two ways:
//!
//! - in-process, through the inbox, waking the parked run
//! - durably, through the sink, seen on the parked run's next storage poll
//!   or by a later `resume`
//!
//! Either way the deadline is the wall-clock value stored with the wait, and
//! storage refuses answers at or after it. [`GateState`] is what the
//! orchestrator branches on.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::progress::{ProgressUpdate, SharedSink};
use super::stages::StageName;
use super::state::{PipelineState, ReportStatus};
use crate::ai::with_timeout_map;
use crate::constants::pipeline::ANSWER_POLL_SECS;
use crate::types::{LoomError, ReportId, Result};

/// Gate position for a given state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    NotNeeded,
    AwaitingAnswer { question: String },
    Answered { answer: String },
}

impl GateState {
    pub fn of(state: &PipelineState) -> Self {
        let record = &state.clarification;
        if record.needs_clarification {
            Self::AwaitingAnswer {
                question: record.question.clone().unwrap_or_default(),
            }
        } else if let Some(answer) = &record.answer {
            Self::Answered {
                answer: answer.clone(),
            }
        } else {
            Self::NotNeeded
        }
    }
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Answered(String),
    Expired,
}

/// In-process wake-up slots keyed by report
#[derive(Default)]
pub struct AnswerInbox {
    waiters: DashMap<ReportId, oneshot::Sender<String>>,
}

impl AnswerInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter, replacing any stale one for the same report
    pub fn register(&self, report_id: &ReportId) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(report_id.clone(), tx);
        rx
    }

    /// Hand an answer to a parked run; false when nobody is waiting
    pub fn deliver(&self, report_id: &ReportId, answer: &str) -> bool {
        match self.waiters.remove(report_id) {
            Some((_, tx)) => tx.send(answer.to_string()).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, report_id: &ReportId) {
        self.waiters.remove(report_id);
    }

    pub fn is_waiting(&self, report_id: &ReportId) -> bool {
        self.waiters.contains_key(report_id)
    }
}

pub type SharedInbox = Arc<AnswerInbox>;

pub struct ClarificationGate {
    sink: SharedSink,
    inbox: SharedInbox,
    timeout: Duration,
    poll_interval: Duration,
}

impl ClarificationGate {
    pub fn new(sink: SharedSink, inbox: SharedInbox, timeout: Duration) -> Self {
        Self {
            sink,
            inbox,
            timeout,
            poll_interval: Duration::from_secs(ANSWER_POLL_SECS),
        }
    }

    pub fn inbox(&self) -> &SharedInbox {
        &self.inbox
    }

    /// Persist the clarifying state and its wait record; returns the deadline
    pub async fn suspend(&self, state: &PipelineState, question: &str) -> Result<DateTime<Utc>> {
        let report_id = state.report_id();
        let timeout = chrono::Duration::from_std(self.timeout)
            .map_err(|e| LoomError::Config(format!("Invalid clarification timeout: {}", e)))?;
        let deadline = Utc::now() + timeout;

        self.sink.save_state(state).await?;
        self.sink
            .record_clarification_wait(report_id, question, deadline)
            .await?;
        self.sink
            .record_progress(
                report_id,
                &ProgressUpdate {
                    current_step: Some(StageName::ProblemFraming),
                    percent: state.percent_complete(),
                    status: ReportStatus::Clarifying,
                },
            )
            .await?;

        info!(report_id = %report_id, %deadline, "Awaiting clarification answer");
        Ok(deadline)
    }

    /// Park until an answer arrives or the deadline passes.
    ///
    /// Durable storage is polled between inbox waits so an answer written by
    /// another process is also seen.
    pub async fn wait(&self, report_id: &ReportId, deadline: DateTime<Utc>) -> Result<WaitOutcome> {
        // Register first so an answer landing between the check and the wait is not lost
        let mut rx = Some(self.inbox.register(report_id));

        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let until = Instant::now() + remaining;

        let outcome = loop {
            if let Some(answer) = self.sink.pending_answer(report_id).await? {
                debug!(report_id = %report_id, "Answer found in storage");
                break WaitOutcome::Answered(answer);
            }

            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break WaitOutcome::Expired;
            }
            let slice = left.min(self.poll_interval);

            match rx.as_mut() {
                Some(receiver) => {
                    match with_timeout_map(slice, receiver, "clarification wait").await {
                        Ok(Ok(answer)) => break WaitOutcome::Answered(answer),
                        Ok(Err(_)) => {
                            warn!(report_id = %report_id, "Answer channel closed, polling storage only");
                            rx = None;
                        }
                        Err(_) => {}
                    }
                }
                None => tokio::time::sleep(slice).await,
            }
        };

        self.inbox.forget(report_id);
        if outcome == WaitOutcome::Expired {
            info!(report_id = %report_id, "Clarification wait expired");
        }
        Ok(outcome)
    }
}
