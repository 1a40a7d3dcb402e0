//! Persistence boundary of the pipeline.
//!
//! The orchestrator reports progress, checkpoints state and records the
//! terminal result through [`ReportSink`]. Storage implements it; the
//! pipeline never talks to a database directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::outputs::FinalReport;
use super::stages::StageName;
use super::state::{PipelineState, ReportStatus};
use crate::ai::CumulativeUsage;
use crate::types::{ReportId, Result};

/// Written before and after every stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub current_step: Option<StageName>,
    pub percent: u8,
    pub status: ReportStatus,
}

/// Written once when a run ends
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalResult {
    pub status: ReportStatus,
    /// Sanitized; never raw model text
    pub error_message: Option<String>,
    pub usage: CumulativeUsage,
}

impl TerminalResult {
    pub fn from_state(state: &PipelineState) -> Self {
        Self {
            status: state.status(),
            error_message: state.error.as_ref().map(|e| e.message.clone()),
            usage: state.usage,
        }
    }
}

/// Durable "awaiting answer until deadline" record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClarificationWait {
    pub report_id: ReportId,
    pub question: String,
    pub deadline: DateTime<Utc>,
    pub answer: Option<String>,
    pub answered_at: Option<DateTime<Utc>>,
}

impl ClarificationWait {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.answer_in_time().is_none() && now >= self.deadline
    }

    /// The stored answer, unless it was recorded at or after the deadline
    pub fn answer_in_time(&self) -> Option<&str> {
        match (&self.answer, self.answered_at) {
            (Some(answer), Some(at)) if at < self.deadline => Some(answer),
            _ => None,
        }
    }
}

/// Poll view of one report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportStatusView {
    pub report_id: String,
    pub status: ReportStatus,
    pub current_step: Option<String>,
    pub percent_complete: u8,
    pub error_message: Option<String>,
    /// Pending clarification question, while clarifying
    pub clarification_question: Option<String>,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub title: Option<String>,
    pub report: Option<FinalReport>,
    pub updated_at: String,
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Insert the report row for a fresh run
    async fn create_report(&self, state: &PipelineState) -> Result<()>;

    async fn record_progress(&self, report_id: &ReportId, update: &ProgressUpdate) -> Result<()>;

    /// Checkpoint the full state; resume starts from the last saved value
    async fn save_state(&self, state: &PipelineState) -> Result<()>;

    async fn load_state(&self, report_id: &ReportId) -> Result<Option<PipelineState>>;

    async fn record_clarification_wait(
        &self,
        report_id: &ReportId,
        question: &str,
        deadline: DateTime<Utc>,
    ) -> Result<()>;

    /// Store an answer; false when no open wait exists or its deadline has passed
    async fn record_answer(&self, report_id: &ReportId, answer: &str) -> Result<bool>;

    async fn clarification_wait(&self, report_id: &ReportId) -> Result<Option<ClarificationWait>>;

    /// Answer stored for an open wait, if one arrived before its deadline
    async fn pending_answer(&self, report_id: &ReportId) -> Result<Option<String>> {
        Ok(self
            .clarification_wait(report_id)
            .await?
            .and_then(|wait| wait.answer_in_time().map(str::to_string)))
    }

    /// Drop the wait record once it has been resolved either way
    async fn close_wait(&self, report_id: &ReportId) -> Result<()>;

    /// Unanswered waits whose deadline is at or before `now`
    async fn overdue_waits(&self, now: DateTime<Utc>) -> Result<Vec<ReportId>>;

    async fn finish(&self, report_id: &ReportId, result: &TerminalResult) -> Result<()>;

    async fn report_status(&self, report_id: &ReportId) -> Result<Option<ReportStatusView>>;
}

pub type SharedSink = Arc<dyn ReportSink>;
