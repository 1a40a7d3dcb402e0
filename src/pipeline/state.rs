//! Pipeline state
//!
//! `PipelineState` is the single record threaded through a run. It is never
//! edited in place: every transition (`apply_stage_result`, `with_skipped`,
//! clarification updates, terminal marks) takes `&self` and returns a new
//! value.
//!
//! Invariant: a stage's output slot is populated if and only if the stage
//! is in `completed_stages`, and `completed_stages` follows the fixed stage
//! order with every declared dependency completed first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::outputs::{
    Briefing, ConceptSet, CorpusMatches, Evaluation, ExemplarSet, FinalReport, LiteratureNotes,
    ProblemFraming,
};
use super::stages::{STAGES, StageDefinition, StageName};
use crate::ai::{CumulativeUsage, ImageAttachment};
use crate::types::{FailureKind, LoomError, ReportId, Result};

/// Current state schema version
///
/// Increment this when making breaking changes to `PipelineState`.
pub const STATE_VERSION: u8 = 1;

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    #[default]
    Processing,
    Clarifying,
    Complete,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Clarifying => "clarifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(Self::Processing),
            "clarifying" => Some(Self::Clarifying),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Sub-records
// =============================================================================

/// Who asked for the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportIdentity {
    pub report_id: ReportId,
    pub conversation_id: String,
    pub account_id: String,
    pub user_id: String,
}

/// What the user supplied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportInput {
    pub text: String,
    #[serde(default)]
    pub images: Vec<ImageAttachment>,
}

/// One answered question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationExchange {
    pub question: String,
    pub answer: String,
}

/// `question`/`answer` hold the latest round; `exchanges` keeps every
/// answered round in order so re-run framing sees all of them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationRecord {
    pub needs_clarification: bool,
    pub question: Option<String>,
    pub answer: Option<String>,
    /// Answers already fed back into framing
    pub answer_round_count: u8,
    #[serde(default)]
    pub exchanges: Vec<ClarificationExchange>,
}

/// Recorded on terminal failure; `message` is the sanitized user text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalError {
    pub kind: String,
    pub message: String,
}

/// One slot per stage; `None` until that stage completes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOutputs {
    pub problem_framing: Option<ProblemFraming>,
    pub corpus_retrieval: Option<CorpusMatches>,
    pub exemplar_selection: Option<ExemplarSet>,
    pub literature_review: Option<LiteratureNotes>,
    pub briefing: Option<Briefing>,
    pub concept_generation: Option<ConceptSet>,
    pub evaluation: Option<Evaluation>,
    pub report_synthesis: Option<FinalReport>,
}

impl StageOutputs {
    pub fn is_populated(&self, stage: StageName) -> bool {
        match stage {
            StageName::ProblemFraming => self.problem_framing.is_some(),
            StageName::CorpusRetrieval => self.corpus_retrieval.is_some(),
            StageName::ExemplarSelection => self.exemplar_selection.is_some(),
            StageName::LiteratureReview => self.literature_review.is_some(),
            StageName::Briefing => self.briefing.is_some(),
            StageName::ConceptGeneration => self.concept_generation.is_some(),
            StageName::Evaluation => self.evaluation.is_some(),
            StageName::ReportSynthesis => self.report_synthesis.is_some(),
        }
    }
}

/// Validated output of one stage, ready to merge
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    ProblemFraming(ProblemFraming),
    CorpusRetrieval(CorpusMatches),
    ExemplarSelection(ExemplarSet),
    LiteratureReview(LiteratureNotes),
    Briefing(Briefing),
    ConceptGeneration(ConceptSet),
    Evaluation(Evaluation),
    ReportSynthesis(FinalReport),
}

impl StageOutput {
    pub fn stage(&self) -> StageName {
        match self {
            Self::ProblemFraming(_) => StageName::ProblemFraming,
            Self::CorpusRetrieval(_) => StageName::CorpusRetrieval,
            Self::ExemplarSelection(_) => StageName::ExemplarSelection,
            Self::LiteratureReview(_) => StageName::LiteratureReview,
            Self::Briefing(_) => StageName::Briefing,
            Self::ConceptGeneration(_) => StageName::ConceptGeneration,
            Self::Evaluation(_) => StageName::Evaluation,
            Self::ReportSynthesis(_) => StageName::ReportSynthesis,
        }
    }
}

// =============================================================================
// Pipeline State
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    #[serde(default = "default_state_version")]
    pub version: u8,
    pub identity: ReportIdentity,
    pub input: ReportInput,
    #[serde(default)]
    pub clarification: ClarificationRecord,
    #[serde(default)]
    pub outputs: StageOutputs,
    #[serde(default)]
    pub current_stage: Option<StageName>,
    #[serde(default)]
    pub completed_stages: Vec<StageName>,
    /// Stages whose skip condition held; never in `completed_stages`
    #[serde(default)]
    pub skipped_stages: Vec<StageName>,
    /// Every model call so far, including failed-parse attempts
    #[serde(default)]
    pub usage: CumulativeUsage,
    #[serde(default)]
    pub error: Option<TerminalError>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_state_version() -> u8 {
    STATE_VERSION
}

impl PipelineState {
    pub fn new(identity: ReportIdentity, input: ReportInput) -> Self {
        Self {
            version: STATE_VERSION,
            identity,
            input,
            clarification: ClarificationRecord::default(),
            outputs: StageOutputs::default(),
            current_stage: None,
            completed_stages: Vec::new(),
            skipped_stages: Vec::new(),
            usage: CumulativeUsage::default(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn report_id(&self) -> &ReportId {
        &self.identity.report_id
    }

    pub fn is_completed(&self, stage: StageName) -> bool {
        self.completed_stages.contains(&stage)
    }

    pub fn is_skipped(&self, stage: StageName) -> bool {
        self.skipped_stages.contains(&stage)
    }

    /// Completed or skipped; either way the stage never runs again
    pub fn is_settled(&self, stage: StageName) -> bool {
        self.is_completed(stage) || self.is_skipped(stage)
    }

    /// First stage in table order that has not been settled
    pub fn next_stage(&self) -> Option<&'static StageDefinition> {
        STAGES.iter().find(|def| !self.is_settled(def.name))
    }

    pub fn status(&self) -> ReportStatus {
        if self.error.is_some() {
            ReportStatus::Failed
        } else if self.completed_at.is_some() {
            ReportStatus::Complete
        } else if self.clarification.needs_clarification {
            ReportStatus::Clarifying
        } else {
            ReportStatus::Processing
        }
    }

    pub fn percent_complete(&self) -> u8 {
        let settled = StageName::ALL
            .iter()
            .filter(|s| self.is_settled(**s))
            .count();
        (settled * 100 / StageName::COUNT) as u8
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Merge a validated stage output into a new state.
    ///
    /// `usage` is what the stage's model calls spent; it is folded into the
    /// cumulative total alongside the merge.
    pub fn apply_stage_result(&self, output: StageOutput, usage: &CumulativeUsage) -> Result<Self> {
        let stage = output.stage();
        self.check_can_run(stage.definition())?;

        let mut next = self.clone();
        match output {
            StageOutput::ProblemFraming(v) => next.outputs.problem_framing = Some(v),
            StageOutput::CorpusRetrieval(v) => next.outputs.corpus_retrieval = Some(v),
            StageOutput::ExemplarSelection(v) => next.outputs.exemplar_selection = Some(v),
            StageOutput::LiteratureReview(v) => next.outputs.literature_review = Some(v),
            StageOutput::Briefing(v) => next.outputs.briefing = Some(v),
            StageOutput::ConceptGeneration(v) => next.outputs.concept_generation = Some(v),
            StageOutput::Evaluation(v) => next.outputs.evaluation = Some(v),
            StageOutput::ReportSynthesis(v) => next.outputs.report_synthesis = Some(v),
        }
        next.completed_stages.push(stage);
        next.current_stage = Some(stage);
        next.usage = next.usage.merge(usage);
        Ok(next)
    }

    /// Record that a stage's skip condition held
    pub fn with_skipped(&self, stage: StageName) -> Result<Self> {
        self.check_can_run(stage.definition())?;
        let mut next = self.clone();
        next.skipped_stages.push(stage);
        next.current_stage = Some(stage);
        Ok(next)
    }

    pub fn with_current_stage(&self, stage: StageName) -> Self {
        let mut next = self.clone();
        next.current_stage = Some(stage);
        next
    }

    /// Spent usage that produced no mergeable output (e.g. a clarification request)
    pub fn with_usage(&self, usage: &CumulativeUsage) -> Self {
        let mut next = self.clone();
        next.usage = next.usage.merge(usage);
        next
    }

    /// Framing asked the user a question; the framing slot stays empty
    pub fn with_clarification_request(&self, question: &str) -> Self {
        let mut next = self.clone();
        next.clarification.needs_clarification = true;
        next.clarification.question = Some(question.to_string());
        next.current_stage = Some(StageName::ProblemFraming);
        next
    }

    /// Answer received; framing re-runs with it appended
    pub fn with_clarification_answer(&self, answer: &str) -> Self {
        let mut next = self.clone();
        next.clarification.needs_clarification = false;
        next.clarification.answer = Some(answer.to_string());
        next.clarification.answer_round_count = next.clarification.answer_round_count.saturating_add(1);
        next.clarification.exchanges.push(ClarificationExchange {
            question: next.clarification.question.clone().unwrap_or_default(),
            answer: answer.to_string(),
        });
        next
    }

    pub fn into_failed(&self, kind: FailureKind) -> Self {
        let mut next = self.clone();
        next.error = Some(TerminalError {
            kind: kind.as_str().to_string(),
            message: kind.user_message().to_string(),
        });
        next.clarification.needs_clarification = false;
        next.completed_at = Some(Utc::now());
        next
    }

    pub fn into_complete(&self) -> Self {
        let mut next = self.clone();
        next.completed_at = Some(Utc::now());
        next
    }

    fn check_can_run(&self, def: &StageDefinition) -> Result<()> {
        let stage = def.name;
        if self.is_settled(stage) {
            return Err(LoomError::InvalidState(format!(
                "stage {} already settled for report {}",
                stage,
                self.report_id()
            )));
        }
        if let Some(missing) = def.depends_on.iter().find(|d| !self.is_completed(**d)) {
            return Err(LoomError::InvalidState(format!(
                "stage {} requires {} which has not completed",
                stage, missing
            )));
        }
        if let Some(missing) = def.optional.iter().find(|d| !self.is_settled(**d)) {
            return Err(LoomError::InvalidState(format!(
                "stage {} must wait for {} to complete or be skipped",
                stage, missing
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Validation & serialization
    // =========================================================================

    /// Check the structural invariants of a (possibly reloaded) state
    pub fn validate(&self) -> std::result::Result<(), StateError> {
        if self.version > STATE_VERSION {
            return Err(StateError::IncompatibleVersion {
                found: self.version,
                expected: STATE_VERSION,
            });
        }

        let mut last_index: Option<usize> = None;
        for stage in &self.completed_stages {
            if last_index.is_some_and(|last| stage.index() <= last) {
                return Err(StateError::OutOfOrder(*stage));
            }
            last_index = Some(stage.index());

            let def = stage.definition();
            if let Some(dep) = def.depends_on.iter().find(|d| !self.is_completed(**d)) {
                return Err(StateError::MissingDependency {
                    stage: *stage,
                    dependency: *dep,
                });
            }
        }

        for stage in StageName::ALL {
            let populated = self.outputs.is_populated(stage);
            let completed = self.is_completed(stage);
            if populated != completed {
                return Err(StateError::SlotMismatch { stage, populated });
            }
            if completed && self.is_skipped(stage) {
                return Err(StateError::CompletedAndSkipped(stage));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize, check the stored checksum, and validate invariants
    pub fn from_json(json: &str, expected_checksum: Option<u32>) -> std::result::Result<Self, StateError> {
        if let Some(expected) = expected_checksum {
            let computed = state_checksum(json);
            if expected != computed {
                return Err(StateError::ChecksumMismatch { expected, computed });
            }
        }
        let state: Self =
            serde_json::from_str(json).map_err(|e| StateError::ParseError(e.to_string()))?;
        state.validate()?;
        Ok(state)
    }
}

/// CRC32 of the serialized state, stored next to it
pub fn state_checksum(json: &str) -> u32 {
    crc32fast::hash(json.as_bytes())
}

/// Persisted-state validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    IncompatibleVersion { found: u8, expected: u8 },
    ChecksumMismatch { expected: u32, computed: u32 },
    OutOfOrder(StageName),
    MissingDependency { stage: StageName, dependency: StageName },
    SlotMismatch { stage: StageName, populated: bool },
    CompletedAndSkipped(StageName),
    ParseError(String),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncompatibleVersion { found, expected } => write!(
                f,
                "State version {} is newer than supported version {}",
                found, expected
            ),
            Self::ChecksumMismatch { expected, computed } => write!(
                f,
                "State corrupted: checksum mismatch (expected {}, got {})",
                expected, computed
            ),
            Self::OutOfOrder(stage) => write!(f, "Stage {} completed out of order", stage),
            Self::MissingDependency { stage, dependency } => write!(
                f,
                "Stage {} completed before its dependency {}",
                stage, dependency
            ),
            Self::SlotMismatch { stage, populated } => {
                if *populated {
                    write!(f, "Stage {} has output but is not marked completed", stage)
                } else {
                    write!(f, "Stage {} is marked completed but has no output", stage)
                }
            }
            Self::CompletedAndSkipped(stage) => {
                write!(f, "Stage {} is both completed and skipped", stage)
            }
            Self::ParseError(msg) => write!(f, "Failed to parse state: {}", msg),
        }
    }
}

impl std::error::Error for StateError {}

impl From<StateError> for LoomError {
    fn from(err: StateError) -> Self {
        LoomError::InvalidState(err.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
