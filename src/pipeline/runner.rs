//! Stage Runner
//!
//! Executes one stage against the current state: skip check, progress,
//! projection, model call (or corpus lookup), decode with one local retry on
//! malformed output, budget charge, merge, progress. A refused call is added
//! to the stage's spend before the refusal propagates. Transport retries are
//! not handled here; they belong to the orchestrator's scheduler.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::outputs::{
    Briefing, ConceptSet, Evaluation, ExemplarSet, FinalReport, LiteratureNotes, ProblemFraming,
};
use super::progress::{ProgressUpdate, SharedSink};
use super::prompts;
use super::retrieval::{SharedRetriever, retrieve_matches};
use super::stages::{StageDefinition, StageKind, StageName};
use super::state::{PipelineState, ReportStatus, StageOutput};
use crate::ai::{
    CumulativeUsage, ModelInvoker, ModelRequest, SharedBudget, SharedMetrics, Validate, decode,
};
use crate::config::{Config, ProjectionConfig};
use crate::types::{LoomError, Result, preview};

/// Knobs the runner reads from configuration
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub projection: ProjectionConfig,
    pub default_temperature: f32,
    pub malformed_output_retries: u8,
    pub max_clarification_rounds: u8,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            projection: config.projection,
            default_temperature: config.llm.temperature,
            malformed_output_retries: config.pipeline.malformed_output_retries,
            max_clarification_rounds: config.pipeline.max_clarification_rounds,
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Per-run accounting shared by every stage of one run
#[derive(Clone)]
pub struct RunContext {
    pub budget: SharedBudget,
    pub metrics: SharedMetrics,
}

/// What running a stage produced
#[derive(Debug)]
pub enum StageStep {
    /// Output merged and stage marked completed
    Completed(PipelineState),
    /// Skip condition held; recorded as skipped, nothing spent
    Skipped(PipelineState),
    /// Framing asked a question; the framing slot stays empty
    NeedsClarification {
        state: PipelineState,
        question: String,
    },
}

/// Stage failure plus whatever the stage spent before failing
#[derive(Debug)]
pub struct StageError {
    pub error: LoomError,
    pub spent: CumulativeUsage,
}

impl StageError {
    pub fn new(error: LoomError, spent: CumulativeUsage) -> Self {
        Self { error, spent }
    }
}

impl From<LoomError> for StageError {
    fn from(error: LoomError) -> Self {
        Self::new(error, CumulativeUsage::default())
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for StageError {}

enum Decoded {
    Output(StageOutput),
    Clarify(String),
}

pub struct StageRunner {
    invoker: Arc<ModelInvoker>,
    retriever: SharedRetriever,
    sink: SharedSink,
    settings: RunnerSettings,
}

impl StageRunner {
    pub fn new(
        invoker: Arc<ModelInvoker>,
        retriever: SharedRetriever,
        sink: SharedSink,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            invoker,
            retriever,
            sink,
            settings,
        }
    }

    /// Whether framing may still ask the user a question
    pub fn clarification_allowed(&self, state: &PipelineState) -> bool {
        state.clarification.answer_round_count < self.settings.max_clarification_rounds
    }

    pub async fn run(
        &self,
        def: &'static StageDefinition,
        state: &PipelineState,
        ctx: &RunContext,
    ) -> std::result::Result<StageStep, StageError> {
        let stage = def.name;

        if (def.should_skip)(state) {
            info!(stage = %stage, "Skip condition met, no model call");
            return Ok(StageStep::Skipped(state.with_skipped(stage)?));
        }

        self.report(state, stage, def.percent_before()).await?;
        let current = state.with_current_stage(stage);

        let step = match def.kind {
            StageKind::Retrieval => {
                let query = (def.project)(&current, &self.settings.projection);
                let matches = retrieve_matches(self.retriever.as_ref(), &query).await?;
                info!(stage = %stage, items = matches.total(), "Corpus retrieval complete");
                StageStep::Completed(current.apply_stage_result(
                    StageOutput::CorpusRetrieval(matches),
                    &CumulativeUsage::default(),
                )?)
            }
            StageKind::Model {
                max_output_tokens,
                temperature,
            } => {
                self.run_model(def, &current, ctx, max_output_tokens, temperature)
                    .await?
            }
        };

        if let StageStep::Completed(next) = &step {
            self.report(next, stage, def.percent_after()).await?;
        }
        Ok(step)
    }

    async fn run_model(
        &self,
        def: &'static StageDefinition,
        state: &PipelineState,
        ctx: &RunContext,
        max_output_tokens: u32,
        temperature: Option<f32>,
    ) -> std::result::Result<StageStep, StageError> {
        let stage = def.name;
        let allow_clarification = self.clarification_allowed(state);
        let request = ModelRequest {
            system: prompts::system_instruction(stage, allow_clarification),
            user: (def.project)(state, &self.settings.projection),
            images: if stage == StageName::ProblemFraming {
                state.input.images.clone()
            } else {
                Vec::new()
            },
            max_output_tokens,
            temperature: temperature.unwrap_or(self.settings.default_temperature),
        };

        debug!(stage = %stage, context_chars = request.user.chars().count(), "Context projected");

        let mut spent = CumulativeUsage::default();
        let mut attempt: u8 = 0;
        let decoded = loop {
            let invocation = self
                .invoker
                .dispatch(&request)
                .await
                .map_err(|e| StageError::new(e.in_stage(stage.as_str()), spent))?;

            ctx.metrics.record_call(
                stage.as_str(),
                &invocation.usage,
                invocation.cost_usd,
                invocation.latency_ms,
            );
            spent = spent.plus(&invocation.usage, invocation.cost_usd);

            // A refused call is terminal; its spend still lands in the totals
            let invocation = invocation
                .accept(stage.as_str())
                .map_err(|e| StageError::new(e, spent))?;

            let decoded = decode_output(stage, &invocation.text, allow_clarification);

            // Charged whether or not the output parsed
            ctx.budget
                .record(stage.as_str(), &invocation.usage)
                .map_err(|e| StageError::new(e.into(), spent))?;

            match decoded {
                Ok(decoded) => break decoded,
                Err(err @ LoomError::MalformedOutput { .. })
                    if attempt < self.settings.malformed_output_retries =>
                {
                    attempt += 1;
                    warn!(
                        stage = %stage,
                        attempt,
                        error = %err,
                        raw = %preview(&invocation.text, crate::constants::model::LOG_PREVIEW_CHARS),
                        "Malformed stage output, resending unchanged request"
                    );
                }
                Err(err) => return Err(StageError::new(err, spent)),
            }
        };

        match decoded {
            Decoded::Output(output) => {
                let next = state
                    .apply_stage_result(output, &spent)
                    .map_err(|e| StageError::new(e, spent))?;
                info!(stage = %stage, tokens = spent.total(), "Stage complete");
                Ok(StageStep::Completed(next))
            }
            Decoded::Clarify(question) => {
                info!(stage = %stage, "Framing requested clarification");
                Ok(StageStep::NeedsClarification {
                    state: state.with_usage(&spent).with_clarification_request(&question),
                    question,
                })
            }
        }
    }

    async fn report(&self, state: &PipelineState, stage: StageName, percent: u8) -> Result<()> {
        self.sink
            .record_progress(
                state.report_id(),
                &ProgressUpdate {
                    current_step: Some(stage),
                    percent,
                    status: ReportStatus::Processing,
                },
            )
            .await
    }
}

/// Parse and validate one model stage's text
fn decode_output(stage: StageName, raw: &str, allow_clarification: bool) -> Result<Decoded> {
    let name = stage.as_str();
    let output = match stage {
        StageName::ProblemFraming => {
            let mut framing: ProblemFraming = decode(name, raw)?;
            if let Some(question) = framing.clarification() {
                if allow_clarification {
                    return Ok(Decoded::Clarify(question.to_string()));
                }
                // Rounds used up: the flag is ignored, the framing must stand on its own
                debug!("Ignoring clarification request after final round");
                framing.needs_clarification = false;
                framing.clarification_question = None;
                framing.validate(name)?;
            }
            StageOutput::ProblemFraming(framing)
        }
        StageName::CorpusRetrieval => {
            return Err(LoomError::InvalidState(
                "corpus retrieval does not decode model output".to_string(),
            ));
        }
        StageName::ExemplarSelection => StageOutput::ExemplarSelection(decode::<ExemplarSet>(name, raw)?),
        StageName::LiteratureReview => StageOutput::LiteratureReview(decode::<LiteratureNotes>(name, raw)?),
        StageName::Briefing => StageOutput::Briefing(decode::<Briefing>(name, raw)?),
        StageName::ConceptGeneration => StageOutput::ConceptGeneration(decode::<ConceptSet>(name, raw)?),
        StageName::Evaluation => StageOutput::Evaluation(decode::<Evaluation>(name, raw)?),
        StageName::ReportSynthesis => StageOutput::ReportSynthesis(decode::<FinalReport>(name, raw)?),
    };
    Ok(Decoded::Output(output))
}
