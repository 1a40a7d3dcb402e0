//! End-to-end orchestrator scenarios against a scripted model transport and
//! an in-memory SQLite database.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, stream};

use reportloom::ai::{
    CumulativeUsage, EventStream, ImageAttachment, ModelReply, ModelRequest, ModelTransport,
    StopReason, StreamEvent, TokenUsage,
};
use reportloom::constants::pipeline::ANSWER_POLL_SECS;
use reportloom::constants::projection::NOT_AVAILABLE;
use reportloom::pipeline::{
    CorpusDocument, InMemoryRetriever, Namespace, PipelineOrchestrator, PipelineState,
    ReportIdentity, ReportInput, ReportSink, ReportStatus, ReportTrigger, ResumeEvent,
    RetryPolicy, RunOutcome, StageName, StageOutput, WaitMode, expire_overdue, record_answer,
};
use reportloom::types::{ErrorCategory, FailureKind, LlmError, LoomError, ReportId, Result};
use reportloom::{Config, Database};

const CALL_INPUT: u32 = 1_000;
const CALL_OUTPUT: u32 = 500;
const CALL_TOTAL: u64 = 1_500;

// =============================================================================
// Scripted transport
// =============================================================================

#[derive(Clone)]
enum Scripted {
    Text(String),
    Refuse,
    Fail(ErrorCategory),
    /// Rate limited with a server-provided wait
    Limited(Duration),
}

#[derive(Debug, Clone)]
struct Call {
    stage: StageName,
    request: ModelRequest,
    streamed: bool,
}

#[derive(Default)]
struct ScriptedTransport {
    queued: Mutex<HashMap<StageName, VecDeque<Scripted>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replies consumed before the stage falls back to its default output
    fn script(&self, stage: StageName, replies: Vec<Scripted>) {
        self.queued
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .extend(replies);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn stages_called(&self) -> Vec<StageName> {
        self.calls().into_iter().map(|c| c.stage).collect()
    }

    fn calls_for(&self, stage: StageName) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.stage == stage).collect()
    }

    fn next_reply(&self, request: &ModelRequest, streamed: bool) -> Result<ModelReply> {
        let stage = stage_of(request);
        self.calls.lock().unwrap().push(Call {
            stage,
            request: request.clone(),
            streamed,
        });

        let scripted = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&stage)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Scripted::Text(default_output(stage).to_string()));

        let usage = TokenUsage::new(CALL_INPUT, CALL_OUTPUT);
        match scripted {
            Scripted::Text(text) => Ok(ModelReply {
                text,
                usage,
                stop: StopReason::EndTurn,
            }),
            Scripted::Refuse => Ok(ModelReply {
                text: String::new(),
                usage,
                stop: StopReason::Refusal,
            }),
            Scripted::Fail(category) => {
                Err(LlmError::with_provider(category, "scripted failure", "scripted").into())
            }
            Scripted::Limited(wait) => Err(LlmError::with_provider(
                ErrorCategory::RateLimit,
                "scripted rate limit",
                "scripted",
            )
            .retry_after(wait)
            .into()),
        }
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "claude-sonnet-4-20250514"
    }

    async fn send(&self, request: &ModelRequest) -> Result<ModelReply> {
        self.next_reply(request, false)
    }

    async fn send_streaming(&self, request: &ModelRequest) -> Result<EventStream> {
        let reply = self.next_reply(request, true)?;
        let split = reply
            .text
            .char_indices()
            .nth(reply.text.chars().count() / 2)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let (head, tail) = reply.text.split_at(split);
        let events = vec![
            Ok(StreamEvent::TextDelta(head.to_string())),
            Ok(StreamEvent::TextDelta(tail.to_string())),
            Ok(StreamEvent::Completed {
                usage: reply.usage,
                stop: reply.stop,
            }),
        ];
        Ok(stream::iter(events).boxed())
    }
}

/// Identify the stage from the role line of its system instruction
fn stage_of(request: &ModelRequest) -> StageName {
    let markers = [
        ("specializing in problem framing", StageName::ProblemFraming),
        ("specializing in learning from past designs", StageName::ExemplarSelection),
        ("specializing in technical literature review", StageName::LiteratureReview),
        ("specializing in design briefings", StageName::Briefing),
        ("specializing in cross-domain concept generation", StageName::ConceptGeneration),
        ("specializing in concept evaluation", StageName::Evaluation),
        ("specializing in engineering design reports", StageName::ReportSynthesis),
    ];
    markers
        .iter()
        .find(|(marker, _)| request.system.contains(marker))
        .map(|(_, stage)| *stage)
        .unwrap_or_else(|| panic!("unrecognized system instruction: {}", request.system))
}

fn default_output(stage: StageName) -> &'static str {
    match stage {
        StageName::ProblemFraming => FRAMING,
        StageName::CorpusRetrieval => unreachable!("retrieval makes no model call"),
        StageName::ExemplarSelection => {
            r#"{"exemplars": [{"source_id": "f-1", "title": "Pack vent failure", "lesson": "Vent paths decide runaway spread"}]}"#
        }
        StageName::LiteratureReview => {
            r#"{"findings": [{"claim": "Phase change material flattens peaks", "source": "J. Power Sources", "relevance": "passive buffering"}], "gaps": ["long-term cycling"]}"#
        }
        StageName::Briefing => {
            r#"{"summary": "Mass and heat pull in opposite directions.", "key_constraints": ["under 2 kg"], "opportunity_areas": ["structural heat paths"], "risks": ["condensation"]}"#
        }
        StageName::ConceptGeneration => {
            r#"{"concepts": [{"name": "Finned shell", "mechanism": "Enclosure wall doubles as heat sink", "source_domain": "avionics", "feasibility": "high", "key_risks": ["mass"], "first_test": "Thermal soak at 45 C"}]}"#
        }
        StageName::Evaluation => {
            r#"{"rankings": [{"concept": "Finned shell", "score": 8, "rationale": "Simple and passive"}], "recommended": ["Finned shell"]}"#
        }
        StageName::ReportSynthesis => {
            r#"{"title": "Passive Cooling for a Light Battery Enclosure", "executive_summary": "A finned shell meets the mass target.", "body_markdown": "Full analysis", "recommendations": ["Build a soak-test rig"]}"#
        }
    }
}

const FRAMING: &str = r#"{
  "needs_clarification": false,
  "problem_statement": "Design a lightweight battery enclosure with passive cooling",
  "core_contradiction": "Mass versus thermal capacity",
  "constraints": ["under 2 kg"],
  "success_metrics": ["cell delta below 5 C"],
  "search_query": "lightweight battery enclosure cooling",
  "domain": "thermal management"
}"#;

const CLARIFY: &str =
    r#"{"needs_clarification": true, "clarification_question": "What ambient climate will the pack see?"}"#;

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    orchestrator: Arc<PipelineOrchestrator>,
    db: Arc<Database>,
    transport: Arc<ScriptedTransport>,
}

fn corpus() -> Vec<CorpusDocument> {
    vec![
        CorpusDocument {
            id: "f-1".into(),
            namespace: Namespace::Failures,
            title: "Battery enclosure vent failure".into(),
            text: "Thermal runaway spread through a sealed enclosure".into(),
        },
        CorpusDocument {
            id: "p-1".into(),
            namespace: Namespace::Principles,
            title: "Passive cooling by conduction".into(),
            text: "Lightweight fins move heat without fans".into(),
        },
    ]
}

fn config_with(f: impl FnOnce(&mut Config)) -> Config {
    let mut config = Config::default();
    f(&mut config);
    config
}

fn harness(config: &Config, documents: Vec<CorpusDocument>, wait_mode: WaitMode) -> Harness {
    let db = Arc::new(Database::open_in_memory().expect("in-memory database"));
    db.initialize().expect("schema");
    let transport = ScriptedTransport::new();
    harness_on(config, db, transport, documents, wait_mode)
}

fn harness_on(
    config: &Config,
    db: Arc<Database>,
    transport: Arc<ScriptedTransport>,
    documents: Vec<CorpusDocument>,
    wait_mode: WaitMode,
) -> Harness {
    let orchestrator = PipelineOrchestrator::new(
        config,
        transport.clone(),
        Arc::new(InMemoryRetriever::new(documents)),
        db.clone(),
    )
    .with_retry_policy(RetryPolicy {
        max_retries: 2,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    })
    .with_wait_mode(wait_mode);

    Harness {
        orchestrator: Arc::new(orchestrator),
        db,
        transport,
    }
}

fn trigger(report_id: &str) -> ReportTrigger {
    ReportTrigger {
        conversation_id: "conv-1".into(),
        report_id: ReportId::new(report_id),
        account_id: "acct-1".into(),
        user_id: "user-1".into(),
        user_input: "Our battery box overheats and is too heavy".into(),
        images: vec![],
    }
}

fn failure_of(outcome: &RunOutcome) -> FailureKind {
    match outcome {
        RunOutcome::Failed { kind, .. } => *kind,
        other => panic!("expected failure, got {:?}", other.status()),
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_all_stages_complete_in_order() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    let mut t = trigger("r-complete");
    t.images = vec![ImageAttachment::from_bytes("image/png", b"\x89PNG")];

    let outcome = h.orchestrator.start(t).await.unwrap();

    let RunOutcome::Completed(state) = &outcome else {
        panic!("expected completion");
    };
    assert_eq!(state.completed_stages, StageName::ALL.to_vec());
    assert!(state.skipped_stages.is_empty());
    assert_eq!(state.usage.total(), 7 * CALL_TOTAL);
    assert_eq!(state.usage.calls, 7);

    assert_eq!(
        h.transport.stages_called(),
        vec![
            StageName::ProblemFraming,
            StageName::ExemplarSelection,
            StageName::LiteratureReview,
            StageName::Briefing,
            StageName::ConceptGeneration,
            StageName::Evaluation,
            StageName::ReportSynthesis,
        ]
    );

    // Only outputs above the streaming threshold stream
    let streamed: Vec<StageName> = h
        .transport
        .calls()
        .into_iter()
        .filter(|c| c.streamed)
        .map(|c| c.stage)
        .collect();
    assert_eq!(
        streamed,
        vec![StageName::ConceptGeneration, StageName::ReportSynthesis]
    );

    // Images go to framing only
    for call in h.transport.calls() {
        let expected = usize::from(call.stage == StageName::ProblemFraming);
        assert_eq!(call.request.images.len(), expected, "{}", call.stage);
    }

    let view = h
        .db
        .report_status(&ReportId::new("r-complete"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.status, ReportStatus::Complete);
    assert_eq!(view.percent_complete, 100);
    assert_eq!(view.total_tokens, 7 * CALL_TOTAL);
    assert_eq!(
        view.title.as_deref(),
        Some("Passive Cooling for a Light Battery Enclosure")
    );
    assert!(view.error_message.is_none());
}

#[tokio::test]
async fn test_exemplar_selection_skipped_without_corpus_matches() {
    let h = harness(&Config::default(), vec![], WaitMode::Block);

    let outcome = h.orchestrator.start(trigger("r-skip")).await.unwrap();
    let state = outcome.state();

    assert_eq!(outcome.status(), ReportStatus::Complete);
    assert_eq!(state.skipped_stages, vec![StageName::ExemplarSelection]);
    assert!(!state.completed_stages.contains(&StageName::ExemplarSelection));
    assert!(state.outputs.exemplar_selection.is_none());
    assert!(h.transport.calls_for(StageName::ExemplarSelection).is_empty());

    let briefing = &h.transport.calls_for(StageName::Briefing)[0];
    assert!(briefing.request.user.contains(NOT_AVAILABLE));
}

#[tokio::test]
async fn test_budget_exceeded_keeps_earlier_stages() {
    // Framing, exemplars and literature fit; briefing's call crosses the ceiling
    let config = config_with(|c| c.pipeline.token_ceiling = 5_000);
    let h = harness(&config, corpus(), WaitMode::Block);

    let outcome = h.orchestrator.start(trigger("r-budget")).await.unwrap();

    assert_eq!(failure_of(&outcome), FailureKind::BudgetExceeded);
    let state = outcome.state();
    assert_eq!(
        state.completed_stages,
        vec![
            StageName::ProblemFraming,
            StageName::CorpusRetrieval,
            StageName::ExemplarSelection,
            StageName::LiteratureReview,
        ]
    );
    assert!(state.outputs.briefing.is_none());
    // The crossing call is still counted
    assert_eq!(state.usage.total(), 4 * CALL_TOTAL);
    assert!(h.transport.calls_for(StageName::ConceptGeneration).is_empty());

    let persisted = h.db.load_state(state.report_id()).await.unwrap().unwrap();
    assert_eq!(persisted.status(), ReportStatus::Failed);
    assert_eq!(persisted.completed_stages.len(), 4);

    let view = h.db.report_status(state.report_id()).await.unwrap().unwrap();
    assert_eq!(
        view.error_message.as_deref(),
        Some(FailureKind::BudgetExceeded.user_message())
    );
}

#[tokio::test]
async fn test_refusal_fails_with_sanitized_message() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.transport
        .script(StageName::ProblemFraming, vec![Scripted::Refuse]);

    let outcome = h.orchestrator.start(trigger("r-refuse")).await.unwrap();

    assert_eq!(failure_of(&outcome), FailureKind::Refusal);
    // Never retried with the same request
    assert_eq!(h.transport.calls().len(), 1);
    // The refused call still counts toward the totals
    assert_eq!(outcome.state().usage.total(), CALL_TOTAL);
    assert_eq!(outcome.state().usage.calls, 1);
    assert!(outcome.state().usage.cost_usd > 0.0);

    let view = h
        .db
        .report_status(&ReportId::new("r-refuse"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.total_tokens, CALL_TOTAL);
    let message = view.error_message.unwrap();
    assert_eq!(message, FailureKind::Refusal.user_message());
    assert!(!message.contains("stop_reason"));
    assert!(!message.contains("scripted"));
}

#[tokio::test(start_paused = true)]
async fn test_clarification_expires_after_deadline() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.transport
        .script(StageName::ProblemFraming, vec![Scripted::Text(CLARIFY.into())]);

    let outcome = h.orchestrator.start(trigger("r-expire")).await.unwrap();

    assert_eq!(failure_of(&outcome), FailureKind::ClarificationExpired);
    let state = outcome.state();
    assert!(state.completed_stages.is_empty());
    assert!(state.outputs.problem_framing.is_none());
    assert_eq!(h.transport.calls().len(), 1);

    let id = ReportId::new("r-expire");
    assert!(h.db.clarification_wait(&id).await.unwrap().is_none());
    let view = h.db.report_status(&id).await.unwrap().unwrap();
    assert_eq!(view.status, ReportStatus::Failed);
    assert!(view.error_message.unwrap().contains("expired"));
}

#[tokio::test]
async fn test_clarification_answer_reruns_framing_once() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.transport
        .script(StageName::ProblemFraming, vec![Scripted::Text(CLARIFY.into())]);
    let id = ReportId::new("r-answer");

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.start(trigger("r-answer")).await });

    let inbox = h.orchestrator.inbox();
    while !inbox.is_waiting(&id) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let view = h.db.report_status(&id).await.unwrap().unwrap();
    assert_eq!(view.status, ReportStatus::Clarifying);
    assert_eq!(
        view.clarification_question.as_deref(),
        Some("What ambient climate will the pack see?")
    );

    let woke = h
        .orchestrator
        .submit_answer(ResumeEvent {
            report_id: id.clone(),
            answer: "Desert, up to 50 C".into(),
        })
        .await
        .unwrap();
    assert!(woke);

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.status(), ReportStatus::Complete);

    let state = outcome.state();
    assert_eq!(state.clarification.answer.as_deref(), Some("Desert, up to 50 C"));
    assert_eq!(state.clarification.answer_round_count, 1);
    assert!(!state.clarification.needs_clarification);

    let framing_calls = h.transport.calls_for(StageName::ProblemFraming);
    assert_eq!(framing_calls.len(), 2);
    assert!(framing_calls[1].request.user.contains("Desert, up to 50 C"));
    // Both framing calls are charged
    assert_eq!(state.usage.total(), 8 * CALL_TOTAL);
}

#[tokio::test]
async fn test_detached_clarification_resumes_from_storage() {
    let h = harness(&Config::default(), corpus(), WaitMode::Detach);
    // Second framing reply asks again; rounds are used up so it must stand alone
    let insistent = r#"{"needs_clarification": true, "clarification_question": "And humidity?",
        "problem_statement": "Cool a light battery box in desert heat",
        "core_contradiction": "Mass versus thermal capacity",
        "search_query": "battery enclosure cooling", "domain": "thermal"}"#;
    h.transport.script(
        StageName::ProblemFraming,
        vec![Scripted::Text(CLARIFY.into()), Scripted::Text(insistent.into())],
    );
    let id = ReportId::new("r-detach");

    let outcome = h.orchestrator.start(trigger("r-detach")).await.unwrap();
    let RunOutcome::AwaitingClarification { question, .. } = &outcome else {
        panic!("expected a suspended run");
    };
    assert_eq!(question, "What ambient climate will the pack see?");
    assert_eq!(outcome.status(), ReportStatus::Clarifying);

    // Nobody is parked in-process; the answer is stored for resume
    let woke = h
        .orchestrator
        .submit_answer(ResumeEvent {
            report_id: id.clone(),
            answer: "Desert".into(),
        })
        .await
        .unwrap();
    assert!(!woke);

    let resumed = h.orchestrator.resume(&id).await.unwrap();
    assert_eq!(resumed.status(), ReportStatus::Complete);

    let framing_calls = h.transport.calls_for(StageName::ProblemFraming);
    assert_eq!(framing_calls.len(), 2);
    assert!(framing_calls[1].request.system.contains("Do not ask questions"));
    let framing = resumed.state().outputs.problem_framing.as_ref().unwrap();
    assert!(!framing.needs_clarification);
}

#[tokio::test]
async fn test_answer_after_deadline_expires_the_run() {
    let h = harness(&Config::default(), corpus(), WaitMode::Detach);
    h.transport
        .script(StageName::ProblemFraming, vec![Scripted::Text(CLARIFY.into())]);
    let id = ReportId::new("r-late");

    let outcome = h.orchestrator.start(trigger("r-late")).await.unwrap();
    let RunOutcome::AwaitingClarification { question, .. } = outcome else {
        panic!("expected a suspended run");
    };

    // The sweeper has not run yet and the deadline is an hour gone
    h.db.record_clarification_wait(&id, &question, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .submit_answer(ResumeEvent {
            report_id: id.clone(),
            answer: "Desert".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LoomError::InvalidState(ref m) if m.contains("expired")));

    let view = h.db.report_status(&id).await.unwrap().unwrap();
    assert_eq!(view.status, ReportStatus::Failed);
    assert_eq!(
        view.error_message.as_deref(),
        Some(FailureKind::ClarificationExpired.user_message())
    );
    assert!(h.db.clarification_wait(&id).await.unwrap().is_none());

    let resumed = h.orchestrator.resume(&id).await.unwrap();
    assert_eq!(failure_of(&resumed), FailureKind::ClarificationExpired);
    assert!(resumed.state().clarification.answer.is_none());
    assert_eq!(h.transport.calls().len(), 1);
}

#[tokio::test]
async fn test_detached_resume_after_deadline_fails_without_answer() {
    let h = harness(&Config::default(), corpus(), WaitMode::Detach);
    h.transport
        .script(StageName::ProblemFraming, vec![Scripted::Text(CLARIFY.into())]);
    let id = ReportId::new("r-late-resume");
    h.orchestrator.start(trigger("r-late-resume")).await.unwrap();

    h.db.record_clarification_wait(&id, "q", Utc::now() - chrono::Duration::minutes(1))
        .await
        .unwrap();
    // Storage refuses the late answer and nothing is marked yet
    assert!(!h.db.record_answer(&id, "Desert").await.unwrap());
    let view = h.db.report_status(&id).await.unwrap().unwrap();
    assert_eq!(view.status, ReportStatus::Clarifying);

    let resumed = h.orchestrator.resume(&id).await.unwrap();
    assert_eq!(failure_of(&resumed), FailureKind::ClarificationExpired);
    assert_eq!(h.transport.calls().len(), 1);
}

#[tokio::test]
async fn test_out_of_process_late_answer_expires_report() {
    let h = harness(&Config::default(), corpus(), WaitMode::Detach);
    h.transport
        .script(StageName::ProblemFraming, vec![Scripted::Text(CLARIFY.into())]);
    let id = ReportId::new("r-late-cli");
    h.orchestrator.start(trigger("r-late-cli")).await.unwrap();

    h.db.record_clarification_wait(&id, "q", Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();
    let err = record_answer(h.db.as_ref(), &id, "Desert", false)
        .await
        .unwrap_err();
    assert!(matches!(err, LoomError::InvalidState(ref m) if m.contains("expired")));

    let state = h.db.load_state(&id).await.unwrap().unwrap();
    assert_eq!(state.status(), ReportStatus::Failed);
    assert!(h.db.clarification_wait(&id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_parked_run_picks_up_answer_from_storage() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.transport
        .script(StageName::ProblemFraming, vec![Scripted::Text(CLARIFY.into())]);
    let id = ReportId::new("r-poll");

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.start(trigger("r-poll")).await });

    let inbox = h.orchestrator.inbox();
    while !inbox.is_waiting(&id) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Another process answers through storage; nothing goes through the inbox
    let answered_at = tokio::time::Instant::now();
    assert!(h.db.record_answer(&id, "Desert, up to 50 C").await.unwrap());

    let outcome = run.await.unwrap().unwrap();
    let waited = answered_at.elapsed();

    assert_eq!(outcome.status(), ReportStatus::Complete);
    // Seen on the next storage poll, not immediately
    assert!(waited >= Duration::from_secs(ANSWER_POLL_SECS - 1));
    assert!(waited < Duration::from_secs(2 * ANSWER_POLL_SECS + 1));
    let framing_calls = h.transport.calls_for(StageName::ProblemFraming);
    assert_eq!(framing_calls.len(), 2);
    assert!(framing_calls[1].request.user.contains("Desert, up to 50 C"));
}

#[tokio::test(start_paused = true)]
async fn test_blocking_resume_waits_only_for_remaining_time() {
    let detached = harness(&Config::default(), corpus(), WaitMode::Detach);
    detached
        .transport
        .script(StageName::ProblemFraming, vec![Scripted::Text(CLARIFY.into())]);
    let id = ReportId::new("r-partial");
    detached.orchestrator.start(trigger("r-partial")).await.unwrap();

    // Most of the 24h window has already passed
    detached
        .db
        .record_clarification_wait(&id, "q", Utc::now() + chrono::Duration::minutes(2))
        .await
        .unwrap();

    let blocking = harness_on(
        &Config::default(),
        detached.db.clone(),
        detached.transport.clone(),
        corpus(),
        WaitMode::Block,
    );
    let started = tokio::time::Instant::now();
    let outcome = blocking.orchestrator.resume(&id).await.unwrap();
    let waited = started.elapsed();

    assert_eq!(failure_of(&outcome), FailureKind::ClarificationExpired);
    assert!(waited >= Duration::from_secs(110));
    assert!(waited <= Duration::from_secs(121));
    assert_eq!(detached.transport.calls().len(), 1);
}

#[tokio::test]
async fn test_answer_rejected_without_open_wait() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.orchestrator.start(trigger("r-closed")).await.unwrap();

    let err = h
        .orchestrator
        .submit_answer(ResumeEvent {
            report_id: ReportId::new("r-closed"),
            answer: "late".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LoomError::InvalidState(_)));

    let err = h
        .orchestrator
        .submit_answer(ResumeEvent {
            report_id: ReportId::new("r-closed"),
            answer: "   ".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LoomError::InvalidState(_)));
}

#[tokio::test]
async fn test_resume_of_finished_report_makes_no_calls() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    let first = h.orchestrator.start(trigger("r-idem")).await.unwrap();
    let calls = h.transport.calls().len();

    let again = h.orchestrator.resume(&ReportId::new("r-idem")).await.unwrap();

    assert_eq!(again.status(), ReportStatus::Complete);
    assert_eq!(again.state().usage, first.state().usage);
    assert_eq!(h.transport.calls().len(), calls);
}

#[tokio::test]
async fn test_resume_continues_at_first_unsettled_stage() {
    // A completed run supplies realistic outputs for the first four stages
    let source = harness(&Config::default(), corpus(), WaitMode::Block);
    let done = source.orchestrator.start(trigger("r-src")).await.unwrap();
    let outputs = &done.state().outputs;

    let per_call = CumulativeUsage::default().plus(&TokenUsage::new(CALL_INPUT, CALL_OUTPUT), 0.0);
    let mut state = PipelineState::new(
        ReportIdentity {
            report_id: ReportId::new("r-mid"),
            conversation_id: "conv-1".into(),
            account_id: "acct-1".into(),
            user_id: "user-1".into(),
        },
        ReportInput {
            text: "Our battery box overheats and is too heavy".into(),
            images: vec![],
        },
    );
    for (output, usage) in [
        (
            StageOutput::ProblemFraming(outputs.problem_framing.clone().unwrap()),
            per_call,
        ),
        (
            StageOutput::CorpusRetrieval(outputs.corpus_retrieval.clone().unwrap()),
            CumulativeUsage::default(),
        ),
        (
            StageOutput::ExemplarSelection(outputs.exemplar_selection.clone().unwrap()),
            per_call,
        ),
        (
            StageOutput::LiteratureReview(outputs.literature_review.clone().unwrap()),
            per_call,
        ),
    ] {
        state = state.apply_stage_result(output, &usage).unwrap();
    }

    // Process "crashed" after checkpointing literature review
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.db.create_report(&state).await.unwrap();

    let outcome = h.orchestrator.resume(&ReportId::new("r-mid")).await.unwrap();

    assert_eq!(outcome.status(), ReportStatus::Complete);
    assert_eq!(
        h.transport.stages_called(),
        vec![
            StageName::Briefing,
            StageName::ConceptGeneration,
            StageName::Evaluation,
            StageName::ReportSynthesis,
        ]
    );
    // Earlier spend carried over, never re-charged
    assert_eq!(outcome.state().usage.total(), 7 * CALL_TOTAL);
}

#[tokio::test]
async fn test_resume_seeds_budget_with_prior_spend() {
    // Ceiling allows five calls in total
    let config = config_with(|c| c.pipeline.token_ceiling = 5 * CALL_TOTAL);
    let h = harness(&config, corpus(), WaitMode::Detach);
    h.transport
        .script(StageName::ProblemFraming, vec![Scripted::Text(CLARIFY.into())]);
    let id = ReportId::new("r-seed");

    h.orchestrator.start(trigger("r-seed")).await.unwrap();
    h.db.record_answer(&id, "Desert").await.unwrap();

    let outcome = h.orchestrator.resume(&id).await.unwrap();

    // clarify + framing + exemplars + literature + briefing = 5 calls fit; concepts cross
    assert_eq!(failure_of(&outcome), FailureKind::BudgetExceeded);
    assert_eq!(h.transport.calls().len(), 6);
    assert!(outcome.state().is_completed(StageName::Briefing));
}

#[tokio::test]
async fn test_malformed_output_retried_once() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.transport.script(
        StageName::Briefing,
        vec![Scripted::Text("I think the answer is a fan.".into())],
    );

    let outcome = h.orchestrator.start(trigger("r-malformed")).await.unwrap();

    assert_eq!(outcome.status(), ReportStatus::Complete);
    let briefing_calls = h.transport.calls_for(StageName::Briefing);
    assert_eq!(briefing_calls.len(), 2);
    // Identical request resent
    assert_eq!(briefing_calls[0].request, briefing_calls[1].request);
    // The unusable attempt is still charged
    assert_eq!(outcome.state().usage.total(), 8 * CALL_TOTAL);
}

#[tokio::test]
async fn test_malformed_output_twice_fails() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.transport.script(
        StageName::Evaluation,
        vec![
            Scripted::Text(r#"{"rankings": []}"#.into()),
            Scripted::Text(r#"{"rankings": [{"concept": "x", "score": 42}]}"#.into()),
        ],
    );

    let outcome = h.orchestrator.start(trigger("r-malformed-2")).await.unwrap();

    assert_eq!(failure_of(&outcome), FailureKind::MalformedOutput);
    assert_eq!(h.transport.calls_for(StageName::Evaluation).len(), 2);
    assert!(outcome.state().outputs.evaluation.is_none());
    assert!(outcome.state().is_completed(StageName::ConceptGeneration));
}

#[tokio::test]
async fn test_retryable_transport_failure_is_rescheduled() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.transport.script(
        StageName::LiteratureReview,
        vec![
            Scripted::Fail(ErrorCategory::Transient),
            Scripted::Fail(ErrorCategory::RateLimit),
        ],
    );

    let outcome = h.orchestrator.start(trigger("r-retry")).await.unwrap();

    assert_eq!(outcome.status(), ReportStatus::Complete);
    assert_eq!(h.transport.calls_for(StageName::LiteratureReview).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_retry_waits_for_server_hint() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.transport.script(
        StageName::LiteratureReview,
        vec![Scripted::Limited(Duration::from_secs(20))],
    );

    let started = tokio::time::Instant::now();
    let outcome = h.orchestrator.start(trigger("r-limited")).await.unwrap();

    assert_eq!(outcome.status(), ReportStatus::Complete);
    assert_eq!(h.transport.calls_for(StageName::LiteratureReview).len(), 2);
    // Backoff alone is a few milliseconds
    assert!(started.elapsed() >= Duration::from_secs(20));
}

#[tokio::test]
async fn test_retries_exhausted_or_fatal_transport_fails() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.transport.script(
        StageName::LiteratureReview,
        vec![Scripted::Fail(ErrorCategory::Network); 3],
    );
    let outcome = h.orchestrator.start(trigger("r-exhaust")).await.unwrap();
    assert_eq!(failure_of(&outcome), FailureKind::Transport);
    assert_eq!(h.transport.calls_for(StageName::LiteratureReview).len(), 3);

    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    h.transport.script(
        StageName::ProblemFraming,
        vec![Scripted::Fail(ErrorCategory::Auth)],
    );
    let outcome = h.orchestrator.start(trigger("r-auth")).await.unwrap();
    assert_eq!(failure_of(&outcome), FailureKind::Transport);
    assert_eq!(h.transport.calls().len(), 1);

    let view = h
        .db
        .report_status(&ReportId::new("r-auth"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        view.error_message.as_deref(),
        Some(FailureKind::Transport.user_message())
    );
}

#[tokio::test]
async fn test_expire_overdue_fails_stale_waits() {
    let h = harness(&Config::default(), corpus(), WaitMode::Detach);
    h.transport
        .script(StageName::ProblemFraming, vec![Scripted::Text(CLARIFY.into())]);
    let id = ReportId::new("r-stale");
    h.orchestrator.start(trigger("r-stale")).await.unwrap();

    // Not yet due
    assert!(expire_overdue(h.db.as_ref(), Utc::now()).await.unwrap().is_empty());

    let later = Utc::now() + chrono::Duration::hours(25);
    let expired = expire_overdue(h.db.as_ref(), later).await.unwrap();
    assert_eq!(expired, vec![id.clone()]);

    let view = h.db.report_status(&id).await.unwrap().unwrap();
    assert_eq!(view.status, ReportStatus::Failed);
    assert_eq!(
        view.error_message.as_deref(),
        Some(FailureKind::ClarificationExpired.user_message())
    );
    assert!(expire_overdue(h.db.as_ref(), later).await.unwrap().is_empty());

    // A late resume reports the terminal state without calling the model
    let resumed = h.orchestrator.resume(&id).await.unwrap();
    assert_eq!(failure_of(&resumed), FailureKind::ClarificationExpired);
    assert_eq!(h.transport.calls().len(), 1);
}

#[tokio::test]
async fn test_resume_unknown_report_is_not_found() {
    let h = harness(&Config::default(), corpus(), WaitMode::Block);
    let err = h
        .orchestrator
        .resume(&ReportId::new("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, LoomError::NotFound(_)));
}
