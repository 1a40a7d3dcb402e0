//! Context projection
//!
//! One pure builder per stage. Each reads the accumulated [`PipelineState`]
//! and renders only what its stage needs, with every list bounded in item
//! count and item length and every section bounded in total size. A slot
//! that is absent (skipped stage, empty retrieval namespace) renders the
//! explicit [`NOT_AVAILABLE`] marker instead of disappearing.

use super::outputs::{CorpusItem, CorpusMatches, ProblemFraming};
use super::state::PipelineState;
use crate::config::ProjectionConfig;
use crate::constants::projection::NOT_AVAILABLE;
use crate::types::{bounded_list, truncate_chars};
use tracing::warn;

// =============================================================================
// Section builder
// =============================================================================

struct Context<'a> {
    out: String,
    limits: &'a ProjectionConfig,
}

impl<'a> Context<'a> {
    fn new(limits: &'a ProjectionConfig) -> Self {
        Self {
            out: String::new(),
            limits,
        }
    }

    /// Append a titled section, truncated to the section limit
    fn section(&mut self, title: &str, body: &str) -> &mut Self {
        self.section_within(title, body, self.limits.max_section_chars)
    }

    fn section_within(&mut self, title: &str, body: &str, limit: usize) -> &mut Self {
        let body = body.trim();
        let body = if body.is_empty() { NOT_AVAILABLE } else { body };
        self.out.push_str("## ");
        self.out.push_str(title);
        self.out.push('\n');
        self.out.push_str(&truncate_chars(body, limit));
        self.out.push_str("\n\n");
        self
    }

    fn optional(&mut self, title: &str, body: Option<String>) -> &mut Self {
        match body {
            Some(body) => self.section(title, &body),
            None => self.section(title, NOT_AVAILABLE),
        }
    }

    fn finish(&mut self) -> String {
        std::mem::take(&mut self.out).trim_end().to_string()
    }
}

fn framing_digest(framing: &ProblemFraming, limits: &ProjectionConfig) -> String {
    let mut out = format!(
        "Statement: {}\nCore contradiction: {}\nDomain: {}\n",
        truncate_chars(framing.problem_statement.trim(), limits.max_item_chars),
        truncate_chars(framing.core_contradiction.trim(), limits.max_item_chars),
        truncate_chars(framing.domain.trim(), limits.max_item_chars),
    );
    if !framing.constraints.is_empty() {
        out.push_str("Constraints:\n");
        out.push_str(&bounded_list(
            &framing.constraints,
            limits.max_items_per_list,
            limits.max_item_chars,
        ));
    }
    if !framing.success_metrics.is_empty() {
        out.push_str("Success metrics:\n");
        out.push_str(&bounded_list(
            &framing.success_metrics,
            limits.max_items_per_list,
            limits.max_item_chars,
        ));
    }
    out
}

fn framing_section(ctx: &mut Context<'_>, state: &PipelineState) {
    let digest = state
        .outputs
        .problem_framing
        .as_ref()
        .map(|f| framing_digest(f, ctx.limits));
    ctx.optional("Problem framing", digest);
}

fn corpus_items(items: &[CorpusItem], limits: &ProjectionConfig) -> String {
    if items.is_empty() {
        return NOT_AVAILABLE.to_string();
    }
    bounded_list(
        items
            .iter()
            .map(|item| format!("[{}] {}: {}", item.id, item.title, item.text_preview)),
        limits.max_items_per_list,
        limits.max_item_chars,
    )
}

fn corpus_sections(ctx: &mut Context<'_>, matches: Option<&CorpusMatches>) {
    match matches {
        Some(m) => {
            let limits = ctx.limits;
            ctx.section("Known failures", &corpus_items(&m.failures, limits))
                .section("Known bounds", &corpus_items(&m.bounds, limits))
                .section("Cross-domain transfers", &corpus_items(&m.transfers, limits))
                .section("First principles", &corpus_items(&m.principles, limits));
        }
        None => {
            ctx.section("Corpus matches", NOT_AVAILABLE);
        }
    }
}

fn exemplar_section(ctx: &mut Context<'_>, state: &PipelineState) {
    let body = state
        .outputs
        .exemplar_selection
        .as_ref()
        .filter(|set| !set.exemplars.is_empty())
        .map(|set| {
            bounded_list(
                set.exemplars
                    .iter()
                    .map(|e| format!("{} ({}): {}", e.title, e.source_id, e.lesson)),
                ctx.limits.max_items_per_list,
                ctx.limits.max_item_chars,
            )
        });
    ctx.optional("Teaching exemplars", body);
}

fn literature_section(ctx: &mut Context<'_>, state: &PipelineState) {
    let body = state.outputs.literature_review.as_ref().map(|notes| {
        let mut body = bounded_list(
            notes.findings.iter().map(|f| {
                if f.source.trim().is_empty() {
                    f.claim.clone()
                } else {
                    format!("{} [{}]", f.claim, f.source)
                }
            }),
            ctx.limits.max_items_per_list,
            ctx.limits.max_item_chars,
        );
        if !notes.gaps.is_empty() {
            body.push_str("Gaps:\n");
            body.push_str(&bounded_list(
                &notes.gaps,
                ctx.limits.max_items_per_list,
                ctx.limits.max_item_chars,
            ));
        }
        body
    });
    ctx.optional("Literature notes", body);
}

fn briefing_section(ctx: &mut Context<'_>, state: &PipelineState) {
    let body = state.outputs.briefing.as_ref().map(|b| {
        let limits = ctx.limits;
        let mut body = truncate_chars(b.summary.trim(), limits.max_item_chars * 2);
        body.push('\n');
        for (label, items) in [
            ("Key constraints", &b.key_constraints),
            ("Opportunity areas", &b.opportunity_areas),
            ("Risks", &b.risks),
        ] {
            if items.is_empty() {
                continue;
            }
            body.push_str(label);
            body.push_str(":\n");
            body.push_str(&bounded_list(
                items,
                limits.max_items_per_list,
                limits.max_item_chars,
            ));
        }
        body
    });
    ctx.optional("Briefing", body);
}

fn concepts_section(ctx: &mut Context<'_>, state: &PipelineState) {
    let body = state.outputs.concept_generation.as_ref().map(|set| {
        bounded_list(
            set.concepts.iter().map(|c| {
                format!(
                    "{} [{} feasibility, from {}]: {} First test: {}",
                    c.name,
                    c.feasibility.as_str(),
                    if c.source_domain.is_empty() { "n/a" } else { c.source_domain.as_str() },
                    c.mechanism,
                    if c.first_test.is_empty() { "n/a" } else { c.first_test.as_str() },
                )
            }),
            ctx.limits.max_items_per_list,
            ctx.limits.max_item_chars,
        )
    });
    ctx.optional("Concepts", body);
}

fn evaluation_section(ctx: &mut Context<'_>, state: &PipelineState) {
    let body = state.outputs.evaluation.as_ref().map(|eval| {
        let mut body = bounded_list(
            eval.ranked()
                .into_iter()
                .map(|r| format!("{} ({}/10): {}", r.concept, r.score, r.rationale)),
            ctx.limits.max_items_per_list,
            ctx.limits.max_item_chars,
        );
        if !eval.recommended.is_empty() {
            body.push_str("Recommended: ");
            body.push_str(&eval.recommended.join(", "));
            body.push('\n');
        }
        body
    });
    ctx.optional("Evaluation", body);
}

// =============================================================================
// Stage projections
// =============================================================================

/// User input, plus every answered clarification exchange
pub fn problem_framing(state: &PipelineState, limits: &ProjectionConfig) -> String {
    let mut ctx = Context::new(limits);
    let input = state.input.text.trim();
    let input_chars = input.chars().count();
    if input_chars > limits.max_input_chars {
        warn!(
            report_id = %state.report_id(),
            input_chars,
            limit = limits.max_input_chars,
            "User input truncated for framing"
        );
    }
    ctx.section_within("User input", input, limits.max_input_chars);
    if !state.input.images.is_empty() {
        ctx.section(
            "Attachments",
            &format!("{} image(s) attached above.", state.input.images.len()),
        );
    }
    let exchanges = &state.clarification.exchanges;
    if !exchanges.is_empty() {
        let body = exchanges
            .iter()
            .map(|x| format!("Question: {}\nAnswer: {}", x.question.trim(), x.answer.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");
        ctx.section("Clarification", &body);
    }
    ctx.finish()
}

/// Retrieval query text: the framing's search query, else its statement
pub fn corpus_query(state: &PipelineState, limits: &ProjectionConfig) -> String {
    let query = state
        .outputs
        .problem_framing
        .as_ref()
        .map(|f| {
            if f.search_query.trim().is_empty() {
                f.problem_statement.trim()
            } else {
                f.search_query.trim()
            }
        })
        .unwrap_or_else(|| state.input.text.trim());
    truncate_chars(query, limits.max_item_chars)
}

pub fn exemplar_selection(state: &PipelineState, limits: &ProjectionConfig) -> String {
    let mut ctx = Context::new(limits);
    framing_section(&mut ctx, state);
    corpus_sections(&mut ctx, state.outputs.corpus_retrieval.as_ref());
    ctx.finish()
}

pub fn literature_review(state: &PipelineState, limits: &ProjectionConfig) -> String {
    let mut ctx = Context::new(limits);
    framing_section(&mut ctx, state);
    ctx.finish()
}

pub fn briefing(state: &PipelineState, limits: &ProjectionConfig) -> String {
    let mut ctx = Context::new(limits);
    framing_section(&mut ctx, state);
    corpus_sections(&mut ctx, state.outputs.corpus_retrieval.as_ref());
    exemplar_section(&mut ctx, state);
    literature_section(&mut ctx, state);
    ctx.finish()
}

pub fn concept_generation(state: &PipelineState, limits: &ProjectionConfig) -> String {
    let mut ctx = Context::new(limits);
    framing_section(&mut ctx, state);
    briefing_section(&mut ctx, state);
    exemplar_section(&mut ctx, state);
    ctx.finish()
}

pub fn evaluation(state: &PipelineState, limits: &ProjectionConfig) -> String {
    let mut ctx = Context::new(limits);
    framing_section(&mut ctx, state);
    concepts_section(&mut ctx, state);
    ctx.finish()
}

pub fn report_synthesis(state: &PipelineState, limits: &ProjectionConfig) -> String {
    let mut ctx = Context::new(limits);
    framing_section(&mut ctx, state);
    briefing_section(&mut ctx, state);
    literature_section(&mut ctx, state);
    exemplar_section(&mut ctx, state);
    concepts_section(&mut ctx, state);
    evaluation_section(&mut ctx, state);
    ctx.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::CumulativeUsage;
    use crate::pipeline::outputs::*;
    use crate::pipeline::state::StageOutput;
    use crate::pipeline::state::tests::{framing, sample_state};
    use crate::pipeline::StageName;
    use proptest::prelude::*;

    fn limits() -> ProjectionConfig {
        ProjectionConfig::default()
    }

    fn item(id: &str, text: &str) -> CorpusItem {
        CorpusItem {
            id: id.into(),
            title: format!("title {}", id),
            text_preview: text.into(),
            score: 0.5,
        }
    }

    fn framed() -> PipelineState {
        sample_state()
            .apply_stage_result(StageOutput::ProblemFraming(framing()), &CumulativeUsage::default())
            .unwrap()
    }

    #[test]
    fn test_framing_includes_answer_only_when_answered() {
        let asking = sample_state().with_clarification_request("Which climate?");
        assert!(!problem_framing(&asking, &limits()).contains("Clarification"));

        let answered = asking.with_clarification_answer("Hot desert");
        let text = problem_framing(&answered, &limits());
        assert!(text.contains("Question: Which climate?"));
        assert!(text.contains("Answer: Hot desert"));
    }

    #[test]
    fn test_framing_lists_every_clarification_round() {
        let state = sample_state()
            .with_clarification_request("Which climate?")
            .with_clarification_answer("Hot desert")
            .with_clarification_request("Indoor or outdoor?")
            .with_clarification_answer("Outdoor, shaded");
        let text = problem_framing(&state, &limits());

        let first = text.find("Answer: Hot desert").unwrap();
        let second = text.find("Answer: Outdoor, shaded").unwrap();
        assert!(first < second);
        assert!(text.contains("Question: Indoor or outdoor?"));
    }

    #[test]
    fn test_user_input_has_its_own_limit() {
        let mut state = sample_state();
        state.input.text = "x".repeat(limits().max_section_chars + 500);
        let text = problem_framing(&state, &limits());
        assert!(text.contains(&state.input.text));

        let tight = ProjectionConfig {
            max_input_chars: 100,
            ..limits()
        };
        let text = problem_framing(&state, &tight);
        assert!(!text.contains(&"x".repeat(101)));
        assert!(text.contains(&"x".repeat(90)));
    }

    #[test]
    fn test_corpus_query_prefers_search_query() {
        assert_eq!(
            corpus_query(&framed(), &limits()),
            "passive cooling sealed enclosure"
        );
    }

    #[test]
    fn test_skipped_exemplars_render_marker() {
        let state = framed()
            .apply_stage_result(
                StageOutput::CorpusRetrieval(CorpusMatches::default()),
                &CumulativeUsage::default(),
            )
            .unwrap()
            .with_skipped(StageName::ExemplarSelection)
            .unwrap();

        let text = briefing(&state, &limits());
        assert!(text.contains("## Teaching exemplars\n"));
        assert!(text.contains(NOT_AVAILABLE));
        // Literature has not run yet either
        assert!(text.contains("## Literature notes\n"));
    }

    #[test]
    fn test_empty_namespace_renders_marker() {
        let state = framed()
            .apply_stage_result(
                StageOutput::CorpusRetrieval(CorpusMatches {
                    failures: vec![item("f1", "seal failed")],
                    ..Default::default()
                }),
                &CumulativeUsage::default(),
            )
            .unwrap();
        let text = exemplar_selection(&state, &limits());
        assert!(text.contains("[f1] title f1: seal failed"));
        assert!(text.contains(&format!("## Known bounds\n{}", NOT_AVAILABLE)));
    }

    #[test]
    fn test_corpus_list_is_truncated_in_count() {
        let failures: Vec<CorpusItem> = (0..30).map(|i| item(&format!("f{}", i), "x")).collect();
        let state = framed()
            .apply_stage_result(
                StageOutput::CorpusRetrieval(CorpusMatches {
                    failures,
                    ..Default::default()
                }),
                &CumulativeUsage::default(),
            )
            .unwrap();
        let text = exemplar_selection(&state, &limits());
        assert!(text.contains("(22 more omitted)"));
        assert!(!text.contains("[f8]"));
    }

    proptest! {
        #[test]
        fn prop_every_section_is_bounded(
            previews in prop::collection::vec(".{0,2000}", 0..40),
            max_items in 1usize..12,
            max_item_chars in 10usize..400,
            max_section_chars in 50usize..3000,
        ) {
            let limits = ProjectionConfig { max_items_per_list: max_items, max_item_chars, max_section_chars, max_input_chars: max_section_chars };
            let failures: Vec<CorpusItem> = previews
                .iter()
                .enumerate()
                .map(|(i, p)| item(&i.to_string(), p))
                .collect();
            let state = framed()
                .apply_stage_result(
                    StageOutput::CorpusRetrieval(CorpusMatches { failures, ..Default::default() }),
                    &CumulativeUsage::default(),
                )
                .unwrap();

            let text = exemplar_selection(&state, &limits);
            for section in text.split("## ").filter(|s| !s.is_empty()) {
                let body = section.split_once('\n').map(|(_, b)| b).unwrap_or("");
                prop_assert!(body.trim_end().chars().count() <= max_section_chars);
            }
            let bullets = text.lines().filter(|l| l.starts_with("- [")).count();
            prop_assert!(bullets <= max_items);
        }
    }
}
