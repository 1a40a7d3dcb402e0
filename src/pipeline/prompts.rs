//! System instructions per model stage.
//!
//! The user message comes from the projector; these are the fixed
//! instructions plus the JSON contract each decoder in `outputs` expects.

use super::stages::StageName;
use crate::ai::PromptBuilder;

const FRAMING_SCHEMA: &str = r#"{
  "needs_clarification": false,
  "clarification_question": null,
  "problem_statement": "one paragraph restating the engineering problem",
  "core_contradiction": "the central trade-off that makes this hard",
  "constraints": ["hard constraint"],
  "success_metrics": ["measurable target"],
  "search_query": "short query for the engineering corpus",
  "domain": "primary engineering domain"
}"#;

const EXEMPLAR_SCHEMA: &str = r#"{
  "exemplars": [
    {"source_id": "corpus item id", "title": "item title", "lesson": "what this case teaches for the problem"}
  ]
}"#;

const LITERATURE_SCHEMA: &str = r#"{
  "findings": [
    {"claim": "established result", "source": "paper, standard or product", "relevance": "why it matters here"}
  ],
  "gaps": ["what the literature does not answer"]
}"#;

const BRIEFING_SCHEMA: &str = r#"{
  "summary": "two or three paragraphs",
  "key_constraints": ["constraint"],
  "opportunity_areas": ["where a solution is likely"],
  "risks": ["risk"]
}"#;

const CONCEPT_SCHEMA: &str = r#"{
  "concepts": [
    {
      "name": "short concept name",
      "mechanism": "how it works physically",
      "source_domain": "where the idea comes from",
      "feasibility": "high | medium | low",
      "key_risks": ["risk"],
      "first_test": "cheapest experiment that would falsify it"
    }
  ]
}"#;

const EVALUATION_SCHEMA: &str = r#"{
  "rankings": [
    {"concept": "concept name", "score": 7, "rationale": "why this score"}
  ],
  "recommended": ["concept name"]
}"#;

const REPORT_SCHEMA: &str = r#"{
  "title": "report title",
  "executive_summary": "one paragraph",
  "body_markdown": "full report in markdown",
  "recommendations": ["next step"]
}"#;

/// System instruction for a model stage.
///
/// `allow_clarification` only affects framing: once the answer rounds are
/// used up the model is told to frame with what it has.
pub fn system_instruction(stage: StageName, allow_clarification: bool) -> String {
    match stage {
        StageName::ProblemFraming => framing(allow_clarification),
        StageName::CorpusRetrieval => String::new(),
        StageName::ExemplarSelection => PromptBuilder::new()
            .role("engineering analyst", "learning from past designs")
            .objectives(&[
                "Pick the corpus items that teach something concrete about this problem",
                "State each lesson in terms of the problem's contradiction",
                "Return an empty list if nothing applies",
            ])
            .focus(
                "the corpus items listed in the context",
                &["Do NOT cite items that are not in the context"],
            )
            .schema(EXEMPLAR_SCHEMA)
            .build(),
        StageName::LiteratureReview => PromptBuilder::new()
            .role("research engineer", "technical literature review")
            .objectives(&[
                "Summarize the established results that bear on the problem",
                "Name sources specifically enough to be looked up",
                "List open gaps",
            ])
            .anti_patterns(
                &["Generic textbook statements"],
                &["Specific results with numbers and sources"],
            )
            .schema(LITERATURE_SCHEMA)
            .build(),
        StageName::Briefing => PromptBuilder::new()
            .role("chief engineer", "design briefings")
            .objectives(&[
                "Condense framing, corpus evidence and literature into one briefing",
                "Separate hard constraints from preferences",
                "Point at the most promising opportunity areas",
            ])
            .text("Sections marked not available ran but produced nothing usable. Do not assume their content.")
            .schema(BRIEFING_SCHEMA)
            .build(),
        StageName::ConceptGeneration => PromptBuilder::new()
            .role("inventive design engineer", "cross-domain concept generation")
            .objectives(&[
                "Generate distinct solution concepts that resolve the core contradiction",
                "Explain each mechanism physically",
                "Give each concept a cheap first test",
            ])
            .anti_patterns(
                &["Variations of one idea", "Concepts without a mechanism"],
                &["Concepts from different physical principles"],
            )
            .schema(CONCEPT_SCHEMA)
            .build(),
        StageName::Evaluation => PromptBuilder::new()
            .role("design reviewer", "concept evaluation")
            .objectives(&[
                "Score every concept from 1 to 10 against the success metrics",
                "Justify each score in one or two sentences",
                "Recommend the concepts worth prototyping",
            ])
            .focus(
                "the concepts listed in the context",
                &["Use the concept names exactly as given", "Scores are integers from 1 to 10"],
            )
            .schema(EVALUATION_SCHEMA)
            .build(),
        StageName::ReportSynthesis => PromptBuilder::new()
            .role("technical writer", "engineering design reports")
            .objectives(&[
                "Write the final report from the accumulated analysis",
                "Lead with the recommended concepts and why",
                "End with concrete next steps",
            ])
            .text("Sections marked not available ran but produced nothing usable. Say so rather than filling the gap.")
            .schema(REPORT_SCHEMA)
            .build(),
    }
}

fn framing(allow_clarification: bool) -> String {
    let builder = PromptBuilder::new()
        .role("systems engineer", "problem framing")
        .objectives(&[
            "Restate the user's problem precisely",
            "Identify the core contradiction",
            "List hard constraints and measurable success metrics",
            "Write a short search query for the engineering corpus",
        ]);

    let builder = if allow_clarification {
        builder.section(
            "Clarification",
            "If the input is too vague to frame, set needs_clarification to true and ask ONE \
             specific question in clarification_question. Leave the other fields empty.",
        )
    } else {
        builder.section(
            "Clarification",
            "Do not ask questions. Frame the problem with the information given, \
             stating any assumptions in constraints.",
        )
    };

    builder.schema(FRAMING_SCHEMA).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_model_stage_has_schema() {
        for stage in StageName::ALL {
            let prompt = system_instruction(stage, true);
            if stage == StageName::CorpusRetrieval {
                assert!(prompt.is_empty());
            } else {
                assert!(prompt.contains("<OUTPUT_FORMAT>"), "{}", stage);
            }
        }
    }

    #[test]
    fn test_framing_clarification_toggle() {
        assert!(system_instruction(StageName::ProblemFraming, true).contains("set needs_clarification to true"));
        assert!(system_instruction(StageName::ProblemFraming, false).contains("Do not ask questions"));
    }
}
