//! Stage identifiers and the fixed stage table.
//!
//! Stages run strictly in table order. Each definition names its
//! dependencies, its context projection, its output-size hint and the
//! condition under which it is skipped.

use serde::{Deserialize, Serialize};

use super::projector;
use super::state::PipelineState;
use crate::config::ProjectionConfig;

/// Stage identifier, numbered in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    ProblemFraming = 1,
    CorpusRetrieval = 2,
    ExemplarSelection = 3,
    LiteratureReview = 4,
    Briefing = 5,
    ConceptGeneration = 6,
    Evaluation = 7,
    ReportSynthesis = 8,
}

impl StageName {
    /// Total number of stages
    pub const COUNT: usize = 8;

    pub const ALL: [StageName; Self::COUNT] = [
        Self::ProblemFraming,
        Self::CorpusRetrieval,
        Self::ExemplarSelection,
        Self::LiteratureReview,
        Self::Briefing,
        Self::ConceptGeneration,
        Self::Evaluation,
        Self::ReportSynthesis,
    ];

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Zero-based position in the stage order
    pub fn index(&self) -> usize {
        self.as_u8() as usize - 1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProblemFraming => "problem_framing",
            Self::CorpusRetrieval => "corpus_retrieval",
            Self::ExemplarSelection => "exemplar_selection",
            Self::LiteratureReview => "literature_review",
            Self::Briefing => "briefing",
            Self::ConceptGeneration => "concept_generation",
            Self::Evaluation => "evaluation",
            Self::ReportSynthesis => "report_synthesis",
        }
    }

    /// Human-readable label for progress output
    pub fn label(&self) -> &'static str {
        match self {
            Self::ProblemFraming => "Framing the problem",
            Self::CorpusRetrieval => "Searching the corpus",
            Self::ExemplarSelection => "Selecting exemplars",
            Self::LiteratureReview => "Reviewing literature",
            Self::Briefing => "Writing the briefing",
            Self::ConceptGeneration => "Generating concepts",
            Self::Evaluation => "Evaluating concepts",
            Self::ReportSynthesis => "Writing the report",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.as_str() == s)
    }

    pub fn definition(&self) -> &'static StageDefinition {
        &STAGES[self.index()]
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage produces its output
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageKind {
    /// One model call; `temperature` of `None` uses the configured default
    Model {
        max_output_tokens: u32,
        temperature: Option<f32>,
    },
    /// Corpus lookup; no model call, no budget impact
    Retrieval,
}

/// Static stage descriptor
pub struct StageDefinition {
    pub name: StageName,
    pub kind: StageKind,
    /// Must be completed before this stage runs
    pub depends_on: &'static [StageName],
    /// Read when present; must be completed or skipped
    pub optional: &'static [StageName],
    /// Renders the stage's input text (the query text for retrieval)
    pub project: fn(&PipelineState, &ProjectionConfig) -> String,
    pub should_skip: fn(&PipelineState) -> bool,
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("depends_on", &self.depends_on)
            .field("optional", &self.optional)
            .finish()
    }
}

impl StageDefinition {
    /// Progress percentage reported before the stage runs
    pub fn percent_before(&self) -> u8 {
        (self.name.index() * 100 / StageName::COUNT) as u8
    }

    /// Progress percentage reported once the stage is merged
    pub fn percent_after(&self) -> u8 {
        ((self.name.index() + 1) * 100 / StageName::COUNT) as u8
    }
}

fn never(_: &PipelineState) -> bool {
    false
}

/// Exemplars are only selected when retrieval found anything at all
fn no_corpus_matches(state: &PipelineState) -> bool {
    state
        .outputs
        .corpus_retrieval
        .as_ref()
        .is_none_or(|matches| matches.is_empty())
}

use StageName::*;

pub static STAGES: [StageDefinition; StageName::COUNT] = [
    StageDefinition {
        name: ProblemFraming,
        kind: StageKind::Model {
            max_output_tokens: 4_096,
            temperature: Some(0.3),
        },
        depends_on: &[],
        optional: &[],
        project: projector::problem_framing,
        should_skip: never,
    },
    StageDefinition {
        name: CorpusRetrieval,
        kind: StageKind::Retrieval,
        depends_on: &[ProblemFraming],
        optional: &[],
        project: projector::corpus_query,
        should_skip: never,
    },
    StageDefinition {
        name: ExemplarSelection,
        kind: StageKind::Model {
            max_output_tokens: 8_192,
            temperature: Some(0.4),
        },
        depends_on: &[ProblemFraming, CorpusRetrieval],
        optional: &[],
        project: projector::exemplar_selection,
        should_skip: no_corpus_matches,
    },
    StageDefinition {
        name: LiteratureReview,
        kind: StageKind::Model {
            max_output_tokens: 8_192,
            temperature: None,
        },
        depends_on: &[ProblemFraming],
        optional: &[],
        project: projector::literature_review,
        should_skip: never,
    },
    StageDefinition {
        name: Briefing,
        kind: StageKind::Model {
            max_output_tokens: 12_000,
            temperature: None,
        },
        depends_on: &[ProblemFraming, CorpusRetrieval, LiteratureReview],
        optional: &[ExemplarSelection],
        project: projector::briefing,
        should_skip: never,
    },
    StageDefinition {
        name: ConceptGeneration,
        kind: StageKind::Model {
            max_output_tokens: 24_000,
            temperature: Some(0.9),
        },
        depends_on: &[ProblemFraming, Briefing],
        optional: &[ExemplarSelection],
        project: projector::concept_generation,
        should_skip: never,
    },
    StageDefinition {
        name: Evaluation,
        kind: StageKind::Model {
            max_output_tokens: 16_000,
            temperature: Some(0.2),
        },
        depends_on: &[ProblemFraming, ConceptGeneration],
        optional: &[],
        project: projector::evaluation,
        should_skip: never,
    },
    StageDefinition {
        name: ReportSynthesis,
        kind: StageKind::Model {
            max_output_tokens: 32_000,
            temperature: None,
        },
        depends_on: &[
            ProblemFraming,
            CorpusRetrieval,
            LiteratureReview,
            Briefing,
            ConceptGeneration,
            Evaluation,
        ],
        optional: &[ExemplarSelection],
        project: projector::report_synthesis,
        should_skip: never,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_enum_order() {
        for (i, def) in STAGES.iter().enumerate() {
            assert_eq!(def.name.index(), i);
            assert_eq!(StageName::ALL[i], def.name);
        }
    }

    #[test]
    fn test_dependencies_point_backwards() {
        for def in &STAGES {
            for dep in def.depends_on.iter().chain(def.optional) {
                assert!(dep.index() < def.name.index(), "{} -> {}", def.name, dep);
            }
        }
    }

    #[test]
    fn test_parse_roundtrip_names() {
        for name in StageName::ALL {
            assert_eq!(StageName::parse(name.as_str()), Some(name));
        }
        assert_eq!(StageName::parse("nope"), None);
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&StageName::ConceptGeneration).unwrap();
        assert_eq!(json, "\"concept_generation\"");
    }

    #[test]
    fn test_percentages() {
        assert_eq!(ProblemFraming.definition().percent_before(), 0);
        assert_eq!(ReportSynthesis.definition().percent_after(), 100);
        assert!(Briefing.definition().percent_before() < Briefing.definition().percent_after());
    }

    #[test]
    fn test_only_large_stages_exceed_streaming_threshold() {
        let threshold = crate::constants::model::STREAMING_THRESHOLD_TOKENS;
        let streaming: Vec<StageName> = STAGES
            .iter()
            .filter(|d| matches!(d.kind, StageKind::Model { max_output_tokens, .. } if max_output_tokens > threshold))
            .map(|d| d.name)
            .collect();
        assert_eq!(streaming, vec![ConceptGeneration, ReportSynthesis]);
    }
}
