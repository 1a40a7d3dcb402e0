//! Strongly typed stage outputs
//!
//! One struct per stage. Model stages are decoded from JSON and then
//! checked by [`Validate`]; anything that fails becomes `MalformedOutput`.

use serde::{Deserialize, Serialize};

use crate::ai::Validate;
use crate::types::{LoomError, Result, require_items, require_text};

// =============================================================================
// 1. Problem framing
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemFraming {
    /// Set when the input is too thin to frame without asking the user
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_question: Option<String>,
    #[serde(default)]
    pub problem_statement: String,
    #[serde(default)]
    pub core_contradiction: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub success_metrics: Vec<String>,
    /// Query text for corpus retrieval
    #[serde(default)]
    pub search_query: String,
    #[serde(default)]
    pub domain: String,
}

impl ProblemFraming {
    /// Question to ask, when clarification is requested with a usable question
    pub fn clarification(&self) -> Option<&str> {
        if !self.needs_clarification {
            return None;
        }
        self.clarification_question
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }
}

impl Validate for ProblemFraming {
    fn validate(&self, stage: &str) -> Result<()> {
        if self.needs_clarification {
            // a clarification request only needs its question
            return match self.clarification() {
                Some(_) => Ok(()),
                None => Err(LoomError::malformed(
                    stage,
                    "needs_clarification set without a clarification_question",
                )),
            };
        }
        require_text(stage, "problem_statement", &self.problem_statement)?;
        require_text(stage, "core_contradiction", &self.core_contradiction)?;
        require_text(stage, "domain", &self.domain)
    }
}

// =============================================================================
// 2. Corpus retrieval
// =============================================================================

/// One ranked corpus hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusItem {
    pub id: String,
    pub title: String,
    pub text_preview: String,
    pub score: f32,
}

/// Retrieval results grouped by the four corpus namespaces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusMatches {
    #[serde(default)]
    pub failures: Vec<CorpusItem>,
    #[serde(default)]
    pub bounds: Vec<CorpusItem>,
    #[serde(default)]
    pub transfers: Vec<CorpusItem>,
    #[serde(default)]
    pub principles: Vec<CorpusItem>,
}

impl CorpusMatches {
    pub fn total(&self) -> usize {
        self.failures.len() + self.bounds.len() + self.transfers.len() + self.principles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// =============================================================================
// 3. Exemplar selection
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub source_id: String,
    pub title: String,
    pub lesson: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExemplarSet {
    #[serde(default)]
    pub exemplars: Vec<Exemplar>,
}

impl Validate for ExemplarSet {
    fn validate(&self, stage: &str) -> Result<()> {
        // an empty selection is a valid answer
        for exemplar in &self.exemplars {
            require_text(stage, "exemplars[].lesson", &exemplar.lesson)?;
        }
        Ok(())
    }
}

// =============================================================================
// 4. Literature review
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub claim: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub relevance: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiteratureNotes {
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub gaps: Vec<String>,
}

impl Validate for LiteratureNotes {
    fn validate(&self, stage: &str) -> Result<()> {
        for finding in &self.findings {
            require_text(stage, "findings[].claim", &finding.claim)?;
        }
        Ok(())
    }
}

// =============================================================================
// 5. Briefing
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Briefing {
    pub summary: String,
    #[serde(default)]
    pub key_constraints: Vec<String>,
    #[serde(default)]
    pub opportunity_areas: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

impl Validate for Briefing {
    fn validate(&self, stage: &str) -> Result<()> {
        require_text(stage, "summary", &self.summary)
    }
}

// =============================================================================
// 6. Concept generation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feasibility {
    High,
    Medium,
    Low,
}

impl Feasibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    pub mechanism: String,
    #[serde(default)]
    pub source_domain: String,
    pub feasibility: Feasibility,
    #[serde(default)]
    pub key_risks: Vec<String>,
    #[serde(default)]
    pub first_test: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptSet {
    pub concepts: Vec<Concept>,
}

impl Validate for ConceptSet {
    fn validate(&self, stage: &str) -> Result<()> {
        require_items(stage, "concepts", &self.concepts)?;
        for concept in &self.concepts {
            require_text(stage, "concepts[].name", &concept.name)?;
            require_text(stage, "concepts[].mechanism", &concept.mechanism)?;
        }
        Ok(())
    }
}

// =============================================================================
// 7. Evaluation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub concept: String,
    pub score: u8,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub rankings: Vec<Ranking>,
    #[serde(default)]
    pub recommended: Vec<String>,
}

impl Evaluation {
    /// Rankings sorted best first
    pub fn ranked(&self) -> Vec<&Ranking> {
        let mut sorted: Vec<&Ranking> = self.rankings.iter().collect();
        sorted.sort_by(|a, b| b.score.cmp(&a.score));
        sorted
    }
}

impl Validate for Evaluation {
    fn validate(&self, stage: &str) -> Result<()> {
        require_items(stage, "rankings", &self.rankings)?;
        for ranking in &self.rankings {
            require_text(stage, "rankings[].concept", &ranking.concept)?;
            if !(1..=10).contains(&ranking.score) {
                return Err(LoomError::malformed(
                    stage,
                    format!(
                        "score for '{}' must be 1-10, got {}",
                        ranking.concept, ranking.score
                    ),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// 8. Report synthesis
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub title: String,
    pub executive_summary: String,
    pub body_markdown: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl Validate for FinalReport {
    fn validate(&self, stage: &str) -> Result<()> {
        require_text(stage, "title", &self.title)?;
        require_text(stage, "executive_summary", &self.executive_summary)?;
        require_text(stage, "body_markdown", &self.body_markdown)
    }
}

// =============================================================================
// Tests
// =============================================================================
