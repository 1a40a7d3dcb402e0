//! Corpus retrieval
//!
//! The retriever is a pure lookup from query text to ranked items in four
//! namespaces. It is not a model call and never touches the token budget.
//!
//! [`InMemoryRetriever`] scores by query-term overlap, which is enough for a
//! local JSON corpus and for tests. Ties break on id so ordering is
//! deterministic across runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use super::outputs::{CorpusItem, CorpusMatches};
use crate::constants::retrieval::{MIN_SCORE, TOP_K_PER_NAMESPACE};
use crate::types::{LoomError, Result, truncate_chars};

const PREVIEW_CHARS: usize = 280;

/// Corpus partitions searched by the retrieval stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Failures,
    Bounds,
    Transfers,
    Principles,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Self::Failures,
        Self::Bounds,
        Self::Transfers,
        Self::Principles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Failures => "failures",
            Self::Bounds => "bounds",
            Self::Transfers => "transfers",
            Self::Principles => "principles",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalQuery {
    pub query_text: String,
    pub namespaces: Vec<Namespace>,
}

impl RetrievalQuery {
    /// Query over every namespace
    pub fn all(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            namespaces: Namespace::ALL.to_vec(),
        }
    }
}

/// One ranked hit
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusHit {
    pub namespace: Namespace,
    pub item: CorpusItem,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Ranked hits, best first within each namespace
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<CorpusHit>>;
}

pub type SharedRetriever = Arc<dyn Retriever>;

/// Run a query over all namespaces and group the hits
pub async fn retrieve_matches(retriever: &dyn Retriever, query_text: &str) -> Result<CorpusMatches> {
    let hits = retriever.search(&RetrievalQuery::all(query_text)).await?;
    let mut matches = CorpusMatches::default();
    for hit in hits {
        let bucket = match hit.namespace {
            Namespace::Failures => &mut matches.failures,
            Namespace::Bounds => &mut matches.bounds,
            Namespace::Transfers => &mut matches.transfers,
            Namespace::Principles => &mut matches.principles,
        };
        bucket.push(hit.item);
    }
    Ok(matches)
}

// =============================================================================
// In-memory corpus
// =============================================================================

/// Stored corpus document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusDocument {
    pub id: String,
    pub namespace: Namespace,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct InMemoryRetriever {
    documents: Vec<(CorpusDocument, HashSet<String>)>,
    top_k: usize,
    min_score: f32,
}

impl Default for InMemoryRetriever {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl InMemoryRetriever {
    pub fn new(documents: Vec<CorpusDocument>) -> Self {
        let documents = documents
            .into_iter()
            .map(|doc| {
                let terms = terms(&format!("{} {}", doc.title, doc.text));
                (doc, terms)
            })
            .collect();
        Self {
            documents,
            top_k: TOP_K_PER_NAMESPACE,
            min_score: MIN_SCORE,
        }
    }

    /// Load a JSON array of [`CorpusDocument`]
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let documents: Vec<CorpusDocument> = serde_json::from_str(&content).map_err(|e| {
            LoomError::Config(format!("Invalid corpus file {}: {}", path.display(), e))
        })?;
        tracing::info!(documents = documents.len(), path = %path.display(), "Loaded corpus");
        Ok(Self::new(documents))
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<CorpusHit>> {
        let query_terms = terms(&query.query_text);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for namespace in &query.namespaces {
            let mut ranked: Vec<CorpusHit> = self
                .documents
                .iter()
                .filter(|(doc, _)| doc.namespace == *namespace)
                .filter_map(|(doc, doc_terms)| {
                    let overlap = query_terms.intersection(doc_terms).count();
                    let score = overlap as f32 / query_terms.len() as f32;
                    (score >= self.min_score).then(|| CorpusHit {
                        namespace: *namespace,
                        item: CorpusItem {
                            id: doc.id.clone(),
                            title: doc.title.clone(),
                            text_preview: truncate_chars(doc.text.trim(), PREVIEW_CHARS),
                            score,
                        },
                    })
                })
                .collect();

            ranked.sort_by(|a, b| {
                b.item
                    .score
                    .partial_cmp(&a.item.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.item.id.cmp(&b.item.id))
            });
            ranked.truncate(self.top_k);
            hits.extend(ranked);
        }

        tracing::debug!(hits = hits.len(), "Corpus search complete");
        Ok(hits)
    }
}

/// Lowercased alphanumeric terms of at least three characters
fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, namespace: Namespace, text: &str) -> CorpusDocument {
        CorpusDocument {
            id: id.into(),
            namespace,
            title: format!("doc {}", id),
            text: text.into(),
        }
    }

    fn corpus() -> InMemoryRetriever {
        InMemoryRetriever::new(vec![
            doc("f1", Namespace::Failures, "sealed enclosure overheated in desert sun"),
            doc("f2", Namespace::Failures, "gearbox lubricant failure"),
            doc("b1", Namespace::Bounds, "passive cooling limit for sealed enclosure"),
            doc("t1", Namespace::Transfers, "termite mound passive cooling"),
        ])
    }

    #[tokio::test]
    async fn test_groups_by_namespace() {
        let matches = retrieve_matches(&corpus(), "passive cooling sealed enclosure")
            .await
            .unwrap();

        assert_eq!(matches.bounds[0].id, "b1");
        assert_eq!(matches.transfers[0].id, "t1");
        assert_eq!(matches.failures.len(), 1);
        assert!(matches.principles.is_empty());
    }

    #[tokio::test]
    async fn test_ranking_is_deterministic() {
        let retriever = InMemoryRetriever::new(vec![
            doc("b", Namespace::Bounds, "alpha beta"),
            doc("a", Namespace::Bounds, "alpha beta"),
            doc("c", Namespace::Bounds, "alpha beta gamma"),
        ])
        .with_min_score(0.0);

        let hits = retriever
            .search(&RetrievalQuery::all("alpha beta gamma"))
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.item.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_top_k_and_empty_query() {
        let retriever = corpus().with_top_k(0);
        let matches = retrieve_matches(&retriever, "passive cooling").await.unwrap();
        assert!(matches.is_empty());

        let matches = retrieve_matches(&corpus(), "  ").await.unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_load_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.json");
        std::fs::write(
            &path,
            r#"[{"id": "p1", "namespace": "principles", "title": "Fourier", "text": "heat flows down gradients"}]"#,
        )
        .unwrap();

        let retriever = InMemoryRetriever::from_json_file(&path).unwrap();
        assert_eq!(retriever.len(), 1);

        std::fs::write(&path, r#"[{"id": "x", "namespace": "misc"}]"#).unwrap();
        assert!(matches!(
            InMemoryRetriever::from_json_file(&path),
            Err(LoomError::Config(_))
        ));
    }
}
