//! Similar-issue search
//!
//! Fans several independent queries out to the issue store, merges and
//! deduplicates what comes back, then scores, filters and ranks the
//! candidates against the source issue.

use crate::error::{AnalyzeError, StoreError};
use crate::model::{Issue, SearchMode, SearchQuery, SearchScope};
use crate::score::{ScoreBreakdown, ScoringInput, SimilarityScorer};
use crate::store::{bounded, IssueStore};
use crate::text;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

/// The issue being compared against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIssue {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

impl SourceIssue {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = String>) -> Self {
        self.labels = labels.into_iter().collect();
        self
    }

    fn scoring_input(&self) -> ScoringInput<'_> {
        ScoringInput::title(&self.title)
            .with_description(self.description.as_deref())
            .with_labels(&self.labels)
    }

    fn is_same_issue(&self, issue: &Issue) -> bool {
        self.id.trim() == issue.id.to_string()
    }
}

/// An issue that survived scoring, with the signals behind its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    #[serde(flatten)]
    pub issue: Issue,
    pub similarity: f64,
    pub breakdown: ScoreBreakdown,
}

impl ScoredCandidate {
    pub fn percent(&self) -> u32 {
        (self.similarity * 100.0).round() as u32
    }
}

/// Knobs for query construction and result shaping.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// How many significant title tokens go into the disjunction query
    pub top_terms: usize,
    /// Domain vocabulary that triggers the keyword query
    pub keywords: Vec<String>,
    /// Cap on returned candidates, `None` for no cap
    pub max_results: Option<usize>,
    /// Upper bound on each individual query
    pub query_timeout: Option<Duration>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_terms: 5,
            keywords: Vec::new(),
            max_results: Some(10),
            query_timeout: None,
        }
    }
}

/// Build the independent queries for a source issue.
///
/// Queries without usable terms are left out.
pub fn build_queries(source: &SourceIssue, options: &SearchOptions) -> Vec<SearchQuery> {
    let mut queries = Vec::with_capacity(4);

    let phrase = source.title.trim();
    if !phrase.is_empty() {
        queries.push(SearchQuery::new(SearchMode::ExactPhrase, vec![phrase.to_string()]));
    }

    let tokens = text::normalize(Some(&source.title));
    let terms = text::significant_terms(&tokens, options.top_terms);
    if !terms.is_empty() {
        queries.push(SearchQuery::new(SearchMode::TermDisjunction, terms));
    }

    let haystack = match &source.description {
        Some(d) => format!("{}\n{}", source.title, d),
        None => source.title.clone(),
    };
    let keywords: Vec<String> = text::matched_keywords(&haystack, &options.keywords)
        .into_iter()
        .map(str::to_string)
        .collect();
    if !keywords.is_empty() {
        queries.push(SearchQuery::new(SearchMode::TermDisjunction, keywords));
    }

    if !source.labels.is_empty() {
        queries.push(SearchQuery::new(
            SearchMode::LabelFiltered,
            source.labels.iter().cloned().collect(),
        ));
    }

    queries.retain(|q| !q.is_empty());
    queries
}

/// Merge query results in order, keeping the first occurrence of each id.
pub fn merge_unique(result_sets: Vec<Vec<Issue>>) -> Vec<Issue> {
    let mut seen = HashSet::new();
    result_sets
        .into_iter()
        .flatten()
        .filter(|issue| seen.insert(issue.id))
        .collect()
}

/// Runs the query fan-out and ranking against one store.
pub struct IssueSearch<'a, S: IssueStore + ?Sized> {
    store: &'a S,
    scorer: &'a SimilarityScorer,
    options: &'a SearchOptions,
}

impl<'a, S: IssueStore + ?Sized> IssueSearch<'a, S> {
    pub fn new(store: &'a S, scorer: &'a SimilarityScorer, options: &'a SearchOptions) -> Self {
        Self {
            store,
            scorer,
            options,
        }
    }

    /// Find closed issues similar to `source`, best first.
    ///
    /// A failed or timed-out query contributes nothing; only when every
    /// query fails is the search itself an error.
    pub async fn find_similar(
        &self,
        source: &SourceIssue,
        scope: &SearchScope,
        threshold: f64,
    ) -> Result<Vec<ScoredCandidate>, AnalyzeError> {
        let queries = build_queries(source, self.options);
        tracing::info!(
            source = %source.id,
            %scope,
            queries = queries.len(),
            threshold,
            "searching for similar issues"
        );
        if queries.is_empty() {
            return Err(AnalyzeError::Validation(
                "issue title has no searchable text".to_string(),
            ));
        }

        let outcomes = join_all(queries.iter().map(|query| {
            bounded(self.options.query_timeout, self.store.search_issues(query, scope))
        }))
        .await;

        let attempted = outcomes.len();
        let mut last_error: Option<StoreError> = None;
        let mut result_sets = Vec::with_capacity(attempted);
        for (query, outcome) in queries.iter().zip(outcomes) {
            match outcome {
                Ok(issues) => {
                    tracing::debug!(mode = ?query.mode, hits = issues.len(), "search query finished");
                    result_sets.push(issues);
                }
                Err(err) => {
                    tracing::warn!(mode = ?query.mode, error = %err, "search query failed");
                    last_error = Some(err);
                }
            }
        }

        if result_sets.is_empty() {
            let last_error = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no query completed".to_string());
            return Err(AnalyzeError::SearchFailure {
                attempted,
                last_error,
            });
        }

        let candidates = merge_unique(result_sets);
        let total = candidates.len();
        let ranked = self.rank(source, candidates, threshold);
        tracing::info!(
            source = %source.id,
            candidates = total,
            kept = ranked.len(),
            threshold,
            "similar issue search finished"
        );
        Ok(ranked)
    }

    /// Score, drop the source itself and anything under `threshold`, then
    /// sort best first. The sort is stable so ties keep their merge order.
    pub fn rank(&self, source: &SourceIssue, candidates: Vec<Issue>, threshold: f64) -> Vec<ScoredCandidate> {
        let source_input = source.scoring_input();
        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .filter(|issue| !source.is_same_issue(issue))
            .filter_map(|issue| {
                let candidate_input = ScoringInput::title(&issue.title)
                    .with_description(issue.description.as_deref())
                    .with_labels(&issue.labels);
                let sim = self.scorer.evaluate(&source_input, &candidate_input);
                if sim.score >= threshold {
                    Some(ScoredCandidate {
                        issue,
                        similarity: sim.score,
                        breakdown: sim.breakdown,
                    })
                } else {
                    tracing::trace!(candidate = issue.id, score = sim.score, "below threshold");
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        if let Some(max) = self.options.max_results {
            scored.truncate(max);
        }
        scored
    }
}
