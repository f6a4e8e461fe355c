//! The analysis pipeline
//!
//! `analyze_issue` runs three fan-out waves against an [`IssueStore`]:
//! similar-issue search, merge-request lookup per similar issue, and change
//! fetch per merge request. Recognized change patterns become suggestions.
//! Each wave settles completely before the next starts; failures inside a
//! wave are logged and excluded, and only a wave where everything failed
//! marks its stage as failed.

use crate::config::Config;
use crate::error::{AnalyzeError, StoreError};
use crate::model::{MergeRequest, SearchScope};
use crate::patterns::{extract_from_changes, RuleSet};
use crate::score::{ScoringWeights, SimilarityScorer};
use crate::search::{IssueSearch, ScoredCandidate, SearchOptions, SourceIssue};
use crate::store::{bounded, IssueStore};
use crate::suggest::{generate_all, Suggestion, SuggestionContext};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Completed,
    Pending,
    Failed,
}

impl StageStatus {
    /// Failed only when something was attempted and nothing succeeded.
    fn from_counts(attempted: usize, failed: usize) -> Self {
        if attempted > 0 && failed == attempted {
            StageStatus::Failed
        } else {
            StageStatus::Completed
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Completed => write!(f, "completed"),
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStatus {
    pub similar_issues: StageStatus,
    pub merge_requests: StageStatus,
    pub suggestions: StageStatus,
}

impl Default for AnalysisStatus {
    fn default() -> Self {
        Self {
            similar_issues: StageStatus::Pending,
            merge_requests: StageStatus::Pending,
            suggestions: StageStatus::Pending,
        }
    }
}

/// A merge request found through one of the similar issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMergeRequest {
    /// Id of the similar issue it closed
    pub issue_id: u64,
    #[serde(flatten)]
    pub merge_request: MergeRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub similar_issues: Vec<ScoredCandidate>,
    pub merge_requests: Vec<ResolvedMergeRequest>,
    pub suggestions: Vec<Suggestion>,
    pub status: AnalysisStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisReport {
    fn empty() -> Self {
        Self {
            similar_issues: Vec::new(),
            merge_requests: Vec::new(),
            suggestions: Vec::new(),
            status: AnalysisStatus::default(),
            error: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status.similar_issues == StageStatus::Completed
            && self.status.merge_requests == StageStatus::Completed
            && self.status.suggestions == StageStatus::Completed
    }
}

/// Input to [`Analyzer::analyze`].
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub issue_id: String,
    pub issue_title: String,
    /// Overrides the configured threshold
    pub threshold: Option<f64>,
    pub description: Option<String>,
    pub labels: Vec<String>,
    /// Overrides the configured per-branch wave timeout
    pub timeout: Option<Duration>,
}

impl AnalysisRequest {
    pub fn new(issue_id: impl Into<String>, issue_title: impl Into<String>) -> Self {
        Self {
            issue_id: issue_id.into(),
            issue_title: issue_title.into(),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), AnalyzeError> {
        if self.issue_id.trim().is_empty() {
            return Err(AnalyzeError::Validation("issue id is required".to_string()));
        }
        if self.issue_title.trim().is_empty() {
            return Err(AnalyzeError::Validation("issue title is required".to_string()));
        }
        if let Some(t) = self.threshold {
            if !t.is_finite() || !(0.0..=1.0).contains(&t) {
                return Err(AnalyzeError::Validation(format!(
                    "threshold must be between 0 and 1, got {}",
                    t
                )));
            }
        }
        Ok(())
    }
}

/// Runs analyses against one store with fixed scoring, rules and scope.
pub struct Analyzer<S> {
    store: S,
    scorer: SimilarityScorer,
    options: SearchOptions,
    scope: SearchScope,
    rules: RuleSet,
    threshold: f64,
    dispatch: Dispatch,
}

impl<S: IssueStore> Analyzer<S> {
    /// Default weights, canonical rules, threshold 0.35 and no logging.
    pub fn new(store: S, scope: SearchScope) -> Self {
        let defaults = Config::default();
        Self {
            store,
            scorer: SimilarityScorer::new(ScoringWeights::default()),
            options: defaults.search_options(),
            scope,
            rules: RuleSet::canonical(),
            threshold: defaults.threshold,
            dispatch: crate::logging::silent(),
        }
    }

    pub fn from_config(store: S, config: &Config, dispatch: Dispatch) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            scorer: config.scorer(),
            options: config.search_options(),
            scope: config.scope(),
            rules: config.rule_set()?,
            threshold: config.threshold,
            dispatch,
        })
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn scope(&self) -> &SearchScope {
        &self.scope
    }

    /// Find similar closed issues, their merge requests and suggested edits.
    pub async fn analyze_issue(
        &self,
        issue_id: &str,
        issue_title: &str,
        threshold: Option<f64>,
    ) -> Result<AnalysisReport, AnalyzeError> {
        let mut request = AnalysisRequest::new(issue_id, issue_title);
        request.threshold = threshold;
        self.analyze(request).await
    }

    /// Run the full pipeline for `request` under this analyzer's dispatcher.
    ///
    /// Returns `Err` only for invalid input. A failed search is reported in
    /// the report's status and `error` field.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReport, AnalyzeError> {
        let dispatch = self.dispatch.clone();
        let span = tracing::dispatcher::with_default(&dispatch, || {
            tracing::info_span!("analyze", issue = %request.issue_id)
        });
        self.run(request).instrument(span).with_subscriber(dispatch).await
    }

    async fn run(&self, request: AnalysisRequest) -> Result<AnalysisReport, AnalyzeError> {
        request.validate()?;

        let threshold = request.threshold.unwrap_or(self.threshold);
        let mut options = self.options.clone();
        if request.timeout.is_some() {
            options.query_timeout = request.timeout;
        }
        let wave_timeout = options.query_timeout;

        let source = SourceIssue::new(request.issue_id.trim(), request.issue_title.as_str())
            .with_description(request.description.clone())
            .with_labels(request.labels.iter().cloned());

        let mut report = AnalysisReport::empty();

        let search = IssueSearch::new(&self.store, &self.scorer, &options);
        match search.find_similar(&source, &self.scope, threshold).await {
            Ok(candidates) => {
                report.similar_issues = candidates;
                report.status.similar_issues = StageStatus::Completed;
            }
            Err(err @ AnalyzeError::SearchFailure { .. }) => {
                tracing::error!(error = %err, "similar issue search failed");
                report.status.similar_issues = StageStatus::Failed;
                report.error = Some(err.to_string());
                return Ok(report);
            }
            Err(err) => return Err(err),
        }

        let (merge_requests, status) = self
            .resolve_merge_requests(&report.similar_issues, wave_timeout)
            .await;
        report.merge_requests = merge_requests;
        report.status.merge_requests = status;
        if status != StageStatus::Completed {
            report.error = Some("failed to fetch merge requests for every similar issue".to_string());
            return Ok(report);
        }

        let (suggestions, status) = self
            .collect_suggestions(&mut report.merge_requests, wave_timeout)
            .await;
        report.suggestions = suggestions;
        report.status.suggestions = status;
        if status == StageStatus::Failed {
            report.error = Some("failed to fetch changes for every merge request".to_string());
        }

        tracing::info!(
            similar = report.similar_issues.len(),
            merge_requests = report.merge_requests.len(),
            suggestions = report.suggestions.len(),
            "analysis finished"
        );
        Ok(report)
    }

    /// Second wave: merge requests that closed each similar issue, deduplicated
    /// by id in candidate order.
    async fn resolve_merge_requests(
        &self,
        candidates: &[ScoredCandidate],
        wave_timeout: Option<Duration>,
    ) -> (Vec<ResolvedMergeRequest>, StageStatus) {
        let outcomes = join_all(candidates.iter().map(|c| {
            bounded(
                wave_timeout,
                self.store
                    .list_merge_requests_for_issue(c.issue.project_id, c.issue.iid),
            )
        }))
        .await;

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        let mut failed = 0;
        for (candidate, outcome) in candidates.iter().zip(outcomes) {
            match outcome {
                Ok(mrs) => {
                    tracing::debug!(issue = candidate.issue.id, count = mrs.len(), "merge requests found");
                    resolved.extend(
                        mrs.into_iter()
                            .filter(|mr| seen.insert(mr.id))
                            .map(|merge_request| ResolvedMergeRequest {
                                issue_id: candidate.issue.id,
                                merge_request,
                            }),
                    );
                }
                Err(err) => {
                    failed += 1;
                    log_fetch_failure("merge request list", candidate.issue.id, &err);
                }
            }
        }

        let status = StageStatus::from_counts(candidates.len(), failed);
        tracing::info!(
            candidates = candidates.len(),
            failed,
            merge_requests = resolved.len(),
            "merge request lookup finished"
        );
        (resolved, status)
    }

    /// Third wave: fetch each merge request's changes, store them on the
    /// merge request and turn recognized patterns into suggestions.
    async fn collect_suggestions(
        &self,
        merge_requests: &mut [ResolvedMergeRequest],
        wave_timeout: Option<Duration>,
    ) -> (Vec<Suggestion>, StageStatus) {
        let outcomes = join_all(merge_requests.iter().map(|r| {
            bounded(
                wave_timeout,
                self.store.get_merge_request_changes(
                    r.merge_request.project_id,
                    r.merge_request.iid,
                ),
            )
        }))
        .await;

        let attempted = outcomes.len();
        let mut failed = 0;
        let mut suggestions = Vec::new();
        for (resolved, outcome) in merge_requests.iter_mut().zip(outcomes) {
            match outcome {
                Ok(changes) => {
                    let matches = extract_from_changes(&changes, &self.rules);
                    let context = SuggestionContext::new(resolved.merge_request.web_url.clone())
                        .with_issue(resolved.issue_id);
                    let generated = generate_all(&matches, &context);
                    tracing::debug!(
                        merge_request = resolved.merge_request.id,
                        files = changes.len(),
                        patterns = matches.len(),
                        suggestions = generated.len(),
                        "changes analyzed"
                    );
                    suggestions.extend(generated);
                    resolved.merge_request.changes = changes;
                }
                Err(err) => {
                    failed += 1;
                    log_fetch_failure("merge request changes", resolved.merge_request.id, &err);
                }
            }
        }

        let status = StageStatus::from_counts(attempted, failed);
        tracing::info!(
            merge_requests = attempted,
            failed,
            suggestions = suggestions.len(),
            "change analysis finished"
        );
        (suggestions, status)
    }
}

fn log_fetch_failure(what: &str, id: u64, err: &StoreError) {
    tracing::warn!(id, error = %err, "failed to fetch {}", what);
}
