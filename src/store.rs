//! The issue store seam
//!
//! The analysis core only talks to an [`IssueStore`]. [`crate::gitlab::GitLabClient`]
//! is the production implementation; [`MemoryStore`] serves tests, benches and
//! offline replays.

use crate::error::StoreError;
use crate::model::{ChangeRecord, Issue, IssueState, MergeRequest, SearchMode, SearchQuery, SearchScope};
use crate::text;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

#[async_trait]
pub trait IssueStore: Send + Sync {
    /// Closed issues matching `query` within `scope`.
    async fn search_issues(
        &self,
        query: &SearchQuery,
        scope: &SearchScope,
    ) -> Result<Vec<Issue>, StoreError>;

    /// Merge requests that closed an issue. An unknown issue yields an empty list.
    async fn list_merge_requests_for_issue(
        &self,
        project_id: u64,
        issue_iid: u64,
    ) -> Result<Vec<MergeRequest>, StoreError>;

    async fn get_merge_request_changes(
        &self,
        project_id: u64,
        merge_request_iid: u64,
    ) -> Result<Vec<ChangeRecord>, StoreError>;
}

/// Await `fut`, giving up after `limit` when one is set.
pub async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(StoreError::Timeout(Some(limit)))),
        None => fut.await,
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// An [`IssueStore`] backed by plain collections.
///
/// Searches only return closed issues, like the GitLab searches do. Failures
/// and delays can be injected per search mode, issue and merge request.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    issues: Vec<Issue>,
    merge_requests: HashMap<(u64, u64), Vec<MergeRequest>>,
    changes: HashMap<(u64, u64), Vec<ChangeRecord>>,
    failing_modes: HashSet<SearchMode>,
    slow_modes: HashMap<SearchMode, Duration>,
    failing_issue_iids: HashSet<u64>,
    failing_merge_request_iids: HashSet<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issue(mut self, issue: Issue) -> Self {
        self.issues.push(issue);
        self
    }

    /// Link `merge_request` to the issue `(project_id, issue_iid)`.
    pub fn with_merge_request(mut self, project_id: u64, issue_iid: u64, merge_request: MergeRequest) -> Self {
        self.merge_requests
            .entry((project_id, issue_iid))
            .or_default()
            .push(merge_request);
        self
    }

    pub fn with_changes(mut self, project_id: u64, merge_request_iid: u64, changes: Vec<ChangeRecord>) -> Self {
        self.changes.insert((project_id, merge_request_iid), changes);
        self
    }

    pub fn failing_search(mut self, mode: SearchMode) -> Self {
        self.failing_modes.insert(mode);
        self
    }

    pub fn slow_search(mut self, mode: SearchMode, delay: Duration) -> Self {
        self.slow_modes.insert(mode, delay);
        self
    }

    pub fn failing_merge_request_list(mut self, issue_iid: u64) -> Self {
        self.failing_issue_iids.insert(issue_iid);
        self
    }

    pub fn failing_changes(mut self, merge_request_iid: u64) -> Self {
        self.failing_merge_request_iids.insert(merge_request_iid);
        self
    }

    fn in_scope(issue: &Issue, scope: &SearchScope) -> bool {
        match scope {
            SearchScope::Project(id) => id.parse::<u64>().map_or(true, |p| p == issue.project_id),
            SearchScope::Group(_) | SearchScope::Global => true,
        }
    }

    fn matches(issue: &Issue, query: &SearchQuery) -> bool {
        match query.mode {
            SearchMode::ExactPhrase => {
                let phrase = text::clean(&query.terms.join(" "));
                !phrase.is_empty() && text::clean(&issue.title).contains(&phrase)
            }
            SearchMode::TermDisjunction => {
                let tokens = text::normalize(Some(&issue.title));
                query
                    .terms
                    .iter()
                    .any(|t| tokens.iter().any(|tok| tok.eq_ignore_ascii_case(t)))
            }
            SearchMode::LabelFiltered => {
                !query.terms.is_empty() && query.terms.iter().all(|l| issue.labels.contains(l))
            }
        }
    }
}

#[async_trait]
impl IssueStore for MemoryStore {
    async fn search_issues(
        &self,
        query: &SearchQuery,
        scope: &SearchScope,
    ) -> Result<Vec<Issue>, StoreError> {
        if let Some(delay) = self.slow_modes.get(&query.mode) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing_modes.contains(&query.mode) {
            return Err(StoreError::Network(format!("{:?} search unavailable", query.mode)));
        }
        Ok(self
            .issues
            .iter()
            .filter(|i| i.state == IssueState::Closed)
            .filter(|i| Self::in_scope(i, scope))
            .filter(|i| Self::matches(i, query))
            .cloned()
            .collect())
    }

    async fn list_merge_requests_for_issue(
        &self,
        project_id: u64,
        issue_iid: u64,
    ) -> Result<Vec<MergeRequest>, StoreError> {
        if self.failing_issue_iids.contains(&issue_iid) {
            return Err(StoreError::Network(format!("closed_by for issue {} unavailable", issue_iid)));
        }
        Ok(self
            .merge_requests
            .get(&(project_id, issue_iid))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_merge_request_changes(
        &self,
        project_id: u64,
        merge_request_iid: u64,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        if self.failing_merge_request_iids.contains(&merge_request_iid) {
            return Err(StoreError::Api {
                status: 500,
                message: format!("changes for !{} unavailable", merge_request_iid),
            });
        }
        self.changes
            .get(&(project_id, merge_request_iid))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("merge request !{}", merge_request_iid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn issue(id: u64, title: &str, state: IssueState, labels: &[&str]) -> Issue {
        Issue {
            id,
            iid: id,
            project_id: 1,
            title: title.to_string(),
            description: None,
            labels: labels.iter().map(|l| l.to_string()).collect::<BTreeSet<_>>(),
            state,
            created_at: None,
            web_url: format!("https://gitlab.example/issues/{}", id),
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_issue(issue(1, "Fix status grid view column", IssueState::Closed, &["sql"]))
            .with_issue(issue(2, "Status grid view crashes", IssueState::Open, &["sql"]))
            .with_issue(issue(3, "Dropdown alias missing", IssueState::Closed, &["jsp"]))
    }

    #[tokio::test]
    async fn test_exact_phrase_search_returns_closed_only() {
        let query = SearchQuery::new(SearchMode::ExactPhrase, vec!["status grid view".into()]);
        let found = store().search_issues(&query, &SearchScope::Global).await.unwrap();
        let ids: Vec<_> = found.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_disjunction_and_label_search() {
        let disjunction = SearchQuery::new(
            SearchMode::TermDisjunction,
            vec!["dropdown".into(), "column".into()],
        );
        let found = store().search_issues(&disjunction, &SearchScope::Global).await.unwrap();
        assert_eq!(found.len(), 2);

        let labelled = SearchQuery::new(SearchMode::LabelFiltered, vec!["jsp".into()]);
        let found = store().search_issues(&labelled, &SearchScope::Global).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 3);
    }

    #[tokio::test]
    async fn test_unknown_issue_has_no_merge_requests() {
        let mrs = store().list_merge_requests_for_issue(1, 99).await.unwrap();
        assert!(mrs.is_empty());
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(1)
        };
        let result = bounded(Some(Duration::from_millis(10)), slow).await;
        match result {
            Err(StoreError::Timeout(limit)) => assert_eq!(limit, Some(Duration::from_millis(10))),
            other => panic!("unexpected: {other:?}"),
        }

        let fast = async { Ok::<_, StoreError>(2) };
        assert_eq!(bounded(None, fast).await.unwrap(), 2);
    }
}
