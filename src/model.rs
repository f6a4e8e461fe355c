//! Domain types shared by the search, matching and suggestion stages.
//!
//! Everything here is an owned, validated snapshot. Raw API payloads are
//! coerced into these shapes in [`crate::gitlab`] and never travel further.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    /// GitLab reports `opened`/`reopened`/`closed`; anything not closed counts as open.
    pub fn from_api(state: &str) -> Self {
        if state.eq_ignore_ascii_case("closed") {
            IssueState::Closed
        } else {
            IssueState::Open
        }
    }
}

/// An issue snapshot from the issue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: u64,
    pub iid: u64,
    pub project_id: u64,
    pub title: String,
    pub description: Option<String>,
    pub labels: BTreeSet<String>,
    pub state: IssueState,
    pub created_at: Option<DateTime<Utc>>,
    pub web_url: String,
}

/// One file's diff within a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub old_path: String,
    pub new_path: String,
    pub diff: String,
}

impl ChangeRecord {
    /// The path the change is known by: the new path, or the old one for deletions.
    pub fn path(&self) -> &str {
        if self.new_path.is_empty() {
            &self.old_path
        } else {
            &self.new_path
        }
    }
}

/// A merge request linked to an issue, with its changes once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: u64,
    pub iid: u64,
    pub project_id: u64,
    pub title: String,
    pub description: Option<String>,
    pub web_url: String,
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
}

/// How the terms of a [`SearchQuery`] are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// All terms as a single quoted phrase.
    ExactPhrase,
    /// Any of the terms.
    TermDisjunction,
    /// Issues carrying all of the terms as labels.
    LabelFiltered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub terms: Vec<String>,
    pub mode: SearchMode,
}

impl SearchQuery {
    pub fn new(mode: SearchMode, terms: Vec<String>) -> Self {
        Self { terms, mode }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.iter().all(|t| t.trim().is_empty())
    }

    /// Render the terms as a GitLab search string.
    ///
    /// Label-filtered queries have no search string; their terms go into the
    /// `labels` parameter instead.
    pub fn search_string(&self) -> String {
        match self.mode {
            SearchMode::ExactPhrase => format!("\"{}\"", self.terms.join(" ")),
            SearchMode::TermDisjunction => self.terms.join(" | "),
            SearchMode::LabelFiltered => String::new(),
        }
    }
}

/// Where to search for candidate issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum SearchScope {
    /// Numeric id or full path of a group.
    Group(String),
    /// Numeric id or full path of a project.
    Project(String),
    /// Every issue the token can see.
    Global,
}

impl std::fmt::Display for SearchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchScope::Group(id) => write!(f, "group {}", id),
            SearchScope::Project(id) => write!(f, "project {}", id),
            SearchScope::Global => write!(f, "all issues"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_state_from_api() {
        assert_eq!(IssueState::from_api("closed"), IssueState::Closed);
        assert_eq!(IssueState::from_api("opened"), IssueState::Open);
        assert_eq!(IssueState::from_api("reopened"), IssueState::Open);
    }

    #[test]
    fn test_change_record_path_falls_back_to_old_path() {
        let deleted = ChangeRecord {
            old_path: "db/ezConfiguration.sql".into(),
            new_path: String::new(),
            diff: String::new(),
        };
        assert_eq!(deleted.path(), "db/ezConfiguration.sql");
    }

    #[test]
    fn test_search_string_per_mode() {
        let terms = vec!["grid".to_string(), "column".to_string()];
        assert_eq!(
            SearchQuery::new(SearchMode::ExactPhrase, terms.clone()).search_string(),
            "\"grid column\""
        );
        assert_eq!(
            SearchQuery::new(SearchMode::TermDisjunction, terms.clone()).search_string(),
            "grid | column"
        );
        assert_eq!(
            SearchQuery::new(SearchMode::LabelFiltered, terms).search_string(),
            ""
        );
    }

    #[test]
    fn test_empty_query_detection() {
        assert!(SearchQuery::new(SearchMode::TermDisjunction, vec![]).is_empty());
        assert!(SearchQuery::new(SearchMode::ExactPhrase, vec!["  ".into()]).is_empty());
        assert!(!SearchQuery::new(SearchMode::ExactPhrase, vec!["grid".into()]).is_empty());
    }
}
