//! GitLab REST API integration
//!
//! Implements [`IssueStore`] over the v4 API and a couple of account-level
//! helpers used by the CLI. Responses are read as untyped JSON and coerced
//! into the domain types right here; entries missing required fields are
//! dropped with a warning instead of failing the whole call.

use crate::error::StoreError;
use crate::model::{ChangeRecord, Issue, IssueState, MergeRequest, SearchMode, SearchQuery, SearchScope};
use crate::store::IssueStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub const DEFAULT_GITLAB_URL: &str = "https://gitlab.com";

/// Results per page for list and search endpoints (GitLab's maximum)
const PER_PAGE: &str = "100";

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

/// Truncate an API error body and redact anything that looks like a credential.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "glpat-", // personal access token prefix
        "gloas-", // OAuth application secret prefix
        "glptt-", // pipeline trigger token prefix
    ];

    let truncated = if body.chars().count() > MAX_ERROR_BODY_LEN {
        let head: String = body.chars().take(MAX_ERROR_BODY_LEN).collect();
        format!("{}... (truncated)", head)
    } else {
        body.to_string()
    };

    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(error details redacted - may contain sensitive data)".to_string();
    }

    truncated
}

/// Pull a readable message out of a GitLab error body.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error_description", "error"] {
            match value.get(key) {
                Some(Value::String(s)) => return sanitize_error_body(s),
                Some(other) if !other.is_null() => return sanitize_error_body(&other.to_string()),
                _ => {}
            }
        }
    }
    sanitize_error_body(body)
}

fn status_error(status: reqwest::StatusCode, body: &str) -> StoreError {
    let message = error_message(body);
    match status.as_u16() {
        401 | 403 => StoreError::Auth(message),
        404 => StoreError::NotFound(message),
        code => StoreError::Api {
            status: code,
            message,
        },
    }
}

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Deserialize)]
struct RawIssue {
    id: Option<u64>,
    iid: Option<u64>,
    project_id: Option<u64>,
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    labels: Vec<Value>,
    state: Option<String>,
    created_at: Option<String>,
    web_url: Option<String>,
}

impl RawIssue {
    fn into_issue(self) -> Option<Issue> {
        let labels = self
            .labels
            .into_iter()
            .filter_map(|label| match label {
                Value::String(name) => Some(name),
                Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect();

        Some(Issue {
            id: self.id?,
            iid: self.iid?,
            project_id: self.project_id?,
            title: self.title.filter(|t| !t.trim().is_empty())?,
            description: self.description.filter(|d| !d.is_empty()),
            labels,
            state: self
                .state
                .as_deref()
                .map(IssueState::from_api)
                .unwrap_or(IssueState::Open),
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
            web_url: self.web_url.unwrap_or_default(),
        })
    }
}

#[derive(Deserialize)]
struct RawMergeRequest {
    id: Option<u64>,
    iid: Option<u64>,
    project_id: Option<u64>,
    title: Option<String>,
    description: Option<String>,
    web_url: Option<String>,
}

impl RawMergeRequest {
    fn into_merge_request(self, fallback_project: u64) -> Option<MergeRequest> {
        Some(MergeRequest {
            id: self.id?,
            iid: self.iid?,
            project_id: self.project_id.unwrap_or(fallback_project),
            title: self.title.unwrap_or_default(),
            description: self.description.filter(|d| !d.is_empty()),
            web_url: self.web_url.unwrap_or_default(),
            changes: Vec::new(),
        })
    }
}

#[derive(Deserialize)]
struct RawChange {
    old_path: Option<String>,
    new_path: Option<String>,
    diff: Option<String>,
}

impl RawChange {
    fn into_change(self) -> Option<ChangeRecord> {
        let old_path = self.old_path.unwrap_or_default();
        let new_path = self.new_path.unwrap_or_default();
        if old_path.is_empty() && new_path.is_empty() {
            return None;
        }
        Some(ChangeRecord {
            old_path,
            new_path,
            diff: self.diff.unwrap_or_default(),
        })
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Deserialize each element of a JSON array on its own, dropping the ones
/// that don't fit.
fn coerce_list<T, R>(value: Value, what: &str, convert: impl Fn(R) -> Option<T>) -> Result<Vec<T>, StoreError>
where
    R: for<'de> Deserialize<'de>,
{
    let Value::Array(items) = value else {
        return Err(StoreError::Decode(format!("expected a list of {}", what)));
    };
    let total = items.len();
    let converted: Vec<T> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<R>(item).ok())
        .filter_map(convert)
        .collect();
    if converted.len() < total {
        tracing::warn!(
            kind = what,
            dropped = total - converted.len(),
            "dropped malformed entries from GitLab response"
        );
    }
    Ok(converted)
}

fn parse_issues(value: Value) -> Result<Vec<Issue>, StoreError> {
    coerce_list(value, "issues", RawIssue::into_issue)
}

fn parse_merge_requests(value: Value, project_id: u64) -> Result<Vec<MergeRequest>, StoreError> {
    coerce_list(value, "merge requests", |raw: RawMergeRequest| {
        raw.into_merge_request(project_id)
    })
}

fn parse_changes(value: Value) -> Result<Vec<ChangeRecord>, StoreError> {
    match value {
        Value::Object(mut map) => {
            let changes = map.remove("changes").unwrap_or(Value::Array(Vec::new()));
            coerce_list(changes, "changes", RawChange::into_change)
        }
        other => coerce_list(other, "changes", RawChange::into_change),
    }
}

// ============================================================================
// Rate limits
// ============================================================================

/// Rate-limit state reported with a response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimit {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |names: &[&str]| -> Option<u64> {
            names
                .iter()
                .filter_map(|n| headers.get(*n))
                .filter_map(|v| v.to_str().ok())
                .find_map(|v| v.trim().parse().ok())
        };
        Self {
            limit: read(&["ratelimit-limit", "x-ratelimit-limit"]),
            remaining: read(&["ratelimit-remaining", "x-ratelimit-remaining"]),
            reset_at: read(&["ratelimit-reset", "x-ratelimit-reset"])
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// A GitLab v4 API client authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct GitLabClient {
    http: reqwest::Client,
    base: Url,
    token: String,
    timeout: Duration,
}

impl GitLabClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("Invalid GitLab URL: {}", base_url))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("GitLab URL cannot be used as a base: {}", base_url);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("precedent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            base,
            token: token.to_string(),
            timeout,
        })
    }

    /// `{base}/api/v4/{segments...}` with each segment percent-encoded, so
    /// group and project paths like `acme/web` work as ids.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["api", "v4"]).extend(segments);
        }
        url
    }

    async fn get_json(&self, url: Url) -> Result<(Value, HeaderMap), StoreError> {
        tracing::debug!(path = url.path(), "GitLab request");
        let resp = self
            .http
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = status_error(status, &body);
            tracing::warn!(status = status.as_u16(), path = url.path(), error = %err, "GitLab API error");
            return Err(err);
        }

        let value = resp
            .json::<Value>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok((value, headers))
    }

    fn search_url(&self, query: &SearchQuery, scope: &SearchScope) -> Url {
        let mut url = match (query.mode, scope) {
            (SearchMode::LabelFiltered, SearchScope::Group(id)) => self.endpoint(&["groups", id.as_str(), "issues"]),
            (SearchMode::LabelFiltered, SearchScope::Project(id)) => self.endpoint(&["projects", id.as_str(), "issues"]),
            (_, SearchScope::Group(id)) => self.endpoint(&["groups", id.as_str(), "search"]),
            (_, SearchScope::Project(id)) => self.endpoint(&["projects", id.as_str(), "search"]),
            (_, SearchScope::Global) => self.endpoint(&["issues"]),
        };

        {
            let mut pairs = url.query_pairs_mut();
            match (query.mode, scope) {
                (SearchMode::LabelFiltered, SearchScope::Global) => {
                    pairs.append_pair("scope", "all");
                    pairs.append_pair("labels", &query.terms.join(","));
                }
                (SearchMode::LabelFiltered, _) => {
                    pairs.append_pair("labels", &query.terms.join(","));
                }
                (_, SearchScope::Global) => {
                    pairs.append_pair("scope", "all");
                    pairs.append_pair("search", &query.search_string());
                }
                _ => {
                    pairs.append_pair("scope", "issues");
                    pairs.append_pair("search", &query.search_string());
                }
            }
            pairs.append_pair("state", "closed");
            pairs.append_pair("per_page", PER_PAGE);
        }
        url
    }

    /// Open issues assigned to `username`, with the current rate-limit state.
    pub async fn assigned_issues(&self, username: &str) -> Result<(Vec<Issue>, RateLimit), StoreError> {
        let mut url = self.endpoint(&["issues"]);
        url.query_pairs_mut()
            .append_pair("assignee_username", username)
            .append_pair("state", "opened")
            .append_pair("scope", "all")
            .append_pair("per_page", PER_PAGE);
        let (value, headers) = self.get_json(url).await?;
        let issues = parse_issues(value)?;
        tracing::info!(username, count = issues.len(), "fetched assigned issues");
        Ok((issues, RateLimit::from_headers(&headers)))
    }

    /// Verify the token by fetching the authenticated user. Returns the username.
    pub async fn check_access(&self) -> Result<String, StoreError> {
        let (value, _) = self.get_json(self.endpoint(&["user"])).await?;
        value
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Decode("user response has no username".to_string()))
    }

    /// Transport failure, with the configured limit attached to timeouts.
    fn request_error(&self, err: reqwest::Error) -> StoreError {
        match StoreError::from(err) {
            StoreError::Timeout(None) => StoreError::Timeout(Some(self.timeout)),
            other => other,
        }
    }
}

#[async_trait]
impl IssueStore for GitLabClient {
    async fn search_issues(
        &self,
        query: &SearchQuery,
        scope: &SearchScope,
    ) -> Result<Vec<Issue>, StoreError> {
        let (value, _) = self.get_json(self.search_url(query, scope)).await?;
        parse_issues(value)
    }

    async fn list_merge_requests_for_issue(
        &self,
        project_id: u64,
        issue_iid: u64,
    ) -> Result<Vec<MergeRequest>, StoreError> {
        let project = project_id.to_string();
        let iid = issue_iid.to_string();
        let url = self.endpoint(&["projects", project.as_str(), "issues", iid.as_str(), "closed_by"]);
        match self.get_json(url).await {
            Ok((value, _)) => parse_merge_requests(value, project_id),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    async fn get_merge_request_changes(
        &self,
        project_id: u64,
        merge_request_iid: u64,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let project = project_id.to_string();
        let iid = merge_request_iid.to_string();
        let url = self.endpoint(&["projects", project.as_str(), "merge_requests", iid.as_str(), "changes"]);
        let (value, _) = self.get_json(url).await?;
        parse_changes(value)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> GitLabClient {
        GitLabClient::new("https://gitlab.example.com", "glpat-test", Duration::from_secs(5)).unwrap()
    }

    // ========================================================================
    // URL construction
    // ========================================================================

    #[test]
    fn test_endpoint_encodes_group_paths() {
        let url = client().endpoint(&["groups", "acme/web", "search"]);
        assert_eq!(url.as_str(), "https://gitlab.example.com/api/v4/groups/acme%2Fweb/search");
    }

    #[test]
    fn test_endpoint_keeps_base_subpath() {
        let client = GitLabClient::new("https://example.com/gitlab/", "t", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint(&["user"]).as_str(),
            "https://example.com/gitlab/api/v4/user"
        );
    }

    #[test]
    fn test_group_search_url() {
        let query = SearchQuery::new(
            SearchMode::TermDisjunction,
            vec!["grid".into(), "column".into()],
        );
        let url = client().search_url(&query, &SearchScope::Group("8".into()));
        assert_eq!(url.path(), "/api/v4/groups/8/search");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("scope".into(), "issues".into())));
        assert!(pairs.contains(&("search".into(), "grid | column".into())));
        assert!(pairs.contains(&("state".into(), "closed".into())));
    }

    #[test]
    fn test_label_search_url() {
        let query = SearchQuery::new(SearchMode::LabelFiltered, vec!["sql".into(), "views".into()]);
        let url = client().search_url(&query, &SearchScope::Group("8".into()));
        assert_eq!(url.path(), "/api/v4/groups/8/issues");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("labels".into(), "sql,views".into())));
        assert!(!pairs.iter().any(|(k, _)| k == "search"));
    }

    #[test]
    fn test_global_phrase_search_url() {
        let query = SearchQuery::new(SearchMode::ExactPhrase, vec!["grid view".into()]);
        let url = client().search_url(&query, &SearchScope::Global);
        assert_eq!(url.path(), "/api/v4/issues");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("scope".into(), "all".into())));
        assert!(pairs.contains(&("search".into(), "\"grid view\"".into())));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(GitLabClient::new("not a url", "t", Duration::from_secs(1)).is_err());
    }

    // ========================================================================
    // Payload coercion
    // ========================================================================

    #[test]
    fn test_parse_issues_coerces_and_drops_malformed() {
        let payload = json!([
            {
                "id": 501, "iid": 12, "project_id": 7,
                "title": "Fix status grid view column display",
                "description": "",
                "labels": ["sql", {"name": "views", "color": "#fff"}],
                "state": "closed",
                "created_at": "2024-03-01T10:15:00.000Z",
                "web_url": "https://gitlab.example.com/acme/web/-/issues/12"
            },
            { "id": 502, "title": "missing iid and project" },
            "not even an object"
        ]);
        let issues = parse_issues(payload).unwrap();
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert_eq!(issue.id, 501);
        assert_eq!(issue.state, IssueState::Closed);
        assert!(issue.description.is_none());
        assert!(issue.labels.contains("sql") && issue.labels.contains("views"));
        assert_eq!(
            issue.created_at.map(|d| d.to_rfc3339()),
            Some("2024-03-01T10:15:00+00:00".to_string())
        );
    }

    #[test]
    fn test_parse_issues_rejects_non_list() {
        let err = parse_issues(json!({"message": "oops"})).unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[test]
    fn test_parse_merge_requests_uses_fallback_project() {
        let payload = json!([
            {"id": 9001, "iid": 44, "title": "Add status column", "web_url": "https://gitlab.example.com/mr/44"},
            {"title": "no ids"}
        ]);
        let mrs = parse_merge_requests(payload, 7).unwrap();
        assert_eq!(mrs.len(), 1);
        assert_eq!(mrs[0].project_id, 7);
        assert_eq!(mrs[0].iid, 44);
        assert!(mrs[0].changes.is_empty());
    }

    #[test]
    fn test_parse_changes_from_merge_request_body() {
        let payload = json!({
            "id": 9001,
            "changes": [
                {"old_path": "db/ezConfiguration.sql", "new_path": "db/ezConfiguration.sql",
                 "diff": "+EXECUTE sp_SetView 'Q','V','N'"},
                {"diff": "no paths"}
            ]
        });
        let changes = parse_changes(payload).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path(), "db/ezConfiguration.sql");
    }

    #[test]
    fn test_parse_changes_without_changes_key() {
        assert!(parse_changes(json!({"id": 1})).unwrap().is_empty());
    }

    // ========================================================================
    // Errors
    // ========================================================================

    #[test]
    fn test_status_error_mapping() {
        use reqwest::StatusCode;
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, r#"{"message":"401 Unauthorized"}"#),
            StoreError::Auth(_)
        ));
        assert!(status_error(StatusCode::NOT_FOUND, r#"{"message":"404 Not found"}"#).is_not_found());
        match status_error(StatusCode::BAD_GATEWAY, "upstream down") {
            StoreError::Api { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "upstream down");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_sanitize_error_body_redacts_tokens() {
        assert_eq!(
            sanitize_error_body("invalid glpat-abcdef"),
            "(error details redacted - may contain sensitive data)"
        );
        let long = "x".repeat(500);
        let sanitized = sanitize_error_body(&long);
        assert!(sanitized.ends_with("... (truncated)"));
        assert!(sanitized.len() < 250);
    }

    #[test]
    fn test_error_message_prefers_message_field() {
        assert_eq!(
            error_message(r#"{"message": {"labels": ["is invalid"]}}"#),
            r#"{"labels":["is invalid"]}"#
        );
        assert_eq!(error_message(r#"{"error": "insufficient_scope"}"#), "insufficient_scope");
    }

    // ========================================================================
    // Rate limits
    // ========================================================================

    #[test]
    fn test_rate_limit_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("ratelimit-limit", "2000".parse().unwrap());
        headers.insert("x-ratelimit-remaining", "1999".parse().unwrap());
        headers.insert("ratelimit-reset", "1700000000".parse().unwrap());
        let rl = RateLimit::from_headers(&headers);
        assert_eq!(rl.limit, Some(2000));
        assert_eq!(rl.remaining, Some(1999));
        assert_eq!(rl.reset_at.map(|d| d.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn test_rate_limit_missing_headers() {
        assert_eq!(RateLimit::from_headers(&HeaderMap::new()), RateLimit::default());
    }
}
