//! Suggested edits derived from historical change patterns
//!
//! Each recognized [`PatternMatch`] becomes one [`Suggestion`] carrying the
//! literal statements a developer would likely need to write again.

use crate::patterns::{ChangeType, Domain, PatternMatch};
use serde::{Deserialize, Serialize};

/// A suggested change, traced back to the files and merge request it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    #[serde(rename = "type")]
    pub kind: Domain,
    pub change_type: ChangeType,
    pub title: String,
    pub description: String,
    /// Literal statements or tags, in the order they appeared
    pub specific_changes: Vec<String>,
    pub related_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_merge_request: Option<String>,
    /// Id of the similar issue whose merge request showed the pattern
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_issue: Option<u64>,
}

/// Where a pattern was observed.
#[derive(Debug, Clone, Default)]
pub struct SuggestionContext {
    pub merge_request_url: Option<String>,
    pub issue_id: Option<u64>,
}

impl SuggestionContext {
    pub fn new(merge_request_url: impl Into<String>) -> Self {
        Self {
            merge_request_url: Some(merge_request_url.into()),
            issue_id: None,
        }
    }

    pub fn with_issue(mut self, issue_id: u64) -> Self {
        self.issue_id = Some(issue_id);
        self
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn view_update_changes(m: &PatternMatch) -> Vec<String> {
    let mut changes = Vec::new();
    if let [query, viewset, name, ..] = m.main_match.captured_groups.as_slice() {
        changes.push(format!(
            "EXECUTE sp_SetView '{}', '{}', '{}'",
            query, viewset, name
        ));
    } else {
        changes.push(m.main_match.full_text.clone());
    }
    changes.extend(
        m.related_matches
            .iter()
            .filter(|r| r.full_text.contains("sp_SetWhereClause"))
            .map(|r| r.full_text.clone()),
    );
    changes
}

fn dropdown_update_changes(m: &PatternMatch) -> Vec<String> {
    let args = m
        .main_match
        .captured_groups
        .first()
        .map(|a| a.trim())
        .unwrap_or_default();
    let statement = if args.is_empty() {
        "EXECUTE sp_SetDropdown".to_string()
    } else {
        format!("EXECUTE sp_SetDropdown {}", args)
    };
    std::iter::once(statement)
        .chain(m.related_matches.iter().map(|r| r.full_text.clone()))
        .collect()
}

fn template_update_changes(m: &PatternMatch) -> Vec<String> {
    std::iter::once(m.main_match.full_text.trim().to_string())
        .chain(m.related_matches.iter().map(|r| r.full_text.clone()))
        .collect()
}

/// Turn a pattern match into a suggestion.
///
/// Change types without a template (custom rules) produce nothing.
pub fn generate(m: &PatternMatch, context: &SuggestionContext) -> Option<Suggestion> {
    let file = file_name(&m.file_path);
    let (title, description, specific_changes) = match &m.change_type {
        ChangeType::ViewUpdate => (
            "View Configuration Update".to_string(),
            format!("Update view configuration in {}", file),
            view_update_changes(m),
        ),
        ChangeType::DropdownUpdate => (
            "Dropdown Configuration Update".to_string(),
            format!("Update dropdown configuration in {}", file),
            dropdown_update_changes(m),
        ),
        ChangeType::TemplateUpdate => {
            let tag = m
                .main_match
                .captured_groups
                .first()
                .map(String::as_str)
                .unwrap_or("template");
            (
                "JSP Template Update".to_string(),
                format!("Update the pano:{} tag in {}", tag, file),
                template_update_changes(m),
            )
        }
        ChangeType::Custom(name) => {
            tracing::debug!(change_type = %name, file = %m.file_path, "no suggestion template for change type");
            return None;
        }
    };

    Some(Suggestion {
        kind: m.domain,
        change_type: m.change_type.clone(),
        title,
        description,
        specific_changes,
        related_files: m.related_files.clone(),
        source_merge_request: context.merge_request_url.clone(),
        source_issue: context.issue_id,
    })
}

/// Generate suggestions for every match, skipping unrecognized ones.
pub fn generate_all(matches: &[PatternMatch], context: &SuggestionContext) -> Vec<Suggestion> {
    matches.iter().filter_map(|m| generate(m, context)).collect()
}
