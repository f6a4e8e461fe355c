//! Known change shapes in merge-request diffs
//!
//! Detection is regex based: a rule recognizes a call or tag shape in the raw
//! diff text of files whose path passes the rule's filter. Nothing here parses
//! SQL or JSP.

use crate::model::ChangeRecord;
use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Technology a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    #[serde(rename = "SQL")]
    Sql,
    #[serde(rename = "JSP")]
    Jsp,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Sql => "SQL",
            Domain::Jsp => "JSP",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of change a rule detects.
///
/// `Custom` covers rules declared in the config file; the suggestion
/// generator has no template for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChangeType {
    ViewUpdate,
    DropdownUpdate,
    TemplateUpdate,
    Custom(String),
}

impl ChangeType {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeType::ViewUpdate => "VIEW_UPDATE",
            ChangeType::DropdownUpdate => "DROPDOWN_UPDATE",
            ChangeType::TemplateUpdate => "TEMPLATE_UPDATE",
            ChangeType::Custom(name) => name,
        }
    }
}

impl From<String> for ChangeType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "VIEW_UPDATE" => ChangeType::ViewUpdate,
            "DROPDOWN_UPDATE" => ChangeType::DropdownUpdate,
            "TEMPLATE_UPDATE" => ChangeType::TemplateUpdate,
            _ => ChangeType::Custom(value),
        }
    }
}

impl From<ChangeType> for String {
    fn from(value: ChangeType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A rule as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub domain: Domain,
    pub change_type: String,
    /// Matched case-insensitively against the file path
    pub file_filter: String,
    pub primary: String,
    #[serde(default)]
    pub related: Vec<String>,
}

/// A compiled detection rule.
#[derive(Debug, Clone)]
pub struct DomainRule {
    pub domain: Domain,
    pub change_type: ChangeType,
    pub file_filter: Regex,
    pub primary: Regex,
    pub related: Vec<Regex>,
}

impl DomainRule {
    pub fn compile(spec: &RuleSpec) -> Result<Self> {
        let file_filter = RegexBuilder::new(&spec.file_filter)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("Invalid file filter for {}", spec.change_type))?;
        let primary = Regex::new(&spec.primary)
            .with_context(|| format!("Invalid primary pattern for {}", spec.change_type))?;
        let related = spec
            .related
            .iter()
            .map(|p| {
                Regex::new(p).with_context(|| {
                    format!("Invalid related pattern for {}: {}", spec.change_type, p)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            domain: spec.domain,
            change_type: ChangeType::from(spec.change_type.clone()),
            file_filter,
            primary,
            related,
        })
    }

    pub fn applies_to(&self, path: &str) -> bool {
        !path.is_empty() && self.file_filter.is_match(path)
    }
}

/// Built-in rules for view/dropdown configuration scripts and JSP body templates.
pub fn canonical_rule_specs() -> Vec<RuleSpec> {
    const CONFIGURATION_SQL: &str = r"Configuration\.sql$";
    vec![
        RuleSpec {
            domain: Domain::Sql,
            change_type: "VIEW_UPDATE".into(),
            file_filter: CONFIGURATION_SQL.into(),
            primary: r"EXECUTE\s+sp_SetView\s+'([^']+)'\s*,\s*'([^']+)'\s*,\s*'([^']+)'".into(),
            related: vec![
                r"sp_SetWhereClause[^\r\n]*".into(),
                r"sp_SetQueryColumn[^\r\n]*".into(),
                r"sp_SetViewsetAlias[^\r\n]*".into(),
            ],
        },
        RuleSpec {
            domain: Domain::Sql,
            change_type: "DROPDOWN_UPDATE".into(),
            file_filter: CONFIGURATION_SQL.into(),
            primary: r"EXECUTE\s+sp_SetDropdown\b[ \t]*([^\r\n]*)".into(),
            related: vec![
                r"sp_SetViewsetAlias[^\r\n]*".into(),
                r"sp_SetWhereClause[^\r\n]*".into(),
            ],
        },
        RuleSpec {
            domain: Domain::Jsp,
            change_type: "TEMPLATE_UPDATE".into(),
            file_filter: r"_body\.jsp$".into(),
            primary: r"<pano:(form|field|grid)\b[^>\r\n]*>?".into(),
            related: vec![r"<tiles:insert\b[^>\r\n]*>?".into(), r"<html:submit\b[^>\r\n]*>?".into()],
        },
    ]
}

/// The ordered rule table the matcher runs.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<DomainRule>,
}

impl RuleSet {
    pub fn canonical() -> Self {
        // The built-in patterns are constants; a failure here is a programming error.
        Self::from_specs(&canonical_rule_specs()).expect("built-in rules compile")
    }

    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self> {
        let rules = specs.iter().map(DomainRule::compile).collect::<Result<_>>()?;
        Ok(Self { rules })
    }

    /// Canonical rules followed by the given extra rules.
    pub fn with_custom(custom: &[RuleSpec]) -> Result<Self> {
        let mut set = Self::canonical();
        for spec in custom {
            set.rules.push(DomainRule::compile(spec)?);
        }
        Ok(set)
    }

    pub fn rules(&self) -> &[DomainRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::canonical()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainMatch {
    pub full_text: String,
    pub captured_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedMatch {
    pub full_text: String,
}

/// One rule firing on one changed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub domain: Domain,
    pub change_type: ChangeType,
    pub file_path: String,
    pub main_match: MainMatch,
    pub related_matches: Vec<RelatedMatch>,
    /// Originating path first, then other files in the same merge request
    /// that pass the same rule's filter
    pub related_files: Vec<String>,
}

fn match_rule(rule: &DomainRule, change: &ChangeRecord) -> Option<PatternMatch> {
    let path = change.path();
    if !rule.applies_to(path) {
        return None;
    }

    let caps = rule.primary.captures(&change.diff)?;
    let full_text = caps.get(0).map(|m| m.as_str().to_string())?;
    let captured_groups = caps
        .iter()
        .skip(1)
        .map(|g| g.map(|m| m.as_str().to_string()).unwrap_or_default())
        .collect();

    let related_matches = rule
        .related
        .iter()
        .filter_map(|re| re.find(&change.diff))
        .map(|m| RelatedMatch {
            full_text: m.as_str().trim_end().to_string(),
        })
        .collect();

    Some(PatternMatch {
        domain: rule.domain,
        change_type: rule.change_type.clone(),
        file_path: path.to_string(),
        main_match: MainMatch {
            full_text,
            captured_groups,
        },
        related_matches,
        related_files: vec![path.to_string()],
    })
}

/// Run every rule against a single change.
///
/// Rules are independent: one file may trigger several of them.
pub fn extract_patterns(change: &ChangeRecord, rules: &RuleSet) -> Vec<PatternMatch> {
    rules
        .rules()
        .iter()
        .filter_map(|rule| match_rule(rule, change))
        .collect()
}

/// Run the matcher over all changes of one merge request, attaching the other
/// files of that merge request each rule also applies to.
pub fn extract_from_changes(changes: &[ChangeRecord], rules: &RuleSet) -> Vec<PatternMatch> {
    let mut matches = Vec::new();
    for change in changes {
        for rule in rules.rules() {
            let Some(mut found) = match_rule(rule, change) else {
                continue;
            };
            for other in changes {
                let other_path = other.path();
                if rule.applies_to(other_path) && !found.related_files.iter().any(|f| f == other_path)
                {
                    found.related_files.push(other_path.to_string());
                }
            }
            matches.push(found);
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, diff: &str) -> ChangeRecord {
        ChangeRecord {
            old_path: path.to_string(),
            new_path: path.to_string(),
            diff: diff.to_string(),
        }
    }

    // ========================================================================
    // SQL rules
    // ========================================================================

    #[test]
    fn test_view_update_with_where_clause() {
        let diff = "@@ -10,3 +10,5 @@\n+EXECUTE sp_SetView 'Q1','VS1','Name1'\n+sp_SetWhereClause X=1\n";
        let matches = extract_patterns(&change("ezConfiguration.sql", diff), &RuleSet::canonical());

        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.domain, Domain::Sql);
        assert_eq!(m.change_type, ChangeType::ViewUpdate);
        assert_eq!(m.main_match.captured_groups, vec!["Q1", "VS1", "Name1"]);
        assert_eq!(m.main_match.full_text, "EXECUTE sp_SetView 'Q1','VS1','Name1'");
        assert_eq!(m.related_matches.len(), 1);
        assert_eq!(m.related_matches[0].full_text, "sp_SetWhereClause X=1");
    }

    #[test]
    fn test_view_update_allows_spaces_after_commas() {
        let diff = "+EXECUTE  sp_SetView 'OrderQuery', 'Orders', 'Open Orders'";
        let matches = extract_patterns(&change("db/EZCONFIGURATION.SQL", diff), &RuleSet::canonical());
        assert_eq!(matches.len(), 1);
        assert_eq!(
            matches[0].main_match.captured_groups,
            vec!["OrderQuery", "Orders", "Open Orders"]
        );
    }

    #[test]
    fn test_dropdown_update_captures_arguments() {
        let diff = "+EXECUTE sp_SetDropdown 'StatusList', 'Open'\n+EXECUTE sp_SetViewsetAlias 'Orders'\n";
        let matches = extract_patterns(&change("ezConfiguration.sql", diff), &RuleSet::canonical());
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.change_type, ChangeType::DropdownUpdate);
        assert_eq!(m.main_match.captured_groups, vec!["'StatusList', 'Open'"]);
        assert_eq!(m.related_matches[0].full_text, "sp_SetViewsetAlias 'Orders'");
    }

    #[test]
    fn test_related_without_primary_contributes_nothing() {
        let diff = "+sp_SetWhereClause X=1\n+sp_SetQueryColumn 'Status'\n";
        assert!(extract_patterns(&change("ezConfiguration.sql", diff), &RuleSet::canonical()).is_empty());
    }

    #[test]
    fn test_multiple_rules_fire_independently() {
        let diff = "+EXECUTE sp_SetView 'Q','V','N'\n+EXECUTE sp_SetDropdown 'D'\n";
        let matches = extract_patterns(&change("ezConfiguration.sql", diff), &RuleSet::canonical());
        let kinds: Vec<_> = matches.iter().map(|m| m.change_type.clone()).collect();
        assert_eq!(kinds, vec![ChangeType::ViewUpdate, ChangeType::DropdownUpdate]);
    }

    // ========================================================================
    // File filters
    // ========================================================================

    #[test]
    fn test_unmatched_path_yields_nothing() {
        let diff = "+EXECUTE sp_SetView 'Q1','VS1','Name1'\n+<pano:grid id=\"x\">";
        let matches = extract_patterns(&change("src/Configuration.java", diff), &RuleSet::canonical());
        assert!(matches.is_empty());
    }

    #[test]
    fn test_deleted_file_uses_old_path() {
        let record = ChangeRecord {
            old_path: "ezConfiguration.sql".into(),
            new_path: String::new(),
            diff: "-EXECUTE sp_SetView 'Q','V','N'".into(),
        };
        assert_eq!(extract_patterns(&record, &RuleSet::canonical()).len(), 1);
    }

    // ========================================================================
    // JSP rules
    // ========================================================================

    #[test]
    fn test_template_update_with_related_tags() {
        let diff = "+<pano:grid name=\"orders\" rows=\"20\">\n+<tiles:insert page=\"/footer.jsp\"/>\n context\n+<html:submit value=\"Save\"/>\n";
        let matches = extract_patterns(&change("web/orders_body.jsp", diff), &RuleSet::canonical());
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.domain, Domain::Jsp);
        assert_eq!(m.change_type, ChangeType::TemplateUpdate);
        assert_eq!(m.main_match.captured_groups, vec!["grid"]);
        assert_eq!(m.main_match.full_text, "<pano:grid name=\"orders\" rows=\"20\">");
        let related: Vec<_> = m.related_matches.iter().map(|r| r.full_text.as_str()).collect();
        assert_eq!(
            related,
            vec!["<tiles:insert page=\"/footer.jsp\"/>", "<html:submit value=\"Save\"/>"]
        );
    }

    #[test]
    fn test_pano_prefix_must_be_a_known_tag() {
        let diff = "+<pano:formatter value=\"x\"/>";
        assert!(extract_patterns(&change("a_body.jsp", diff), &RuleSet::canonical()).is_empty());
    }

    // ========================================================================
    // Merge-request level extraction
    // ========================================================================

    #[test]
    fn test_extract_from_changes_collects_related_files() {
        let changes = vec![
            change("db/ezConfiguration.sql", "+EXECUTE sp_SetView 'Q','V','N'"),
            change("db/reportsConfiguration.sql", "+-- comment only"),
            change("web/orders_body.jsp", "+<p>nothing</p>"),
        ];
        let matches = extract_from_changes(&changes, &RuleSet::canonical());
        assert_eq!(matches.len(), 1);
        assert_eq!(
            matches[0].related_files,
            vec!["db/ezConfiguration.sql", "db/reportsConfiguration.sql"]
        );
    }

    // ========================================================================
    // Rule compilation
    // ========================================================================

    #[test]
    fn test_custom_rules_append_after_canonical() {
        let custom = RuleSpec {
            domain: Domain::Sql,
            change_type: "PROC_UPDATE".into(),
            file_filter: r"\.sql$".into(),
            primary: r"CREATE\s+PROCEDURE\s+(\w+)".into(),
            related: vec![],
        };
        let set = RuleSet::with_custom(&[custom]).unwrap();
        assert_eq!(set.len(), 4);

        let matches = extract_patterns(&change("procs.sql", "+CREATE PROCEDURE sp_Foo"), &set);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].change_type, ChangeType::Custom("PROC_UPDATE".into()));
        assert_eq!(matches[0].main_match.captured_groups, vec!["sp_Foo"]);
    }

    #[test]
    fn test_invalid_rule_is_reported() {
        let bad = RuleSpec {
            domain: Domain::Jsp,
            change_type: "BROKEN".into(),
            file_filter: r"\.jsp$".into(),
            primary: r"(unclosed".into(),
            related: vec![],
        };
        let err = RuleSet::from_specs(&[bad]).unwrap_err();
        assert!(format!("{err:#}").contains("BROKEN"));
    }

    #[test]
    fn test_change_type_string_round_trip() {
        assert_eq!(ChangeType::from("VIEW_UPDATE".to_string()), ChangeType::ViewUpdate);
        assert_eq!(String::from(ChangeType::TemplateUpdate), "TEMPLATE_UPDATE");
        let json = serde_json::to_string(&ChangeType::DropdownUpdate).unwrap();
        assert_eq!(json, "\"DROPDOWN_UPDATE\"");
    }
}
