//! Configuration management for precedent
//!
//! Stores settings in ~/.config/precedent/config.json

use crate::gitlab::DEFAULT_GITLAB_URL;
use crate::model::SearchScope;
use crate::patterns::{RuleSet, RuleSpec};
use crate::score::{ScoringWeights, SimilarityScorer};
use crate::search::SearchOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const TOKEN_ENV: &str = "GITLAB_TOKEN";
pub const URL_ENV: &str = "GITLAB_URL";
pub const GROUP_ENV: &str = "PRECEDENT_GROUP";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gitlab_url: Option<String>,
    /// Personal access token. `GITLAB_TOKEN` takes precedence.
    pub token: Option<String>,
    /// Group searched for similar issues (numeric id or full path)
    pub group: String,
    /// Username for `precedent issues` when none is given
    pub default_username: Option<String>,
    /// Minimum similarity for a candidate to be reported
    pub threshold: f64,
    pub max_results: Option<usize>,
    /// Significant title tokens used in the disjunction query
    pub top_terms: usize,
    pub weights: ScoringWeights,
    pub domain_keywords: Vec<String>,
    pub request_timeout_secs: u64,
    /// Bound on each branch of a fan-out wave
    pub wave_timeout_secs: Option<u64>,
    pub custom_rules: Vec<RuleSpec>,
}

fn default_domain_keywords() -> Vec<String> {
    [
        "sp_SetView",
        "sp_SetDropdown",
        "sp_SetWhereClause",
        "sp_SetQueryColumn",
        "sp_SetViewsetAlias",
        "pano:grid",
        "pano:form",
        "pano:field",
        "tiles:insert",
        "ezConfiguration",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gitlab_url: None,
            token: None,
            group: "8".to_string(),
            default_username: None,
            threshold: 0.35,
            max_results: Some(10),
            top_terms: 5,
            weights: ScoringWeights::default(),
            domain_keywords: default_domain_keywords(),
            request_timeout_secs: 60,
            wave_timeout_secs: None,
            custom_rules: Vec::new(),
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("precedent"))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load config from `path`. A missing file gives defaults; an unreadable
    /// one is moved aside to `config.json.corrupt` first.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<Config>(&content) {
            Ok(mut config) => {
                config.sanitize();
                config
            }
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir().context("Could not determine config directory")?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)) {
                tracing::warn!(error = %e, "failed to set config directory permissions");
            }
        }

        self.save_to(&dir.join("config.json"))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        write_config_atomic(path, &content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Clamp values into their valid ranges.
    pub fn sanitize(&mut self) {
        self.threshold = if self.threshold.is_finite() {
            self.threshold.clamp(0.0, 1.0)
        } else {
            Self::default().threshold
        };
        self.top_terms = self.top_terms.max(1);
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        if self.wave_timeout_secs == Some(0) {
            self.wave_timeout_secs = None;
        }
        if self.group.trim().is_empty() {
            self.group = Self::default().group;
        }
        self.weights.sanitize();
    }

    /// Token from `GITLAB_TOKEN`, falling back to the config file.
    pub fn token(&self) -> Option<String> {
        std::env::var(TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.token.clone().filter(|t| !t.trim().is_empty()))
    }

    pub fn gitlab_url(&self) -> String {
        std::env::var(URL_ENV)
            .ok()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| self.gitlab_url.clone())
            .unwrap_or_else(|| DEFAULT_GITLAB_URL.to_string())
    }

    /// Group to search, `PRECEDENT_GROUP` first.
    pub fn group(&self) -> String {
        std::env::var(GROUP_ENV)
            .ok()
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| self.group.clone())
    }

    pub fn scope(&self) -> SearchScope {
        SearchScope::Group(self.group())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn wave_timeout(&self) -> Option<Duration> {
        self.wave_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            top_terms: self.top_terms.max(1),
            keywords: self.domain_keywords.clone(),
            max_results: self.max_results,
            query_timeout: self.wave_timeout(),
        }
    }

    pub fn scorer(&self) -> SimilarityScorer {
        SimilarityScorer::new(self.weights.clone()).with_keywords(self.domain_keywords.clone())
    }

    /// Canonical rules plus any declared in the config file.
    pub fn rule_set(&self) -> Result<RuleSet> {
        RuleSet::with_custom(&self.custom_rules).context("Invalid custom rule in config")
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/precedent/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
