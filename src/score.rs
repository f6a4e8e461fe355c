//! Composite similarity scoring between a source issue and a candidate
//!
//! The title signals (lexical overlap and word-order proximity) form the base
//! score. Label overlap, description similarity and a domain keyword bonus are
//! layered on top when the corresponding weights and inputs are present.

use crate::text;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Tunable weights for [`SimilarityScorer`].
///
/// The defaults reproduce the reference formula:
/// `title = 0.7 * lexical + 0.3 * order`, then `0.8 * title + 0.2 * jaccard`
/// when both sides carry labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Share of the title score taken by lexical overlap
    pub lexical: f64,
    /// Share of the title score taken by word-order proximity
    pub order: f64,
    /// Share of the final score taken by the title when labels are compared
    pub title: f64,
    /// Share of the final score taken by label overlap
    pub labels: f64,
    /// Blend weight for description similarity (0 disables it)
    pub description: f64,
    /// Bonus per domain keyword present in both titles (0 disables it)
    pub keyword_bonus: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            lexical: 0.7,
            order: 0.3,
            title: 0.8,
            labels: 0.2,
            description: 0.0,
            keyword_bonus: 0.0,
        }
    }
}

impl ScoringWeights {
    /// Clamp every weight into a usable range.
    pub fn sanitize(&mut self) {
        for w in [
            &mut self.lexical,
            &mut self.order,
            &mut self.title,
            &mut self.labels,
            &mut self.description,
            &mut self.keyword_bonus,
        ] {
            if !w.is_finite() || *w < 0.0 {
                *w = 0.0;
            }
        }
        self.description = self.description.min(1.0);
    }
}

/// The parts of an issue the scorer looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringInput<'a> {
    pub title: Option<&'a str>,
    pub description: Option<&'a str>,
    pub labels: Option<&'a BTreeSet<String>>,
}

impl<'a> ScoringInput<'a> {
    pub fn title(title: &'a str) -> Self {
        Self {
            title: Some(title),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: Option<&'a str>) -> Self {
        self.description = description;
        self
    }

    pub fn with_labels(mut self, labels: &'a BTreeSet<String>) -> Self {
        self.labels = Some(labels);
        self
    }
}

/// Per-signal values behind a similarity score.
///
/// Signals that did not apply are `None` and left out when serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub lexical: f64,
    pub order: f64,
    pub title: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    /// Always within `[0, 1]`
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

impl Similarity {
    fn zero() -> Self {
        Self::default()
    }
}

/// Deterministic, side-effect free issue similarity.
#[derive(Debug, Clone, Default)]
pub struct SimilarityScorer {
    weights: ScoringWeights,
    keywords: Vec<String>,
}

impl SimilarityScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights,
            keywords: Vec::new(),
        }
    }

    /// Domain vocabulary used by the keyword bonus.
    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Score only, for callers that don't need the breakdown.
    pub fn score(&self, source: &ScoringInput<'_>, candidate: &ScoringInput<'_>) -> f64 {
        self.evaluate(source, candidate).score
    }

    /// Score `candidate` against `source`.
    ///
    /// Not symmetric: word-order proximity is measured from the source's
    /// token positions and normalized by the source token count.
    pub fn evaluate(&self, source: &ScoringInput<'_>, candidate: &ScoringInput<'_>) -> Similarity {
        let (Some(source_title), Some(candidate_title)) = (source.title, candidate.title) else {
            tracing::debug!("missing title in similarity calculation");
            return Similarity::zero();
        };

        let source_tokens = text::normalize(Some(source_title));
        let candidate_tokens = text::normalize(Some(candidate_title));
        if source_tokens.is_empty() || candidate_tokens.is_empty() {
            return Similarity::zero();
        }

        let lexical = lexical_overlap(&source_tokens, &candidate_tokens);
        let order = order_proximity(&source_tokens, &candidate_tokens);
        let title = self.weights.lexical * lexical + self.weights.order * order;

        let mut breakdown = ScoreBreakdown {
            lexical,
            order,
            title,
            ..Default::default()
        };

        let mut score = title;

        if let (Some(a), Some(b)) = (source.labels, candidate.labels) {
            if !a.is_empty() && !b.is_empty() {
                let overlap = jaccard(a, b);
                breakdown.labels = Some(overlap);
                score = self.weights.title * score + self.weights.labels * overlap;
            }
        }

        if self.weights.description > 0.0 {
            if let (Some(a), Some(b)) = (source.description, candidate.description) {
                let (a, b) = (text::clean(a), text::clean(b));
                if !a.is_empty() && !b.is_empty() {
                    let dice = dice_coefficient(&a, &b);
                    breakdown.description = Some(dice);
                    score = (1.0 - self.weights.description) * score
                        + self.weights.description * dice;
                }
            }
        }

        if self.weights.keyword_bonus > 0.0 && !self.keywords.is_empty() {
            let source_kw = text::matched_keywords(source_title, &self.keywords);
            let candidate_kw = text::matched_keywords(candidate_title, &self.keywords);
            let shared = source_kw.iter().filter(|k| candidate_kw.contains(k)).count();
            if shared > 0 {
                let bonus = self.weights.keyword_bonus * shared as f64;
                breakdown.keywords = Some(bonus);
                score += bonus;
            }
        }

        Similarity {
            score: clamp_unit(score),
            breakdown,
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Fraction of source tokens present in the candidate, over the longer sequence.
fn lexical_overlap(source: &[String], candidate: &[String]) -> f64 {
    let candidate_set: HashSet<&String> = candidate.iter().collect();
    let matching = source.iter().filter(|t| candidate_set.contains(t)).count();
    let denom = source.len().max(candidate.len()).max(1);
    matching as f64 / denom as f64
}

/// Reward source tokens that appear at a similar position in the candidate.
///
/// A repeated token is measured against its nearest occurrence.
fn order_proximity(source: &[String], candidate: &[String]) -> f64 {
    let total: f64 = source
        .iter()
        .enumerate()
        .filter_map(|(idx, token)| {
            candidate
                .iter()
                .enumerate()
                .filter(|(_, c)| *c == token)
                .map(|(cidx, _)| idx.abs_diff(cidx))
                .min()
                .map(|distance| 1.0 / (1.0 + distance as f64))
        })
        .sum();
    total / source.len().max(1) as f64
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Sørensen–Dice coefficient over character bigrams.
fn dice_coefficient(a: &str, b: &str) -> f64 {
    let a: String = a.chars().filter(|c| !c.is_whitespace()).collect();
    let b: String = b.chars().filter(|c| !c.is_whitespace()).collect();
    if a == b {
        return 1.0;
    }
    let bigrams = |s: &str| -> Vec<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let a_bigrams = bigrams(&a);
    let mut b_bigrams = bigrams(&b);
    if a_bigrams.is_empty() || b_bigrams.is_empty() {
        return 0.0;
    }

    let total = a_bigrams.len() + b_bigrams.len();
    let mut intersection = 0usize;
    for pair in &a_bigrams {
        if let Some(pos) = b_bigrams.iter().position(|p| p == pair) {
            b_bigrams.swap_remove(pos);
            intersection += 1;
        }
    }
    (2 * intersection) as f64 / total as f64
}
