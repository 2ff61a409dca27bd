//! Bump classification.
//!
//! Maps free text (a PR body, a PR checklist, a commit message) to a
//! [`BumpDecision`]. Classification is a pure function of its input: the
//! same text always yields the same decision.
//!
//! # Precedence
//!
//! Rules are grouped by level. Breaking-change markers beat feature markers,
//! which beat the patch-level categories (fix, docs, perf, refactor,
//! dependency, security). Only the winning level's hits are recorded.

pub mod rules;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

pub use rules::{Category, RULES, Rule, Specificity};

/// Semver bump kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BumpKind {
    /// No release-worthy change detected.
    #[value(skip)]
    None,
    /// Patch release (x.y.Z).
    Patch,
    /// Minor release (x.Y.0).
    Minor,
    /// Major release (X.0.0).
    Major,
}

impl std::fmt::Display for BumpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Patch => write!(f, "patch"),
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
        }
    }
}

/// A rule that contributed to a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedRule {
    /// Rule identifier (e.g., `feature-prefix`).
    pub rule: String,
    /// Regex source of the rule.
    pub pattern: String,
    /// Category of the rule.
    pub category: Category,
    /// Whether the hit was an exact marker or a loose keyword.
    pub specificity: Specificity,
}

impl From<&Rule> for MatchedRule {
    fn from(rule: &Rule) -> Self {
        Self {
            rule: rule.id.to_owned(),
            pattern: rule.pattern.to_owned(),
            category: rule.category,
            specificity: rule.specificity,
        }
    }
}

/// The result of classifying a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BumpDecision {
    /// The decided bump kind.
    pub kind: BumpKind,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Rules that produced the decision, in table order.
    pub matched_rules: Vec<MatchedRule>,
}

impl BumpDecision {
    /// The decision for text with no recognized marker.
    pub const fn none() -> Self {
        Self {
            kind: BumpKind::None,
            confidence: 0.0,
            matched_rules: Vec::new(),
        }
    }

    /// A decision forced by the caller, bypassing classification.
    pub const fn explicit(kind: BumpKind) -> Self {
        Self {
            kind,
            confidence: 1.0,
            matched_rules: Vec::new(),
        }
    }

    /// Whether the decision asks for no change.
    pub fn is_none(&self) -> bool {
        self.kind == BumpKind::None
    }
}

/// Classify `text`, or take `explicit_override` verbatim when given.
#[instrument(skip(text), fields(len = text.len(), ?explicit_override))]
pub fn classify(text: &str, explicit_override: Option<BumpKind>) -> BumpDecision {
    if let Some(kind) = explicit_override {
        debug!(%kind, "explicit bump kind, skipping classification");
        return BumpDecision::explicit(kind);
    }

    let text = strip_unchecked_items(text);

    let mut winning = BumpKind::None;
    let mut matched: Vec<MatchedRule> = Vec::new();
    for (rule, regex) in rules::COMPILED.iter() {
        let kind = rule.category.kind();
        // Table is ordered by level; once a level has hits, lower levels can't win.
        if winning != BumpKind::None && kind < winning {
            break;
        }
        if regex.is_match(&text) {
            winning = kind;
            matched.push(MatchedRule::from(*rule));
        }
    }

    if matched.is_empty() {
        debug!("no rule matched");
        return BumpDecision::none();
    }

    let confidence = confidence(&matched);
    debug!(kind = %winning, confidence, hits = matched.len(), "classified");
    BumpDecision {
        kind: winning,
        confidence,
        matched_rules: matched,
    }
}

/// `1 - Π(1 - w)` over the hits, rounded to four decimals.
fn confidence(matched: &[MatchedRule]) -> f64 {
    let miss = matched
        .iter()
        .fold(1.0_f64, |acc, m| acc * (1.0 - m.specificity.weight()));
    ((1.0 - miss) * 10_000.0).round() / 10_000.0
}

/// Drop unticked checklist lines so template options never count as hits.
fn strip_unchecked_items(text: &str) -> String {
    text.split_inclusive('\n')
        .filter(|line| !rules::UNCHECKED_ITEM.is_match(line))
        .collect()
}
