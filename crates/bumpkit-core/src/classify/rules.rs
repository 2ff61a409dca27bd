//! The static rule table.
//!
//! Rules are listed in precedence order: breaking markers first, then
//! feature markers, then the patch-level categories. The table is compiled
//! once per process and never mutated; changing it means a new build.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::BumpKind;

/// What kind of change a rule recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Incompatible API change.
    Breaking,
    /// New functionality.
    Feature,
    /// Bug fix.
    Fix,
    /// Documentation-only change.
    Docs,
    /// Performance improvement.
    Perf,
    /// Internal restructuring.
    Refactor,
    /// Dependency update.
    Dependency,
    /// Security fix.
    Security,
}

impl Category {
    /// The bump kind every rule of this category maps to.
    ///
    /// Categories that share a precedence level share a kind, so there is
    /// never a tie to break inside a level.
    pub const fn kind(self) -> BumpKind {
        match self {
            Self::Breaking => BumpKind::Major,
            Self::Feature => BumpKind::Minor,
            Self::Fix
            | Self::Docs
            | Self::Perf
            | Self::Refactor
            | Self::Dependency
            | Self::Security => BumpKind::Patch,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Breaking => "breaking",
            Self::Feature => "feature",
            Self::Fix => "fix",
            Self::Docs => "docs",
            Self::Perf => "perf",
            Self::Refactor => "refactor",
            Self::Dependency => "dependency",
            Self::Security => "security",
        };
        f.write_str(name)
    }
}

/// How strongly a hit signals intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Specificity {
    /// A conventional-commit prefix, footer, or ticked checkbox.
    Exact,
    /// A loose keyword somewhere in the text.
    Keyword,
}

impl Specificity {
    /// Contribution of a single hit to the confidence score.
    pub const fn weight(self) -> f64 {
        match self {
            Self::Exact => 0.6,
            Self::Keyword => 0.35,
        }
    }
}

/// One entry of the rule table.
#[derive(Debug)]
pub struct Rule {
    /// Stable identifier recorded in the audit trail.
    pub id: &'static str,
    /// Regex source.
    pub pattern: &'static str,
    /// Category this rule belongs to.
    pub category: Category,
    /// Exact marker or loose keyword.
    pub specificity: Specificity,
}

macro_rules! rule {
    ($id:literal, $category:ident, $specificity:ident, $pattern:literal) => {
        Rule {
            id: $id,
            pattern: $pattern,
            category: Category::$category,
            specificity: Specificity::$specificity,
        }
    };
}

/// All classification rules, highest precedence first.
///
/// Conventional-commit scopes (`(api)`) are spelled out in each pattern so
/// the pattern recorded in the audit trail is self-contained.
pub static RULES: &[Rule] = &[
    // breaking -> major
    rule!("breaking-footer", Breaking, Exact, r"\bBREAKING[ -]CHANGES?\b"),
    rule!("breaking-bang", Breaking, Exact, r"(?m)^\s*[a-z]+(?:\([^)\n]*\))?!:"),
    rule!("breaking-checkbox", Breaking, Exact, r"(?im)^\s*[-*]\s*\[x\]\s*breaking change"),
    rule!("breaking-keyword", Breaking, Keyword, r"(?i)\bbackwards?[- ]incompatible\b"),
    // feature -> minor
    rule!("feature-prefix", Feature, Exact, r"(?m)^\s*feat(?:\([^)\n]*\))?:"),
    rule!("feature-checkbox", Feature, Exact, r"(?im)^\s*[-*]\s*\[x\]\s*new feature"),
    rule!("feature-keyword", Feature, Keyword, r"(?i)\bnew feature\b"),
    // patch-level categories, all equal weight
    rule!("fix-prefix", Fix, Exact, r"(?m)^\s*(?:fix|hotfix|bugfix)(?:\([^)\n]*\))?:"),
    rule!("fix-checkbox", Fix, Exact, r"(?im)^\s*[-*]\s*\[x\]\s*bug ?fix"),
    rule!("fix-keyword", Fix, Keyword, r"(?i)\b(?:bug ?fix|hotfix|fix(?:es|ed)? #\d+)"),
    rule!("docs-prefix", Docs, Exact, r"(?m)^\s*docs(?:\([^)\n]*\))?:"),
    rule!("docs-checkbox", Docs, Exact, r"(?im)^\s*[-*]\s*\[x\]\s*documentation"),
    rule!("docs-keyword", Docs, Keyword, r"(?i)\bdocumentation\b"),
    rule!("perf-prefix", Perf, Exact, r"(?m)^\s*perf(?:\([^)\n]*\))?:"),
    rule!("perf-checkbox", Perf, Exact, r"(?im)^\s*[-*]\s*\[x\]\s*performance"),
    rule!("perf-keyword", Perf, Keyword, r"(?i)\bperformance\b"),
    rule!("refactor-prefix", Refactor, Exact, r"(?m)^\s*refactor(?:\([^)\n]*\))?:"),
    rule!("refactor-checkbox", Refactor, Exact, r"(?im)^\s*[-*]\s*\[x\]\s*refactor"),
    rule!("refactor-keyword", Refactor, Keyword, r"(?i)\brefactor(?:ing|ed)?\b"),
    rule!(
        "dependency-prefix",
        Dependency,
        Exact,
        r"(?m)^\s*(?:deps(?:\([^)\n]*\))?|(?:build|chore)\(deps(?:-dev)?\)):"
    ),
    rule!(
        "dependency-checkbox",
        Dependency,
        Exact,
        r"(?im)^\s*[-*]\s*\[x\]\s*dependenc(?:y|ies) update"
    ),
    rule!(
        "dependency-keyword",
        Dependency,
        Keyword,
        r"(?i)\b(?:dependency update|update dependencies|bump \S+ from)\b"
    ),
    rule!("security-prefix", Security, Exact, r"(?m)^\s*security(?:\([^)\n]*\))?:"),
    rule!("security-checkbox", Security, Exact, r"(?im)^\s*[-*]\s*\[x\]\s*security"),
    rule!(
        "security-keyword",
        Security,
        Keyword,
        r"(?i)\b(?:security|vulnerability|CVE-\d{4}-\d+)\b"
    ),
];

/// The rule table paired with compiled regexes, built on first use.
pub(crate) static COMPILED: LazyLock<Vec<(&'static Rule, Regex)>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|rule| {
            let regex = Regex::new(rule.pattern).expect("rule table patterns are valid");
            (rule, regex)
        })
        .collect()
});

/// Unticked checklist items (`- [ ] ...`), dropped before matching.
pub(crate) static UNCHECKED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s*\[ \]").expect("valid checklist pattern"));
