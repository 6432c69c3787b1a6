//! Claims and agreement
//!
//! A contribution is split into claims, one per sentence. A line may start
//! with a severity tag (`[critical]`, `[high]`, `[medium]`, `[low]`) that
//! applies to every sentence on it. Agreement between contributors is a
//! mean pairwise overlap score in 0.0 - 1.0.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a claim
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Untagged
    #[default]
    Info,
    /// `[low]`
    Low,
    /// `[medium]`
    Medium,
    /// `[high]`
    High,
    /// `[critical]`
    Critical,
}

impl Severity {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// One statement extracted from a contribution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    /// Statement text without the severity tag
    pub text: String,
    /// Severity from the line tag
    pub severity: Severity,
    tokens: BTreeSet<String>,
}

impl Claim {
    /// Build a claim
    pub fn new(text: impl Into<String>, severity: Severity) -> Self {
        let text = text.into();
        let tokens = tokenize(&text);
        Self {
            text,
            severity,
            tokens,
        }
    }

    /// Normalised token set
    #[must_use]
    pub fn tokens(&self) -> &BTreeSet<String> {
        &self.tokens
    }

    /// Jaccard similarity with another claim
    #[must_use]
    pub fn similarity(&self, other: &Claim) -> f64 {
        jaccard(&self.tokens, &other.tokens)
    }
}

/// How agreement between contributors is measured
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementMetric {
    /// Mean pairwise Jaccard of whole-contribution token sets
    #[default]
    TokenJaccard,
    /// Mean pairwise fraction of claims that have a matching counterpart
    ClaimOverlap,
}

/// Lowercased alphanumeric words
#[must_use]
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard index; two empty sets are identical
#[must_use]
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f64 / union as f64
}

/// Split a contribution into claims
#[must_use]
pub fn split_claims(content: &str) -> Vec<Claim> {
    let mut claims = Vec::new();
    for line in content.lines() {
        let (severity, rest) = strip_tag(line.trim());
        for sentence in sentences(rest) {
            claims.push(Claim::new(sentence, severity));
        }
    }
    claims
}

fn strip_tag(line: &str) -> (Severity, &str) {
    let line = line.trim_start_matches(['-', '*', ' ']);
    if let Some(rest) = line.strip_prefix('[') {
        if let Some((tag, tail)) = rest.split_once(']') {
            if let Some(severity) = Severity::from_tag(tag.trim()) {
                return (severity, tail.trim());
            }
        }
    }
    (Severity::Info, line)
}

fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |(_, next)| next.is_whitespace());
        if at_boundary {
            let end = i + c.len_utf8();
            push_sentence(&mut out, &text[start..end]);
            start = end;
        }
    }
    push_sentence(&mut out, &text[start..]);
    out
}

fn push_sentence<'a>(out: &mut Vec<&'a str>, sentence: &'a str) {
    let sentence = sentence.trim();
    if sentence.chars().any(char::is_alphanumeric) {
        out.push(sentence);
    }
}

/// Mean pairwise agreement of `contents`; fewer than two scores 1.0
#[must_use]
pub fn agreement(metric: AgreementMetric, claim_match_threshold: f64, contents: &[&str]) -> f64 {
    if contents.len() < 2 {
        return 1.0;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    match metric {
        AgreementMetric::TokenJaccard => {
            let sets: Vec<BTreeSet<String>> = contents.iter().map(|c| tokenize(c)).collect();
            for i in 0..sets.len() {
                for j in (i + 1)..sets.len() {
                    total += jaccard(&sets[i], &sets[j]);
                    pairs += 1;
                }
            }
        }
        AgreementMetric::ClaimOverlap => {
            let claims: Vec<Vec<Claim>> = contents.iter().map(|c| split_claims(c)).collect();
            for i in 0..claims.len() {
                for j in (i + 1)..claims.len() {
                    total += claim_overlap(&claims[i], &claims[j], claim_match_threshold);
                    pairs += 1;
                }
            }
        }
    }
    total / pairs as f64
}

fn claim_overlap(a: &[Claim], b: &[Claim], threshold: f64) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let matched = |from: &[Claim], to: &[Claim]| {
        from.iter()
            .filter(|claim| to.iter().any(|other| claim.similarity(other) >= threshold))
            .count()
    };
    (matched(a, b) + matched(b, a)) as f64 / (a.len() + b.len()) as f64
}
