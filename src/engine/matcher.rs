//! Criteria and instant text matching
//!
//! Instant matching is the synchronous fallback that runs on every fragment
//! regardless of classifier availability: case-insensitive substring search for
//! deny terms, with allow terms taking precedence.

use std::fmt;

use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::errors::EngineError;

/// Stable identity of a criteria value, used to partition cache entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CriteriaFingerprint(pub u64);

impl fmt::Display for CriteriaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// User-supplied filter criteria
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Criteria {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

fn normalized_terms(terms: &[String]) -> Vec<String> {
    let mut out: Vec<String> = terms
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

impl Criteria {
    pub fn new<A, D>(allow: A, deny: D) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            allow: allow.into_iter().map(Into::into).collect(),
            deny: deny.into_iter().map(Into::into).collect(),
        }
    }

    /// Deny-only criteria
    pub fn deny<D>(deny: D) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self::new(Vec::<String>::new(), deny)
    }

    /// No usable term on either side
    pub fn is_empty(&self) -> bool {
        self.allow.iter().chain(self.deny.iter()).all(|t| t.trim().is_empty())
    }

    /// Order- and case-insensitive fingerprint of the term sets
    pub fn fingerprint(&self) -> CriteriaFingerprint {
        let mut hasher = Sha256::new();
        for term in normalized_terms(&self.allow) {
            hasher.update(b"a:");
            hasher.update(term.as_bytes());
            hasher.update([0u8]);
        }
        for term in normalized_terms(&self.deny) {
            hasher.update(b"d:");
            hasher.update(term.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        CriteriaFingerprint(u64::from_be_bytes(bytes))
    }
}

/// Result of instant matching a text against criteria
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// An allow term matched; the fragment must stay visible
    Allowed(String),
    /// A deny term matched
    Denied(String),
    NoMatch,
}

/// Compiled matcher for one criteria value
#[derive(Debug, Clone)]
pub struct InstantMatcher {
    allow_terms: Vec<String>,
    deny_terms: Vec<String>,
    allow: RegexSet,
    deny: RegexSet,
}

fn compile(terms: &[String]) -> Result<RegexSet, EngineError> {
    RegexSetBuilder::new(terms.iter().map(|t| regex::escape(t)))
        .case_insensitive(true)
        .build()
        .map_err(|e| EngineError::InvalidCriteria(e.to_string()))
}

impl InstantMatcher {
    pub fn new(criteria: &Criteria) -> Result<Self, EngineError> {
        let allow_terms = normalized_terms(&criteria.allow);
        let deny_terms = normalized_terms(&criteria.deny);
        Ok(Self {
            allow: compile(&allow_terms)?,
            deny: compile(&deny_terms)?,
            allow_terms,
            deny_terms,
        })
    }

    /// Matcher that never matches
    pub fn empty() -> Self {
        Self {
            allow_terms: Vec::new(),
            deny_terms: Vec::new(),
            allow: RegexSet::empty(),
            deny: RegexSet::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allow_terms.is_empty() && self.deny_terms.is_empty()
    }

    /// Allow terms win over deny terms
    pub fn evaluate(&self, text: &str) -> MatchOutcome {
        #[cfg(feature = "perf")]
        let started = std::time::Instant::now();

        let outcome = if let Some(idx) = self.allow.matches(text).iter().next() {
            MatchOutcome::Allowed(self.allow_terms[idx].clone())
        } else if let Some(idx) = self.deny.matches(text).iter().next() {
            MatchOutcome::Denied(self.deny_terms[idx].clone())
        } else {
            MatchOutcome::NoMatch
        };

        #[cfg(feature = "perf")]
        {
            let elapsed = started.elapsed();
            if elapsed > std::time::Duration::from_millis(1) {
                tracing::warn!(?elapsed, len = text.len(), "Slow instant match");
            }
        }

        outcome
    }
}
