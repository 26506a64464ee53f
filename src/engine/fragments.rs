//! Per-fragment side table
//!
//! Every fragment the engine has seen in the current document gets an entry;
//! the entry is removed explicitly when a mutation batch reports the fragment
//! gone. Decisions for fragments without an entry are ignored.

use std::collections::HashMap;

use super::collaborators::{FragmentRef, Verdict};
use super::dataflow::DecisionSource;
use super::fingerprint::Fingerprint;
use super::matcher::CriteriaFingerprint;

/// Last decision applied to a fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDecision {
    pub verdict: Verdict,
    pub source: DecisionSource,
    pub criteria: CriteriaFingerprint,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentEntry {
    pub fingerprint: Option<Fingerprint>,
    /// Criteria under which the engine hid this fragment, `None` while shown
    pub hidden_under: Option<CriteriaFingerprint>,
    pub decision: Option<AppliedDecision>,
}

impl FragmentEntry {
    pub fn is_hidden(&self) -> bool {
        self.hidden_under.is_some()
    }
}

/// What the caller must do to the document after [`FragmentTable::transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityChange {
    Hide,
    Show,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct FragmentTable {
    entries: HashMap<FragmentRef, FragmentEntry>,
}

impl FragmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fragment`; returns `true` when it was not yet tracked
    pub fn track(&mut self, fragment: FragmentRef) -> bool {
        if self.entries.contains_key(&fragment) {
            return false;
        }
        self.entries.insert(fragment, FragmentEntry::default());
        true
    }

    pub fn get(&self, fragment: FragmentRef) -> Option<&FragmentEntry> {
        self.entries.get(&fragment)
    }

    pub fn contains(&self, fragment: FragmentRef) -> bool {
        self.entries.contains_key(&fragment)
    }

    pub fn set_fingerprint(&mut self, fragment: FragmentRef, fingerprint: Option<Fingerprint>) {
        if let Some(entry) = self.entries.get_mut(&fragment) {
            entry.fingerprint = fingerprint;
        }
    }

    /// Work out the visibility change implied by a new decision and record it
    ///
    /// A keep verdict only unhides a fragment when it comes from an
    /// authoritative source, or when the fragment was hidden under different
    /// criteria. Untracked fragments yield `None`.
    pub fn transition(
        &mut self,
        fragment: FragmentRef,
        decision: AppliedDecision,
    ) -> Option<VisibilityChange> {
        let entry = self.entries.get_mut(&fragment)?;

        let change = match decision.verdict {
            Verdict::Filter if !entry.is_hidden() => VisibilityChange::Hide,
            Verdict::Filter => VisibilityChange::Unchanged,
            Verdict::Keep => match entry.hidden_under {
                Some(under) if decision.source.is_authoritative() || under != decision.criteria => {
                    VisibilityChange::Show
                }
                _ => VisibilityChange::Unchanged,
            },
        };

        match change {
            VisibilityChange::Hide => entry.hidden_under = Some(decision.criteria),
            VisibilityChange::Show => entry.hidden_under = None,
            VisibilityChange::Unchanged if decision.verdict == Verdict::Filter => {
                entry.hidden_under = Some(decision.criteria)
            }
            VisibilityChange::Unchanged => {}
        }

        let keep_previous = decision.verdict == Verdict::Keep
            && entry.is_hidden()
            && change == VisibilityChange::Unchanged;
        if !keep_previous {
            entry.decision = Some(decision);
        }
        Some(change)
    }

    /// Undo a transition the document refused to apply
    ///
    /// Restores the visibility and decision held in `previous`, so the
    /// fragment counts as undecided again and gets requeued.
    pub fn revert(&mut self, fragment: FragmentRef, previous: &FragmentEntry) {
        if let Some(entry) = self.entries.get_mut(&fragment) {
            entry.hidden_under = previous.hidden_under;
            entry.decision = previous.decision.clone();
        }
    }

    /// Fragment is gone from the document
    pub fn remove(&mut self, fragment: FragmentRef) -> Option<FragmentEntry> {
        self.entries.remove(&fragment)
    }

    pub fn hidden(&self) -> impl Iterator<Item = FragmentRef> + '_ {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_hidden())
            .map(|(fragment, _)| *fragment)
    }

    /// Shown fragments whose fingerprint is within `threshold` bits of `fp`
    pub fn shown_similar_to(&self, fp: Fingerprint, threshold: u32) -> Vec<FragmentRef> {
        let mut out: Vec<FragmentRef> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_hidden())
            .filter(|(_, entry)| entry.fingerprint.is_some_and(|own| own.is_similar(&fp, threshold)))
            .map(|(fragment, _)| *fragment)
            .collect();
        out.sort();
        out
    }

    pub fn hidden_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_hidden()).count()
    }

    /// Fragments without a decision under `criteria`
    pub fn undecided(&self, criteria: CriteriaFingerprint) -> Vec<FragmentRef> {
        let mut out: Vec<FragmentRef> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .decision
                    .as_ref()
                    .map_or(true, |d| d.criteria != criteria)
            })
            .map(|(fragment, _)| *fragment)
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
