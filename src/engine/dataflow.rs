//! Engine event contract and introspection ring
//!
//! Flow of a fragment through the engine:
//! [MutationSource] → RawChange
//! [batcher.rs] → MutationBatch
//! [queue.rs] → WorkItem
//! [cache.rs / fingerprint.rs / matcher.rs] → instant decision
//! [Classifier] → Decision (routed through `Orchestrator::on_decisions`)
//! [Document] → set_visibility

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::collaborators::{FragmentRef, RequestId, Verdict};
use super::session::{CompletionReason, SessionCause, SessionId};

/// Where a fragment decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Deny term matched the fragment text
    InstantMatch,
    /// Allow term matched; overrides everything else
    Allowlist,
    /// Served from the analysis cache
    Cache,
    /// Near-duplicate of previously filtered content
    Similarity,
    /// Remote classifier verdict
    Classifier,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstantMatch => "instant_match",
            Self::Allowlist => "allowlist",
            Self::Cache => "cache",
            Self::Similarity => "similarity",
            Self::Classifier => "classifier",
        }
    }

    /// Decisions from these sources may override an earlier verdict
    pub fn is_authoritative(&self) -> bool {
        matches!(self, Self::Allowlist | Self::Classifier | Self::Cache)
    }
}

/// Observable engine events
#[derive(Debug, Clone)]
pub enum FilterEvent {
    SessionStarted {
        session: SessionId,
        cause: SessionCause,
        at: Instant,
    },
    SessionDeferred {
        existing: SessionId,
        cause: SessionCause,
        at: Instant,
    },
    SessionCompleted {
        session: SessionId,
        reason: CompletionReason,
        duration_ms: u64,
        at: Instant,
    },
    FragmentDecided {
        session: SessionId,
        fragment: FragmentRef,
        verdict: Verdict,
        source: DecisionSource,
        at: Instant,
    },
    ClassifierDispatched {
        session: SessionId,
        request: RequestId,
        batch_size: usize,
        at: Instant,
    },
    ClassifierFailed {
        session: SessionId,
        request: RequestId,
        error: String,
        at: Instant,
    },
    DecisionsDiscarded {
        request: RequestId,
        count: usize,
        reason: &'static str,
        at: Instant,
    },
    MutationBatch {
        session: SessionId,
        added: usize,
        removed: usize,
        at: Instant,
    },
    EmergencyStop {
        reason: String,
        at: Instant,
    },
}

impl FilterEvent {
    /// Session the event belongs to, if any
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::SessionStarted { session, .. }
            | Self::SessionCompleted { session, .. }
            | Self::FragmentDecided { session, .. }
            | Self::ClassifierDispatched { session, .. }
            | Self::ClassifierFailed { session, .. }
            | Self::MutationBatch { session, .. } => Some(*session),
            Self::SessionDeferred { existing, .. } => Some(*existing),
            Self::DecisionsDiscarded { .. } | Self::EmergencyStop { .. } => None,
        }
    }

    pub fn timestamp(&self) -> Instant {
        match self {
            Self::SessionStarted { at, .. }
            | Self::SessionDeferred { at, .. }
            | Self::SessionCompleted { at, .. }
            | Self::FragmentDecided { at, .. }
            | Self::ClassifierDispatched { at, .. }
            | Self::ClassifierFailed { at, .. }
            | Self::DecisionsDiscarded { at, .. }
            | Self::MutationBatch { at, .. }
            | Self::EmergencyStop { at, .. } => *at,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionDeferred { .. } => "session_deferred",
            Self::SessionCompleted { .. } => "session_completed",
            Self::FragmentDecided { .. } => "fragment_decided",
            Self::ClassifierDispatched { .. } => "classifier_dispatched",
            Self::ClassifierFailed { .. } => "classifier_failed",
            Self::DecisionsDiscarded { .. } => "decisions_discarded",
            Self::MutationBatch { .. } => "mutation_batch",
            Self::EmergencyStop { .. } => "emergency_stop",
        }
    }
}

/// Bounded ring of recent events
#[derive(Debug, Clone)]
pub struct EventCollector {
    events: Arc<parking_lot::Mutex<VecDeque<FilterEvent>>>,
    max_events: usize,
}

impl EventCollector {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(parking_lot::Mutex::new(VecDeque::with_capacity(max_events))),
            max_events: max_events.max(1),
        }
    }

    #[inline]
    pub fn collect(&self, event: FilterEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent `count` events, oldest first
    pub fn get_recent(&self, count: usize) -> Vec<FilterEvent> {
        let events = self.events.lock();
        let start = events.len().saturating_sub(count);
        events.iter().skip(start).cloned().collect()
    }

    /// Events of one type, oldest first
    pub fn of_type(&self, event_type: &str) -> Vec<FilterEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decided(n: u64) -> FilterEvent {
        FilterEvent::FragmentDecided {
            session: SessionId(1),
            fragment: FragmentRef(n),
            verdict: Verdict::Keep,
            source: DecisionSource::InstantMatch,
            at: Instant::now(),
        }
    }

    #[test]
    fn test_collector_is_a_ring() {
        let collector = EventCollector::new(3);
        for i in 0..5 {
            collector.collect(decided(i));
        }
        assert_eq!(collector.len(), 3);

        let recent = collector.get_recent(2);
        assert!(matches!(recent[0], FilterEvent::FragmentDecided { fragment: FragmentRef(3), .. }));
        assert!(matches!(recent[1], FilterEvent::FragmentDecided { fragment: FragmentRef(4), .. }));
    }

    #[test]
    fn test_event_accessors() {
        let event = FilterEvent::DecisionsDiscarded {
            request: RequestId(2),
            count: 3,
            reason: "stale_session",
            at: Instant::now(),
        };
        assert_eq!(event.event_type(), "decisions_discarded");
        assert_eq!(event.session(), None);
        assert_eq!(decided(1).session(), Some(SessionId(1)));
    }

    #[test]
    fn test_filter_by_type() {
        let collector = EventCollector::default();
        collector.collect(decided(1));
        collector.collect(FilterEvent::EmergencyStop {
            reason: "test".into(),
            at: Instant::now(),
        });
        assert_eq!(collector.of_type("emergency_stop").len(), 1);
        collector.clear();
        assert!(collector.is_empty());
    }

    #[test]
    fn test_authoritative_sources() {
        assert!(DecisionSource::Classifier.is_authoritative());
        assert!(DecisionSource::Allowlist.is_authoritative());
        assert!(!DecisionSource::InstantMatch.is_authoritative());
        assert!(!DecisionSource::Similarity.is_authoritative());
    }
}
