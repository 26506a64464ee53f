//! Capability traits for the engine's external collaborators
//!
//! The engine never touches a rendering surface, network or change feed
//! directly. Hosts provide these three capabilities when building an
//! [`Orchestrator`](super::orchestrator::Orchestrator).

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::mpsc;

use super::errors::CollaboratorError;
use super::matcher::Criteria;

/// Opaque handle to a content fragment owned by the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentRef(pub u64);

impl fmt::Display for FragmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frag#{}", self.0)
    }
}

/// Which fragments to enumerate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentScope {
    All,
    Visible,
}

/// Vertical viewport geometry in document coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub top: f64,
    pub height: f64,
}

impl ScrollPosition {
    pub fn new(top: f64, height: f64) -> Self {
        Self { top, height }
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn contains(&self, position: f64) -> bool {
        position >= self.top && position < self.bottom()
    }
}

/// Rendering surface holding the fragments
pub trait Document: Send + Sync {
    fn enumerate_fragments(&self, scope: FragmentScope) -> Result<Vec<FragmentRef>, CollaboratorError>;

    fn is_visible(&self, fragment: FragmentRef) -> bool;

    /// Vertical offset of the fragment, `None` once it is gone
    fn position(&self, fragment: FragmentRef) -> Option<f64>;

    fn viewport(&self) -> ScrollPosition;

    fn set_visibility(
        &self,
        fragment: FragmentRef,
        hidden: bool,
        reason: &str,
    ) -> Result<(), CollaboratorError>;

    fn extract_text(&self, fragment: FragmentRef) -> Option<String>;
}

/// Identifier of one classifier submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// What the classifier is told about a fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentDescriptor {
    pub fragment: FragmentRef,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Keep,
    Filter,
}

impl Verdict {
    pub fn is_filter(&self) -> bool {
        matches!(self, Self::Filter)
    }
}

/// Per-fragment classifier verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub fragment: FragmentRef,
    pub verdict: Verdict,
    pub reason: String,
}

impl Decision {
    pub fn keep(fragment: FragmentRef) -> Self {
        Self {
            fragment,
            verdict: Verdict::Keep,
            reason: String::new(),
        }
    }

    pub fn filter(fragment: FragmentRef, reason: impl Into<String>) -> Self {
        Self {
            fragment,
            verdict: Verdict::Filter,
            reason: reason.into(),
        }
    }
}

/// Remote batch classifier
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        request_id: RequestId,
        batch: Vec<FragmentDescriptor>,
        criteria: &Criteria,
    ) -> Result<Vec<Decision>, CollaboratorError>;
}

/// Kind of node a raw change inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Text,
    Element,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddedNode {
    pub fragment: FragmentRef,
    pub kind: NodeKind,
    pub child_count: usize,
}

impl AddedNode {
    pub fn element(fragment: FragmentRef, child_count: usize) -> Self {
        Self {
            fragment,
            kind: NodeKind::Element,
            child_count,
        }
    }

    pub fn text(fragment: FragmentRef) -> Self {
        Self {
            fragment,
            kind: NodeKind::Text,
            child_count: 0,
        }
    }

    /// Text nodes and childless elements never carry judgeable content
    pub fn is_significant(&self) -> bool {
        self.kind == NodeKind::Element && self.child_count > 0
    }
}

/// One raw document change notification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChange {
    pub added: SmallVec<[AddedNode; 4]>,
    pub removed: SmallVec<[FragmentRef; 4]>,
}

impl RawChange {
    pub fn added(nodes: impl IntoIterator<Item = AddedNode>) -> Self {
        Self {
            added: nodes.into_iter().collect(),
            removed: SmallVec::new(),
        }
    }

    pub fn removed(fragments: impl IntoIterator<Item = FragmentRef>) -> Self {
        Self {
            added: SmallVec::new(),
            removed: fragments.into_iter().collect(),
        }
    }

    /// Whether the change affects judgeable content
    ///
    /// Removals always count: the orchestrator must drop its per-fragment state.
    pub fn is_significant(&self) -> bool {
        !self.removed.is_empty() || self.added.iter().any(AddedNode::is_significant)
    }
}

/// Feed of raw change notifications
pub trait MutationSource: Send + Sync {
    /// Start delivering changes into `sink`
    fn attach(&self, sink: mpsc::UnboundedSender<RawChange>) -> Result<(), CollaboratorError>;

    /// Stop delivering changes
    fn detach(&self);
}
