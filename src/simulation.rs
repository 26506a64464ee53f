//! In-memory collaborators
//!
//! Drive the engine without a real page: a document laid out as a vertical
//! strip of text fragments, a classifier answering from a rule, and a mutation
//! source fed by hand. Used by the demo binary and the test suites.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::collaborators::{
    Classifier, Decision, Document, FragmentDescriptor, FragmentRef, FragmentScope,
    MutationSource, RawChange, RequestId, ScrollPosition,
};
use crate::engine::errors::CollaboratorError;
use crate::engine::matcher::Criteria;

#[derive(Debug, Clone)]
struct SimFragment {
    text: String,
    position: f64,
    hidden: bool,
}

#[derive(Debug)]
struct DocumentState {
    fragments: BTreeMap<FragmentRef, SimFragment>,
    viewport: ScrollPosition,
    next_id: u64,
}

/// Document whose fragments sit at fixed vertical offsets
#[derive(Debug)]
pub struct SimulatedDocument {
    state: RwLock<DocumentState>,
    fail_visibility: AtomicBool,
    fail_enumeration: AtomicBool,
    visibility_calls: AtomicU64,
}

impl SimulatedDocument {
    pub fn new(viewport_height: f64) -> Self {
        Self {
            state: RwLock::new(DocumentState {
                fragments: BTreeMap::new(),
                viewport: ScrollPosition::new(0.0, viewport_height),
                next_id: 0,
            }),
            fail_visibility: AtomicBool::new(false),
            fail_enumeration: AtomicBool::new(false),
            visibility_calls: AtomicU64::new(0),
        }
    }

    /// Lay `posts` out top to bottom, `spacing` pixels apart
    pub fn with_posts<I, S>(viewport_height: f64, spacing: f64, posts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let document = Self::new(viewport_height);
        for (i, post) in posts.into_iter().enumerate() {
            document.add_fragment(post, i as f64 * spacing);
        }
        document
    }

    pub fn add_fragment(&self, text: impl Into<String>, position: f64) -> FragmentRef {
        let mut state = self.state.write();
        state.next_id += 1;
        let fragment = FragmentRef(state.next_id);
        state.fragments.insert(
            fragment,
            SimFragment {
                text: text.into(),
                position,
                hidden: false,
            },
        );
        fragment
    }

    pub fn remove_fragment(&self, fragment: FragmentRef) -> bool {
        self.state.write().fragments.remove(&fragment).is_some()
    }

    pub fn set_text(&self, fragment: FragmentRef, text: impl Into<String>) {
        if let Some(entry) = self.state.write().fragments.get_mut(&fragment) {
            entry.text = text.into();
        }
    }

    /// Move the viewport; returns the new geometry
    pub fn scroll_to(&self, top: f64) -> ScrollPosition {
        let mut state = self.state.write();
        state.viewport = ScrollPosition::new(top.max(0.0), state.viewport.height);
        state.viewport
    }

    pub fn is_hidden(&self, fragment: FragmentRef) -> bool {
        self.state
            .read()
            .fragments
            .get(&fragment)
            .is_some_and(|f| f.hidden)
    }

    pub fn hidden(&self) -> Vec<FragmentRef> {
        self.state
            .read()
            .fragments
            .iter()
            .filter(|(_, f)| f.hidden)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().fragments.is_empty()
    }

    /// Make every `set_visibility` call fail
    pub fn fail_visibility(&self, fail: bool) {
        self.fail_visibility.store(fail, Ordering::Relaxed);
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::Relaxed);
    }

    /// Successful visibility changes applied so far
    pub fn visibility_calls(&self) -> u64 {
        self.visibility_calls.load(Ordering::Relaxed)
    }
}

impl Document for SimulatedDocument {
    fn enumerate_fragments(&self, scope: FragmentScope) -> Result<Vec<FragmentRef>, CollaboratorError> {
        if self.fail_enumeration.load(Ordering::Relaxed) {
            return Err(CollaboratorError::Unavailable("document detached".to_string()));
        }
        let state = self.state.read();
        Ok(state
            .fragments
            .iter()
            .filter(|(_, f)| scope == FragmentScope::All || state.viewport.contains(f.position))
            .map(|(id, _)| *id)
            .collect())
    }

    fn is_visible(&self, fragment: FragmentRef) -> bool {
        let state = self.state.read();
        state
            .fragments
            .get(&fragment)
            .is_some_and(|f| state.viewport.contains(f.position))
    }

    fn position(&self, fragment: FragmentRef) -> Option<f64> {
        self.state.read().fragments.get(&fragment).map(|f| f.position)
    }

    fn viewport(&self) -> ScrollPosition {
        self.state.read().viewport
    }

    fn set_visibility(
        &self,
        fragment: FragmentRef,
        hidden: bool,
        reason: &str,
    ) -> Result<(), CollaboratorError> {
        if self.fail_visibility.load(Ordering::Relaxed) {
            return Err(CollaboratorError::Rejected("style update refused".to_string()));
        }
        let mut state = self.state.write();
        let entry = state
            .fragments
            .get_mut(&fragment)
            .ok_or(CollaboratorError::FragmentGone(fragment.0))?;
        entry.hidden = hidden;
        drop(state);

        self.visibility_calls.fetch_add(1, Ordering::Relaxed);
        debug!(%fragment, hidden, reason, "Fragment visibility changed");
        Ok(())
    }

    fn extract_text(&self, fragment: FragmentRef) -> Option<String> {
        self.state
            .read()
            .fragments
            .get(&fragment)
            .map(|f| f.text.clone())
    }
}

/// Rule deciding one fragment
pub type ClassifierRule = Arc<dyn Fn(&FragmentDescriptor, &Criteria) -> Decision + Send + Sync>;

/// One call received by a [`ScriptedClassifier`]
#[derive(Debug, Clone)]
pub struct Submission {
    pub request: RequestId,
    pub batch: Vec<FragmentDescriptor>,
    pub criteria: Criteria,
}

/// Classifier answering from a rule after an optional delay
pub struct ScriptedClassifier {
    rule: ClassifierRule,
    delay: Duration,
    failures: Mutex<VecDeque<CollaboratorError>>,
    submissions: Mutex<Vec<Submission>>,
}

impl ScriptedClassifier {
    /// Keeps everything
    pub fn new() -> Self {
        Self::with_rule(|descriptor, _| Decision::keep(descriptor.fragment))
    }

    pub fn with_rule<F>(rule: F) -> Self
    where
        F: Fn(&FragmentDescriptor, &Criteria) -> Decision + Send + Sync + 'static,
    {
        Self {
            rule: Arc::new(rule),
            delay: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Filters descriptors mentioning any of `topics`, case-insensitively
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics
            .into_iter()
            .map(|t| t.into().to_lowercase())
            .collect();
        Self::with_rule(move |descriptor, _| {
            let text = descriptor.text.to_lowercase();
            match topics.iter().find(|topic| text.contains(topic.as_str())) {
                Some(topic) => Decision::filter(descriptor.fragment, format!("topic:{}", topic)),
                None => Decision::keep(descriptor.fragment),
            }
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue an error for the next call
    pub fn fail_next(&self, error: CollaboratorError) {
        self.failures.lock().push_back(error);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }
}

impl Default for ScriptedClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        request_id: RequestId,
        batch: Vec<FragmentDescriptor>,
        criteria: &Criteria,
    ) -> Result<Vec<Decision>, CollaboratorError> {
        self.submissions.lock().push(Submission {
            request: request_id,
            batch: batch.clone(),
            criteria: criteria.clone(),
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        Ok(batch
            .iter()
            .map(|descriptor| (self.rule)(descriptor, criteria))
            .collect())
    }
}

/// Mutation source fed through [`ChannelMutationSource::emit`]
#[derive(Debug, Default)]
pub struct ChannelMutationSource {
    sink: Mutex<Option<mpsc::UnboundedSender<RawChange>>>,
    fail_attach: AtomicBool,
    attach_count: AtomicU64,
}

impl ChannelMutationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `change` to the attached engine; `false` when detached
    pub fn emit(&self, change: RawChange) -> bool {
        self.sink
            .lock()
            .as_ref()
            .is_some_and(|sink| sink.send(change).is_ok())
    }

    pub fn is_attached(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub fn fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::Relaxed);
    }

    pub fn attach_count(&self) -> u64 {
        self.attach_count.load(Ordering::Relaxed)
    }
}

impl MutationSource for ChannelMutationSource {
    fn attach(&self, sink: mpsc::UnboundedSender<RawChange>) -> Result<(), CollaboratorError> {
        if self.fail_attach.load(Ordering::Relaxed) {
            return Err(CollaboratorError::Unavailable("observer disconnected".to_string()));
        }
        *self.sink.lock() = Some(sink);
        self.attach_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn detach(&self) {
        self.sink.lock().take();
    }
}
