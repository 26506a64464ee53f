//! Session lifecycle and fragment processing
//!
//! The orchestrator owns every piece of engine state behind one `Arc`. Entry
//! points are synchronous so they can be driven from document callbacks; work
//! that has to wait (classifier round trips, mutation batching, background
//! draining) runs on session-scoped tokio tasks. Those tasks hold a `Weak`
//! reference and re-check the session id before touching state, so nothing a
//! finished session started can land on its successor.
//!
//! Lock order: `inner` → `queue` → `fragments` → `index` → `cache`. The
//! pending-request table and the history ring are leaves.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::batcher::{BatcherSettings, MutationBatch, MutationBatcher};
use super::cache::{AnalysisCache, CacheKey, CacheStats, CachedDecision};
use super::collaborators::{
    Classifier, Decision, Document, FragmentDescriptor, FragmentRef, FragmentScope,
    MutationSource, RequestId, ScrollPosition, Verdict,
};
use super::config::EngineConfig;
use super::content::TextCleaner;
use super::dataflow::{DecisionSource, EventCollector, FilterEvent};
use super::errors::{CollaboratorError, EngineError, ExponentialBackoff};
use super::fingerprint::{compute_fingerprint, Fingerprint, FingerprintIndex};
use super::fragments::{AppliedDecision, FragmentTable, VisibilityChange};
use super::lock::{LockError, LockRegistry};
use super::matcher::{Criteria, CriteriaFingerprint, InstantMatcher, MatchOutcome};
use super::queue::{PriorityClass, PriorityHint, PriorityWorkQueue};
use super::session::{
    CompletionReason, OrchestratorState, Session, SessionCause, SessionCounters, SessionId,
    SessionRecord, SessionStatus,
};
use super::supervisor::{Supervisor, SupervisorCommand, WorkerHandle};
use super::telemetry::EngineTelemetry;
use crate::metrics::{Metrics, Timer};

const HISTORY_CAPACITY: usize = 32;
const DEFAULT_EVENT_CAPACITY: usize = 1024;
const RETRY_INITIAL_BACKOFF_MS: u64 = 250;
const RETRY_MAX_BACKOFF_MS: u64 = 4_000;
const TIMER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Criteria in force plus its compiled matcher
#[derive(Debug)]
struct ActiveCriteria {
    criteria: Criteria,
    fingerprint: CriteriaFingerprint,
    matcher: InstantMatcher,
}

impl ActiveCriteria {
    fn compile(criteria: Criteria) -> Result<Self, EngineError> {
        let matcher = InstantMatcher::new(&criteria)?;
        Ok(Self {
            fingerprint: criteria.fingerprint(),
            criteria,
            matcher,
        })
    }

    fn empty() -> Self {
        let criteria = Criteria::default();
        Self {
            fingerprint: criteria.fingerprint(),
            criteria,
            matcher: InstantMatcher::empty(),
        }
    }
}

/// Classifier request awaiting its answer
#[derive(Debug)]
struct PendingRequest {
    session: SessionId,
    criteria: CriteriaFingerprint,
    /// Fragments submitted, with the fingerprint stored for each
    members: HashMap<FragmentRef, Option<Fingerprint>>,
    submitted_at: Instant,
}

/// Tasks and wake-up signal belonging to the active session
struct SessionRuntime {
    supervisor: Arc<Supervisor>,
    wake: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    runtime: Option<SessionRuntime>,
    last_scroll: Option<Instant>,
    /// Trailing scroll position deferred by the debounce
    pending_scroll: Option<ScrollPosition>,
}

/// One decision ready to be applied
#[derive(Debug, Clone)]
struct Resolution {
    verdict: Verdict,
    source: DecisionSource,
    reason: String,
    cacheable: bool,
}

impl Resolution {
    fn new(verdict: Verdict, source: DecisionSource, reason: String, cacheable: bool) -> Self {
        Self {
            verdict,
            source,
            reason,
            cacheable,
        }
    }
}

/// Result of one synchronous viewport pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ViewportReport {
    /// Items taken from the queue and examined
    pub processed: usize,
    pub filtered: usize,
    pub kept: usize,
    /// Items whose text could not be extracted
    pub skipped: usize,
    pub elapsed: Duration,
    /// The deadline cut the pass short; remaining items were requeued
    pub timed_out: bool,
}

/// Answer to [`Orchestrator::start_session`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartOutcome {
    pub success: bool,
    pub session_id: Option<SessionId>,
    /// The request was absorbed by the session already running
    pub deferred_to_existing: bool,
    /// Session completed by this start through a graceful handoff
    pub handoff_from: Option<SessionId>,
    pub viewport: ViewportReport,
    pub error: Option<String>,
}

impl StartOutcome {
    fn started(id: SessionId, handoff_from: Option<SessionId>, viewport: ViewportReport) -> Self {
        Self {
            success: true,
            session_id: Some(id),
            deferred_to_existing: false,
            handoff_from,
            viewport,
            error: None,
        }
    }

    fn deferred(existing: SessionId) -> Self {
        Self {
            success: true,
            session_id: Some(existing),
            deferred_to_existing: true,
            handoff_from: None,
            viewport: ViewportReport::default(),
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            session_id: None,
            deferred_to_existing: false,
            handoff_from: None,
            viewport: ViewportReport::default(),
            error: Some(error),
        }
    }
}

/// Periodic health check result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub state: OrchestratorState,
    pub session: Option<SessionId>,
    pub session_age: Option<Duration>,
    /// The check force-completed an over-age session
    pub timed_out: bool,
    pub lock_held: bool,
    pub queue_depth: usize,
    pub pending_requests: usize,
    pub workers_healthy: bool,
}

/// Builder wiring collaborators into an [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: EngineConfig,
    document: Option<Arc<dyn Document>>,
    classifier: Option<Arc<dyn Classifier>>,
    mutations: Option<Arc<dyn MutationSource>>,
    locks: Option<Arc<LockRegistry>>,
    runtime: Option<Handle>,
    criteria: Criteria,
    event_capacity: usize,
}

impl OrchestratorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            document: None,
            classifier: None,
            mutations: None,
            locks: None,
            runtime: None,
            criteria: Criteria::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn document(mut self, document: Arc<dyn Document>) -> Self {
        self.document = Some(document);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn mutation_source(mut self, source: Arc<dyn MutationSource>) -> Self {
        self.mutations = Some(source);
        self
    }

    /// Share a lock registry with other components; a private one is created otherwise
    pub fn lock_registry(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Runtime used to spawn session tasks when called from outside tokio
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Criteria used by starts that do not supply their own
    pub fn criteria(mut self, criteria: Criteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Arc<Orchestrator>, EngineError> {
        self.config
            .validate()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        let document = self
            .document
            .ok_or_else(|| EngineError::missing_collaborator("document"))?;
        let classifier = self
            .classifier
            .ok_or_else(|| EngineError::missing_collaborator("classifier"))?;
        let mutations = self
            .mutations
            .ok_or_else(|| EngineError::missing_collaborator("mutation_source"))?;

        let metrics = Metrics::new()
            .map_err(|e| EngineError::Configuration(format!("metrics registry: {}", e)))?;

        let criteria = if self.criteria.is_empty() {
            ActiveCriteria::empty()
        } else {
            ActiveCriteria::compile(self.criteria)?
        };

        let config = self.config;
        Ok(Arc::new(Orchestrator {
            queue: Mutex::new(PriorityWorkQueue::new(config.near_viewport_margin_px)),
            fragments: Mutex::new(FragmentTable::new()),
            index: Mutex::new(FingerprintIndex::new(
                config.hamming_threshold,
                config.fingerprint_capacity,
            )),
            cache: Mutex::new(AnalysisCache::new(config.cache_max_size, config.cache_ttl())),
            cleaner: TextCleaner::new(config.min_text_length),
            locks: self.locks.unwrap_or_default(),
            runtime: self.runtime.or_else(|| Handle::try_current().ok()),
            document,
            classifier,
            mutations,
            state: AtomicU8::new(OrchestratorState::Idle as u8),
            inner: Mutex::new(Inner::default()),
            criteria: ArcSwap::from_pointee(criteria),
            pending: DashMap::new(),
            next_session: AtomicU64::new(0),
            next_request: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            timers: Supervisor::new("orchestrator-timers"),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            telemetry: EngineTelemetry::new(),
            events: EventCollector::new(self.event_capacity),
            metrics,
            config,
        }))
    }
}

/// Progressive filtering engine
pub struct Orchestrator {
    config: EngineConfig,
    document: Arc<dyn Document>,
    classifier: Arc<dyn Classifier>,
    mutations: Arc<dyn MutationSource>,
    locks: Arc<LockRegistry>,
    runtime: Option<Handle>,

    state: AtomicU8,
    inner: Mutex<Inner>,
    queue: Mutex<PriorityWorkQueue>,
    fragments: Mutex<FragmentTable>,
    index: Mutex<FingerprintIndex>,
    cache: Mutex<AnalysisCache>,
    criteria: ArcSwap<ActiveCriteria>,
    pending: DashMap<RequestId, PendingRequest>,
    cleaner: TextCleaner,

    next_session: AtomicU64,
    next_request: AtomicU64,
    paused: AtomicBool,
    timers: Supervisor,
    history: Mutex<VecDeque<SessionRecord>>,

    telemetry: EngineTelemetry,
    metrics: Metrics,
    events: EventCollector,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Orchestrator {
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    // ----------------------------------------------------------------------
    // Introspection
    // ----------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> OrchestratorState {
        OrchestratorState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: OrchestratorState) {
        self.state.store(state as u8, Ordering::Release);
        debug!(state = ?state, "Orchestrator state changed");
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.inner.lock().session.as_ref().map(|s| s.id)
    }

    /// Criteria fingerprint the current session was started under
    pub fn session_criteria(&self) -> Option<CriteriaFingerprint> {
        self.inner.lock().session.as_ref().map(|s| s.criteria)
    }

    pub fn session_counters(&self) -> Option<SessionCounters> {
        self.inner.lock().session.as_ref().map(|s| s.counters)
    }

    /// Whether the filtering lock is held; the authoritative activity check
    pub fn is_filtering_active(&self) -> bool {
        self.locks.is_held(&self.config.lock_name)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn criteria(&self) -> Criteria {
        self.criteria.load().criteria.clone()
    }

    pub fn criteria_fingerprint(&self) -> CriteriaFingerprint {
        self.criteria.load().fingerprint
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn cache_keys(&self) -> Vec<CacheKey> {
        self.cache.lock().keys().copied().collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    /// Live cache entry for `key`, without affecting hit statistics
    pub fn cached_decision(&self, key: &CacheKey) -> Option<CachedDecision> {
        self.cache.lock().peek_at(key, Instant::now()).cloned()
    }

    pub fn hidden_fragments(&self) -> Vec<FragmentRef> {
        let mut hidden: Vec<FragmentRef> = self.fragments.lock().hidden().collect();
        hidden.sort();
        hidden
    }

    /// Completed sessions, oldest first
    pub fn history(&self) -> Vec<SessionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn telemetry(&self) -> &EngineTelemetry {
        &self.telemetry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn events(&self) -> &EventCollector {
        &self.events
    }

    fn resolve_runtime(&self) -> Result<Handle, EngineError> {
        self.runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
            .ok_or_else(|| EngineError::Configuration("no tokio runtime available".to_string()))
    }

    fn observe_queue_depth(&self, depth: usize) {
        self.telemetry.set_queue_depth(depth);
        self.metrics.queue_depth.set(depth as i64);
    }

    fn current_mut(inner: &mut Inner, id: SessionId) -> Option<&mut Session> {
        inner
            .session
            .as_mut()
            .filter(|session| session.id == id && session.is_active())
    }

    fn is_current(&self, id: SessionId) -> bool {
        self.inner
            .lock()
            .session
            .as_ref()
            .is_some_and(|session| session.id == id && session.is_active())
    }

    fn has_inflight(&self, id: SessionId) -> bool {
        self.pending.iter().any(|entry| entry.value().session == id)
    }

    fn wake(&self, id: SessionId) {
        let inner = self.inner.lock();
        if inner.session.as_ref().is_some_and(|s| s.id == id) {
            if let Some(runtime) = inner.runtime.as_ref() {
                runtime.wake.notify_one();
            }
        }
    }

    // ----------------------------------------------------------------------
    // Global timers
    // ----------------------------------------------------------------------

    /// Spawn the health-check and cache-sweep timers
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let runtime = self.resolve_runtime()?;
        if self.timers.worker_count() > 0 {
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let health = runtime.spawn(Self::periodic(
            weak.clone(),
            self.config.health_check_interval(),
            self.timers.subscribe(),
            |this| {
                this.health_check();
            },
        ));
        self.timers
            .register_worker(WorkerHandle::new("health-check", health, true));

        let sweep = runtime.spawn(Self::periodic(
            weak,
            self.config.cache_sweep_interval(),
            self.timers.subscribe(),
            |this| {
                this.sweep_cache();
            },
        ));
        self.timers
            .register_worker(WorkerHandle::new("cache-sweep", sweep, false));

        self.timers.start();
        info!(
            health_check_ms = self.config.health_check_interval_ms,
            cache_sweep_ms = self.config.cache_sweep_interval_ms,
            "Orchestrator timers started"
        );
        Ok(())
    }

    async fn periodic(
        weak: Weak<Self>,
        period: Duration,
        mut commands: broadcast::Receiver<SupervisorCommand>,
        tick: fn(&Self),
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match weak.upgrade() {
                    Some(this) => tick(&this),
                    None => break,
                },
                cmd = commands.recv() => match cmd {
                    Ok(SupervisorCommand::Stop) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                },
            }
        }
    }

    /// Drop expired cache entries; returns how many were removed
    pub fn sweep_cache(&self) -> usize {
        let (removed, remaining) = {
            let mut cache = self.cache.lock();
            (cache.sweep(), cache.len())
        };
        self.metrics.cache_entries.set(remaining as i64);
        if removed > 0 {
            debug!(removed, remaining, "Swept expired cache entries");
        }
        removed
    }

    /// Complete the active session and stop the timers
    pub async fn shutdown(&self) {
        if let Some(id) = self.current_session() {
            self.complete_session(id, CompletionReason::Shutdown);
        }
        self.timers.stop(TIMER_STOP_TIMEOUT).await;
        info!("Orchestrator shut down");
    }

    // ----------------------------------------------------------------------
    // Session lifecycle
    // ----------------------------------------------------------------------

    /// Begin filtering for `cause`
    ///
    /// An empty `criteria` reuses the criteria last in force. A running session
    /// that has settled (start sequence finished, no classifier request in
    /// flight) is handed off; otherwise the request is deferred to it. Returns
    /// `Err` only for misuse: no runtime to spawn on, or criteria that cannot
    /// be compiled. Lock subsystem failures come back as `success = false`.
    pub fn start_session(
        self: &Arc<Self>,
        cause: SessionCause,
        criteria: Criteria,
    ) -> Result<StartOutcome, EngineError> {
        let runtime = self.resolve_runtime()?;

        let mut inner = self.inner.lock();

        // Criteria are only swapped under `inner`, so this read is stable
        let current = self.criteria.load_full();
        let requested = if criteria.is_empty() || criteria.fingerprint() == current.fingerprint {
            current.clone()
        } else {
            Arc::new(ActiveCriteria::compile(criteria)?)
        };

        let mut handoff_from = None;
        if let Some(existing) = inner.session.as_ref() {
            let existing_id = existing.id;
            if existing.initializing || self.has_inflight(existing_id) {
                drop(inner);
                return Ok(self.defer(existing_id, cause));
            }
            if let Err(e) = self.finish_locked(&mut inner, CompletionReason::Handoff) {
                drop(inner);
                warn!(session = %existing_id, error = %e, "Handoff failed, deferring to existing session");
                return Ok(self.defer(existing_id, cause));
            }
            EngineTelemetry::incr(&self.telemetry.handoffs);
            handoff_from = Some(existing_id);
        }

        self.set_state(OrchestratorState::Starting);
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed) + 1);

        let token = match self.locks.acquire(&self.config.lock_name, id) {
            Ok(token) => token,
            Err(LockError::Contended { holder, .. }) => {
                self.set_state(OrchestratorState::Idle);
                drop(inner);
                return Ok(self.defer(holder, cause));
            }
            Err(e) => {
                self.set_state(OrchestratorState::Idle);
                drop(inner);
                error!(session = %id, error = %e, "Cannot acquire filtering lock");
                EngineTelemetry::incr(&self.telemetry.start_failures);
                self.metrics.session_start_failures.inc();
                return Ok(StartOutcome::failed(e.to_string()));
            }
        };

        if requested.fingerprint != current.fingerprint {
            info!(
                from = %current.fingerprint,
                to = %requested.fingerprint,
                "Criteria changed, resetting similarity index"
            );
            self.index.lock().reset();
            self.criteria.store(requested.clone());
        }

        let mut session = Session::new(id, cause, token, requested.fingerprint);
        session.status = SessionStatus::Active;
        let correlation_id = session.correlation_id;
        inner.session = Some(session);
        inner.last_scroll = None;
        inner.pending_scroll = None;
        inner.runtime = Some(self.spawn_session_workers(id, &runtime));
        self.set_state(OrchestratorState::Active);
        drop(inner);

        EngineTelemetry::incr(&self.telemetry.sessions_started);
        self.metrics.sessions_started.inc();
        self.metrics.active_sessions.set(1);
        self.events.collect(FilterEvent::SessionStarted {
            session: id,
            cause,
            at: Instant::now(),
        });
        info!(
            session = %id,
            %cause,
            %correlation_id,
            criteria = %requested.fingerprint,
            handoff_from = ?handoff_from,
            "Filtering session started"
        );

        let fragments = self.populate(id);
        self.dispatch_classifier(id, &requested, &fragments, &runtime);
        let viewport = self.viewport_pass(id);
        self.wake(id);

        if let Some(session) = Self::current_mut(&mut self.inner.lock(), id) {
            session.initializing = false;
        }

        Ok(StartOutcome::started(id, handoff_from, viewport))
    }

    fn defer(&self, existing: SessionId, cause: SessionCause) -> StartOutcome {
        EngineTelemetry::incr(&self.telemetry.sessions_deferred);
        self.metrics.sessions_deferred.inc();
        self.events.collect(FilterEvent::SessionDeferred {
            existing,
            cause,
            at: Instant::now(),
        });
        debug!(%existing, %cause, "Start deferred to existing session");
        StartOutcome::deferred(existing)
    }

    /// Track every fragment in the document and queue it
    fn populate(&self, id: SessionId) -> Vec<FragmentRef> {
        let fragments = match self.document.enumerate_fragments(FragmentScope::All) {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!(session = %id, error = %e, "Fragment enumeration failed, continuing with an empty set");
                return Vec::new();
            }
        };

        let depth = {
            let mut queue = self.queue.lock();
            let mut table = self.fragments.lock();
            for &fragment in &fragments {
                table.track(fragment);
                queue.enqueue(fragment, PriorityHint::Auto, &*self.document);
            }
            queue.len()
        };
        self.observe_queue_depth(depth);
        debug!(session = %id, fragments = fragments.len(), queued = depth, "Document enumerated");
        fragments
    }

    fn spawn_session_workers(self: &Arc<Self>, id: SessionId, runtime: &Handle) -> SessionRuntime {
        let supervisor = Arc::new(Supervisor::new(id.to_string()));
        let wake = Arc::new(Notify::new());
        let weak = Arc::downgrade(self);

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        match MutationBatcher::spawn(
            runtime,
            BatcherSettings::from(&self.config),
            self.mutations.clone(),
            batch_tx,
            supervisor.subscribe(),
        ) {
            Ok(handle) => {
                supervisor.register_worker(WorkerHandle::new("mutation-batcher", handle, false))
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Mutation source unavailable, session runs without mutation feed")
            }
        }

        let consumer = runtime.spawn(Self::consume_batches(weak.clone(), id, batch_rx));
        supervisor.register_worker(WorkerHandle::new("batch-consumer", consumer, false));

        let worker = runtime.spawn(Self::background_worker(
            weak.clone(),
            id,
            wake.clone(),
            supervisor.subscribe(),
            self.config.background_yield(),
        ));
        supervisor.register_worker(WorkerHandle::new("background-worker", worker, true));

        let ticker = runtime.spawn(Self::analysis_ticker(
            weak,
            id,
            self.config.continuous_analysis_interval(),
            supervisor.subscribe(),
        ));
        supervisor.register_worker(WorkerHandle::new("continuous-analysis", ticker, false));

        supervisor.start();
        if self.is_paused() {
            supervisor.pause();
        }
        SessionRuntime { supervisor, wake }
    }

    /// Complete session `id`; `false` when it is not the current session
    ///
    /// Idempotent: a second call for the same id is a no-op.
    pub fn complete_session(&self, id: SessionId, reason: CompletionReason) -> bool {
        let mut inner = self.inner.lock();
        if inner.session.as_ref().map(|s| s.id) != Some(id) {
            return false;
        }
        match self.finish_locked(&mut inner, reason) {
            Ok(record) => record.is_some(),
            Err(e) => {
                error!(session = %id, error = %e, "Session completion failed");
                false
            }
        }
    }

    /// Complete whatever session is running with reason `stopped`
    pub fn stop(&self) -> bool {
        match self.current_session() {
            Some(id) => self.complete_session(id, CompletionReason::Stopped),
            None => false,
        }
    }

    /// Release the lock and tear down the current session
    ///
    /// On a lock error nothing is torn down and the session stays current.
    fn finish_locked(
        &self,
        inner: &mut Inner,
        reason: CompletionReason,
    ) -> Result<Option<SessionRecord>, LockError> {
        let Some(session) = inner.session.take() else {
            return Ok(None);
        };
        match self.locks.release(&session.token) {
            Ok(true) => {}
            Ok(false) => debug!(session = %session.id, "Filtering lock was already released"),
            Err(e) => {
                inner.session = Some(session);
                return Err(e);
            }
        }

        self.set_state(OrchestratorState::Completing);
        let record = self.teardown_locked(inner, session, reason);
        self.set_state(OrchestratorState::Idle);
        Ok(Some(record))
    }

    fn teardown_locked(
        &self,
        inner: &mut Inner,
        mut session: Session,
        reason: CompletionReason,
    ) -> SessionRecord {
        session.status = SessionStatus::Completing;
        let id = session.id;

        if let Some(runtime) = inner.runtime.take() {
            runtime.supervisor.abort_all();
        }
        self.mutations.detach();
        inner.pending_scroll = None;
        inner.last_scroll = None;

        let dropped: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().session == id)
            .map(|entry| *entry.key())
            .collect();
        if !dropped.is_empty() {
            let mut index = self.index.lock();
            for request in &dropped {
                if let Some((_, pending)) = self.pending.remove(request) {
                    for fingerprint in pending.members.values().flatten() {
                        index.remove_seen(*fingerprint);
                    }
                }
            }
            debug!(session = %id, requests = dropped.len(), "Dropped in-flight classifier requests");
        }

        self.queue.lock().clear();
        self.observe_queue_depth(0);

        let record = session.finish(reason);
        {
            let mut history = self.history.lock();
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        EngineTelemetry::incr(&self.telemetry.sessions_completed);
        self.metrics
            .sessions_completed
            .with_label_values(&[reason.as_str()])
            .inc();
        self.metrics
            .session_duration
            .observe(record.duration_ms as f64 / 1000.0);
        self.metrics.active_sessions.set(0);
        self.events.collect(FilterEvent::SessionCompleted {
            session: id,
            reason,
            duration_ms: record.duration_ms,
            at: Instant::now(),
        });
        info!(
            session = %id,
            %reason,
            duration_ms = record.duration_ms,
            processed = record.counters.processed,
            filtered = record.counters.filtered,
            kept = record.counters.kept,
            "Filtering session completed"
        );
        record
    }

    /// Force-complete a session older than the maximum duration
    pub fn health_check(&self) -> HealthReport {
        let max_age = self.config.max_session_duration();
        let mut inner = self.inner.lock();

        let (session, session_age) = match inner.session.as_ref() {
            Some(s) => (Some(s.id), Some(s.age())),
            None => (None, None),
        };

        let mut timed_out = false;
        if let (Some(id), Some(age)) = (session, session_age) {
            if age > max_age {
                warn!(
                    session = %id,
                    age_ms = age.as_millis() as u64,
                    max_ms = self.config.max_session_duration_ms,
                    "Session exceeded maximum duration, forcing completion"
                );
                EngineTelemetry::incr(&self.telemetry.session_timeouts);
                if let Err(e) = self.finish_locked(&mut inner, CompletionReason::Timeout) {
                    error!(session = %id, error = %e, "Timeout completion failed, force-releasing lock");
                    self.locks.force_release(&self.config.lock_name);
                    if let Some(stuck) = inner.session.take() {
                        self.teardown_locked(&mut inner, stuck, CompletionReason::Timeout);
                        self.set_state(OrchestratorState::Idle);
                    }
                }
                timed_out = true;
            }
        }

        let workers_healthy = inner.runtime.as_ref().map_or(true, |runtime| {
            runtime.supervisor.reap_finished();
            runtime.supervisor.error_count() == 0
        });
        let session = inner.session.as_ref().map(|s| s.id);
        drop(inner);

        HealthReport {
            state: self.state(),
            session,
            session_age,
            timed_out,
            lock_held: self.is_filtering_active(),
            queue_depth: self.queue_len(),
            pending_requests: self.pending.len(),
            workers_healthy,
        }
    }

    /// Tear everything down and force-release the lock
    ///
    /// Never panics; returns `false` if the teardown itself panicked, in which
    /// case the lock is still force-released and the engine left idle.
    pub fn emergency_stop(&self, reason: &str) -> bool {
        match catch_unwind(AssertUnwindSafe(|| self.emergency_teardown(reason))) {
            Ok(()) => true,
            Err(_) => {
                error!(reason, "Emergency teardown panicked, forcing lock release");
                self.locks.force_release(&self.config.lock_name);
                self.set_state(OrchestratorState::Idle);
                false
            }
        }
    }

    fn emergency_teardown(&self, reason: &str) {
        scopeguard::defer! {
            self.set_state(OrchestratorState::Idle);
        }

        warn!(reason, "Emergency stop");
        self.timers.abort_all();

        {
            let mut inner = self.inner.lock();
            if let Some(session) = inner.session.take() {
                self.set_state(OrchestratorState::Completing);
                self.teardown_locked(&mut inner, session, CompletionReason::Emergency);
            }
            inner.pending_scroll = None;
        }

        if let Some(holder) = self.locks.force_release(&self.config.lock_name) {
            debug!(%holder, "Filtering lock force-released");
        }
        self.pending.clear();
        self.queue.lock().clear();
        self.observe_queue_depth(0);

        EngineTelemetry::incr(&self.telemetry.emergency_stops);
        self.events.collect(FilterEvent::EmergencyStop {
            reason: reason.to_string(),
            at: Instant::now(),
        });
    }

    /// Suspend background processing and mutation intake
    pub fn pause(&self) {
        if self.paused.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.inner.lock().runtime.as_ref() {
            runtime.supervisor.pause();
        }
        info!("Filtering paused");
    }

    pub fn resume(&self) {
        if !self.paused.swap(false, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.lock();
        if let Some(runtime) = inner.runtime.as_ref() {
            runtime.supervisor.resume();
            runtime.wake.notify_one();
        }
        drop(inner);
        info!("Filtering resumed");
    }

    // ----------------------------------------------------------------------
    // Processing
    // ----------------------------------------------------------------------

    /// Decide `fragment` from local knowledge: cache, allow terms, similarity,
    /// deny terms, in that order
    fn process_item(
        &self,
        session: &mut Session,
        fragment: FragmentRef,
        active: &ActiveCriteria,
    ) -> Option<Verdict> {
        let text = self.document.extract_text(fragment)?;
        let cleaned = self.cleaner.clean(&text);
        let fingerprint = compute_fingerprint(
            &cleaned,
            self.config.shingle_size,
            self.config.min_text_length,
        );

        {
            let mut table = self.fragments.lock();
            if !table.contains(fragment) {
                return None;
            }
            table.set_fingerprint(fragment, fingerprint);
        }

        session.counters.processed += 1;
        EngineTelemetry::incr(&self.telemetry.fragments_processed);

        let outcome = active.matcher.evaluate(&text);
        let resolution = self.resolve(fingerprint, active.fingerprint, outcome);
        let verdict = resolution.verdict;
        self.apply_decision(session, fragment, fingerprint, active.fingerprint, resolution)
            .then_some(verdict)
    }

    fn resolve(
        &self,
        fingerprint: Option<Fingerprint>,
        criteria: CriteriaFingerprint,
        outcome: MatchOutcome,
    ) -> Resolution {
        if let Some(fp) = fingerprint {
            if let Some(hit) = self.cache.lock().get(&CacheKey::new(fp, criteria)) {
                EngineTelemetry::incr(&self.telemetry.cache_hits);
                return Resolution::new(hit.verdict, DecisionSource::Cache, hit.reason, false);
            }
        }

        if let MatchOutcome::Allowed(term) = &outcome {
            return Resolution::new(
                Verdict::Keep,
                DecisionSource::Allowlist,
                format!("allow:{}", term),
                false,
            );
        }

        if let Some(fp) = fingerprint {
            let similar = self.index.lock().find_decided(fp).map(|entry| entry.reason.clone());
            if let Some(reason) = similar {
                EngineTelemetry::incr(&self.telemetry.similarity_hits);
                return Resolution::new(Verdict::Filter, DecisionSource::Similarity, reason, true);
            }
        }

        match outcome {
            MatchOutcome::Denied(term) => Resolution::new(
                Verdict::Filter,
                DecisionSource::InstantMatch,
                format!("deny:{}", term),
                true,
            ),
            _ => Resolution::new(Verdict::Keep, DecisionSource::InstantMatch, String::new(), false),
        }
    }

    /// Record a decision and mirror it onto the document
    ///
    /// Returns `false` for untracked fragments and refused visibility changes.
    fn apply_decision(
        &self,
        session: &mut Session,
        fragment: FragmentRef,
        fingerprint: Option<Fingerprint>,
        criteria: CriteriaFingerprint,
        resolution: Resolution,
    ) -> bool {
        let Resolution {
            verdict,
            source,
            reason,
            cacheable,
        } = resolution;

        {
            let mut table = self.fragments.lock();
            let Some(previous) = table.get(fragment).cloned() else {
                return false;
            };
            let applied = AppliedDecision {
                verdict,
                source,
                criteria,
                reason: reason.clone(),
            };
            let Some(change) = table.transition(fragment, applied) else {
                return false;
            };

            let hidden = match change {
                VisibilityChange::Hide => Some(true),
                VisibilityChange::Show => Some(false),
                VisibilityChange::Unchanged => None,
            };
            if let Some(hidden) = hidden {
                if let Err(e) = self.document.set_visibility(fragment, hidden, &reason) {
                    table.revert(fragment, &previous);
                    drop(table);
                    EngineTelemetry::incr(&self.telemetry.visibility_errors);
                    warn!(session = %session.id, %fragment, hidden, error = %e, "Visibility update failed");
                    return false;
                }
            }
        }

        if let Some(fp) = fingerprint {
            if verdict == Verdict::Filter {
                self.index.lock().mark_decided(fp, reason.clone());
            }
            if cacheable {
                self.cache.lock().put(
                    CacheKey::new(fp, criteria),
                    CachedDecision {
                        verdict,
                        reason,
                        source,
                    },
                );
            }
        }

        match verdict {
            Verdict::Filter => {
                session.counters.filtered += 1;
                EngineTelemetry::incr(&self.telemetry.fragments_filtered);
                self.metrics
                    .fragments_filtered
                    .with_label_values(&[source.as_str()])
                    .inc();
            }
            Verdict::Keep => {
                session.counters.kept += 1;
                EngineTelemetry::incr(&self.telemetry.fragments_kept);
                self.metrics.fragments_kept.inc();
            }
        }
        EngineTelemetry::incr(&self.telemetry.decisions_applied);
        self.events.collect(FilterEvent::FragmentDecided {
            session: session.id,
            fragment,
            verdict,
            source,
            at: Instant::now(),
        });
        true
    }

    /// Drain viewport-class work under the viewport deadline
    fn viewport_pass(&self, id: SessionId) -> ViewportReport {
        let timer = Timer::new();
        let started = Instant::now();
        let deadline = started + self.config.viewport_timeout();
        let active = self.criteria.load_full();
        let mut report = ViewportReport::default();

        'batches: loop {
            let batch = self
                .queue
                .lock()
                .drain_up_to(PriorityClass::Viewport, self.config.viewport_batch_size);
            if batch.is_empty() {
                break;
            }

            let mut inner = self.inner.lock();
            let Some(session) = Self::current_mut(&mut inner, id) else {
                break;
            };

            for (idx, item) in batch.iter().enumerate() {
                if Instant::now() >= deadline {
                    report.timed_out = true;
                    let mut queue = self.queue.lock();
                    for rest in &batch[idx..] {
                        let hint = if rest.forced {
                            PriorityHint::ForceImmediate
                        } else {
                            PriorityHint::Auto
                        };
                        queue.enqueue(rest.fragment, hint, &*self.document);
                    }
                    break 'batches;
                }

                report.processed += 1;
                match self.process_item(session, item.fragment, &active) {
                    Some(Verdict::Filter) => report.filtered += 1,
                    Some(Verdict::Keep) => report.kept += 1,
                    None => report.skipped += 1,
                }
            }
        }

        report.elapsed = started.elapsed();
        self.telemetry
            .record_viewport_latency(report.elapsed.as_micros() as u64);
        timer.observe_duration(&self.metrics.viewport_pass_latency);
        self.observe_queue_depth(self.queue_len());

        if report.timed_out {
            warn!(
                session = %id,
                processed = report.processed,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Viewport pass hit its deadline, remaining items requeued"
            );
        } else {
            debug!(
                session = %id,
                processed = report.processed,
                filtered = report.filtered,
                kept = report.kept,
                "Viewport pass complete"
            );
        }
        report
    }

    /// Process one background batch; returns the number of items drained
    fn background_step(&self, id: SessionId) -> usize {
        self.apply_pending_scroll(id);

        let batch = self.queue.lock().drain(self.config.background_batch_size);
        if batch.is_empty() {
            return 0;
        }

        let active = self.criteria.load_full();
        {
            let mut inner = self.inner.lock();
            let Some(session) = Self::current_mut(&mut inner, id) else {
                return 0;
            };
            for item in &batch {
                self.process_item(session, item.fragment, &active);
            }
        }
        self.observe_queue_depth(self.queue_len());
        batch.len()
    }

    async fn background_worker(
        weak: Weak<Self>,
        id: SessionId,
        wake: Arc<Notify>,
        mut commands: broadcast::Receiver<SupervisorCommand>,
        pace: Duration,
    ) {
        let mut paused = false;

        loop {
            let (drained, scroll_due) = {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if !this.is_current(id) {
                    break;
                }
                if paused {
                    (0, None)
                } else {
                    (this.background_step(id), this.scroll_due())
                }
            };

            if drained > 0 {
                if pace.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(pace).await;
                }
                loop {
                    match commands.try_recv() {
                        Ok(SupervisorCommand::Pause) => paused = true,
                        Ok(SupervisorCommand::Resume) => paused = false,
                        Ok(SupervisorCommand::Stop) | Err(TryRecvError::Closed) => return,
                        Ok(SupervisorCommand::Start) | Err(TryRecvError::Lagged(_)) => {}
                        Err(TryRecvError::Empty) => break,
                    }
                }
                continue;
            }

            tokio::select! {
                _ = wake.notified() => {}
                _ = sleep_until_opt(scroll_due) => {}
                cmd = commands.recv() => match cmd {
                    Ok(SupervisorCommand::Pause) => paused = true,
                    Ok(SupervisorCommand::Resume) => paused = false,
                    Ok(SupervisorCommand::Stop) | Err(RecvError::Closed) => break,
                    Ok(SupervisorCommand::Start) | Err(RecvError::Lagged(_)) => {}
                },
            }
        }
        debug!(session = %id, "Background worker exited");
    }

    async fn analysis_ticker(
        weak: Weak<Self>,
        id: SessionId,
        period: Duration,
        mut commands: broadcast::Receiver<SupervisorCommand>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut paused = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if paused {
                        continue;
                    }
                    let Some(this) = weak.upgrade() else {
                        break;
                    };
                    if !this.continuous_analysis(id) {
                        break;
                    }
                }
                cmd = commands.recv() => match cmd {
                    Ok(SupervisorCommand::Pause) => paused = true,
                    Ok(SupervisorCommand::Resume) => paused = false,
                    Ok(SupervisorCommand::Stop) | Err(RecvError::Closed) => break,
                    Ok(SupervisorCommand::Start) | Err(RecvError::Lagged(_)) => {}
                },
            }
        }
    }

    /// Requeue tracked fragments still undecided under the current criteria
    ///
    /// Returns `false` once `id` is no longer the current session.
    fn continuous_analysis(&self, id: SessionId) -> bool {
        if !self.is_current(id) {
            return false;
        }

        let criteria = self.criteria_fingerprint();
        let undecided = self.fragments.lock().undecided(criteria);
        if undecided.is_empty() {
            return true;
        }

        let (requeued, depth) = {
            let mut queue = self.queue.lock();
            let requeued = undecided
                .into_iter()
                .filter(|&f| queue.enqueue(f, PriorityHint::Auto, &*self.document).is_some())
                .count();
            (requeued, queue.len())
        };
        if requeued > 0 {
            debug!(session = %id, requeued, "Continuous analysis requeued undecided fragments");
            self.observe_queue_depth(depth);
            self.wake(id);
        }
        true
    }

    // ----------------------------------------------------------------------
    // Scroll
    // ----------------------------------------------------------------------

    /// Reprioritise for a new viewport and run a viewport pass
    ///
    /// Events closer together than the scroll debounce are coalesced: the last
    /// one is applied by the background worker once the window has passed, and
    /// `None` is returned. `None` also when no session is active or the engine
    /// is paused.
    pub fn on_scroll(&self, position: ScrollPosition) -> Option<ViewportReport> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let id = inner.session.as_ref().filter(|s| s.is_active())?.id;
        EngineTelemetry::incr(&self.telemetry.scroll_events);

        let debounce = self.config.scroll_debounce();
        let throttled = inner
            .last_scroll
            .is_some_and(|last| now.saturating_duration_since(last) < debounce);
        if throttled || self.is_paused() {
            inner.pending_scroll = Some(position);
            EngineTelemetry::incr(&self.telemetry.scroll_events_throttled);
            if let Some(runtime) = inner.runtime.as_ref() {
                runtime.wake.notify_one();
            }
            return None;
        }

        inner.last_scroll = Some(now);
        inner.pending_scroll = None;
        drop(inner);

        self.queue.lock().reprioritize(position, &*self.document);
        Some(self.viewport_pass(id))
    }

    fn scroll_due(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        inner
            .pending_scroll
            .and(inner.last_scroll)
            .map(|last| last + self.config.scroll_debounce())
    }

    fn apply_pending_scroll(&self, id: SessionId) {
        let position = {
            let mut inner = self.inner.lock();
            if !inner.session.as_ref().is_some_and(|s| s.id == id) {
                return;
            }
            let due = inner
                .last_scroll
                .map_or(true, |last| last.elapsed() >= self.config.scroll_debounce());
            if !due {
                return;
            }
            let Some(position) = inner.pending_scroll.take() else {
                return;
            };
            inner.last_scroll = Some(Instant::now());
            position
        };

        self.queue.lock().reprioritize(position, &*self.document);
        debug!(session = %id, top = position.top, "Applied trailing scroll position");
    }

    // ----------------------------------------------------------------------
    // Mutations
    // ----------------------------------------------------------------------

    async fn consume_batches(
        weak: Weak<Self>,
        id: SessionId,
        mut batches: mpsc::UnboundedReceiver<MutationBatch>,
    ) {
        while let Some(batch) = batches.recv().await {
            let Some(this) = weak.upgrade() else {
                break;
            };
            if !this.on_mutation_batch(id, batch) {
                break;
            }
        }
    }

    /// Fold a mutation batch into the fragment table and queue
    ///
    /// Returns `false` once `id` is no longer the current session.
    fn on_mutation_batch(self: &Arc<Self>, id: SessionId, batch: MutationBatch) -> bool {
        if !self.is_current(id) {
            return false;
        }

        EngineTelemetry::incr(&self.telemetry.mutation_batches);
        self.events.collect(FilterEvent::MutationBatch {
            session: id,
            added: batch.added.len(),
            removed: batch.removed.len(),
            at: Instant::now(),
        });

        let mut fresh = Vec::with_capacity(batch.added.len());
        let depth = {
            let mut queue = self.queue.lock();
            let mut table = self.fragments.lock();
            for &fragment in &batch.removed {
                queue.remove(fragment);
                table.remove(fragment);
            }
            for &fragment in &batch.added {
                if table.track(fragment) {
                    fresh.push(fragment);
                }
                queue.enqueue(fragment, PriorityHint::Auto, &*self.document);
            }
            queue.len()
        };
        self.observe_queue_depth(depth);

        debug!(
            session = %id,
            added = batch.added.len(),
            fresh = fresh.len(),
            removed = batch.removed.len(),
            changes = batch.change_count,
            "Mutation batch applied"
        );

        if !fresh.is_empty() {
            match self.resolve_runtime() {
                Ok(runtime) => {
                    let active = self.criteria.load_full();
                    self.dispatch_classifier(id, &active, &fresh, &runtime);
                }
                Err(e) => warn!(session = %id, error = %e, "Cannot dispatch classifier for new fragments"),
            }
        }
        self.wake(id);
        true
    }

    // ----------------------------------------------------------------------
    // Classifier
    // ----------------------------------------------------------------------

    /// Submit the fragments not already judged to the classifier
    ///
    /// Fragments with a live cache entry, or similar to content already
    /// submitted under the current criteria, are left out. One request per
    /// call; nothing is sent when criteria are empty.
    fn dispatch_classifier(
        self: &Arc<Self>,
        id: SessionId,
        active: &Arc<ActiveCriteria>,
        fragments: &[FragmentRef],
        runtime: &Handle,
    ) -> Option<RequestId> {
        if active.criteria.is_empty() || fragments.is_empty() {
            return None;
        }

        let now = Instant::now();
        let mut batch = Vec::new();
        let mut members = HashMap::new();

        for &fragment in fragments {
            let Some(text) = self.document.extract_text(fragment) else {
                continue;
            };
            let cleaned = self.cleaner.clean(&text);
            if !self.cleaner.is_valid(&cleaned) {
                continue;
            }

            let fingerprint = compute_fingerprint(
                &cleaned,
                self.config.shingle_size,
                self.config.min_text_length,
            );
            if let Some(fp) = fingerprint {
                let key = CacheKey::new(fp, active.fingerprint);
                if self.cache.lock().peek_at(&key, now).is_some() {
                    continue;
                }
                let mut index = self.index.lock();
                if index.find_similar(fp).is_some() {
                    continue;
                }
                index.store(fp);
            }

            batch.push(FragmentDescriptor {
                fragment,
                text: TextCleaner::truncate(&cleaned, self.config.descriptor_max_chars),
            });
            members.insert(fragment, fingerprint);
        }

        if batch.is_empty() {
            debug!(session = %id, candidates = fragments.len(), "Nothing new to classify");
            return None;
        }

        let request = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed) + 1);
        let batch_size = batch.len();
        self.pending.insert(
            request,
            PendingRequest {
                session: id,
                criteria: active.fingerprint,
                members,
                submitted_at: now,
            },
        );

        if let Some(session) = Self::current_mut(&mut self.inner.lock(), id) {
            session.counters.classifier_requests += 1;
        }
        EngineTelemetry::incr(&self.telemetry.classifier_requests);
        self.metrics.classifier_requests.inc();
        self.events.collect(FilterEvent::ClassifierDispatched {
            session: id,
            request,
            batch_size,
            at: now,
        });
        info!(session = %id, %request, batch_size, "Classifier request dispatched");

        runtime.spawn(Self::run_classifier(
            Arc::downgrade(self),
            self.classifier.clone(),
            request,
            batch,
            active.criteria.clone(),
            self.config.analysis_timeout(),
            self.config.classifier_max_retries,
        ));
        Some(request)
    }

    async fn run_classifier(
        weak: Weak<Self>,
        classifier: Arc<dyn Classifier>,
        request: RequestId,
        batch: Vec<FragmentDescriptor>,
        criteria: Criteria,
        timeout: Duration,
        max_retries: u32,
    ) {
        let timer = Timer::new();
        let mut backoff = ExponentialBackoff::new(RETRY_INITIAL_BACKOFF_MS, RETRY_MAX_BACKOFF_MS);

        loop {
            let result =
                match tokio::time::timeout(timeout, classifier.classify(request, batch.clone(), &criteria))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(CollaboratorError::Timeout(timeout)),
                };

            let Some(this) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(decisions) => {
                    timer.observe_duration(&this.metrics.classifier_latency);
                    this.on_decisions(request, decisions);
                    return;
                }
                Err(e)
                    if e.is_retryable()
                        && backoff.attempt() < max_retries
                        && this.pending.contains_key(&request) =>
                {
                    let delay = backoff.next_backoff();
                    warn!(
                        %request,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Classifier request failed, retrying"
                    );
                    drop(this);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    this.abandon_request(request, &e);
                    return;
                }
            }
        }
    }

    /// Forget a failed request so its fragments can be submitted again
    fn abandon_request(&self, request: RequestId, error: &CollaboratorError) {
        let Some((_, pending)) = self.pending.remove(&request) else {
            return;
        };
        {
            let mut index = self.index.lock();
            for fingerprint in pending.members.values().flatten() {
                index.remove_seen(*fingerprint);
            }
        }

        EngineTelemetry::incr(&self.telemetry.classifier_failures);
        self.metrics.classifier_failures.inc();
        self.events.collect(FilterEvent::ClassifierFailed {
            session: pending.session,
            request,
            error: error.to_string(),
            at: Instant::now(),
        });
        warn!(
            session = %pending.session,
            %request,
            error = %error,
            "Classifier request abandoned, instant decisions stand"
        );
    }

    /// Apply classifier decisions for `request`
    ///
    /// Decisions for a request that is unknown, belongs to a finished session,
    /// or was made under other criteria are discarded. Within a valid request,
    /// decisions for fragments that were not submitted or are gone are
    /// dropped. Allow terms override the classifier, deny terms override a
    /// keep. A filter verdict also hides shown fragments that are near
    /// duplicates. Returns the number of decisions applied.
    pub fn on_decisions(&self, request: RequestId, decisions: Vec<Decision>) -> usize {
        let Some((_, pending)) = self.pending.remove(&request) else {
            self.discard(request, decisions.len(), "unknown_request");
            return 0;
        };

        let active = self.criteria.load_full();
        if active.fingerprint != pending.criteria {
            self.discard(request, decisions.len(), "criteria_changed");
            return 0;
        }

        let mut inner = self.inner.lock();
        let Some(session) = Self::current_mut(&mut inner, pending.session) else {
            drop(inner);
            self.discard(request, decisions.len(), "stale_session");
            return 0;
        };

        let mut applied = 0;
        let mut rejected = 0;
        let mut filtered = Vec::new();

        for decision in decisions {
            let fragment = decision.fragment;
            let Some(&fingerprint) = pending.members.get(&fragment) else {
                rejected += 1;
                continue;
            };
            if !self.fragments.lock().contains(fragment) {
                rejected += 1;
                continue;
            }

            let text = self.document.extract_text(fragment).unwrap_or_default();
            let resolution = match active.matcher.evaluate(&text) {
                MatchOutcome::Allowed(term) => Resolution::new(
                    Verdict::Keep,
                    DecisionSource::Allowlist,
                    format!("allow:{}", term),
                    true,
                ),
                MatchOutcome::Denied(term) => Resolution::new(
                    Verdict::Filter,
                    DecisionSource::InstantMatch,
                    format!("deny:{}", term),
                    true,
                ),
                MatchOutcome::NoMatch => Resolution::new(
                    decision.verdict,
                    DecisionSource::Classifier,
                    decision.reason,
                    true,
                ),
            };

            let verdict = resolution.verdict;
            let reason = resolution.reason.clone();
            if self.apply_decision(session, fragment, fingerprint, active.fingerprint, resolution) {
                applied += 1;
                if let (Verdict::Filter, Some(fp)) = (verdict, fingerprint) {
                    filtered.push((fp, reason));
                }
            }
            self.queue.lock().remove(fragment);
        }

        let propagated = self.propagate_filters(session, &active, &filtered);
        drop(inner);

        if rejected > 0 {
            self.discard(request, rejected, "unknown_fragment");
        }
        self.observe_queue_depth(self.queue_len());
        info!(
            session = %pending.session,
            %request,
            applied,
            rejected,
            propagated,
            latency_ms = pending.submitted_at.elapsed().as_millis() as u64,
            "Classifier decisions applied"
        );
        applied
    }

    /// Hide shown near duplicates of freshly filtered content
    fn propagate_filters(
        &self,
        session: &mut Session,
        active: &ActiveCriteria,
        filtered: &[(Fingerprint, String)],
    ) -> usize {
        let mut propagated = 0;
        for (fp, reason) in filtered {
            let similar = self
                .fragments
                .lock()
                .shown_similar_to(*fp, self.config.hamming_threshold);
            for fragment in similar {
                let text = self.document.extract_text(fragment).unwrap_or_default();
                if matches!(active.matcher.evaluate(&text), MatchOutcome::Allowed(_)) {
                    continue;
                }
                let own = self
                    .fragments
                    .lock()
                    .get(fragment)
                    .and_then(|entry| entry.fingerprint);
                let resolution =
                    Resolution::new(Verdict::Filter, DecisionSource::Similarity, reason.clone(), true);
                if self.apply_decision(session, fragment, own, active.fingerprint, resolution) {
                    propagated += 1;
                }
            }
        }
        propagated
    }

    fn discard(&self, request: RequestId, count: usize, reason: &'static str) {
        EngineTelemetry::add(&self.telemetry.decisions_discarded, count as u64);
        self.metrics.decisions_discarded.inc_by(count as u64);
        self.events.collect(FilterEvent::DecisionsDiscarded {
            request,
            count,
            reason,
            at: Instant::now(),
        });
        debug!(%request, count, reason, "Classifier decisions discarded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{ChannelMutationSource, ScriptedClassifier, SimulatedDocument};

    const POST: &str = "local bakery opens a second shop near the old harbour market";

    fn build(
        document: &Arc<SimulatedDocument>,
        classifier: &Arc<ScriptedClassifier>,
    ) -> Arc<Orchestrator> {
        Orchestrator::builder(EngineConfig::default())
            .document(document.clone())
            .classifier(classifier.clone())
            .mutation_source(Arc::new(ChannelMutationSource::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_collaborators() {
        let result = Orchestrator::builder(EngineConfig::default())
            .document(Arc::new(SimulatedDocument::new(600.0)))
            .build();
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_start_without_runtime_is_configuration_error() {
        let document = Arc::new(SimulatedDocument::new(600.0));
        let classifier = Arc::new(ScriptedClassifier::new());
        let orchestrator = build(&document, &classifier);

        let result = orchestrator.start_session(SessionCause::Manual, Criteria::deny(["spoiler"]));
        assert!(matches!(result, Err(EngineError::Configuration(_))));
        assert!(!orchestrator.is_filtering_active());
    }

    #[tokio::test]
    async fn test_allow_term_beats_similarity() {
        let document = Arc::new(SimulatedDocument::new(600.0));
        let classifier = Arc::new(ScriptedClassifier::new().with_delay(Duration::from_secs(60)));
        let orchestrator = build(&document, &classifier);

        let first = document.add_fragment(format!("{} spoiler inside", POST), 0.0);
        let second = document.add_fragment(format!("{} spoiler inside recap", POST), 50.0);
        let third = document.add_fragment(format!("{} spoiler inside fanclub", POST), 100.0);

        let outcome = orchestrator
            .start_session(
                SessionCause::Manual,
                Criteria::new(["fanclub"], ["spoiler"]),
            )
            .unwrap();

        assert!(outcome.success);
        assert!(document.is_hidden(first));
        assert!(document.is_hidden(second));
        assert!(!document.is_hidden(third));
        assert_eq!(orchestrator.hidden_fragments(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_complete_session_is_idempotent() {
        let document = Arc::new(SimulatedDocument::new(600.0));
        let classifier = Arc::new(ScriptedClassifier::new());
        let orchestrator = build(&document, &classifier);
        document.add_fragment(POST, 0.0);

        let outcome = orchestrator
            .start_session(SessionCause::Manual, Criteria::deny(["spoiler"]))
            .unwrap();
        let id = outcome.session_id.unwrap();

        assert!(orchestrator.complete_session(id, CompletionReason::Stopped));
        assert!(!orchestrator.complete_session(id, CompletionReason::Stopped));
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
        assert!(!orchestrator.is_filtering_active());
        assert_eq!(orchestrator.history().len(), 1);
        assert_eq!(orchestrator.history()[0].reason, CompletionReason::Stopped);
    }

    #[tokio::test]
    async fn test_settled_session_is_handed_off() {
        let document = Arc::new(SimulatedDocument::new(600.0));
        let classifier = Arc::new(ScriptedClassifier::new());
        let orchestrator = build(&document, &classifier);
        document.add_fragment(POST, 0.0);

        // No criteria: nothing goes to the classifier, the session settles at once
        let first = orchestrator
            .start_session(SessionCause::Scroll, Criteria::default())
            .unwrap();
        let second = orchestrator
            .start_session(SessionCause::Mutation, Criteria::default())
            .unwrap();

        assert!(second.success);
        assert!(!second.deferred_to_existing);
        assert_eq!(second.handoff_from, first.session_id);
        assert_eq!(orchestrator.current_session(), second.session_id);
        assert_eq!(orchestrator.history()[0].reason, CompletionReason::Handoff);
        assert_eq!(orchestrator.telemetry().snapshot().handoffs, 1);
    }

    #[tokio::test]
    async fn test_unknown_request_is_discarded() {
        let document = Arc::new(SimulatedDocument::new(600.0));
        let classifier = Arc::new(ScriptedClassifier::new());
        let orchestrator = build(&document, &classifier);
        let fragment = document.add_fragment(POST, 0.0);

        let applied = orchestrator.on_decisions(RequestId(99), vec![Decision::filter(fragment, "x")]);
        assert_eq!(applied, 0);
        assert!(!document.is_hidden(fragment));
        assert_eq!(orchestrator.telemetry().snapshot().decisions_discarded, 1);
    }
}
