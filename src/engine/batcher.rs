//! Adaptive debounce for raw document changes
//!
//! [`BatchState`] is the clock-free core: it is handed `now` explicitly, which
//! keeps the throttle/burst arithmetic unit-testable. [`MutationBatcher`] owns
//! the tokio driver that feeds it from a [`MutationSource`] and emits batches.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::collaborators::{FragmentRef, MutationSource, RawChange};
use super::config::EngineConfig;
use super::errors::CollaboratorError;
use super::supervisor::SupervisorCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherSettings {
    pub throttle: Duration,
    pub burst_threshold: Duration,
    pub max_buffer: usize,
    pub max_delay: Duration,
}

impl From<&EngineConfig> for BatcherSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            throttle: Duration::from_millis(config.mutation_throttle_ms),
            burst_threshold: Duration::from_millis(config.mutation_burst_threshold_ms),
            max_buffer: config.mutation_max_buffer,
            max_delay: Duration::from_millis(config.mutation_max_delay_ms),
        }
    }
}

/// Coalesced set of significant changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBatch {
    /// Added fragments, deduplicated, in arrival order
    pub added: Vec<FragmentRef>,
    pub removed: Vec<FragmentRef>,
    /// Significant raw changes folded into this batch
    pub change_count: usize,
    pub first_change_at: Instant,
    pub emitted_at: Instant,
}

/// Buffer plus debounce timer
#[derive(Debug)]
pub struct BatchState {
    settings: BatcherSettings,
    added: Vec<FragmentRef>,
    removed: Vec<FragmentRef>,
    seen_added: HashSet<FragmentRef>,
    seen_removed: HashSet<FragmentRef>,
    change_count: usize,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
    deadline: Option<Instant>,
    dropped: u64,
}

impl BatchState {
    pub fn new(settings: BatcherSettings) -> Self {
        Self {
            settings,
            added: Vec::new(),
            removed: Vec::new(),
            seen_added: HashSet::new(),
            seen_removed: HashSet::new(),
            change_count: 0,
            first_at: None,
            last_at: None,
            deadline: None,
            dropped: 0,
        }
    }

    /// Buffer `change` received at `now`
    ///
    /// Returns `false` when the change was insignificant and dropped.
    pub fn push(&mut self, change: RawChange, now: Instant) -> bool {
        if !change.is_significant() {
            self.dropped += 1;
            return false;
        }

        for node in change.added.iter().filter(|n| n.is_significant()) {
            if self.seen_added.insert(node.fragment) {
                self.added.push(node.fragment);
            }
        }
        for fragment in change.removed {
            if self.seen_removed.insert(fragment) {
                self.removed.push(fragment);
            }
        }
        self.change_count += 1;

        match (self.first_at, self.last_at, self.deadline) {
            (Some(first), Some(last), Some(deadline)) => {
                let is_burst = now.saturating_duration_since(last) < self.settings.burst_threshold;
                if is_burst && self.change_count < self.settings.max_buffer {
                    let extended = (now + self.settings.throttle).min(first + self.settings.max_delay);
                    self.deadline = Some(deadline.max(extended));
                }
            }
            _ => {
                self.first_at = Some(now);
                self.deadline = Some(now + self.settings.throttle);
            }
        }
        self.last_at = Some(now);
        true
    }

    /// When the buffered changes are due, `None` while empty
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Emit the buffered batch if its deadline has passed
    pub fn take_due(&mut self, now: Instant) -> Option<MutationBatch> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.flush(now),
            _ => None,
        }
    }

    /// Emit whatever is buffered regardless of the timer
    pub fn flush(&mut self, now: Instant) -> Option<MutationBatch> {
        let first_change_at = self.first_at?;
        let removed: HashSet<FragmentRef> = self.removed.iter().copied().collect();
        let added = std::mem::take(&mut self.added)
            .into_iter()
            .filter(|f| !removed.contains(f))
            .collect();
        let batch = MutationBatch {
            added,
            removed: std::mem::take(&mut self.removed),
            change_count: self.change_count,
            first_change_at,
            emitted_at: now,
        };
        self.reset_buffer();
        Some(batch)
    }

    fn reset_buffer(&mut self) {
        self.added.clear();
        self.removed.clear();
        self.seen_added.clear();
        self.seen_removed.clear();
        self.change_count = 0;
        self.first_at = None;
        self.last_at = None;
        self.deadline = None;
    }

    /// Cancel pending emission and drop the buffer
    pub fn clear(&mut self) {
        self.reset_buffer();
    }

    pub fn pending_changes(&self) -> usize {
        self.change_count
    }

    pub fn is_empty(&self) -> bool {
        self.change_count == 0
    }

    /// Insignificant changes dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

async fn recv_change(rx: &mut Option<mpsc::UnboundedReceiver<RawChange>>) -> Option<RawChange> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Tokio driver turning raw changes into batches
pub struct MutationBatcher;

impl MutationBatcher {
    /// Attach to `source` and spawn the driver on `runtime`
    ///
    /// Attachment happens before spawning so a failing source is reported to
    /// the caller. Supervisor commands drive the lifecycle: `Pause` detaches
    /// the source and holds emission, `Resume` reattaches, `Stop` drops the
    /// buffer and ends the task.
    pub fn spawn(
        runtime: &Handle,
        settings: BatcherSettings,
        source: Arc<dyn MutationSource>,
        out: mpsc::UnboundedSender<MutationBatch>,
        commands: broadcast::Receiver<SupervisorCommand>,
    ) -> Result<JoinHandle<()>, CollaboratorError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        source.attach(raw_tx)?;
        Ok(runtime.spawn(Self::run(settings, source, raw_rx, out, commands)))
    }

    async fn run(
        settings: BatcherSettings,
        source: Arc<dyn MutationSource>,
        raw_rx: mpsc::UnboundedReceiver<RawChange>,
        out: mpsc::UnboundedSender<MutationBatch>,
        mut commands: broadcast::Receiver<SupervisorCommand>,
    ) {
        let mut state = BatchState::new(settings);
        let mut raw_rx = Some(raw_rx);
        let mut paused = false;

        loop {
            let deadline = if paused { None } else { state.deadline() };

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Ok(SupervisorCommand::Pause) if !paused => {
                        paused = true;
                        source.detach();
                        raw_rx = None;
                        debug!(pending = state.pending_changes(), "Mutation batcher paused");
                    }
                    Ok(SupervisorCommand::Resume) if paused => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        match source.attach(tx) {
                            Ok(()) => raw_rx = Some(rx),
                            Err(e) => warn!(error = %e, "Mutation source reattach failed"),
                        }
                        paused = false;
                        debug!("Mutation batcher resumed");
                    }
                    Ok(SupervisorCommand::Stop) | Err(broadcast::error::RecvError::Closed) => {
                        state.clear();
                        source.detach();
                        break;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
                change = recv_change(&mut raw_rx) => match change {
                    Some(change) => {
                        state.push(change, Instant::now());
                    }
                    None => {
                        debug!("Mutation source closed its channel");
                        raw_rx = None;
                    }
                },
                _ = sleep_until_due(deadline) => {
                    if let Some(batch) = state.take_due(Instant::now()) {
                        debug!(
                            added = batch.added.len(),
                            removed = batch.removed.len(),
                            changes = batch.change_count,
                            "Emitting mutation batch"
                        );
                        if out.send(batch).is_err() {
                            source.detach();
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::collaborators::AddedNode;
    use parking_lot::Mutex;

    fn settings() -> BatcherSettings {
        BatcherSettings {
            throttle: Duration::from_millis(300),
            burst_threshold: Duration::from_millis(100),
            max_buffer: 50,
            max_delay: Duration::from_millis(2000),
        }
    }

    fn element(id: u64) -> RawChange {
        RawChange::added([AddedNode::element(FragmentRef(id), 2)])
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_insignificant_changes_are_dropped() {
        let t0 = Instant::now();
        let mut state = BatchState::new(settings());
        assert!(!state.push(RawChange::added([AddedNode::text(FragmentRef(1))]), t0));
        assert!(!state.push(RawChange::added([AddedNode::element(FragmentRef(2), 0)]), t0));
        assert!(state.is_empty());
        assert_eq!(state.deadline(), None);
        assert_eq!(state.dropped(), 2);
    }

    #[test]
    fn test_burst_coalesces_into_one_batch() {
        let t0 = Instant::now();
        let mut state = BatchState::new(settings());
        for i in 0..20u64 {
            state.push(element(i), t0 + ms(i * 10));
            assert!(state.take_due(t0 + ms(i * 10)).is_none());
        }
        assert_eq!(state.deadline(), Some(t0 + ms(190 + 300)));
        assert!(state.take_due(t0 + ms(489)).is_none());

        let batch = state.take_due(t0 + ms(490)).unwrap();
        assert_eq!(batch.change_count, 20);
        assert_eq!(batch.added.len(), 20);
        assert!(state.is_empty());
        assert!(state.take_due(t0 + ms(10_000)).is_none());
    }

    #[test]
    fn test_slow_changes_do_not_extend_the_window() {
        let t0 = Instant::now();
        let mut state = BatchState::new(settings());
        state.push(element(1), t0);
        state.push(element(2), t0 + ms(150));
        assert_eq!(state.deadline(), Some(t0 + ms(300)));
    }

    #[test]
    fn test_full_buffer_stops_extending() {
        let mut s = settings();
        s.max_buffer = 3;
        let t0 = Instant::now();
        let mut state = BatchState::new(s);
        state.push(element(1), t0);
        state.push(element(2), t0 + ms(10));
        assert_eq!(state.deadline(), Some(t0 + ms(310)));
        state.push(element(3), t0 + ms(20));
        assert_eq!(state.deadline(), Some(t0 + ms(310)));
    }

    #[test]
    fn test_extension_capped_by_max_delay() {
        let t0 = Instant::now();
        let mut state = BatchState::new(settings());
        for i in 0..45u64 {
            state.push(element(i), t0 + ms(i * 50));
        }
        assert_eq!(state.deadline(), Some(t0 + ms(2000)));
    }

    #[test]
    fn test_removed_fragments_win_over_added() {
        let t0 = Instant::now();
        let mut state = BatchState::new(settings());
        state.push(element(1), t0);
        state.push(element(2), t0);
        state.push(RawChange::removed([FragmentRef(1)]), t0);
        let batch = state.flush(t0).unwrap();
        assert_eq!(batch.added, vec![FragmentRef(2)]);
        assert_eq!(batch.removed, vec![FragmentRef(1)]);
    }

    #[test]
    fn test_clear_cancels_emission() {
        let t0 = Instant::now();
        let mut state = BatchState::new(settings());
        state.push(element(1), t0);
        state.clear();
        assert!(state.take_due(t0 + ms(1000)).is_none());
    }

    #[derive(Default)]
    struct TestSource {
        sink: Mutex<Option<mpsc::UnboundedSender<RawChange>>>,
    }

    impl TestSource {
        fn send(&self, change: RawChange) -> bool {
            match self.sink.lock().as_ref() {
                Some(tx) => tx.send(change).is_ok(),
                None => false,
            }
        }
    }

    impl MutationSource for TestSource {
        fn attach(&self, sink: mpsc::UnboundedSender<RawChange>) -> Result<(), CollaboratorError> {
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        fn detach(&self) {
            self.sink.lock().take();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_emits_single_batch_for_burst() {
        let source = Arc::new(TestSource::default());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = broadcast::channel(4);
        let handle = MutationBatcher::spawn(
            &Handle::current(),
            settings(),
            source.clone(),
            out_tx,
            cmd_rx,
        )
        .unwrap();

        for i in 0..20 {
            assert!(source.send(element(i)));
            tokio::time::sleep(ms(10)).await;
        }
        tokio::time::sleep(ms(1000)).await;

        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.change_count, 20);
        assert!(out_rx.try_recv().is_err());

        cmd_tx.send(SupervisorCommand::Stop).unwrap();
        handle.await.unwrap();
        assert!(!source.send(element(99)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_buffer_until_resume() {
        let source = Arc::new(TestSource::default());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = broadcast::channel(4);
        let _handle =
            MutationBatcher::spawn(&Handle::current(), settings(), source.clone(), out_tx, cmd_rx)
                .unwrap();

        source.send(element(1));
        tokio::time::sleep(ms(10)).await;
        cmd_tx.send(SupervisorCommand::Pause).unwrap();
        tokio::time::sleep(ms(1000)).await;
        assert!(out_rx.try_recv().is_err());
        assert!(!source.send(element(2)));

        cmd_tx.send(SupervisorCommand::Resume).unwrap();
        tokio::time::sleep(ms(10)).await;
        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.added, vec![FragmentRef(1)]);
    }
}
