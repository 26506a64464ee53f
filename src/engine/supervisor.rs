//! Lifecycle supervisor for engine workers
//!
//! Two supervisors exist at runtime: one for the orchestrator-wide timers
//! (health check, cache sweep) and one per session for the batcher driver,
//! batch consumer, background worker and continuous-analysis ticker.
//!
//! Workers subscribe to the command channel and react to `Pause`, `Resume`
//! and `Stop`. Synchronous teardown paths (session completion, emergency stop)
//! cannot await, so they use [`Supervisor::abort_all`].

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Stopped = 0,
    Running = 1,
    Paused = 2,
    Stopping = 3,
    Error = 4,
}

impl From<u8> for WorkerState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Stopped,
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Stopping,
            _ => Self::Error,
        }
    }
}

/// Command broadcast to supervised workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    Start,
    Pause,
    Resume,
    Stop,
}

/// Worker registration information
pub struct WorkerHandle {
    pub name: String,
    pub handle: JoinHandle<()>,
    /// A panicking critical worker puts the supervisor into `Error`
    pub critical: bool,
}

impl WorkerHandle {
    pub fn new(name: impl Into<String>, handle: JoinHandle<()>, critical: bool) -> Self {
        Self {
            name: name.into(),
            handle,
            critical,
        }
    }
}

/// Tracks a group of tokio tasks sharing one lifecycle
pub struct Supervisor {
    label: String,
    state: Arc<AtomicU8>,
    command_tx: broadcast::Sender<SupervisorCommand>,
    workers: Mutex<Vec<WorkerHandle>>,
    error_count: AtomicU32,
}

impl Supervisor {
    pub fn new(label: impl Into<String>) -> Self {
        let (command_tx, _) = broadcast::channel(16);
        Self {
            label: label.into(),
            state: Arc::new(AtomicU8::new(WorkerState::Stopped as u8)),
            command_tx,
            workers: Mutex::new(Vec::new()),
            error_count: AtomicU32::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, new_state: WorkerState) {
        self.state.store(new_state as u8, Ordering::Release);
        debug!(supervisor = %self.label, state = ?new_state, "Supervisor state changed");
    }

    /// Register a spawned worker
    pub fn register_worker(&self, worker: WorkerHandle) {
        debug!(
            supervisor = %self.label,
            worker = %worker.name,
            critical = worker.critical,
            "Registering worker"
        );
        self.workers.lock().push(worker);
    }

    /// Mark the group running and notify subscribers
    pub fn start(&self) {
        if self.state() == WorkerState::Running {
            return;
        }
        self.set_state(WorkerState::Running);
        let _ = self.command_tx.send(SupervisorCommand::Start);
    }

    pub fn pause(&self) {
        if self.state() != WorkerState::Running {
            return;
        }
        info!(supervisor = %self.label, "Pausing workers");
        self.set_state(WorkerState::Paused);
        let _ = self.command_tx.send(SupervisorCommand::Pause);
    }

    pub fn resume(&self) {
        if self.state() != WorkerState::Paused {
            return;
        }
        info!(supervisor = %self.label, "Resuming workers");
        self.set_state(WorkerState::Running);
        let _ = self.command_tx.send(SupervisorCommand::Resume);
    }

    pub fn is_paused(&self) -> bool {
        self.state() == WorkerState::Paused
    }

    /// Stop all workers gracefully, aborting those that outlive `timeout`
    pub async fn stop(&self, timeout: Duration) {
        if self.state() == WorkerState::Stopped && self.worker_count() == 0 {
            return;
        }

        info!(supervisor = %self.label, ?timeout, "Stopping workers");
        self.set_state(WorkerState::Stopping);
        let _ = self.command_tx.send(SupervisorCommand::Stop);

        let deadline = tokio::time::Instant::now() + timeout;
        let workers: Vec<WorkerHandle> = self.workers.lock().drain(..).collect();

        for worker in workers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let abort = worker.handle.abort_handle();
            match tokio::time::timeout(remaining, worker.handle).await {
                Ok(Ok(())) => debug!(worker = %worker.name, "Worker stopped"),
                Ok(Err(e)) if e.is_cancelled() => debug!(worker = %worker.name, "Worker cancelled"),
                Ok(Err(e)) => self.record_failure(&worker.name, worker.critical, &e),
                Err(_) => {
                    warn!(worker = %worker.name, "Worker did not stop within timeout, aborting");
                    abort.abort();
                }
            }
        }

        if self.state() != WorkerState::Error {
            self.set_state(WorkerState::Stopped);
        }
    }

    /// Abort every worker without waiting
    ///
    /// No `Stop` is broadcast: aborted workers must not run their own
    /// teardown after the caller has already moved on. Returns the number of
    /// workers aborted.
    pub fn abort_all(&self) -> usize {
        let workers: Vec<WorkerHandle> = self.workers.lock().drain(..).collect();
        let count = workers.len();
        for worker in workers {
            worker.handle.abort();
        }
        self.set_state(WorkerState::Stopped);
        if count > 0 {
            debug!(supervisor = %self.label, count, "Aborted workers");
        }
        count
    }

    /// Drop handles of workers that already exited, logging panics
    pub fn reap_finished(&self) -> usize {
        let mut workers = self.workers.lock();
        let before = workers.len();
        let mut kept = Vec::with_capacity(before);
        let mut finished = Vec::new();
        for worker in workers.drain(..) {
            if worker.handle.is_finished() {
                finished.push(worker);
            } else {
                kept.push(worker);
            }
        }
        *workers = kept;
        drop(workers);

        for worker in &finished {
            if worker.critical {
                warn!(supervisor = %self.label, worker = %worker.name, "Critical worker exited");
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        finished.len()
    }

    fn record_failure(&self, name: &str, critical: bool, e: &tokio::task::JoinError) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        if critical {
            error!(worker = %name, error = ?e, "Critical worker panicked");
            self.set_state(WorkerState::Error);
        } else {
            warn!(worker = %name, error = ?e, "Worker panicked");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorCommand> {
        self.command_tx.subscribe()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.state(), WorkerState::Running | WorkerState::Paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_supervisor_state_transitions() {
        let supervisor = Supervisor::new("test");
        assert_eq!(supervisor.state(), WorkerState::Stopped);

        supervisor.start();
        assert_eq!(supervisor.state(), WorkerState::Running);

        supervisor.pause();
        assert!(supervisor.is_paused());

        supervisor.resume();
        assert_eq!(supervisor.state(), WorkerState::Running);

        supervisor.stop(Duration::from_secs(1)).await;
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_workers_observe_stop_command() {
        let supervisor = Supervisor::new("test");
        let mut commands = supervisor.subscribe();
        let handle = tokio::spawn(async move {
            while let Ok(cmd) = commands.recv().await {
                if cmd == SupervisorCommand::Stop {
                    break;
                }
            }
        });
        supervisor.register_worker(WorkerHandle::new("listener", handle, true));
        supervisor.start();

        supervisor.stop(Duration::from_secs(1)).await;
        assert_eq!(supervisor.worker_count(), 0);
        assert_eq!(supervisor.error_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_all_is_synchronous() {
        let supervisor = Supervisor::new("test");
        for i in 0..3 {
            let handle = tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });
            supervisor.register_worker(WorkerHandle::new(format!("sleeper_{}", i), handle, false));
        }
        supervisor.start();

        assert_eq!(supervisor.abort_all(), 3);
        assert_eq!(supervisor.worker_count(), 0);
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_stuck_worker() {
        let supervisor = Supervisor::new("test");
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        supervisor.register_worker(WorkerHandle::new("stuck", handle, false));
        supervisor.start();

        supervisor.stop(Duration::from_millis(50)).await;
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_state_conversion() {
        assert_eq!(WorkerState::from(0), WorkerState::Stopped);
        assert_eq!(WorkerState::from(2), WorkerState::Paused);
        assert_eq!(WorkerState::from(9), WorkerState::Error);
    }
}
