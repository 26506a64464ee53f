// Filtering engine components
pub mod config;         // EngineConfig, defaults, env/toml parsing
pub mod errors;         // EngineError, CollaboratorError, ExponentialBackoff
pub mod collaborators;  // Document / Classifier / MutationSource seams
pub mod content;        // UI-noise cleaning, validity, truncation
pub mod matcher;        // Criteria, criteria fingerprint, instant allow/deny matching
pub mod fingerprint;    // 64-bit similarity hash + bounded seen/decided index
pub mod cache;          // TTL analysis cache keyed by (fingerprint, criteria)
pub mod queue;          // Viewport / near-viewport / background work queue
pub mod batcher;        // Mutation throttling, burst extension, batch emission
pub mod lock;           // Named exclusive locks, the single-session guarantee
pub mod session;        // Session, lifecycle enums, history records
pub mod supervisor;     // Worker lifecycle, pause/resume/stop
pub mod telemetry;      // Atomic counters, JSON snapshot
pub mod dataflow;       // FilterEvent contract, EventCollector ring
pub mod fragments;      // Per-fragment side table and visibility transitions
pub mod orchestrator;   // Session lifecycle, processing, decision application

// Re-export commonly used types
pub use cache::{AnalysisCache, CacheKey, CacheStats, CachedDecision};
pub use collaborators::{
    AddedNode, Classifier, Decision, Document, FragmentDescriptor, FragmentRef, FragmentScope,
    MutationSource, RawChange, RequestId, ScrollPosition, Verdict,
};
pub use config::EngineConfig;
pub use dataflow::{DecisionSource, EventCollector, FilterEvent};
pub use errors::{CollaboratorError, EngineError, ErrorClass, ExponentialBackoff};
pub use fingerprint::{compute_fingerprint, Fingerprint, FingerprintIndex};
pub use lock::{LockError, LockRegistry, LockToken, FILTERING_LOCK};
pub use matcher::{Criteria, CriteriaFingerprint, InstantMatcher, MatchOutcome};
pub use orchestrator::{
    HealthReport, Orchestrator, OrchestratorBuilder, StartOutcome, ViewportReport,
};
pub use queue::{PriorityClass, PriorityHint, PriorityWorkQueue};
pub use session::{
    CompletionReason, OrchestratorState, SessionCause, SessionId, SessionRecord, SessionStatus,
};
pub use supervisor::{Supervisor, SupervisorCommand, WorkerHandle, WorkerState};
pub use telemetry::{EngineTelemetry, TelemetrySnapshot};
