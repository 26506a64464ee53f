//! Progressive Filter - content filtering engine library
//!
//! Hides unwanted text fragments from a scrolling document, visible ones
//! first. Fragments are judged instantly from allow/deny terms and known near
//! duplicates, then refined by an asynchronous batch classifier.

pub mod config;
pub mod engine;
pub mod metrics;
pub mod simulation;

// Re-export commonly used types
pub use config::AppConfig;
pub use engine::{
    Classifier, Criteria, Document, EngineConfig, EngineError, MutationSource, Orchestrator,
    OrchestratorBuilder, SessionCause, StartOutcome,
};
