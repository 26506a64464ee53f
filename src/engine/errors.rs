//! Error types and retry policies for the filtering engine

use std::time::Duration;
use thiserror::Error;

use super::lock::LockError;
use super::session::SessionId;

/// Error classes the orchestrator distinguishes when deciding how loudly to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Another session is active; handled via handoff or defer
    Contention,
    /// Document or Classifier call failed; instant matching continues
    CollaboratorUnavailable,
    /// Lock subsystem failure; the only class that fails a start outright
    ResourceExhaustion,
    /// Session exceeded its maximum duration
    Timeout,
    /// Misuse of the API or invalid configuration
    Configuration,
}

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid configuration or a missing collaborator
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A collaborator call failed
    #[error("Collaborator '{collaborator}' unavailable: {source}")]
    Collaborator {
        collaborator: &'static str,
        #[source]
        source: CollaboratorError,
    },

    /// Lock subsystem error
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Session exceeded its maximum duration
    #[error("Session {0} timed out")]
    SessionTimeout(SessionId),

    /// Invalid criteria (e.g. a term set too large to compile)
    #[error("Invalid criteria: {0}")]
    InvalidCriteria(String),
}

impl EngineError {
    /// Map the error onto the engine's error taxonomy
    pub fn category(&self) -> ErrorClass {
        match self {
            Self::Configuration(_) | Self::InvalidCriteria(_) => ErrorClass::Configuration,
            Self::Collaborator { .. } => ErrorClass::CollaboratorUnavailable,
            Self::Lock(LockError::Contended { .. }) => ErrorClass::Contention,
            Self::Lock(_) => ErrorClass::ResourceExhaustion,
            Self::SessionTimeout(_) => ErrorClass::Timeout,
        }
    }

    /// Whether callers should ever see this error surfaced
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self.category(),
            ErrorClass::Configuration | ErrorClass::ResourceExhaustion
        )
    }

    pub fn missing_collaborator(name: &str) -> Self {
        Self::Configuration(format!("{} collaborator not configured", name))
    }

    pub fn document(source: CollaboratorError) -> Self {
        Self::Collaborator {
            collaborator: "document",
            source,
        }
    }

    pub fn classifier(source: CollaboratorError) -> Self {
        Self::Collaborator {
            collaborator: "classifier",
            source,
        }
    }
}

/// Failure reported by a collaborator implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Backend cannot be reached
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Backend refused the request
    #[error("rejected: {0}")]
    Rejected(String),
    /// Referenced fragment no longer exists
    #[error("fragment {0} is gone")]
    FragmentGone(u64),
    /// Call did not complete in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl CollaboratorError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Exponential backoff with jitter for retry logic
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current_attempt: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff strategy
    pub fn new(initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            current_attempt: 0,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Get the next backoff duration with ±20% jitter
    pub fn next_backoff(&mut self) -> Duration {
        let backoff_ms = self
            .initial_backoff_ms
            .saturating_mul(2_u64.saturating_pow(self.current_attempt))
            .min(self.max_backoff_ms);

        self.current_attempt = self.current_attempt.saturating_add(1);

        let jitter = backoff_ms / 5;
        if jitter == 0 {
            return Duration::from_millis(backoff_ms);
        }
        let offset = fastrand::u64(0..=2 * jitter);
        Duration::from_millis(backoff_ms - jitter + offset)
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = ExponentialBackoff::new(100, 5000);

        let delay1 = backoff.next_backoff();
        assert!(delay1.as_millis() >= 80 && delay1.as_millis() <= 120);

        let delay2 = backoff.next_backoff();
        assert!(delay2.as_millis() >= 160 && delay2.as_millis() <= 240);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let delay3 = backoff.next_backoff();
        assert!(delay3.as_millis() >= 80 && delay3.as_millis() <= 120);
    }

    #[test]
    fn test_backoff_max_limit() {
        let mut backoff = ExponentialBackoff::new(1000, 5000);
        for _ in 0..40 {
            let delay = backoff.next_backoff();
            assert!(delay.as_millis() <= 6000);
        }
    }

    #[test]
    fn test_tiny_backoff_has_no_jitter() {
        let mut backoff = ExponentialBackoff::new(2, 4);
        assert_eq!(backoff.next_backoff(), Duration::from_millis(2));
    }

    #[test]
    fn test_error_categories() {
        let err = EngineError::missing_collaborator("document");
        assert_eq!(err.category(), ErrorClass::Configuration);
        assert!(err.is_user_visible());

        let err = EngineError::classifier(CollaboratorError::Unavailable("down".into()));
        assert_eq!(err.category(), ErrorClass::CollaboratorUnavailable);
        assert!(!err.is_user_visible());

        let err = EngineError::from(LockError::Contended {
            name: "progressive_filtering".into(),
            holder: SessionId(3),
        });
        assert_eq!(err.category(), ErrorClass::Contention);
        assert!(!err.is_user_visible());

        let err = EngineError::from(LockError::Poisoned("progressive_filtering".into()));
        assert_eq!(err.category(), ErrorClass::ResourceExhaustion);
        assert!(err.is_user_visible());
    }

    #[test]
    fn test_retryable_collaborator_errors() {
        assert!(CollaboratorError::Unavailable("x".into()).is_retryable());
        assert!(CollaboratorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!CollaboratorError::Rejected("bad".into()).is_retryable());
        assert!(!CollaboratorError::FragmentGone(4).is_retryable());
    }
}
