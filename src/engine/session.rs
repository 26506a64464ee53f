//! Session model: identity, status, cause and completion bookkeeping

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::lock::LockToken;
use super::matcher::CriteriaFingerprint;

/// Identifier of one filtering run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Completing,
    Ended,
}

/// What triggered a filtering request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionCause {
    Scroll,
    Mutation,
    Manual,
}

impl SessionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scroll => "scroll",
            Self::Mutation => "mutation",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for SessionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionCause {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scroll" => Ok(Self::Scroll),
            "mutation" => Ok(Self::Mutation),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown session cause '{}'", other)),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// Explicit stop request
    Stopped,
    /// Replaced by a newer session
    Handoff,
    /// Exceeded the maximum session duration
    Timeout,
    /// Torn down by an emergency stop
    Emergency,
    /// Orchestrator shutdown
    Shutdown,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Handoff => "handoff",
            Self::Timeout => "timeout",
            Self::Emergency => "emergency",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator state machine
///
/// `Idle → Starting → Active → Completing → Idle`, with a handoff edge from
/// `Active` back to `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrchestratorState {
    Idle = 0,
    Starting = 1,
    Active = 2,
    Completing = 3,
}

impl From<u8> for OrchestratorState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Active,
            3 => Self::Completing,
            _ => Self::Idle,
        }
    }
}

/// Per-session processing counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub processed: u64,
    pub filtered: u64,
    pub kept: u64,
    pub classifier_requests: u64,
}

/// One filtering run, owned and mutated only by the orchestrator
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    pub cause: SessionCause,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub token: LockToken,
    pub criteria: CriteriaFingerprint,
    /// Correlates log lines of this session across tasks
    pub correlation_id: Uuid,
    /// Set while the start sequence (classifier dispatch, viewport pass) runs
    pub initializing: bool,
    pub counters: SessionCounters,
}

impl Session {
    pub fn new(
        id: SessionId,
        cause: SessionCause,
        token: LockToken,
        criteria: CriteriaFingerprint,
    ) -> Self {
        Self {
            id,
            status: SessionStatus::Pending,
            cause,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            token,
            criteria,
            correlation_id: Uuid::new_v4(),
            initializing: true,
            counters: SessionCounters::default(),
        }
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Close the session and produce its history record
    pub fn finish(&mut self, reason: CompletionReason) -> SessionRecord {
        self.status = SessionStatus::Ended;
        SessionRecord {
            id: self.id,
            cause: self.cause,
            reason,
            criteria: self.criteria,
            started_at: self.started_wall,
            duration_ms: self.age().as_millis() as u64,
            counters: self.counters,
        }
    }
}

/// Summary of a completed session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub cause: SessionCause,
    pub reason: CompletionReason,
    /// Criteria the session filtered under
    pub criteria: CriteriaFingerprint,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub counters: SessionCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_conversion() {
        assert_eq!(OrchestratorState::from(0), OrchestratorState::Idle);
        assert_eq!(OrchestratorState::from(2), OrchestratorState::Active);
        assert_eq!(OrchestratorState::from(3), OrchestratorState::Completing);
        assert_eq!(OrchestratorState::from(42), OrchestratorState::Idle);
    }

    #[test]
    fn test_cause_parsing() {
        assert_eq!("scroll".parse::<SessionCause>().unwrap(), SessionCause::Scroll);
        assert_eq!(" Manual ".parse::<SessionCause>().unwrap(), SessionCause::Manual);
        assert!("resize".parse::<SessionCause>().is_err());
        assert_eq!(SessionCause::Mutation.to_string(), "mutation");
    }

    #[test]
    fn test_finish_produces_record() {
        let token = LockToken::new("progressive_filtering", SessionId(7), 1);
        let mut session = Session::new(
            SessionId(7),
            SessionCause::Scroll,
            token,
            CriteriaFingerprint(99),
        );
        session.status = SessionStatus::Active;
        session.counters.filtered = 2;

        let record = session.finish(CompletionReason::Handoff);
        assert_eq!(session.status, SessionStatus::Ended);
        assert_eq!(record.id, SessionId(7));
        assert_eq!(record.reason, CompletionReason::Handoff);
        assert_eq!(record.counters.filtered, 2);
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        let json = serde_json::to_string(&CompletionReason::Handoff).unwrap();
        assert_eq!(json, "\"handoff\"");
    }
}
