//! Orchestrator error taxonomy.
//!
//! Failures local to one session never take down the orchestrator or other
//! sessions: every variant here resolves into a client-facing `error` or
//! `session:*` event so the UI never silently stalls.

use thiserror::Error;

/// Errors surfaced by the orchestration engine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The worker subprocess could not launch. Surfaced as a session error,
    /// never retried silently.
    #[error("worker failed to start: {0}")]
    StartupFailure(String),

    /// A malformed line arrived from a subprocess. Logged and skipped; the
    /// stream continues.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    /// A spawn request violated the depth or concurrency caps. Returned to
    /// the requesting worker as a structured failure, never a crash.
    #[error("hierarchy limit exceeded: {0}")]
    HierarchyLimit(String),

    /// A resolve call referenced an unknown or already-resolved request id.
    /// Treated as a safe no-op wherever it occurs.
    #[error("resolution for unknown request '{0}'")]
    OrphanedResolution(String),

    /// An escalation hit its deadline without a resolver.
    #[error("escalation '{0}' timed out")]
    EscalationTimeout(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),
}
