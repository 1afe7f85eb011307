//! Request correlation gate.
//!
//! A uniform mapping from request id to the pending decision it represents,
//! used identically for permission requests, user questions, and
//! escalations. Three properties hold:
//!
//! - every request id is created by exactly one emitting event
//! - it is consumed by exactly one resolving event
//! - resolving an already-removed id is a safe no-op, never an error
//!
//! The gate is plain data owned by the orchestrator actor; all mutation
//! happens inside its event loop.

use std::collections::HashMap;

use log::warn;
use serde_json::Value;

/// What kind of decision a pending request is waiting on.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Permission {
        tool_name: String,
        tool_input: Value,
    },
    Question {
        questions: Value,
    },
    Escalation {
        escalation_type: String,
        summary: String,
        context: String,
        options: Vec<String>,
    },
}

/// One outstanding decision.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Session that emitted the request (and owns the blocked subprocess).
    pub session_id: String,
    pub kind: RequestKind,
}

/// Pending-request table keyed by request id.
#[derive(Debug, Default)]
pub struct CorrelationGate {
    pending: HashMap<String, PendingRequest>,
}

impl CorrelationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request. A colliding id is a worker bug; the
    /// original entry wins and the duplicate is dropped.
    pub fn insert(&mut self, request_id: &str, request: PendingRequest) {
        if self.pending.contains_key(request_id) {
            warn!("duplicate request id '{}', keeping original", request_id);
            return;
        }
        self.pending.insert(request_id.to_string(), request);
    }

    /// Consume a pending request. Returns `None` for unknown or
    /// already-resolved ids; callers treat that as a no-op.
    pub fn resolve(&mut self, request_id: &str) -> Option<PendingRequest> {
        self.pending.remove(request_id)
    }

    /// Look at a pending request without consuming it.
    pub fn get(&self, request_id: &str) -> Option<&PendingRequest> {
        self.pending.get(request_id)
    }

    /// Still-pending requests owned by one session (attach replay).
    pub fn pending_for_session(&self, session_id: &str) -> Vec<(String, PendingRequest)> {
        self.pending
            .iter()
            .filter(|(_, req)| req.session_id == session_id)
            .map(|(id, req)| (id.clone(), req.clone()))
            .collect()
    }

    /// Remove and return every request owned by one session. Cancellation
    /// must clear orphaned decisions rather than leak them.
    pub fn clear_session(&mut self, session_id: &str) -> Vec<(String, PendingRequest)> {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, req)| req.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|req| (id, req)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permission(session_id: &str) -> PendingRequest {
        PendingRequest {
            session_id: session_id.to_string(),
            kind: RequestKind::Permission {
                tool_name: "bash".to_string(),
                tool_input: serde_json::json!({"command": "ls"}),
            },
        }
    }

    #[test]
    fn test_resolve_consumes_exactly_once() {
        let mut gate = CorrelationGate::new();
        gate.insert("req-1", permission("ses_1"));

        assert!(gate.resolve("req-1").is_some());
        // Second resolve is a no-op, not an error.
        assert!(gate.resolve("req-1").is_none());
        // Unknown ids behave identically.
        assert!(gate.resolve("req-unknown").is_none());
    }

    #[test]
    fn test_duplicate_insert_keeps_original() {
        let mut gate = CorrelationGate::new();
        gate.insert("req-1", permission("ses_1"));
        gate.insert("req-1", permission("ses_2"));

        assert_eq!(gate.resolve("req-1").unwrap().session_id, "ses_1");
    }

    #[test]
    fn test_pending_for_session_filters_by_owner() {
        let mut gate = CorrelationGate::new();
        gate.insert("req-1", permission("ses_1"));
        gate.insert("req-2", permission("ses_2"));
        gate.insert("req-3", permission("ses_1"));

        let pending = gate.pending_for_session("ses_1");
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|(_, req)| req.session_id == "ses_1"));
    }

    #[test]
    fn test_clear_session_removes_all_owned() {
        let mut gate = CorrelationGate::new();
        gate.insert("req-1", permission("ses_1"));
        gate.insert("req-2", permission("ses_2"));
        gate.insert("req-3", permission("ses_1"));

        let cleared = gate.clear_session("ses_1");
        assert_eq!(cleared.len(), 2);
        assert_eq!(gate.len(), 1);
        assert!(gate.resolve("req-1").is_none());
        assert!(gate.resolve("req-2").is_some());
    }
}
