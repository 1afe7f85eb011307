//! Client protocol types for UI connections.
//!
//! These types define the protocol between a UI client and the orchestrator
//! over a WebSocket connection. All session-scoped events are tagged with a
//! `session_id` so one connection can multiplex several sessions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Commands (client -> orchestrator)
// ============================================================================

/// Command sent by a UI client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Start a turn for a session. A session with a live worker must be
    /// cancelled first; querying it again is a caller bug.
    Query {
        session_id: String,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// Keep re-invoking the session until the completion heuristic says
        /// the task is done.
        #[serde(default)]
        until_done: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },

    /// Terminate the session's worker. No-op when nothing is running.
    Cancel { session_id: String },

    /// Alias of `cancel` kept for older clients.
    Abort { session_id: String },

    /// Bind this connection to a running session. Pending permission and
    /// question requests are replayed when the binding changes.
    Attach { session_id: String },

    /// Decision for a pending permission request.
    PermissionResponse {
        request_id: String,
        approved: bool,
        #[serde(default)]
        approve_all: bool,
    },

    /// Answers for a pending user question.
    QuestionResponse { request_id: String, answers: Value },

    /// Human decision for a pending escalation.
    EscalationResponse {
        request_id: String,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// Keepalive response to a server ping.
    Pong,
}

// ============================================================================
// Events (orchestrator -> client)
// ============================================================================

/// Event sent to a UI client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Connection established.
    Connected,

    /// Heartbeat/keepalive ping.
    Ping,

    /// Assistant content forwarded from the session's worker.
    Assistant { session_id: String, content: Value },

    /// User-attributed content forwarded from the session's worker.
    User { session_id: String, content: Value },

    /// Structured turn result forwarded from the session's worker.
    Result { session_id: String, data: Value },

    /// A tool use needs a decision.
    PermissionRequest {
        session_id: String,
        request_id: String,
        tool_name: String,
        tool_input: Value,
    },

    /// The worker has questions for the human.
    AskUserQuestion {
        session_id: String,
        request_id: String,
        questions: Value,
    },

    /// The turn finished.
    Done { session_id: String, result: Value },

    /// Something failed. `session_id` is absent for connection-level errors.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },

    /// A child session was created.
    #[serde(rename = "session:spawned")]
    SessionSpawned {
        session_id: String,
        parent_id: String,
        title: String,
        role: String,
    },

    /// A session changed status.
    #[serde(rename = "session:status_changed")]
    SessionStatusChanged { session_id: String, status: String },

    /// A session escalated and is blocked on a decision.
    #[serde(rename = "session:escalated")]
    SessionEscalated {
        session_id: String,
        request_id: String,
        escalation_type: String,
        summary: String,
        context: String,
        #[serde(default)]
        options: Vec<String>,
    },

    /// An escalation was resolved (by a human, the parent, or timeout).
    #[serde(rename = "session:escalation_resolved")]
    SessionEscalationResolved {
        session_id: String,
        request_id: String,
        action: String,
    },

    /// A child session delivered its final output.
    #[serde(rename = "session:delivered")]
    SessionDelivered {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        deliverable_type: String,
        summary: String,
    },

    /// Until-done mode decided the task is unfinished and will re-invoke.
    UntilDoneContinue {
        session_id: String,
        iteration: u32,
        max_iterations: u32,
        reason: String,
    },

    /// Until-done mode finished (task judged complete or cap reached).
    UntilDoneComplete {
        session_id: String,
        iterations: u32,
        total_cost_usd: f64,
        reason: String,
    },
}
