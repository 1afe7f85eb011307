//! Worker subprocess protocol types.
//!
//! Defines the request/response types exchanged between the orchestrator and
//! a worker subprocess. The protocol is JSON over the worker's stdin/stdout
//! with newline-delimited messages: the worker writes [`WorkerMessage`]s to
//! stdout, the orchestrator writes [`OrchestratorMessage`]s to stdin.
//!
//! Every `multi_session_*` request and every permission/question request
//! carries a `request_id` chosen by the worker. The orchestrator answers each
//! request with exactly one response message carrying the same id; the worker
//! blocks its tool call on that response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Worker -> orchestrator
// ============================================================================

/// Message emitted by a worker subprocess on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Conversation content produced during the turn.
    Message { payload: MessagePayload },

    /// The worker reports the backing-runtime session token. Sent once,
    /// early in the turn; the orchestrator stores it for later resume.
    InitAck { runtime_session_id: String },

    /// The worker wants to use a tool and needs a decision.
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_input: Value,
    },

    /// The worker has questions only a human can answer.
    AskUserQuestion { request_id: String, questions: Value },

    /// Request to spawn a child session.
    MultiSessionSpawn {
        request_id: String,
        title: String,
        role: String,
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Request for ambient context from an external resolver
    /// (project summary, a sibling's recent output, ...).
    MultiSessionGetContext {
        request_id: String,
        source: String,
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sibling_role: Option<String>,
    },

    /// The session is blocked and needs a decision from its parent or a
    /// human. The worker blocks on its stdin until the escalation resolves.
    MultiSessionEscalate {
        request_id: String,
        escalation_type: String,
        summary: String,
        context: String,
        #[serde(default)]
        options: Vec<String>,
    },

    /// A child session hands its final output to the hierarchy.
    MultiSessionDeliver {
        request_id: String,
        deliverable_type: String,
        summary: String,
        content: String,
        #[serde(default)]
        artifacts: Vec<String>,
    },

    /// Append a decision to the shared decision log.
    MultiSessionLogDecision {
        request_id: String,
        decision: String,
        category: String,
        rationale: String,
    },

    /// A parent session resolves an escalation raised by one of its
    /// children. `escalation_id` is the request id of the escalation being
    /// resolved; `request_id` correlates the ack for this verb itself.
    MultiSessionResolveEscalation {
        request_id: String,
        escalation_id: String,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// The turn finished. `last_assistant_content` is the final assistant
    /// content (a plain string or an array of content blocks).
    Complete {
        #[serde(default)]
        result_data: Value,
        #[serde(default)]
        last_assistant_content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_assistant_usage: Option<Usage>,
    },

    /// The turn failed inside the worker.
    Error { error: String },
}

/// Conversation content wrapped by [`WorkerMessage::Message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Assistant output (text and tool-call blocks).
    Assistant { content: Value },
    /// User-attributed content echoed by the runtime.
    User { content: Value },
    /// Structured turn result.
    Result { data: Value },
    /// Progress/heartbeat data, not persisted.
    Progress { data: Value },
}

/// Token and cost accounting for one assistant turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl Usage {
    /// Accumulate another turn's usage into this one.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }
}

// ============================================================================
// Orchestrator -> worker
// ============================================================================

/// Message written by the orchestrator to a worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorMessage {
    /// First message after spawn; carries the payloads too large for argv.
    Init {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multi_session_context: Option<AmbientContext>,
    },

    /// Decision for a pending permission request.
    PermissionResponse {
        request_id: String,
        approved: bool,
        #[serde(default)]
        approve_all: bool,
    },

    /// Answers for a pending user question.
    QuestionResponse { request_id: String, answers: Value },

    /// Outcome of a spawn request. `success: false` carries `error` and the
    /// worker must handle the missing child gracefully.
    MultiSessionSpawnResponse {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        child_session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Resolved context. On resolver failure `content` carries the error
    /// string; the worker continues with degraded context.
    MultiSessionContextResponse {
        request_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// Decision for a pending escalation.
    MultiSessionEscalationResponse {
        request_id: String,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// Ack for a deliver request.
    MultiSessionDeliverResponse { request_id: String, success: bool },

    /// Ack for a log-decision request.
    MultiSessionDecisionResponse {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        decision_id: Option<String>,
    },

    /// Ack for a parent-side escalation resolution.
    MultiSessionResolveResponse { request_id: String, success: bool },

    /// User-visible message injected into a running worker's conversation.
    /// Used to surface a child's deliverable (and escalation notices) in the
    /// parent's own context.
    FollowUp { content: String },
}

// ============================================================================
// Launch configuration
// ============================================================================

/// Tool-permission policy for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Every tool use raises a `permission_request`.
    Prompt,
    /// All tool permissions are granted up front. Child sessions run in this
    /// mode; they execute unattended.
    AutoGrant,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionMode::Prompt => write!(f, "prompt"),
            PermissionMode::AutoGrant => write!(f, "auto_grant"),
        }
    }
}

/// Ambient context seeded into a child session at spawn time.
///
/// Bootstraps the child with situational awareness without replaying the
/// parent's transcript: the parent's identity, who the siblings are, and the
/// most recent decisions taken anywhere under the shared root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AmbientContext {
    pub parent_title: String,
    pub parent_task: String,
    #[serde(default)]
    pub sibling_roles: Vec<String>,
    #[serde(default)]
    pub recent_decisions: Vec<ContextDecision>,
}

/// One decision-log entry as seen by a newly spawned child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDecision {
    pub decision: String,
    pub category: String,
    pub rationale: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_message_serialization() {
        let msg = WorkerMessage::PermissionRequest {
            request_id: "req-1".to_string(),
            tool_name: "bash".to_string(),
            tool_input: serde_json::json!({"command": "ls"}),
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("permission_request"));
        assert!(json.contains("req-1"));

        let parsed: WorkerMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            WorkerMessage::PermissionRequest {
                request_id,
                tool_name,
                ..
            } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(tool_name, "bash");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_spawn_request_optional_model() {
        let json = r#"{"type":"multi_session_spawn","request_id":"req-2","title":"Tests","role":"tester","task":"write tests"}"#;
        let parsed: WorkerMessage = serde_json::from_str(json).unwrap();
        match parsed {
            WorkerMessage::MultiSessionSpawn { model, role, .. } => {
                assert!(model.is_none());
                assert_eq!(role, "tester");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_complete_defaults() {
        let json = r#"{"type":"complete"}"#;
        let parsed: WorkerMessage = serde_json::from_str(json).unwrap();
        match parsed {
            WorkerMessage::Complete {
                result_data,
                last_assistant_content,
                last_assistant_usage,
            } => {
                assert!(result_data.is_null());
                assert!(last_assistant_content.is_null());
                assert!(last_assistant_usage.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_message_payload_roundtrip() {
        let msg = WorkerMessage::Message {
            payload: MessagePayload::Assistant {
                content: serde_json::json!([{"type": "text", "text": "hello"}]),
            },
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"assistant\""));

        let parsed: WorkerMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            WorkerMessage::Message {
                payload: MessagePayload::Assistant { .. }
            }
        ));
    }

    #[test]
    fn test_orchestrator_message_serialization() {
        let msg = OrchestratorMessage::MultiSessionSpawnResponse {
            request_id: "req-3".to_string(),
            success: false,
            child_session_id: None,
            error: Some("max depth exceeded".to_string()),
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("multi_session_spawn_response"));
        assert!(json.contains("max depth exceeded"));
        assert!(!json.contains("child_session_id"));
    }

    #[test]
    fn test_usage_accumulation() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 100,
            output_tokens: 20,
            cost_usd: 0.01,
        });
        total.add(&Usage {
            input_tokens: 50,
            output_tokens: 30,
            cost_usd: 0.02,
        });

        assert_eq!(total.input_tokens, 150);
        assert_eq!(total.output_tokens, 50);
        assert!((total.cost_usd - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_permission_mode_display() {
        assert_eq!(PermissionMode::Prompt.to_string(), "prompt");
        assert_eq!(PermissionMode::AutoGrant.to_string(), "auto_grant");
    }
}
