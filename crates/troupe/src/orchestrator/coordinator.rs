//! Multi-session coordination verbs.
//!
//! Implements the worker-initiated hierarchy protocol: spawn, get-context,
//! escalate, deliver, log-decision, and the parent-side escalation
//! resolution. All methods run inside the orchestrator actor; hierarchy
//! violations come back to the requesting worker as structured failures,
//! never as crashes.

use chrono::Utc;
use log::{debug, info, warn};
use troupe_protocol::client::ClientEvent;
use troupe_protocol::worker::{
    AmbientContext, ContextDecision, OrchestratorMessage, PermissionMode,
};

use crate::error::OrchestratorError;
use crate::session::{DecisionLogEntry, Deliverable, Session, SessionStatus, StoredMessage};

use super::gate::{PendingRequest, RequestKind};
use super::{Orchestrator, OrchestratorEvent};

impl Orchestrator {
    // ========================================================================
    // Spawn
    // ========================================================================

    pub(super) async fn handle_spawn_request(
        &mut self,
        parent_id: &str,
        request_id: String,
        title: String,
        role: String,
        task: String,
        model: Option<String>,
    ) {
        let parent = match self.store.get(parent_id).await {
            Ok(Some(parent)) => parent,
            Ok(None) => {
                self.spawn_failure(parent_id, request_id, "unknown parent session".to_string())
                    .await;
                return;
            }
            Err(e) => {
                self.spawn_failure(parent_id, request_id, e.to_string()).await;
                return;
            }
        };

        // Hierarchy invariants: bounded depth, bounded live children.
        if parent.depth + 1 >= self.config.max_levels {
            let error = OrchestratorError::HierarchyLimit(format!(
                "maximum hierarchy depth reached ({} levels)",
                self.config.max_levels
            ));
            self.spawn_failure(parent_id, request_id, error.to_string())
                .await;
            return;
        }

        let children = self.store.children_of(parent_id).await.unwrap_or_default();
        let live_children = children
            .iter()
            .filter(|child| self.active.contains_key(&child.id))
            .count();
        if live_children >= self.config.max_children {
            let error = OrchestratorError::HierarchyLimit(format!(
                "concurrent child limit reached ({})",
                self.config.max_children
            ));
            self.spawn_failure(parent_id, request_id, error.to_string())
                .await;
            return;
        }

        let child = Session::child_of(&parent, title, role, task);
        if let Err(e) = self.store.create(child.clone()).await {
            self.spawn_failure(parent_id, request_id, e.to_string()).await;
            return;
        }

        // Seed the child with situational awareness: who the parent is, who
        // the siblings are, and the latest decisions under the shared root.
        let decisions = self
            .store
            .recent_decisions(&parent.root_id, 5)
            .await
            .unwrap_or_default();
        let context = AmbientContext {
            parent_title: parent.title.clone(),
            parent_task: parent.task.clone(),
            sibling_roles: children.iter().map(|c| c.role.clone()).collect(),
            recent_decisions: decisions
                .into_iter()
                .map(|d| ContextDecision {
                    decision: d.decision,
                    category: d.category,
                    rationale: d.rationale,
                })
                .collect(),
        };

        let (cwd, inherited_model, conn) = match self.active.get(parent_id) {
            Some(process) => (process.cwd.clone(), process.model.clone(), process.conn),
            None => (self.config.default_cwd.clone(), None, None),
        };
        let model = model.or(inherited_model);

        // Acknowledge before launching: the parent's tool call unblocks now,
        // the child process comes up right after.
        info!(
            "session {} spawned child {} (depth {})",
            parent_id, child.id, child.depth
        );
        self.send_to_worker(parent_id, OrchestratorMessage::MultiSessionSpawnResponse {
            request_id,
            success: true,
            child_session_id: Some(child.id.clone()),
            error: None,
        })
        .await;
        self.send_to_conn(conn, ClientEvent::SessionSpawned {
            session_id: child.id.clone(),
            parent_id: parent_id.to_string(),
            title: child.title.clone(),
            role: child.role.clone(),
        })
        .await;

        // Children execute unattended: permissions are auto-granted.
        let prompt = child.task.clone();
        if let Err(e) = self
            .start_worker(
                &child,
                prompt,
                cwd,
                model,
                PermissionMode::AutoGrant,
                Some(context),
                conn,
            )
            .await
        {
            warn!("child worker for {} failed to start: {}", child.id, e);
            self.set_status(&child.id, SessionStatus::Waiting).await;
            self.send_to_conn(conn, ClientEvent::Error {
                session_id: Some(child.id.clone()),
                message: OrchestratorError::StartupFailure(e.to_string()).to_string(),
            })
            .await;
        }
    }

    async fn spawn_failure(&mut self, parent_id: &str, request_id: String, error: String) {
        warn!("refusing spawn for session {}: {}", parent_id, error);
        self.send_to_worker(parent_id, OrchestratorMessage::MultiSessionSpawnResponse {
            request_id,
            success: false,
            child_session_id: None,
            error: Some(error),
        })
        .await;
    }

    // ========================================================================
    // Context
    // ========================================================================

    pub(super) async fn handle_get_context(
        &mut self,
        session_id: &str,
        request_id: String,
        source: String,
        query: String,
        sibling_role: Option<String>,
    ) {
        let resolved = self
            .resolver
            .resolve(&source, &query, sibling_role.as_deref())
            .await;
        // Resolver failure degrades to an error string in the content; the
        // worker keeps going.
        let (content, metadata) = match resolved {
            Ok(context) => (context.content, context.metadata),
            Err(e) => {
                debug!("context resolution failed for {}: {}", session_id, e);
                (format!("context resolution failed: {}", e), None)
            }
        };
        self.send_to_worker(session_id, OrchestratorMessage::MultiSessionContextResponse {
            request_id,
            content,
            metadata,
        })
        .await;
    }

    // ========================================================================
    // Escalation
    // ========================================================================

    pub(super) async fn handle_escalate(
        &mut self,
        session_id: &str,
        request_id: String,
        escalation_type: String,
        summary: String,
        context: String,
        options: Vec<String>,
    ) {
        info!(
            "session {} escalated ({}): {}",
            session_id, escalation_type, summary
        );
        self.gate.insert(&request_id, PendingRequest {
            session_id: session_id.to_string(),
            kind: RequestKind::Escalation {
                escalation_type: escalation_type.clone(),
                summary: summary.clone(),
                context: context.clone(),
                options: options.clone(),
            },
        });
        self.set_status(session_id, SessionStatus::Blocked).await;
        self.send_to_session(session_id, ClientEvent::SessionEscalated {
            session_id: session_id.to_string(),
            request_id: request_id.clone(),
            escalation_type: escalation_type.clone(),
            summary: summary.clone(),
            context: context.clone(),
            options: options.clone(),
        })
        .await;

        // Notify the parent worker when one is running; it can resolve with
        // multi_session_resolve_escalation.
        let parent_id = match self.store.get(session_id).await {
            Ok(Some(session)) => session.parent_id,
            _ => None,
        };
        if let Some(parent_id) = parent_id {
            let mut notice = format!(
                "A child session escalated ({}).\nSummary: {}\nContext: {}",
                escalation_type, summary, context
            );
            if !options.is_empty() {
                notice.push_str(&format!("\nOptions: {}", options.join(", ")));
            }
            notice.push_str(&format!(
                "\nResolve with multi_session_resolve_escalation, escalation_id \"{}\".",
                request_id
            ));
            self.send_to_worker(&parent_id, OrchestratorMessage::FollowUp { content: notice })
                .await;
        }

        // An unresolved escalation must not hang the session forever.
        if let Some(timeout) = self.config.escalation_timeout {
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx
                    .send(OrchestratorEvent::EscalationDeadline { request_id })
                    .await;
            });
        }
    }

    /// Resolve a pending escalation exactly once. Duplicate or unknown ids
    /// are a safe no-op. Returns whether anything was resolved.
    pub(super) async fn resolve_escalation(
        &mut self,
        request_id: &str,
        action: &str,
        content: Option<String>,
    ) -> bool {
        match self.gate.get(request_id) {
            Some(PendingRequest {
                kind: RequestKind::Escalation { .. },
                ..
            }) => {}
            Some(_) => {
                warn!("escalation response for non-escalation request '{}'", request_id);
                return false;
            }
            None => return false,
        }
        let Some(request) = self.gate.resolve(request_id) else {
            return false;
        };
        let session_id = request.session_id;

        info!("escalation '{}' resolved with action '{}'", request_id, action);
        self.send_to_worker(&session_id, OrchestratorMessage::MultiSessionEscalationResponse {
            request_id: request_id.to_string(),
            action: action.to_string(),
            content,
        })
        .await;
        self.set_status(&session_id, SessionStatus::Working).await;
        self.send_to_session(&session_id, ClientEvent::SessionEscalationResolved {
            session_id: session_id.clone(),
            request_id: request_id.to_string(),
            action: action.to_string(),
        })
        .await;
        true
    }

    /// Parent-side escalation resolution. Only the escalating session's
    /// parent may resolve it through this verb.
    pub(super) async fn handle_parent_resolve(
        &mut self,
        session_id: &str,
        request_id: String,
        escalation_id: String,
        action: String,
        content: Option<String>,
    ) {
        let owner = match self.gate.get(&escalation_id) {
            Some(PendingRequest {
                session_id: owner,
                kind: RequestKind::Escalation { .. },
            }) => Some(owner.clone()),
            _ => None,
        };
        let allowed = match owner {
            Some(owner) => match self.store.get(&owner).await {
                Ok(Some(session)) => session.parent_id.as_deref() == Some(session_id),
                _ => false,
            },
            None => false,
        };

        let success = if allowed {
            self.resolve_escalation(&escalation_id, &action, content)
                .await
        } else {
            debug!(
                "session {} may not resolve escalation '{}'",
                session_id, escalation_id
            );
            false
        };
        self.send_to_worker(session_id, OrchestratorMessage::MultiSessionResolveResponse {
            request_id,
            success,
        })
        .await;
    }

    // ========================================================================
    // Deliver
    // ========================================================================

    pub(super) async fn handle_deliver(
        &mut self,
        session_id: &str,
        request_id: String,
        deliverable_type: String,
        summary: String,
        content: String,
        artifacts: Vec<String>,
    ) {
        let now = Utc::now();
        let recorded = self
            .store
            .record_deliverable(Deliverable {
                session_id: session_id.to_string(),
                deliverable_type: deliverable_type.clone(),
                summary: summary.clone(),
                content: content.clone(),
                artifacts,
                created_at: now,
            })
            .await;
        if let Err(e) = recorded {
            warn!("failed to record deliverable for {}: {}", session_id, e);
            self.send_to_worker(session_id, OrchestratorMessage::MultiSessionDeliverResponse {
                request_id,
                success: false,
            })
            .await;
            return;
        }

        self.set_status(session_id, SessionStatus::Delivered).await;

        let session = self.store.get(session_id).await.ok().flatten();
        let role = session
            .as_ref()
            .map(|s| s.role.clone())
            .unwrap_or_else(|| "child".to_string());
        let parent_id = session.and_then(|s| s.parent_id);

        // This is the one place content crosses a session boundary outside
        // of spawn-time seeding: one synthetic message in the parent's
        // conversation, one follow-up on the parent's stdin.
        if let Some(ref parent_id) = parent_id {
            let text = format!(
                "The \"{}\" session delivered its {}: {}\n\n{}",
                role, deliverable_type, summary, content
            );
            let message = StoredMessage {
                id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
                session_id: parent_id.clone(),
                role: "assistant".to_string(),
                content: serde_json::json!([{ "type": "text", "text": text }]),
                created_at: now,
            };
            if let Err(e) = self.store.append_message(message).await {
                warn!("failed to append deliverable message to {}: {}", parent_id, e);
            }
            self.send_to_worker(parent_id, OrchestratorMessage::FollowUp { content: text })
                .await;
        }

        self.send_to_worker(session_id, OrchestratorMessage::MultiSessionDeliverResponse {
            request_id,
            success: true,
        })
        .await;
        self.send_to_session(session_id, ClientEvent::SessionDelivered {
            session_id: session_id.to_string(),
            parent_id,
            deliverable_type,
            summary,
        })
        .await;
    }

    // ========================================================================
    // Decision log
    // ========================================================================

    pub(super) async fn handle_log_decision(
        &mut self,
        session_id: &str,
        request_id: String,
        decision: String,
        category: String,
        rationale: String,
    ) {
        let root_id = match self.store.get(session_id).await {
            Ok(Some(session)) => session.root_id,
            _ => {
                self.send_to_worker(
                    session_id,
                    OrchestratorMessage::MultiSessionDecisionResponse {
                        request_id,
                        success: false,
                        decision_id: None,
                    },
                )
                .await;
                return;
            }
        };

        let entry = DecisionLogEntry {
            id: format!("dec_{}", uuid::Uuid::new_v4().simple()),
            root_id,
            decision,
            category,
            rationale,
            created_at: Utc::now(),
        };
        let response = match self.store.log_decision(entry).await {
            Ok(decision_id) => OrchestratorMessage::MultiSessionDecisionResponse {
                request_id,
                success: true,
                decision_id: Some(decision_id),
            },
            Err(e) => {
                warn!("failed to log decision for {}: {}", session_id, e);
                OrchestratorMessage::MultiSessionDecisionResponse {
                    request_id,
                    success: false,
                    decision_id: None,
                }
            }
        };
        self.send_to_worker(session_id, response).await;
    }
}
