//! The orchestration engine.
//!
//! A single actor task owns every piece of mutable orchestration state: the
//! ActiveProcess table, the correlation gate, until-done loop state, and the
//! session-to-connection bindings. Everything else (WebSocket handlers,
//! worker reader tasks, timers) communicates with it exclusively through
//! message passing, so no state is ever mutated from two tasks.
//!
//! True parallelism comes from the worker subprocesses themselves; the actor
//! only reacts to their output and to client commands.

pub mod context;
pub mod continuation;
pub mod coordinator;
pub mod gate;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use troupe_protocol::client::{ClientCommand, ClientEvent};
use troupe_protocol::worker::{
    AmbientContext, MessagePayload, OrchestratorMessage, PermissionMode, WorkerMessage,
};

use crate::config::AppConfig;
use crate::error::OrchestratorError;
use crate::session::{Session, SessionStatus, SessionStore, StoredQuestion};
use crate::supervisor::{SpawnError, WorkerEvent, WorkerHandle, WorkerLaunch, WorkerSpawner};
use crate::ws::WsHub;
use context::ContextResolver;
use continuation::{
    CONTINUATION_PROMPT, CompletionHeuristic, ContinuationState, TurnOutcome, Verdict,
    extract_todos, flatten_text,
};
use gate::{CorrelationGate, PendingRequest, RequestKind};

pub use crate::ws::ConnectionId;

/// Buffer size for the actor's inbound channels.
const EVENT_BUFFER_SIZE: usize = 256;

/// Event consumed by the orchestrator actor.
#[derive(Debug)]
pub enum OrchestratorEvent {
    /// A client sent a command.
    Command {
        conn: ConnectionId,
        command: ClientCommand,
    },
    /// A client connection closed. Never kills subprocesses.
    ConnectionClosed { conn: ConnectionId },
    /// Delayed until-done re-invocation for a session.
    ContinueUntilDone { session_id: String },
    /// An escalation hit its deadline.
    EscalationDeadline { request_id: String },
    /// Stop the orchestrator, killing all workers.
    Shutdown,
}

/// Cloneable handle for feeding events to the actor.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorEvent>,
}

impl OrchestratorHandle {
    pub async fn send(&self, event: OrchestratorEvent) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("orchestrator is not running"))
    }
}

/// Orchestration limits and timings, extracted from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum hierarchy levels including the root.
    pub max_levels: u32,
    /// Maximum live children per session.
    pub max_children: usize,
    /// Default until-done iteration cap.
    pub default_max_iterations: u32,
    /// Delay before an until-done re-invocation.
    pub continue_delay: Duration,
    /// Escalation deadline; `None` disables it.
    pub escalation_timeout: Option<Duration>,
    /// Working directory for sessions that do not specify one.
    pub default_cwd: PathBuf,
}

impl OrchestratorConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            max_levels: config.hierarchy.max_levels,
            max_children: config.hierarchy.max_children,
            default_max_iterations: config.until_done.max_iterations,
            continue_delay: Duration::from_millis(config.until_done.continue_delay_ms),
            escalation_timeout: match config.escalation.timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            default_cwd: config.worker.default_cwd.clone(),
        }
    }
}

/// Live binding of a session to its worker and client connection.
struct ActiveProcess {
    worker: WorkerHandle,
    /// Nulled (not removed) on client disconnect so a later attach can
    /// rebind to the still-running subprocess.
    conn: Option<ConnectionId>,
    /// Working directory, inherited by spawned children.
    cwd: PathBuf,
    /// Model override, inherited by spawned children.
    model: Option<String>,
}

/// Until-done bookkeeping for one session.
struct UntilDone {
    state: ContinuationState,
    /// Connection to notify about loop progress. Survives ActiveProcess
    /// teardown between iterations.
    conn: Option<ConnectionId>,
    cwd: PathBuf,
    model: Option<String>,
}

/// The orchestrator actor. Construct with [`Orchestrator::new`], then drive
/// with [`Orchestrator::run`] on its own task.
pub struct Orchestrator {
    config: OrchestratorConfig,
    spawner: Arc<dyn WorkerSpawner>,
    store: Arc<dyn SessionStore>,
    resolver: Arc<dyn ContextResolver>,
    heuristic: Box<dyn CompletionHeuristic>,
    hub: Arc<WsHub>,

    event_rx: mpsc::Receiver<OrchestratorEvent>,
    event_tx: mpsc::Sender<OrchestratorEvent>,
    worker_rx: mpsc::Receiver<(String, WorkerEvent)>,
    worker_tx: mpsc::Sender<(String, WorkerEvent)>,

    active: HashMap<String, ActiveProcess>,
    gate: CorrelationGate,
    continuations: HashMap<String, UntilDone>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        spawner: Arc<dyn WorkerSpawner>,
        store: Arc<dyn SessionStore>,
        resolver: Arc<dyn ContextResolver>,
        heuristic: Box<dyn CompletionHeuristic>,
        hub: Arc<WsHub>,
    ) -> (Self, OrchestratorHandle) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (worker_tx, worker_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let handle = OrchestratorHandle {
            tx: event_tx.clone(),
        };
        let orchestrator = Self {
            config,
            spawner,
            store,
            resolver,
            heuristic,
            hub,
            event_rx,
            event_tx,
            worker_rx,
            worker_tx,
            active: HashMap::new(),
            gate: CorrelationGate::new(),
            continuations: HashMap::new(),
        };
        (orchestrator, handle)
    }

    /// Run the event loop until shutdown.
    pub async fn run(mut self) {
        info!("orchestrator started");
        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    if matches!(event, OrchestratorEvent::Shutdown) {
                        break;
                    }
                    self.handle_event(event).await;
                }
                Some((session_id, event)) = self.worker_rx.recv() => {
                    self.handle_worker_event(session_id, event).await;
                }
                else => break,
            }
        }

        info!("orchestrator stopping, killing {} worker(s)", self.active.len());
        for (session_id, process) in self.active.drain() {
            debug!("killing worker for session {}", session_id);
            process.worker.kill();
        }
    }

    // ========================================================================
    // Client-side events
    // ========================================================================

    async fn handle_event(&mut self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::ConnectionClosed { conn } => {
                // Subprocesses keep running; only the binding is cleared so a
                // later attach can pick the session back up.
                for process in self.active.values_mut() {
                    if process.conn == Some(conn) {
                        process.conn = None;
                    }
                }
                for until_done in self.continuations.values_mut() {
                    if until_done.conn == Some(conn) {
                        until_done.conn = None;
                    }
                }
            }
            OrchestratorEvent::Command { conn, command } => {
                self.handle_command(conn, command).await;
            }
            OrchestratorEvent::ContinueUntilDone { session_id } => {
                self.continue_until_done(&session_id).await;
            }
            OrchestratorEvent::EscalationDeadline { request_id } => {
                if matches!(
                    self.gate.get(&request_id),
                    Some(PendingRequest {
                        kind: RequestKind::Escalation { .. },
                        ..
                    })
                ) {
                    warn!("{}", OrchestratorError::EscalationTimeout(request_id.clone()));
                    self.resolve_escalation(&request_id, "timeout", None).await;
                }
            }
            OrchestratorEvent::Shutdown => unreachable!("handled in run"),
        }
    }

    async fn handle_command(&mut self, conn: ConnectionId, command: ClientCommand) {
        match command {
            ClientCommand::Query {
                session_id,
                prompt,
                cwd,
                model,
                until_done,
                max_iterations,
            } => {
                self.handle_query(
                    conn,
                    session_id,
                    prompt,
                    cwd,
                    model,
                    until_done,
                    max_iterations,
                )
                .await;
            }
            ClientCommand::Cancel { session_id } | ClientCommand::Abort { session_id } => {
                self.handle_cancel(conn, &session_id).await;
            }
            ClientCommand::Attach { session_id } => {
                self.handle_attach(conn, &session_id).await;
            }
            ClientCommand::PermissionResponse {
                request_id,
                approved,
                approve_all,
            } => {
                self.handle_permission_response(&request_id, approved, approve_all)
                    .await;
            }
            ClientCommand::QuestionResponse {
                request_id,
                answers,
            } => {
                self.handle_question_response(&request_id, answers).await;
            }
            ClientCommand::EscalationResponse {
                request_id,
                action,
                content,
            } => {
                self.resolve_escalation(&request_id, &action, content).await;
            }
            ClientCommand::Pong => {}
        }
    }

    async fn handle_query(
        &mut self,
        conn: ConnectionId,
        session_id: String,
        prompt: String,
        cwd: Option<String>,
        model: Option<String>,
        until_done: bool,
        max_iterations: Option<u32>,
    ) {
        // Callers must cancel a running turn before querying again.
        if self.active.contains_key(&session_id) {
            self.send_to_conn(
                Some(conn),
                ClientEvent::Error {
                    session_id: Some(session_id.clone()),
                    message: "session already has an active worker; cancel it first".to_string(),
                },
            )
            .await;
            return;
        }

        let session = match self.get_or_create_session(&session_id, &prompt).await {
            Ok(session) => session,
            Err(e) => {
                self.send_to_conn(
                    Some(conn),
                    ClientEvent::Error {
                        session_id: Some(session_id),
                        message: e.to_string(),
                    },
                )
                .await;
                return;
            }
        };

        let cwd = cwd
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.default_cwd.clone());

        if until_done {
            let cap = max_iterations.unwrap_or(self.config.default_max_iterations);
            self.continuations.insert(
                session_id.clone(),
                UntilDone {
                    state: ContinuationState::new(prompt.clone(), cap),
                    conn: Some(conn),
                    cwd: cwd.clone(),
                    model: model.clone(),
                },
            );
        }

        if let Err(e) = self
            .start_worker(
                &session,
                prompt,
                cwd,
                model,
                PermissionMode::Prompt,
                None,
                Some(conn),
            )
            .await
        {
            self.continuations.remove(&session_id);
            self.send_to_conn(
                Some(conn),
                ClientEvent::Error {
                    session_id: Some(session_id),
                    message: OrchestratorError::StartupFailure(e.to_string()).to_string(),
                },
            )
            .await;
        }
    }

    async fn handle_cancel(&mut self, conn: ConnectionId, session_id: &str) {
        if let Some(process) = self.active.remove(session_id) {
            info!("cancelling worker for session {}", session_id);
            process.worker.kill();
        }

        // Pending decisions for a cancelled session are orphaned; clear them
        // instead of leaking them.
        for (request_id, request) in self.gate.clear_session(session_id) {
            if matches!(request.kind, RequestKind::Question { .. }) {
                self.store_remove_question(&request_id);
            }
        }

        self.continuations.remove(session_id);
        self.set_status(session_id, SessionStatus::Waiting).await;

        // Acknowledge even when nothing was running: cancel is idempotent.
        self.send_to_conn(
            Some(conn),
            ClientEvent::SessionStatusChanged {
                session_id: session_id.to_string(),
                status: SessionStatus::Waiting.to_string(),
            },
        )
        .await;
    }

    async fn handle_attach(&mut self, conn: ConnectionId, session_id: &str) {
        let changed = match self.active.get_mut(session_id) {
            // The session is not running; nothing to bind to.
            None => {
                debug!("attach to non-running session {} ignored", session_id);
                return;
            }
            Some(process) if process.conn == Some(conn) => false,
            Some(process) => {
                process.conn = Some(conn);
                true
            }
        };
        if !changed {
            return;
        }
        if let Some(until_done) = self.continuations.get_mut(session_id) {
            until_done.conn = Some(conn);
        }

        // A reconnecting client must see every outstanding decision.
        for (request_id, request) in self.gate.pending_for_session(session_id) {
            let event = match request.kind {
                RequestKind::Permission {
                    tool_name,
                    tool_input,
                } => ClientEvent::PermissionRequest {
                    session_id: session_id.to_string(),
                    request_id,
                    tool_name,
                    tool_input,
                },
                RequestKind::Question { questions } => ClientEvent::AskUserQuestion {
                    session_id: session_id.to_string(),
                    request_id,
                    questions,
                },
                RequestKind::Escalation {
                    escalation_type,
                    summary,
                    context,
                    options,
                } => ClientEvent::SessionEscalated {
                    session_id: session_id.to_string(),
                    request_id,
                    escalation_type,
                    summary,
                    context,
                    options,
                },
            };
            self.send_to_conn(Some(conn), event).await;
        }
    }

    async fn handle_permission_response(
        &mut self,
        request_id: &str,
        approved: bool,
        approve_all: bool,
    ) {
        match self.gate.get(request_id) {
            Some(PendingRequest {
                kind: RequestKind::Permission { .. },
                ..
            }) => {}
            Some(_) => {
                warn!("permission response for non-permission request '{}'", request_id);
                return;
            }
            // Already resolved, expired, or unknown: drop without error.
            None => {
                debug!("{}", OrchestratorError::OrphanedResolution(request_id.to_string()));
                return;
            }
        }

        let Some(request) = self.gate.resolve(request_id) else {
            return;
        };
        self.send_to_worker(
            &request.session_id,
            OrchestratorMessage::PermissionResponse {
                request_id: request_id.to_string(),
                approved,
                approve_all,
            },
        )
        .await;
    }

    async fn handle_question_response(&mut self, request_id: &str, answers: Value) {
        match self.gate.get(request_id) {
            Some(PendingRequest {
                kind: RequestKind::Question { .. },
                ..
            }) => {}
            Some(_) => {
                warn!("question response for non-question request '{}'", request_id);
                return;
            }
            None => {
                debug!("{}", OrchestratorError::OrphanedResolution(request_id.to_string()));
                return;
            }
        }

        let Some(request) = self.gate.resolve(request_id) else {
            return;
        };
        self.store_remove_question(request_id);
        self.send_to_worker(
            &request.session_id,
            OrchestratorMessage::QuestionResponse {
                request_id: request_id.to_string(),
                answers,
            },
        )
        .await;
    }

    // ========================================================================
    // Worker-side events
    // ========================================================================

    async fn handle_worker_event(&mut self, session_id: String, event: WorkerEvent) {
        match event {
            WorkerEvent::Message(message) => {
                self.handle_worker_message(&session_id, message).await;
            }
            WorkerEvent::Exited { code } => {
                // Normal teardown paths (complete, cancel) have already
                // removed the entry; anything else is a crash.
                if let Some(process) = self.active.remove(&session_id) {
                    warn!("worker for session {} exited unexpectedly ({:?})", session_id, code);
                    self.set_status(&session_id, SessionStatus::Waiting).await;
                    let message = match code {
                        Some(code) => format!("worker exited unexpectedly with code {}", code),
                        None => "worker terminated by signal".to_string(),
                    };
                    self.send_to_conn(process.conn, ClientEvent::Error {
                        session_id: Some(session_id.clone()),
                        message,
                    })
                    .await;
                } else {
                    debug!("worker for session {} exited ({:?})", session_id, code);
                }
            }
        }
    }

    async fn handle_worker_message(&mut self, session_id: &str, message: WorkerMessage) {
        match message {
            WorkerMessage::Message { payload } => {
                self.forward_payload(session_id, payload).await;
            }
            WorkerMessage::InitAck { runtime_session_id } => {
                self.store_runtime_session(session_id, runtime_session_id);
            }
            WorkerMessage::PermissionRequest {
                request_id,
                tool_name,
                tool_input,
            } => {
                self.gate.insert(
                    &request_id,
                    PendingRequest {
                        session_id: session_id.to_string(),
                        kind: RequestKind::Permission {
                            tool_name: tool_name.clone(),
                            tool_input: tool_input.clone(),
                        },
                    },
                );
                self.send_to_session(session_id, ClientEvent::PermissionRequest {
                    session_id: session_id.to_string(),
                    request_id,
                    tool_name,
                    tool_input,
                })
                .await;
            }
            WorkerMessage::AskUserQuestion {
                request_id,
                questions,
            } => {
                self.gate.insert(
                    &request_id,
                    PendingRequest {
                        session_id: session_id.to_string(),
                        kind: RequestKind::Question {
                            questions: questions.clone(),
                        },
                    },
                );
                // Questions survive a client restart; persist them.
                let store = Arc::clone(&self.store);
                let question = StoredQuestion {
                    request_id: request_id.clone(),
                    session_id: session_id.to_string(),
                    questions: questions.clone(),
                    created_at: chrono::Utc::now(),
                };
                tokio::spawn(async move {
                    if let Err(e) = store.save_question(question).await {
                        warn!("failed to persist question: {}", e);
                    }
                });
                self.send_to_session(session_id, ClientEvent::AskUserQuestion {
                    session_id: session_id.to_string(),
                    request_id,
                    questions,
                })
                .await;
            }
            WorkerMessage::MultiSessionSpawn {
                request_id,
                title,
                role,
                task,
                model,
            } => {
                self.handle_spawn_request(session_id, request_id, title, role, task, model)
                    .await;
            }
            WorkerMessage::MultiSessionGetContext {
                request_id,
                source,
                query,
                sibling_role,
            } => {
                self.handle_get_context(session_id, request_id, source, query, sibling_role)
                    .await;
            }
            WorkerMessage::MultiSessionEscalate {
                request_id,
                escalation_type,
                summary,
                context,
                options,
            } => {
                self.handle_escalate(
                    session_id,
                    request_id,
                    escalation_type,
                    summary,
                    context,
                    options,
                )
                .await;
            }
            WorkerMessage::MultiSessionDeliver {
                request_id,
                deliverable_type,
                summary,
                content,
                artifacts,
            } => {
                self.handle_deliver(
                    session_id,
                    request_id,
                    deliverable_type,
                    summary,
                    content,
                    artifacts,
                )
                .await;
            }
            WorkerMessage::MultiSessionLogDecision {
                request_id,
                decision,
                category,
                rationale,
            } => {
                self.handle_log_decision(session_id, request_id, decision, category, rationale)
                    .await;
            }
            WorkerMessage::MultiSessionResolveEscalation {
                request_id,
                escalation_id,
                action,
                content,
            } => {
                self.handle_parent_resolve(session_id, request_id, escalation_id, action, content)
                    .await;
            }
            WorkerMessage::Complete {
                result_data,
                last_assistant_content,
                last_assistant_usage,
            } => {
                self.handle_complete(
                    session_id,
                    result_data,
                    last_assistant_content,
                    last_assistant_usage,
                )
                .await;
            }
            WorkerMessage::Error { error } => {
                warn!("worker for session {} reported error: {}", session_id, error);
                self.set_status(session_id, SessionStatus::Waiting).await;
                self.send_to_session(session_id, ClientEvent::Error {
                    session_id: Some(session_id.to_string()),
                    message: error,
                })
                .await;
            }
        }
    }

    async fn forward_payload(&mut self, session_id: &str, payload: MessagePayload) {
        match payload {
            MessagePayload::Assistant { content } => {
                // Track the most recent todo list for the completion check.
                if let Some(todos) = extract_todos(&content)
                    && let Some(until_done) = self.continuations.get_mut(session_id)
                {
                    until_done.state.latest_todos = Some(todos);
                }
                self.send_to_session(session_id, ClientEvent::Assistant {
                    session_id: session_id.to_string(),
                    content,
                })
                .await;
            }
            MessagePayload::User { content } => {
                self.send_to_session(session_id, ClientEvent::User {
                    session_id: session_id.to_string(),
                    content,
                })
                .await;
            }
            MessagePayload::Result { data } => {
                self.send_to_session(session_id, ClientEvent::Result {
                    session_id: session_id.to_string(),
                    data,
                })
                .await;
            }
            MessagePayload::Progress { .. } => {
                // Progress is transient; nothing downstream consumes it.
            }
        }
    }

    async fn handle_complete(
        &mut self,
        session_id: &str,
        result_data: Value,
        last_assistant_content: Value,
        last_assistant_usage: Option<troupe_protocol::worker::Usage>,
    ) {
        self.set_status(session_id, SessionStatus::Waiting).await;
        if let Some(ref usage) = last_assistant_usage {
            let store = Arc::clone(&self.store);
            let sid = session_id.to_string();
            let usage = *usage;
            tokio::spawn(async move {
                if let Err(e) = store.add_usage(&sid, &usage).await {
                    warn!("failed to persist usage for {}: {}", sid, e);
                }
            });
        }

        self.send_to_session(session_id, ClientEvent::Done {
            session_id: session_id.to_string(),
            result: result_data,
        })
        .await;

        // The worker exits after `complete`; the turn's ActiveProcess entry
        // is done either way.
        self.active.remove(session_id);

        let (outcome, at_cap) = {
            let Some(until_done) = self.continuations.get_mut(session_id) else {
                return;
            };
            if let Some(usage) = last_assistant_usage {
                until_done.state.usage.add(&usage);
            }
            let outcome = TurnOutcome {
                text: flatten_text(&last_assistant_content),
                todos: until_done.state.latest_todos.clone(),
            };
            (outcome, until_done.state.at_cap())
        };

        match self.heuristic.evaluate(&outcome) {
            Verdict::Incomplete { reason } if !at_cap => {
                let Some(until_done) = self.continuations.get_mut(session_id) else {
                    return;
                };
                until_done.state.iteration += 1;
                let (conn, iteration, max_iterations) = (
                    until_done.conn,
                    until_done.state.iteration,
                    until_done.state.max_iterations,
                );
                info!(
                    "session {} unfinished ({}), continuation {}/{}",
                    session_id, reason, iteration, max_iterations
                );
                self.send_to_conn(conn, ClientEvent::UntilDoneContinue {
                    session_id: session_id.to_string(),
                    iteration,
                    max_iterations,
                    reason,
                })
                .await;

                let tx = self.event_tx.clone();
                let sid = session_id.to_string();
                let delay = self.config.continue_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx
                        .send(OrchestratorEvent::ContinueUntilDone { session_id: sid })
                        .await;
                });
            }
            verdict => {
                let reason = match verdict {
                    Verdict::Complete { reason } => reason,
                    Verdict::Incomplete { .. } => "max iterations reached".to_string(),
                };
                let Some(until_done) = self.continuations.remove(session_id) else {
                    return;
                };
                info!("session {} until-done finished: {}", session_id, reason);
                self.send_to_conn(
                    until_done.conn,
                    ClientEvent::UntilDoneComplete {
                        session_id: session_id.to_string(),
                        iterations: until_done.state.iteration,
                        total_cost_usd: until_done.state.usage.cost_usd,
                        reason,
                    },
                )
                .await;
            }
        }
    }

    async fn continue_until_done(&mut self, session_id: &str) {
        let (conn, cwd, model) = match self.continuations.get(session_id) {
            Some(until_done) => (
                until_done.conn,
                until_done.cwd.clone(),
                until_done.model.clone(),
            ),
            None => return,
        };
        if self.active.contains_key(session_id) {
            debug!("session {} busy again, skipping continuation", session_id);
            return;
        }

        let session = match self.store.get(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!("continuation failed: {}", OrchestratorError::SessionNotFound(session_id.to_string()));
                self.continuations.remove(session_id);
                return;
            }
            Err(e) => {
                warn!("continuation lookup failed for {}: {}", session_id, e);
                return;
            }
        };

        if let Err(e) = self
            .start_worker(
                &session,
                CONTINUATION_PROMPT.to_string(),
                cwd,
                model,
                PermissionMode::Prompt,
                None,
                conn,
            )
            .await
        {
            warn!("continuation re-invoke failed for {}: {}", session_id, e);
            let Some(until_done) = self.continuations.remove(session_id) else {
                return;
            };
            self.send_to_conn(
                conn,
                ClientEvent::Error {
                    session_id: Some(session_id.to_string()),
                    message: OrchestratorError::StartupFailure(e.to_string()).to_string(),
                },
            )
            .await;
            self.send_to_conn(
                conn,
                ClientEvent::UntilDoneComplete {
                    session_id: session_id.to_string(),
                    iterations: until_done.state.iteration,
                    total_cost_usd: until_done.state.usage.cost_usd,
                    reason: "worker failed to start".to_string(),
                },
            )
            .await;
        }
    }

    // ========================================================================
    // Shared plumbing
    // ========================================================================

    /// Look up a session, creating a root record for ids the store has never
    /// seen (first query from a fresh client).
    async fn get_or_create_session(&self, session_id: &str, prompt: &str) -> anyhow::Result<Session> {
        if let Some(session) = self.store.get(session_id).await? {
            return Ok(session);
        }
        let title: String = prompt.chars().take(64).collect();
        let mut session = Session::new_root(title, prompt.to_string());
        session.id = session_id.to_string();
        session.root_id = session_id.to_string();
        self.store.create(session.clone()).await?;
        Ok(session)
    }

    /// Spawn a worker and register its ActiveProcess entry.
    async fn start_worker(
        &mut self,
        session: &Session,
        prompt: String,
        cwd: PathBuf,
        model: Option<String>,
        permission_mode: PermissionMode,
        context: Option<AmbientContext>,
        conn: Option<ConnectionId>,
    ) -> Result<(), SpawnError> {
        let launch = WorkerLaunch {
            prompt,
            cwd: cwd.clone(),
            model: model.clone(),
            resume: session.runtime_session_id.clone(),
            permission_mode,
            context,
        };

        let worker = self
            .spawner
            .spawn(&session.id, launch, self.worker_tx.clone())
            .await?;

        self.active.insert(session.id.clone(), ActiveProcess {
            worker,
            conn,
            cwd,
            model,
        });
        self.set_status(&session.id, SessionStatus::Working).await;
        Ok(())
    }

    /// Forward an event to the connection bound to a session's
    /// ActiveProcess. Unbound output is dropped, never queued and never sent
    /// to an unrelated connection.
    async fn send_to_session(&self, session_id: &str, event: ClientEvent) {
        let conn = self.active.get(session_id).and_then(|p| p.conn);
        self.send_to_conn(conn, event).await;
    }

    async fn send_to_conn(&self, conn: Option<ConnectionId>, event: ClientEvent) {
        let Some(conn) = conn else {
            debug!("dropping event for unbound session");
            return;
        };
        if !self.hub.send(conn, event).await {
            debug!("dropping event for closed connection {}", conn);
        }
    }

    /// Write one message to a session's worker, dropping it when no worker
    /// is running.
    async fn send_to_worker(&self, session_id: &str, message: OrchestratorMessage) {
        let Some(process) = self.active.get(session_id) else {
            debug!("no active worker for session {}, dropping message", session_id);
            return;
        };
        if let Err(e) = process.worker.send(message).await {
            warn!("failed to write to worker for {}: {}", session_id, e);
        }
    }

    /// Persist a status change and notify the bound connection. The store
    /// write is fire-and-forget; routing never waits on persistence.
    async fn set_status(&mut self, session_id: &str, status: SessionStatus) {
        let store = Arc::clone(&self.store);
        let sid = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.set_status(&sid, status).await {
                debug!("status write for {} failed: {}", sid, e);
            }
        });
        self.send_to_session(session_id, ClientEvent::SessionStatusChanged {
            session_id: session_id.to_string(),
            status: status.to_string(),
        })
        .await;
    }

    fn store_runtime_session(&self, session_id: &str, token: String) {
        let store = Arc::clone(&self.store);
        let sid = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.set_runtime_session(&sid, &token).await {
                warn!("failed to persist runtime session for {}: {}", sid, e);
            }
        });
    }

    fn store_remove_question(&self, request_id: &str) {
        let store = Arc::clone(&self.store);
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.remove_question(&request_id).await {
                warn!("failed to remove persisted question: {}", e);
            }
        });
    }
}
