//! Shared test harness: a scripted worker spawner driving the orchestrator
//! actor against in-memory components.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use troupe::orchestrator::continuation::{CompletionHeuristic, TurnOutcome, Verdict};
use troupe::orchestrator::context::NullResolver;
use troupe::orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorEvent, OrchestratorHandle,
};
use troupe::session::MemoryStore;
use troupe::supervisor::{SpawnError, WorkerEvent, WorkerHandle, WorkerLaunch, WorkerSpawner};
use troupe::ws::{ConnectionId, WsHub};
use troupe_protocol::client::{ClientCommand, ClientEvent};
use troupe_protocol::worker::{OrchestratorMessage, WorkerMessage};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(150);

/// One fabricated worker: the launch the orchestrator requested, the stream
/// of messages it wrote to our stdin, and the channel to emit output on.
pub struct FakeWorker {
    pub session_id: String,
    pub launch: WorkerLaunch,
    pub input_rx: mpsc::Receiver<OrchestratorMessage>,
    pub cancel: CancellationToken,
    events: mpsc::Sender<(String, WorkerEvent)>,
}

impl FakeWorker {
    /// Emit one protocol message as if the worker wrote it to stdout.
    pub async fn emit(&self, message: WorkerMessage) {
        self.events
            .send((self.session_id.clone(), WorkerEvent::Message(message)))
            .await
            .expect("orchestrator stopped");
    }

    /// Report process exit.
    pub async fn exit(&self, code: i32) {
        self.events
            .send((self.session_id.clone(), WorkerEvent::Exited { code: Some(code) }))
            .await
            .expect("orchestrator stopped");
    }

    /// Next message the orchestrator wrote to this worker's stdin.
    pub async fn next_input(&mut self) -> OrchestratorMessage {
        timeout(WAIT, self.input_rx.recv())
            .await
            .expect("timed out waiting for worker input")
            .expect("worker input channel closed")
    }

    /// Assert nothing more arrives on stdin within a quiet window.
    pub async fn expect_no_input(&mut self) {
        if let Ok(Some(message)) = timeout(QUIET, self.input_rx.recv()).await {
            panic!("unexpected worker input: {:?}", message);
        }
    }
}

/// Spawner that fabricates workers instead of launching processes.
pub struct FakeSpawner {
    created: mpsc::UnboundedSender<FakeWorker>,
}

#[async_trait]
impl WorkerSpawner for FakeSpawner {
    async fn spawn(
        &self,
        session_id: &str,
        launch: WorkerLaunch,
        events: mpsc::Sender<(String, WorkerEvent)>,
    ) -> Result<WorkerHandle, SpawnError> {
        let (input_tx, input_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let worker = FakeWorker {
            session_id: session_id.to_string(),
            launch,
            input_rx,
            cancel: cancel.clone(),
            events,
        };
        self.created
            .send(worker)
            .map_err(|_| SpawnError::Launch("test harness dropped".to_string()))?;
        Ok(WorkerHandle::new(input_tx, cancel))
    }
}

/// Heuristic that never believes the task is finished.
pub struct AlwaysIncomplete;

impl CompletionHeuristic for AlwaysIncomplete {
    fn evaluate(&self, _outcome: &TurnOutcome) -> Verdict {
        Verdict::Incomplete {
            reason: "scripted incomplete".to_string(),
        }
    }
}

/// Orchestrator under test plus its observation channels.
pub struct Harness {
    pub handle: OrchestratorHandle,
    pub hub: Arc<WsHub>,
    pub store: Arc<MemoryStore>,
    workers: mpsc::UnboundedReceiver<FakeWorker>,
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_levels: 3,
        max_children: 5,
        default_max_iterations: 10,
        continue_delay: Duration::from_millis(10),
        escalation_timeout: None,
        default_cwd: PathBuf::from("/tmp"),
    }
}

/// Start an orchestrator with the given config and heuristic.
pub fn start(config: OrchestratorConfig, heuristic: Box<dyn CompletionHeuristic>) -> Harness {
    let hub = Arc::new(WsHub::new());
    let store = Arc::new(MemoryStore::new());
    let (created, workers) = mpsc::unbounded_channel();
    let spawner = Arc::new(FakeSpawner { created });

    let (orchestrator, handle) = Orchestrator::new(
        config,
        spawner,
        Arc::clone(&store) as Arc<dyn troupe::session::SessionStore>,
        Arc::new(NullResolver),
        heuristic,
        Arc::clone(&hub),
    );
    tokio::spawn(orchestrator.run());

    Harness {
        handle,
        hub,
        store,
        workers,
    }
}

impl Harness {
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<ClientEvent>) {
        self.hub.register()
    }

    pub async fn command(&self, conn: ConnectionId, command: ClientCommand) {
        self.handle
            .send(OrchestratorEvent::Command { conn, command })
            .await
            .expect("orchestrator stopped");
    }

    pub async fn disconnect(&self, conn: ConnectionId) {
        self.hub.unregister(conn);
        self.handle
            .send(OrchestratorEvent::ConnectionClosed { conn })
            .await
            .expect("orchestrator stopped");
    }

    /// The next worker the orchestrator spawned.
    pub async fn next_worker(&mut self) -> FakeWorker {
        timeout(WAIT, self.workers.recv())
            .await
            .expect("timed out waiting for a worker spawn")
            .expect("spawner channel closed")
    }

    /// Assert no worker is spawned within a quiet window.
    pub async fn expect_no_worker(&mut self) {
        if let Ok(Some(worker)) = timeout(QUIET, self.workers.recv()).await {
            panic!("unexpected worker spawn for {}", worker.session_id);
        }
    }

    /// Send a plain query and return the spawned worker.
    pub async fn query(&mut self, conn: ConnectionId, session_id: &str) -> FakeWorker {
        self.command(conn, query_cmd(session_id, "do the task")).await;
        self.next_worker().await
    }

    /// Spawn a child from `parent` and return (child_id, child_worker).
    pub async fn spawn_child(
        &mut self,
        parent: &mut FakeWorker,
        request_id: &str,
        role: &str,
    ) -> (String, FakeWorker) {
        parent
            .emit(WorkerMessage::MultiSessionSpawn {
                request_id: request_id.to_string(),
                title: format!("{} child", role),
                role: role.to_string(),
                task: format!("work as {}", role),
                model: None,
            })
            .await;

        let child_id = match parent.next_input().await {
            OrchestratorMessage::MultiSessionSpawnResponse {
                success: true,
                child_session_id: Some(child_id),
                ..
            } => child_id,
            other => panic!("expected successful spawn response, got {:?}", other),
        };
        let child = self.next_worker().await;
        assert_eq!(child.session_id, child_id);
        (child_id, child)
    }
}

pub fn query_cmd(session_id: &str, prompt: &str) -> ClientCommand {
    ClientCommand::Query {
        session_id: session_id.to_string(),
        prompt: prompt.to_string(),
        cwd: None,
        model: None,
        until_done: false,
        max_iterations: None,
    }
}

/// Wait for the first event matching the predicate, skipping others.
pub async fn wait_for(
    rx: &mut mpsc::Receiver<ClientEvent>,
    what: &str,
    predicate: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, rx.recv()).await {
            Ok(Some(event)) if predicate(&event) => return event,
            Ok(Some(_)) => continue,
            _ => panic!("timed out waiting for {}", what),
        }
    }
}

/// Drain every event that arrives within a quiet window.
pub async fn collect_events(rx: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = timeout(QUIET, rx.recv()).await {
        events.push(event);
    }
    events
}
