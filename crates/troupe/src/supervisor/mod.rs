//! Worker process supervision.
//!
//! One worker subprocess per active session. The supervisor owns process
//! lifecycle and the stdio framing; it knows nothing about routing. Every
//! decoded message is forwarded to the orchestrator as a [`WorkerEvent`]
//! tagged with the owning session id.

pub mod process;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use troupe_protocol::worker::{AmbientContext, OrchestratorMessage, PermissionMode, WorkerMessage};

pub use process::{ProcessSpawner, SupervisorConfig};

/// Event emitted by a supervised worker.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A decoded protocol message from the worker's stdout.
    Message(WorkerMessage),
    /// The subprocess exited. A trailing undelimited `complete` message, if
    /// one was buffered at EOF, has already been forwarded as a `Message`.
    Exited { code: Option<i32> },
}

/// Launch configuration for one worker turn.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub prompt: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    /// Backing-runtime session token to resume from.
    pub resume: Option<String>,
    pub permission_mode: PermissionMode,
    /// Ambient context for spawned children.
    pub context: Option<AmbientContext>,
}

/// Why a worker could not be spawned.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The runtime executable cannot be located. Callers must surface this
    /// as a session-level error, not retry silently.
    #[error("worker binary not found: {0}")]
    BinaryNotFound(String),

    #[error("failed to launch worker: {0}")]
    Launch(String),
}

/// Live handle to a supervised worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    input: mpsc::Sender<OrchestratorMessage>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    pub fn new(input: mpsc::Sender<OrchestratorMessage>, cancel: CancellationToken) -> Self {
        Self { input, cancel }
    }

    /// Queue one message for the worker's stdin. No acknowledgment is
    /// expected at this layer; correlation is the caller's responsibility.
    pub async fn send(&self, message: OrchestratorMessage) -> anyhow::Result<()> {
        self.input
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("worker input channel closed"))
    }

    /// Terminate the subprocess with a non-graceful signal.
    pub fn kill(&self) {
        self.cancel.cancel();
    }
}

/// Seam between the orchestrator and the operating system.
///
/// The production implementation is [`ProcessSpawner`]; tests substitute a
/// scripted spawner that fabricates handles without real subprocesses.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Launch a worker for `session_id`, wiring its output to `events`.
    async fn spawn(
        &self,
        session_id: &str,
        launch: WorkerLaunch,
        events: mpsc::Sender<(String, WorkerEvent)>,
    ) -> Result<WorkerHandle, SpawnError>;
}
