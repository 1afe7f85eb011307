//! Production worker spawner over `tokio::process`.
//!
//! Three background tasks per worker:
//! - stdin writer: drains the input channel, one encoded line per message
//! - stdout reader: splits the byte stream with [`LineDecoder`], decodes
//!   each line independently, drops malformed lines without aborting
//! - supervise: owns the [`Child`], kills it on cancellation, reports exit

use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use troupe_protocol::codec::{self, LineDecoder};
use troupe_protocol::worker::{OrchestratorMessage, WorkerMessage};

use crate::error::OrchestratorError;

use super::{SpawnError, WorkerEvent, WorkerHandle, WorkerLaunch, WorkerSpawner};

/// Read-buffer size for worker stdout.
const READ_BUFFER_SIZE: usize = 8192;

/// Buffer size for the worker input channel.
const INPUT_BUFFER_SIZE: usize = 64;

/// Configuration for [`ProcessSpawner`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to (or bare name of) the worker runtime binary.
    pub worker_binary: PathBuf,
}

/// Spawns real worker subprocesses.
pub struct ProcessSpawner {
    config: SupervisorConfig,
}

impl ProcessSpawner {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Resolve the worker binary, failing loudly when it cannot be located.
    fn resolve_binary(&self) -> Result<PathBuf, SpawnError> {
        let binary = &self.config.worker_binary;
        if binary.components().count() > 1 {
            if binary.exists() {
                return Ok(binary.clone());
            }
            return Err(SpawnError::BinaryNotFound(binary.display().to_string()));
        }

        let path = std::env::var_os("PATH").unwrap_or_default();
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join(binary);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(SpawnError::BinaryNotFound(binary.display().to_string()))
    }

    async fn stdin_writer_task(
        session_id: String,
        mut stdin: tokio::process::ChildStdin,
        mut input_rx: mpsc::Receiver<OrchestratorMessage>,
    ) {
        while let Some(message) = input_rx.recv().await {
            let line = match codec::encode_line(&message) {
                Ok(line) => line,
                Err(e) => {
                    error!("worker[{}] failed to encode message: {}", session_id, e);
                    continue;
                }
            };
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                warn!("worker[{}] stdin write failed: {}", session_id, e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                warn!("worker[{}] stdin flush failed: {}", session_id, e);
                break;
            }
        }
        debug!("worker[{}] stdin writer ended", session_id);
    }

    /// Read stdout until EOF. Returns the trailing undelimited message when
    /// it decodes to `complete`, a best-effort completion signal from a
    /// worker that exited mid-write.
    async fn stdout_reader_task(
        session_id: String,
        mut stdout: tokio::process::ChildStdout,
        events: mpsc::Sender<(String, WorkerEvent)>,
    ) -> Option<WorkerMessage> {
        let mut decoder = LineDecoder::new();
        let mut chunk = [0u8; READ_BUFFER_SIZE];

        loop {
            let n = match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("worker[{}] stdout read failed: {}", session_id, e);
                    break;
                }
            };

            for line in decoder.push(&chunk[..n]) {
                if line.trim().is_empty() {
                    continue;
                }
                match codec::decode_line::<WorkerMessage>(&line) {
                    Ok(message) => {
                        if events
                            .send((session_id.clone(), WorkerEvent::Message(message)))
                            .await
                            .is_err()
                        {
                            return None;
                        }
                    }
                    Err(e) => {
                        let display_line: String = line.chars().take(200).collect();
                        warn!(
                            "worker[{}] {} - {}",
                            session_id,
                            OrchestratorError::ProtocolDecode(e.to_string()),
                            display_line
                        );
                    }
                }
            }
        }

        match decoder.finish() {
            Some(trailing) => match codec::decode_line::<WorkerMessage>(&trailing) {
                Ok(message @ WorkerMessage::Complete { .. }) => Some(message),
                Ok(_) => {
                    debug!(
                        "worker[{}] ignoring non-completion trailing message",
                        session_id
                    );
                    None
                }
                Err(e) => {
                    debug!("worker[{}] undecodable trailing data: {}", session_id, e);
                    None
                }
            },
            None => None,
        }
    }

    async fn stderr_reader_task(session_id: String, stderr: tokio::process::ChildStderr) {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if !line.trim().is_empty() {
                debug!("worker[{}] stderr: {}", session_id, line);
            }
        }
    }

    async fn supervise_task(
        session_id: String,
        mut child: Child,
        cancel: CancellationToken,
        reader: tokio::task::JoinHandle<Option<WorkerMessage>>,
        events: mpsc::Sender<(String, WorkerEvent)>,
    ) {
        let mut trailing = None;
        let reader_abort = reader.abort_handle();
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("worker[{}] killing on cancellation", session_id);
                if let Err(e) = child.start_kill() {
                    warn!("worker[{}] kill failed: {}", session_id, e);
                }
                reader_abort.abort();
            }
            result = reader => {
                trailing = result.ok().flatten();
            }
        }

        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("worker[{}] wait failed: {}", session_id, e);
                None
            }
        };

        if let Some(message) = trailing {
            info!(
                "worker[{}] forwarding trailing completion from exited process",
                session_id
            );
            let _ = events
                .send((session_id.clone(), WorkerEvent::Message(message)))
                .await;
        }

        info!("worker[{}] exited with code {:?}", session_id, code);
        let _ = events
            .send((session_id, WorkerEvent::Exited { code }))
            .await;
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        session_id: &str,
        launch: WorkerLaunch,
        events: mpsc::Sender<(String, WorkerEvent)>,
    ) -> Result<WorkerHandle, SpawnError> {
        let binary = self.resolve_binary()?;

        let mut cmd = Command::new(&binary);
        cmd.arg("--permission-mode")
            .arg(launch.permission_mode.to_string());
        if let Some(ref model) = launch.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(ref token) = launch.resume {
            cmd.arg("--resume").arg(token);
        }
        cmd.current_dir(&launch.cwd);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SpawnError::Launch(format!("{}: {}", binary.display(), e)))?;

        info!(
            "worker[{}] spawned {} (pid {:?}) in {}",
            session_id,
            binary.display(),
            child.id(),
            launch.cwd.display()
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Launch("worker has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Launch("worker has no stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::stderr_reader_task(session_id.to_string(), stderr));
        }

        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER_SIZE);
        let cancel = CancellationToken::new();

        tokio::spawn(Self::stdin_writer_task(
            session_id.to_string(),
            stdin,
            input_rx,
        ));
        let reader = tokio::spawn(Self::stdout_reader_task(
            session_id.to_string(),
            stdout,
            events.clone(),
        ));
        tokio::spawn(Self::supervise_task(
            session_id.to_string(),
            child,
            cancel.clone(),
            reader,
            events,
        ));

        let handle = WorkerHandle::new(input_tx, cancel);

        // The init message carries the prompt and ambient context; everything
        // else travels as argv flags.
        handle
            .send(OrchestratorMessage::Init {
                prompt: launch.prompt,
                multi_session_context: launch.context,
            })
            .await
            .map_err(|e| SpawnError::Launch(e.to_string()))?;

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_protocol::worker::PermissionMode;

    fn launch() -> WorkerLaunch {
        WorkerLaunch {
            prompt: "hello".to_string(),
            cwd: std::env::temp_dir(),
            model: None,
            resume: None,
            permission_mode: PermissionMode::Prompt,
            context: None,
        }
    }

    #[tokio::test]
    async fn test_missing_binary_fails_loudly() {
        let spawner = ProcessSpawner::new(SupervisorConfig {
            worker_binary: PathBuf::from("/nonexistent/troupe-worker"),
        });
        let (tx, _rx) = mpsc::channel(8);

        let err = spawner.spawn("ses_1", launch(), tx).await.unwrap_err();
        assert!(matches!(err, SpawnError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_short_lived_process_reports_exit() {
        // `echo` prints its (undecodable) argv line and exits; the reader
        // drops the line and the supervise task reports the exit.
        let spawner = ProcessSpawner::new(SupervisorConfig {
            worker_binary: PathBuf::from("/bin/echo"),
        });
        let (tx, mut rx) = mpsc::channel(8);

        spawner.spawn("ses_1", launch(), tx).await.unwrap();

        loop {
            let (session_id, event) = rx.recv().await.expect("events channel closed");
            assert_eq!(session_id, "ses_1");
            match event {
                WorkerEvent::Exited { code } => {
                    assert_eq!(code, Some(0));
                    break;
                }
                WorkerEvent::Message(msg) => panic!("unexpected message: {:?}", msg),
            }
        }
    }
}
