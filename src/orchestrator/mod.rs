//! Supervisor side of the worker process protocol
//!
//! The real run executes in a separate `edl-worker` process so that a
//! crashing instrument driver or interpreter cannot take the supervisor
//! down with it. The supervisor spawns the worker with piped stdin/stdout,
//! sends it the linked program, forwards stop requests, collects its data,
//! and reconciles how it ended:
//!
//! * `finished` received: the exit is *confirmed*. The supervisor answers
//!   with `permission_to_die` and reaps the process.
//! * stdout closed without `finished`: the worker died on its own. The exit
//!   is *unconfirmed* and always reported as a crash, whatever its exit
//!   status.
//!
//! The worker identity is recorded before the first message is read, and
//! the worker's messages queue up in the pipe until then, so a worker that
//! finishes immediately cannot overtake the supervisor.

pub mod protocol;
pub mod worker;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::device::DeviceSet;
use crate::error::Result;
use crate::interpreter::Emission;
use crate::program::Program;
use protocol::{FinishStatus, SupervisorMessage, WorkerMessage};

/// Errors raised while spawning or talking to the worker.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The OS refused to create another process for lack of resources
    #[error("cannot start worker, system resources exhausted: {0}")]
    ResourcesExhausted(#[source] io::Error),

    /// Any other spawn failure
    #[error("cannot start worker: {0}")]
    Spawn(#[source] io::Error),

    /// Pipe I/O failure
    #[error("worker I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed message
    #[error("malformed worker message: {0}")]
    Json(#[from] serde_json::Error),

    /// Message out of order or missing
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The worker verified a different program than the one sent
    #[error("worker runs program {actual}, expected {expected}")]
    DigestMismatch {
        /// Digest of the program sent
        expected: String,
        /// Digest echoed by the worker
        actual: String,
    },
}

fn spawn_error(err: io::Error) -> OrchestratorError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory => {
            OrchestratorError::ResourcesExhausted(err)
        }
        _ => OrchestratorError::Spawn(err),
    }
}

/// Supervisor-side state of one real run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    /// No worker
    Idle,
    /// Worker being created
    Spawning,
    /// Worker reported `started`
    Running,
    /// Stop forwarded to the worker
    QuitRequested,
    /// Worker gone
    Exited {
        /// Whether the worker reported `finished` first
        confirmed: bool,
    },
}

/// Life-cycle flag of a [`WorkerHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Spawned, `started` not yet seen
    NotStarted,
    /// `started` seen
    Running,
    /// `finished` seen
    ExitConfirmed,
}

/// How a real run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Program ran to its end
    Completed,
    /// Program was stopped
    Stopped,
    /// Program failed; the worker unwound and reported it
    Failed {
        /// Error reported by the worker
        message: String,
    },
    /// Worker died without reporting
    Crashed {
        /// Exit status as reported by the OS
        status: String,
    },
}

impl RunOutcome {
    /// Whether the worker confirmed its exit.
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, RunOutcome::Crashed { .. })
    }
}

impl From<FinishStatus> for RunOutcome {
    fn from(status: FinishStatus) -> Self {
        match status {
            FinishStatus::Completed => RunOutcome::Completed,
            FinishStatus::Stopped => RunOutcome::Stopped,
            FinishStatus::Failed { message } => RunOutcome::Failed { message },
        }
    }
}

/// Summary of one real run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Run identifier
    pub run_id: Uuid,
    /// How it ended
    pub outcome: RunOutcome,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Wall-clock end
    pub finished_at: DateTime<Utc>,
    /// Number of data messages received
    pub emissions: usize,
    /// End-of-experiment hook failure, if any
    pub cleanup_error: Option<String>,
}

/// Supervisor's record of the worker process.
pub struct WorkerHandle {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    lifecycle: Lifecycle,
}

impl WorkerHandle {
    fn spawn(program: &Path, run_id: Uuid) -> std::result::Result<Self, OrchestratorError> {
        let mut command = Command::new(program);
        command
            .arg("--run-id")
            .arg(run_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Own process group: a terminal Ctrl-C reaches the supervisor only,
        // which forwards it as `stop`.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(spawn_error)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OrchestratorError::Protocol("worker stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::Protocol("worker stdout not piped".into()))?;

        Ok(Self {
            pid: child.id(),
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
            lifecycle: Lifecycle::NotStarted,
        })
    }

    /// OS process id.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current life-cycle flag.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    async fn send(&mut self, message: &SupervisorMessage) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin closed"))?;
        let line = protocol::encode(message)?;
        stdin.write_all(&line).await?;
        stdin.flush().await
    }

    /// Next protocol message, skipping lines that are not one. `None` once
    /// stdout is closed.
    async fn next_message(&mut self) -> io::Result<Option<WorkerMessage>> {
        while let Some(line) = self.lines.next_line().await? {
            match protocol::decode(&line) {
                Ok(message) => return Ok(Some(message)),
                Err(err) => {
                    warn!(pid = ?self.pid, %line, error = %err, "ignoring malformed worker output")
                }
            }
        }
        Ok(None)
    }

    /// Close stdin and wait for the process, killing it after `grace`.
    async fn reap(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        self.stdin.take();
        match timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(pid = ?self.pid, "worker did not exit in time, killing it");
                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }
}

/// Cloneable handle used to request a stop of the current real run.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask the running worker to stop.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }
}

/// Spawns and supervises worker processes.
pub struct Orchestrator {
    worker_program: PathBuf,
    death_grace: Duration,
    stop: Arc<watch::Sender<bool>>,
    state: Mutex<SupervisorState>,
    worker_pid: Mutex<Option<u32>>,
}

impl Orchestrator {
    /// Grace period between `permission_to_die` and killing the worker.
    pub const DEFAULT_DEATH_GRACE: Duration = Duration::from_secs(5);

    /// Supervisor that launches `worker_program`.
    pub fn new(worker_program: impl Into<PathBuf>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            worker_program: worker_program.into(),
            death_grace: Self::DEFAULT_DEATH_GRACE,
            stop: Arc::new(stop),
            state: Mutex::new(SupervisorState::Idle),
            worker_pid: Mutex::new(None),
        }
    }

    /// Supervisor configured from `config`.
    pub fn from_config(config: &RunnerConfig) -> std::result::Result<Self, OrchestratorError> {
        let worker = match &config.worker_program {
            Some(path) => path.clone(),
            None => default_worker_program()?,
        };
        Ok(Self::new(worker).with_death_grace(Duration::from_millis(config.death_grace_ms)))
    }

    /// Change the grace period.
    pub fn with_death_grace(mut self, grace: Duration) -> Self {
        self.death_grace = grace;
        self
    }

    /// Path of the worker executable.
    pub fn worker_program(&self) -> &Path {
        &self.worker_program
    }

    /// Handle for requesting a stop from elsewhere (signal handler, UI).
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: self.stop.clone(),
        }
    }

    /// Drop a stop request that no run has consumed yet.
    pub fn clear_stop(&self) {
        self.stop.send_replace(false);
    }

    /// Current supervisor state.
    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    /// OS process id of the live worker, if any.
    pub fn worker_pid(&self) -> Option<u32> {
        *self.worker_pid.lock()
    }

    fn transition(&self, next: SupervisorState) {
        let mut state = self.state.lock();
        debug!(from = ?*state, to = ?next, "supervisor state");
        *state = next;
    }

    /// Run `program` in a worker process.
    ///
    /// Experiment hooks run before the worker is spawned; end-of-experiment
    /// hooks run once the worker is gone, including when it could not be
    /// spawned at all. `on_data` receives the worker's output in order.
    ///
    /// A stop requested before the worker is up is forwarded right after
    /// the program. The request is consumed when the run ends.
    pub async fn run<F>(
        &self,
        program: &Program,
        devices: &mut DeviceSet,
        on_data: F,
    ) -> Result<RunReport>
    where
        F: FnMut(Emission),
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, worker = %self.worker_program.display(), "starting real run");

        if let Err(err) = devices.run_exp_hooks() {
            self.clear_stop();
            if let Err(cleanup) = devices.run_end_of_exp_hooks() {
                warn!(error = %cleanup, "end-of-experiment hooks failed");
            }
            return Err(err.into());
        }

        let supervised = self.supervise(run_id, program, devices.names(), on_data).await;
        self.clear_stop();
        let cleanup = devices.run_end_of_exp_hooks();

        let (outcome, emissions) = match supervised {
            Ok(result) => result,
            Err(err) => {
                if let Err(cleanup) = cleanup {
                    warn!(error = %cleanup, "end-of-experiment hooks failed");
                }
                self.transition(SupervisorState::Idle);
                return Err(err.into());
            }
        };

        info!(%run_id, ?outcome, emissions, "real run finished");
        Ok(RunReport {
            run_id,
            outcome,
            started_at,
            finished_at: Utc::now(),
            emissions,
            cleanup_error: cleanup.err().map(|err| err.to_string()),
        })
    }

    async fn supervise<F>(
        &self,
        run_id: Uuid,
        program: &Program,
        devices: Vec<String>,
        mut on_data: F,
    ) -> std::result::Result<(RunOutcome, usize), OrchestratorError>
    where
        F: FnMut(Emission),
    {
        let mut stop_rx = self.stop.subscribe();

        self.transition(SupervisorState::Spawning);
        let mut handle = WorkerHandle::spawn(&self.worker_program, run_id)?;
        *self.worker_pid.lock() = handle.pid();
        info!(pid = ?handle.pid(), "worker spawned");

        let expected = program.digest();
        let load = SupervisorMessage::Load {
            protocol_version: crate::PROTOCOL_VERSION.to_string(),
            run_id,
            digest: expected.clone(),
            program: program.clone(),
            devices,
        };
        if let Err(err) = handle.send(&load).await {
            // The worker is already gone; its stdout tells the rest.
            warn!(error = %err, "could not send program to worker");
        }

        let mut stop_sent = false;
        if *stop_rx.borrow_and_update() {
            self.forward_stop(&mut handle).await;
            stop_sent = true;
        }

        let mut mismatch = None;
        let mut emissions = 0;
        let finished = loop {
            tokio::select! {
                message = handle.next_message() => match message {
                    Ok(Some(WorkerMessage::Started { pid, digest })) => {
                        if digest != expected {
                            warn!(pid, %digest, %expected, "worker runs a different program");
                            mismatch = Some(OrchestratorError::DigestMismatch {
                                expected: expected.clone(),
                                actual: digest,
                            });
                            if !stop_sent {
                                self.forward_stop(&mut handle).await;
                                stop_sent = true;
                            }
                            continue;
                        }
                        info!(pid, "worker started");
                        handle.lifecycle = Lifecycle::Running;
                        if !stop_sent {
                            self.transition(SupervisorState::Running);
                        }
                    }
                    Ok(Some(WorkerMessage::Data { emission })) => {
                        emissions += 1;
                        on_data(emission);
                    }
                    Ok(Some(WorkerMessage::Finished { status })) => break Some(status),
                    Ok(None) => break None,
                    Err(err) => {
                        warn!(error = %err, "worker stdout unreadable");
                        break None;
                    }
                },
                changed = stop_rx.changed(), if !stop_sent => match changed {
                    Ok(()) if *stop_rx.borrow_and_update() => {
                        self.forward_stop(&mut handle).await;
                        stop_sent = true;
                    }
                    Ok(()) => {}
                    Err(_) => stop_sent = true,
                },
            }
        };

        let reaped = match finished {
            Some(status) => {
                handle.lifecycle = Lifecycle::ExitConfirmed;
                if let Err(err) = handle.send(&SupervisorMessage::PermissionToDie).await {
                    debug!(error = %err, "permission to die not delivered");
                }
                handle.reap(self.death_grace).await.map(|exit| {
                    debug!(%exit, "worker exited");
                    self.transition(SupervisorState::Exited { confirmed: true });
                    RunOutcome::from(status)
                })
            }
            None => handle.reap(self.death_grace).await.map(|exit| {
                warn!(%exit, lifecycle = ?handle.lifecycle(), "worker died without reporting");
                self.transition(SupervisorState::Exited { confirmed: false });
                RunOutcome::Crashed {
                    status: exit.to_string(),
                }
            }),
        };
        *self.worker_pid.lock() = None;

        let outcome = reaped?;
        match mismatch {
            Some(err) => Err(err),
            None => Ok((outcome, emissions)),
        }
    }

    async fn forward_stop(&self, handle: &mut WorkerHandle) {
        info!("forwarding stop request to worker");
        self.transition(SupervisorState::QuitRequested);
        if let Err(err) = handle.send(&SupervisorMessage::Stop).await {
            debug!(error = %err, "stop not delivered");
        }
    }
}

/// `edl-worker` next to the running executable.
pub fn default_worker_program() -> io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(exe.with_file_name(format!("edl-worker{}", std::env::consts::EXE_SUFFIX)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_errors_are_classified() {
        assert!(matches!(
            spawn_error(io::Error::from(io::ErrorKind::WouldBlock)),
            OrchestratorError::ResourcesExhausted(_)
        ));
        assert!(matches!(
            spawn_error(io::Error::from(io::ErrorKind::NotFound)),
            OrchestratorError::Spawn(_)
        ));
    }

    #[test]
    fn test_outcome_confirmation() {
        assert!(RunOutcome::from(FinishStatus::Stopped).is_confirmed());
        assert!(
            RunOutcome::Failed {
                message: "x".into()
            }
            .is_confirmed()
        );
        assert!(
            !RunOutcome::Crashed {
                status: "signal: 6".into()
            }
            .is_confirmed()
        );
    }

    /// Device that journals the experiment hooks it sees.
    struct Journaling(Arc<Mutex<Vec<&'static str>>>);

    impl crate::device::Device for Journaling {
        fn name(&self) -> &str {
            "journal"
        }

        fn exp_hook(&mut self) -> crate::error::DeviceResult<()> {
            self.0.lock().push("exp");
            Ok(())
        }

        fn end_of_exp_hook(&mut self) -> crate::error::DeviceResult<()> {
            self.0.lock().push("end_of_exp");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_missing_worker_still_runs_cleanup() {
        let orchestrator = Orchestrator::new("/nonexistent/edl-worker");
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut devices = DeviceSet::from_names(&["sim_meter"]).unwrap();
        devices.push(Box::new(Journaling(journal.clone())));
        let program = Program::default();
        orchestrator.stop_handle().request_stop();

        let err = orchestrator
            .run(&program, &mut devices, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Orchestrator(OrchestratorError::Spawn(_))
        ));
        assert_eq!(*journal.lock(), vec!["exp", "end_of_exp"]);
        assert_eq!(orchestrator.state(), SupervisorState::Idle);
        assert_eq!(orchestrator.worker_pid(), None);
        assert!(!*orchestrator.stop.borrow());
    }
}
