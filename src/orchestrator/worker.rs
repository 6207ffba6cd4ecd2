//! Worker side of the process protocol.
//!
//! The worker reads a `load` message, verifies the program digest, reports
//! `started`, and runs the program for real. A listener thread keeps reading
//! the control channel while the interpreter runs: `stop` becomes a quit
//! request, `permission_to_die` is handed to the main thread. Once the run
//! is over, however it ended, the child-exit hooks run, `finished` is sent,
//! and the worker waits for permission to die before returning.
//!
//! End of input on the control channel means the supervisor is gone; it
//! counts as both a stop request and permission to die.

use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use tracing::{debug, error, info, warn};

use super::OrchestratorError;
use super::protocol::{self, FinishStatus, SupervisorMessage, WorkerMessage};
use crate::device::DeviceSet;
use crate::interpreter::{self, Emission, QuitRequest, RunEnd, Sink};

/// Sink that forwards emissions as `data` messages.
struct PipeSink<'w, W: Write> {
    out: &'w mut W,
}

impl<W: Write> Sink for PipeSink<'_, W> {
    fn emit(&mut self, emission: Emission) -> std::io::Result<()> {
        send(self.out, &WorkerMessage::Data { emission })
    }
}

fn send<W: Write>(out: &mut W, message: &WorkerMessage) -> std::io::Result<()> {
    let line = protocol::encode(message)?;
    out.write_all(&line)?;
    out.flush()
}

/// Run the worker protocol over `input`/`output` and return the status
/// reported to the supervisor.
pub fn serve<R, W>(mut input: R, mut output: W) -> Result<FinishStatus, OrchestratorError>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(OrchestratorError::Protocol(
            "control channel closed before load".into(),
        ));
    }
    let (run_id, digest, mut program, device_names) = match protocol::decode(&line)? {
        SupervisorMessage::Load {
            protocol_version,
            run_id,
            digest,
            program,
            devices,
        } => {
            if protocol_version != crate::PROTOCOL_VERSION {
                warn!(
                    supervisor = %protocol_version,
                    worker = crate::PROTOCOL_VERSION,
                    "protocol version mismatch"
                );
            }
            (run_id, digest, program, devices)
        }
        other => {
            return Err(OrchestratorError::Protocol(format!(
                "expected load, got {other:?}"
            )));
        }
    };
    info!(%run_id, tokens = program.len(), "program received");

    let quit = QuitRequest::new();
    let (permission_tx, permission_rx) = mpsc::channel();
    let listener_quit = quit.clone();
    thread::Builder::new()
        .name("edl-control".into())
        .spawn(move || listen(input, listener_quit, permission_tx))?;

    let actual = program.digest();
    let status = if actual != digest {
        FinishStatus::Failed {
            message: format!("program digest mismatch: expected {digest}, got {actual}"),
        }
    } else {
        match DeviceSet::from_names(&device_names) {
            Err(err) => FinishStatus::Failed {
                message: err.to_string(),
            },
            Ok(mut devices) => {
                send(
                    &mut output,
                    &WorkerMessage::Started {
                        pid: std::process::id(),
                        digest: actual,
                    },
                )?;
                let status = execute(&mut program, &mut devices, &mut output, quit);
                unwind(devices, status)
            }
        }
    };

    info!(?status, "run finished");
    send(&mut output, &WorkerMessage::Finished { status: status.clone() })?;

    // A closed channel also means permission.
    let _ = permission_rx.recv();
    debug!("permission to die received");
    Ok(status)
}

/// Phase C with panics caught, so cleanup always runs.
fn execute<W: Write>(
    program: &mut crate::program::Program,
    devices: &mut DeviceSet,
    output: &mut W,
    quit: QuitRequest,
) -> FinishStatus {
    let mut sink = PipeSink { out: output };
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        interpreter::real_run(program, devices, &mut sink, quit)
    }));
    match result {
        Ok(Ok((end, diagnostics))) => {
            for diagnostic in diagnostics.iter() {
                warn!(severity = %diagnostic.severity, %diagnostic, "real run");
            }
            match end {
                RunEnd::Completed => FinishStatus::Completed,
                RunEnd::Stopped => FinishStatus::Stopped,
            }
        }
        Ok(Err(err)) => {
            error!(error = %err, "real run failed");
            FinishStatus::Failed {
                message: err.to_string(),
            }
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%message, "real run panicked");
            FinishStatus::Failed {
                message: format!("interpreter panicked: {message}"),
            }
        }
    }
}

/// Run the child-exit hooks; a hook failure turns a clean run into a failed
/// one.
fn unwind(mut devices: DeviceSet, status: FinishStatus) -> FinishStatus {
    match (devices.run_child_exit_hooks(), status) {
        (Err(err), FinishStatus::Completed | FinishStatus::Stopped) => FinishStatus::Failed {
            message: err.to_string(),
        },
        (Err(err), status) => {
            warn!(error = %err, "child exit hooks failed");
            status
        }
        (Ok(()), status) => status,
    }
}

fn listen<R: BufRead>(mut input: R, quit: QuitRequest, permission: mpsc::Sender<()>) {
    let mut line = String::new();
    loop {
        line.clear();
        match input.read_line(&mut line) {
            Ok(0) => {
                info!("control channel closed, stopping");
                quit.request();
                let _ = permission.send(());
                return;
            }
            Ok(_) => match protocol::decode::<SupervisorMessage>(&line) {
                Ok(SupervisorMessage::Stop) => {
                    if quit.request() {
                        info!("stop requested");
                    } else {
                        debug!("stop ignored, no longer listening");
                    }
                }
                Ok(SupervisorMessage::PermissionToDie) => {
                    let _ = permission.send(());
                }
                Ok(SupervisorMessage::Load { .. }) => warn!("ignoring second load message"),
                Err(err) => warn!(error = %err, "malformed control message"),
            },
            Err(err) => {
                warn!(error = %err, "control channel read failed");
                quit.request();
                let _ = permission.send(());
                return;
            }
        }
    }
}
