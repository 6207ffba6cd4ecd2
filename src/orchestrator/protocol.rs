//! Messages exchanged between supervisor and worker.
//!
//! Every message is one line of JSON. The supervisor writes to the worker's
//! stdin, the worker answers on its stdout; the worker's stderr carries its
//! log output only.
//!
//! ```text
//! supervisor                         worker
//!     | -- load ----------------------> |
//!     | <----------------------- started |
//!     | <-------------------- data (0..n) |
//!     | -- stop (optional) -----------> |
//!     | <---------------------- finished |
//!     | -- permission_to_die ---------> |
//!     |                            (exit) |
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::interpreter::Emission;
use crate::program::Program;

/// Messages sent by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorMessage {
    /// Program to execute; always the first message
    Load {
        /// Protocol version spoken by the supervisor
        protocol_version: String,
        /// Identifier of this run
        run_id: Uuid,
        /// BLAKE3 digest of `program`
        digest: String,
        /// Linked program buffer
        program: Program,
        /// Device modules to instantiate, in request order
        devices: Vec<String>,
    },
    /// Please stop (jump to `ON_STOP:` if there is one)
    Stop,
    /// The supervisor saw `Finished`; the worker may exit
    PermissionToDie,
}

/// Messages sent by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The worker accepted the program and is about to run it
    Started {
        /// Worker process id
        pid: u32,
        /// Digest of the program the worker verified
        digest: String,
    },
    /// Output of the running script
    Data {
        /// The emission
        emission: Emission,
    },
    /// The real run is over and cleanup is done
    Finished {
        /// How the run ended
        status: FinishStatus,
    },
}

/// Final status reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FinishStatus {
    /// End of program reached
    Completed,
    /// Stopped on request or by `abort()`
    Stopped,
    /// The run failed
    Failed {
        /// Error description
        message: String,
    },
}

/// Serialize a message as one newline-terminated JSON line.
pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one line into a message.
pub fn decode<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}
