//! Runner configuration
//!
//! Stored as pretty-printed JSON and replaced atomically (temp file, sync,
//! rename, directory sync) so that a crash never leaves a half-written file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Settings for checking and running scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Dispatched tokens between event-loop yields during the test run
    pub yield_interval: u64,

    /// Worker executable (default: `edl-worker` next to the current executable)
    pub worker_program: Option<PathBuf>,

    /// Milliseconds between permission-to-die and killing the worker
    pub death_grace_ms: u64,

    /// Device modules to load, in order
    pub devices: Vec<String>,

    /// Go straight from the syntax check to the real run
    pub skip_test_run: bool,

    /// Treat warnings and severe diagnostics of the test run as a reason to
    /// abort instead of continuing with the real run
    pub abort_on_warnings: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            yield_interval: 100,
            worker_program: None,
            death_grace_ms: 5000,
            devices: Vec::new(),
            skip_test_run: false,
            abort_on_warnings: false,
        }
    }
}

/// Write `data` to `path` atomically.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
    file.write_all(data).context("Failed to write data")?;
    file.sync_all().context("Failed to sync file")?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let dir = OpenOptions::new()
            .read(true)
            .open(parent)
            .with_context(|| format!("Failed to open directory: {:?}", parent))?;
        dir.sync_all().context("Failed to sync directory")?;
    }

    Ok(())
}

/// Write the configuration to `path`.
pub fn write_config(path: &Path, config: &RunnerConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    write_atomic(path, &json)
}

/// Load the configuration from `path`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    let data = fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))?;
    let config = serde_json::from_slice(&data).context("Failed to deserialize config")?;
    Ok(config)
}

/// Load the configuration from `path` if given, defaults otherwise.
pub fn load_or_default(path: Option<&Path>) -> Result<RunnerConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(RunnerConfig::default()),
    }
}
