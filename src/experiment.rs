//! Load → link → check → test run → real run
//!
//! An [`Experiment`] owns one loaded script together with the supervisor's
//! device modules. Loading a new script means building a new `Experiment`;
//! the program buffer never outlives it.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::device::DeviceSet;
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::interpreter::{self, Emission, EventPump, TestReport};
use crate::orchestrator::{Orchestrator, RunReport};
use crate::program::{Lexer, Program, ValueStack, build, link};

/// Tokenize, store and link `source`.
///
/// Nothing is returned unless every stage succeeds.
pub fn compile(file: &str, source: &str) -> Result<Program> {
    let mut lexer = Lexer::new(file, source);
    let mut stack = ValueStack::new();
    let mut program = build(&mut lexer, &mut stack)?;
    link(&mut program)?;
    Ok(program)
}

/// Whether to go on to the real run after the test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Start the real run
    Continue,
    /// Stop here; no hardware has been touched for real
    Abort,
}

/// How [`Experiment::execute`] ended.
#[derive(Debug)]
pub enum Execution {
    /// The user or the configuration declined the real run
    Aborted {
        /// Diagnostics of the test run that led to the decision
        diagnostics: Diagnostics,
    },
    /// The test run was stopped, so there was nothing to confirm
    StoppedInTest(TestReport),
    /// The real run took place
    Ran(RunReport),
}

/// A loaded script and the device modules it runs against.
#[derive(Debug)]
pub struct Experiment {
    name: String,
    program: Program,
    devices: DeviceSet,
    config: RunnerConfig,
}

impl Experiment {
    /// Compile `source` and instantiate the configured device modules.
    pub fn from_source(name: &str, source: &str, config: RunnerConfig) -> Result<Self> {
        let program = compile(name, source)?;
        let devices = DeviceSet::from_names(&config.devices)?;
        info!(
            script = name,
            tokens = program.len(),
            on_stop = ?program.on_stop(),
            devices = devices.len(),
            "script loaded"
        );
        Ok(Self {
            name: name.to_string(),
            program,
            devices,
            config,
        })
    }

    /// Read and compile the script at `path`.
    pub fn load(path: &Path, config: RunnerConfig) -> Result<Self> {
        let source = fs::read_to_string(path)?;
        Self::from_source(&path.display().to_string(), &source, config)
    }

    /// Script name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The linked program.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Runner configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Phase A.
    pub fn check(&self) -> Result<()> {
        interpreter::syntax_check(&self.program, &self.devices)?;
        Ok(())
    }

    /// Phase B. `pump` is polled every `yield_interval` dispatched tokens;
    /// returning `true` stops the test run.
    pub fn test(&mut self, pump: Option<&mut dyn EventPump>) -> Result<TestReport> {
        interpreter::test_run(
            &mut self.program,
            &mut self.devices,
            pump,
            self.config.yield_interval,
        )
    }

    /// Continue/abort decision after a test run.
    ///
    /// Clean runs always continue. Otherwise `abort_on_warnings` aborts,
    /// and `confirm` gets to decide.
    pub fn decide<F>(&self, diagnostics: &Diagnostics, confirm: F) -> Decision
    where
        F: FnOnce(&Diagnostics) -> bool,
    {
        if !diagnostics.needs_confirmation() {
            Decision::Continue
        } else if self.config.abort_on_warnings {
            Decision::Abort
        } else if confirm(diagnostics) {
            Decision::Continue
        } else {
            Decision::Abort
        }
    }

    /// Phase C in a worker process.
    pub async fn run<F>(&mut self, orchestrator: &Orchestrator, on_data: F) -> Result<RunReport>
    where
        F: FnMut(Emission),
    {
        orchestrator.run(&self.program, &mut self.devices, on_data).await
    }

    /// Run every phase in order, then shut the device modules down.
    ///
    /// Stop requests left over from an earlier execution are dropped first;
    /// one raised after the test run is honored by the real run. The modules
    /// are shut down whatever happened before, including a worker that
    /// could not be spawned.
    pub async fn execute<C, F>(
        &mut self,
        orchestrator: &Orchestrator,
        pump: Option<&mut dyn EventPump>,
        confirm: C,
        on_data: F,
    ) -> Result<Execution>
    where
        C: FnOnce(&Diagnostics) -> bool,
        F: FnMut(Emission),
    {
        orchestrator.clear_stop();
        let result = self.phases(orchestrator, pump, confirm, on_data).await;
        match (result, self.shutdown()) {
            (Ok(execution), Ok(())) => Ok(execution),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), shutdown) => {
                if let Err(shutdown) = shutdown {
                    warn!(error = %shutdown, "device shutdown failed");
                }
                Err(err)
            }
        }
    }

    async fn phases<C, F>(
        &mut self,
        orchestrator: &Orchestrator,
        pump: Option<&mut dyn EventPump>,
        confirm: C,
        on_data: F,
    ) -> Result<Execution>
    where
        C: FnOnce(&Diagnostics) -> bool,
        F: FnMut(Emission),
    {
        self.check()?;

        if self.config.skip_test_run {
            info!("test run skipped");
        } else {
            let report = self.test(pump)?;
            if report.end == interpreter::RunEnd::Stopped {
                return Ok(Execution::StoppedInTest(report));
            }
            for diagnostic in report.diagnostics.iter() {
                warn!(%diagnostic, "test run");
            }
            if self.decide(&report.diagnostics, confirm) == Decision::Abort {
                info!("real run declined");
                return Ok(Execution::Aborted {
                    diagnostics: report.diagnostics,
                });
            }
        }

        self.run(orchestrator, on_data).await.map(Execution::Ran)
    }

    /// Run the device modules' exit hooks.
    pub fn shutdown(&mut self) -> Result<()> {
        self.devices.shutdown()?;
        Ok(())
    }
}
