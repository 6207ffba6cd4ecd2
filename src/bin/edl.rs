//! EDL CLI - Command-line front end for the EDL runtime
//!
//! Provides subcommands for checking, test-running and running
//! experiment scripts.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edl::config::{self, RunnerConfig};
use edl::diagnostics::Diagnostics;
use edl::interpreter::Emission;
use edl::orchestrator::StopHandle;
use edl::{Execution, Experiment, Orchestrator, RunOutcome};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser)]
#[command(name = "edl")]
#[command(about = "Run experiment-description scripts against laboratory instruments", long_about = None)]
struct Cli {
    /// Runner configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device module to load (repeatable, added to the configured ones)
    #[arg(short, long = "device")]
    devices: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, link and syntax-check a script
    Check {
        /// Script file
        script: PathBuf,
    },

    /// Check a script and run it once against simulated time and hardware
    Test {
        /// Script file
        script: PathBuf,

        /// Dispatched tokens between checks for Ctrl-C
        #[arg(long)]
        yield_interval: Option<u64>,
    },

    /// Check, test-run and then run a script in a worker process
    Run {
        /// Script file
        script: PathBuf,

        /// Worker executable
        #[arg(long)]
        worker: Option<PathBuf>,

        /// Skip the test run
        #[arg(long)]
        skip_test: bool,

        /// Continue after test-run warnings without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// List the available device modules
    Devices,

    /// Write the default configuration to a file
    InitConfig {
        /// Destination
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = config::load_or_default(cli.config.as_deref())?;
    config.devices.extend(cli.devices);

    match cli.command {
        Commands::Check { script } => {
            let experiment = load(&script, config)?;
            experiment.check()?;
            println!(
                "{}: ok ({} tokens)",
                experiment.name(),
                experiment.program().len()
            );
        }

        Commands::Test {
            script,
            yield_interval,
        } => {
            if let Some(interval) = yield_interval {
                config.yield_interval = interval;
            }
            let mut experiment = load(&script, config)?;
            experiment.check()?;

            let interrupted = watch_interrupts(None);
            let mut pump = move || interrupted.load(Ordering::SeqCst);
            let result = experiment.test(Some(&mut pump));
            experiment.shutdown()?;
            let report = result?;

            for emission in &report.emissions {
                print_emission(emission);
            }
            print_diagnostics(&report.diagnostics);
            println!(
                "test run {:?} after {} tokens, {:.3}s simulated",
                report.end,
                report.dispatched,
                report.simulated_time.as_secs_f64()
            );
        }

        Commands::Run {
            script,
            worker,
            skip_test,
            yes,
        } => {
            if worker.is_some() {
                config.worker_program = worker;
            }
            config.skip_test_run |= skip_test;

            let orchestrator = Orchestrator::from_config(&config)?;
            let mut experiment = load(&script, config)?;

            let interrupted = watch_interrupts(Some(orchestrator.stop_handle()));
            let mut pump = move || interrupted.load(Ordering::SeqCst);
            let execution = experiment
                .execute(
                    &orchestrator,
                    Some(&mut pump),
                    |diagnostics| yes || confirm(diagnostics),
                    |emission| print_emission(&emission),
                )
                .await?;

            return Ok(match execution {
                Execution::Aborted { diagnostics } => {
                    println!(
                        "real run aborted ({} diagnostics)",
                        diagnostics.iter().count()
                    );
                    ExitCode::FAILURE
                }
                Execution::StoppedInTest(report) => {
                    println!("stopped during test run after {} tokens", report.dispatched);
                    ExitCode::SUCCESS
                }
                Execution::Ran(report) => {
                    if let Some(cleanup) = &report.cleanup_error {
                        eprintln!("cleanup failed: {cleanup}");
                    }
                    println!("run {}: {:?}", report.run_id, report.outcome);
                    match report.outcome {
                        RunOutcome::Completed | RunOutcome::Stopped => ExitCode::SUCCESS,
                        RunOutcome::Failed { .. } => ExitCode::FAILURE,
                        RunOutcome::Crashed { .. } => ExitCode::from(2),
                    }
                }
            });
        }

        Commands::Devices => {
            for name in edl::device::DeviceCatalog::global().list_modules() {
                println!("{name}");
            }
        }

        Commands::InitConfig { path } => {
            config::write_config(&path, &RunnerConfig::default())?;
            println!("Wrote default configuration to {:?}", path);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load(script: &Path, config: RunnerConfig) -> Result<Experiment> {
    Experiment::load(script, config).with_context(|| format!("Failed to load {:?}", script))
}

/// Flag raised on Ctrl-C, polled by the test run. Every Ctrl-C is also
/// forwarded to the worker through `stop`.
fn watch_interrupts(stop: Option<StopHandle>) -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let raised = flag.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            raised.store(true, Ordering::SeqCst);
            if let Some(stop) = &stop {
                stop.request_stop();
            }
        }
    });
    flag
}

fn print_emission(emission: &Emission) {
    match emission {
        Emission::Print { text } => println!("{text}"),
        Emission::Record {
            name,
            value,
            elapsed,
        } => println!("[{elapsed:10.3}s] {name} = {value}"),
    }
}

fn print_diagnostics(diagnostics: &Diagnostics) {
    for diagnostic in diagnostics.iter() {
        eprintln!("{diagnostic}");
    }
}

fn confirm(diagnostics: &Diagnostics) -> bool {
    print_diagnostics(diagnostics);
    print!("The test run reported problems. Continue with the real run? [y/N] ");
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
        Err(_) => false,
    }
}
