//! `edl-worker` – isolated process executing the real run of an EDL script.
//!
//! Spawned by the supervisor with piped stdin/stdout; stdout carries the
//! protocol, so all logging goes to stderr.

use edl::orchestrator::protocol::FinishStatus;
use edl::orchestrator::worker;
use std::env;
use std::io::{self, BufReader};
use std::process::ExitCode;
use tracing::{error, info_span};

fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let mut run_id: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--run-id" => match args.next() {
                Some(id) => run_id = Some(id),
                None => {
                    eprintln!("--run-id requires an argument");
                    print_usage();
                    return ExitCode::from(2);
                }
            },
            "--help" | "-h" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                return ExitCode::from(2);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let span = info_span!("worker", run_id = run_id.as_deref().unwrap_or("-"));
    let _entered = span.enter();

    match worker::serve(BufReader::new(io::stdin()), io::stdout()) {
        Ok(FinishStatus::Completed | FinishStatus::Stopped) => ExitCode::SUCCESS,
        Ok(FinishStatus::Failed { .. }) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = %err, "worker protocol failed");
            ExitCode::from(2)
        }
    }
}

fn print_usage() {
    eprintln!(
        "Usage: edl-worker [--run-id <ID>]\n\n\
         Reads a program from stdin and runs it, reporting over stdout.\n\
         Normally started by `edl run`."
    );
}
