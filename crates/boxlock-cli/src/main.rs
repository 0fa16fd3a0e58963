//! boxlock -- lock broker for isolate sandbox boxes.
//!
//! A host provisioned with isolate has a fixed pool of numbered sandbox
//! boxes shared by every job runner on it. `boxlock` hands out exclusive
//! locks on them: `boxlock` (or `boxlock -l`) acquires boxes on behalf of
//! the *parent* process and prints the granted ids, `boxlock -f <id>` frees
//! them again. Crashed holders are detected through PID-reuse-safe
//! identities and reclaimed lazily by the next contender.
//!
//! Diagnostics go to stderr (tracing, `RUST_LOG` filtered); stdout carries
//! only granted or released box ids.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod exit_codes;

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    ExitCode::from(commands::run(&cli))
}
