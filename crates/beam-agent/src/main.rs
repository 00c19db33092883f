//! Beamline agent binary.
//!
//! Deployed to a remote host, started over a remote shell, and expected to
//! outlive that shell: unless `--foreground` is given it detaches, logs to the
//! system log, beams the requested path and finally deletes itself.

use anyhow::{Context, Result};
use beamline_agent::client::{beam_up, BeamTarget};
use beamline_agent::retry::with_retry;
use beamline_agent::{cli, Cli, Invocation};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<()> {
    let invocation = match Invocation::resolve(Cli::parse()) {
        Ok(invocation) => invocation,
        Err(message) => {
            eprintln!("error: {}\n\n{}", message, cli::usage());
            std::process::exit(2);
        }
    };

    // Resolve before detaching so relative paths keep their meaning.
    let path = std::fs::canonicalize(&invocation.path).unwrap_or_else(|_| invocation.path.clone());

    if !invocation.foreground {
        #[cfg(unix)]
        beamline_agent::detach::detach().context("Failed to detach from the session")?;
    }
    init_logging(invocation.foreground);

    let target = BeamTarget {
        beam_id: invocation.beam_id,
        path,
        receiver: invocation.receiver.clone(),
        version: invocation.version,
    };
    info!(
        beam_id = target.beam_id,
        version = %target.version,
        "Started beaming up {}",
        target.path.display()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    let outcome = runtime.block_on(with_retry(invocation.retry, |attempt| {
        let target = target.clone();
        async move {
            if attempt > 1 {
                info!(attempt, "Restarting beam run");
            }
            beam_up(&target).await
        }
    }));

    if let Err(e) = &outcome {
        error!(beam_id = target.beam_id, "Failed to beam up: {}", e);
    }

    remove_self();
    outcome.map(|_| ()).map_err(Into::into)
}

fn init_logging(foreground: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if foreground {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).compact())
            .init();
        return;
    }

    #[cfg(unix)]
    registry
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(beamline_agent::syslog::Syslog::open())
                .with_ansi(false)
                .without_time()
                .with_target(false),
        )
        .init();

    #[cfg(not(unix))]
    registry
        .with(tracing_subscriber::fmt::layer().with_ansi(false))
        .init();
}

fn remove_self() {
    match std::env::current_exe() {
        Ok(exe) => {
            if let Err(e) = std::fs::remove_file(&exe) {
                warn!("Could not remove {}: {}", exe.display(), e);
            }
        }
        Err(e) => warn!("Could not locate own executable: {}", e),
    }
}
