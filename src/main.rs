/*!
 * Beamline CLI - receiver, worker and maintenance jobs
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use beamline::{
    config::ServerConfig,
    logging,
    models::NewBeam,
    receiver::{Receiver, StoreReporter},
    remote::{RemoteAuth, SshConnector},
    store::{BeamStore, SqliteStore},
    tasks::{self, BeamRequest, Job, Scheduler, TaskContext, TaskQueue},
};
use beamline_proto::ProtocolVersion;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tracing::info;

#[derive(Parser)]
#[command(name = "beamline")]
#[command(version, about = "Pull file collections off remote hosts and govern their retention", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept agent connections
    Receiver,

    /// Run the receiver, the job queue and the periodic schedule
    Worker,

    /// Flag eligible beams and purge everything pending deletion
    Vacuum,

    /// Remove files of deleted beams that are still on disk
    VacuumCheck,

    /// Delete one beam now, regardless of pins and issues
    Delete { beam_id: i64 },

    /// Fail beams whose agent never made contact
    Watchdog,

    /// Reconcile recorded sizes with the storage
    Scrub,

    /// Re-hash the least recently validated files
    ValidateChecksums,

    /// Refresh open state of tracked issues
    RefreshTrackers,

    /// Compare storage disk usage with the configured threshold
    CheckFreeSpace,

    /// Create the storage sentinel file
    InitStorage,

    /// Create a beam and run its transfer in the foreground
    BeamUp(BeamUpArgs),
}

#[derive(Args)]
struct BeamUpArgs {
    /// Remote host to pull from
    #[arg(long)]
    host: String,

    /// Directory (or single file) on the remote host
    #[arg(long)]
    directory: String,

    /// Remote user name
    #[arg(long)]
    user: String,

    /// Environment variable holding the password
    #[arg(long, value_name = "VAR", conflicts_with_all = ["key_file", "inline_key"])]
    password_env: Option<String>,

    /// Private key file kept on this server
    #[arg(long, value_name = "PATH", conflicts_with = "inline_key")]
    key_file: Option<PathBuf>,

    /// Private key file whose contents are sent as inline key material
    #[arg(long, value_name = "PATH")]
    inline_key: Option<PathBuf>,

    /// Agent protocol version (v1 or v2)
    #[arg(long)]
    protocol: Option<ProtocolVersion>,

    /// Beam type id
    #[arg(long)]
    type_id: Option<i64>,
}

impl BeamUpArgs {
    fn auth(&self) -> anyhow::Result<RemoteAuth> {
        if let Some(var) = &self.password_env {
            let password = std::env::var(var).with_context(|| format!("{} is not set", var))?;
            return Ok(RemoteAuth::Password(SecretString::from(password)));
        }
        if let Some(path) = &self.key_file {
            return Ok(RemoteAuth::StoredKey(path.clone()));
        }
        if let Some(path) = &self.inline_key {
            let key = std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read {}", path.display()))?;
            return Ok(RemoteAuth::InlineKey(SecretString::from(key)));
        }
        bail!("one of --password-env, --key-file or --inline-key is required")
    }
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    logging::init_logging(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Cannot start the async runtime")?;
    runtime.block_on(dispatch(cli.command, config))
}

async fn dispatch(command: Commands, config: ServerConfig) -> anyhow::Result<()> {
    let store: Arc<dyn BeamStore> = Arc::new(SqliteStore::open(&config.database_url).await?);
    let concurrency = config.worker_concurrency;
    let ctx = TaskContext::new(config, Arc::clone(&store), Arc::new(SshConnector::default()));

    let job = match command {
        Commands::Receiver => return receive(&ctx).await,
        Commands::Worker => return work(ctx, concurrency).await,
        Commands::InitStorage => {
            ctx.storage.initialize().await?;
            return Ok(());
        }
        Commands::BeamUp(args) => {
            let beam = store
                .create_beam(
                    NewBeam {
                        host: args.host.clone(),
                        directory: args.directory.clone(),
                        initiator: None,
                        type_id: args.type_id,
                    },
                    Utc::now(),
                )
                .await?;
            info!(beam_id = beam.id, "Created beam");
            Job::BeamUp(BeamRequest {
                beam_id: beam.id,
                host: args.host.clone(),
                directory: args.directory.clone(),
                user: args.user.clone(),
                auth: args.auth()?,
                version: args.protocol,
            })
        }
        Commands::Vacuum => Job::Vacuum,
        Commands::VacuumCheck => Job::VacuumCheck,
        Commands::Delete { beam_id } => Job::DeleteBeam(beam_id),
        Commands::Watchdog => Job::Watchdog,
        Commands::Scrub => Job::Scrub,
        Commands::ValidateChecksums => Job::ValidateChecksums,
        Commands::RefreshTrackers => Job::RefreshTrackers,
        Commands::CheckFreeSpace => Job::CheckFreeSpace,
    };

    tasks::run_job(&ctx, job).await?;
    Ok(())
}

async fn bind_receiver(ctx: &TaskContext) -> anyhow::Result<Receiver> {
    let reporter = Arc::new(StoreReporter::new(Arc::clone(&ctx.store)));
    Ok(Receiver::bind(&ctx.config.receiver_bind, ctx.storage.clone(), reporter).await?)
}

async fn receive(ctx: &TaskContext) -> anyhow::Result<()> {
    let receiver = bind_receiver(ctx).await?;
    receiver.serve_until(shutdown_signal()).await?;
    Ok(())
}

async fn work(ctx: TaskContext, concurrency: usize) -> anyhow::Result<()> {
    let receiver = bind_receiver(&ctx).await?;
    let scheduler = Scheduler::from_config(&ctx.config);
    let (queue, dispatcher) = TaskQueue::start(ctx, concurrency);
    let timers = scheduler.spawn(queue.clone());

    receiver.serve_until(shutdown_signal()).await?;

    for timer in timers {
        timer.abort();
    }
    drop(queue);
    info!("Waiting for running jobs");
    dispatcher.await.context("Job dispatcher panicked")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
