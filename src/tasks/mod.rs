//! Background jobs
//!
//! Every job receives an explicit `TaskContext`; there is no global state.
//! Jobs are dispatched through `TaskQueue` and produced periodically by
//! `Scheduler`.

mod beam_up;
mod free_space;
mod queue;
mod scheduler;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use beamline_proto::ProtocolVersion;
use chrono::Utc;
use tracing::{error, info};

use crate::audit::Auditor;
use crate::config::ServerConfig;
use crate::deploy::{AgentCatalog, AgentDeployer};
use crate::error::{BeamlineError, Result};
use crate::lifecycle;
use crate::remote::{RemoteAuth, SessionConnector};
use crate::retention::RetentionEngine;
use crate::storage::FileStorage;
use crate::store::BeamStore;
use crate::trackers;

pub use beam_up::beam_up;
pub use free_space::{check_free_space, disk_usage, used_percent};
pub use queue::TaskQueue;
pub use scheduler::{ScheduleEntry, Scheduler};

/// Shared collaborators handed to every job.
#[derive(Clone)]
pub struct TaskContext {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn BeamStore>,
    pub storage: FileStorage,
    pub deployer: Arc<AgentDeployer>,
    pub connector: Arc<dyn SessionConnector>,
}

impl TaskContext {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn BeamStore>,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        let deployer = AgentDeployer::new(AgentCatalog::new(&config.agent_assets_dir));
        Self::with_deployer(config, store, connector, deployer)
    }

    pub fn with_deployer(
        config: ServerConfig,
        store: Arc<dyn BeamStore>,
        connector: Arc<dyn SessionConnector>,
        deployer: AgentDeployer,
    ) -> Self {
        Self {
            storage: FileStorage::new(&config.storage_path),
            config: Arc::new(config),
            store,
            deployer: Arc::new(deployer),
            connector,
        }
    }

    pub fn retention(&self) -> RetentionEngine {
        RetentionEngine::new(
            Arc::clone(&self.store),
            self.storage.clone(),
            i64::from(self.config.vacuum_threshold_days),
        )
    }

    pub fn auditor(&self) -> Auditor {
        Auditor::new(
            Arc::clone(&self.store),
            self.storage.clone(),
            self.config.checksum_tool.clone(),
        )
    }
}

/// Payload of a transfer job.
#[derive(Debug, Clone)]
pub struct BeamRequest {
    pub beam_id: i64,
    pub host: String,
    pub directory: String,
    pub user: String,
    pub auth: RemoteAuth,
    /// Falls back to the configured default
    pub version: Option<ProtocolVersion>,
}

#[derive(Debug)]
pub enum Job {
    BeamUp(BeamRequest),
    Vacuum,
    VacuumCheck,
    DeleteBeam(i64),
    Watchdog,
    Scrub,
    ValidateChecksums,
    RefreshTrackers,
    Nightly,
    CheckFreeSpace,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::BeamUp(_) => "beam_up",
            Job::Vacuum => "vacuum",
            Job::VacuumCheck => "vacuum_check",
            Job::DeleteBeam(_) => "delete_beam",
            Job::Watchdog => "watchdog",
            Job::Scrub => "scrub",
            Job::ValidateChecksums => "validate_checksums",
            Job::RefreshTrackers => "refresh_trackers",
            Job::Nightly => "nightly",
            Job::CheckFreeSpace => "check_free_space",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::BeamUp(request) => write!(f, "beam_up({})", request.beam_id),
            Job::DeleteBeam(beam_id) => write!(f, "delete_beam({})", beam_id),
            other => f.write_str(other.name()),
        }
    }
}

/// Run one job to completion.
pub async fn run_job(ctx: &TaskContext, job: Job) -> Result<()> {
    match job {
        Job::BeamUp(request) => beam_up(ctx, request).await,
        Job::Vacuum => vacuum(ctx).await,
        Job::VacuumCheck => {
            let leftovers = ctx.retention().vacuum_check().await?;
            info!("Vacuum check removed {} leftover files", leftovers);
            Ok(())
        }
        Job::DeleteBeam(beam_id) => ctx.retention().delete_beam(beam_id).await,
        Job::Watchdog => {
            let timeout = Duration::from_secs(ctx.config.combadge_contact_timeout_secs);
            lifecycle::time_out_silent_beams(ctx.store.as_ref(), timeout, Utc::now()).await?;
            Ok(())
        }
        Job::Scrub => {
            let report = ctx.auditor().scrub().await?;
            into_result("Scrub", report.discrepancies.len())
        }
        Job::ValidateChecksums => validate_checksums(ctx).await,
        Job::RefreshTrackers => {
            trackers::refresh_issue_trackers(&ctx.store, Utc::now()).await?;
            Ok(())
        }
        Job::Nightly => {
            if let Err(e) = trackers::refresh_issue_trackers(&ctx.store, Utc::now()).await {
                error!("Refreshing issue trackers failed: {}", e);
            }
            vacuum(ctx).await?;
            validate_checksums(ctx).await
        }
        Job::CheckFreeSpace => {
            check_free_space(ctx)?;
            Ok(())
        }
    }
}

async fn vacuum(ctx: &TaskContext) -> Result<()> {
    let report = ctx.retention().vacuum(Utc::now()).await?;
    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(BeamlineError::Storage(format!(
            "Vacuum left beams {:?} pending",
            report.failed
        )))
    }
}

async fn validate_checksums(ctx: &TaskContext) -> Result<()> {
    let report = ctx
        .auditor()
        .validate_checksums(ctx.config.checksum_batch, Utc::now())
        .await?;
    info!("Validated {} files", report.files_checked);
    into_result("Checksum validation", report.discrepancies.len())
}

fn into_result(what: &str, discrepancies: usize) -> Result<()> {
    if discrepancies == 0 {
        Ok(())
    } else {
        Err(BeamlineError::Storage(format!(
            "{} found {} discrepancies",
            what, discrepancies
        )))
    }
}
