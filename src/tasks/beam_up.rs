//! Transfer orchestration: connect, deploy, start the agent, clean up

use beamline_proto::ProtocolVersion;
use chrono::Utc;
use tracing::{debug, error, info};

use super::{BeamRequest, TaskContext};
use crate::error::Result;
use crate::lifecycle;
use crate::remote::{RemoteSession, SessionParams};

/// Run one transfer request.
///
/// Any failure is written to the beam, which becomes terminal. The error is
/// then returned so the queue reports it, except for authentication
/// failures, which no retry would fix.
pub async fn beam_up(ctx: &TaskContext, request: BeamRequest) -> Result<()> {
    let beam_id = request.beam_id;
    let version = request
        .version
        .unwrap_or(ctx.config.default_protocol_version);
    info!(
        beam_id,
        "Beaming up {}@{}:{} to receiver {}. Auth method: {}",
        request.user,
        request.host,
        request.directory,
        ctx.config.receiver_host,
        request.auth.method_name()
    );

    match transfer(ctx, &request, version).await {
        Ok(()) => {
            info!(beam_id, "Detached from agent");
            Ok(())
        }
        Err(e) => {
            error!(beam_id, "Failed to beam up: {}", e);
            lifecycle::record_failure(ctx.store.as_ref(), beam_id, &e, Utc::now()).await?;
            if e.is_auth_error() {
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

async fn transfer(ctx: &TaskContext, request: &BeamRequest, version: ProtocolVersion) -> Result<()> {
    let params = SessionParams::new(&request.host, &request.user, request.auth.clone());
    let session = ctx.connector.connect(&params).await?;
    info!(
        beam_id = request.beam_id,
        "Connected to {}. Uploading agent version {}", request.host, version
    );

    let outcome = run_agent(ctx, &session, request, version).await;
    if let Err(e) = session.close().await {
        debug!(beam_id = request.beam_id, "Closing session failed: {}", e);
    }
    outcome
}

async fn run_agent(
    ctx: &TaskContext,
    session: &RemoteSession,
    request: &BeamRequest,
    version: ProtocolVersion,
) -> Result<()> {
    let agent = ctx.deployer.deploy(session, version).await?;
    let outcome = agent
        .run(request.beam_id, &request.directory, &ctx.config.receiver_host)
        .await
        .map(|_| ());
    agent.teardown().await;
    outcome
}
