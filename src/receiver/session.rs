//! One agent connection
//!
//! A connection speaks v1 until the agent announces otherwise. Whatever
//! happens, the beam is closed out at the end: cleanly on `BeamComplete`,
//! with a `Transporter Error` otherwise.

use beamline_proto::{
    read_beam_id, read_chunk_payload, read_message, read_mtime, read_path, write_reply,
    ClientMessage, ProtoError, ProtocolVersion, ServerReply,
};
use sha2::{Digest, Sha512};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use super::reporter::OutcomeReporter;
use crate::error::{BeamlineError, Result};
use crate::models::FileReport;
use crate::storage::FileStorage;

/// Prefix of the error recorded on beams whose run broke off.
pub const TRANSPORTER_ERROR: &str = "Transporter Error";

/// Serve one connection from handshake to completion.
pub async fn handle_connection<R, W>(
    reader: &mut R,
    writer: &mut W,
    storage: &FileStorage,
    reporter: &dyn OutcomeReporter,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let raw_id = read_beam_id(reader).await?;
    let beam_id =
        i64::try_from(raw_id).map_err(|_| ProtoError::unexpected("a beam id", raw_id))?;
    info!(beam_id, "Received beam up request");

    let mut run = BeamRun {
        beam_id,
        reader,
        writer,
        storage,
        reporter,
        version: ProtocolVersion::V1,
        closed: false,
    };
    let outcome = run.run().await;
    let closed = run.closed;

    match outcome {
        Ok(()) => {
            info!(beam_id, "Beam up completed");
            if !closed {
                reporter.complete_beam(beam_id, None).await?;
            }
            Ok(())
        }
        Err(BeamlineError::BeamNotFound(id)) => {
            warn!(beam_id, "Agent is beaming to unknown beam {}", id);
            Err(BeamlineError::BeamNotFound(id))
        }
        Err(why) => {
            error!(beam_id, "Beam up failed: {}", why);
            if !closed {
                let message = format!("{}: {}", TRANSPORTER_ERROR, why);
                if let Err(e) = reporter.complete_beam(beam_id, Some(message)).await {
                    error!(beam_id, "Cannot record failure: {}", e);
                }
            }
            Err(why)
        }
    }
}

struct BeamRun<'a, R, W> {
    beam_id: i64,
    reader: &'a mut R,
    writer: &'a mut W,
    storage: &'a FileStorage,
    reporter: &'a dyn OutcomeReporter,
    version: ProtocolVersion,
    /// Beam is pending deletion; files are refused and its state left alone
    closed: bool,
}

impl<R, W> BeamRun<'_, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(&mut self) -> Result<()> {
        loop {
            match read_message(self.reader).await? {
                ClientMessage::StartBeamingFile => self.beam_file().await?,
                ClientMessage::BeamComplete => return Ok(()),
                ClientMessage::ProtocolVersion(code) => {
                    self.version = ProtocolVersion::from_u16(code)?;
                    info!(beam_id = self.beam_id, "Client set the protocol version to {}", self.version);
                }
                other => {
                    return Err(ProtoError::unexpected("StartBeamingFile or BeamComplete", other).into())
                }
            }
        }
    }

    async fn beam_file(&mut self) -> Result<()> {
        let file_name = read_path(self.reader).await?;
        debug!(beam_id = self.beam_id, "File name is {}", file_name);

        let registration = match self.reporter.register_file(self.beam_id, &file_name).await {
            Ok(registration) => registration,
            Err(BeamlineError::BeamClosed(_)) => {
                warn!(beam_id = self.beam_id, "Beam is closed, refusing {}", file_name);
                self.closed = true;
                write_reply(self.writer, ServerReply::SkipFile).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !registration.should_beam {
            debug!(beam_id = self.beam_id, "Skipping {}, already beamed", file_name);
            write_reply(self.writer, ServerReply::SkipFile).await?;
            return Ok(());
        }
        write_reply(self.writer, ServerReply::BeamFile).await?;

        info!(
            beam_id = self.beam_id,
            "Beaming up {} to {}", file_name, registration.storage_name
        );
        match self.download(&registration.storage_name).await {
            Ok(report) => {
                info!(
                    beam_id = self.beam_id,
                    "Finished beaming up {} ({} bytes)",
                    file_name,
                    report.size.unwrap_or_default()
                );
                self.reporter.finish_file(registration.file_id, report).await?;
                write_reply(self.writer, ServerReply::FileBeamed).await?;
                Ok(())
            }
            Err(why) => {
                info!(beam_id = self.beam_id, "Error beaming up {}: {}", file_name, why);
                let failed = FileReport {
                    success: false,
                    size: None,
                    checksum: None,
                    mtime: None,
                };
                if let Err(e) = self.reporter.finish_file(registration.file_id, failed).await {
                    error!(beam_id = self.beam_id, "Cannot record failed file: {}", e);
                }
                Err(why)
            }
        }
    }

    async fn download(&mut self, storage_name: &str) -> Result<FileReport> {
        let mtime = if self.version.supports_mtime() {
            Some(read_mtime(self.reader).await?)
        } else {
            None
        };

        let mut file = self.storage.create(storage_name).await?;
        let mut checksum = Sha512::new();
        let mut size: u64 = 0;
        loop {
            match read_message(self.reader).await? {
                ClientMessage::FileChunk { len } => {
                    size += read_chunk_payload(self.reader, len, &mut file, |bytes| {
                        checksum.update(bytes)
                    })
                    .await?;
                }
                ClientMessage::FileDone => break,
                other => return Err(ProtoError::unexpected("FileChunk or FileDone", other).into()),
            }
        }
        file.flush().await?;

        Ok(FileReport {
            success: true,
            size: Some(i64::try_from(size).unwrap_or(i64::MAX)),
            checksum: Some(hex::encode(checksum.finalize())),
            mtime: mtime.and_then(|m| i64::try_from(m).ok()),
        })
    }
}
