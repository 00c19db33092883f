//! Agent side of the beam protocol

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use beamline_proto::{
    read_reply, write_beam_id, write_chunk, write_message, write_mtime, write_path,
    ClientMessage, ProtoError, ProtocolVersion, ServerReply, RECEIVER_PORT,
};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

use crate::compress::{should_compress, store_path, ChunkEncoder};
use crate::error::Result;

/// Size of the blocks read from disk before encoding.
const CHUNK_SIZE: usize = 128 * 1024;

/// Where and what to beam.
#[derive(Debug, Clone)]
pub struct BeamTarget {
    pub beam_id: u64,
    pub path: PathBuf,
    pub receiver: String,
    pub version: ProtocolVersion,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BeamSummary {
    pub beamed: usize,
    pub skipped: usize,
    pub ignored: usize,
}

enum FileOutcome {
    Beamed,
    Skipped,
}

/// Append the default receiver port unless one is given.
pub fn receiver_address(receiver: &str) -> String {
    if receiver.parse::<std::net::SocketAddr>().is_ok() {
        return receiver.to_string();
    }
    match receiver.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            receiver.to_string()
        }
        _ if receiver.contains(':') => format!("[{}]:{}", receiver, RECEIVER_PORT),
        _ => format!("{}:{}", receiver, RECEIVER_PORT),
    }
}

/// Run one complete beam over a fresh connection.
pub async fn beam_up(target: &BeamTarget) -> Result<BeamSummary> {
    let address = receiver_address(&target.receiver);
    debug!(beam_id = target.beam_id, %address, "Connecting to receiver");
    let stream = TcpStream::connect(&address).await?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let summary = beam_over(&mut reader, &mut writer, target).await?;
    writer.shutdown().await?;
    Ok(summary)
}

/// Run the protocol over an already established byte stream.
pub async fn beam_over<R, W>(reader: &mut R, writer: &mut W, target: &BeamTarget) -> Result<BeamSummary>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_beam_id(writer, target.beam_id).await?;
    if target.version.announces_version() {
        write_message(writer, ClientMessage::ProtocolVersion(target.version.as_u16())).await?;
    }

    let mut summary = BeamSummary::default();
    let root = target.path.as_path();

    if root.is_file() {
        let outcome = beam_file(reader, writer, target.version, root.parent(), root).await?;
        summary.record(outcome);
    } else if root.is_dir() {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Cannot read directory entry: {}", e);
                    continue;
                }
            };
            let file_type = entry.file_type();
            if file_type.is_file() {
                let outcome =
                    beam_file(reader, writer, target.version, Some(root), entry.path()).await?;
                summary.record(outcome);
            } else if !file_type.is_dir() {
                info!("Skipping non-regular file {}", entry.path().display());
                summary.ignored += 1;
            }
        }
    } else if root.exists() {
        warn!("Path is neither a file nor a directory: {}", root.display());
    } else {
        warn!("Path does not exist: {}", root.display());
    }

    write_message(writer, ClientMessage::BeamComplete).await?;
    writer.flush().await?;
    info!(
        beam_id = target.beam_id,
        beamed = summary.beamed,
        skipped = summary.skipped,
        "Beam complete"
    );
    Ok(summary)
}

impl BeamSummary {
    fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Beamed => self.beamed += 1,
            FileOutcome::Skipped => self.skipped += 1,
        }
    }
}

fn mtime_secs(path: &Path) -> std::io::Result<u64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0))
}

async fn beam_file<R, W>(
    reader: &mut R,
    writer: &mut W,
    version: ProtocolVersion,
    base: Option<&Path>,
    path: &Path,
) -> Result<FileOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let compressed = should_compress(path);
    let logical = store_path(path, base, compressed);
    debug!("Beaming {} as {}", path.display(), logical);

    write_message(writer, ClientMessage::StartBeamingFile).await?;
    write_path(writer, &logical).await?;
    writer.flush().await?;

    match read_reply(reader).await? {
        ServerReply::BeamFile => trace!("Receiver wants {}", logical),
        ServerReply::SkipFile => {
            info!("Receiver asks to skip {}", logical);
            return Ok(FileOutcome::Skipped);
        }
        other => return Err(ProtoError::unexpected("BeamFile or SkipFile", other).into()),
    }

    if version.supports_mtime() {
        write_mtime(writer, mtime_secs(path)?).await?;
    }

    let mut file = File::open(path).await?;
    let mut encoder = ChunkEncoder::new(compressed, CHUNK_SIZE);
    let mut block = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut block).await?;
        if read == 0 {
            break;
        }
        let payload = encoder.encode(&block[..read])?;
        if !payload.is_empty() {
            write_chunk(writer, payload).await?;
        }
    }
    let tail = encoder.finish()?;
    if !tail.is_empty() {
        write_chunk(writer, &tail).await?;
    }

    write_message(writer, ClientMessage::FileDone).await?;
    writer.flush().await?;

    match read_reply(reader).await? {
        ServerReply::FileBeamed => {
            debug!("Receiver stored {}", logical);
            Ok(FileOutcome::Beamed)
        }
        other => Err(ProtoError::unexpected("FileBeamed", other).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_address_defaults_port() {
        assert_eq!(receiver_address("scotty"), "scotty:9000");
        assert_eq!(receiver_address("10.0.0.5"), "10.0.0.5:9000");
    }

    #[test]
    fn test_receiver_address_keeps_explicit_port() {
        assert_eq!(receiver_address("scotty:9100"), "scotty:9100");
        assert_eq!(receiver_address("127.0.0.1:40000"), "127.0.0.1:40000");
        assert_eq!(receiver_address("[::1]:9100"), "[::1]:9100");
    }

    #[test]
    fn test_receiver_address_bare_ipv6() {
        assert_eq!(receiver_address("::1"), "[::1]:9000");
    }
}
