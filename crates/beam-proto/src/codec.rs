//! Async framing helpers for both ends of a beam connection

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtoError, Result};
use crate::message::{ClientMessage, ServerReply};
use crate::MAX_CHUNK_LEN;

/// Receive buffer used while draining chunk payloads.
const READ_BUFFER: usize = 1024 * 1024;

fn eof_aware(err: std::io::Error) -> ProtoError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtoError::UnexpectedEof
    } else {
        ProtoError::Io(err)
    }
}

pub async fn write_beam_id<W: AsyncWrite + Unpin>(writer: &mut W, beam_id: u64) -> Result<()> {
    writer.write_u64(beam_id).await?;
    Ok(())
}

pub async fn read_beam_id<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64> {
    reader.read_u64().await.map_err(eof_aware)
}

/// Write a client message tag and its fixed-size payload.
///
/// For `FileChunk` only the frame header is written; use [`write_chunk`]
/// to send header and bytes together.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: ClientMessage,
) -> Result<()> {
    writer.write_u8(message.tag()).await?;
    match message {
        ClientMessage::FileChunk { len } => writer.write_u32(len).await?,
        ClientMessage::ProtocolVersion(version) => writer.write_u16(version).await?,
        ClientMessage::BeamComplete | ClientMessage::StartBeamingFile | ClientMessage::FileDone => {}
    }
    Ok(())
}

/// Read a client message tag and its fixed-size payload.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ClientMessage> {
    let tag = reader.read_u8().await.map_err(eof_aware)?;
    let message = match tag {
        ClientMessage::BEAM_COMPLETE => ClientMessage::BeamComplete,
        ClientMessage::START_BEAMING_FILE => ClientMessage::StartBeamingFile,
        ClientMessage::FILE_CHUNK => {
            let len = reader.read_u32().await.map_err(eof_aware)?;
            if len > MAX_CHUNK_LEN {
                return Err(ProtoError::ChunkTooLarge(len));
            }
            ClientMessage::FileChunk { len }
        }
        ClientMessage::FILE_DONE => ClientMessage::FileDone,
        ClientMessage::PROTOCOL_VERSION => {
            ClientMessage::ProtocolVersion(reader.read_u16().await.map_err(eof_aware)?)
        }
        other => return Err(ProtoError::InvalidClientMessage(other)),
    };
    Ok(message)
}

/// Write a `FileChunk` frame carrying `data`.
pub async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| ProtoError::ChunkTooLarge(u32::MAX))?;
    write_message(writer, ClientMessage::FileChunk { len }).await?;
    writer.write_all(data).await?;
    Ok(())
}

/// Drain `len` payload bytes into `sink`, handing each piece to `observe`.
///
/// Returns the number of bytes copied.
pub async fn read_chunk_payload<R, W, F>(
    reader: &mut R,
    len: u32,
    sink: &mut W,
    mut observe: F,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&[u8]),
{
    let mut remaining = len as usize;
    let mut buffer = vec![0u8; remaining.min(READ_BUFFER)];
    while remaining > 0 {
        let want = remaining.min(buffer.len());
        let read = reader.read(&mut buffer[..want]).await?;
        if read == 0 {
            return Err(ProtoError::UnexpectedEof);
        }
        observe(&buffer[..read]);
        sink.write_all(&buffer[..read]).await?;
        remaining -= read;
    }
    Ok(len as u64)
}

/// Write a two-byte length prefixed UTF-8 path.
pub async fn write_path<W: AsyncWrite + Unpin>(writer: &mut W, path: &str) -> Result<()> {
    let len = u16::try_from(path.len()).map_err(|_| ProtoError::PathTooLong(path.len()))?;
    writer.write_u16(len).await?;
    writer.write_all(path.as_bytes()).await?;
    Ok(())
}

pub async fn read_path<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u16().await.map_err(eof_aware)? as usize;
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw).await.map_err(eof_aware)?;
    String::from_utf8(raw).map_err(|_| ProtoError::InvalidPathEncoding)
}

/// Modification time in whole seconds since the Unix epoch.
pub async fn write_mtime<W: AsyncWrite + Unpin>(writer: &mut W, mtime: u64) -> Result<()> {
    writer.write_u64(mtime).await?;
    Ok(())
}

pub async fn read_mtime<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64> {
    reader.read_u64().await.map_err(eof_aware)
}

pub async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: ServerReply) -> Result<()> {
    writer.write_u8(reply as u8).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ServerReply> {
    let code = reader.read_u8().await.map_err(eof_aware)?;
    ServerReply::from_u8(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_header_layout_is_big_endian() {
        let mut wire = Vec::new();
        write_beam_id(&mut wire, 0x0102).await.unwrap();
        write_message(&mut wire, ClientMessage::ProtocolVersion(2))
            .await
            .unwrap();
        write_message(&mut wire, ClientMessage::StartBeamingFile)
            .await
            .unwrap();
        write_path(&mut wire, "./a").await.unwrap();

        assert_eq!(
            wire,
            vec![0, 0, 0, 0, 0, 0, 1, 2, 4, 0, 2, 1, 0, 3, b'.', b'/', b'a']
        );
    }

    #[tokio::test]
    async fn test_chunk_frame_streams_into_sink() {
        let (mut agent, mut receiver) = duplex(64);
        let payload: Vec<u8> = (0..200u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            write_chunk(&mut agent, &payload).await.unwrap();
            write_message(&mut agent, ClientMessage::FileDone)
                .await
                .unwrap();
        });

        let header = read_message(&mut receiver).await.unwrap();
        assert_eq!(header, ClientMessage::FileChunk { len: 200 });

        let mut sink = Vec::new();
        let mut observed = 0usize;
        let copied = read_chunk_payload(&mut receiver, 200, &mut sink, |piece| {
            observed += piece.len()
        })
        .await
        .unwrap();

        assert_eq!(copied, 200);
        assert_eq!(observed, 200);
        assert_eq!(sink, expected);
        assert_eq!(
            read_message(&mut receiver).await.unwrap(),
            ClientMessage::FileDone
        );
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tag_is_rejected() {
        let wire = vec![9u8];
        let err = read_message(&mut wire.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtoError::InvalidClientMessage(9)));
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_rejected() {
        let mut wire = vec![ClientMessage::FILE_CHUNK];
        wire.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = read_message(&mut wire.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtoError::ChunkTooLarge(_)));
    }

    #[tokio::test]
    async fn test_truncated_path_reports_eof() {
        let wire = vec![0u8, 10, b'x'];
        let err = read_path(&mut wire.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_truncated_chunk_reports_eof() {
        let wire = vec![1u8, 2, 3];
        let mut sink = Vec::new();
        let err = read_chunk_payload(&mut wire.as_slice(), 10, &mut sink, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedEof));
        assert_eq!(sink, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_path_rejects_invalid_utf8() {
        let wire = vec![0u8, 2, 0xff, 0xfe];
        let err = read_path(&mut wire.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtoError::InvalidPathEncoding));
    }
}
