//! Protocol error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtoError>;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("Invalid client message code: {0}")]
    InvalidClientMessage(u8),

    #[error("Invalid server reply code: {0}")]
    InvalidServerReply(u8),

    #[error("Unsupported protocol version: {0}")]
    InvalidProtocolVersion(u16),

    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: String,
    },

    #[error("Path is too long for the wire format ({0} bytes)")]
    PathTooLong(usize),

    #[error("Chunk of {0} bytes exceeds the frame limit")]
    ChunkTooLarge(u32),

    #[error("Path is not valid UTF-8")]
    InvalidPathEncoding,

    #[error("Peer closed the connection mid-frame")]
    UnexpectedEof,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    /// Build an `UnexpectedMessage` from anything debug-printable.
    pub fn unexpected(expected: &'static str, actual: impl std::fmt::Debug) -> Self {
        ProtoError::UnexpectedMessage {
            expected,
            actual: format!("{:?}", actual),
        }
    }
}
