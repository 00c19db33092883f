//! Beamline wire protocol
//!
//! The agent opens one TCP connection per run and streams a file tree to the
//! receiver. Every integer on the wire is fixed width and big-endian.
//!
//! ```text
//! agent                                   receiver
//!   u64 beam id                  ──────▶
//!   [v2] tag 4 + u16 version     ──────▶
//!   tag 1 + u16 len + path       ──────▶
//!                                ◀──────  0 SkipFile | 1 BeamFile
//!   [v2] u64 mtime               ──────▶
//!   tag 2 + u32 len + bytes ...  ──────▶
//!   tag 3                        ──────▶
//!                                ◀──────  2 FileBeamed
//!   tag 0                        ──────▶
//! ```

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{
    read_beam_id, read_chunk_payload, read_message, read_mtime, read_path, read_reply,
    write_beam_id, write_chunk, write_message, write_mtime, write_path, write_reply,
};
pub use error::{ProtoError, Result};
pub use message::{ClientMessage, ProtocolVersion, ServerReply};

/// Port the receiver listens on unless the agent is told otherwise.
pub const RECEIVER_PORT: u16 = 9000;

/// Largest chunk payload the receiver accepts in a single frame.
pub const MAX_CHUNK_LEN: u32 = 64 * 1024 * 1024;
