//! Message tags exchanged on a beam connection

use crate::error::{ProtoError, Result};

/// A message sent by the agent, as seen after its one-byte tag.
///
/// `FileChunk` only carries the announced length; the payload follows on the
/// wire and is consumed with [`crate::read_chunk_payload`] so that the
/// receiver never needs to hold a whole chunk in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    BeamComplete,
    StartBeamingFile,
    FileChunk { len: u32 },
    FileDone,
    ProtocolVersion(u16),
}

impl ClientMessage {
    pub const BEAM_COMPLETE: u8 = 0;
    pub const START_BEAMING_FILE: u8 = 1;
    pub const FILE_CHUNK: u8 = 2;
    pub const FILE_DONE: u8 = 3;
    pub const PROTOCOL_VERSION: u8 = 4;

    pub fn tag(&self) -> u8 {
        match self {
            ClientMessage::BeamComplete => Self::BEAM_COMPLETE,
            ClientMessage::StartBeamingFile => Self::START_BEAMING_FILE,
            ClientMessage::FileChunk { .. } => Self::FILE_CHUNK,
            ClientMessage::FileDone => Self::FILE_DONE,
            ClientMessage::ProtocolVersion(_) => Self::PROTOCOL_VERSION,
        }
    }
}

/// One-byte replies sent by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerReply {
    SkipFile = 0,
    BeamFile = 1,
    FileBeamed = 2,
}

impl ServerReply {
    pub fn from_u8(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ServerReply::SkipFile),
            1 => Ok(ServerReply::BeamFile),
            2 => Ok(ServerReply::FileBeamed),
            other => Err(ProtoError::InvalidServerReply(other)),
        }
    }
}

/// Protocol generations understood by both ends.
///
/// Version 1 connections never announce themselves and carry no mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn from_u16(code: u16) -> Result<Self> {
        match code {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            other => Err(ProtoError::InvalidProtocolVersion(other)),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }

    pub fn supports_mtime(self) -> bool {
        self >= ProtocolVersion::V2
    }

    /// Whether the agent announces the version right after the beam id.
    pub fn announces_version(self) -> bool {
        self >= ProtocolVersion::V2
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u16())
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim().trim_start_matches(['v', 'V']);
        let code = digits
            .parse::<u16>()
            .map_err(|_| ProtoError::InvalidProtocolVersion(0))?;
        Self::from_u16(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_codes() {
        assert_eq!(ServerReply::from_u8(0).unwrap(), ServerReply::SkipFile);
        assert_eq!(ServerReply::from_u8(1).unwrap(), ServerReply::BeamFile);
        assert_eq!(ServerReply::from_u8(2).unwrap(), ServerReply::FileBeamed);
        assert!(matches!(
            ServerReply::from_u8(7),
            Err(ProtoError::InvalidServerReply(7))
        ));
    }

    #[test]
    fn test_version_capabilities() {
        assert!(!ProtocolVersion::V1.supports_mtime());
        assert!(!ProtocolVersion::V1.announces_version());
        assert!(ProtocolVersion::V2.supports_mtime());
        assert!(ProtocolVersion::V2.announces_version());
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!("v2".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V2);
        assert_eq!("1".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V1);
        assert!("v9".parse::<ProtocolVersion>().is_err());
        assert!("latest".parse::<ProtocolVersion>().is_err());
        assert_eq!(ProtocolVersion::V2.to_string(), "v2");
    }
}
