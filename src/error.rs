/*!
 * Error types for Beamline
 */

use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BeamlineError>;

#[derive(Error, Debug)]
pub enum BeamlineError {
    /// Remote host rejected the supplied credentials
    #[error("Authentication failed for {user}@{host}: {reason}")]
    Authentication {
        host: String,
        user: String,
        reason: String,
    },

    /// Remote command exited with a non-zero status
    #[error("Command `{command}` failed with exit status {status}\nstdout: {stdout}\nstderr: {stderr}")]
    RemoteCommand {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    /// Could not reach or keep talking to a remote host
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The peer violated the beam protocol
    #[error("Protocol error: {0}")]
    Protocol(#[from] beamline_proto::ProtoError),

    /// No usable agent artifact, or the upload failed
    #[error("Deployment error: {0}")]
    Deployment(String),

    /// A remote file was expected but is not there
    #[error("Remote file not found: {0}")]
    RemoteFileMissing(String),

    /// Physical store failure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Issue tracker refresh or lookup failed
    #[error("Tracker error: {0}")]
    Tracker(String),

    #[error("Beam {0} not found")]
    BeamNotFound(i64),

    #[error("File {0} not found")]
    FileNotFound(i64),

    /// Beam is pending deletion or deleted and accepts no more files
    #[error("Beam {0} is closed for new files")]
    BeamClosed(i64),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BeamlineError {
    pub fn is_auth_error(&self) -> bool {
        matches!(self, BeamlineError::Authentication { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            BeamlineError::Authentication { .. } => ErrorCategory::Security,
            BeamlineError::RemoteCommand { .. } | BeamlineError::Connectivity(_) => {
                ErrorCategory::Network
            }
            BeamlineError::Protocol(_) => ErrorCategory::Protocol,
            BeamlineError::Deployment(_) | BeamlineError::RemoteFileMissing(_) => {
                ErrorCategory::Deployment
            }
            BeamlineError::Storage(_) | BeamlineError::Io(_) => ErrorCategory::Storage,
            BeamlineError::Database(_) | BeamlineError::Migration(_) => ErrorCategory::Database,
            BeamlineError::Config(_) => ErrorCategory::Configuration,
            BeamlineError::Tracker(_) => ErrorCategory::Tracker,
            BeamlineError::BeamNotFound(_)
            | BeamlineError::FileNotFound(_)
            | BeamlineError::BeamClosed(_) => ErrorCategory::Integrity,
        }
    }
}

/// Error categories for classification and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Security,
    Network,
    Protocol,
    Deployment,
    Storage,
    Database,
    Configuration,
    Tracker,
    Integrity,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Security => "security",
            ErrorCategory::Network => "network",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Deployment => "deployment",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Database => "database",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Tracker => "tracker",
            ErrorCategory::Integrity => "integrity",
        };
        write!(f, "{}", name)
    }
}
