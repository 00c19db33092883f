//! Beam, file and retention-related records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One file-collection transfer plus its retention record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beam {
    pub id: i64,
    pub host: String,
    pub directory: String,
    pub initiator: Option<i64>,
    pub type_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub size: i64,
    pub completed: bool,
    pub error: Option<String>,
    pub combadge_contacted: bool,
    pub pending_deletion: bool,
    pub deleted: bool,
}

/// Lifecycle state derived from the persisted flags.
///
/// `Created` and `Beaming` are not stored separately: a beam that is not
/// completed and carries no error is considered to be beaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeamState {
    Beaming,
    Completed,
    Failed,
    PendingDeletion,
    Deleted,
}

impl Beam {
    pub fn state(&self) -> BeamState {
        if self.deleted {
            BeamState::Deleted
        } else if self.pending_deletion {
            BeamState::PendingDeletion
        } else if self.completed && self.error.is_some() {
            BeamState::Failed
        } else if self.completed {
            BeamState::Completed
        } else {
            BeamState::Beaming
        }
    }

    /// Whole days elapsed since the beam started.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_days()
    }
}

/// Parameters for a new beam row.
#[derive(Debug, Clone, Default)]
pub struct NewBeam {
    pub host: String,
    pub directory: String,
    pub initiator: Option<i64>,
    pub type_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Uploaded,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Uploaded => "uploaded",
            FileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "uploaded" => Ok(FileStatus::Uploaded),
            "failed" => Ok(FileStatus::Failed),
            other => Err(format!("Unknown file status: {}", other)),
        }
    }
}

/// A member of a beam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamFile {
    pub id: i64,
    pub beam_id: i64,
    pub file_name: String,
    pub storage_name: Option<String>,
    pub size: Option<i64>,
    pub checksum: Option<String>,
    pub mtime: Option<i64>,
    pub status: FileStatus,
    pub last_validated: Option<DateTime<Utc>>,
}

/// Answer to a file negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRegistration {
    pub file_id: i64,
    pub storage_name: String,
    pub should_beam: bool,
}

/// What the receiver learned while storing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub success: bool,
    pub size: Option<i64>,
    pub checksum: Option<String>,
    pub mtime: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeamType {
    pub id: i64,
    pub name: String,
    pub vacuum_threshold: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub tracker_id: i64,
    pub id_in_tracker: String,
    pub open: bool,
}

/// Issue tracker flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    /// JSON file mapping issue ids to their open state
    File,
    /// REST issue service (Jira compatible)
    IssueService,
    /// Always fails; used to exercise error paths
    Faulty,
}

impl TrackerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerKind::File => "file",
            TrackerKind::IssueService => "issue_service",
            TrackerKind::Faulty => "faulty",
        }
    }
}

impl FromStr for TrackerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(TrackerKind::File),
            "issue_service" | "jira" => Ok(TrackerKind::IssueService),
            "faulty" => Ok(TrackerKind::Faulty),
            other => Err(format!("Unknown tracker kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerRecord {
    pub id: i64,
    pub name: String,
    pub kind: TrackerKind,
    pub url: String,
    /// Kind-specific settings as a JSON object
    pub config: serde_json::Value,
}

/// Everything retention needs to know about one beam besides its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionFacts {
    pub file_count: i64,
    pub pin_count: i64,
    pub open_issue_count: i64,
    /// Type-specific threshold, if the beam has a type
    pub type_threshold: Option<i64>,
}
