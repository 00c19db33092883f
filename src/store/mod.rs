//! Persistence for beams, files and the retention signals attached to them
//!
//! Every operation is a single statement or a single transaction, so two
//! concurrent writers never observe a half-applied change to one beam.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{BeamlineError, Result};
use crate::models::{
    Beam, BeamFile, BeamType, FileRegistration, FileReport, Issue, NewBeam, RetentionFacts,
    TrackerKind, TrackerRecord,
};

pub use sqlite::SqliteStore;

/// Number of shard directories the physical store fans out into.
pub const SHARD_BUCKETS: i64 = 1000;

/// Storage name for a file: `"<beam % 1000>/<file id>-<flattened name>"`.
pub fn storage_name(beam_id: i64, file_id: i64, file_name: &str) -> String {
    format!(
        "{}/{}-{}",
        beam_id.rem_euclid(SHARD_BUCKETS),
        file_id,
        file_name.replace(['/', '\\'], "__")
    )
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// UTC timestamp in a form SQLite's date functions understand.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| BeamlineError::Database(sqlx::Error::Decode(Box::new(e))))
}

#[async_trait]
pub trait BeamStore: Send + Sync {
    async fn create_user(&self, name: &str) -> Result<i64>;

    async fn create_beam_type(&self, name: &str, vacuum_threshold: i64) -> Result<BeamType>;

    async fn create_beam(&self, new: NewBeam, now: DateTime<Utc>) -> Result<Beam>;

    /// Fails with `BeamNotFound` for unknown ids.
    async fn get_beam(&self, beam_id: i64) -> Result<Beam>;

    /// Record the terminal outcome of a transfer.
    ///
    /// Completion time is only touched when the flag actually flips.
    async fn set_beam_completed(
        &self,
        beam_id: i64,
        completed: bool,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Beam>;

    /// Beams neither pending deletion nor deleted.
    async fn live_beams(&self) -> Result<Vec<Beam>>;

    async fn set_beam_size(&self, beam_id: i64, size: i64) -> Result<()>;

    /// Look up or create the file row for `file_name`, assigning its storage
    /// name on first sight and marking the beam as contacted.
    async fn register_file(&self, beam_id: i64, file_name: &str) -> Result<FileRegistration>;

    /// Record the outcome of one upload attempt.
    async fn finish_file(&self, file_id: i64, report: FileReport) -> Result<()>;

    async fn get_file(&self, file_id: i64) -> Result<BeamFile>;

    async fn files_for_beam(&self, beam_id: i64) -> Result<Vec<BeamFile>>;

    async fn set_file_size(&self, file_id: i64, size: i64) -> Result<()>;

    /// Uploaded files of live beams with a checksum, least recently validated first.
    async fn files_for_validation(&self, limit: u32) -> Result<Vec<BeamFile>>;

    async fn mark_validated(&self, file_id: i64, now: DateTime<Utc>) -> Result<()>;

    async fn pin(&self, user_id: i64, beam_id: i64) -> Result<()>;

    async fn unpin(&self, user_id: i64, beam_id: i64) -> Result<()>;

    async fn add_tag(&self, beam_id: i64, tag: &str) -> Result<()>;

    async fn remove_tag(&self, beam_id: i64, tag: &str) -> Result<()>;

    async fn tags(&self, beam_id: i64) -> Result<Vec<String>>;

    async fn create_tracker(
        &self,
        name: &str,
        kind: TrackerKind,
        url: &str,
        config: serde_json::Value,
    ) -> Result<TrackerRecord>;

    async fn trackers(&self) -> Result<Vec<TrackerRecord>>;

    /// Associate an issue with a beam, creating the issue (open) if new.
    async fn attach_issue(&self, beam_id: i64, tracker_id: i64, id_in_tracker: &str)
        -> Result<Issue>;

    async fn detach_issue(&self, beam_id: i64, issue_id: i64) -> Result<()>;

    async fn set_issue_open(&self, issue_id: i64, open: bool) -> Result<()>;

    /// Issues of `tracker_id` attached to at least one live beam.
    async fn issues_of_live_beams(&self, tracker_id: i64) -> Result<Vec<Issue>>;

    /// Fail beams whose agent never made contact and that started before
    /// `deadline`. Returns the affected ids.
    async fn time_out_silent_beams(
        &self,
        deadline: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>>;

    async fn retention_facts(&self, beam_id: i64) -> Result<RetentionFacts>;

    /// Flag every currently eligible beam as pending deletion in one statement.
    async fn flag_eligible_beams(&self, now: DateTime<Utc>, default_threshold_days: i64)
        -> Result<u64>;

    /// Flag one beam for deletion regardless of eligibility.
    ///
    /// Returns false when the beam was already flagged.
    async fn flag_for_deletion(&self, beam_id: i64) -> Result<bool>;

    /// Beams pending deletion whose purge has not finished.
    async fn beams_pending_purge(&self) -> Result<Vec<Beam>>;

    async fn mark_beam_deleted(&self, beam_id: i64) -> Result<()>;

    /// Files with a storage name that belong to deleted beams.
    async fn files_of_deleted_beams(&self) -> Result<Vec<BeamFile>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_storage_name_shards_and_flattens() {
        assert_eq!(storage_name(1234, 7, "./a/b.log.gz"), "234/7-.__a__b.log.gz");
        assert_eq!(storage_name(5, 8, ".\\c\\d.txt"), "5/8-.__c__d.txt");
        assert_eq!(storage_name(2000, 1, "x"), "0/1-x");
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 58).unwrap();
        let text = format_timestamp(ts);
        assert_eq!(text, "2024-02-29 23:59:58.000");
        assert_eq!(parse_timestamp(&text).unwrap(), ts);
    }

    #[test]
    fn test_bad_timestamp_is_a_decode_error() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(BeamlineError::Database(sqlx::Error::Decode(_)))
        ));
    }
}
