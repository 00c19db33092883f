//! SQLite backend implementation
//!
//! Persistent storage using SQLite with WAL mode for concurrency. Write
//! transactions start with a write so they take the database lock up front
//! instead of upgrading a read snapshot.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use super::{format_timestamp, parse_timestamp, storage_name, BeamStore};
use crate::error::{BeamlineError, Result};
use crate::models::{
    Beam, BeamFile, BeamType, FileRegistration, FileReport, FileStatus, Issue, NewBeam,
    RetentionFacts, TrackerKind, TrackerRecord,
};

const BEAM_COLUMNS: &str = "id, host, directory, initiator, type_id, started_at, completed_at, \
     size, completed, error, combadge_contacted, pending_deletion, deleted";

const FILE_COLUMNS: &str =
    "id, beam_id, file_name, storage_name, size, checksum, mtime, status, last_validated";

const LIVE_BEAMS: &str = "SELECT id FROM beams WHERE pending_deletion = 0 AND deleted = 0";

/// SQLite-backed beam store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a SQLite database and bring its schema up to date.
    pub async fn open(path: &str) -> Result<Self> {
        let db_url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite://{}", path)
        };

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Opened beam database at {}", db_url);

        Ok(Self { pool })
    }
}

fn opt_timestamp(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.as_deref().map(parse_timestamp).transpose()
}

fn decode_error(message: String) -> BeamlineError {
    BeamlineError::Database(sqlx::Error::Decode(message.into()))
}

fn row_to_beam(row: &SqliteRow) -> Result<Beam> {
    let started: String = row.try_get("started_at")?;
    Ok(Beam {
        id: row.try_get("id")?,
        host: row.try_get("host")?,
        directory: row.try_get("directory")?,
        initiator: row.try_get("initiator")?,
        type_id: row.try_get("type_id")?,
        started_at: parse_timestamp(&started)?,
        completed_at: opt_timestamp(row, "completed_at")?,
        size: row.try_get("size")?,
        completed: row.try_get("completed")?,
        error: row.try_get("error")?,
        combadge_contacted: row.try_get("combadge_contacted")?,
        pending_deletion: row.try_get("pending_deletion")?,
        deleted: row.try_get("deleted")?,
    })
}

fn row_to_file(row: &SqliteRow) -> Result<BeamFile> {
    let status: String = row.try_get("status")?;
    Ok(BeamFile {
        id: row.try_get("id")?,
        beam_id: row.try_get("beam_id")?,
        file_name: row.try_get("file_name")?,
        storage_name: row.try_get("storage_name")?,
        size: row.try_get("size")?,
        checksum: row.try_get("checksum")?,
        mtime: row.try_get("mtime")?,
        status: FileStatus::from_str(&status).map_err(decode_error)?,
        last_validated: opt_timestamp(row, "last_validated")?,
    })
}

fn row_to_issue(row: &SqliteRow) -> Result<Issue> {
    Ok(Issue {
        id: row.try_get("id")?,
        tracker_id: row.try_get("tracker_id")?,
        id_in_tracker: row.try_get("id_in_tracker")?,
        open: row.try_get("open")?,
    })
}

fn row_to_tracker(row: &SqliteRow) -> Result<TrackerRecord> {
    let kind: String = row.try_get("kind")?;
    let config: String = row.try_get("config")?;
    Ok(TrackerRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: TrackerKind::from_str(&kind).map_err(decode_error)?,
        url: row.try_get("url")?,
        config: serde_json::from_str(&config).map_err(|e| decode_error(e.to_string()))?,
    })
}

#[async_trait]
impl BeamStore for SqliteStore {
    async fn create_user(&self, name: &str) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO users (name) VALUES (?)
             ON CONFLICT (name) DO UPDATE SET name = excluded.name
             RETURNING id",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn create_beam_type(&self, name: &str, vacuum_threshold: i64) -> Result<BeamType> {
        let row = sqlx::query(
            "INSERT INTO beam_types (name, vacuum_threshold) VALUES (?, ?)
             ON CONFLICT (name) DO UPDATE SET vacuum_threshold = excluded.vacuum_threshold
             RETURNING id, name, vacuum_threshold",
        )
        .bind(name)
        .bind(vacuum_threshold)
        .fetch_one(&self.pool)
        .await?;

        Ok(BeamType {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            vacuum_threshold: row.try_get("vacuum_threshold")?,
        })
    }

    async fn create_beam(&self, new: NewBeam, now: DateTime<Utc>) -> Result<Beam> {
        let sql = format!(
            "INSERT INTO beams (host, directory, initiator, type_id, started_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {}",
            BEAM_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&new.host)
            .bind(&new.directory)
            .bind(new.initiator)
            .bind(new.type_id)
            .bind(format_timestamp(now))
            .fetch_one(&self.pool)
            .await?;
        let beam = row_to_beam(&row)?;
        debug!(beam_id = beam.id, "Created beam for {}:{}", beam.host, beam.directory);
        Ok(beam)
    }

    async fn get_beam(&self, beam_id: i64) -> Result<Beam> {
        let sql = format!("SELECT {} FROM beams WHERE id = ?", BEAM_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(beam_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BeamlineError::BeamNotFound(beam_id))?;
        row_to_beam(&row)
    }

    async fn set_beam_completed(
        &self,
        beam_id: i64,
        completed: bool,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Beam> {
        // The CASE sees the pre-update value of `completed`.
        let sql = format!(
            "UPDATE beams
             SET completed = ?,
                 error = ?,
                 completed_at = CASE
                     WHEN completed = ? THEN completed_at
                     WHEN ? THEN ?
                     ELSE NULL
                 END
             WHERE id = ?
             RETURNING {}",
            BEAM_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(completed)
            .bind(error)
            .bind(completed)
            .bind(completed)
            .bind(format_timestamp(now))
            .bind(beam_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BeamlineError::BeamNotFound(beam_id))?;
        row_to_beam(&row)
    }

    async fn live_beams(&self) -> Result<Vec<Beam>> {
        let sql = format!(
            "SELECT {} FROM beams WHERE pending_deletion = 0 AND deleted = 0 ORDER BY id",
            BEAM_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_beam).collect()
    }

    async fn set_beam_size(&self, beam_id: i64, size: i64) -> Result<()> {
        sqlx::query("UPDATE beams SET size = ? WHERE id = ?")
            .bind(size)
            .bind(beam_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn register_file(&self, beam_id: i64, file_name: &str) -> Result<FileRegistration> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            "UPDATE beams SET combadge_contacted = 1
             WHERE id = ? AND pending_deletion = 0 AND deleted = 0",
        )
        .bind(beam_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if touched == 0 {
            let exists = sqlx::query("SELECT 1 FROM beams WHERE id = ?")
                .bind(beam_id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            return Err(if exists {
                BeamlineError::BeamClosed(beam_id)
            } else {
                BeamlineError::BeamNotFound(beam_id)
            });
        }

        sqlx::query(
            "INSERT INTO files (beam_id, file_name, status) VALUES (?, ?, 'pending')
             ON CONFLICT (beam_id, file_name) DO NOTHING",
        )
        .bind(beam_id)
        .bind(file_name)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "SELECT id, storage_name, status FROM files WHERE beam_id = ? AND file_name = ?",
        )
        .bind(beam_id)
        .bind(file_name)
        .fetch_one(&mut *tx)
        .await?;

        let file_id: i64 = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let storage = match row.try_get::<Option<String>, _>("storage_name")? {
            Some(existing) => existing,
            None => {
                let assigned = storage_name(beam_id, file_id, file_name);
                sqlx::query("UPDATE files SET storage_name = ? WHERE id = ?")
                    .bind(&assigned)
                    .bind(file_id)
                    .execute(&mut *tx)
                    .await?;
                assigned
            }
        };

        tx.commit().await?;

        Ok(FileRegistration {
            file_id,
            storage_name: storage,
            should_beam: status != FileStatus::Uploaded.as_str(),
        })
    }

    async fn finish_file(&self, file_id: i64, report: FileReport) -> Result<()> {
        let status = if report.success {
            FileStatus::Uploaded
        } else {
            FileStatus::Failed
        };

        let mut tx = self.pool.begin().await?;

        let beam_id: i64 = sqlx::query(
            "UPDATE files SET size = ?, checksum = ?, mtime = ?, status = ?
             WHERE id = ?
             RETURNING beam_id",
        )
        .bind(report.size)
        .bind(&report.checksum)
        .bind(report.mtime)
        .bind(status.as_str())
        .bind(file_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BeamlineError::FileNotFound(file_id))?
        .try_get("beam_id")?;

        if let (true, Some(size)) = (report.success, report.size) {
            sqlx::query("UPDATE beams SET size = size + ? WHERE id = ?")
                .bind(size)
                .bind(beam_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_file(&self, file_id: i64) -> Result<BeamFile> {
        let sql = format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BeamlineError::FileNotFound(file_id))?;
        row_to_file(&row)
    }

    async fn files_for_beam(&self, beam_id: i64) -> Result<Vec<BeamFile>> {
        let sql = format!(
            "SELECT {} FROM files WHERE beam_id = ? ORDER BY file_name",
            FILE_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(beam_id).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_file).collect()
    }

    async fn set_file_size(&self, file_id: i64, size: i64) -> Result<()> {
        sqlx::query("UPDATE files SET size = ? WHERE id = ?")
            .bind(size)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn files_for_validation(&self, limit: u32) -> Result<Vec<BeamFile>> {
        let sql = format!(
            "SELECT {} FROM files
             WHERE beam_id IN ({})
               AND checksum IS NOT NULL
               AND storage_name IS NOT NULL
               AND status = 'uploaded'
             ORDER BY last_validated, id
             LIMIT ?",
            FILE_COLUMNS, LIVE_BEAMS
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_file).collect()
    }

    async fn mark_validated(&self, file_id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE files SET last_validated = ? WHERE id = ?")
            .bind(format_timestamp(now))
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pin(&self, user_id: i64, beam_id: i64) -> Result<()> {
        sqlx::query("INSERT INTO pins (user_id, beam_id) VALUES (?, ?) ON CONFLICT DO NOTHING")
            .bind(user_id)
            .bind(beam_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unpin(&self, user_id: i64, beam_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM pins WHERE user_id = ? AND beam_id = ?")
            .bind(user_id)
            .bind(beam_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_tag(&self, beam_id: i64, tag: &str) -> Result<()> {
        sqlx::query("INSERT INTO tags (beam_id, tag) VALUES (?, ?) ON CONFLICT DO NOTHING")
            .bind(beam_id)
            .bind(tag)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_tag(&self, beam_id: i64, tag: &str) -> Result<()> {
        sqlx::query("DELETE FROM tags WHERE beam_id = ? AND tag = ?")
            .bind(beam_id)
            .bind(tag)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn tags(&self, beam_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT tag FROM tags WHERE beam_id = ? ORDER BY tag")
            .bind(beam_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get::<String, _>("tag")).collect())
    }

    async fn create_tracker(
        &self,
        name: &str,
        kind: TrackerKind,
        url: &str,
        config: serde_json::Value,
    ) -> Result<TrackerRecord> {
        let row = sqlx::query(
            "INSERT INTO trackers (name, kind, url, config) VALUES (?, ?, ?, ?)
             RETURNING id, name, kind, url, config",
        )
        .bind(name)
        .bind(kind.as_str())
        .bind(url)
        .bind(config.to_string())
        .fetch_one(&self.pool)
        .await?;
        row_to_tracker(&row)
    }

    async fn trackers(&self) -> Result<Vec<TrackerRecord>> {
        let rows = sqlx::query("SELECT id, name, kind, url, config FROM trackers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_tracker).collect()
    }

    async fn attach_issue(
        &self,
        beam_id: i64,
        tracker_id: i64,
        id_in_tracker: &str,
    ) -> Result<Issue> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO issues (tracker_id, id_in_tracker, open) VALUES (?, ?, 1)
             ON CONFLICT (tracker_id, id_in_tracker) DO NOTHING",
        )
        .bind(tracker_id)
        .bind(id_in_tracker)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "SELECT id, tracker_id, id_in_tracker, open FROM issues
             WHERE tracker_id = ? AND id_in_tracker = ?",
        )
        .bind(tracker_id)
        .bind(id_in_tracker)
        .fetch_one(&mut *tx)
        .await?;
        let issue = row_to_issue(&row)?;

        sqlx::query(
            "INSERT INTO beam_issues (beam_id, issue_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(beam_id)
        .bind(issue.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(issue)
    }

    async fn detach_issue(&self, beam_id: i64, issue_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM beam_issues WHERE beam_id = ? AND issue_id = ?")
            .bind(beam_id)
            .bind(issue_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_issue_open(&self, issue_id: i64, open: bool) -> Result<()> {
        sqlx::query("UPDATE issues SET open = ? WHERE id = ?")
            .bind(open)
            .bind(issue_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn issues_of_live_beams(&self, tracker_id: i64) -> Result<Vec<Issue>> {
        let sql = format!(
            "SELECT id, tracker_id, id_in_tracker, open FROM issues
             WHERE tracker_id = ?
               AND id IN (SELECT issue_id FROM beam_issues WHERE beam_id IN ({}))
             ORDER BY id",
            LIVE_BEAMS
        );
        let rows = sqlx::query(&sql)
            .bind(tracker_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_issue).collect()
    }

    async fn time_out_silent_beams(
        &self,
        deadline: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "UPDATE beams SET completed = 1, completed_at = ?, error = ?
             WHERE completed = 0 AND combadge_contacted = 0 AND started_at < ?
             RETURNING id",
        )
        .bind(format_timestamp(now))
        .bind(error)
        .bind(format_timestamp(deadline))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get::<i64, _>("id")).collect())
    }

    async fn retention_facts(&self, beam_id: i64) -> Result<RetentionFacts> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM files WHERE beam_id = b.id) AS file_count,
                (SELECT COUNT(*) FROM pins WHERE beam_id = b.id) AS pin_count,
                (SELECT COUNT(*) FROM beam_issues bi JOIN issues i ON i.id = bi.issue_id
                  WHERE bi.beam_id = b.id AND i.open = 1) AS open_issue_count,
                t.vacuum_threshold AS type_threshold
             FROM beams b LEFT JOIN beam_types t ON t.id = b.type_id
             WHERE b.id = ?",
        )
        .bind(beam_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BeamlineError::BeamNotFound(beam_id))?;

        Ok(RetentionFacts {
            file_count: row.try_get("file_count")?,
            pin_count: row.try_get("pin_count")?,
            open_issue_count: row.try_get("open_issue_count")?,
            type_threshold: row.try_get("type_threshold")?,
        })
    }

    async fn flag_eligible_beams(
        &self,
        now: DateTime<Utc>,
        default_threshold_days: i64,
    ) -> Result<u64> {
        let flagged = sqlx::query(
            "UPDATE beams SET pending_deletion = 1
             WHERE pending_deletion = 0
               AND deleted = 0
               AND completed = 1
               AND NOT EXISTS (SELECT 1 FROM pins p WHERE p.beam_id = beams.id)
               AND NOT EXISTS (
                   SELECT 1 FROM beam_issues bi JOIN issues i ON i.id = bi.issue_id
                   WHERE bi.beam_id = beams.id AND i.open = 1)
               AND (
                   NOT EXISTS (SELECT 1 FROM files f WHERE f.beam_id = beams.id)
                   OR CAST(julianday(?) - julianday(started_at) AS INTEGER) >= COALESCE(
                       (SELECT t.vacuum_threshold FROM beam_types t WHERE t.id = beams.type_id),
                       ?)
               )",
        )
        .bind(format_timestamp(now))
        .bind(default_threshold_days)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(flagged)
    }

    async fn flag_for_deletion(&self, beam_id: i64) -> Result<bool> {
        let flagged = sqlx::query(
            "UPDATE beams SET pending_deletion = 1 WHERE id = ? AND pending_deletion = 0",
        )
        .bind(beam_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if flagged == 0 {
            // Distinguish "already flagged" from "no such beam".
            self.get_beam(beam_id).await?;
        }
        Ok(flagged > 0)
    }

    async fn beams_pending_purge(&self) -> Result<Vec<Beam>> {
        let sql = format!(
            "SELECT {} FROM beams WHERE pending_deletion = 1 AND deleted = 0 ORDER BY id",
            BEAM_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_beam).collect()
    }

    async fn mark_beam_deleted(&self, beam_id: i64) -> Result<()> {
        sqlx::query("UPDATE beams SET deleted = 1 WHERE id = ? AND pending_deletion = 1")
            .bind(beam_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn files_of_deleted_beams(&self) -> Result<Vec<BeamFile>> {
        let sql = format!(
            "SELECT {} FROM files
             WHERE storage_name IS NOT NULL
               AND beam_id IN (SELECT id FROM beams WHERE deleted = 1)
             ORDER BY id",
            FILE_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_file).collect()
    }
}
