//! Retention engine (vacuum)
//!
//! A vacuum run first flags every eligible beam in one set-based update,
//! then purges each flagged beam on its own. Purging a beam removes its
//! stored files and only then marks it deleted, so an interrupted run is
//! picked up by the next one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::models::{Beam, RetentionFacts};
use crate::storage::FileStorage;
use crate::store::BeamStore;

/// Days until `beam` becomes eligible for deletion.
///
/// `None` while the beam is running, pinned, or linked to an open issue.
pub fn purge_time(
    beam: &Beam,
    facts: &RetentionFacts,
    now: DateTime<Utc>,
    default_threshold_days: i64,
) -> Option<i64> {
    if beam.pending_deletion || beam.deleted {
        return Some(0);
    }
    if !beam.completed || facts.pin_count > 0 || facts.open_issue_count > 0 {
        return None;
    }
    if facts.file_count == 0 {
        return Some(0);
    }
    let threshold = facts.type_threshold.unwrap_or(default_threshold_days);
    Some((threshold - beam.age_days(now)).max(0))
}

/// Outcome of one vacuum run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VacuumReport {
    /// Beams newly flagged by this run
    pub flagged: u64,
    /// Beams whose purge finished
    pub purged: Vec<i64>,
    /// Beams left pending because their purge failed
    pub failed: Vec<i64>,
}

pub struct RetentionEngine {
    store: Arc<dyn BeamStore>,
    storage: FileStorage,
    default_threshold_days: i64,
}

impl RetentionEngine {
    pub fn new(store: Arc<dyn BeamStore>, storage: FileStorage, default_threshold_days: i64) -> Self {
        Self {
            store,
            storage,
            default_threshold_days,
        }
    }

    /// Flag eligible beams and purge everything pending deletion.
    pub async fn vacuum(&self, now: DateTime<Utc>) -> Result<VacuumReport> {
        info!("Vacuum initiated");
        // an unmounted store would make every file look already gone
        self.storage.probe().await?;

        let flagged = self
            .store
            .flag_eligible_beams(now, self.default_threshold_days)
            .await?;
        info!("Flagged {} beams for deletion", flagged);

        let mut report = VacuumReport {
            flagged,
            ..Default::default()
        };
        for beam in self.store.beams_pending_purge().await? {
            match self.purge(&beam).await {
                Ok(()) => report.purged.push(beam.id),
                Err(e) => {
                    error!(beam_id = beam.id, "Vacuum failed: {}", e);
                    report.failed.push(beam.id);
                }
            }
        }

        info!(
            "Vacuum done: {} purged, {} failed",
            report.purged.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Delete one beam on request, whatever its retention state.
    ///
    /// Deleting a beam that is already gone is a no-op.
    pub async fn delete_beam(&self, beam_id: i64) -> Result<()> {
        self.storage.probe().await?;
        if self.store.flag_for_deletion(beam_id).await? {
            info!(beam_id, "Beam flagged for deletion on request");
        }
        let beam = self.store.get_beam(beam_id).await?;
        if beam.deleted {
            return Ok(());
        }
        self.purge(&beam).await
    }

    async fn purge(&self, beam: &Beam) -> Result<()> {
        info!(beam_id = beam.id, "Vacuuming");
        let mut removed = 0usize;
        for file in self.store.files_for_beam(beam.id).await? {
            let Some(storage_name) = file.storage_name.as_deref() else {
                continue;
            };
            if self.storage.remove(storage_name).await? {
                removed += 1;
            }
        }
        self.store.mark_beam_deleted(beam.id).await?;
        info!(beam_id = beam.id, "Vacuumed successfully ({} files removed)", removed);
        Ok(())
    }

    /// Remove files of deleted beams that are somehow still on disk.
    pub async fn vacuum_check(&self) -> Result<usize> {
        let mut leftovers = 0;
        for file in self.store.files_of_deleted_beams().await? {
            let Some(storage_name) = file.storage_name.as_deref() else {
                continue;
            };
            if self.storage.remove(storage_name).await? {
                warn!(beam_id = file.beam_id, "{} still existed", storage_name);
                leftovers += 1;
            }
        }
        Ok(leftovers)
    }

    pub async fn purge_time(&self, beam_id: i64, now: DateTime<Utc>) -> Result<Option<i64>> {
        let beam = self.store.get_beam(beam_id).await?;
        let facts = self.store.retention_facts(beam_id).await?;
        Ok(purge_time(&beam, &facts, now, self.default_threshold_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn completed_beam(started_at: DateTime<Utc>) -> Beam {
        Beam {
            id: 1,
            host: "host".into(),
            directory: "/".into(),
            initiator: None,
            type_id: None,
            started_at,
            completed_at: Some(started_at),
            size: 0,
            completed: true,
            error: None,
            combadge_contacted: true,
            pending_deletion: false,
            deleted: false,
        }
    }

    fn facts(file_count: i64) -> RetentionFacts {
        RetentionFacts {
            file_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_purge_time_counts_down() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let beam = completed_beam(start);
        assert_eq!(purge_time(&beam, &facts(3), start, 60), Some(60));
        assert_eq!(purge_time(&beam, &facts(3), start + Duration::days(59), 60), Some(1));
        assert_eq!(purge_time(&beam, &facts(3), start + Duration::days(60), 60), Some(0));
        assert_eq!(purge_time(&beam, &facts(3), start + Duration::days(400), 60), Some(0));
    }

    #[test]
    fn test_empty_beam_is_due_immediately() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let beam = completed_beam(start);
        assert_eq!(purge_time(&beam, &facts(0), start, 60), Some(0));
    }

    #[test]
    fn test_exclusions_yield_none() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = start + Duration::days(100);
        let mut beam = completed_beam(start);

        let pinned = RetentionFacts {
            pin_count: 1,
            ..facts(0)
        };
        assert_eq!(purge_time(&beam, &pinned, late, 60), None);

        let tracked = RetentionFacts {
            open_issue_count: 2,
            ..facts(5)
        };
        assert_eq!(purge_time(&beam, &tracked, late, 60), None);

        beam.completed = false;
        assert_eq!(purge_time(&beam, &facts(0), late, 60), None);
    }

    #[test]
    fn test_type_threshold_overrides_default() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let beam = completed_beam(start);
        let typed = RetentionFacts {
            type_threshold: Some(7),
            ..facts(1)
        };
        assert_eq!(purge_time(&beam, &typed, start + Duration::days(3), 60), Some(4));
    }
}
