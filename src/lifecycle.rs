//! Beam lifecycle transitions outside the receiver
//!
//! The orchestration task closes a beam when the remote side fails; the
//! watchdog closes beams whose agent never called home.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{BeamlineError, Result};
use crate::models::Beam;
use crate::store::BeamStore;

/// Error recorded on beams failed by the watchdog.
pub const SILENT_AGENT_ERROR: &str = "Agent didn't contact the receiver";

/// Fail every running beam whose agent has been silent for longer than
/// `timeout`. Returns the ids that were failed.
pub async fn time_out_silent_beams(
    store: &dyn BeamStore,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<i64>> {
    let timeout = chrono::Duration::from_std(timeout)
        .map_err(|e| BeamlineError::Config(format!("Invalid contact timeout: {}", e)))?;
    let deadline = now - timeout;
    let failed = store
        .time_out_silent_beams(deadline, SILENT_AGENT_ERROR, now)
        .await?;
    for beam_id in &failed {
        info!(
            beam_id,
            "Agent did not make contact within {} seconds",
            timeout.num_seconds()
        );
    }
    Ok(failed)
}

/// Record an orchestration failure on the beam and make it terminal.
pub async fn record_failure(
    store: &dyn BeamStore,
    beam_id: i64,
    error: &BeamlineError,
    now: DateTime<Utc>,
) -> Result<Beam> {
    warn!(beam_id, category = %error.category(), "Beam failed: {}", error);
    store
        .set_beam_completed(beam_id, true, Some(error.to_string()), now)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BeamState, NewBeam};
    use crate::store::SqliteStore;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> SqliteStore {
        SqliteStore::open(dir.path().join("beams.db").to_str().unwrap())
            .await
            .unwrap()
    }

    fn new_beam() -> NewBeam {
        NewBeam {
            host: "host".into(),
            directory: "/var/log".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_watchdog_only_fails_silent_overdue_beams() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let silent = store.create_beam(new_beam(), start).await.unwrap();
        let talking = store.create_beam(new_beam(), start).await.unwrap();
        store.register_file(talking.id, "./a").await.unwrap();
        let recent = store
            .create_beam(new_beam(), start + chrono::Duration::minutes(50))
            .await
            .unwrap();

        let now = start + chrono::Duration::minutes(61);
        let failed = time_out_silent_beams(&store, Duration::from_secs(3600), now)
            .await
            .unwrap();
        assert_eq!(failed, vec![silent.id]);

        let silent = store.get_beam(silent.id).await.unwrap();
        assert_eq!(silent.state(), BeamState::Failed);
        assert_eq!(silent.error.as_deref(), Some(SILENT_AGENT_ERROR));
        assert_eq!(silent.completed_at, Some(now));

        assert!(!store.get_beam(talking.id).await.unwrap().completed);
        assert!(!store.get_beam(recent.id).await.unwrap().completed);

        // a second pass finds nothing new
        let again = time_out_silent_beams(&store, Duration::from_secs(3600), now)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_record_failure_makes_beam_terminal() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let beam = store.create_beam(new_beam(), now).await.unwrap();

        let error = BeamlineError::Deployment("No v2 agent for freebsd".into());
        let beam = record_failure(&store, beam.id, &error, now).await.unwrap();

        assert!(beam.completed);
        assert_eq!(beam.state(), BeamState::Failed);
        assert!(beam.error.unwrap().contains("No v2 agent for freebsd"));
    }
}
