//! Retention engine against a real SQLite store and file store.

use std::sync::Arc;

use beamline::error::BeamlineError;
use beamline::models::{BeamState, FileReport, NewBeam, TrackerKind};
use beamline::store::{BeamStore, SqliteStore};
use beamline::{FileStorage, RetentionEngine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

const DEFAULT_DAYS: i64 = 60;

struct Fixture {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    storage: FileStorage,
    engine: RetentionEngine,
}

async fn setup() -> Fixture {
    beamline::logging::init_test_logging();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        SqliteStore::open(dir.path().join("beams.db").to_str().unwrap())
            .await
            .unwrap(),
    );
    let storage = FileStorage::new(dir.path().join("storage"));
    storage.initialize().await.unwrap();
    let engine = RetentionEngine::new(
        store.clone() as Arc<dyn BeamStore>,
        storage.clone(),
        DEFAULT_DAYS,
    );
    Fixture {
        _dir: dir,
        store,
        storage,
        engine,
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

impl Fixture {
    /// A completed beam started `age_days` before `now()`.
    async fn beam(&self, age_days: i64, type_id: Option<i64>) -> i64 {
        let started = now() - Duration::days(age_days);
        let beam = self
            .store
            .create_beam(
                NewBeam {
                    host: "buildhost".into(),
                    directory: "/var/log".into(),
                    type_id,
                    ..Default::default()
                },
                started,
            )
            .await
            .unwrap();
        beam.id
    }

    async fn complete(&self, beam_id: i64) {
        self.store
            .set_beam_completed(beam_id, true, None, now())
            .await
            .unwrap();
    }

    /// Store an uploaded file for `beam_id` and return its storage name.
    async fn add_file(&self, beam_id: i64, name: &str, content: &[u8]) -> String {
        let registration = self.store.register_file(beam_id, name).await.unwrap();
        let mut file = self
            .storage
            .create(&registration.storage_name)
            .await
            .unwrap();
        file.write_all(content).await.unwrap();
        file.flush().await.unwrap();
        self.store
            .finish_file(
                registration.file_id,
                FileReport {
                    success: true,
                    size: Some(content.len() as i64),
                    checksum: None,
                    mtime: None,
                },
            )
            .await
            .unwrap();
        registration.storage_name
    }

    async fn completed_beam_with_file(&self, age_days: i64) -> (i64, String) {
        let beam_id = self.beam(age_days, None).await;
        let storage_name = self.add_file(beam_id, "./messages.gz", b"payload").await;
        self.complete(beam_id).await;
        (beam_id, storage_name)
    }

    async fn state(&self, beam_id: i64) -> BeamState {
        self.store.get_beam(beam_id).await.unwrap().state()
    }

    fn on_disk(&self, storage_name: &str) -> bool {
        self.storage.path_of(storage_name).exists()
    }
}

#[tokio::test]
async fn test_expired_beam_is_purged() {
    let fx = setup().await;
    let (old, old_file) = fx.completed_beam_with_file(DEFAULT_DAYS).await;
    let (fresh, fresh_file) = fx.completed_beam_with_file(DEFAULT_DAYS - 1).await;

    let report = fx.engine.vacuum(now()).await.unwrap();

    assert_eq!(report.flagged, 1);
    assert_eq!(report.purged, vec![old]);
    assert!(report.failed.is_empty());
    assert_eq!(fx.state(old).await, BeamState::Deleted);
    assert!(!fx.on_disk(&old_file));
    assert_eq!(fx.state(fresh).await, BeamState::Completed);
    assert!(fx.on_disk(&fresh_file));
    assert_eq!(fx.engine.purge_time(fresh, now()).await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_beam_without_files_is_eligible_at_any_age() {
    let fx = setup().await;
    let empty = fx.beam(0, None).await;
    fx.complete(empty).await;

    assert_eq!(fx.engine.purge_time(empty, now()).await.unwrap(), Some(0));
    let report = fx.engine.vacuum(now()).await.unwrap();
    assert_eq!(report.purged, vec![empty]);
    assert_eq!(fx.state(empty).await, BeamState::Deleted);
}

#[tokio::test]
async fn test_running_beam_is_retained() {
    let fx = setup().await;
    let running = fx.beam(365, None).await;
    fx.add_file(running, "./a.gz", b"a").await;

    assert_eq!(fx.engine.purge_time(running, now()).await.unwrap(), None);
    let report = fx.engine.vacuum(now()).await.unwrap();
    assert_eq!(report.flagged, 0);
    assert_eq!(fx.state(running).await, BeamState::Beaming);
}

#[tokio::test]
async fn test_failed_beam_follows_the_same_rules() {
    let fx = setup().await;
    let failed = fx.beam(DEFAULT_DAYS + 5, None).await;
    fx.add_file(failed, "./a.gz", b"a").await;
    fx.store
        .set_beam_completed(failed, true, Some("Agent didn't contact the receiver".into()), now())
        .await
        .unwrap();

    let report = fx.engine.vacuum(now()).await.unwrap();
    assert_eq!(report.purged, vec![failed]);
}

#[tokio::test]
async fn test_pin_holds_beam_until_removed() {
    let fx = setup().await;
    let user = fx.store.create_user("ops").await.unwrap();
    let (beam_id, storage_name) = fx.completed_beam_with_file(DEFAULT_DAYS - 1).await;

    // pinned the day before the threshold is reached
    fx.store.pin(user, beam_id).await.unwrap();
    assert_eq!(fx.engine.purge_time(beam_id, now()).await.unwrap(), None);

    let next_day = now() + Duration::days(1);
    let report = fx.engine.vacuum(next_day).await.unwrap();
    assert_eq!(report.flagged, 0);
    assert!(fx.on_disk(&storage_name));
    assert_eq!(fx.state(beam_id).await, BeamState::Completed);

    fx.store.unpin(user, beam_id).await.unwrap();
    assert_eq!(fx.engine.purge_time(beam_id, next_day).await.unwrap(), Some(0));
    let report = fx.engine.vacuum(next_day).await.unwrap();
    assert_eq!(report.purged, vec![beam_id]);
    assert!(!fx.on_disk(&storage_name));
}

#[tokio::test]
async fn test_closing_issue_keeps_original_age() {
    let fx = setup().await;
    let tracker = fx
        .store
        .create_tracker("local", TrackerKind::File, "/tmp/issues.json", serde_json::json!({}))
        .await
        .unwrap();
    let (beam_id, _) = fx.completed_beam_with_file(DEFAULT_DAYS + 30).await;
    let issue = fx.store.attach_issue(beam_id, tracker.id, "OPS-1").await.unwrap();
    assert!(issue.open);

    assert_eq!(fx.engine.purge_time(beam_id, now()).await.unwrap(), None);
    assert_eq!(fx.engine.vacuum(now()).await.unwrap().flagged, 0);

    fx.store.set_issue_open(issue.id, false).await.unwrap();
    assert_eq!(fx.engine.purge_time(beam_id, now()).await.unwrap(), Some(0));
    let report = fx.engine.vacuum(now()).await.unwrap();
    assert_eq!(report.purged, vec![beam_id]);
}

#[tokio::test]
async fn test_type_threshold_overrides_default() {
    let fx = setup().await;
    let short = fx.store.create_beam_type("crash-dump", 5).await.unwrap();

    let typed = fx.beam(5, Some(short.id)).await;
    fx.add_file(typed, "./core.gz", b"core").await;
    fx.complete(typed).await;
    let (untyped, _) = fx.completed_beam_with_file(5).await;

    assert_eq!(fx.engine.purge_time(typed, now()).await.unwrap(), Some(0));
    assert_eq!(
        fx.engine.purge_time(untyped, now()).await.unwrap(),
        Some(DEFAULT_DAYS - 5)
    );

    let report = fx.engine.vacuum(now()).await.unwrap();
    assert_eq!(report.purged, vec![typed]);
    assert_eq!(fx.state(untyped).await, BeamState::Completed);
}

#[tokio::test]
async fn test_vacuum_is_idempotent() {
    let fx = setup().await;
    let (old, _) = fx.completed_beam_with_file(DEFAULT_DAYS * 2).await;

    let first = fx.engine.vacuum(now()).await.unwrap();
    let second = fx.engine.vacuum(now()).await.unwrap();

    assert_eq!(first.purged, vec![old]);
    assert_eq!(second.flagged, 0);
    assert!(second.purged.is_empty());
    assert_eq!(fx.state(old).await, BeamState::Deleted);
    assert_eq!(fx.engine.purge_time(old, now()).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_vacuum_refuses_unmounted_storage() {
    let fx = setup().await;
    let (old, storage_name) = fx.completed_beam_with_file(DEFAULT_DAYS * 2).await;
    std::fs::remove_file(fx.storage.root().join(".test")).unwrap();

    let result = fx.engine.vacuum(now()).await;

    assert!(matches!(result, Err(BeamlineError::Storage(_))));
    assert_eq!(fx.state(old).await, BeamState::Completed);
    assert!(fx.on_disk(&storage_name));
}

#[tokio::test]
async fn test_purge_tolerates_already_missing_files() {
    let fx = setup().await;
    let (old, storage_name) = fx.completed_beam_with_file(DEFAULT_DAYS * 2).await;
    std::fs::remove_file(fx.storage.path_of(&storage_name)).unwrap();

    let report = fx.engine.vacuum(now()).await.unwrap();
    assert_eq!(report.purged, vec![old]);
}

#[tokio::test]
async fn test_failed_purge_stays_pending_for_next_run() {
    let fx = setup().await;
    let (stuck, storage_name) = fx.completed_beam_with_file(DEFAULT_DAYS * 2).await;
    let (fine, _) = fx.completed_beam_with_file(DEFAULT_DAYS * 2).await;

    // a directory where the file should be cannot be removed as a file
    let path = fx.storage.path_of(&storage_name);
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();

    let report = fx.engine.vacuum(now()).await.unwrap();
    assert_eq!(report.flagged, 2);
    assert_eq!(report.purged, vec![fine]);
    assert_eq!(report.failed, vec![stuck]);
    assert_eq!(fx.state(stuck).await, BeamState::PendingDeletion);

    std::fs::remove_dir(&path).unwrap();
    let report = fx.engine.vacuum(now()).await.unwrap();
    assert_eq!(report.flagged, 0);
    assert_eq!(report.purged, vec![stuck]);
    assert_eq!(fx.state(stuck).await, BeamState::Deleted);
}

#[tokio::test]
async fn test_delete_beam_ignores_pins() {
    let fx = setup().await;
    let user = fx.store.create_user("ops").await.unwrap();
    let (beam_id, storage_name) = fx.completed_beam_with_file(1).await;
    fx.store.pin(user, beam_id).await.unwrap();

    fx.engine.delete_beam(beam_id).await.unwrap();
    assert_eq!(fx.state(beam_id).await, BeamState::Deleted);
    assert!(!fx.on_disk(&storage_name));

    // deleting again is a no-op
    fx.engine.delete_beam(beam_id).await.unwrap();

    assert!(matches!(
        fx.engine.delete_beam(9999).await,
        Err(BeamlineError::BeamNotFound(9999))
    ));
}

#[tokio::test]
async fn test_vacuum_check_removes_leftovers() {
    let fx = setup().await;
    let (beam_id, storage_name) = fx.completed_beam_with_file(DEFAULT_DAYS * 2).await;
    fx.engine.vacuum(now()).await.unwrap();
    assert_eq!(fx.state(beam_id).await, BeamState::Deleted);

    // something restored the file behind our back
    std::fs::write(fx.storage.path_of(&storage_name), b"zombie").unwrap();

    assert_eq!(fx.engine.vacuum_check().await.unwrap(), 1);
    assert!(!fx.on_disk(&storage_name));
    assert_eq!(fx.engine.vacuum_check().await.unwrap(), 0);
}
