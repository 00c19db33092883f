//! Consistency auditor against a real store.

use std::sync::Arc;

use beamline::audit::{Auditor, Discrepancy};
use beamline::models::{FileReport, NewBeam};
use beamline::store::{BeamStore, SqliteStore};
use beamline::FileStorage;
use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha512};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    store: Arc<SqliteStore>,
    storage: FileStorage,
}

async fn setup() -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        SqliteStore::open(dir.path().join("beams.db").to_str().unwrap())
            .await
            .unwrap(),
    );
    let storage = FileStorage::new(dir.path().join("storage"));
    storage.initialize().await.unwrap();
    Fixture {
        dir,
        store,
        storage,
    }
}

fn sha512_hex(content: &[u8]) -> String {
    hex::encode(Sha512::digest(content))
}

impl Fixture {
    fn auditor(&self) -> Auditor {
        Auditor::new(
            self.store.clone() as Arc<dyn BeamStore>,
            self.storage.clone(),
            None,
        )
    }

    async fn beam(&self) -> i64 {
        self.store
            .create_beam(
                NewBeam {
                    host: "buildhost".into(),
                    directory: "/var/log".into(),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap()
            .id
    }

    /// Record an upload and put `content` on disk. Returns (file id, storage name).
    async fn upload(&self, beam_id: i64, name: &str, content: &[u8]) -> (i64, String) {
        let registration = self.store.register_file(beam_id, name).await.unwrap();
        let path = self.storage.path_of(&registration.storage_name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        self.store
            .finish_file(
                registration.file_id,
                FileReport {
                    success: true,
                    size: Some(content.len() as i64),
                    checksum: Some(sha512_hex(content)),
                    mtime: Some(1_700_000_000),
                },
            )
            .await
            .unwrap();
        (registration.file_id, registration.storage_name)
    }
}

#[tokio::test]
async fn test_consistent_store_is_clean() {
    let fx = setup().await;
    let beam_id = fx.beam().await;
    fx.upload(beam_id, "./a.gz", b"alpha").await;
    fx.upload(beam_id, "./b.gz", b"bravo!").await;

    let report = fx.auditor().scrub().await.unwrap();

    assert!(report.is_clean(), "{:?}", report.discrepancies);
    assert_eq!(report.files_checked, 2);
    assert_eq!(fx.store.get_beam(beam_id).await.unwrap().size, 11);
}

#[tokio::test]
async fn test_scrub_heals_recorded_sizes() {
    let fx = setup().await;
    let beam_id = fx.beam().await;
    let (file_id, storage_name) = fx.upload(beam_id, "./a.gz", b"alpha").await;
    std::fs::write(fx.storage.path_of(&storage_name), b"alpha and more").unwrap();

    let report = fx.auditor().scrub().await.unwrap();

    assert_eq!(
        report.discrepancies,
        vec![
            Discrepancy::FileSizeMismatch {
                file_id,
                storage_name: storage_name.clone(),
                on_disk: 14,
                recorded: Some(5),
            },
            Discrepancy::BeamSizeMismatch {
                beam_id,
                recorded: 5,
                sum_of_files: 14,
            },
        ]
    );
    assert_eq!(fx.store.get_file(file_id).await.unwrap().size, Some(14));
    assert_eq!(fx.store.get_beam(beam_id).await.unwrap().size, 14);

    // a second pass finds nothing left to fix
    assert!(fx.auditor().scrub().await.unwrap().is_clean());
}

#[tokio::test]
async fn test_scrub_reports_missing_and_unexpected_files() {
    let fx = setup().await;
    let beam_id = fx.beam().await;
    let (file_id, storage_name) = fx.upload(beam_id, "./a.gz", b"alpha").await;
    std::fs::remove_file(fx.storage.path_of(&storage_name)).unwrap();
    std::fs::create_dir_all(fx.storage.root().join("999")).unwrap();
    std::fs::write(fx.storage.root().join("999/1-stray"), b"?").unwrap();

    let report = fx.auditor().scrub().await.unwrap();

    assert_eq!(
        report.discrepancies,
        vec![
            Discrepancy::MissingFile {
                file_id,
                storage_name,
            },
            Discrepancy::UnexpectedFile {
                storage_name: "999/1-stray".into(),
            },
        ]
    );
    // the recorded size stays while the file is missing
    assert_eq!(fx.store.get_beam(beam_id).await.unwrap().size, 5);
}

#[tokio::test]
async fn test_files_of_deleted_beams_are_unexpected() {
    let fx = setup().await;
    let beam_id = fx.beam().await;
    let (_, storage_name) = fx.upload(beam_id, "./a.gz", b"alpha").await;
    fx.store.flag_for_deletion(beam_id).await.unwrap();

    let report = fx.auditor().scrub().await.unwrap();

    assert_eq!(report.files_checked, 0);
    assert_eq!(
        report.discrepancies,
        vec![Discrepancy::UnexpectedFile { storage_name }]
    );
}

#[tokio::test]
async fn test_validate_checksums_marks_matches() {
    let fx = setup().await;
    let beam_id = fx.beam().await;
    let (good, _) = fx.upload(beam_id, "./a.gz", b"alpha").await;
    let (bad, bad_name) = fx.upload(beam_id, "./b.gz", b"bravo").await;
    std::fs::write(fx.storage.path_of(&bad_name), b"BRAVO").unwrap();
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap();

    let report = fx.auditor().validate_checksums(10, now).await.unwrap();

    assert_eq!(report.files_checked, 2);
    assert_eq!(
        report.discrepancies,
        vec![Discrepancy::ChecksumMismatch {
            file_id: bad,
            storage_name: bad_name,
            expected: sha512_hex(b"bravo"),
            actual: sha512_hex(b"BRAVO"),
        }]
    );
    assert_eq!(
        fx.store.get_file(good).await.unwrap().last_validated,
        Some(now)
    );
    assert_eq!(fx.store.get_file(bad).await.unwrap().last_validated, None);
}

#[tokio::test]
async fn test_validate_checksums_oldest_first() {
    let fx = setup().await;
    let beam_id = fx.beam().await;
    let (first, _) = fx.upload(beam_id, "./a.gz", b"alpha").await;
    let (second, _) = fx.upload(beam_id, "./b.gz", b"bravo").await;
    let earlier = Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap();
    let later = Utc.with_ymd_and_hms(2024, 6, 2, 3, 0, 0).unwrap();

    fx.auditor().validate_checksums(1, earlier).await.unwrap();
    assert_eq!(fx.store.get_file(first).await.unwrap().last_validated, Some(earlier));
    assert_eq!(fx.store.get_file(second).await.unwrap().last_validated, None);

    fx.auditor().validate_checksums(1, later).await.unwrap();
    assert_eq!(fx.store.get_file(second).await.unwrap().last_validated, Some(later));
    assert_eq!(fx.store.get_file(first).await.unwrap().last_validated, Some(earlier));
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_checksum_tool() {
    use std::os::unix::fs::PermissionsExt;

    let fx = setup().await;
    let beam_id = fx.beam().await;
    let (file_id, _) = fx.upload(beam_id, "./a.gz", b"alpha").await;

    // prints the digest in upper case, followed by the path like sha512sum
    let tool = fx.dir.path().join("fake-sha512sum");
    std::fs::write(
        &tool,
        format!(
            "#!/bin/sh\necho \"{}  $1\"\n",
            sha512_hex(b"alpha").to_uppercase()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

    let auditor = Auditor::new(
        fx.store.clone() as Arc<dyn BeamStore>,
        fx.storage.clone(),
        Some(tool),
    );
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap();
    let report = auditor.validate_checksums(10, now).await.unwrap();

    assert!(report.is_clean(), "{:?}", report.discrepancies);
    assert_eq!(fx.store.get_file(file_id).await.unwrap().last_validated, Some(now));
}
