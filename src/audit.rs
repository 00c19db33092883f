//! Consistency auditor
//!
//! Compares recorded file metadata of live beams with what is on disk.
//! Recorded sizes are corrected to match reality; nothing is ever deleted
//! and retention flags are never touched.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{BeamlineError, Result};
use crate::storage::FileStorage;
use crate::store::BeamStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    MissingFile {
        file_id: i64,
        storage_name: String,
    },
    FileSizeMismatch {
        file_id: i64,
        storage_name: String,
        on_disk: i64,
        recorded: Option<i64>,
    },
    BeamSizeMismatch {
        beam_id: i64,
        recorded: i64,
        sum_of_files: i64,
    },
    /// A file never got a storage name yet claims a size
    SizeWithoutStorage { file_id: i64, size: i64 },
    UnexpectedFile { storage_name: String },
    ChecksumMismatch {
        file_id: i64,
        storage_name: String,
        expected: String,
        actual: String,
    },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::MissingFile {
                file_id,
                storage_name,
            } => write!(f, "{} ({}) does not exist", storage_name, file_id),
            Discrepancy::FileSizeMismatch {
                file_id,
                storage_name,
                on_disk,
                recorded,
            } => write!(
                f,
                "Size of {} ({}) is {} bytes on disk but {:?} bytes in the database",
                storage_name, file_id, on_disk, recorded
            ),
            Discrepancy::BeamSizeMismatch {
                beam_id,
                recorded,
                sum_of_files,
            } => write!(
                f,
                "Size of beam {} is {}, but the sum of its file sizes is {}",
                beam_id, recorded, sum_of_files
            ),
            Discrepancy::SizeWithoutStorage { file_id, size } => write!(
                f,
                "{} has no storage name but a size of {} bytes",
                file_id, size
            ),
            Discrepancy::UnexpectedFile { storage_name } => {
                write!(f, "Unexpected file {}", storage_name)
            }
            Discrepancy::ChecksumMismatch {
                file_id,
                storage_name,
                expected,
                actual,
            } => write!(
                f,
                "Expected checksum of {} ({}) is {}, got {}",
                storage_name, file_id, expected, actual
            ),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub files_checked: usize,
    pub discrepancies: Vec<Discrepancy>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }

    fn record(&mut self, discrepancy: Discrepancy) {
        warn!("{}", discrepancy);
        self.discrepancies.push(discrepancy);
    }
}

pub struct Auditor {
    store: Arc<dyn BeamStore>,
    storage: FileStorage,
    /// External `sha512sum`-style tool; hashed in process when unset
    checksum_tool: Option<PathBuf>,
}

impl Auditor {
    pub fn new(store: Arc<dyn BeamStore>, storage: FileStorage, checksum_tool: Option<PathBuf>) -> Self {
        Self {
            store,
            storage,
            checksum_tool,
        }
    }

    /// Reconcile recorded sizes of live beams with the physical store.
    pub async fn scrub(&self) -> Result<AuditReport> {
        info!("Scrubbing initiated");
        let mut report = AuditReport::default();
        let mut expected = HashSet::new();

        for beam in self.store.live_beams().await? {
            let mut sum_of_files = 0i64;
            for file in self.store.files_for_beam(beam.id).await? {
                report.files_checked += 1;
                let Some(storage_name) = file.storage_name.clone() else {
                    if let Some(size) = file.size.filter(|size| *size != 0) {
                        report.record(Discrepancy::SizeWithoutStorage {
                            file_id: file.id,
                            size,
                        });
                        self.store.set_file_size(file.id, 0).await?;
                    }
                    continue;
                };
                expected.insert(storage_name.clone());

                let Some(on_disk) = self.storage.size_of(&storage_name).await? else {
                    report.record(Discrepancy::MissingFile {
                        file_id: file.id,
                        storage_name,
                    });
                    sum_of_files += file.size.unwrap_or(0);
                    continue;
                };
                let on_disk = i64::try_from(on_disk).unwrap_or(i64::MAX);
                if file.size != Some(on_disk) {
                    report.record(Discrepancy::FileSizeMismatch {
                        file_id: file.id,
                        storage_name,
                        on_disk,
                        recorded: file.size,
                    });
                    self.store.set_file_size(file.id, on_disk).await?;
                }
                sum_of_files += on_disk;
            }

            if beam.size != sum_of_files {
                report.record(Discrepancy::BeamSizeMismatch {
                    beam_id: beam.id,
                    recorded: beam.size,
                    sum_of_files,
                });
                self.store.set_beam_size(beam.id, sum_of_files).await?;
            }
        }

        for storage_name in self.storage.list()? {
            if !expected.contains(&storage_name) {
                report.record(Discrepancy::UnexpectedFile { storage_name });
            }
        }

        info!(
            "Scrub done: {} files checked, {} discrepancies",
            report.files_checked,
            report.discrepancies.len()
        );
        Ok(report)
    }

    /// Re-hash the least recently validated uploads and compare.
    pub async fn validate_checksums(&self, limit: u32, now: DateTime<Utc>) -> Result<AuditReport> {
        let mut report = AuditReport::default();
        for file in self.store.files_for_validation(limit).await? {
            let (Some(storage_name), Some(expected)) = (file.storage_name, file.checksum) else {
                continue;
            };
            report.files_checked += 1;

            if self.storage.size_of(&storage_name).await?.is_none() {
                report.record(Discrepancy::MissingFile {
                    file_id: file.id,
                    storage_name,
                });
                continue;
            }

            let actual = self.checksum(&storage_name).await?;
            if actual != expected {
                report.record(Discrepancy::ChecksumMismatch {
                    file_id: file.id,
                    storage_name,
                    expected,
                    actual,
                });
                continue;
            }

            info!(
                "{} validated (last validated: {:?})",
                storage_name, file.last_validated
            );
            self.store.mark_validated(file.id, now).await?;
        }
        Ok(report)
    }

    async fn checksum(&self, storage_name: &str) -> Result<String> {
        let Some(tool) = &self.checksum_tool else {
            return self.storage.sha512(storage_name).await;
        };

        let path = self.storage.path_of(storage_name);
        let output = Command::new(tool).arg(&path).output().await?;
        if !output.status.success() {
            return Err(BeamlineError::Storage(format!(
                "{} {} failed: {}",
                tool.display(),
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .next()
            .map(str::to_lowercase)
            .ok_or_else(|| {
                BeamlineError::Storage(format!("{} printed no checksum", tool.display()))
            })
    }
}
