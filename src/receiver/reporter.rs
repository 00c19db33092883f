//! Where the receiver reports what it stored

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;
use crate::models::{FileRegistration, FileReport};
use crate::store::BeamStore;

#[async_trait]
pub trait OutcomeReporter: Send + Sync {
    /// Announce a file and learn where to store it and whether to accept it.
    async fn register_file(&self, beam_id: i64, file_name: &str) -> Result<FileRegistration>;

    async fn finish_file(&self, file_id: i64, report: FileReport) -> Result<()>;

    /// Close a run; `error` is set when the run broke off.
    async fn complete_beam(&self, beam_id: i64, error: Option<String>) -> Result<()>;
}

/// Reports straight into the beam store.
pub struct StoreReporter {
    store: Arc<dyn BeamStore>,
}

impl StoreReporter {
    pub fn new(store: Arc<dyn BeamStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl OutcomeReporter for StoreReporter {
    async fn register_file(&self, beam_id: i64, file_name: &str) -> Result<FileRegistration> {
        self.store.register_file(beam_id, file_name).await
    }

    async fn finish_file(&self, file_id: i64, report: FileReport) -> Result<()> {
        self.store.finish_file(file_id, report).await
    }

    async fn complete_beam(&self, beam_id: i64, error: Option<String>) -> Result<()> {
        self.store
            .set_beam_completed(beam_id, true, error, Utc::now())
            .await
            .map(|_| ())
    }
}
