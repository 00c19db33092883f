//! Issue trackers
//!
//! Beams linked to an open issue are never vacuumed. Trackers are asked
//! periodically whether each linked issue is still open.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{error, info};

use crate::error::{BeamlineError, Result};
use crate::models::{Issue, TrackerKind, TrackerRecord};
use crate::store::BeamStore;

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Current open state of each issue, in input order.
    async fn refresh(&self, issues: &[Issue], now: DateTime<Utc>) -> Result<Vec<bool>>;

    async fn is_valid_issue(&self, id_in_tracker: &str) -> Result<bool>;
}

/// Build the tracker described by a stored record.
pub fn from_record(record: &TrackerRecord) -> Result<Box<dyn IssueTracker>> {
    Ok(match record.kind {
        TrackerKind::File => Box::new(FileTracker::new(&record.url)),
        TrackerKind::IssueService => Box::new(IssueServiceTracker::from_record(record)?),
        TrackerKind::Faulty => Box::new(FaultyTracker),
    })
}

/// JSON file mapping issue ids to their open state.
pub struct FileTracker {
    path: PathBuf,
}

impl FileTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        serde_json::from_str(&raw).map_err(|e| {
            BeamlineError::Tracker(format!("{} is not a JSON object: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl IssueTracker for FileTracker {
    async fn refresh(&self, issues: &[Issue], _now: DateTime<Utc>) -> Result<Vec<bool>> {
        let data = self.load().await?;
        issues
            .iter()
            .map(|issue| {
                data.get(&issue.id_in_tracker)
                    .and_then(serde_json::Value::as_bool)
                    .ok_or_else(|| {
                        BeamlineError::Tracker(format!(
                            "{} has no state for issue {}",
                            self.path.display(),
                            issue.id_in_tracker
                        ))
                    })
            })
            .collect()
    }

    async fn is_valid_issue(&self, id_in_tracker: &str) -> Result<bool> {
        Ok(self.load().await?.contains_key(id_in_tracker))
    }
}

#[derive(Deserialize)]
struct IssueServiceConfig {
    username: String,
    password: SecretString,
    /// Days a resolved issue keeps counting as open
    #[serde(default)]
    resolution_grace: i64,
}

#[derive(Deserialize)]
struct IssueDocument {
    fields: IssueFields,
}

#[derive(Deserialize)]
struct IssueFields {
    resolutiondate: Option<String>,
}

/// REST issue service speaking the Jira issue API.
pub struct IssueServiceTracker {
    url: String,
    client: reqwest::Client,
    username: String,
    password: SecretString,
    resolution_grace: Duration,
}

impl IssueServiceTracker {
    pub fn from_record(record: &TrackerRecord) -> Result<Self> {
        let config: IssueServiceConfig = serde_json::from_value(record.config.clone())
            .map_err(|e| BeamlineError::Tracker(format!("Bad config for {}: {}", record.name, e)))?;
        Ok(Self {
            url: record.url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            username: config.username,
            password: config.password,
            resolution_grace: Duration::days(config.resolution_grace),
        })
    }

    async fn fetch(&self, id_in_tracker: &str) -> Result<reqwest::Response> {
        self.client
            .get(format!("{}/rest/api/2/issue/{}", self.url, id_in_tracker))
            .query(&[("fields", "resolutiondate")])
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .send()
            .await
            .map_err(|e| BeamlineError::Tracker(e.to_string()))
    }
}

/// Whether an issue resolved at `resolved` (if ever) still counts as open.
pub fn is_open(resolved: Option<&str>, now: DateTime<Utc>, grace: Duration) -> Result<bool> {
    let Some(resolved) = resolved else {
        return Ok(true);
    };
    let resolved = DateTime::parse_from_str(resolved, "%Y-%m-%dT%H:%M:%S%.f%z")
        .map_err(|e| BeamlineError::Tracker(format!("Bad resolution date {}: {}", resolved, e)))?;
    Ok(now.signed_duration_since(resolved) < grace)
}

#[async_trait]
impl IssueTracker for IssueServiceTracker {
    async fn refresh(&self, issues: &[Issue], now: DateTime<Utc>) -> Result<Vec<bool>> {
        let mut states = Vec::with_capacity(issues.len());
        for issue in issues {
            let document: IssueDocument = self
                .fetch(&issue.id_in_tracker)
                .await?
                .error_for_status()
                .map_err(|e| BeamlineError::Tracker(e.to_string()))?
                .json()
                .await
                .map_err(|e| BeamlineError::Tracker(e.to_string()))?;
            states.push(is_open(
                document.fields.resolutiondate.as_deref(),
                now,
                self.resolution_grace,
            )?);
        }
        Ok(states)
    }

    async fn is_valid_issue(&self, id_in_tracker: &str) -> Result<bool> {
        Ok(self.fetch(id_in_tracker).await?.status().is_success())
    }
}

/// Always fails.
pub struct FaultyTracker;

#[async_trait]
impl IssueTracker for FaultyTracker {
    async fn refresh(&self, _issues: &[Issue], _now: DateTime<Utc>) -> Result<Vec<bool>> {
        Err(BeamlineError::Tracker("Tracker Error".into()))
    }

    async fn is_valid_issue(&self, _id_in_tracker: &str) -> Result<bool> {
        Err(BeamlineError::Tracker("Tracker Error".into()))
    }
}

/// Refresh issues of live beams in every tracker.
///
/// A failing tracker is logged and skipped. Returns the number of trackers
/// that refreshed successfully.
pub async fn refresh_issue_trackers(store: &Arc<dyn BeamStore>, now: DateTime<Utc>) -> Result<usize> {
    let mut refreshed = 0;
    for record in store.trackers().await? {
        info!(
            "Refreshing tracker {} - {} of type {}",
            record.id,
            record.url,
            record.kind.as_str()
        );
        match refresh_tracker(store.as_ref(), &record, now).await {
            Ok(()) => refreshed += 1,
            Err(e) => error!("Refreshing tracker {} failed: {}", record.name, e),
        }
    }
    Ok(refreshed)
}

async fn refresh_tracker(store: &dyn BeamStore, record: &TrackerRecord, now: DateTime<Utc>) -> Result<()> {
    let tracker = from_record(record)?;
    let issues = store.issues_of_live_beams(record.id).await?;
    if issues.is_empty() {
        return Ok(());
    }
    let states = tracker.refresh(&issues, now).await?;
    for (issue, open) in issues.iter().zip(states) {
        if issue.open != open {
            store.set_issue_open(issue.id, open).await?;
        }
    }
    Ok(())
}
