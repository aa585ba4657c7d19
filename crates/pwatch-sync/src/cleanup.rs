use chrono::{DateTime, Duration, Utc};
use pwatch_storage::StoreError;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::SyncPipeline;

pub const DEFAULT_STALE_MINUTES: i64 = 30;
/// One year.
pub const MAX_STALE_MINUTES: i64 = 525_600;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("stale window of {0} minutes is out of range")]
    WindowOutOfRange(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub updated_count: usize,
    pub stale_minutes: i64,
    pub completed_at: DateTime<Utc>,
    pub run_ids: Vec<Uuid>,
}

/// Reads an optional minutes argument: absent means the default, anything
/// else must be an integer in `1..=MAX_STALE_MINUTES`.
pub fn parse_stale_minutes(value: Option<&str>) -> Result<i64, String> {
    let Some(raw) = value else {
        return Ok(DEFAULT_STALE_MINUTES);
    };
    match raw.trim().parse::<i64>() {
        Ok(minutes) if (1..=MAX_STALE_MINUTES).contains(&minutes) => Ok(minutes),
        _ => Err(format!(
            "expected stale minutes between 1 and {MAX_STALE_MINUTES}, got `{raw}`"
        )),
    }
}

pub fn stale_message(stale_minutes: i64) -> String {
    format!("Marked stale by cleanup after {stale_minutes} minutes")
}

impl SyncPipeline {
    /// Fails every RUNNING run started more than `stale_minutes` ago.
    pub async fn cleanup_stale_runs(&self, stale_minutes: i64) -> Result<CleanupResult, CleanupError> {
        let now = self.clock.now();
        let threshold = Duration::try_minutes(stale_minutes)
            .filter(|_| stale_minutes > 0)
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or(CleanupError::WindowOutOfRange(stale_minutes))?;
        let run_ids = self
            .store
            .fail_stale_runs(threshold, &stale_message(stale_minutes), now)
            .await?;

        if run_ids.is_empty() {
            info!(stale_minutes, "no stale scrape runs found");
        } else {
            warn!(stale_minutes, count = run_ids.len(), "stale scrape runs marked failed");
        }

        Ok(CleanupResult {
            updated_count: run_ids.len(),
            stale_minutes,
            completed_at: now,
            run_ids,
        })
    }
}
