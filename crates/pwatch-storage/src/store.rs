//! Persistence seam: a `Store` for single statements and reads, and a
//! `StoreTx` unit of work for multi-statement writes.
//!
//! A `StoreTx` that is dropped without `commit` rolls back. Pipelines pass
//! `&mut dyn StoreTx` into the function doing the work and commit only after
//! every step succeeded.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pwatch_core::{
    Category, CategoryDef, ChangeReport, CurrentRunProduct, DeliveryOutcome, DeliveryPayload,
    DeliveryRecipient, HistoricalSnapshot, NewChangeItem, ParsedProduct, Product, ReportSummary,
    ScrapeRun, ScrapeRunTotals,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("transaction did not start within {0:?}")]
    BeginTimeout(Duration),
    #[error("transaction exceeded {0:?}")]
    Timeout(Duration),
    #[error("invalid stored value: {0}")]
    Decode(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Bounds for one unit of work: how long to wait for a connection and how
/// long the whole unit may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLimits {
    pub max_wait: Duration,
    pub timeout: Duration,
}

impl Default for TxLimits {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Runs `work` under `limits.timeout`, mapping expiry to `StoreError::Timeout`.
///
/// The transaction handle lives outside `work`, so an expired or failed
/// unit drops it uncommitted.
pub async fn within_limits<T, F>(limits: TxLimits, work: F) -> StoreResult<T>
where
    F: std::future::Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limits.timeout, work).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limits.timeout)),
    }
}

#[async_trait]
pub trait StoreTx: Send {
    async fn find_product_by_url(&mut self, external_url: &str) -> StoreResult<Option<Product>>;

    async fn insert_product(
        &mut self,
        observed: &ParsedProduct,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<Product>;

    /// Overwrites every observed field and bumps `last_seen_at`.
    async fn update_product_observation(
        &mut self,
        product_id: Uuid,
        observed: &ParsedProduct,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Idempotent: an existing (product, category) link is left untouched.
    async fn link_product_category(&mut self, product_id: Uuid, category_id: Uuid)
        -> StoreResult<()>;

    async fn insert_snapshot(
        &mut self,
        scrape_run_id: Uuid,
        product_id: Uuid,
        observed: &ParsedProduct,
        scraped_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// External URLs linked to the category that are not in `present`.
    async fn linked_urls_missing_from(
        &mut self,
        category_id: Uuid,
        present: &[String],
    ) -> StoreResult<Vec<String>>;

    async fn set_run_stock_counts(
        &mut self,
        scrape_run_id: Uuid,
        sold_out: i32,
        back_in_stock: i32,
    ) -> StoreResult<()>;

    /// Fails with `StoreError::Conflict` when the run already has a report.
    async fn insert_change_report(
        &mut self,
        scrape_run_id: Uuid,
        total_changes: i32,
        created_at: DateTime<Utc>,
    ) -> StoreResult<ChangeReport>;

    async fn insert_change_items(
        &mut self,
        change_report_id: Uuid,
        items: &[NewChangeItem],
    ) -> StoreResult<()>;

    /// Creates one PENDING delivery per recipient channel, skipping any
    /// (report, channel) pair that already exists. Returns rows inserted.
    async fn insert_pending_deliveries(
        &mut self,
        change_report_id: Uuid,
        recipients: &[DeliveryRecipient],
        created_at: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Marks still-PENDING deliveries SENT. Returns rows updated.
    async fn mark_deliveries_sent(
        &mut self,
        delivery_ids: &[Uuid],
        sent_at: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn set_digest_watermark(&mut self, user_id: Uuid, sent_at: DateTime<Utc>)
        -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self, limits: TxLimits) -> StoreResult<Box<dyn StoreTx>>;

    // categories
    async fn upsert_category(&self, def: &CategoryDef, scrape_interval_hours: i32)
        -> StoreResult<Category>;
    async fn set_category_parent(&self, category_id: Uuid, parent_id: Option<Uuid>)
        -> StoreResult<()>;
    async fn find_category_by_id(&self, id: Uuid) -> StoreResult<Option<Category>>;
    async fn find_category_by_slug(&self, slug: &str) -> StoreResult<Option<Category>>;
    async fn list_active_categories(&self) -> StoreResult<Vec<Category>>;
    async fn last_run_started_at(&self, category_id: Uuid) -> StoreResult<Option<DateTime<Utc>>>;

    // scrape runs
    async fn insert_scrape_run(&self, run: &ScrapeRun) -> StoreResult<()>;
    async fn get_scrape_run(&self, id: Uuid) -> StoreResult<Option<ScrapeRun>>;
    async fn complete_scrape_run(
        &self,
        id: Uuid,
        totals: &ScrapeRunTotals,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn fail_scrape_run(
        &self,
        id: Uuid,
        error_message: &str,
        duration_ms: i64,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    /// Marks RUNNING runs started before `started_before` FAILED; returns
    /// their ids oldest first.
    async fn fail_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        error_message: &str,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>>;

    // diff inputs
    async fn find_report_summary(&self, scrape_run_id: Uuid) -> StoreResult<Option<ReportSummary>>;
    /// Snapshots written by the run, oldest first, with their products.
    async fn run_snapshots(&self, scrape_run_id: Uuid) -> StoreResult<Vec<CurrentRunProduct>>;
    async fn has_completed_run_before(
        &self,
        category_id: Uuid,
        before: DateTime<Utc>,
    ) -> StoreResult<bool>;
    /// Latest snapshot per product strictly before `before`.
    async fn latest_snapshots_before(
        &self,
        product_ids: &[Uuid],
        before: DateTime<Utc>,
    ) -> StoreResult<HashMap<Uuid, HistoricalSnapshot>>;
    async fn subscribed_recipients(&self, category_id: Uuid) -> StoreResult<Vec<DeliveryRecipient>>;

    // deliveries
    /// PENDING deliveries of one report owned by paid or admin users.
    async fn pending_immediate_payloads(
        &self,
        change_report_id: Uuid,
    ) -> StoreResult<Vec<DeliveryPayload>>;
    /// All PENDING deliveries of active users whose digest watermark is
    /// unset or at/before `watermark_cutoff`, ordered by user then age.
    async fn pending_digest_payloads(
        &self,
        watermark_cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<DeliveryPayload>>;
    /// Applies a terminal outcome if the delivery is still PENDING.
    /// Returns false when it had already left PENDING.
    async fn record_delivery_outcome(
        &self,
        delivery_id: Uuid,
        outcome: &DeliveryOutcome,
    ) -> StoreResult<bool>;
}
