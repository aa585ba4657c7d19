//! Change detection for completed scrape runs, plus report and delivery
//! creation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pwatch_core::{
    ChangeType, CurrentRunProduct, DeliveryRecipient, HistoricalSnapshot, NewChangeItem,
    ReportSummary, ScrapeRun, ScrapeRunStatus,
};
use pwatch_storage::{within_limits, StoreError, StoreResult, StoreTx};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::SyncPipeline;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("Scrape run not found: {0}")]
    RunNotFound(Uuid),
    #[error("Diff engine requires a completed scrape run: {0}")]
    RunNotCompleted(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Inputs for one diff: the run, what it observed, and the baseline.
#[derive(Debug, Clone)]
pub struct DiffContext {
    pub run: ScrapeRun,
    pub completed_at: DateTime<Utc>,
    pub current: Vec<CurrentRunProduct>,
    pub previous_run_exists: bool,
    pub history: HashMap<Uuid, HistoricalSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectedChanges {
    pub items: Vec<NewChangeItem>,
    pub sold_out_count: i32,
    pub back_in_stock_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRunResult {
    pub scrape_run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_report_id: Option<Uuid>,
    pub total_changes: i32,
    pub sold_out_count: i32,
    pub back_in_stock_count: i32,
    pub delivery_count: usize,
    pub reused_existing_report: bool,
}

impl DiffRunResult {
    fn reused(scrape_run_id: Uuid, summary: &ReportSummary) -> Self {
        Self {
            scrape_run_id,
            change_report_id: Some(summary.report.id),
            total_changes: summary.report.total_changes,
            sold_out_count: summary.count_of(ChangeType::SoldOut) as i32,
            back_in_stock_count: summary.count_of(ChangeType::BackInStock) as i32,
            delivery_count: summary.delivery_count,
            reused_existing_report: true,
        }
    }
}

fn discovered_by_run(first_seen_at: DateTime<Utc>, run: &ScrapeRun, completed_at: DateTime<Utc>) -> bool {
    first_seen_at >= run.started_at && first_seen_at <= completed_at
}

/// Derives typed changes for every product the run snapshotted.
///
/// `new_product` depends only on the product's global first-seen time.
/// Price and stock events need a snapshot from before the run, and are only
/// considered when the category has an earlier completed run.
pub fn detect_changes(ctx: &DiffContext) -> DetectedChanges {
    let mut items: Vec<NewChangeItem> = Vec::new();

    for current in &ctx.current {
        let product_id = current.product.id;
        let snapshot = &current.snapshot;

        if discovered_by_run(current.product.first_seen_at, &ctx.run, ctx.completed_at) {
            items.push(NewChangeItem {
                product_id,
                change_type: ChangeType::NewProduct,
                old_price: None,
                new_price: Some(snapshot.price),
                old_stock_status: None,
                new_stock_status: Some(snapshot.in_stock),
            });
        }

        let previous = if ctx.previous_run_exists {
            ctx.history.get(&product_id)
        } else {
            None
        };
        let Some(previous) = previous else {
            continue;
        };

        let price_change = match snapshot.price.cmp(&previous.price) {
            std::cmp::Ordering::Greater => Some(ChangeType::PriceIncrease),
            std::cmp::Ordering::Less => Some(ChangeType::PriceDecrease),
            std::cmp::Ordering::Equal => None,
        };
        if let Some(change_type) = price_change {
            items.push(NewChangeItem {
                product_id,
                change_type,
                old_price: Some(previous.price),
                new_price: Some(snapshot.price),
                old_stock_status: None,
                new_stock_status: None,
            });
        }

        let stock_change = match (previous.in_stock, snapshot.in_stock) {
            (true, false) => Some(ChangeType::SoldOut),
            (false, true) => Some(ChangeType::BackInStock),
            _ => None,
        };
        if let Some(change_type) = stock_change {
            items.push(NewChangeItem {
                product_id,
                change_type,
                old_price: None,
                new_price: None,
                old_stock_status: Some(previous.in_stock),
                new_stock_status: Some(snapshot.in_stock),
            });
        }
    }

    let items = dedupe_items(items);
    let count = |t: ChangeType| items.iter().filter(|i| i.change_type == t).count() as i32;
    DetectedChanges {
        sold_out_count: count(ChangeType::SoldOut),
        back_in_stock_count: count(ChangeType::BackInStock),
        items,
    }
}

/// One item per (product, type); a later duplicate replaces the earlier one
/// in place.
fn dedupe_items(items: Vec<NewChangeItem>) -> Vec<NewChangeItem> {
    let mut position: HashMap<(Uuid, ChangeType), usize> = HashMap::new();
    let mut unique: Vec<NewChangeItem> = Vec::with_capacity(items.len());
    for item in items {
        let key = (item.product_id, item.change_type);
        match position.get(&key) {
            Some(&at) => unique[at] = item,
            None => {
                position.insert(key, unique.len());
                unique.push(item);
            }
        }
    }
    unique
}

/// Report, items and PENDING deliveries for a non-empty detection. Always
/// records the run's stock counters.
pub async fn persist_changes(
    tx: &mut dyn StoreTx,
    scrape_run_id: Uuid,
    detection: &DetectedChanges,
    recipients: &[DeliveryRecipient],
    created_at: DateTime<Utc>,
) -> StoreResult<Option<Uuid>> {
    tx.set_run_stock_counts(
        scrape_run_id,
        detection.sold_out_count,
        detection.back_in_stock_count,
    )
    .await?;

    if detection.items.is_empty() {
        return Ok(None);
    }

    let report = tx
        .insert_change_report(scrape_run_id, detection.items.len() as i32, created_at)
        .await?;
    tx.insert_change_items(report.id, &detection.items).await?;
    if !recipients.is_empty() {
        tx.insert_pending_deliveries(report.id, recipients, created_at)
            .await?;
    }
    Ok(Some(report.id))
}

impl SyncPipeline {
    pub async fn build_diff_context(&self, scrape_run_id: Uuid) -> Result<DiffContext, DiffError> {
        let run = self
            .store
            .get_scrape_run(scrape_run_id)
            .await?
            .ok_or(DiffError::RunNotFound(scrape_run_id))?;
        let completed_at = match (run.status, run.completed_at) {
            (ScrapeRunStatus::Completed, Some(at)) => at,
            _ => return Err(DiffError::RunNotCompleted(scrape_run_id)),
        };

        let current = self.store.run_snapshots(scrape_run_id).await?;
        let previous_run_exists = self
            .store
            .has_completed_run_before(run.category_id, run.started_at)
            .await?;

        let history = if previous_run_exists && !current.is_empty() {
            let product_ids: Vec<Uuid> = current.iter().map(|c| c.product.id).collect();
            self.store
                .latest_snapshots_before(&product_ids, run.started_at)
                .await?
        } else {
            HashMap::new()
        };

        Ok(DiffContext {
            run,
            completed_at,
            current,
            previous_run_exists,
            history,
        })
    }

    /// Diffs a completed run at most once.
    ///
    /// A run that already has a report returns that report's counts and
    /// dispatches nothing. Otherwise changes are detected, persisted, and the
    /// new report's paid and admin deliveries are sent right away.
    pub async fn run_diff(&self, scrape_run_id: Uuid) -> Result<DiffRunResult, DiffError> {
        let span = info_span!("diff_run", run_id = %scrape_run_id);
        self.diff_once(scrape_run_id).instrument(span).await
    }

    async fn diff_once(&self, scrape_run_id: Uuid) -> Result<DiffRunResult, DiffError> {
        if let Some(summary) = self.store.find_report_summary(scrape_run_id).await? {
            info!(report_id = %summary.report.id, "report already exists; reusing");
            return Ok(DiffRunResult::reused(scrape_run_id, &summary));
        }

        let ctx = self.build_diff_context(scrape_run_id).await?;
        let detection = detect_changes(&ctx);

        let recipients = if detection.items.is_empty() {
            Vec::new()
        } else {
            self.store.subscribed_recipients(ctx.run.category_id).await?
        };

        let limits = self.config.tx_limits;
        let created_at = self.clock.now();
        let mut tx = self.store.begin(limits).await?;
        let persisted = within_limits(
            limits,
            persist_changes(tx.as_mut(), scrape_run_id, &detection, &recipients, created_at),
        )
        .await;
        let change_report_id = match persisted {
            Ok(id) => {
                tx.commit().await?;
                id
            }
            Err(err) if err.is_conflict() => {
                drop(tx);
                // another diff of the same run won the insert
                let summary = self
                    .store
                    .find_report_summary(scrape_run_id)
                    .await?
                    .ok_or(DiffError::Store(err))?;
                return Ok(DiffRunResult::reused(scrape_run_id, &summary));
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            changes = detection.items.len(),
            sold_out = detection.sold_out_count,
            back_in_stock = detection.back_in_stock_count,
            recipients = recipients.len(),
            "diff persisted"
        );

        if let Some(report_id) = change_report_id {
            self.send_immediate(report_id).await?;
        }

        Ok(DiffRunResult {
            scrape_run_id,
            change_report_id,
            total_changes: detection.items.len() as i32,
            sold_out_count: detection.sold_out_count,
            back_in_stock_count: detection.back_in_stock_count,
            delivery_count: if change_report_id.is_some() {
                recipients.len()
            } else {
                0
            },
            reused_existing_report: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pwatch_core::{Product, ProductSnapshot};
    use rust_decimal::Decimal;

    use super::*;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + Duration::minutes(minutes)
    }

    fn run() -> ScrapeRun {
        let mut run = ScrapeRun::started(Uuid::new_v4(), Uuid::new_v4(), at(0));
        run.status = ScrapeRunStatus::Completed;
        run.completed_at = Some(at(10));
        run
    }

    fn current(run: &ScrapeRun, first_seen: DateTime<Utc>, price: &str, in_stock: bool) -> CurrentRunProduct {
        let id = Uuid::new_v4();
        CurrentRunProduct {
            product: Product {
                id,
                external_url: format!("https://shop.test/toode/{id}"),
                name: "Item".into(),
                image_url: "https://shop.test/i.jpg".into(),
                current_price: dec(price),
                original_price: None,
                in_stock,
                first_seen_at: first_seen,
                last_seen_at: at(5),
            },
            snapshot: ProductSnapshot {
                id: Uuid::new_v4(),
                scrape_run_id: run.id,
                product_id: id,
                name: "Item".into(),
                image_url: "https://shop.test/i.jpg".into(),
                price: dec(price),
                original_price: None,
                in_stock,
                scraped_at: at(5),
            },
        }
    }

    fn history(product_id: Uuid, price: &str, in_stock: bool) -> HistoricalSnapshot {
        HistoricalSnapshot {
            product_id,
            price: dec(price),
            original_price: None,
            in_stock,
            scraped_at: at(-60),
        }
    }

    fn context(run: ScrapeRun, current: Vec<CurrentRunProduct>, history: Vec<HistoricalSnapshot>) -> DiffContext {
        DiffContext {
            completed_at: run.completed_at.unwrap(),
            run,
            current,
            previous_run_exists: true,
            history: history.into_iter().map(|h| (h.product_id, h)).collect(),
        }
    }

    #[test]
    fn new_product_window_is_inclusive() {
        let run = run();
        let on_start = current(&run, at(0), "1.00", true);
        let on_end = current(&run, at(10), "1.00", true);
        let before = current(&run, at(-1), "1.00", true);
        let after = current(&run, at(11), "1.00", true);
        let detection = detect_changes(&context(run, vec![on_start, on_end, before, after], vec![]));
        assert_eq!(detection.items.len(), 2);
        assert!(detection
            .items
            .iter()
            .all(|i| i.change_type == ChangeType::NewProduct && i.new_price == Some(dec("1.00"))));
    }

    #[test]
    fn price_direction_uses_decimal_order() {
        let run = run();
        let up = current(&run, at(-100), "14.99", true);
        let down = current(&run, at(-100), "12.99", true);
        let same = current(&run, at(-100), "12.90", true);
        let hist = vec![
            history(up.product.id, "12.99", true),
            history(down.product.id, "14.99", true),
            history(same.product.id, "12.9", true),
        ];
        let (up_id, down_id) = (up.product.id, down.product.id);
        let detection = detect_changes(&context(run, vec![up, down, same], hist));

        assert_eq!(detection.items.len(), 2);
        let increase = detection.items.iter().find(|i| i.product_id == up_id).unwrap();
        assert_eq!(increase.change_type, ChangeType::PriceIncrease);
        assert_eq!(increase.old_price, Some(dec("12.99")));
        assert_eq!(increase.new_price, Some(dec("14.99")));
        let decrease = detection.items.iter().find(|i| i.product_id == down_id).unwrap();
        assert_eq!(decrease.change_type, ChangeType::PriceDecrease);
    }

    #[test]
    fn stock_transitions_and_counts() {
        let run = run();
        let sold = current(&run, at(-100), "5.00", false);
        let back = current(&run, at(-100), "5.00", true);
        let hist = vec![
            history(sold.product.id, "5.00", true),
            history(back.product.id, "5.00", false),
        ];
        let detection = detect_changes(&context(run, vec![sold, back], hist));
        assert_eq!(detection.sold_out_count, 1);
        assert_eq!(detection.back_in_stock_count, 1);
        let sold_out = detection
            .items
            .iter()
            .find(|i| i.change_type == ChangeType::SoldOut)
            .unwrap();
        assert_eq!(sold_out.old_stock_status, Some(true));
        assert_eq!(sold_out.new_stock_status, Some(false));
    }

    #[test]
    fn history_is_ignored_without_an_earlier_completed_run() {
        let run = run();
        let item = current(&run, at(-100), "20.00", false);
        let hist = vec![history(item.product.id, "10.00", true)];
        let mut ctx = context(run, vec![item], hist);
        ctx.previous_run_exists = false;
        assert!(detect_changes(&ctx).items.is_empty());
    }

    #[test]
    fn one_product_can_emit_several_distinct_types() {
        let run = run();
        let item = current(&run, at(2), "9.00", false);
        let hist = vec![history(item.product.id, "10.00", true)];
        let detection = detect_changes(&context(run, vec![item], hist));
        let mut types: Vec<ChangeType> = detection.items.iter().map(|i| i.change_type).collect();
        types.sort();
        assert_eq!(
            types,
            vec![ChangeType::NewProduct, ChangeType::PriceDecrease, ChangeType::SoldOut]
        );
    }

    #[test]
    fn duplicate_product_entries_collapse_per_type() {
        let run = run();
        let item = current(&run, at(1), "3.00", true);
        let detection = detect_changes(&context(run, vec![item.clone(), item], vec![]));
        assert_eq!(detection.items.len(), 1);
    }
}
