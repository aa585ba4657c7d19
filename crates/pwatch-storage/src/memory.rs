//! In-process `Store` backing pipeline tests.
//!
//! A transaction takes the state lock for its whole lifetime and works on a
//! clone; `commit` writes the clone back, dropping discards it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pwatch_core::{
    Category, CategoryDef, CategoryRef, CategorySubscription, ChangeItem, ChangeReport,
    ChannelType, CurrentRunProduct, DeliveryOutcome, DeliveryPayload, DeliveryRecipient,
    DeliveryStatus, HistoricalSnapshot, NewChangeItem, NotificationChannel,
    NotificationDelivery, ParsedProduct, Product, ProductRef, ProductSnapshot, ReportChangeItem,
    ReportHeader, ReportSummary, ScrapeRun, ScrapeRunStatus, ScrapeRunTotals, User, UserRole,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::store::{Store, StoreError, StoreResult, StoreTx, TxLimits};

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub categories: Vec<Category>,
    pub products: Vec<Product>,
    pub product_categories: BTreeSet<(Uuid, Uuid)>,
    pub snapshots: Vec<ProductSnapshot>,
    pub runs: Vec<ScrapeRun>,
    pub reports: Vec<ChangeReport>,
    pub change_items: Vec<ChangeItem>,
    pub deliveries: Vec<NotificationDelivery>,
    pub users: Vec<User>,
    pub channels: Vec<NotificationChannel>,
    pub subscriptions: Vec<CategorySubscription>,
}

impl MemoryState {
    fn run(&self, id: Uuid) -> StoreResult<&ScrapeRun> {
        self.runs.iter().find(|r| r.id == id).ok_or_else(|| not_found("scrape run", id))
    }

    fn run_mut(&mut self, id: Uuid) -> StoreResult<&mut ScrapeRun> {
        self.runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| not_found("scrape run", id))
    }

    fn product(&self, id: Uuid) -> StoreResult<&Product> {
        self.products.iter().find(|p| p.id == id).ok_or_else(|| not_found("product", id))
    }

    fn report_header(&self, report_id: Uuid) -> StoreResult<ReportHeader> {
        let report = self
            .reports
            .iter()
            .find(|r| r.id == report_id)
            .ok_or_else(|| not_found("change report", report_id))?;
        let run = self.run(report.scrape_run_id)?;
        let category = self
            .categories
            .iter()
            .find(|c| c.id == run.category_id)
            .ok_or_else(|| not_found("category", run.category_id))?;
        Ok(ReportHeader {
            id: report.id,
            created_at: report.created_at,
            total_changes: report.total_changes,
            scrape_run_id: run.id,
            run_completed_at: run.completed_at,
            category: CategoryRef {
                id: category.id,
                slug: category.slug.clone(),
                name_et: category.name_et.clone(),
            },
        })
    }

    fn report_items(&self, report_id: Uuid) -> StoreResult<Vec<ReportChangeItem>> {
        self.change_items
            .iter()
            .filter(|item| item.change_report_id == report_id)
            .map(|item| -> StoreResult<ReportChangeItem> {
                let product = self.product(item.product_id)?;
                Ok(ReportChangeItem {
                    id: item.id,
                    change_type: item.change_type,
                    old_price: item.old_price,
                    new_price: item.new_price,
                    old_stock_status: item.old_stock_status,
                    new_stock_status: item.new_stock_status,
                    product: ProductRef {
                        id: product.id,
                        name: product.name.clone(),
                        external_url: product.external_url.clone(),
                        image_url: product.image_url.clone(),
                    },
                })
            })
            .collect()
    }

    fn payload(&self, delivery: &NotificationDelivery) -> StoreResult<DeliveryPayload> {
        let user = self
            .users
            .iter()
            .find(|u| u.id == delivery.user_id)
            .ok_or_else(|| not_found("user", delivery.user_id))?;
        let channel = self
            .channels
            .iter()
            .find(|c| c.id == delivery.notification_channel_id)
            .ok_or_else(|| not_found("notification channel", delivery.notification_channel_id))?;
        Ok(DeliveryPayload {
            delivery_id: delivery.id,
            created_at: delivery.created_at,
            user: user.clone(),
            channel: channel.clone(),
            report: self.report_header(delivery.change_report_id)?,
            change_items: self.report_items(delivery.change_report_id)?,
        })
    }

    fn user(&self, id: Uuid) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }
}

fn not_found(entity: &'static str, key: impl ToString) -> StoreError {
    StoreError::NotFound {
        entity,
        key: key.to_string(),
    }
}

fn observation_row(id: Uuid, observed: &ParsedProduct, seen_at: DateTime<Utc>) -> Product {
    Product {
        id,
        external_url: observed.external_url.clone(),
        name: observed.name.clone(),
        image_url: observed.image_url.clone(),
        current_price: observed.current_price,
        original_price: observed.original_price,
        in_stock: observed.in_stock,
        first_seen_at: seen_at,
        last_seen_at: seen_at,
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current committed state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    pub async fn insert_user(&self, user: User) {
        self.state.lock().await.users.push(user);
    }

    pub async fn insert_channel(&self, channel: NotificationChannel) {
        self.state.lock().await.channels.push(channel);
    }

    pub async fn insert_subscription(&self, subscription: CategorySubscription) {
        self.state.lock().await.subscriptions.push(subscription);
    }

    /// Writes a product row as-is; used to stage history in tests.
    pub async fn insert_product_row(&self, product: Product) {
        self.state.lock().await.products.push(product);
    }

    pub async fn insert_snapshot_row(&self, snapshot: ProductSnapshot) {
        self.state.lock().await.snapshots.push(snapshot);
    }

    pub async fn set_user_active(&self, user_id: Uuid, is_active: bool) {
        if let Some(user) = self.state.lock().await.users.iter_mut().find(|u| u.id == user_id) {
            user.is_active = is_active;
        }
    }

    pub async fn set_channel_active(&self, channel_id: Uuid, is_active: bool) {
        if let Some(channel) = self
            .state
            .lock()
            .await
            .channels
            .iter_mut()
            .find(|c| c.id == channel_id)
        {
            channel.is_active = is_active;
        }
    }

    pub async fn insert_delivery_row(&self, delivery: NotificationDelivery) {
        self.state.lock().await.deliveries.push(delivery);
    }

    pub async fn set_user_digest_watermark(&self, user_id: Uuid, at: Option<DateTime<Utc>>) {
        if let Some(user) = self.state.lock().await.users.iter_mut().find(|u| u.id == user_id) {
            user.last_digest_sent_at = at;
        }
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn find_product_by_url(&mut self, external_url: &str) -> StoreResult<Option<Product>> {
        Ok(self
            .working
            .products
            .iter()
            .find(|p| p.external_url == external_url)
            .cloned())
    }

    async fn insert_product(
        &mut self,
        observed: &ParsedProduct,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<Product> {
        if self
            .working
            .products
            .iter()
            .any(|p| p.external_url == observed.external_url)
        {
            return Err(StoreError::Conflict(format!(
                "product {}",
                observed.external_url
            )));
        }
        let product = observation_row(Uuid::new_v4(), observed, seen_at);
        self.working.products.push(product.clone());
        Ok(product)
    }

    async fn update_product_observation(
        &mut self,
        product_id: Uuid,
        observed: &ParsedProduct,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let product = self
            .working
            .products
            .iter_mut()
            .find(|p| p.id == product_id)
            .ok_or_else(|| not_found("product", product_id))?;
        let first_seen_at = product.first_seen_at;
        *product = observation_row(product_id, observed, seen_at);
        product.first_seen_at = first_seen_at;
        Ok(())
    }

    async fn link_product_category(
        &mut self,
        product_id: Uuid,
        category_id: Uuid,
    ) -> StoreResult<()> {
        self.working.product_categories.insert((product_id, category_id));
        Ok(())
    }

    async fn insert_snapshot(
        &mut self,
        scrape_run_id: Uuid,
        product_id: Uuid,
        observed: &ParsedProduct,
        scraped_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.working.snapshots.push(ProductSnapshot {
            id: Uuid::new_v4(),
            scrape_run_id,
            product_id,
            name: observed.name.clone(),
            image_url: observed.image_url.clone(),
            price: observed.current_price,
            original_price: observed.original_price,
            in_stock: observed.in_stock,
            scraped_at,
        });
        Ok(())
    }

    async fn linked_urls_missing_from(
        &mut self,
        category_id: Uuid,
        present: &[String],
    ) -> StoreResult<Vec<String>> {
        let present: BTreeSet<&str> = present.iter().map(String::as_str).collect();
        let mut missing: Vec<String> = self
            .working
            .product_categories
            .iter()
            .filter(|(_, linked)| *linked == category_id)
            .filter_map(|(product_id, _)| {
                self.working.products.iter().find(|p| p.id == *product_id)
            })
            .filter(|p| !present.contains(p.external_url.as_str()))
            .map(|p| p.external_url.clone())
            .collect();
        missing.sort();
        Ok(missing)
    }

    async fn set_run_stock_counts(
        &mut self,
        scrape_run_id: Uuid,
        sold_out: i32,
        back_in_stock: i32,
    ) -> StoreResult<()> {
        let run = self.working.run_mut(scrape_run_id)?;
        run.sold_out = sold_out;
        run.back_in_stock = back_in_stock;
        Ok(())
    }

    async fn insert_change_report(
        &mut self,
        scrape_run_id: Uuid,
        total_changes: i32,
        created_at: DateTime<Utc>,
    ) -> StoreResult<ChangeReport> {
        if self
            .working
            .reports
            .iter()
            .any(|r| r.scrape_run_id == scrape_run_id)
        {
            return Err(StoreError::Conflict(format!(
                "change report for run {scrape_run_id}"
            )));
        }
        let report = ChangeReport {
            id: Uuid::new_v4(),
            scrape_run_id,
            total_changes,
            created_at,
        };
        self.working.reports.push(report.clone());
        Ok(report)
    }

    async fn insert_change_items(
        &mut self,
        change_report_id: Uuid,
        items: &[NewChangeItem],
    ) -> StoreResult<()> {
        self.working
            .change_items
            .extend(items.iter().map(|item| ChangeItem {
                id: Uuid::new_v4(),
                change_report_id,
                product_id: item.product_id,
                change_type: item.change_type,
                old_price: item.old_price,
                new_price: item.new_price,
                old_stock_status: item.old_stock_status,
                new_stock_status: item.new_stock_status,
            }));
        Ok(())
    }

    async fn insert_pending_deliveries(
        &mut self,
        change_report_id: Uuid,
        recipients: &[DeliveryRecipient],
        created_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut inserted = 0;
        for recipient in recipients {
            let exists = self.working.deliveries.iter().any(|d| {
                d.change_report_id == change_report_id
                    && d.notification_channel_id == recipient.notification_channel_id
            });
            if exists {
                continue;
            }
            self.working.deliveries.push(NotificationDelivery {
                id: Uuid::new_v4(),
                change_report_id,
                user_id: recipient.user_id,
                notification_channel_id: recipient.notification_channel_id,
                status: DeliveryStatus::Pending,
                sent_at: None,
                error_message: None,
                created_at,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn mark_deliveries_sent(
        &mut self,
        delivery_ids: &[Uuid],
        sent_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut updated = 0;
        for delivery in self
            .working
            .deliveries
            .iter_mut()
            .filter(|d| delivery_ids.contains(&d.id) && d.status == DeliveryStatus::Pending)
        {
            delivery.status = DeliveryStatus::Sent;
            delivery.sent_at = Some(sent_at);
            delivery.error_message = None;
            updated += 1;
        }
        Ok(updated)
    }

    async fn set_digest_watermark(
        &mut self,
        user_id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let user = self
            .working
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| not_found("user", user_id))?;
        user.last_digest_sent_at = Some(sent_at);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, limits: TxLimits) -> StoreResult<Box<dyn StoreTx>> {
        let guard = tokio::time::timeout(limits.max_wait, self.state.clone().lock_owned())
            .await
            .map_err(|_| StoreError::BeginTimeout(limits.max_wait))?;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn upsert_category(
        &self,
        def: &CategoryDef,
        scrape_interval_hours: i32,
    ) -> StoreResult<Category> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.categories.iter_mut().find(|c| c.slug == def.slug) {
            existing.name_et = def.name_et.clone();
            existing.name_en = def.name_en.clone();
            existing.is_active = true;
            existing.scrape_interval_hours = scrape_interval_hours;
            return Ok(existing.clone());
        }
        let category = Category {
            id: Uuid::new_v4(),
            slug: def.slug.clone(),
            name_et: def.name_et.clone(),
            name_en: def.name_en.clone(),
            parent_id: None,
            is_active: true,
            scrape_interval_hours,
        };
        state.categories.push(category.clone());
        Ok(category)
    }

    async fn set_category_parent(
        &self,
        category_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let category = state
            .categories
            .iter_mut()
            .find(|c| c.id == category_id)
            .ok_or_else(|| not_found("category", category_id))?;
        category.parent_id = parent_id;
        Ok(())
    }

    async fn find_category_by_id(&self, id: Uuid) -> StoreResult<Option<Category>> {
        Ok(self.state.lock().await.categories.iter().find(|c| c.id == id).cloned())
    }

    async fn find_category_by_slug(&self, slug: &str) -> StoreResult<Option<Category>> {
        Ok(self
            .state
            .lock()
            .await
            .categories
            .iter()
            .find(|c| c.slug == slug)
            .cloned())
    }

    async fn list_active_categories(&self) -> StoreResult<Vec<Category>> {
        let mut categories: Vec<Category> = self
            .state
            .lock()
            .await
            .categories
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        categories.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(categories)
    }

    async fn last_run_started_at(&self, category_id: Uuid) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .lock()
            .await
            .runs
            .iter()
            .filter(|r| r.category_id == category_id)
            .map(|r| r.started_at)
            .max())
    }

    async fn insert_scrape_run(&self, run: &ScrapeRun) -> StoreResult<()> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn get_scrape_run(&self, id: Uuid) -> StoreResult<Option<ScrapeRun>> {
        Ok(self.state.lock().await.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn complete_scrape_run(
        &self,
        id: Uuid,
        totals: &ScrapeRunTotals,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let run = state.run_mut(id)?;
        run.status = ScrapeRunStatus::Completed;
        run.total_products = totals.total_products;
        run.new_products = totals.new_products;
        run.price_changes = totals.price_changes;
        run.pages_scraped = totals.pages_scraped;
        run.duration_ms = Some(totals.duration_ms);
        run.completed_at = Some(completed_at);
        Ok(())
    }

    async fn fail_scrape_run(
        &self,
        id: Uuid,
        error_message: &str,
        duration_ms: i64,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let run = state.run_mut(id)?;
        run.status = ScrapeRunStatus::Failed;
        run.error_message = Some(error_message.to_string());
        run.duration_ms = Some(duration_ms);
        run.completed_at = Some(completed_at);
        Ok(())
    }

    async fn fail_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        error_message: &str,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        let mut state = self.state.lock().await;
        let mut stale: Vec<&mut ScrapeRun> = state
            .runs
            .iter_mut()
            .filter(|r| r.status == ScrapeRunStatus::Running && r.started_at < started_before)
            .collect();
        stale.sort_by_key(|r| r.started_at);
        let mut ids = Vec::with_capacity(stale.len());
        for run in stale {
            run.status = ScrapeRunStatus::Failed;
            run.error_message = Some(error_message.to_string());
            run.completed_at = Some(completed_at);
            ids.push(run.id);
        }
        Ok(ids)
    }

    async fn find_report_summary(&self, scrape_run_id: Uuid) -> StoreResult<Option<ReportSummary>> {
        let state = self.state.lock().await;
        let Some(report) = state.reports.iter().find(|r| r.scrape_run_id == scrape_run_id) else {
            return Ok(None);
        };
        Ok(Some(ReportSummary {
            report: report.clone(),
            change_types: state
                .change_items
                .iter()
                .filter(|i| i.change_report_id == report.id)
                .map(|i| i.change_type)
                .collect(),
            delivery_count: state
                .deliveries
                .iter()
                .filter(|d| d.change_report_id == report.id)
                .count(),
        }))
    }

    async fn run_snapshots(&self, scrape_run_id: Uuid) -> StoreResult<Vec<CurrentRunProduct>> {
        let state = self.state.lock().await;
        let mut snapshots: Vec<&ProductSnapshot> = state
            .snapshots
            .iter()
            .filter(|s| s.scrape_run_id == scrape_run_id)
            .collect();
        snapshots.sort_by_key(|s| s.scraped_at);
        snapshots
            .into_iter()
            .map(|snapshot| -> StoreResult<CurrentRunProduct> {
                Ok(CurrentRunProduct {
                    product: state.product(snapshot.product_id)?.clone(),
                    snapshot: snapshot.clone(),
                })
            })
            .collect()
    }

    async fn has_completed_run_before(
        &self,
        category_id: Uuid,
        before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        Ok(self.state.lock().await.runs.iter().any(|r| {
            r.category_id == category_id
                && r.status == ScrapeRunStatus::Completed
                && r.started_at < before
        }))
    }

    async fn latest_snapshots_before(
        &self,
        product_ids: &[Uuid],
        before: DateTime<Utc>,
    ) -> StoreResult<HashMap<Uuid, HistoricalSnapshot>> {
        let state = self.state.lock().await;
        let mut latest: HashMap<Uuid, HistoricalSnapshot> = HashMap::new();
        for snapshot in state
            .snapshots
            .iter()
            .filter(|s| s.scraped_at < before && product_ids.contains(&s.product_id))
        {
            let newer = latest
                .get(&snapshot.product_id)
                .map_or(true, |seen| snapshot.scraped_at >= seen.scraped_at);
            if newer {
                latest.insert(
                    snapshot.product_id,
                    HistoricalSnapshot {
                        product_id: snapshot.product_id,
                        price: snapshot.price,
                        original_price: snapshot.original_price,
                        in_stock: snapshot.in_stock,
                        scraped_at: snapshot.scraped_at,
                    },
                );
            }
        }
        Ok(latest)
    }

    async fn subscribed_recipients(&self, category_id: Uuid) -> StoreResult<Vec<DeliveryRecipient>> {
        let state = self.state.lock().await;
        let mut recipients = Vec::new();
        for subscription in state
            .subscriptions
            .iter()
            .filter(|s| s.category_id == category_id && s.is_active)
        {
            let Some(user) = state.user(subscription.user_id).filter(|u| u.is_active) else {
                continue;
            };
            recipients.extend(
                state
                    .channels
                    .iter()
                    .filter(|c| {
                        c.user_id == user.id
                            && c.is_active
                            && c.is_default
                            && c.channel_type == ChannelType::Email
                    })
                    .map(|c| DeliveryRecipient {
                        user_id: user.id,
                        role: user.role,
                        notification_channel_id: c.id,
                    }),
            );
        }
        Ok(recipients)
    }

    async fn pending_immediate_payloads(
        &self,
        change_report_id: Uuid,
    ) -> StoreResult<Vec<DeliveryPayload>> {
        let state = self.state.lock().await;
        let mut deliveries: Vec<&NotificationDelivery> = state
            .deliveries
            .iter()
            .filter(|d| d.change_report_id == change_report_id && d.status == DeliveryStatus::Pending)
            .filter(|d| {
                state
                    .user(d.user_id)
                    .is_some_and(|u| u.role.receives_immediate())
            })
            .collect();
        deliveries.sort_by_key(|d| d.created_at);
        deliveries.into_iter().map(|d| state.payload(d)).collect()
    }

    async fn pending_digest_payloads(
        &self,
        watermark_cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<DeliveryPayload>> {
        let state = self.state.lock().await;
        let mut deliveries: Vec<&NotificationDelivery> = state
            .deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::Pending)
            .filter(|d| {
                state.user(d.user_id).is_some_and(|u| {
                    u.is_active
                        && u.role == UserRole::Free
                        && u.last_digest_sent_at.map_or(true, |at| at <= watermark_cutoff)
                })
            })
            .collect();
        deliveries.sort_by_key(|d| (d.user_id, d.created_at));
        deliveries.into_iter().map(|d| state.payload(d)).collect()
    }

    async fn record_delivery_outcome(
        &self,
        delivery_id: Uuid,
        outcome: &DeliveryOutcome,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let delivery = state
            .deliveries
            .iter_mut()
            .find(|d| d.id == delivery_id)
            .ok_or_else(|| not_found("notification delivery", delivery_id))?;
        if !delivery.status.can_transition_to(outcome.status()) {
            return Ok(false);
        }
        delivery.status = outcome.status();
        delivery.sent_at = outcome.sent_at();
        delivery.error_message = outcome.error_message().map(str::to_string);
        Ok(true)
    }
}
