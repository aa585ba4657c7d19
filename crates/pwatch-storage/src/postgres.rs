//! PostgreSQL `Store` over a sqlx pool.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pwatch_core::{
    Category, CategoryDef, CategoryRef, ChangeReport, CurrentRunProduct, DeliveryOutcome,
    DeliveryPayload, DeliveryRecipient, HistoricalSnapshot, NewChangeItem, NotificationChannel,
    ParsedProduct, Product, ProductRef, ProductSnapshot, ReportChangeItem, ReportHeader,
    ReportSummary, ScrapeRun, ScrapeRunTotals, UnknownCode, User,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::store::{Store, StoreError, StoreResult, StoreTx, TxLimits};

const CATEGORY_COLUMNS: &str =
    "id, slug, name_et, name_en, parent_id, is_active, scrape_interval_hours";

const RUN_COLUMNS: &str = "id, category_id, status, started_at, completed_at, total_products, \
     new_products, price_changes, sold_out, back_in_stock, pages_scraped, duration_ms, error_message";

const PRODUCT_COLUMNS: &str = "id, external_url, name, image_url, current_price, original_price, \
     in_stock, first_seen_at, last_seen_at";

const PAYLOAD_SELECT: &str = r#"
    SELECT d.id AS delivery_id,
           d.created_at AS delivery_created_at,
           u.id AS user_id, u.email, u.name AS user_name, u.role, u.is_active AS user_active,
           u.last_digest_sent_at,
           ch.id AS channel_id, ch.channel_type, ch.destination,
           ch.is_active AS channel_active, ch.is_default,
           r.id AS report_id, r.created_at AS report_created_at, r.total_changes,
           sr.id AS run_id, sr.completed_at AS run_completed_at,
           c.id AS category_id, c.slug, c.name_et
      FROM notification_deliveries d
      JOIN users u ON u.id = d.user_id
      JOIN notification_channels ch ON ch.id = d.notification_channel_id
      JOIN change_reports r ON r.id = d.change_report_id
      JOIN scrape_runs sr ON sr.id = r.scrape_run_id
      JOIN categories c ON c.id = sr.category_id
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn report_items(
        &self,
        report_ids: &[Uuid],
    ) -> StoreResult<HashMap<Uuid, Vec<ReportChangeItem>>> {
        let rows = sqlx::query(
            r#"
            SELECT i.id, i.change_report_id, i.change_type, i.old_price, i.new_price,
                   i.old_stock_status, i.new_stock_status,
                   p.id AS product_id, p.name, p.external_url, p.image_url
              FROM change_items i
              JOIN products p ON p.id = i.product_id
             WHERE i.change_report_id = ANY($1)
             ORDER BY i.seq
            "#,
        )
        .bind(report_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out: HashMap<Uuid, Vec<ReportChangeItem>> = HashMap::new();
        for row in rows {
            let report_id: Uuid = row.try_get("change_report_id")?;
            out.entry(report_id).or_default().push(ReportChangeItem {
                id: row.try_get("id")?,
                change_type: decode_code(row.try_get("change_type")?)?,
                old_price: row.try_get("old_price")?,
                new_price: row.try_get("new_price")?,
                old_stock_status: row.try_get("old_stock_status")?,
                new_stock_status: row.try_get("new_stock_status")?,
                product: ProductRef {
                    id: row.try_get("product_id")?,
                    name: row.try_get("name")?,
                    external_url: row.try_get("external_url")?,
                    image_url: row.try_get("image_url")?,
                },
            });
        }
        Ok(out)
    }

    async fn payloads_from_rows(&self, rows: Vec<PgRow>) -> StoreResult<Vec<DeliveryPayload>> {
        let mut report_ids: Vec<Uuid> = Vec::new();
        for row in &rows {
            let id: Uuid = row.try_get("report_id")?;
            if !report_ids.contains(&id) {
                report_ids.push(id);
            }
        }
        let items = self.report_items(&report_ids).await?;

        rows.into_iter()
            .map(|row| -> StoreResult<DeliveryPayload> {
                let report_id: Uuid = row.try_get("report_id")?;
                Ok(DeliveryPayload {
                    delivery_id: row.try_get("delivery_id")?,
                    created_at: row.try_get("delivery_created_at")?,
                    user: User {
                        id: row.try_get("user_id")?,
                        email: row.try_get("email")?,
                        name: row.try_get("user_name")?,
                        role: decode_code(row.try_get("role")?)?,
                        is_active: row.try_get("user_active")?,
                        last_digest_sent_at: row.try_get("last_digest_sent_at")?,
                    },
                    channel: NotificationChannel {
                        id: row.try_get("channel_id")?,
                        user_id: row.try_get("user_id")?,
                        channel_type: decode_code(row.try_get("channel_type")?)?,
                        destination: row.try_get("destination")?,
                        is_active: row.try_get("channel_active")?,
                        is_default: row.try_get("is_default")?,
                    },
                    report: ReportHeader {
                        id: report_id,
                        created_at: row.try_get("report_created_at")?,
                        total_changes: row.try_get("total_changes")?,
                        scrape_run_id: row.try_get("run_id")?,
                        run_completed_at: row.try_get("run_completed_at")?,
                        category: CategoryRef {
                            id: row.try_get("category_id")?,
                            slug: row.try_get("slug")?,
                            name_et: row.try_get("name_et")?,
                        },
                    },
                    change_items: items.get(&report_id).cloned().unwrap_or_default(),
                })
            })
            .collect()
    }
}

fn decode_code<T>(code: String) -> StoreResult<T>
where
    T: FromStr<Err = UnknownCode>,
{
    code.parse().map_err(|err: UnknownCode| StoreError::Decode(err.to_string()))
}

fn conflict_or(err: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict(what());
        }
    }
    StoreError::Database(err)
}

fn category_from_row(row: &PgRow) -> StoreResult<Category> {
    Ok(Category {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name_et: row.try_get("name_et")?,
        name_en: row.try_get("name_en")?,
        parent_id: row.try_get("parent_id")?,
        is_active: row.try_get("is_active")?,
        scrape_interval_hours: row.try_get("scrape_interval_hours")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<ScrapeRun> {
    Ok(ScrapeRun {
        id: row.try_get("id")?,
        category_id: row.try_get("category_id")?,
        status: decode_code(row.try_get("status")?)?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        total_products: row.try_get("total_products")?,
        new_products: row.try_get("new_products")?,
        price_changes: row.try_get("price_changes")?,
        sold_out: row.try_get("sold_out")?,
        back_in_stock: row.try_get("back_in_stock")?,
        pages_scraped: row.try_get("pages_scraped")?,
        duration_ms: row.try_get("duration_ms")?,
        error_message: row.try_get("error_message")?,
    })
}

fn product_from_row(row: &PgRow) -> StoreResult<Product> {
    Ok(Product {
        id: row.try_get("id")?,
        external_url: row.try_get("external_url")?,
        name: row.try_get("name")?,
        image_url: row.try_get("image_url")?,
        current_price: row.try_get("current_price")?,
        original_price: row.try_get("original_price")?,
        in_stock: row.try_get("in_stock")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn find_product_by_url(&mut self, external_url: &str) -> StoreResult<Option<Product>> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE external_url = $1"
        ))
        .bind(external_url)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn insert_product(
        &mut self,
        observed: &ParsedProduct,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<Product> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO products (id, external_url, name, image_url, current_price, original_price,
                                  in_stock, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING {PRODUCT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&observed.external_url)
        .bind(&observed.name)
        .bind(&observed.image_url)
        .bind(observed.current_price)
        .bind(observed.original_price)
        .bind(observed.in_stock)
        .bind(seen_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| conflict_or(err, || format!("product {}", observed.external_url)))?;
        product_from_row(&row)
    }

    async fn update_product_observation(
        &mut self,
        product_id: Uuid,
        observed: &ParsedProduct,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE products
               SET name = $2,
                   image_url = $3,
                   current_price = $4,
                   original_price = $5,
                   in_stock = $6,
                   last_seen_at = $7
             WHERE id = $1
            "#,
        )
        .bind(product_id)
        .bind(&observed.name)
        .bind(&observed.image_url)
        .bind(observed.current_price)
        .bind(observed.original_price)
        .bind(observed.in_stock)
        .bind(seen_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn link_product_category(
        &mut self,
        product_id: Uuid,
        category_id: Uuid,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO product_categories (product_id, category_id)
            VALUES ($1, $2)
            ON CONFLICT (product_id, category_id) DO NOTHING
            "#,
        )
        .bind(product_id)
        .bind(category_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_snapshot(
        &mut self,
        scrape_run_id: Uuid,
        product_id: Uuid,
        observed: &ParsedProduct,
        scraped_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO product_snapshots (id, scrape_run_id, product_id, name, image_url, price,
                                           original_price, in_stock, scraped_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scrape_run_id)
        .bind(product_id)
        .bind(&observed.name)
        .bind(&observed.image_url)
        .bind(observed.current_price)
        .bind(observed.original_price)
        .bind(observed.in_stock)
        .bind(scraped_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn linked_urls_missing_from(
        &mut self,
        category_id: Uuid,
        present: &[String],
    ) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT p.external_url
              FROM product_categories pc
              JOIN products p ON p.id = pc.product_id
             WHERE pc.category_id = $1
               AND NOT (p.external_url = ANY($2))
             ORDER BY p.external_url
            "#,
        )
        .bind(category_id)
        .bind(present)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| row.try_get("external_url").map_err(StoreError::from))
            .collect()
    }

    async fn set_run_stock_counts(
        &mut self,
        scrape_run_id: Uuid,
        sold_out: i32,
        back_in_stock: i32,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE scrape_runs SET sold_out = $2, back_in_stock = $3 WHERE id = $1")
            .bind(scrape_run_id)
            .bind(sold_out)
            .bind(back_in_stock)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_change_report(
        &mut self,
        scrape_run_id: Uuid,
        total_changes: i32,
        created_at: DateTime<Utc>,
    ) -> StoreResult<ChangeReport> {
        let report = ChangeReport {
            id: Uuid::new_v4(),
            scrape_run_id,
            total_changes,
            created_at,
        };
        sqlx::query(
            r#"
            INSERT INTO change_reports (id, scrape_run_id, total_changes, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(report.id)
        .bind(report.scrape_run_id)
        .bind(report.total_changes)
        .bind(report.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| conflict_or(err, || format!("change report for run {scrape_run_id}")))?;
        Ok(report)
    }

    async fn insert_change_items(
        &mut self,
        change_report_id: Uuid,
        items: &[NewChangeItem],
    ) -> StoreResult<()> {
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO change_items (id, change_report_id, product_id, change_type,
                                          old_price, new_price, old_stock_status, new_stock_status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(change_report_id)
            .bind(item.product_id)
            .bind(item.change_type.as_str())
            .bind(item.old_price)
            .bind(item.new_price)
            .bind(item.old_stock_status)
            .bind(item.new_stock_status)
            .execute(&mut *self.tx)
            .await?;
        }
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
            let result = sqlx::query(
                r#"
                INSERT INTO notification_deliveries
                       (id, change_report_id, user_id, notification_channel_id, status, created_at)
                VALUES ($1, $2, $3, $4, 'pending', $5)
                ON CONFLICT (change_report_id, notification_channel_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(change_report_id)
            .bind(recipient.user_id)
            .bind(recipient.notification_channel_id)
            .bind(created_at)
            .execute(&mut *self.tx)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn mark_deliveries_sent(
        &mut self,
        delivery_ids: &[Uuid],
        sent_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notification_deliveries
               SET status = 'sent',
                   sent_at = $2,
                   error_message = NULL
             WHERE id = ANY($1)
               AND status = 'pending'
            "#,
        )
        .bind(delivery_ids)
        .bind(sent_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn set_digest_watermark(
        &mut self,
        user_id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET last_digest_sent_at = $2 WHERE id = $1")
            .bind(user_id)
            .bind(sent_at)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "user",
                key: user_id.to_string(),
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self, limits: TxLimits) -> StoreResult<Box<dyn StoreTx>> {
        let mut tx = tokio::time::timeout(limits.max_wait, self.pool.begin())
            .await
            .map_err(|_| StoreError::BeginTimeout(limits.max_wait))??;
        // mirror the unit-of-work bound on the server
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            limits.timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;
        debug!(?limits, "transaction started");
        Ok(Box::new(PgTx { tx }))
    }

    async fn upsert_category(
        &self,
        def: &CategoryDef,
        scrape_interval_hours: i32,
    ) -> StoreResult<Category> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO categories (id, slug, name_et, name_en, is_active, scrape_interval_hours)
            VALUES ($1, $2, $3, $4, TRUE, $5)
            ON CONFLICT (slug) DO UPDATE
               SET name_et = EXCLUDED.name_et,
                   name_en = EXCLUDED.name_en,
                   is_active = TRUE,
                   scrape_interval_hours = EXCLUDED.scrape_interval_hours,
                   updated_at = NOW()
            RETURNING {CATEGORY_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&def.slug)
        .bind(&def.name_et)
        .bind(&def.name_en)
        .bind(scrape_interval_hours)
        .fetch_one(&self.pool)
        .await?;
        category_from_row(&row)
    }

    async fn set_category_parent(
        &self,
        category_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE categories SET parent_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(category_id)
            .bind(parent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_category_by_id(&self, id: Uuid) -> StoreResult<Option<Category>> {
        let row = sqlx::query(&format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(category_from_row).transpose()
    }

    async fn find_category_by_slug(&self, slug: &str) -> StoreResult<Option<Category>> {
        let row = sqlx::query(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM categories WHERE slug = $1"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(category_from_row).transpose()
    }

    async fn list_active_categories(&self) -> StoreResult<Vec<Category>> {
        let rows = sqlx::query(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM categories WHERE is_active ORDER BY slug"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(category_from_row).collect()
    }

    async fn last_run_started_at(&self, category_id: Uuid) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(started_at) AS last FROM scrape_runs WHERE category_id = $1")
            .bind(category_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("last")?)
    }

    async fn insert_scrape_run(&self, run: &ScrapeRun) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scrape_runs (id, category_id, status, started_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run.id)
        .bind(run.category_id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_scrape_run(&self, id: Uuid) -> StoreResult<Option<ScrapeRun>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM scrape_runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn complete_scrape_run(
        &self,
        id: Uuid,
        totals: &ScrapeRunTotals,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE scrape_runs
               SET status = 'completed',
                   total_products = $2,
                   new_products = $3,
                   price_changes = $4,
                   pages_scraped = $5,
                   duration_ms = $6,
                   completed_at = $7
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(totals.total_products)
        .bind(totals.new_products)
        .bind(totals.price_changes)
        .bind(totals.pages_scraped)
        .bind(totals.duration_ms)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_scrape_run(
        &self,
        id: Uuid,
        error_message: &str,
        duration_ms: i64,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE scrape_runs
               SET status = 'failed',
                   error_message = $2,
                   duration_ms = $3,
                   completed_at = $4
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_message)
        .bind(duration_ms)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        error_message: &str,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            UPDATE scrape_runs
               SET status = 'failed',
                   error_message = $2,
                   completed_at = $3
             WHERE status = 'running'
               AND started_at < $1
            RETURNING id, started_at
            "#,
        )
        .bind(started_before)
        .bind(error_message)
        .bind(completed_at)
        .fetch_all(&self.pool)
        .await?;

        let mut stale = rows
            .iter()
            .map(|row| -> StoreResult<(DateTime<Utc>, Uuid)> {
                let started_at: DateTime<Utc> = row.try_get("started_at")?;
                let id: Uuid = row.try_get("id")?;
                Ok((started_at, id))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        stale.sort();
        Ok(stale.into_iter().map(|(_, id)| id).collect())
    }

    async fn find_report_summary(&self, scrape_run_id: Uuid) -> StoreResult<Option<ReportSummary>> {
        let Some(row) = sqlx::query(
            r#"
            SELECT r.id, r.scrape_run_id, r.total_changes, r.created_at,
                   (SELECT COUNT(*) FROM notification_deliveries d WHERE d.change_report_id = r.id)
                       AS delivery_count
              FROM change_reports r
             WHERE r.scrape_run_id = $1
            "#,
        )
        .bind(scrape_run_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let report = ChangeReport {
            id: row.try_get("id")?,
            scrape_run_id: row.try_get("scrape_run_id")?,
            total_changes: row.try_get("total_changes")?,
            created_at: row.try_get("created_at")?,
        };
        let delivery_count: i64 = row.try_get("delivery_count")?;

        let type_rows = sqlx::query("SELECT change_type FROM change_items WHERE change_report_id = $1")
            .bind(report.id)
            .fetch_all(&self.pool)
            .await?;
        let change_types = type_rows
            .iter()
            .map(|r| decode_code(r.try_get("change_type")?))
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Some(ReportSummary {
            report,
            change_types,
            delivery_count: delivery_count as usize,
        }))
    }

    async fn run_snapshots(&self, scrape_run_id: Uuid) -> StoreResult<Vec<CurrentRunProduct>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id AS snapshot_id, s.scrape_run_id, s.name AS snapshot_name,
                   s.image_url AS snapshot_image_url, s.price, s.original_price AS snapshot_original_price,
                   s.in_stock AS snapshot_in_stock, s.scraped_at,
                   p.id, p.external_url, p.name, p.image_url, p.current_price, p.original_price,
                   p.in_stock, p.first_seen_at, p.last_seen_at
              FROM product_snapshots s
              JOIN products p ON p.id = s.product_id
             WHERE s.scrape_run_id = $1
             ORDER BY s.scraped_at ASC
            "#,
        )
        .bind(scrape_run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<CurrentRunProduct> {
                let product = product_from_row(row)?;
                Ok(CurrentRunProduct {
                    snapshot: ProductSnapshot {
                        id: row.try_get("snapshot_id")?,
                        scrape_run_id: row.try_get("scrape_run_id")?,
                        product_id: product.id,
                        name: row.try_get("snapshot_name")?,
                        image_url: row.try_get("snapshot_image_url")?,
                        price: row.try_get("price")?,
                        original_price: row.try_get("snapshot_original_price")?,
                        in_stock: row.try_get("snapshot_in_stock")?,
                        scraped_at: row.try_get("scraped_at")?,
                    },
                    product,
                })
            })
            .collect()
    }

    async fn has_completed_run_before(
        &self,
        category_id: Uuid,
        before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM scrape_runs
                 WHERE category_id = $1
                   AND status = 'completed'
                   AND started_at < $2
            ) AS found
            "#,
        )
        .bind(category_id)
        .bind(before)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("found")?)
    }

    async fn latest_snapshots_before(
        &self,
        product_ids: &[Uuid],
        before: DateTime<Utc>,
    ) -> StoreResult<HashMap<Uuid, HistoricalSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (product_id)
                   product_id, price, original_price, in_stock, scraped_at
              FROM product_snapshots
             WHERE product_id = ANY($1)
               AND scraped_at < $2
             ORDER BY product_id, scraped_at DESC
            "#,
        )
        .bind(product_ids)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let snapshot = HistoricalSnapshot {
                product_id: row.try_get("product_id")?,
                price: row.try_get("price")?,
                original_price: row.try_get("original_price")?,
                in_stock: row.try_get("in_stock")?,
                scraped_at: row.try_get("scraped_at")?,
            };
            out.insert(snapshot.product_id, snapshot);
        }
        Ok(out)
    }

    async fn subscribed_recipients(&self, category_id: Uuid) -> StoreResult<Vec<DeliveryRecipient>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id AS user_id, u.role, ch.id AS channel_id
              FROM user_subscriptions s
              JOIN users u ON u.id = s.user_id
              JOIN notification_channels ch ON ch.user_id = u.id
             WHERE s.category_id = $1
               AND s.is_active
               AND u.is_active
               AND ch.is_active
               AND ch.is_default
               AND ch.channel_type = 'email'
             ORDER BY u.id, ch.id
            "#,
        )
        .bind(category_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<DeliveryRecipient> {
                Ok(DeliveryRecipient {
                    user_id: row.try_get("user_id")?,
                    role: decode_code(row.try_get("role")?)?,
                    notification_channel_id: row.try_get("channel_id")?,
                })
            })
            .collect()
    }

    async fn pending_immediate_payloads(
        &self,
        change_report_id: Uuid,
    ) -> StoreResult<Vec<DeliveryPayload>> {
        let rows = sqlx::query(&format!(
            r#"{PAYLOAD_SELECT}
             WHERE d.change_report_id = $1
               AND d.status = 'pending'
               AND u.role IN ('paid', 'admin')
             ORDER BY d.created_at ASC
            "#
        ))
        .bind(change_report_id)
        .fetch_all(&self.pool)
        .await?;
        self.payloads_from_rows(rows).await
    }

    async fn pending_digest_payloads(
        &self,
        watermark_cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<DeliveryPayload>> {
        let rows = sqlx::query(&format!(
            r#"{PAYLOAD_SELECT}
             WHERE d.status = 'pending'
               AND u.is_active
               AND u.role = 'free'
               AND (u.last_digest_sent_at IS NULL OR u.last_digest_sent_at <= $1)
             ORDER BY d.user_id ASC, d.created_at ASC
            "#
        ))
        .bind(watermark_cutoff)
        .fetch_all(&self.pool)
        .await?;
        self.payloads_from_rows(rows).await
    }

    async fn record_delivery_outcome(
        &self,
        delivery_id: Uuid,
        outcome: &DeliveryOutcome,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notification_deliveries
               SET status = $2,
                   sent_at = $3,
                   error_message = $4
             WHERE id = $1
               AND status = 'pending'
            "#,
        )
        .bind(delivery_id)
        .bind(outcome.status().as_str())
        .bind(outcome.sent_at())
        .bind(outcome.error_message())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool = sqlx::query("SELECT EXISTS (SELECT 1 FROM notification_deliveries WHERE id = $1) AS found")
            .bind(delivery_id)
            .fetch_one(&self.pool)
            .await?
            .try_get("found")?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound {
                entity: "notification delivery",
                key: delivery_id.to_string(),
            })
        }
    }
}
