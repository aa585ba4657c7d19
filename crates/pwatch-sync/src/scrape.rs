//! Scrape runs: crawl a category's listing pages, then reconcile the
//! observations against stored products in one unit of work.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use pwatch_adapters::{ListingAdapter, ParseError};
use pwatch_core::{Category, ParsedProduct, ScrapeRun, ScrapeRunStatus, ScrapeRunTotals};
use pwatch_storage::{within_limits, FetchError, PageSource, StoreError, StoreResult, StoreTx};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::registry::resolve_category;
use crate::SyncPipeline;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Category not found: {0}")]
    CategoryNotFound(String),
    #[error("Scraper safety limit reached after {0} pages")]
    SafetyLimit(u32),
    #[error("Parser produced zero valid products on the first page")]
    EmptyFirstPage,
    #[error("Too many parser warnings on a single page ({count} > {limit})")]
    TooManyWarnings { count: usize, limit: usize },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct CrawlLimits {
    pub max_pages: u32,
    pub parser_warning_limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlOutcome {
    /// Unique by external URL; a later page's card replaces an earlier one.
    pub products: Vec<ParsedProduct>,
    pub pages_scraped: u32,
    pub parser_warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub total_products: i32,
    pub new_products: i32,
    pub price_changes: i32,
    pub missing_product_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeResult {
    pub scrape_run_id: Uuid,
    pub status: ScrapeRunStatus,
    pub total_products: i32,
    pub new_products: i32,
    pub price_changes: i32,
    pub pages_scraped: i32,
    pub parser_warnings: Vec<String>,
    pub missing_product_urls: Vec<String>,
}

/// Collapses duplicate URLs, keeping first-seen order and last-seen values.
fn merge_by_url(merged: &mut Vec<ParsedProduct>, index: &mut HashMap<String, usize>, batch: Vec<ParsedProduct>) {
    for product in batch {
        match index.get(&product.external_url) {
            Some(&at) => merged[at] = product,
            None => {
                index.insert(product.external_url.clone(), merged.len());
                merged.push(product);
            }
        }
    }
}

/// Follows next-page links from `start_url` one page at a time.
pub async fn crawl_category(
    pages: &dyn PageSource,
    adapter: &dyn ListingAdapter,
    start_url: String,
    limits: CrawlLimits,
) -> Result<CrawlOutcome, ScrapeError> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut outcome = CrawlOutcome::default();
    let mut next = Some(start_url);

    while let Some(url) = next.take() {
        if !visited.insert(url.clone()) {
            warn!(%url, "pagination revisited a page; stopping");
            break;
        }
        if outcome.pages_scraped >= limits.max_pages {
            return Err(ScrapeError::SafetyLimit(outcome.pages_scraped));
        }

        let html = pages.fetch_page(&url).await?;
        let page = adapter.parse_listing(&html)?;

        for warning in &page.parser_warnings {
            warn!(%url, warning = %warning, "product card skipped");
        }
        outcome.parser_warnings.extend(page.parser_warnings.iter().cloned());

        if page.products.is_empty() && outcome.pages_scraped == 0 {
            return Err(ScrapeError::EmptyFirstPage);
        }
        if page.parser_warnings.len() > limits.parser_warning_limit {
            return Err(ScrapeError::TooManyWarnings {
                count: page.parser_warnings.len(),
                limit: limits.parser_warning_limit,
            });
        }

        merge_by_url(&mut outcome.products, &mut index, page.products);
        outcome.pages_scraped += 1;

        next = page.next_page_url;
        if next.is_some() {
            pages.wait_between_requests().await;
        }
    }

    Ok(outcome)
}

/// Reconciles one run's observations with stored products.
///
/// New products get a row, a category link and a first snapshot. Known
/// products are always overwritten; they get a snapshot only when a tracked
/// field changed. `price_changes` counts current-price differences alone.
pub async fn upsert_products(
    tx: &mut dyn StoreTx,
    category_id: Uuid,
    scrape_run_id: Uuid,
    products: &[ParsedProduct],
    seen_at: DateTime<Utc>,
) -> StoreResult<UpsertOutcome> {
    let mut outcome = UpsertOutcome::default();

    for observed in products {
        match tx.find_product_by_url(&observed.external_url).await? {
            None => {
                let product = tx.insert_product(observed, seen_at).await?;
                tx.link_product_category(product.id, category_id).await?;
                tx.insert_snapshot(scrape_run_id, product.id, observed, seen_at)
                    .await?;
                outcome.new_products += 1;
            }
            Some(existing) => {
                tx.link_product_category(existing.id, category_id).await?;
                let changed = existing.differs_from(observed);
                tx.update_product_observation(existing.id, observed, seen_at)
                    .await?;
                if changed {
                    tx.insert_snapshot(scrape_run_id, existing.id, observed, seen_at)
                        .await?;
                }
                if existing.current_price != observed.current_price {
                    outcome.price_changes += 1;
                }
            }
        }
    }

    let present: Vec<String> = products.iter().map(|p| p.external_url.clone()).collect();
    outcome.missing_product_urls = tx.linked_urls_missing_from(category_id, &present).await?;
    outcome.total_products = products.len() as i32;
    Ok(outcome)
}

impl SyncPipeline {
    fn crawl_limits(&self) -> CrawlLimits {
        CrawlLimits {
            max_pages: self.config.scraper.max_pages,
            parser_warning_limit: self.config.scraper.parser_warning_limit,
        }
    }

    /// Runs one scrape of the category named by UUID or slug.
    ///
    /// The run row is written RUNNING first. Any failure after that marks it
    /// FAILED with the error text; product writes already committed stay.
    pub async fn scrape_category(&self, id_or_slug: &str) -> Result<ScrapeResult, ScrapeError> {
        let category = resolve_category(self.store.as_ref(), id_or_slug)
            .await?
            .ok_or_else(|| ScrapeError::CategoryNotFound(id_or_slug.to_string()))?;

        let started_at = self.clock.now();
        let run = ScrapeRun::started(Uuid::new_v4(), category.id, started_at);
        self.store.insert_scrape_run(&run).await?;

        let span = info_span!("scrape_run", run_id = %run.id, category = %category.slug);
        self.execute_run(&category, &run).instrument(span).await
    }

    async fn execute_run(&self, category: &Category, run: &ScrapeRun) -> Result<ScrapeResult, ScrapeError> {
        match self.crawl_and_persist(category, run.id).await {
            Ok((crawl, upsert)) => {
                let completed_at = self.clock.now();
                let totals = ScrapeRunTotals {
                    total_products: upsert.total_products,
                    new_products: upsert.new_products,
                    price_changes: upsert.price_changes,
                    pages_scraped: crawl.pages_scraped as i32,
                    duration_ms: (completed_at - run.started_at).num_milliseconds(),
                };
                self.store
                    .complete_scrape_run(run.id, &totals, completed_at)
                    .await?;
                info!(
                    total = totals.total_products,
                    new = totals.new_products,
                    price_changes = totals.price_changes,
                    pages = totals.pages_scraped,
                    missing = upsert.missing_product_urls.len(),
                    "scrape run completed"
                );
                Ok(ScrapeResult {
                    scrape_run_id: run.id,
                    status: ScrapeRunStatus::Completed,
                    total_products: totals.total_products,
                    new_products: totals.new_products,
                    price_changes: totals.price_changes,
                    pages_scraped: totals.pages_scraped,
                    parser_warnings: crawl.parser_warnings,
                    missing_product_urls: upsert.missing_product_urls,
                })
            }
            Err(err) => {
                let completed_at = self.clock.now();
                let duration_ms = (completed_at - run.started_at).num_milliseconds();
                if let Err(mark_err) = self
                    .store
                    .fail_scrape_run(run.id, &err.to_string(), duration_ms, completed_at)
                    .await
                {
                    error!(error = %mark_err, "could not mark scrape run failed");
                }
                error!(error = %err, "scrape run failed");
                Err(err)
            }
        }
    }

    async fn crawl_and_persist(
        &self,
        category: &Category,
        scrape_run_id: Uuid,
    ) -> Result<(CrawlOutcome, UpsertOutcome), ScrapeError> {
        let start_url = self.adapter.category_url(&category.slug);
        let crawl = crawl_category(
            self.pages.as_ref(),
            self.adapter.as_ref(),
            start_url,
            self.crawl_limits(),
        )
        .await?;

        let limits = self.config.tx_limits;
        let mut tx = self.store.begin(limits).await?;
        let seen_at = self.clock.now();
        let upsert = within_limits(
            limits,
            upsert_products(tx.as_mut(), category.id, scrape_run_id, &crawl.products, seen_at),
        )
        .await?;
        tx.commit().await?;

        Ok((crawl, upsert))
    }
}
