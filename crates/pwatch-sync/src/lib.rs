//! Pipelines over the store: scrape runs, the diff engine, notification
//! dispatch, the stale-run sweep and their cron schedule.

pub mod cleanup;
pub mod clock;
pub mod config;
pub mod diff;
pub mod notify;
pub mod registry;
pub mod scheduler;
pub mod scrape;

use std::sync::Arc;

use anyhow::{Context, Result};
use pwatch_adapters::{adapter_for_storefront, ListingAdapter, WOOCOMMERCE_STOREFRONT};
use pwatch_storage::{HttpFetcher, PageSource, PgStore, Store};
use tracing::info;

pub use cleanup::{
    parse_stale_minutes, CleanupError, CleanupResult, DEFAULT_STALE_MINUTES, MAX_STALE_MINUTES,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EmailConfig, EmailProvider, ScraperConfig, SyncConfig};
pub use diff::{detect_changes, DetectedChanges, DiffContext, DiffError, DiffRunResult};
pub use notify::transport::{
    transport_from_config, EmailMessage, EmailTransport, LogTransport, RecordingTransport,
    ResendTransport, TransportError,
};
pub use notify::{DigestDispatchResult, ImmediateDispatchResult, DIGEST_COOLDOWN_HOURS};
pub use registry::{resolve_category, seed_categories, CategoryRegistry, SeedResult};
pub use scheduler::{maybe_build_scheduler, DueScrapeSummary};
pub use scrape::{crawl_category, upsert_products, CrawlLimits, ScrapeError, ScrapeResult};

pub const CRATE_NAME: &str = "pwatch-sync";

/// Collaborators shared by every pipeline, fixed at construction.
pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn Store>,
    pages: Arc<dyn PageSource>,
    adapter: Arc<dyn ListingAdapter>,
    transport: Arc<dyn EmailTransport>,
    clock: Arc<dyn Clock>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn Store>,
        pages: Arc<dyn PageSource>,
        adapter: Arc<dyn ListingAdapter>,
        transport: Arc<dyn EmailTransport>,
    ) -> Self {
        Self {
            config,
            store,
            pages,
            adapter,
            transport,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Production wiring: Postgres, the HTTP fetcher, the WooCommerce
    /// adapter and the configured email transport.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        let pages = HttpFetcher::new(config.http_client_config())?;
        let adapter = adapter_for_storefront(WOOCOMMERCE_STOREFRONT, &config.scraper.base_url)
            .context("building listing adapter")?;
        let transport = transport_from_config(&config.email)?;
        info!(
            base_url = %config.scraper.base_url,
            email_provider = ?config.email.provider,
            "pipeline connected"
        );
        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(pages),
            Arc::from(adapter),
            transport,
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Loads the configured category list and upserts it.
    pub async fn seed_categories(&self) -> Result<SeedResult> {
        let registry = CategoryRegistry::load(self.config.categories_file.as_deref()).await?;
        seed_categories(self.store.as_ref(), &registry).await
    }
}
