#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pwatch_adapters::{WooCommerceAdapter, WooCommerceSelectors};
use pwatch_core::{
    Category, CategorySubscription, ChannelType, NotificationChannel, User, UserRole,
};
use pwatch_storage::{FetchError, MemoryState, MemoryStore, PageSource, Store};
use pwatch_sync::{
    seed_categories, CategoryRegistry, ManualClock, RecordingTransport, ScrapeResult, SyncConfig,
    SyncPipeline,
};
use uuid::Uuid;

pub const BASE_URL: &str = "https://mabrik.ee";

/// Listing pages served from memory, keyed by absolute URL.
#[derive(Default)]
pub struct FixtureSite {
    pages: Mutex<HashMap<String, String>>,
    fetched: Mutex<Vec<String>>,
}

impl FixtureSite {
    pub fn serve(&self, url: &str, html: String) {
        self.pages.lock().unwrap().insert(url.to_string(), html);
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for FixtureSite {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
                attempts: 1,
            })
    }

    async fn wait_between_requests(&self) {}
}

#[derive(Debug, Clone)]
pub struct Card {
    pub slug: &'static str,
    pub name: &'static str,
    pub price: &'static str,
    pub in_stock: bool,
}

pub fn card(slug: &'static str, price: &'static str, in_stock: bool) -> Card {
    Card {
        slug,
        name: slug,
        price,
        in_stock,
    }
}

pub fn product_url(slug: &str) -> String {
    format!("{BASE_URL}/toode/{slug}")
}

pub fn category_url(slug: &str) -> String {
    format!("{BASE_URL}/tootekategooria/{slug}/")
}

pub fn listing_html(cards: &[Card], next: Option<&str>) -> String {
    let items: String = cards
        .iter()
        .map(|c| {
            format!(
                r#"<li class="product type-product {stock}">
  <a href="/toode/{slug}/" class="woocommerce-LoopProduct-link woocommerce-loop-product__link">
    <img src="/wp-content/uploads/{slug}.jpg" alt="{name}">
    <h2 class="woocommerce-loop-product__title">{name}</h2>
    <span class="price"><span class="woocommerce-Price-amount amount"><bdi>{price}&nbsp;&euro;</bdi></span></span>
  </a>
</li>"#,
                stock = if c.in_stock { "instock" } else { "outofstock" },
                slug = c.slug,
                name = c.name,
                price = c.price,
            )
        })
        .collect();
    let pagination = next
        .map(|href| format!(r#"<nav class="woocommerce-pagination"><a class="next page-numbers" href="{href}">&rarr;</a></nav>"#))
        .unwrap_or_default();
    format!(r#"<html><body><ul class="products">{items}</ul>{pagination}</body></html>"#)
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_767_225_600, 0).unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub site: Arc<FixtureSite>,
    pub transport: Arc<RecordingTransport>,
    pub clock: Arc<ManualClock>,
    pub pipeline: SyncPipeline,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(SyncConfig::default()).await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let site = Arc::new(FixtureSite::default());
        let transport = Arc::new(RecordingTransport::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let adapter = WooCommerceAdapter::new(BASE_URL, WooCommerceSelectors::default()).unwrap();

        seed_categories(store.as_ref(), &CategoryRegistry::builtin())
            .await
            .unwrap();

        let pipeline = SyncPipeline::new(
            config,
            store.clone(),
            site.clone(),
            Arc::new(adapter),
            transport.clone(),
        )
        .with_clock(clock.clone());

        Self {
            store,
            site,
            transport,
            clock,
            pipeline,
        }
    }

    pub async fn category(&self, slug: &str) -> Category {
        self.store.find_category_by_slug(slug).await.unwrap().unwrap()
    }

    /// Serves a single-page listing for the category.
    pub fn list(&self, slug: &str, cards: &[Card]) {
        self.site.serve(&category_url(slug), listing_html(cards, None));
    }

    /// Moves the clock one hour forward and scrapes.
    pub async fn scrape(&self, slug: &str) -> ScrapeResult {
        self.clock.advance(Duration::hours(1));
        self.pipeline.scrape_category(slug).await.unwrap()
    }

    pub async fn state(&self) -> MemoryState {
        self.store.snapshot().await
    }

    /// Active user with a default email channel, subscribed to `slug`.
    pub async fn subscriber(&self, role: UserRole, email: &str, slug: &str) -> (User, NotificationChannel) {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: email.split('@').next().unwrap_or(email).to_string(),
            role,
            is_active: true,
            last_digest_sent_at: None,
        };
        let channel = NotificationChannel {
            id: Uuid::new_v4(),
            user_id: user.id,
            channel_type: ChannelType::Email,
            destination: email.to_string(),
            is_active: true,
            is_default: true,
        };
        let category = self.category(slug).await;
        self.store.insert_user(user.clone()).await;
        self.store.insert_channel(channel.clone()).await;
        self.store
            .insert_subscription(CategorySubscription {
                id: Uuid::new_v4(),
                user_id: user.id,
                category_id: category.id,
                is_active: true,
            })
            .await;
        (user, channel)
    }
}
