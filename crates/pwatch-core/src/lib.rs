//! Core domain model for pwatch: categories, products, scrape runs, change
//! reports and notification deliveries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pwatch-core";

/// Default scrape interval applied to seeded categories.
pub const DEFAULT_SCRAPE_INTERVAL_HOURS: i32 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} code: {code}")]
pub struct UnknownCode {
    pub kind: &'static str,
    pub code: String,
}

macro_rules! string_coded_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $code:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $code),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownCode;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($code => Ok($name::$variant),)+
                    other => Err(UnknownCode {
                        kind: $kind,
                        code: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Static reference entry for a storefront category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDef {
    pub slug: String,
    pub name_et: String,
    pub name_en: String,
}

impl CategoryDef {
    pub fn new(slug: &str, name_et: &str, name_en: &str) -> Self {
        Self {
            slug: slug.to_string(),
            name_et: name_et.to_string(),
            name_en: name_en.to_string(),
        }
    }

    pub fn parent_slug(&self) -> Option<String> {
        parent_slug(&self.slug)
    }
}

/// Parent of a hierarchical slug: `a/b/c` has parent `a/b`, `a` has none.
pub fn parent_slug(slug: &str) -> Option<String> {
    slug.rsplit_once('/')
        .map(|(parent, _)| parent.to_string())
        .filter(|parent| !parent.is_empty())
}

/// Built-in category list used when no registry file is configured.
pub fn default_categories() -> Vec<CategoryDef> {
    vec![
        CategoryDef::new("eeltellimused", "Eeltellimused", "Pre-orders"),
        CategoryDef::new("lauamangud", "Lauamängud", "Board Games"),
        CategoryDef::new("kodu-ja-kollektsioon", "Kodu ja kollektsioon", "Home & Collectibles"),
        CategoryDef::new("funko", "Funko tooted", "Funko Products"),
        CategoryDef::new("miniatuurid", "Miniatuurimängud", "Miniature Games"),
        CategoryDef::new(
            "riided-ja-aksessuaarid",
            "Riided ja aksessuaarid",
            "Clothing & Accessories",
        ),
        CategoryDef::new(
            "varvid-ja-hobitooted",
            "Värvid ja hobitooted",
            "Paints & Hobby Supplies",
        ),
        CategoryDef::new("rollimangud", "Rollimängud", "Role-Playing Games"),
        CategoryDef::new("kaardimangud", "Kaardimängud", "Card Games"),
        CategoryDef::new("raamatud-ja-koomiksid", "Raamatud ja koomiksid", "Books & Comics"),
        CategoryDef::new(
            "kodu-ja-kollektsioon/figuurid-ja-manguasjad",
            "Figuurid ja mänguasjad",
            "Figures & Toys",
        ),
        CategoryDef::new("lopumuuk", "Lõpumüük", "Clearance Sale"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub slug: String,
    pub name_et: String,
    pub name_en: String,
    pub parent_id: Option<Uuid>,
    pub is_active: bool,
    pub scrape_interval_hours: i32,
}

/// Compact category view embedded in report payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRef {
    pub id: Uuid,
    pub slug: String,
    pub name_et: String,
}

/// One product card as observed on a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedProduct {
    pub external_url: String,
    pub name: String,
    pub image_url: String,
    pub current_price: Decimal,
    pub original_price: Option<Decimal>,
    pub in_stock: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub external_url: String,
    pub name: String,
    pub image_url: String,
    pub current_price: Decimal,
    pub original_price: Option<Decimal>,
    pub in_stock: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Product {
    /// True when any snapshot-tracked field differs from the observation.
    ///
    /// Prices compare as decimals, so `12.9` and `12.90` are equal.
    pub fn differs_from(&self, observed: &ParsedProduct) -> bool {
        self.name != observed.name
            || self.image_url != observed.image_url
            || self.in_stock != observed.in_stock
            || self.current_price != observed.current_price
            || self.original_price != observed.original_price
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: Uuid,
    pub scrape_run_id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub image_url: String,
    pub price: Decimal,
    pub original_price: Option<Decimal>,
    pub in_stock: bool,
    pub scraped_at: DateTime<Utc>,
}

/// Compact product view embedded in report payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub id: Uuid,
    pub name: String,
    pub external_url: String,
    pub image_url: String,
}

/// Lifecycle of a scrape run. Only RUNNING moves, to COMPLETED or FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

string_coded_enum!(ScrapeRunStatus, "scrape run status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: Uuid,
    pub category_id: Uuid,
    pub status: ScrapeRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_products: i32,
    pub new_products: i32,
    pub price_changes: i32,
    pub sold_out: i32,
    pub back_in_stock: i32,
    pub pages_scraped: i32,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

impl ScrapeRun {
    pub fn started(id: Uuid, category_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            category_id,
            status: ScrapeRunStatus::Running,
            started_at,
            completed_at: None,
            total_products: 0,
            new_products: 0,
            price_changes: 0,
            sold_out: 0,
            back_in_stock: 0,
            pages_scraped: 0,
            duration_ms: None,
            error_message: None,
        }
    }
}

/// Aggregates written onto a run when it completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRunTotals {
    pub total_products: i32,
    pub new_products: i32,
    pub price_changes: i32,
    pub pages_scraped: i32,
    pub duration_ms: i64,
}

/// Kind of transition recorded on a change item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    NewProduct,
    PriceIncrease,
    PriceDecrease,
    SoldOut,
    BackInStock,
}

string_coded_enum!(ChangeType, "change type", {
    NewProduct => "new_product",
    PriceIncrease => "price_increase",
    PriceDecrease => "price_decrease",
    SoldOut => "sold_out",
    BackInStock => "back_in_stock",
});

impl ChangeType {
    pub fn label(&self) -> &'static str {
        match self {
            ChangeType::NewProduct => "New product",
            ChangeType::PriceIncrease => "Price increase",
            ChangeType::PriceDecrease => "Price decrease",
            ChangeType::SoldOut => "Sold out",
            ChangeType::BackInStock => "Back in stock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub id: Uuid,
    pub scrape_run_id: Uuid,
    pub total_changes: i32,
    pub created_at: DateTime<Utc>,
}

/// A detected transition before it is attached to a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChangeItem {
    pub product_id: Uuid,
    pub change_type: ChangeType,
    pub old_price: Option<Decimal>,
    pub new_price: Option<Decimal>,
    pub old_stock_status: Option<bool>,
    pub new_stock_status: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeItem {
    pub id: Uuid,
    pub change_report_id: Uuid,
    pub product_id: Uuid,
    pub change_type: ChangeType,
    pub old_price: Option<Decimal>,
    pub new_price: Option<Decimal>,
    pub old_stock_status: Option<bool>,
    pub new_stock_status: Option<bool>,
}

/// Account tier; decides between immediate alerts and digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Free,
    Paid,
    Admin,
}

string_coded_enum!(UserRole, "user role", {
    Free => "free",
    Paid => "paid",
    Admin => "admin",
});

impl UserRole {
    /// Paid and admin users are notified right after a report is created.
    pub fn receives_immediate(&self) -> bool {
        matches!(self, UserRole::Paid | UserRole::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub is_active: bool,
    pub last_digest_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Discord,
    Whatsapp,
    Signal,
    Sms,
}

string_coded_enum!(ChannelType, "channel type", {
    Email => "email",
    Discord => "discord",
    Whatsapp => "whatsapp",
    Signal => "signal",
    Sms => "sms",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel_type: ChannelType,
    pub destination: String,
    pub is_active: bool,
    pub is_default: bool,
}

/// A user following one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category_id: Uuid,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Skipped,
}

string_coded_enum!(DeliveryStatus, "delivery status", {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
    Skipped => "skipped",
});

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }

    /// Deliveries only ever leave PENDING; every other state is final.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        matches!(self, DeliveryStatus::Pending) && next.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDelivery {
    pub id: Uuid,
    pub change_report_id: Uuid,
    pub user_id: Uuid,
    pub notification_channel_id: Uuid,
    pub status: DeliveryStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal outcome recorded against a pending delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { at: DateTime<Utc> },
    Failed { error: String },
    Skipped { reason: String },
}

impl DeliveryOutcome {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            DeliveryOutcome::Sent { .. } => DeliveryStatus::Sent,
            DeliveryOutcome::Failed { .. } => DeliveryStatus::Failed,
            DeliveryOutcome::Skipped { .. } => DeliveryStatus::Skipped,
        }
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        match self {
            DeliveryOutcome::Sent { at } => Some(*at),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            DeliveryOutcome::Sent { .. } => None,
            DeliveryOutcome::Failed { error } => Some(error),
            DeliveryOutcome::Skipped { reason } => Some(reason),
        }
    }
}

/// A snapshot written during a run, joined with its owning product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentRunProduct {
    pub product: Product,
    pub snapshot: ProductSnapshot,
}

/// Tracked state of a product as of its latest snapshot before some instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalSnapshot {
    pub product_id: Uuid,
    pub price: Decimal,
    pub original_price: Option<Decimal>,
    pub in_stock: bool,
    pub scraped_at: DateTime<Utc>,
}

/// Subscriber resolved for a category: active subscription, active user,
/// active default email channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecipient {
    pub user_id: Uuid,
    pub role: UserRole,
    pub notification_channel_id: Uuid,
}

/// Stored report with the counts needed to answer a repeated diff request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub report: ChangeReport,
    pub change_types: Vec<ChangeType>,
    pub delivery_count: usize,
}

impl ReportSummary {
    pub fn count_of(&self, change_type: ChangeType) -> usize {
        self.change_types
            .iter()
            .filter(|t| **t == change_type)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportHeader {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub total_changes: i32,
    pub scrape_run_id: Uuid,
    pub run_completed_at: Option<DateTime<Utc>>,
    pub category: CategoryRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportChangeItem {
    pub id: Uuid,
    pub change_type: ChangeType,
    pub old_price: Option<Decimal>,
    pub new_price: Option<Decimal>,
    pub old_stock_status: Option<bool>,
    pub new_stock_status: Option<bool>,
    pub product: ProductRef,
}

/// Everything needed to render and route one pending delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub delivery_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub user: User,
    pub channel: NotificationChannel,
    pub report: ReportHeader,
    pub change_items: Vec<ReportChangeItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(price: &str) -> ParsedProduct {
        ParsedProduct {
            external_url: "https://shop.test/toode/a".into(),
            name: "A".into(),
            image_url: "https://shop.test/a.jpg".into(),
            current_price: price.parse().unwrap(),
            original_price: None,
            in_stock: true,
        }
    }

    fn product_from(p: &ParsedProduct) -> Product {
        let now = Utc::now();
        Product {
            id: Uuid::new_v4(),
            external_url: p.external_url.clone(),
            name: p.name.clone(),
            image_url: p.image_url.clone(),
            current_price: p.current_price,
            original_price: p.original_price,
            in_stock: p.in_stock,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    #[test]
    fn parent_slug_follows_path_segments() {
        assert_eq!(parent_slug("lauamangud"), None);
        assert_eq!(
            parent_slug("kodu-ja-kollektsioon/figuurid-ja-manguasjad").as_deref(),
            Some("kodu-ja-kollektsioon")
        );
        assert_eq!(parent_slug("a/b/c").as_deref(), Some("a/b"));
    }

    #[test]
    fn price_equality_is_decimal_not_textual() {
        let product = product_from(&observed("12.90"));
        assert!(!product.differs_from(&observed("12.9")));
        assert!(product.differs_from(&observed("12.91")));
    }

    #[test]
    fn original_price_appearing_counts_as_change() {
        let base = observed("10.00");
        let product = product_from(&base);
        let mut sale = base.clone();
        sale.original_price = Some("15.00".parse().unwrap());
        assert!(product.differs_from(&sale));
    }

    #[test]
    fn delivery_transitions_only_leave_pending() {
        use DeliveryStatus::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Skipped));
        assert!(!Pending.can_transition_to(Pending));
        for terminal in [Sent, Failed, Skipped] {
            for next in DeliveryStatus::ALL {
                assert!(!terminal.can_transition_to(*next));
            }
        }
    }

    #[test]
    fn string_codes_round_trip() {
        for change_type in ChangeType::ALL {
            assert_eq!(change_type.as_str().parse::<ChangeType>().unwrap(), *change_type);
        }
        assert!("PAID".parse::<UserRole>().is_err());
        assert_eq!(
            serde_json::to_string(&ChangeType::BackInStock).unwrap(),
            "\"back_in_stock\""
        );
    }

    #[test]
    fn only_paid_and_admin_receive_immediate() {
        assert!(!UserRole::Free.receives_immediate());
        assert!(UserRole::Paid.receives_immediate());
        assert!(UserRole::Admin.receives_immediate());
    }
}
