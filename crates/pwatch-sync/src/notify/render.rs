//! Email bodies for alerts and digests. Rendering is a pure function of the
//! delivery payloads; the HTML variant goes through askama's escaper.

use askama::Template;
use pwatch_core::{ChangeType, DeliveryPayload, ReportChangeItem};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub text: String,
    pub html: String,
}

pub fn format_price(value: Option<Decimal>) -> String {
    match value {
        Some(price) => format!("{:.2} EUR", price),
        None => "-".to_string(),
    }
}

fn format_stock(value: Option<bool>) -> String {
    match value {
        Some(in_stock) => in_stock.to_string(),
        None => "null".to_string(),
    }
}

struct ItemView {
    name: String,
    label: &'static str,
    url: String,
    has_price: bool,
    old_price: String,
    new_price: String,
    has_stock: bool,
    old_stock: String,
    new_stock: String,
}

impl ItemView {
    fn from_item(item: &ReportChangeItem) -> Self {
        Self {
            name: item.product.name.clone(),
            label: item.change_type.label(),
            url: item.product.external_url.clone(),
            has_price: item.old_price.is_some() || item.new_price.is_some(),
            old_price: format_price(item.old_price),
            new_price: format_price(item.new_price),
            has_stock: item.old_stock_status.is_some() || item.new_stock_status.is_some(),
            old_stock: format_stock(item.old_stock_status),
            new_stock: format_stock(item.new_stock_status),
        }
    }

    fn text_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("- {} ({})", self.name, self.label), format!("  {}", self.url)];
        if self.has_price {
            lines.push(format!("  Price: {} -> {}", self.old_price, self.new_price));
        }
        if self.has_stock {
            lines.push(format!("  Stock: {} -> {}", self.old_stock, self.new_stock));
        }
        lines
    }
}

/// `Label: n` pairs in order of first appearance.
fn summary_line(items: &[ReportChangeItem]) -> String {
    let mut counts: Vec<(ChangeType, usize)> = Vec::new();
    for item in items {
        match counts.iter_mut().find(|(t, _)| *t == item.change_type) {
            Some((_, n)) => *n += 1,
            None => counts.push((item.change_type, 1)),
        }
    }
    counts
        .iter()
        .map(|(t, n)| format!("{}: {n}", t.label()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Template)]
#[template(path = "alert.html")]
struct AlertHtml<'a> {
    user_name: &'a str,
    total_changes: i32,
    category: &'a str,
    summary: &'a str,
    items: &'a [ItemView],
}

pub fn render_alert(payload: &DeliveryPayload) -> Result<RenderedEmail, askama::Error> {
    let category = payload.report.category.name_et.as_str();
    let total = payload.report.total_changes;
    let summary = summary_line(&payload.change_items);
    let items: Vec<ItemView> = payload.change_items.iter().map(ItemView::from_item).collect();

    let mut lines = vec![
        format!("Hello {},", payload.user.name),
        String::new(),
        format!("{total} changes were detected in {category}."),
    ];
    if !summary.is_empty() {
        lines.push(format!("Summary: {summary}"));
    }
    lines.push(String::new());
    for item in &items {
        lines.extend(item.text_lines());
    }

    let html = AlertHtml {
        user_name: &payload.user.name,
        total_changes: total,
        category,
        summary: &summary,
        items: &items,
    }
    .render()?;

    Ok(RenderedEmail {
        subject: format!("{total} changes in {category}"),
        text: lines.join("\n"),
        html,
    })
}

struct ReportView {
    id: String,
    change_count: usize,
    items: Vec<ItemView>,
}

struct CategorySection {
    category: String,
    reports: Vec<ReportView>,
}

#[derive(Template)]
#[template(path = "digest.html")]
struct DigestHtml<'a> {
    user_name: &'a str,
    sections: &'a [CategorySection],
}

/// Sections keyed by category display name, in order of first appearance.
fn group_by_category(deliveries: &[DeliveryPayload]) -> Vec<CategorySection> {
    let mut sections: Vec<CategorySection> = Vec::new();
    for delivery in deliveries {
        let report = ReportView {
            id: delivery.report.id.to_string(),
            change_count: delivery.change_items.len(),
            items: delivery.change_items.iter().map(ItemView::from_item).collect(),
        };
        let name = &delivery.report.category.name_et;
        match sections.iter_mut().find(|s| &s.category == name) {
            Some(section) => section.reports.push(report),
            None => sections.push(CategorySection {
                category: name.clone(),
                reports: vec![report],
            }),
        }
    }
    sections
}

/// One message covering every pending delivery of a single recipient.
///
/// `deliveries` must be non-empty and belong to the same user.
pub fn render_digest(deliveries: &[DeliveryPayload]) -> Result<RenderedEmail, askama::Error> {
    let user_name = deliveries
        .first()
        .map(|d| d.user.name.as_str())
        .unwrap_or_default();
    let sections = group_by_category(deliveries);

    let mut lines = vec![
        format!("Hello {user_name},"),
        String::new(),
        "Here is your price digest.".to_string(),
    ];
    for section in &sections {
        lines.push(String::new());
        lines.push(section.category.clone());
        for report in &section.reports {
            lines.push(format!("- Report {}: {} changes", report.id, report.change_count));
            for item in &report.items {
                lines.extend(item.text_lines().into_iter().map(|l| format!("  {l}")));
            }
        }
    }

    let html = DigestHtml {
        user_name,
        sections: &sections,
    }
    .render()?;

    Ok(RenderedEmail {
        subject: format!(
            "Digest: {} reports across {} categories",
            deliveries.len(),
            sections.len()
        ),
        text: lines.join("\n"),
        html,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pwatch_core::{
        CategoryRef, ChannelType, NotificationChannel, ProductRef, ReportHeader, User, UserRole,
    };
    use uuid::Uuid;

    use super::*;

    fn item(name: &str, change_type: ChangeType, old: Option<&str>, new: Option<&str>) -> ReportChangeItem {
        ReportChangeItem {
            id: Uuid::new_v4(),
            change_type,
            old_price: old.map(|v| v.parse().unwrap()),
            new_price: new.map(|v| v.parse().unwrap()),
            old_stock_status: None,
            new_stock_status: None,
            product: ProductRef {
                id: Uuid::new_v4(),
                name: name.to_string(),
                external_url: format!("https://mabrik.ee/toode/{}", name.to_lowercase()),
                image_url: String::new(),
            },
        }
    }

    fn payload(category: &str, items: Vec<ReportChangeItem>) -> DeliveryPayload {
        let user_id = Uuid::new_v4();
        DeliveryPayload {
            delivery_id: Uuid::new_v4(),
            created_at: Utc::now(),
            user: User {
                id: user_id,
                email: "ann@example.com".into(),
                name: "Ann".into(),
                role: UserRole::Paid,
                is_active: true,
                last_digest_sent_at: None,
            },
            channel: NotificationChannel {
                id: Uuid::new_v4(),
                user_id,
                channel_type: ChannelType::Email,
                destination: "ann@example.com".into(),
                is_active: true,
                is_default: true,
            },
            report: ReportHeader {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                total_changes: items.len() as i32,
                scrape_run_id: Uuid::new_v4(),
                run_completed_at: None,
                category: CategoryRef {
                    id: Uuid::new_v4(),
                    slug: "lauamangud".into(),
                    name_et: category.into(),
                },
            },
            change_items: items,
        }
    }

    #[test]
    fn prices_render_with_two_decimals_and_currency() {
        assert_eq!(format_price(Some("12.9".parse().unwrap())), "12.90 EUR");
        assert_eq!(format_price(None), "-");
    }

    #[test]
    fn alert_text_lists_summary_and_items() {
        let mut sold_out = item("Catan", ChangeType::SoldOut, None, None);
        sold_out.old_stock_status = Some(true);
        sold_out.new_stock_status = Some(false);
        let email = render_alert(&payload(
            "Lauamängud",
            vec![
                item("Azul", ChangeType::PriceDecrease, Some("14.99"), Some("12.99")),
                sold_out,
                item("Carcassonne", ChangeType::PriceDecrease, Some("30"), Some("25")),
            ],
        ))
        .unwrap();

        assert_eq!(email.subject, "3 changes in Lauamängud");
        assert!(email.text.starts_with("Hello Ann,\n\n3 changes were detected in Lauamängud.\n"));
        assert!(email.text.contains("Summary: Price decrease: 2, Sold out: 1"));
        assert!(email.text.contains(
            "- Azul (Price decrease)\n  https://mabrik.ee/toode/azul\n  Price: 14.99 EUR -> 12.99 EUR"
        ));
        assert!(email.text.contains("  Stock: true -> false"));
        assert!(email.html.contains("<h1>Price alert</h1>"));
    }

    #[test]
    fn html_variant_escapes_interpolated_text() {
        let email = render_alert(&payload(
            "Kaardid & <Mängud>",
            vec![item("<script>\"x\"</script>", ChangeType::NewProduct, None, Some("1"))],
        ))
        .unwrap();
        assert!(!email.html.contains("<script>"));
        assert!(email.html.contains("&lt;script&gt;"));
        assert!(email.html.contains("Kaardid &amp; &lt;Mängud&gt;"));
        assert!(email.text.contains("- <script>\"x\"</script> (New product)"));
    }

    #[test]
    fn digest_groups_reports_by_category_name() {
        let deliveries = vec![
            payload("Lauamängud", vec![item("Azul", ChangeType::NewProduct, None, Some("10"))]),
            payload("Funko tooted", vec![item("Pop", ChangeType::NewProduct, None, Some("15"))]),
            payload("Lauamängud", vec![item("Catan", ChangeType::PriceIncrease, Some("30"), Some("35"))]),
        ];
        let email = render_digest(&deliveries).unwrap();

        assert_eq!(email.subject, "Digest: 3 reports across 2 categories");
        let text = &email.text;
        let board = text.find("\nLauamängud\n").unwrap();
        let funko = text.find("\nFunko tooted\n").unwrap();
        assert!(board < funko);
        assert_eq!(text.matches("- Report ").count(), 3);
        assert!(text.contains("    Price: 30.00 EUR -> 35.00 EUR"));
        assert_eq!(email.html.matches("<section>").count(), 2);
    }
}
