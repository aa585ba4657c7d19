use std::path::{Path, PathBuf};

use pwatch_adapters::{ListingAdapter, WooCommerceAdapter, WooCommerceSelectors};
use rust_decimal::Decimal;

fn fixture(name: &str) -> String {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/woocommerce")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn adapter() -> WooCommerceAdapter {
    WooCommerceAdapter::new("https://mabrik.ee", WooCommerceSelectors::default()).expect("adapter")
}

fn dec(value: &str) -> Decimal {
    value.parse().expect("decimal")
}

#[test]
fn parses_cards_sale_prices_and_next_page() {
    let page = adapter().parse_listing(&fixture("category-page.html")).expect("parse");

    assert!(page.parser_warnings.is_empty(), "{:?}", page.parser_warnings);
    assert_eq!(page.products.len(), 3);
    assert_eq!(
        page.next_page_url.as_deref(),
        Some("https://mabrik.ee/tootekategooria/lauamangud/page/2/")
    );

    let first = &page.products[0];
    assert_eq!(first.external_url, "https://mabrik.ee/toode/test-game");
    assert_eq!(first.name, "Test Game");
    assert_eq!(first.image_url, "https://mabrik.ee/wp-content/uploads/test-game.jpg");
    assert_eq!(first.current_price, dec("29.99"));
    assert_eq!(first.original_price, None);
    assert!(first.in_stock);

    let sale = &page.products[1];
    assert_eq!(sale.external_url, "https://mabrik.ee/toode/sale-game");
    assert_eq!(sale.image_url, "https://mabrik.ee/wp-content/uploads/sale-game.jpg");
    assert_eq!(sale.current_price, dec("24.99"));
    assert_eq!(sale.original_price, Some(dec("39.99")));

    let sold_out = &page.products[2];
    assert_eq!(sold_out.name, "Out Of Stock Game");
    assert_eq!(sold_out.image_url, "https://mabrik.ee/wp-content/uploads/oos-game.jpg");
    assert_eq!(sold_out.current_price, dec("12.99"));
    assert!(!sold_out.in_stock);
}

#[test]
fn parses_cards_from_embedded_template() {
    let page = adapter()
        .parse_listing(&fixture("category-page-template.html"))
        .expect("parse");

    assert!(page.parser_warnings.is_empty(), "{:?}", page.parser_warnings);
    assert_eq!(page.products.len(), 2);
    assert_eq!(
        page.next_page_url.as_deref(),
        Some("https://mabrik.ee/tootekategooria/lauamangud/page/2/")
    );
    assert_eq!(page.products[0].external_url, "https://mabrik.ee/toode/template-game");
    assert_eq!(page.products[0].name, "Template Game");
    assert_eq!(page.products[0].current_price.to_string(), "16.90");
    assert!(page.products[0].in_stock);
    assert_eq!(page.products[1].external_url, "https://mabrik.ee/toode/template-sold-out");
    assert_eq!(page.products[1].current_price.to_string(), "9.90");
    assert!(!page.products[1].in_stock);
}

#[test]
fn last_page_keeps_valid_cards_and_collects_warnings() {
    let page = adapter()
        .parse_listing(&fixture("category-page-last.html"))
        .expect("parse");

    assert_eq!(page.next_page_url, None);
    assert_eq!(page.products.len(), 1);
    assert_eq!(page.products[0].name, "Big Box");
    assert_eq!(page.products[0].current_price, dec("1299.00"));
    assert!(page.products[0].in_stock);
    assert_eq!(
        page.parser_warnings,
        vec!["Missing product price", "Unable to determine stock state"]
    );
}
