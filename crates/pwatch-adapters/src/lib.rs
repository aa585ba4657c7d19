//! Storefront listing adapters: turn a category page into product records.

use std::str::FromStr;
use std::sync::OnceLock;

use pwatch_core::ParsedProduct;
use regex::Regex;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "pwatch-adapters";

pub const WOOCOMMERCE_STOREFRONT: &str = "woocommerce";

/// Page-level failures. These abort parsing of the whole page.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("invalid url `{value}`: {source}")]
    InvalidUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("no adapter registered for storefront {0}")]
    UnknownStorefront(String),
}

/// Per-card failures. The card is skipped and the message kept as a warning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemParseError {
    #[error("Missing required product fields")]
    MissingFields,
    #[error("Missing product price")]
    MissingPrice,
    #[error("Unable to parse price value: {0}")]
    UnparsablePrice(String),
    #[error("Unable to determine stock state")]
    UnknownStockState,
    #[error("Invalid product url {value}: {message}")]
    InvalidUrl { value: String, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedCategoryPage {
    pub products: Vec<ParsedProduct>,
    pub next_page_url: Option<String>,
    pub parser_warnings: Vec<String>,
}

pub trait ListingAdapter: Send + Sync {
    fn storefront_id(&self) -> &'static str;

    /// First listing page of a category.
    fn category_url(&self, slug: &str) -> String;

    fn parse_listing(&self, html: &str) -> Result<ParsedCategoryPage, ParseError>;
}

pub fn adapter_for_storefront(
    storefront_id: &str,
    base_url: &str,
) -> Result<Box<dyn ListingAdapter>, ParseError> {
    match storefront_id {
        WOOCOMMERCE_STOREFRONT => Ok(Box::new(WooCommerceAdapter::new(
            base_url,
            WooCommerceSelectors::default(),
        )?)),
        other => Err(ParseError::UnknownStorefront(other.to_string())),
    }
}

fn thousands_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d)\.(\d{3})\b").expect("static thousands pattern"))
}

fn price_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d{1,2})?").expect("static price pattern"))
}

/// Normalizes a displayed price to a two-decimal value.
///
/// Whitespace and the `EUR`/`€` markers are dropped, a dot followed by
/// exactly three digits is a thousands separator, and the first comma is the
/// decimal mark: `"12,99 €"` → `12.99`, `"1.299,00 €"` → `1299.00`. At most
/// two fraction digits are read.
pub fn parse_price_to_decimal(value: &str) -> Result<Decimal, ItemParseError> {
    let stripped: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let mut text = stripped.replace("EUR", "").replace('€', "");

    loop {
        let next = thousands_separator().replace_all(&text, "${1}${2}").into_owned();
        if next == text {
            break;
        }
        text = next;
    }
    let text = text.replacen(',', ".", 1);

    let matched = price_number()
        .find(&text)
        .ok_or_else(|| ItemParseError::UnparsablePrice(value.to_string()))?;
    let mut price = Decimal::from_str(matched.as_str())
        .map_err(|_| ItemParseError::UnparsablePrice(value.to_string()))?;
    price.rescale(2);
    Ok(price)
}

pub fn build_absolute_url(base: &Url, value: &str) -> Result<Url, url::ParseError> {
    base.join(value)
}

/// Absolute product URL without fragment or trailing slash (root path kept).
pub fn normalize_external_url(base: &Url, value: &str) -> Result<String, ItemParseError> {
    let mut url = build_absolute_url(base, value).map_err(|err| ItemParseError::InvalidUrl {
        value: value.to_string(),
        message: err.to_string(),
    })?;
    url.set_fragment(None);
    let path = url.path().to_string();
    if path != "/" && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Ok(url.to_string())
}

/// Decodes the product grid some themes ship as a JSON string inside a
/// `text/template` script. Falls back to unquoting by hand when the payload
/// is not valid JSON.
pub fn decode_template_markup(raw: &str) -> String {
    let raw = raw.trim();
    match serde_json::from_str::<String>(raw) {
        Ok(markup) => markup,
        Err(_) => {
            let unquoted = raw.strip_prefix('"').unwrap_or(raw);
            let unquoted = unquoted.strip_suffix('"').unwrap_or(unquoted);
            unquoted.replace("\\\"", "\"").replace("\\/", "/")
        }
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(scope: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn compile(selector: &str) -> Result<Selector, ParseError> {
    Selector::parse(selector).map_err(|e| ParseError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// CSS selectors for a WooCommerce category page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WooCommerceSelectors {
    pub product_card: String,
    pub title: String,
    pub product_link: String,
    pub image: String,
    pub current_price: String,
    pub sale_price: String,
    pub original_price: String,
    pub out_of_stock: String,
    pub in_stock: String,
    pub product_template_script: String,
    pub next_page: String,
}

impl Default for WooCommerceSelectors {
    fn default() -> Self {
        Self {
            product_card: "li.product, li.product-col.product".into(),
            title: "h2.woocommerce-loop-product__title, .woocommerce-loop-product__title".into(),
            product_link: "a.woocommerce-LoopProduct-link, a.woocommerce-loop-product__link, a"
                .into(),
            image: "img".into(),
            current_price: ".price .amount, .price ins .amount, .price bdi".into(),
            sale_price: ".price ins .amount, .price ins bdi".into(),
            original_price: ".price del .amount, .price del bdi".into(),
            out_of_stock: ".outofstock, .stock.out-of-stock, .ast-shop-product-out-of-stock".into(),
            in_stock: ".stock.in-stock".into(),
            product_template_script: "ul.products script[type='text/template']".into(),
            next_page: "a.next, .next.page-numbers".into(),
        }
    }
}

#[derive(Debug)]
struct CompiledSelectors {
    product_card: Selector,
    title: Selector,
    product_link: Selector,
    any_link: Selector,
    image: Selector,
    current_price: Selector,
    sale_price: Selector,
    original_price: Selector,
    out_of_stock: Selector,
    in_stock: Selector,
    product_template_script: Selector,
    next_page: Selector,
}

impl CompiledSelectors {
    fn compile(raw: &WooCommerceSelectors) -> Result<Self, ParseError> {
        Ok(Self {
            product_card: compile(&raw.product_card)?,
            title: compile(&raw.title)?,
            product_link: compile(&raw.product_link)?,
            any_link: compile("a")?,
            image: compile(&raw.image)?,
            current_price: compile(&raw.current_price)?,
            sale_price: compile(&raw.sale_price)?,
            original_price: compile(&raw.original_price)?,
            out_of_stock: compile(&raw.out_of_stock)?,
            in_stock: compile(&raw.in_stock)?,
            product_template_script: compile(&raw.product_template_script)?,
            next_page: compile(&raw.next_page)?,
        })
    }
}

#[derive(Debug)]
pub struct WooCommerceAdapter {
    base_url: Url,
    selectors: CompiledSelectors,
}

impl WooCommerceAdapter {
    pub fn new(base_url: &str, selectors: WooCommerceSelectors) -> Result<Self, ParseError> {
        let base_url = Url::parse(base_url).map_err(|source| ParseError::InvalidUrl {
            value: base_url.to_string(),
            source,
        })?;
        Ok(Self {
            base_url,
            selectors: CompiledSelectors::compile(&selectors)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn parse_card(&self, card: ElementRef<'_>) -> Result<ParsedProduct, ItemParseError> {
        let s = &self.selectors;

        let link = select_first_attr(card, &s.product_link, "href")
            .or_else(|| select_first_attr(card, &s.any_link, "href"));
        let name = select_first_text(card, &s.title);
        let image = card.select(&s.image).next().and_then(|img| {
            ["data-lazy-src", "data-src", "src"]
                .iter()
                .find_map(|attr| img.value().attr(attr).and_then(|v| text_or_none(v.to_string())))
        });

        let (Some(link), Some(name), Some(image)) = (link, name, image) else {
            return Err(ItemParseError::MissingFields);
        };

        let original_price = select_first_text(card, &s.original_price);
        let current_price = select_first_text(card, &s.sale_price)
            .or_else(|| select_first_text(card, &s.current_price))
            .ok_or(ItemParseError::MissingPrice)?;

        let in_stock = self.resolve_stock(card)?;

        let image_url = build_absolute_url(&self.base_url, &image)
            .map_err(|err| ItemParseError::InvalidUrl {
                value: image.clone(),
                message: err.to_string(),
            })?
            .to_string();

        Ok(ParsedProduct {
            external_url: normalize_external_url(&self.base_url, &link)?,
            name,
            image_url,
            current_price: parse_price_to_decimal(&current_price)?,
            original_price: original_price
                .as_deref()
                .map(parse_price_to_decimal)
                .transpose()?,
            in_stock,
        })
    }

    /// Card state class, then marker element, then text.
    fn resolve_stock(&self, card: ElementRef<'_>) -> Result<bool, ItemParseError> {
        let class = card.value().attr("class").unwrap_or_default().to_lowercase();
        if class.contains("outofstock") || class.contains("out-of-stock") {
            return Ok(false);
        }
        if class.contains("instock") || class.contains("in-stock") {
            return Ok(true);
        }

        if card.select(&self.selectors.out_of_stock).next().is_some() {
            return Ok(false);
        }
        if card.select(&self.selectors.in_stock).next().is_some() {
            return Ok(true);
        }

        let text = card.text().collect::<String>().to_lowercase();
        if text.contains("out of stock") || text.contains("laost otsas") {
            return Ok(false);
        }
        if text.contains("in stock") || text.contains("laos") {
            return Ok(true);
        }

        Err(ItemParseError::UnknownStockState)
    }

    fn template_markup(&self, document: &Html) -> Option<String> {
        document
            .select(&self.selectors.product_template_script)
            .next()
            .and_then(|script| text_or_none(script.text().collect::<String>()))
            .map(|raw| decode_template_markup(&raw))
    }
}

impl ListingAdapter for WooCommerceAdapter {
    fn storefront_id(&self) -> &'static str {
        WOOCOMMERCE_STOREFRONT
    }

    fn category_url(&self, slug: &str) -> String {
        format!(
            "{}/tootekategooria/{}/",
            self.base_url.as_str().trim_end_matches('/'),
            slug.trim_matches('/')
        )
    }

    fn parse_listing(&self, html: &str) -> Result<ParsedCategoryPage, ParseError> {
        let document = Html::parse_document(html);
        let template = self.template_markup(&document).map(|markup| Html::parse_document(&markup));
        let product_dom = template.as_ref().unwrap_or(&document);

        let mut page = ParsedCategoryPage::default();
        for card in product_dom.select(&self.selectors.product_card) {
            match self.parse_card(card) {
                Ok(product) => page.products.push(product),
                Err(err) => page.parser_warnings.push(err.to_string()),
            }
        }

        page.next_page_url = match document
            .select(&self.selectors.next_page)
            .next()
            .and_then(|n| n.value().attr("href"))
            .and_then(|href| text_or_none(href.to_string()))
        {
            Some(href) => Some(
                build_absolute_url(&self.base_url, &href)
                    .map_err(|source| ParseError::InvalidUrl {
                        value: href.clone(),
                        source,
                    })?
                    .to_string(),
            ),
            None => None,
        };

        debug!(
            products = page.products.len(),
            warnings = page.parser_warnings.len(),
            from_template = template.is_some(),
            "parsed listing page"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> WooCommerceAdapter {
        WooCommerceAdapter::new("https://mabrik.ee", WooCommerceSelectors::default())
            .expect("adapter")
    }

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    fn page(cards: &str) -> String {
        format!("<html><body><ul class=\"products\">{cards}</ul></body></html>")
    }

    #[test]
    fn prices_normalize_across_locale_formats() {
        assert_eq!(parse_price_to_decimal("12,99 €").unwrap(), dec("12.99"));
        assert_eq!(parse_price_to_decimal("12.99").unwrap(), dec("12.99"));
        assert_eq!(parse_price_to_decimal("1.299,00 €").unwrap(), dec("1299.00"));
        assert_eq!(parse_price_to_decimal("EUR 7").unwrap().to_string(), "7.00");
        assert_eq!(parse_price_to_decimal("1.234.567,50").unwrap(), dec("1234567.50"));
        assert_eq!(parse_price_to_decimal("16,9\u{a0}€").unwrap().to_string(), "16.90");
    }

    #[test]
    fn unparsable_price_is_an_item_error() {
        assert_eq!(
            parse_price_to_decimal("Tasuta").unwrap_err(),
            ItemParseError::UnparsablePrice("Tasuta".to_string())
        );
    }

    #[test]
    fn product_urls_are_absolute_without_slash_or_fragment() {
        let base = Url::parse("https://mabrik.ee").unwrap();
        assert_eq!(
            normalize_external_url(&base, "/toode/test-game/").unwrap(),
            "https://mabrik.ee/toode/test-game"
        );
        assert_eq!(
            normalize_external_url(&base, "https://mabrik.ee/toode/test-game/#tab").unwrap(),
            "https://mabrik.ee/toode/test-game"
        );
        assert_eq!(normalize_external_url(&base, "/").unwrap(), "https://mabrik.ee/");
    }

    #[test]
    fn category_url_uses_archive_path() {
        assert_eq!(
            adapter().category_url("kodu-ja-kollektsioon/figuurid-ja-manguasjad"),
            "https://mabrik.ee/tootekategooria/kodu-ja-kollektsioon/figuurid-ja-manguasjad/"
        );
    }

    #[test]
    fn stock_resolution_cascades_through_signals() {
        let html = page(
            r#"
            <li class="product outofstock"><a href="/a"><img src="/a.jpg"><h2 class="woocommerce-loop-product__title">A</h2><span class="price"><span class="amount">1,00</span></span><p class="stock in-stock">in stock</p></a></li>
            <li class="product"><a href="/b"><img src="/b.jpg"><h2 class="woocommerce-loop-product__title">B</h2><span class="price"><span class="amount">1,00</span></span></a><p class="stock out-of-stock">x</p></li>
            <li class="product"><a href="/c"><img src="/c.jpg"><h2 class="woocommerce-loop-product__title">C</h2><span class="price"><span class="amount">1,00</span></span></a><span>Laos</span></li>
            <li class="product"><a href="/d"><img src="/d.jpg"><h2 class="woocommerce-loop-product__title">D</h2><span class="price"><span class="amount">1,00</span></span></a><span>Laost otsas</span></li>
            <li class="product"><a href="/e"><img src="/e.jpg"><h2 class="woocommerce-loop-product__title">E</h2><span class="price"><span class="amount">1,00</span></span></a></li>
            "#,
        );
        let parsed = adapter().parse_listing(&html).unwrap();
        let stock: Vec<(String, bool)> = parsed
            .products
            .iter()
            .map(|p| (p.name.clone(), p.in_stock))
            .collect();
        assert_eq!(
            stock,
            vec![
                ("A".to_string(), false),
                ("B".to_string(), false),
                ("C".to_string(), true),
                ("D".to_string(), false),
            ]
        );
        assert_eq!(parsed.parser_warnings, vec!["Unable to determine stock state"]);
    }

    #[test]
    fn missing_fields_and_price_become_warnings() {
        let html = page(
            r#"
            <li class="product instock"><a href="/a"><h2 class="woocommerce-loop-product__title">No image</h2><span class="price"><span class="amount">1,00</span></span></a></li>
            <li class="product instock"><a href="/b"><img src="/b.jpg"><h2 class="woocommerce-loop-product__title">No price</h2></a></li>
            "#,
        );
        let parsed = adapter().parse_listing(&html).unwrap();
        assert!(parsed.products.is_empty());
        assert_eq!(
            parsed.parser_warnings,
            vec!["Missing required product fields", "Missing product price"]
        );
        assert_eq!(parsed.next_page_url, None);
    }

    #[test]
    fn template_fallback_unescapes_non_json_payload() {
        let raw = r#""<li class=\"product\"><a href=\"https:\/\/mabrik.ee\/toode\/x\/\">x<\/a><\/li>"extra"#;
        let decoded = decode_template_markup(raw);
        assert!(decoded.contains(r#"href="https://mabrik.ee/toode/x/""#));
        assert_eq!(
            decode_template_markup(r#""<li class=\"product\"><\/li>""#),
            r#"<li class="product"></li>"#
        );
    }

    #[test]
    fn unknown_storefront_is_rejected() {
        assert!(matches!(
            adapter_for_storefront("shopify", "https://mabrik.ee"),
            Err(ParseError::UnknownStorefront(_))
        ));
        let adapter = adapter_for_storefront(WOOCOMMERCE_STOREFRONT, "https://mabrik.ee").unwrap();
        assert_eq!(adapter.storefront_id(), "woocommerce");
    }
}
