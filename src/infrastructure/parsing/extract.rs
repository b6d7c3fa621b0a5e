//! Shared field extraction
//!
//! Both marketplace parsers run the same fallback ladder per field:
//! configured CSS selectors, then meta tags, then embedded JSON state, then a
//! regex over the raw source. Marketplace-specific quirks are applied by the
//! parsers on top of the [`ExtractedFields`] produced here.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use crate::domain::product::{Price, ProductType, RawProduct, StockStatus, Variation};
use crate::infrastructure::parsing::config::MarketplaceSelectors;
use crate::infrastructure::parsing::context::ParseContext;
use crate::infrastructure::parsing::embedded_json::{
    as_text, find_json_blobs, find_key, scalar_fields, unescape,
};
use crate::infrastructure::parsing::error::{ParsingError, ParsingResult};

pub const DEFAULT_CATEGORY: &str = "Imported Products";
pub const SHORT_DESCRIPTION_LIMIT: usize = 150;
const MIN_DESCRIPTION_CHARS: usize = 15;
const MIN_PARAGRAPH_CHARS: usize = 30;
const MIN_IMAGE_DIMENSION: u32 = 50;
const MAX_JSON_INFO_FIELDS: usize = 8;

/// Everything a page yielded, before required-field validation.
#[derive(Debug, Clone, Default)]
pub struct ExtractedFields {
    pub title: Option<String>,
    pub price: Option<Price>,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub image_urls: Vec<String>,
    pub variations: Vec<Variation>,
    pub shipping_info: BTreeMap<String, String>,
    pub seller_info: BTreeMap<String, String>,
    pub category_path: Vec<String>,
    pub stock_status: StockStatus,
}

impl ExtractedFields {
    /// Validates title, price and images, then derives the remaining
    /// defaults (short description, product type, category).
    pub fn into_raw_product(self, ctx: &ParseContext, selectors: &MarketplaceSelectors) -> ParsingResult<RawProduct> {
        let title = self
            .title
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ParsingError::required_field_missing("title", &selectors.title))?;
        let price = self
            .price
            .ok_or_else(|| ParsingError::required_field_missing("price", &selectors.price))?;
        if self.image_urls.is_empty() {
            return Err(ParsingError::required_field_missing("images", &selectors.images));
        }

        let short_description = self
            .short_description
            .or_else(|| self.description.as_deref().map(derive_short_description));
        let product_type = if self.variations.is_empty() {
            ProductType::Simple
        } else {
            ProductType::Variable
        };
        let category_path = if self.category_path.is_empty() {
            vec![DEFAULT_CATEGORY.to_string()]
        } else {
            self.category_path
        };

        Ok(RawProduct {
            url: ctx.url.to_string(),
            marketplace: ctx.marketplace,
            title,
            price,
            description: self.description,
            short_description,
            stock_status: self.stock_status,
            product_type,
            category_path,
            variations: self.variations,
            shipping_info: self.shipping_info,
            seller_info: self.seller_info,
            image_urls: self.image_urls,
        })
    }
}

/// First 147 characters plus `...` when the text exceeds the limit.
#[must_use]
pub fn derive_short_description(description: &str) -> String {
    let char_count = description.chars().count();
    if char_count <= SHORT_DESCRIPTION_LIMIT {
        return description.to_string();
    }
    let mut short: String = description.chars().take(SHORT_DESCRIPTION_LIMIT - 3).collect();
    short.push_str("...");
    short
}

#[must_use]
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: &ElementRef<'_>) -> String {
    normalize_whitespace(&element.text().collect::<String>())
}

/// Compiles selectors, skipping invalid ones; fails only if none compile.
pub fn compile_selectors(selector_strings: &[String]) -> ParsingResult<Vec<Selector>> {
    let mut selectors = Vec::new();
    let mut errors = Vec::new();

    for selector_str in selector_strings {
        match Selector::parse(selector_str) {
            Ok(selector) => selectors.push(selector),
            Err(e) => {
                warn!("Failed to compile selector '{}': {}", selector_str, e);
                errors.push(format!("'{selector_str}': {e}"));
            }
        }
    }

    if selectors.is_empty() && !selector_strings.is_empty() {
        return Err(ParsingError::invalid_selector(
            selector_strings.join(", "),
            errors.join(", "),
        ));
    }
    Ok(selectors)
}

fn compile_one(selector: &str) -> ParsingResult<Selector> {
    Selector::parse(selector).map_err(|e| ParsingError::invalid_selector(selector, e.to_string()))
}

fn compile_regex(pattern: &str) -> ParsingResult<Regex> {
    Regex::new(pattern).map_err(|e| ParsingError::invalid_selector(pattern, e.to_string()))
}

pub struct FieldExtractor {
    selectors: MarketplaceSelectors,
    title: Vec<Selector>,
    price: Vec<Selector>,
    description: Vec<Selector>,
    short_description: Vec<Selector>,
    images: Vec<Selector>,
    variation_items: Vec<Selector>,
    breadcrumb: Vec<Selector>,
    shipping: Vec<(String, Vec<Selector>)>,
    seller: Vec<(String, Vec<Selector>)>,
    page_title: Selector,
    meta_title: Selector,
    meta_description: Selector,
    meta_price: Selector,
    meta_image: Selector,
    paragraph: Selector,
    blob_prefixes: Vec<Regex>,
    title_regex: Regex,
    price_regex: Regex,
    image_regex: Regex,
    thumbnail_suffix: Regex,
}

impl FieldExtractor {
    pub fn new(selectors: MarketplaceSelectors) -> ParsingResult<Self> {
        let labelled = |map: &BTreeMap<String, Vec<String>>| -> ParsingResult<Vec<(String, Vec<Selector>)>> {
            map.iter()
                .map(|(label, list)| compile_selectors(list).map(|compiled| (label.clone(), compiled)))
                .collect()
        };

        Ok(Self {
            title: compile_selectors(&selectors.title)?,
            price: compile_selectors(&selectors.price)?,
            description: compile_selectors(&selectors.description)?,
            short_description: compile_selectors(&selectors.short_description)?,
            images: compile_selectors(&selectors.images)?,
            variation_items: compile_selectors(&selectors.variation_items)?,
            breadcrumb: compile_selectors(&selectors.breadcrumb)?,
            shipping: labelled(&selectors.shipping)?,
            seller: labelled(&selectors.seller)?,
            page_title: compile_one("title")?,
            meta_title: compile_one(r#"meta[property="og:title"]"#)?,
            meta_description: compile_one(r#"meta[name="description"]"#)?,
            meta_price: compile_one(r#"meta[property="og:product:price"], meta[itemprop="price"]"#)?,
            meta_image: compile_one(r#"meta[property="og:image"]"#)?,
            paragraph: compile_one("p")?,
            blob_prefixes: selectors
                .embedded_json
                .iter()
                .map(|p| compile_regex(p))
                .collect::<ParsingResult<_>>()?,
            title_regex: compile_regex(r#""(?:subject|offerTitle|title)"\s*:\s*"((?:[^"\\]|\\.){2,300})""#)?,
            price_regex: compile_regex(r#""(?:price|priceText|offerPrice|minPrice)"\s*:\s*"?(\d+(?:\.\d+)?)"?"#)?,
            image_regex: compile_regex(
                r#""(?:imageUrl|image|pic|originalImageURI|fullPathImageURI)"\s*:\s*"([^"]+)""#,
            )?,
            thumbnail_suffix: compile_regex(r"(?i)(\.(?:jpe?g|png|webp|gif))_\d+x\d+[^/]*$")?,
            selectors,
        })
    }

    #[must_use]
    pub const fn selectors(&self) -> &MarketplaceSelectors {
        &self.selectors
    }

    /// Embedded JSON state objects found in `source`.
    #[must_use]
    pub fn blobs(&self, source: &str) -> Vec<Value> {
        find_json_blobs(source, &self.blob_prefixes)
    }

    /// Runs the full fallback ladder for every field.
    #[must_use]
    pub fn extract(&self, source: &str, document: &Html, blobs: &[Value], ctx: &ParseContext) -> ExtractedFields {
        let fields = ExtractedFields {
            title: self.title(source, document, blobs),
            price: self.price(source, document, blobs),
            description: self.description(document, blobs),
            short_description: first_text(document, &self.short_description, 1),
            image_urls: self.images(source, document, blobs, ctx),
            variations: self.dom_variations(document),
            shipping_info: self.info_map(document, &self.shipping, blobs, &self.selectors.json_keys.shipping),
            seller_info: self.info_map(document, &self.seller, blobs, &self.selectors.json_keys.seller),
            category_path: self.category_path(document, blobs),
            stock_status: self.stock_status(source),
        };
        debug!(
            "Extracted fields for {}: title={} price={} images={} variations={}",
            ctx.url,
            fields.title.is_some(),
            fields.price.is_some(),
            fields.image_urls.len(),
            fields.variations.len()
        );
        fields
    }

    fn title(&self, source: &str, document: &Html, blobs: &[Value]) -> Option<String> {
        first_text(document, &self.title, 1)
            .or_else(|| meta_content(document, &self.meta_title))
            .or_else(|| {
                // "<name> - 阿里巴巴" / "<name>-淘宝网"
                document
                    .select(&self.page_title)
                    .next()
                    .map(|e| element_text(&e))
                    .and_then(|t| t.split('-').next().map(|s| s.trim().to_string()))
                    .filter(|t| !t.is_empty())
            })
            .or_else(|| find_key(blobs, &self.selectors.json_keys.title).and_then(as_text))
            .or_else(|| {
                self.title_regex
                    .captures(source)
                    .and_then(|c| c.get(1))
                    .map(|m| unescape(m.as_str()))
            })
    }

    fn price(&self, source: &str, document: &Html, blobs: &[Value]) -> Option<Price> {
        self.price
            .iter()
            .flat_map(|selector| document.select(selector))
            .find_map(|e| Price::from_text(&element_text(&e)))
            .or_else(|| meta_content(document, &self.meta_price).and_then(|t| Price::from_text(&t)))
            .or_else(|| {
                find_key(blobs, &self.selectors.json_keys.price)
                    .and_then(price_from_json)
            })
            .or_else(|| {
                self.price_regex
                    .captures(source)
                    .and_then(|c| c.get(1))
                    .and_then(|m| Price::from_text(m.as_str()))
            })
    }

    fn description(&self, document: &Html, blobs: &[Value]) -> Option<String> {
        first_text(document, &self.description, MIN_DESCRIPTION_CHARS + 1)
            .or_else(|| meta_content(document, &self.meta_description))
            .or_else(|| {
                find_key(blobs, &self.selectors.json_keys.description)
                    .and_then(as_text)
                    .map(|text| strip_markup(&text))
                    .filter(|t| !t.is_empty())
            })
            .or_else(|| {
                let paragraphs: Vec<String> = document
                    .select(&self.paragraph)
                    .map(|e| element_text(&e))
                    .filter(|t| t.chars().count() > MIN_PARAGRAPH_CHARS)
                    .take(3)
                    .collect();
                (!paragraphs.is_empty()).then(|| paragraphs.join("\n"))
            })
    }

    fn images(&self, source: &str, document: &Html, blobs: &[Value], ctx: &ParseContext) -> Vec<String> {
        let dom: Vec<String> = self
            .images
            .iter()
            .flat_map(|s| document.select(s))
            .filter(|element| !is_tiny(element))
            .filter_map(|element| {
                self.selectors
                    .image_attributes
                    .iter()
                    .find_map(|attr| element.value().attr(attr).filter(|v| !v.trim().is_empty()))
                    .map(str::to_string)
            })
            .collect();
        let urls = self.normalize_images(ctx, dom);
        if !urls.is_empty() {
            return urls;
        }

        let from_json = find_key(blobs, &self.selectors.json_keys.images)
            .map(image_strings)
            .unwrap_or_default();
        let urls = self.normalize_images(ctx, from_json);
        if !urls.is_empty() {
            return urls;
        }

        let mut last_resort: Vec<String> = meta_content(document, &self.meta_image).into_iter().collect();
        last_resort.extend(
            self.image_regex
                .captures_iter(source)
                .filter_map(|c| c.get(1))
                .map(|m| unescape(m.as_str())),
        );
        self.normalize_images(ctx, last_resort)
    }

    /// Absolutized, full-size, first-seen-order unique URLs.
    fn normalize_images(&self, ctx: &ParseContext, raw: Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        raw.iter()
            .filter_map(|r| ctx.resolve_asset_url(r))
            .map(|u| self.full_size(&u))
            .filter(|u| seen.insert(u.clone()))
            .collect()
    }

    /// Drops alicdn thumbnail suffixes such as `.jpg_60x60.jpg`.
    fn full_size(&self, url: &str) -> String {
        self.thumbnail_suffix.replace(url, "$1").into_owned()
    }

    fn dom_variations(&self, document: &Html) -> Vec<Variation> {
        let mut seen = HashSet::new();
        let mut variations = Vec::new();
        for element in self.variation_items.iter().flat_map(|s| document.select(s)) {
            let value = element.value();
            let label = value
                .attr("title")
                .map(normalize_whitespace)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| element_text(&element));
            if label.is_empty() {
                continue;
            }
            // Taobao puts the group name on the enclosing <ul>
            let group = value
                .attr("data-prop")
                .or_else(|| value.attr("data-property"))
                .or_else(|| {
                    element
                        .parent()
                        .and_then(ElementRef::wrap)
                        .and_then(|parent| parent.value().attr("data-property"))
                })
                .unwrap_or("option")
                .to_string();
            if !seen.insert((group.clone(), label.clone())) {
                continue;
            }
            let mut variation = Variation::default();
            variation.attributes.insert(group, label);
            variation.price = value.attr("data-price").and_then(Price::from_text);
            variations.push(variation);
        }
        variations
    }

    fn info_map(
        &self,
        document: &Html,
        labelled: &[(String, Vec<Selector>)],
        blobs: &[Value],
        json_keys: &[String],
    ) -> BTreeMap<String, String> {
        let mut info: BTreeMap<String, String> = labelled
            .iter()
            .filter_map(|(label, selectors)| first_text(document, selectors, 1).map(|text| (label.clone(), text)))
            .collect();

        if info.is_empty() {
            if let Some(value) = find_key(blobs, json_keys) {
                info.extend(scalar_fields(value).into_iter().take(MAX_JSON_INFO_FIELDS));
            }
        }
        info
    }

    fn category_path(&self, document: &Html, blobs: &[Value]) -> Vec<String> {
        let crumbs: Vec<String> = self
            .breadcrumb
            .iter()
            .map(|selector| {
                document
                    .select(selector)
                    .map(|e| element_text(&e))
                    .filter(|t| !t.is_empty() && !is_home_crumb(t))
                    .collect::<Vec<_>>()
            })
            .find(|crumbs| !crumbs.is_empty())
            .unwrap_or_default();
        if !crumbs.is_empty() {
            return crumbs;
        }

        match find_key(blobs, &self.selectors.json_keys.category) {
            Some(Value::Array(items)) => items.iter().filter_map(as_text).collect(),
            Some(value) => as_text(value)
                .map(|path| {
                    path.split(['>', '/'])
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn stock_status(&self, source: &str) -> StockStatus {
        let lowered = source.to_lowercase();
        if self
            .selectors
            .out_of_stock_markers
            .iter()
            .any(|marker| lowered.contains(&marker.to_lowercase()))
        {
            StockStatus::OutOfStock
        } else {
            StockStatus::InStock
        }
    }
}

/// First selector match whose text has at least `min_chars` characters.
fn first_text(document: &Html, selectors: &[Selector], min_chars: usize) -> Option<String> {
    selectors
        .iter()
        .flat_map(|selector| document.select(selector))
        .map(|e| element_text(&e))
        .find(|text| text.chars().count() >= min_chars)
}

fn meta_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .find_map(|e| e.value().attr("content"))
        .map(normalize_whitespace)
        .filter(|t| !t.is_empty())
}

fn is_tiny(element: &ElementRef<'_>) -> bool {
    ["width", "height"].iter().any(|attr| {
        element
            .value()
            .attr(attr)
            .and_then(|v| v.trim_end_matches("px").trim().parse::<u32>().ok())
            .is_some_and(|px| px < MIN_IMAGE_DIMENSION)
    })
}

fn is_home_crumb(text: &str) -> bool {
    text.contains("首页") || text.eq_ignore_ascii_case("home")
}

/// Strips tags from HTML-bearing JSON strings.
fn strip_markup(text: &str) -> String {
    if !text.contains('<') {
        return normalize_whitespace(text);
    }
    let fragment = Html::parse_fragment(text);
    normalize_whitespace(&fragment.root_element().text().collect::<Vec<_>>().join(" "))
}

/// Price from a scalar or from `{ "price": .. }`-style objects.
pub fn price_from_json(value: &Value) -> Option<Price> {
    match value {
        Value::Object(map) => ["priceText", "price", "value", "min"]
            .iter()
            .find_map(|k| map.get(*k))
            .and_then(price_from_json),
        Value::Array(items) => items.iter().find_map(price_from_json),
        other => as_text(other).and_then(|t| Price::from_text(&t)),
    }
}

/// Image URL strings from an array of strings or of image objects.
fn image_strings(value: &Value) -> Vec<String> {
    const URL_KEYS: [&str; 5] = ["fullPathImageURI", "originalImageURI", "imageURI", "url", "src"];
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => URL_KEYS.iter().find_map(|k| map.get(*k)).and_then(as_text),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
