//! 1688.com offer pages
//!
//! Offer pages render the SKU picker client-side, so variations usually come
//! from the `skuProps` / `skuInfoMap` pair in the embedded offer model.

use scraper::Html;
use serde_json::Value;
use std::collections::BTreeMap;

use super::config::MarketplaceSelectors;
use super::context::ParseContext;
use super::embedded_json::{as_text, find_key};
use super::error::ParsingResult;
use super::extract::{FieldExtractor, price_from_json};
use super::MarketplaceExtractor;
use crate::domain::marketplace::Marketplace;
use crate::domain::product::{RawProduct, Variation};

/// `skuInfoMap` joins option names with an HTML-escaped `>`.
const SKU_KEY_SEPARATORS: [&str; 2] = ["&gt;", ">"];

pub struct AlibabaParser {
    fields: FieldExtractor,
}

impl AlibabaParser {
    pub fn new() -> ParsingResult<Self> {
        Self::with_selectors(MarketplaceSelectors::alibaba_1688())
    }

    pub fn with_selectors(selectors: MarketplaceSelectors) -> ParsingResult<Self> {
        Ok(Self {
            fields: FieldExtractor::new(selectors)?,
        })
    }
}

impl MarketplaceExtractor for AlibabaParser {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Alibaba1688
    }

    fn extract(&self, document: &Html, source: &str, ctx: &ParseContext) -> ParsingResult<RawProduct> {
        let blobs = self.fields.blobs(source);
        let mut fields = self.fields.extract(source, document, &blobs, ctx);
        if fields.variations.is_empty() {
            fields.variations = sku_variations(&blobs);
        }
        fields.into_raw_product(ctx, self.fields.selectors())
    }
}

fn key(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

/// `(prop name, option names)` for every non-empty SKU dimension.
fn sku_dimensions(blobs: &[Value]) -> Vec<(String, Vec<String>)> {
    let Some(Value::Array(props)) = find_key(blobs, &key("skuProps")) else {
        return Vec::new();
    };
    props
        .iter()
        .filter_map(|prop| {
            let name = prop.get("prop").or_else(|| prop.get("name")).and_then(as_text)?;
            let options: Vec<String> = prop
                .get("value")?
                .as_array()?
                .iter()
                .filter_map(|option| option.get("name").and_then(as_text))
                .collect();
            (!options.is_empty()).then_some((name, options))
        })
        .collect()
}

fn sku_variations(blobs: &[Value]) -> Vec<Variation> {
    let dimensions = sku_dimensions(blobs);
    if dimensions.is_empty() {
        return Vec::new();
    }

    if let Some(Value::Object(info)) = find_key(blobs, &key("skuInfoMap")) {
        let combined: Vec<Variation> = info
            .iter()
            .filter_map(|(combo, sku)| combined_variation(&dimensions, combo, sku))
            .collect();
        if !combined.is_empty() {
            return combined;
        }
    }

    dimensions
        .into_iter()
        .flat_map(|(name, options)| {
            options.into_iter().map(move |option| Variation {
                attributes: BTreeMap::from([(name.clone(), option)]),
                ..Variation::default()
            })
        })
        .collect()
}

fn combined_variation(dimensions: &[(String, Vec<String>)], combo: &str, sku: &Value) -> Option<Variation> {
    let separator = SKU_KEY_SEPARATORS.iter().find(|sep| combo.contains(**sep));
    let parts: Vec<&str> = match separator {
        Some(sep) => combo.split(*sep).collect(),
        None => vec![combo],
    };
    if parts.len() != dimensions.len() {
        return None;
    }

    let attributes = dimensions
        .iter()
        .zip(parts)
        .map(|((name, _), part)| (name.clone(), part.trim().to_string()))
        .collect();
    let price = ["discountPrice", "price"]
        .iter()
        .find_map(|k| sku.get(*k))
        .and_then(price_from_json);
    let stock = ["canBookCount", "amountOnSale"]
        .iter()
        .find_map(|k| sku.get(*k))
        .and_then(|v| v.as_u64().or_else(|| as_text(v).and_then(|t| t.parse().ok())))
        .and_then(|n| u32::try_from(n).ok());

    Some(Variation {
        attributes,
        price,
        stock,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::product::{ProductType, StockStatus};
    use url::Url;

    const OFFER_PAGE: &str = include_str!("../../../tests/fixtures/alibaba_offer.html");

    fn parse(html: &str) -> ParsingResult<RawProduct> {
        let parser = AlibabaParser::new().unwrap();
        let ctx = ParseContext::new(
            Url::parse("https://detail.1688.com/offer/623456789012.html").unwrap(),
            Marketplace::Alibaba1688,
        );
        parser.extract(&Html::parse_document(html), html, &ctx)
    }

    #[test]
    fn test_offer_fixture() {
        let product = parse(OFFER_PAGE).unwrap();
        assert_eq!(product.title, "加厚不锈钢保温杯 大容量车载水杯");
        assert_eq!(product.price.amount.to_string(), "25.80");
        assert_eq!(product.stock_status, StockStatus::InStock);
        assert_eq!(product.product_type, ProductType::Variable);
        assert_eq!(product.category_path, vec!["家居日用", "杯子水具"]);
        assert_eq!(product.image_urls.len(), 3);
        assert!(product.image_urls.iter().all(|u| u.starts_with("https://cbu01.alicdn.com/")));
        assert_eq!(product.seller_info.get("name").map(String::as_str), Some("义乌市好物日用品厂"));
        assert_eq!(product.shipping_info.get("ships_from").map(String::as_str), Some("浙江 金华"));
    }

    #[test]
    fn test_sku_info_map_combines_dimensions() {
        let product = parse(OFFER_PAGE).unwrap();
        assert_eq!(product.variations.len(), 4);
        let first = &product.variations[0];
        assert_eq!(first.attributes.get("颜色").map(String::as_str), Some("白色"));
        assert_eq!(first.attributes.get("容量").map(String::as_str), Some("500ml"));
        assert_eq!(first.price.as_ref().unwrap().amount.to_string(), "25.80");
        assert_eq!(first.stock, Some(120));
    }

    #[test]
    fn test_sku_props_without_info_map() {
        let blobs = vec![serde_json::json!({
            "skuProps": [{"prop": "尺码", "value": [{"name": "S"}, {"name": "M"}]}]
        })];
        let variations = sku_variations(&blobs);
        assert_eq!(variations.len(), 2);
        assert_eq!(variations[1].label(), "尺码: M");
    }
}
