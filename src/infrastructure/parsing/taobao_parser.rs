//! Taobao and Tmall item pages

use scraper::Html;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use super::config::MarketplaceSelectors;
use super::context::ParseContext;
use super::embedded_json::{as_text, find_key};
use super::error::ParsingResult;
use super::extract::{FieldExtractor, price_from_json};
use super::MarketplaceExtractor;
use crate::domain::marketplace::Marketplace;
use crate::domain::product::{RawProduct, Variation};

/// Site names appended to item titles.
const TITLE_SUFFIXES: [&str; 4] = ["-淘宝网", "-tmall.com天猫", "-天猫Tmall.com", "- 淘宝网"];

pub struct TaobaoParser {
    fields: FieldExtractor,
}

impl TaobaoParser {
    pub fn new() -> ParsingResult<Self> {
        Self::with_selectors(MarketplaceSelectors::taobao())
    }

    pub fn with_selectors(selectors: MarketplaceSelectors) -> ParsingResult<Self> {
        Ok(Self {
            fields: FieldExtractor::new(selectors)?,
        })
    }
}

impl MarketplaceExtractor for TaobaoParser {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Taobao
    }

    fn extract(&self, document: &Html, source: &str, ctx: &ParseContext) -> ParsingResult<RawProduct> {
        let blobs = self.fields.blobs(source);
        let mut fields = self.fields.extract(source, document, &blobs, ctx);
        fields.title = fields.title.map(|t| clean_title(&t));
        if fields.variations.is_empty() {
            fields.variations = sku_base_variations(&blobs);
        }
        fields.into_raw_product(ctx, self.fields.selectors())
    }
}

fn clean_title(title: &str) -> String {
    let trimmed = title.trim();
    TITLE_SUFFIXES
        .iter()
        .find_map(|suffix| trimmed.strip_suffix(suffix))
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

fn key(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

/// Property id → (property name, value id → value name).
type PropTable = HashMap<String, (String, HashMap<String, String>)>;

fn prop_table(sku_base: &Value) -> PropTable {
    sku_base
        .get("props")
        .and_then(Value::as_array)
        .map(|props| {
            props
                .iter()
                .filter_map(|prop| {
                    let pid = prop.get("pid").and_then(as_text)?;
                    let name = prop.get("name").and_then(as_text)?;
                    let values = prop
                        .get("values")?
                        .as_array()?
                        .iter()
                        .filter_map(|v| Some((v.get("vid").and_then(as_text)?, v.get("name").and_then(as_text)?)))
                        .collect();
                    Some((pid, (name, values)))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Variations from `skuBase.skus[].propPath` (`"pid:vid;pid:vid"`), priced
/// and stocked from `sku2info` when present.
fn sku_base_variations(blobs: &[Value]) -> Vec<Variation> {
    let Some(sku_base) = find_key(blobs, &key("skuBase")) else {
        return Vec::new();
    };
    let props = prop_table(sku_base);
    let sku_info = find_key(blobs, &key("sku2info"));
    let Some(skus) = sku_base.get("skus").and_then(Value::as_array) else {
        return Vec::new();
    };

    skus.iter()
        .filter_map(|sku| {
            let path = sku.get("propPath").and_then(as_text)?;
            let attributes = resolve_prop_path(&props, &path)?;
            let info = sku
                .get("skuId")
                .and_then(as_text)
                .and_then(|id| sku_info.and_then(|table| table.get(id.as_str())));
            let price = info.and_then(|i| i.get("price")).and_then(price_from_json);
            let stock = info
                .and_then(|i| i.get("quantity"))
                .and_then(|q| q.as_u64().or_else(|| as_text(q).and_then(|t| t.parse().ok())))
                .and_then(|n| u32::try_from(n).ok());
            Some(Variation {
                attributes,
                price,
                stock,
            })
        })
        .collect()
}

fn resolve_prop_path(props: &PropTable, path: &str) -> Option<BTreeMap<String, String>> {
    let mut attributes = BTreeMap::new();
    for pair in path.split(';').filter(|p| !p.is_empty()) {
        let (pid, vid) = pair.split_once(':')?;
        let (name, values) = props.get(pid)?;
        attributes.insert(name.clone(), values.get(vid)?.clone());
    }
    (!attributes.is_empty()).then_some(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::product::{ProductType, StockStatus};
    use crate::infrastructure::parsing::extract::DEFAULT_CATEGORY;
    use url::Url;

    const ITEM_PAGE: &str = include_str!("../../../tests/fixtures/taobao_item.html");

    fn parse(html: &str) -> ParsingResult<RawProduct> {
        let parser = TaobaoParser::new().unwrap();
        let ctx = ParseContext::new(
            Url::parse("https://item.taobao.com/item.htm?id=612345678901").unwrap(),
            Marketplace::Taobao,
        );
        parser.extract(&Html::parse_document(html), html, &ctx)
    }

    #[test]
    fn test_item_fixture() {
        let product = parse(ITEM_PAGE).unwrap();
        assert_eq!(product.title, "夏季新款纯棉短袖T恤男");
        assert_eq!(product.price.amount.to_string(), "59.00");
        assert_eq!(product.stock_status, StockStatus::InStock);
        assert_eq!(product.category_path, vec![DEFAULT_CATEGORY]);
        assert_eq!(
            product.image_urls,
            vec![
                "https://gd1.alicdn.com/imgextra/i1/2200/O1CN01front.jpg",
                "https://gd2.alicdn.com/imgextra/i2/2200/O1CN01back.jpg",
            ]
        );
        assert_eq!(product.seller_info.get("name").map(String::as_str), Some("云端服饰旗舰店"));
    }

    #[test]
    fn test_sku_base_variations_are_priced() {
        let product = parse(ITEM_PAGE).unwrap();
        assert_eq!(product.product_type, ProductType::Variable);
        assert_eq!(product.variations.len(), 3);

        let black_l = product
            .variations
            .iter()
            .find(|v| v.label() == "尺码: L | 颜色分类: 黑色")
            .unwrap();
        assert_eq!(black_l.price.as_ref().unwrap().amount.to_string(), "62.00");
        assert_eq!(black_l.stock, Some(15));
    }

    #[test]
    fn test_dom_variations_take_group_from_list() {
        let html = r#"<h3 class="tb-main-title">短袖</h3><em class="tb-rmb-num">19.90</em>
            <ul id="J_UlThumb"><li><img data-src="//gd1.alicdn.com/a.jpg"></li></ul>
            <ul class="J_TSaleProp" data-property="颜色分类">
              <li data-value="1627207:28341" title="黑色"><a>黑色</a></li>
              <li data-value="1627207:28320"><a><span>白色</span></a></li>
            </ul>"#;
        let product = parse(html).unwrap();
        let labels: Vec<String> = product.variations.iter().map(Variation::label).collect();
        assert_eq!(labels, vec!["颜色分类: 黑色", "颜色分类: 白色"]);
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("连衣裙-淘宝网"), "连衣裙");
        assert_eq!(clean_title(" 连衣裙-tmall.com天猫 "), "连衣裙");
        assert_eq!(clean_title("连衣裙"), "连衣裙");
    }
}
