//! Product data as extracted from a page and as emitted for import.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domain::marketplace::Marketplace;

pub const DEFAULT_CURRENCY: &str = "CNY";

/// Decimal price in the marketplace's source currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount: BigDecimal,
    pub currency: String,
}

impl Price {
    #[must_use]
    pub fn new(amount: BigDecimal, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }

    /// Reads the first decimal number out of display text such as
    /// `"¥1,299.00"` or `"12.50-18.00"` (ranges resolve to their lower bound).
    #[must_use]
    pub fn from_text(text: &str) -> Option<Self> {
        let mut digits = String::new();
        let mut seen_dot = false;
        let mut started = false;

        for c in text.chars() {
            match c {
                '0'..='9' => {
                    started = true;
                    digits.push(c);
                }
                ',' if started => {}
                '.' if started && !seen_dot => {
                    seen_dot = true;
                    digits.push(c);
                }
                _ if started => break,
                _ => {}
            }
        }

        let digits = digits.trim_end_matches('.');
        if digits.is_empty() {
            return None;
        }
        BigDecimal::from_str(digits)
            .ok()
            .map(|amount| Self::new(amount, DEFAULT_CURRENCY))
    }

    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.amount > BigDecimal::from(0)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockStatus {
    #[default]
    InStock,
    OutOfStock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductType {
    #[default]
    Simple,
    Variable,
}

/// One purchasable combination of attributes (colour, size, ...).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Variation {
    pub attributes: BTreeMap<String, String>,
    pub price: Option<Price>,
    pub stock: Option<u32>,
}

impl Variation {
    /// `"name: value"` pairs joined with `" | "`.
    #[must_use]
    pub fn label(&self) -> String {
        self.attributes
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Untranslated product as it appears on the marketplace page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProduct {
    pub url: String,
    pub marketplace: Marketplace,
    pub title: String,
    pub price: Price,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub stock_status: StockStatus,
    pub product_type: ProductType,
    pub category_path: Vec<String>,
    pub variations: Vec<Variation>,
    pub shipping_info: BTreeMap<String, String>,
    pub seller_info: BTreeMap<String, String>,
    pub image_urls: Vec<String>,
}

/// A deduplicated image as referenced from a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub source_url: String,
    pub position: usize,
    pub content_hash: String,
    pub path: PathBuf,
}

/// Degradations recorded on an otherwise successful record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordWarning {
    Untranslated { field: String },
    NoImages,
    ImageOmitted { url: String, reason: String },
}

/// Import-ready product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub identifier: String,
    pub name: String,
    pub price: Price,
    pub description: String,
    pub short_description: String,
    pub images: Vec<ImageRef>,
    pub stock_status: StockStatus,
    pub product_type: ProductType,
    pub category_path: Vec<String>,
    pub variations: Vec<Variation>,
    pub shipping_info: BTreeMap<String, String>,
    pub seller_info: BTreeMap<String, String>,
    pub source_url: String,
    pub marketplace: Marketplace,
    pub warnings: Vec<RecordWarning>,
}

impl ProductRecord {
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_price_from_display_text() {
        let price = Price::from_text("¥1,299.00").unwrap();
        assert_eq!(price.amount, BigDecimal::from_str("1299.00").unwrap());
        assert_eq!(price.currency, "CNY");

        let range = Price::from_text("12.50-18.00").unwrap();
        assert_eq!(range.amount, BigDecimal::from_str("12.50").unwrap());

        assert!(Price::from_text("面议").is_none());
        assert!(Price::from_text("").is_none());
    }

    #[test]
    fn test_variation_label() {
        let mut variation = Variation::default();
        variation.attributes.insert("颜色".into(), "红色".into());
        variation.attributes.insert("尺码".into(), "L".into());
        assert_eq!(variation.label(), "尺码: L | 颜色: 红色");
    }

    proptest! {
        #[test]
        fn prop_price_roundtrips_plain_decimals(whole in 0u32..1_000_000, cents in 0u32..100) {
            let text = format!("¥{whole}.{cents:02}");
            let price = Price::from_text(&text).unwrap();
            let expected = BigDecimal::from_str(&format!("{whole}.{cents:02}")).unwrap();
            prop_assert_eq!(price.amount, expected);
        }
    }
}
