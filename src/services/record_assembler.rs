//! Record assembly
//!
//! Combines the raw product, its translation and the image outcomes into the
//! import-ready [`ProductRecord`]. Assembly never fails; every degradation
//! ends up as a [`RecordWarning`] on the record.

use std::collections::HashSet;

use crate::domain::product::{ImageRef, ProductRecord, ProductType, RawProduct, RecordWarning};
use crate::infrastructure::parsing::extract::derive_short_description;
use crate::services::image_dedup::ImageOutcome;
use crate::services::translation::TranslatedProduct;

pub const IDENTIFIER_PREFIX: &str = "IMP-";
/// 64 bits of the hash; catalogues of millions of URLs stay collision free.
pub const IDENTIFIER_HEX_LEN: usize = 16;

/// Stable record identifier: prefix plus the first
/// [`IDENTIFIER_HEX_LEN`] hex chars of the blake3 hash of the source URL.
#[must_use]
pub fn identifier_for(url: &str) -> String {
    let hash = blake3::hash(url.as_bytes()).to_hex();
    format!("{IDENTIFIER_PREFIX}{}", &hash.as_str()[..IDENTIFIER_HEX_LEN])
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordAssembler;

impl RecordAssembler {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn assemble(&self, raw: RawProduct, translated: TranslatedProduct, images: Vec<ImageOutcome>) -> ProductRecord {
        let mut warnings: Vec<RecordWarning> = translated
            .untranslated
            .iter()
            .map(|field| RecordWarning::Untranslated { field: field.clone() })
            .collect();

        let mut seen_paths = HashSet::new();
        let mut image_refs = Vec::new();
        for outcome in images {
            match outcome.result {
                Ok(asset) => {
                    // the same picture twice on one page is listed once
                    if seen_paths.insert(asset.path.clone()) {
                        image_refs.push(ImageRef {
                            source_url: outcome.source_url,
                            position: outcome.position,
                            content_hash: asset.content_hash,
                            path: asset.path,
                        });
                    }
                }
                Err(e) => warnings.push(RecordWarning::ImageOmitted {
                    url: outcome.source_url,
                    reason: e.to_string(),
                }),
            }
        }
        if image_refs.is_empty() {
            warnings.push(RecordWarning::NoImages);
        }

        let description = translated.description.map(|t| t.text).unwrap_or_default();
        let short_description = match translated.short_description {
            Some(short) => short.text,
            None => derive_short_description(&description),
        };
        let product_type = if translated.variations.is_empty() {
            ProductType::Simple
        } else {
            ProductType::Variable
        };

        ProductRecord {
            identifier: identifier_for(&raw.url),
            name: translated.title.text,
            price: raw.price,
            description,
            short_description,
            images: image_refs,
            stock_status: raw.stock_status,
            product_type,
            category_path: translated.category_path,
            variations: translated.variations,
            shipping_info: translated.shipping_info,
            seller_info: translated.seller_info,
            source_url: raw.url,
            marketplace: raw.marketplace,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ImportError;
    use crate::domain::marketplace::Marketplace;
    use crate::domain::product::{Price, StockStatus, Variation};
    use crate::services::image_dedup::{AssetReference, ImageAsset};
    use crate::services::translation::{Translation, TranslationStatus};
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;

    const URL: &str = "https://detail.1688.com/offer/623456789012.html";

    fn raw() -> RawProduct {
        RawProduct {
            url: URL.to_string(),
            marketplace: Marketplace::Alibaba1688,
            title: "保温杯".to_string(),
            price: Price::from_text("25.80").unwrap(),
            description: Some("不锈钢".to_string()),
            short_description: Some("不锈钢".to_string()),
            stock_status: StockStatus::InStock,
            product_type: ProductType::Simple,
            category_path: vec!["家居".to_string()],
            variations: vec![],
            shipping_info: BTreeMap::new(),
            seller_info: BTreeMap::new(),
            image_urls: vec![],
        }
    }

    fn translated(untranslated: &[&str]) -> TranslatedProduct {
        let done = |text: &str| Translation {
            text: text.to_string(),
            status: TranslationStatus::Translated,
        };
        TranslatedProduct {
            title: done("Vacuum cup"),
            description: Some(done("Stainless steel")),
            short_description: None,
            category_path: vec!["Home".to_string()],
            variations: vec![],
            shipping_info: BTreeMap::new(),
            seller_info: BTreeMap::new(),
            untranslated: untranslated.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    fn stored(position: usize, hash: &str) -> ImageOutcome {
        ImageOutcome {
            position,
            source_url: format!("https://cdn/{position}.jpg"),
            result: Ok(ImageAsset {
                content_hash: hash.to_string(),
                path: PathBuf::from(format!("images/{hash}.jpg")),
                references: BTreeSet::from([AssetReference {
                    product_url: URL.to_string(),
                    position,
                }]),
            }),
        }
    }

    #[test]
    fn test_identifier_is_stable_and_short() {
        let id = identifier_for(URL);
        assert_eq!(id, identifier_for(URL));
        assert!(id.starts_with("IMP-"));
        assert_eq!(id.len(), IDENTIFIER_PREFIX.len() + IDENTIFIER_HEX_LEN);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, identifier_for("https://item.taobao.com/item.htm?id=1"));
    }

    #[test]
    fn test_identifiers_stay_unique_across_a_large_catalogue() {
        let ids: HashSet<String> = (0..200_000u64)
            .map(|id| identifier_for(&format!("https://item.taobao.com/item.htm?id={id}")))
            .collect();
        assert_eq!(ids.len(), 200_000);
    }

    #[test]
    fn test_clean_record_has_no_warnings() {
        let record = RecordAssembler::new().assemble(raw(), translated(&[]), vec![stored(0, "aaa")]);
        assert!(!record.has_warnings());
        assert_eq!(record.name, "Vacuum cup");
        assert_eq!(record.short_description, "Stainless steel");
        assert_eq!(record.category_path, vec!["Home"]);
        assert_eq!(record.images[0].path, PathBuf::from("images/aaa.jpg"));
        assert_eq!(record.product_type, ProductType::Simple);
    }

    #[test]
    fn test_degradations_become_warnings() {
        let failed = ImageOutcome {
            position: 1,
            source_url: "https://cdn/1.jpg".to_string(),
            result: Err(ImportError::download("https://cdn/1.jpg", "HTTP 404")),
        };
        let record = RecordAssembler::new().assemble(raw(), translated(&["title"]), vec![failed]);

        assert!(record.warnings.contains(&RecordWarning::Untranslated {
            field: "title".to_string()
        }));
        assert!(record.warnings.contains(&RecordWarning::NoImages));
        assert!(record
            .warnings
            .iter()
            .any(|w| matches!(w, RecordWarning::ImageOmitted { url, .. } if url == "https://cdn/1.jpg")));
        assert!(record.images.is_empty());
    }

    #[test]
    fn test_duplicate_pictures_listed_once_and_variable_type() {
        let mut translation = translated(&[]);
        translation.variations = vec![Variation::default()];
        let record = RecordAssembler::new().assemble(
            raw(),
            translation,
            vec![stored(0, "aaa"), stored(1, "bbb"), stored(2, "aaa")],
        );
        let positions: Vec<usize> = record.images.iter().map(|i| i.position).collect();
        assert_eq!(positions, vec![0, 1]);
        assert_eq!(record.product_type, ProductType::Variable);
    }
}
