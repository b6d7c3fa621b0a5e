//! Product page parsing
//!
//! One [`MarketplaceExtractor`] per marketplace, all built on the shared
//! [`FieldExtractor`] fallback ladder. [`ParserRegistry`] dispatches on the
//! marketplace detected from the product URL.

pub mod alibaba_parser;
pub mod config;
pub mod context;
pub mod embedded_json;
pub mod error;
pub mod extract;
pub mod taobao_parser;

pub use alibaba_parser::AlibabaParser;
pub use config::MarketplaceSelectors;
pub use context::ParseContext;
pub use error::{ParsingError, ParsingResult};
pub use extract::{ExtractedFields, FieldExtractor};
pub use taobao_parser::TaobaoParser;

use scraper::Html;
use std::collections::HashMap;
use tracing::debug;

use crate::domain::errors::ImportError;
use crate::domain::marketplace::Marketplace;
use crate::domain::product::RawProduct;

/// Content under this size cannot hold a product page.
const MIN_CONTENT_LENGTH: usize = 64;

/// Turns a rendered product page into a [`RawProduct`].
pub trait MarketplaceExtractor: Send + Sync {
    fn marketplace(&self) -> Marketplace;

    /// `source` is the raw page text `document` was parsed from; regex and
    /// embedded-JSON fallbacks run against it.
    fn extract(&self, document: &Html, source: &str, ctx: &ParseContext) -> ParsingResult<RawProduct>;
}

pub struct ParserRegistry {
    parsers: HashMap<Marketplace, Box<dyn MarketplaceExtractor>>,
}

impl ParserRegistry {
    /// Registry with the built-in parser for every marketplace.
    pub fn new() -> ParsingResult<Self> {
        Ok(Self::empty()
            .with_parser(Box::new(AlibabaParser::new()?))
            .with_parser(Box::new(TaobaoParser::new()?)))
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registers `parser`, replacing any parser for the same marketplace.
    #[must_use]
    pub fn with_parser(mut self, parser: Box<dyn MarketplaceExtractor>) -> Self {
        self.parsers.insert(parser.marketplace(), parser);
        self
    }

    pub fn parse(&self, content: &str, ctx: &ParseContext) -> ParsingResult<RawProduct> {
        if content.trim().len() < MIN_CONTENT_LENGTH {
            return Err(ParsingError::ContentValidationFailed {
                reason: "page content too short".to_string(),
                content_length: content.len(),
            });
        }
        let parser = self
            .parsers
            .get(&ctx.marketplace)
            .ok_or_else(|| ParsingError::UnsupportedPage {
                url: ctx.url.to_string(),
            })?;

        let document = Html::parse_document(content);
        let product = parser.extract(&document, content, ctx)?;
        debug!(
            "Parsed {} product '{}' with {} images, {} variations",
            ctx.marketplace,
            product.title,
            product.image_urls.len(),
            product.variations.len()
        );
        Ok(product)
    }

    /// [`Self::parse`] with the error mapped to [`ImportError::ParseError`].
    pub fn parse_page(&self, content: &str, ctx: &ParseContext) -> Result<RawProduct, ImportError> {
        self.parse(content, ctx)
            .map_err(|e| e.into_import_error(ctx.url.as_str()))
    }
}
