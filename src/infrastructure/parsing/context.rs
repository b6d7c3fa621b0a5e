//! Parsing context

use url::Url;

use crate::domain::marketplace::Marketplace;

/// Where the content being parsed came from.
#[derive(Debug, Clone)]
pub struct ParseContext {
    /// Product URL that was fetched
    pub url: Url,

    pub marketplace: Marketplace,
}

impl ParseContext {
    #[must_use]
    pub const fn new(url: Url, marketplace: Marketplace) -> Self {
        Self { url, marketplace }
    }

    /// Absolutizes protocol-relative and root-relative asset URLs.
    #[must_use]
    pub fn resolve_asset_url(&self, raw: &str) -> Option<String> {
        let raw = raw.trim().replace("\\/", "/");
        if raw.is_empty() || raw.starts_with("data:") {
            return None;
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Some(raw);
        }
        if let Some(rest) = raw.strip_prefix("//") {
            return Some(format!("https://{rest}"));
        }
        if raw.starts_with('/') {
            return Some(format!("{}{}", self.marketplace.asset_base(), raw));
        }
        self.url.join(&raw).ok().map(String::from)
    }
}
