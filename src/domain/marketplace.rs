//! Supported marketplaces and request origins

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::domain::errors::ImportError;

/// Closed set of marketplaces the importer knows how to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marketplace {
    /// 1688.com wholesale offers (`detail.1688.com/offer/<id>.html`)
    Alibaba1688,
    /// Taobao and Tmall items (`item.taobao.com/item.htm?id=<id>`)
    Taobao,
}

impl Marketplace {
    pub const ALL: [Self; 2] = [Self::Alibaba1688, Self::Taobao];

    /// Picks the marketplace from the URL shape, `None` for anything else.
    #[must_use]
    pub fn detect(url: &Url) -> Option<Self> {
        let host = url.host_str()?.to_ascii_lowercase();
        let path = url.path();

        if host == "1688.com" || host.ends_with(".1688.com") {
            return path.starts_with("/offer/").then_some(Self::Alibaba1688);
        }

        let taobao_host = host == "item.taobao.com"
            || host == "detail.tmall.com"
            || host == "world.taobao.com"
            || host.ends_with(".item.taobao.com");
        if taobao_host && path.starts_with("/item") {
            let has_id = url.query_pairs().any(|(k, v)| k == "id" && !v.is_empty());
            return has_id.then_some(Self::Taobao);
        }

        None
    }

    /// Parses and validates a raw input line into a product URL.
    pub fn parse_product_url(raw: &str) -> Result<(Self, Url), ImportError> {
        let trimmed = raw.trim();
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            return Err(ImportError::InvalidInput(format!(
                "not an http(s) URL: {trimmed}"
            )));
        }
        let url = Url::parse(trimmed)
            .map_err(|e| ImportError::InvalidInput(format!("{trimmed}: {e}")))?;
        let marketplace = Self::detect(&url).ok_or_else(|| {
            ImportError::InvalidInput(format!("unsupported marketplace URL: {trimmed}"))
        })?;
        Ok((marketplace, url))
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Alibaba1688 => "1688",
            Self::Taobao => "taobao",
        }
    }

    /// Landing page used to warm up cookies before retrying a challenged fetch.
    #[must_use]
    pub const fn home_url(self) -> &'static str {
        match self {
            Self::Alibaba1688 => "https://www.1688.com/",
            Self::Taobao => "https://www.taobao.com/",
        }
    }

    /// Base used to absolutize root-relative asset paths.
    #[must_use]
    pub const fn asset_base(self) -> &'static str {
        match self {
            Self::Alibaba1688 => "https://www.1688.com",
            Self::Taobao => "https://www.taobao.com",
        }
    }

    /// Referer the image CDN expects on hotlinked downloads.
    #[must_use]
    pub const fn image_referer(self) -> &'static str {
        self.home_url()
    }

    /// Hosts that indicate a redirect to the login wall.
    #[must_use]
    pub const fn login_hosts(self) -> &'static [&'static str] {
        match self {
            Self::Alibaba1688 => &["login.1688.com", "login.taobao.com"],
            Self::Taobao => &["login.taobao.com", "login.tmall.com"],
        }
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scheme + host (+ port) that sessions and rate limits are scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Origin(String);

impl Origin {
    #[must_use]
    pub fn of(url: &Url) -> Self {
        Self(url.origin().ascii_serialization())
    }

    pub fn parse(raw: &str) -> Result<Self, ImportError> {
        let url = Url::parse(raw).map_err(|e| ImportError::InvalidInput(format!("{raw}: {e}")))?;
        Ok(Self::of(&url))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe key used by cookie storage.
    #[must_use]
    pub fn storage_key(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
