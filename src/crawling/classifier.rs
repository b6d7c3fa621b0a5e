//! Response classification
//!
//! Maps a render result onto what the fetch pool should do with it. The
//! classifier only looks at the response; retry budgets live in
//! [`crate::crawling::retry`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::marketplace::Marketplace;
use crate::infrastructure::renderer::{RenderError, RenderedPage};
use crate::infrastructure::solving_service::CaptchaKind;

/// Title or price containers and embedded state objects; every product
/// page carries at least one of them.
const ALIBABA_CONTENT_MARKERS: [&str; 9] = [
    "d-title",
    "title-text",
    "offer-title",
    "mod-detail-title",
    "price-now",
    "mod-detail-price",
    "__INIT_DATA__",
    "offerData",
    "__GLOBAL_DATA",
];
const TAOBAO_CONTENT_MARKERS: [&str; 9] = [
    "tb-main-title",
    "ItemTitle--mainTitle",
    "tb-detail-hd",
    "tb-rmb-num",
    "J_StrPrice",
    "Price--priceText",
    "g_config",
    "_DATA_Detail",
    "__INIT_DATA__",
];

#[must_use]
pub const fn content_markers(marketplace: Marketplace) -> &'static [&'static str] {
    match marketplace {
        Marketplace::Alibaba1688 => &ALIBABA_CONTENT_MARKERS,
        Marketplace::Taobao => &TAOBAO_CONTENT_MARKERS,
    }
}

fn has_product_content(content: &str, marketplace: Marketplace) -> bool {
    content_markers(marketplace).iter().any(|m| content.contains(m))
}

const SLIDER_MARKERS: [&str; 5] = ["nc_iconfont btn_slide", "nc-lang-cnt", "nc_wrapper", "yidun_slider", "滑动验证"];
const INTERSTITIAL_MARKERS: [&str; 6] = [
    "cf-chl",
    "just a moment",
    "checking your browser",
    "punish",
    "x5sec",
    "验证码",
];

static SITE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"data-sitekey\s*=\s*["']([^"']+)["']"#).expect("hardcoded regex pattern is valid")
});

/// Kind of anti-bot barrier found on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Captcha(CaptchaKind),
    Slider,
    Interstitial,
    /// 2xx page without the product content
    MissingContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Ok,
    Challenge {
        kind: ChallengeKind,
        site_key: Option<String>,
    },
    AuthRequired,
    RateLimited {
        retry_after: Option<Duration>,
    },
    Transport {
        message: String,
    },
    /// Client error that retrying cannot fix (404, 410, ...)
    Rejected {
        status: u16,
    },
    RendererUnavailable(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseClassifier;

impl ResponseClassifier {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    pub fn classify_result(
        &self,
        result: &Result<RenderedPage, RenderError>,
        marketplace: Marketplace,
    ) -> Classification {
        match result {
            Ok(page) => self.classify(page, marketplace),
            Err(RenderError::Unavailable(message)) => Classification::RendererUnavailable(message.clone()),
            Err(err) => Classification::Transport {
                message: err.to_string(),
            },
        }
    }

    #[must_use]
    pub fn classify(&self, page: &RenderedPage, marketplace: Marketplace) -> Classification {
        if page.status == 429 {
            return Classification::RateLimited {
                retry_after: page.retry_after,
            };
        }
        if page.status == 401 || is_login_redirect(page, marketplace) {
            return Classification::AuthRequired;
        }
        if let Some(challenge) = self.detect_challenge(&page.content) {
            return challenge;
        }
        match page.status {
            403 => Classification::Challenge {
                kind: ChallengeKind::Interstitial,
                site_key: None,
            },
            500..=599 => Classification::Transport {
                message: format!("HTTP {}", page.status),
            },
            200..=299 if !has_product_content(&page.content, marketplace) => Classification::Challenge {
                kind: ChallengeKind::MissingContent,
                site_key: None,
            },
            200..=299 => Classification::Ok,
            status => Classification::Rejected { status },
        }
    }

    fn detect_challenge(&self, content: &str) -> Option<Classification> {
        let site_key = SITE_KEY
            .captures(content)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());

        if content.contains("h-captcha") {
            return Some(Classification::Challenge {
                kind: ChallengeKind::Captcha(CaptchaKind::HCaptcha),
                site_key,
            });
        }
        if content.contains("g-recaptcha") || (site_key.is_some() && content.contains("recaptcha")) {
            return Some(Classification::Challenge {
                kind: ChallengeKind::Captcha(CaptchaKind::RecaptchaV2),
                site_key,
            });
        }
        if SLIDER_MARKERS.iter().any(|m| content.contains(m)) {
            return Some(Classification::Challenge {
                kind: ChallengeKind::Slider,
                site_key: None,
            });
        }
        let lowered = content.to_lowercase();
        if INTERSTITIAL_MARKERS.iter().any(|m| lowered.contains(m)) {
            return Some(Classification::Challenge {
                kind: ChallengeKind::Interstitial,
                site_key: None,
            });
        }
        None
    }
}

fn is_login_redirect(page: &RenderedPage, marketplace: Marketplace) -> bool {
    page.final_url
        .host_str()
        .is_some_and(|host| marketplace.login_hosts().contains(&host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use url::Url;

    fn page(status: u16, final_url: &str, content: &str) -> RenderedPage {
        RenderedPage {
            requested_url: Url::parse("https://detail.1688.com/offer/1.html").unwrap(),
            final_url: Url::parse(final_url).unwrap(),
            status,
            content: content.to_string(),
            retry_after: None,
        }
    }

    fn product_body() -> String {
        r#"<html><body><h1 class="d-title">商品</h1><span class="price-now">12.50</span></body></html>"#.to_string()
    }

    const OFFER: &str = "https://detail.1688.com/offer/1.html";

    #[rstest]
    #[case(200, OFFER, product_body(), Classification::Ok)]
    #[case(429, OFFER, String::new(), Classification::RateLimited { retry_after: None })]
    #[case(200, "https://login.1688.com/member/signin.htm", product_body(), Classification::AuthRequired)]
    #[case(401, OFFER, String::new(), Classification::AuthRequired)]
    #[case(503, OFFER, "busy".to_string(), Classification::Transport { message: "HTTP 503".to_string() })]
    #[case(404, OFFER, product_body(), Classification::Rejected { status: 404 })]
    #[case(
        200,
        OFFER,
        "<div>ok</div>".to_string(),
        Classification::Challenge { kind: ChallengeKind::MissingContent, site_key: None }
    )]
    #[case(
        200,
        OFFER,
        r#"<div id="nc_1_wrapper"><span class="nc_iconfont btn_slide"></span></div>"#.to_string(),
        Classification::Challenge { kind: ChallengeKind::Slider, site_key: None }
    )]
    #[case(
        403,
        OFFER,
        "<title>Just a moment...</title>".to_string(),
        Classification::Challenge { kind: ChallengeKind::Interstitial, site_key: None }
    )]
    #[case(
        200,
        OFFER,
        r#"<div class="g-recaptcha" data-sitekey="6Lc-site"></div>"#.to_string(),
        Classification::Challenge {
            kind: ChallengeKind::Captcha(CaptchaKind::RecaptchaV2),
            site_key: Some("6Lc-site".to_string()),
        }
    )]
    fn test_classify(
        #[case] status: u16,
        #[case] final_url: &str,
        #[case] content: String,
        #[case] expected: Classification,
    ) {
        let classifier = ResponseClassifier::new();
        assert_eq!(
            classifier.classify(&page(status, final_url, &content), Marketplace::Alibaba1688),
            expected
        );
    }

    #[test]
    fn test_large_page_without_product_content_is_a_challenge() {
        let classifier = ResponseClassifier::new();
        let filler = format!("<html><body>{}</body></html>", "<p>热门推荐 精选好货</p>".repeat(500));
        assert!(filler.len() > 10_000);
        for marketplace in [Marketplace::Alibaba1688, Marketplace::Taobao] {
            assert_eq!(
                classifier.classify(&page(200, OFFER, &filler), marketplace),
                Classification::Challenge {
                    kind: ChallengeKind::MissingContent,
                    site_key: None
                }
            );
        }
    }

    #[test]
    fn test_fixture_pages_carry_content_markers() {
        let classifier = ResponseClassifier::new();
        for marketplace in [Marketplace::Alibaba1688, Marketplace::Taobao] {
            let fixture = crate::test_utils::product_page(marketplace);
            assert_eq!(
                classifier.classify(&page(200, OFFER, &fixture), marketplace),
                Classification::Ok
            );
        }
    }

    #[test]
    fn test_render_errors() {
        let classifier = ResponseClassifier::new();
        let unavailable = Err(RenderError::Unavailable("browser crashed".to_string()));
        assert_eq!(
            classifier.classify_result(&unavailable, Marketplace::Taobao),
            Classification::RendererUnavailable("browser crashed".to_string())
        );

        let timeout = Err(RenderError::Timeout {
            url: OFFER.to_string(),
            seconds: 30,
        });
        assert!(matches!(
            classifier.classify_result(&timeout, Marketplace::Taobao),
            Classification::Transport { .. }
        ));
    }

    #[test]
    fn test_rate_limit_keeps_retry_after() {
        let mut limited = page(429, OFFER, "");
        limited.retry_after = Some(Duration::from_secs(7));
        assert_eq!(
            ResponseClassifier::new().classify(&limited, Marketplace::Alibaba1688),
            Classification::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }
}
