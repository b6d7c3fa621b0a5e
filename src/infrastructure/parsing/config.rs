//! Selector configuration per marketplace
//!
//! Every field lists several CSS selectors tried in order, plus the keys to
//! look for inside embedded JSON state when the DOM comes up empty.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::marketplace::Marketplace;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn entry(label: &str, selectors: &[&str]) -> (String, Vec<String>) {
    (label.to_string(), strings(selectors))
}

/// CSS selectors for a product detail page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceSelectors {
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub description: Vec<String>,
    pub short_description: Vec<String>,
    /// Gallery `<img>` elements
    pub images: Vec<String>,
    /// Attributes holding the image URL, lazy-load attributes included
    pub image_attributes: Vec<String>,
    /// One element per selectable SKU option
    pub variation_items: Vec<String>,
    pub breadcrumb: Vec<String>,
    pub shipping: BTreeMap<String, Vec<String>>,
    pub seller: BTreeMap<String, Vec<String>>,
    /// Page text that marks a delisted or sold-out product
    pub out_of_stock_markers: Vec<String>,
    /// Regexes matching the prefix right before an embedded JSON object
    pub embedded_json: Vec<String>,
    pub json_keys: JsonKeys,
}

/// Keys searched (depth-first, in order) inside embedded JSON state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonKeys {
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub description: Vec<String>,
    pub images: Vec<String>,
    pub shipping: Vec<String>,
    pub seller: Vec<String>,
    pub category: Vec<String>,
}

impl MarketplaceSelectors {
    #[must_use]
    pub fn for_marketplace(marketplace: Marketplace) -> Self {
        match marketplace {
            Marketplace::Alibaba1688 => Self::alibaba_1688(),
            Marketplace::Taobao => Self::taobao(),
        }
    }

    #[must_use]
    pub fn alibaba_1688() -> Self {
        Self {
            title: strings(&["h1.d-title", ".title-text", "h1.title", ".offer-title", ".product-title", "h1"]),
            price: strings(&[
                ".price-now",
                ".price-text",
                ".price-value",
                ".price-original-sku .value",
                ".price",
                "[class*=price]",
            ]),
            description: strings(&[
                ".description",
                ".detail-content",
                ".product-description",
                "#description",
                "#detail",
                "#product-info",
            ]),
            short_description: strings(&[".offer-subtitle", ".sub-title"]),
            images: strings(&[
                ".detail-gallery img",
                ".detail-gallery-img",
                ".tab-trigger img",
                ".vertical-img img",
                ".main-image img",
                ".product-image img",
                ".offer-img img",
            ]),
            image_attributes: strings(&["data-lazy-src", "data-original", "data-src", "src"]),
            variation_items: strings(&[
                ".sku-property-item",
                ".sku-item",
                ".sku-select option",
                ".product-sku li",
                ".sku-list li",
            ]),
            breadcrumb: strings(&[".breadcrumb a", ".crumbs a", ".nav-crumbs a"]),
            shipping: BTreeMap::from([
                entry("shipping_fee", &[".shipping-fee", ".logistics-fee", ".delivery-fee", ".freight-fee"]),
                entry("shipping_time", &[".shipping-time", ".delivery-time", ".logistics-time"]),
                entry("shipping_method", &[".shipping-method", ".logistics-method", ".delivery-method"]),
                entry("ships_from", &[".logistics-city", ".delivery-addr"]),
            ]),
            seller: BTreeMap::from([
                entry("name", &[".seller-name", ".shop-name", ".company-name", ".store-name"]),
                entry("rating", &[".seller-rating", ".shop-rating", ".store-rating"]),
                entry("location", &[".seller-location", ".shop-location", ".company-location"]),
                entry("response_rate", &[".response-rate", ".reply-rate"]),
                entry("response_time", &[".response-time", ".reply-time"]),
            ]),
            out_of_stock_markers: strings(&["该商品已下架", "商品已下架", "已售罄", "offer is offline", "sold out"]),
            embedded_json: strings(&[
                r"window\.__INIT_DATA__\s*=\s*",
                r"var\s+offer\s*=\s*",
                r"window\.__GLOBAL_DATA\s*=\s*",
                r#""offerData"\s*:\s*"#,
                r"window\.__STORE_DATA\s*=\s*",
            ]),
            json_keys: JsonKeys {
                title: strings(&["subject", "offerTitle", "title", "productName", "name"]),
                price: strings(&["price", "priceDisplay", "offerPrice", "retailPrice", "minPrice"]),
                description: strings(&["description", "productDescription", "detail", "details"]),
                images: strings(&["offerImgList", "imageList", "images", "imgUrls", "imageUrl", "image"]),
                shipping: strings(&["shipping", "logistics", "freightInfo", "delivery"]),
                seller: strings(&["seller", "sellerModel", "shop", "companyInfo", "store"]),
                category: strings(&["categoryPath", "catNamePath", "categoryName"]),
            },
        }
    }

    #[must_use]
    pub fn taobao() -> Self {
        Self {
            title: strings(&[
                ".tb-main-title",
                "[class*=ItemTitle--mainTitle]",
                ".tb-detail-hd h1",
                "h1[data-spm]",
                ".product-title",
                "h1",
            ]),
            price: strings(&[
                ".tb-rmb-num",
                "#J_StrPrice .tb-rmb-num",
                "#J_PromoPriceNum",
                "[class*=Price--priceText]",
                ".tm-price",
                ".price",
            ]),
            description: strings(&["#J_DivItemDesc", "#description", ".ke-post", "#attributes", ".tb-detail-bd"]),
            short_description: strings(&[".tb-subtitle", ".newp"]),
            images: strings(&[
                "#J_UlThumb img",
                "#J_ImgBooth",
                "[class*=PicGallery--thumbnailPic]",
                ".tb-thumb img",
                ".tb-gallery img",
            ]),
            image_attributes: strings(&["data-src", "data-ks-lazyload", "data-original", "src"]),
            variation_items: strings(&[".J_TSaleProp li", ".tb-sku li[data-value]", "[class*=SkuContent--valueItem]"]),
            breadcrumb: strings(&["#J_BreadCrumb a", ".tb-breadcrumb a", ".breadcrumb a"]),
            shipping: BTreeMap::from([
                entry("shipping_fee", &["#J_WlServiceTitle", ".tb-postAge", "[class*=Delivery--freight]"]),
                entry("ships_from", &["#J-From", ".tb-delivery-from", "[class*=Delivery--from]"]),
                entry("shipping_time", &[".tb-delivery-time", "[class*=Delivery--time]"]),
            ]),
            seller: BTreeMap::from([
                entry("name", &[".tb-shop-name a", ".shop-name-link", "[class*=ShopHeader--title]", ".slogo-shopname"]),
                entry("rating", &[".tb-shop-rate", ".shop-rate", "[class*=ShopHeader--score]"]),
                entry("location", &[".tb-shop-location", ".shop-location"]),
            ]),
            out_of_stock_markers: strings(&["宝贝已下架", "此宝贝已下架", "已下柜", "卖光了", "sold out"]),
            embedded_json: strings(&[
                r"Hub\.config\.set\(\s*'sku'\s*,\s*",
                r"g_config\s*=\s*",
                r"window\.__INIT_DATA__\s*=\s*",
                r"var\s+_DATA_Detail\s*=\s*",
                r#""skuBase"\s*:\s*"#,
            ]),
            json_keys: JsonKeys {
                title: strings(&["title", "itemTitle", "idata_title", "name"]),
                price: strings(&["priceText", "price", "reservePrice", "defaultItemPrice"]),
                description: strings(&["desc", "description", "descInfo"]),
                images: strings(&["images", "auctionImages", "pics", "picsPath", "pic"]),
                shipping: strings(&["delivery", "deliveryFee", "logistics"]),
                seller: strings(&["seller", "shopInfo", "shop"]),
                category: strings(&["categoryPath", "catName"]),
            },
        }
    }
}
