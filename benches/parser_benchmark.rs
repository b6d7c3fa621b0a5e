//! Product page parsing throughput
//!
//! Full extraction on both marketplace fixtures, plus the blake3 keys used by
//! the translation cache and image store.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use url::Url;

use marketplace_importer_lib::domain::Marketplace;
use marketplace_importer_lib::infrastructure::parsing::{ParseContext, ParserRegistry};
use marketplace_importer_lib::services::TranslationCache;

const ALIBABA_PAGE: &str = include_str!("../tests/fixtures/alibaba_offer.html");
const TAOBAO_PAGE: &str = include_str!("../tests/fixtures/taobao_item.html");

fn bench_parse_pages(c: &mut Criterion) {
    let registry = ParserRegistry::new().expect("selectors compile");
    let cases = [
        (
            "alibaba_offer",
            ALIBABA_PAGE,
            "https://detail.1688.com/offer/623456789012.html",
            Marketplace::Alibaba1688,
        ),
        (
            "taobao_item",
            TAOBAO_PAGE,
            "https://item.taobao.com/item.htm?id=612345678901",
            Marketplace::Taobao,
        ),
    ];

    let mut group = c.benchmark_group("parse_page");
    for (name, page, url, marketplace) in cases {
        let ctx = ParseContext::new(Url::parse(url).expect("fixture url"), marketplace);
        group.throughput(Throughput::Bytes(page.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| registry.parse_page(black_box(page), black_box(&ctx)))
        });
    }
    group.finish();
}

fn bench_content_keys(c: &mut Criterion) {
    let text = "加厚不锈钢保温杯 大容量车载水杯 ".repeat(20);
    c.bench_function("translation_cache_key", |b| {
        b.iter(|| TranslationCache::key(black_box(&text), "zh", "en"))
    });

    let image = vec![0x5a_u8; 256 * 1024];
    let mut group = c.benchmark_group("image_hash");
    group.throughput(Throughput::Bytes(image.len() as u64));
    group.bench_function("blake3_256k", |b| b.iter(|| blake3::hash(black_box(&image))));
    group.finish();
}

criterion_group!(benches, bench_parse_pages, bench_content_keys);
criterion_main!(benches);
