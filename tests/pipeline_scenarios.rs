//! End-to-end import runs against scripted collaborators.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{ScenarioBuilder, taobao_item};
use marketplace_importer_lib::domain::{ErrorKind, Marketplace, Origin, RecordWarning};
use marketplace_importer_lib::infrastructure::config::StrategyKind;
use marketplace_importer_lib::infrastructure::cookie_storage::{CookieStorage, FileCookieStorage};
use marketplace_importer_lib::infrastructure::translation_providers::TranslationProvider;
use marketplace_importer_lib::test_utils::{
    MockImageFetcher, MockProvider, MockSolver, ScriptedPage, ScriptedRenderer, TAOBAO_ITEM_URL, fake_image,
    product_page,
};
use tokio_test::assert_ok;

const FRONT: &str = "https://gd1.alicdn.com/imgextra/i1/2200/O1CN01front.jpg";
const BACK: &str = "https://gd2.alicdn.com/imgextra/i2/2200/O1CN01back.jpg";
const BACK_COPY: &str = "https://gd2.alicdn.com/imgextra/i2/2200/O1CN01backcopy.jpg";

const SLIDER_PAGE: &str = r#"<html><body><div id="nc_1_wrapper"><span class="nc_iconfont btn_slide"></span></div></body></html>"#;
const RECAPTCHA_PAGE: &str = r#"<html><body><div class="g-recaptcha" data-sitekey="6Lc-taobao"></div></body></html>"#;

fn taobao_page() -> String {
    product_page(Marketplace::Taobao)
}

fn taobao_images() -> MockImageFetcher {
    MockImageFetcher::new()
        .with_image(FRONT, fake_image(1))
        .with_image(BACK, fake_image(2))
}

#[tokio::test]
async fn identical_bytes_under_different_names_share_one_asset() {
    let dir = tempfile::tempdir().unwrap();
    let first = taobao_item(1001);
    let second = taobao_item(1002);
    let renamed = taobao_page().replace("O1CN01back.jpg", "O1CN01backcopy.jpg");

    let scenario = ScenarioBuilder::new(dir.path())
        .renderer(
            ScriptedRenderer::new()
                .script(&first, vec![ScriptedPage::ok(&taobao_page())])
                .script(&second, vec![ScriptedPage::ok(&renamed)]),
        )
        .fetcher(taobao_images().with_image(BACK_COPY, fake_image(2)))
        .build();

    let summary = assert_ok!(scenario.run(&[&first, &second]).await);
    assert_eq!(summary.stats.records_written, 2);
    assert_eq!(summary.unique_images, 2);
    assert_eq!(scenario.storage.writes(), 2);

    let records = scenario.records.records();
    let path_of = |url: &str, source: &str| {
        records
            .iter()
            .find(|r| r.source_url == url)
            .and_then(|r| r.images.iter().find(|i| i.source_url == source))
            .map(|i| i.path.clone())
            .unwrap()
    };
    assert_eq!(path_of(&first, BACK), path_of(&second, BACK_COPY));
    assert_ne!(path_of(&first, FRONT), path_of(&first, BACK));
    assert!(scenario.storage.contains(&path_of(&second, BACK_COPY)));

    let shared = scenario.pipeline.images().assets();
    let back_asset = shared.iter().find(|a| a.path == path_of(&first, BACK)).unwrap();
    assert_eq!(back_asset.references.len(), 2);
}

#[tokio::test]
async fn solved_challenge_session_is_persisted_and_reused() {
    let dir = tempfile::tempdir().unwrap();
    let home = Marketplace::Taobao.home_url();

    let first_run = ScenarioBuilder::new(dir.path())
        .renderer(
            ScriptedRenderer::new()
                .script(
                    TAOBAO_ITEM_URL,
                    vec![ScriptedPage::ok(SLIDER_PAGE), ScriptedPage::ok(&taobao_page())],
                )
                .script(home, vec![ScriptedPage::ok("<html>home</html>").with_cookie("x5sec", "solved")]),
        )
        .fetcher(taobao_images())
        .build();

    let summary = assert_ok!(first_run.run(&[TAOBAO_ITEM_URL]).await);
    assert_eq!(summary.stats.challenges_detected, 1);
    assert_eq!(summary.stats.challenges_solved, 1);
    assert_eq!(summary.stats.records_written, 1);
    assert_eq!(first_run.renderer.calls_to(home).len(), 1);
    assert!(first_run.failures.entries().is_empty());
    let stored = std::fs::read_dir(&first_run.config.session.cookie_dir).unwrap().count();
    assert_eq!(stored, 1);

    // Same cookie directory, fresh process
    let second_run = ScenarioBuilder::new(dir.path())
        .renderer(ScriptedRenderer::new().script(TAOBAO_ITEM_URL, vec![ScriptedPage::ok(&taobao_page())]))
        .fetcher(taobao_images())
        .build();

    let summary = assert_ok!(second_run.run(&[TAOBAO_ITEM_URL]).await);
    assert_eq!(summary.stats.challenges_detected, 0);
    assert!(second_run.renderer.calls_to(home).is_empty());
    let calls = second_run.renderer.calls_to(TAOBAO_ITEM_URL);
    assert_eq!(calls.len(), 1);
    assert!(calls[0].cookie.as_deref().unwrap_or_default().contains("x5sec=solved"));
}

#[tokio::test]
async fn captcha_is_handed_to_the_solving_service() {
    let dir = tempfile::tempdir().unwrap();
    let solver = Arc::new(MockSolver::succeeding("tok-123"));

    let scenario = ScenarioBuilder::new(dir.path())
        .config(|c| c.challenge.strategies = vec![StrategyKind::SolvingService])
        .solver(solver.clone())
        .renderer(ScriptedRenderer::new().script(
            TAOBAO_ITEM_URL,
            vec![ScriptedPage::ok(RECAPTCHA_PAGE), ScriptedPage::ok(&taobao_page())],
        ))
        .fetcher(taobao_images())
        .build();

    let summary = assert_ok!(scenario.run(&[TAOBAO_ITEM_URL]).await);
    assert_eq!(solver.calls(), 1);
    assert_eq!(summary.stats.challenges_solved, 1);
    assert_eq!(scenario.records.records().len(), 1);

    let last = scenario.renderer.calls_to(TAOBAO_ITEM_URL).pop().unwrap();
    assert!(last.cookie.unwrap_or_default().contains("g-recaptcha-response=tok-123"));
}

#[tokio::test]
async fn unsolvable_challenge_fails_only_its_task() {
    let dir = tempfile::tempdir().unwrap();
    let blocked = taobao_item(2001);
    let open = taobao_item(2002);

    let scenario = ScenarioBuilder::new(dir.path())
        .config(|c| c.challenge.strategies = vec![StrategyKind::BackoffWait])
        .renderer(
            ScriptedRenderer::new()
                .script(&blocked, vec![ScriptedPage::ok(SLIDER_PAGE)])
                .script(&open, vec![ScriptedPage::ok(&taobao_page())]),
        )
        .fetcher(taobao_images())
        .build();

    let summary = assert_ok!(scenario.run(&[&blocked, &open]).await);
    assert_eq!(summary.stats.records_written, 1);
    let failures = scenario.failures.entries();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].url, blocked);
    assert_eq!(failures[0].kind, ErrorKind::CaptchaUnsolvable);
}

#[tokio::test]
async fn fallback_provider_output_is_used_without_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let primary = Arc::new(MockProvider::failing("primary"));
    let secondary = Arc::new(MockProvider::translating("secondary", "EN "));

    let scenario = ScenarioBuilder::new(dir.path())
        .providers(vec![primary.clone() as Arc<dyn TranslationProvider>, secondary.clone()])
        .renderer(ScriptedRenderer::new().script(TAOBAO_ITEM_URL, vec![ScriptedPage::ok(&taobao_page())]))
        .fetcher(taobao_images())
        .build();

    let summary = assert_ok!(scenario.run(&[TAOBAO_ITEM_URL]).await);
    let records = scenario.records.records();
    let record = &records[0];
    assert_eq!(record.name, "EN 夏季新款纯棉短袖T恤男");
    assert!(record.warnings.is_empty(), "unexpected warnings: {:?}", record.warnings);
    assert_eq!(summary.stats.records_with_warnings, 0);
    assert!(primary.calls() > 0);
    assert!(secondary.calls() > 0);
    assert!(summary.cached_translations > 0);
    assert_eq!(scenario.cache.len(), summary.cached_translations);
}

#[tokio::test]
async fn exhausted_providers_keep_source_text_and_warn() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = ScenarioBuilder::new(dir.path())
        .providers(vec![Arc::new(MockProvider::failing("only"))])
        .renderer(ScriptedRenderer::new().script(TAOBAO_ITEM_URL, vec![ScriptedPage::ok(&taobao_page())]))
        .fetcher(taobao_images())
        .build();

    let summary = assert_ok!(scenario.run(&[TAOBAO_ITEM_URL]).await);
    let record = scenario.records.records().remove(0);
    assert_eq!(record.name, "夏季新款纯棉短袖T恤男");
    assert!(record.warnings.contains(&RecordWarning::Untranslated {
        field: "title".to_string()
    }));
    assert_eq!(summary.stats.records_with_warnings, 1);
    assert_eq!(summary.cached_translations, 0);
}

#[tokio::test]
async fn exhausted_task_is_logged_once_and_never_output() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = taobao_item(3001);
    let healthy = taobao_item(3002);

    let scenario = ScenarioBuilder::new(dir.path())
        .renderer(
            ScriptedRenderer::new()
                .script(&flaky, vec![ScriptedPage::status(503, "busy")])
                .script(&healthy, vec![ScriptedPage::ok(&taobao_page())]),
        )
        .fetcher(taobao_images())
        .build();

    let summary = assert_ok!(scenario.run(&[&flaky, &healthy]).await);

    let failures = scenario.failures.entries();
    let for_flaky: Vec<_> = failures.iter().filter(|f| f.url == flaky).collect();
    assert_eq!(for_flaky.len(), 1);
    assert_eq!(for_flaky[0].kind, ErrorKind::NetworkError);
    assert_eq!(for_flaky[0].attempts, 3);
    assert_eq!(scenario.renderer.calls_to(&flaky).len(), 3);

    let written: BTreeSet<String> = scenario.records.records().into_iter().map(|r| r.source_url).collect();
    assert_eq!(written, BTreeSet::from([healthy.clone()]));
    assert_eq!(summary.stats.failed, 1);
    assert_eq!(summary.stats.failures_by_kind.get(&ErrorKind::NetworkError), Some(&1));
}

#[tokio::test]
async fn rate_limit_holds_with_more_workers_than_budget() {
    let dir = tempfile::tempdir().unwrap();
    let urls: Vec<String> = (4001..4005).map(taobao_item).collect();
    let renderer = urls.iter().fold(ScriptedRenderer::new(), |r, url| {
        r.script(url, vec![ScriptedPage::ok(&taobao_page())])
    });

    let scenario = ScenarioBuilder::new(dir.path())
        .config(|c| {
            c.workers.concurrency = 4;
            c.rate_limit.requests_per_second = 5;
            c.rate_limit.burst = 1;
        })
        .renderer(renderer)
        .fetcher(taobao_images())
        .build();

    let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    let summary = assert_ok!(scenario.run(&refs).await);
    assert_eq!(summary.stats.records_written, 4);

    let mut starts: Vec<_> = scenario.renderer.calls().into_iter().map(|c| c.at).collect();
    starts.sort();
    for pair in starts.windows(2) {
        // 5 rps with a burst of one spaces renders ~200ms apart
        assert!(
            pair[1].duration_since(pair[0]) >= Duration::from_millis(150),
            "renders too close: {:?}",
            pair[1].duration_since(pair[0])
        );
    }
}

#[tokio::test]
async fn rate_limit_holds_while_a_challenge_is_solved() {
    let dir = tempfile::tempdir().unwrap();
    let challenged = taobao_item(6001);
    let others: Vec<String> = (6002..6004).map(taobao_item).collect();
    let renderer = others.iter().fold(
        ScriptedRenderer::new().script(
            &challenged,
            vec![ScriptedPage::ok(SLIDER_PAGE), ScriptedPage::ok(&taobao_page())],
        ),
        |r, url| r.script(url, vec![ScriptedPage::ok(&taobao_page())]),
    );

    let scenario = ScenarioBuilder::new(dir.path())
        .config(|c| {
            c.workers.concurrency = 2;
            c.rate_limit.requests_per_second = 2;
            c.rate_limit.burst = 1;
            c.challenge.strategies = vec![StrategyKind::BackoffWait];
        })
        .renderer(renderer)
        .fetcher(taobao_images())
        .build();

    let summary = assert_ok!(scenario.run(&[&challenged, &others[0], &others[1]]).await);
    assert_eq!(summary.stats.challenges_solved, 1);
    assert_eq!(summary.stats.records_written, 3);

    // first render, the verifying render and the retry for the challenged item
    assert_eq!(scenario.renderer.calls_to(&challenged).len(), 3);
    let mut starts: Vec<_> = scenario.renderer.calls().into_iter().map(|c| c.at).collect();
    assert_eq!(starts.len(), 5);
    starts.sort();
    for pair in starts.windows(2) {
        // 2 rps with a burst of one: ~500ms apart, challenge renders included
        assert!(
            pair[1].duration_since(pair[0]) >= Duration::from_millis(400),
            "renders too close at 2 rps: {:?}",
            pair[1].duration_since(pair[0])
        );
    }
}

#[tokio::test]
async fn renders_started_before_a_solve_keep_the_solved_session() {
    let dir = tempfile::tempdir().unwrap();
    let home = Marketplace::Taobao.home_url();
    let challenged = taobao_item(7001);
    let slow_c = taobao_item(7002);
    let slow_d = taobao_item(7003);
    let late = Duration::from_millis(300);

    let scenario = ScenarioBuilder::new(dir.path())
        .config(|c| {
            c.workers.concurrency = 3;
            c.challenge.strategies = vec![StrategyKind::HomepageWarmup];
        })
        .renderer(
            ScriptedRenderer::new()
                .script(
                    &challenged,
                    vec![
                        ScriptedPage::ok(SLIDER_PAGE).delayed(Duration::from_millis(50)),
                        ScriptedPage::ok(&taobao_page()),
                    ],
                )
                .script(home, vec![ScriptedPage::ok("<html>home</html>").with_cookie("solved", "yes")])
                .script(
                    &slow_c,
                    vec![ScriptedPage::ok(&taobao_page()).with_cookie("c", "1").delayed(late)],
                )
                .script(
                    &slow_d,
                    vec![ScriptedPage::ok(&taobao_page()).with_cookie("d", "1").delayed(late)],
                ),
        )
        .fetcher(taobao_images())
        .build();

    let summary = assert_ok!(scenario.run(&[&challenged, &slow_c, &slow_d]).await);
    assert_eq!(summary.stats.challenges_solved, 1);
    assert_eq!(summary.stats.records_written, 3);
    // the slow renders went out before the solve, without its cookie
    assert!(scenario.renderer.calls_to(&slow_c)[0].cookie.is_none());

    let storage = FileCookieStorage::new(&scenario.config.session.cookie_dir);
    let origin = Origin::parse("https://item.taobao.com").unwrap();
    let stored = storage.read(&origin).await.unwrap().expect("session persisted");
    assert_eq!(stored.cookies.get("solved").map(String::as_str), Some("yes"));
    assert_eq!(stored.cookies.get("c").map(String::as_str), Some("1"));
    assert_eq!(stored.cookies.get("d").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn bad_lines_are_reported_next_to_good_records() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = ScenarioBuilder::new(dir.path())
        .renderer(ScriptedRenderer::new().script(TAOBAO_ITEM_URL, vec![ScriptedPage::ok(&taobao_page())]))
        .fetcher(taobao_images())
        .build();

    let summary = assert_ok!(
        scenario
            .run(&["ftp://item.taobao.com/x", TAOBAO_ITEM_URL, "https://shop.example.com/p/1"])
            .await
    );
    assert_eq!(summary.stats.rejected_input, 2);
    assert_eq!(summary.stats.records_written, 1);
    assert!(
        scenario
            .failures
            .entries()
            .iter()
            .all(|f| f.kind == ErrorKind::InvalidInput && f.attempts == 0)
    );
}
