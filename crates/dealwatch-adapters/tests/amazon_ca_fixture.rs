use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use dealwatch_adapters::{load_fixture_bundle, parse_search_page};
use dealwatch_storage::{FetchError, PageLoader};

fn bundle_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/amazon-ca/sample/bundle.json")
}

#[test]
fn amazon_ca_fixture_files_exist() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    assert!(root.join("fixtures/amazon-ca/sample/bundle.json").exists());
    assert!(root.join("fixtures/amazon-ca/sample/snapshot.json").exists());
}

#[test]
fn every_discovered_link_has_a_bundle_entry() {
    let bundle = load_fixture_bundle(bundle_path()).unwrap();
    let search = bundle.search_page.inline_text.as_deref().expect("search page captured");

    let discovered: BTreeSet<String> = parse_search_page(search, &bundle.base_url)
        .into_iter()
        .map(|t| t.url)
        .collect();
    let captured: BTreeSet<String> = bundle.detail_pages.keys().cloned().collect();
    assert_eq!(discovered, captured);
}

#[tokio::test]
async fn uncaptured_detail_page_replays_as_a_failed_fetch() {
    let bundle = load_fixture_bundle(bundle_path()).unwrap();
    let err = bundle
        .load_page("https://www.amazon.ca/dp/B0SNKC0003")
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::NotCaptured { .. }), "{err}");

    let page = bundle.load_page("https://www.amazon.ca/dp/B0SNKA0001").await.unwrap();
    assert_eq!(page.status, 200);
    assert!(page.text().contains("productTitle"));
}
