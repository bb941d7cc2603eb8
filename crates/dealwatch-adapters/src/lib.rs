//! Record source contracts + the search-result HTML source and its fixtures.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dealwatch_core::RawCandidate;
use dealwatch_storage::{FetchError, FetchedResponse, PageLoader};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealwatch-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub observed_date: NaiveDate,
}

/// A listing link found on the search page. `title_hint` is the anchor text,
/// kept so a listing whose page cannot be fetched still has an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
    pub title_hint: Option<String>,
}

impl ListingTarget {
    /// Candidate for a listing whose page could not be fetched.
    pub fn fetch_failed(&self) -> RawCandidate {
        RawCandidate::title_only(Some(self.url.clone()), self.title_hint.clone())
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("listing discovery failed for {url}: {source}")]
    Discovery {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("no listing links found on {url}")]
    NoListings { url: String },
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Enumerate candidate listings. An error here aborts the run.
    async fn discover_listings(
        &self,
        ctx: &AdapterContext,
    ) -> Result<Vec<ListingTarget>, AdapterError>;

    /// Fetch every target and return one raw candidate per target, in target
    /// order. Per-listing failures degrade the candidate instead of failing.
    async fn fetch_listings(
        &self,
        ctx: &AdapterContext,
        targets: &[ListingTarget],
    ) -> Vec<RawCandidate>;
}

/// Ordered selectors for one field; the first one yielding non-empty text wins.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionChain {
    pub field: &'static str,
    pub selectors: &'static [&'static str],
}

impl ExtractionChain {
    pub fn extract(&self, document: &Html) -> Option<String> {
        for selector in self.selectors {
            let sel = match Selector::parse(selector) {
                Ok(sel) => sel,
                Err(err) => {
                    warn!(field = self.field, selector, error = %err, "skipping invalid selector");
                    continue;
                }
            };
            if let Some(text) = document.select(&sel).find_map(element_text) {
                return Some(text);
            }
        }
        debug!(field = self.field, "field not found on page");
        None
    }
}

pub const TITLE_CHAIN: ExtractionChain = ExtractionChain {
    field: "title",
    selectors: &["#productTitle"],
};

pub const PRICE_WHOLE_CHAIN: ExtractionChain = ExtractionChain {
    field: "price_whole",
    selectors: &["span.a-price-whole"],
};

pub const PRICE_FRACTION_CHAIN: ExtractionChain = ExtractionChain {
    field: "price_fraction",
    selectors: &["span.a-price-fraction"],
};

pub const PRICE_TEXT_CHAIN: ExtractionChain = ExtractionChain {
    field: "price_text",
    selectors: &["#priceblock_dealprice", "#priceblock_ourprice"],
};

pub const RATING_CHAIN: ExtractionChain = ExtractionChain {
    field: "rating",
    selectors: &["span.a-icon-alt"],
};

pub const REVIEW_COUNT_CHAIN: ExtractionChain = ExtractionChain {
    field: "review_count",
    selectors: &["#acrCustomerReviewText"],
};

pub const AVAILABILITY_CHAIN: ExtractionChain = ExtractionChain {
    field: "availability",
    selectors: &["#availability span", "#twisterAvailability"],
};

const LISTING_LINK_SELECTORS: &[&str] = &[
    "a.a-link-normal[href^='/dp/']",
    "a.a-link-normal[href*='/dp/']",
];

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Read one product page into a raw candidate. A page without a product
/// title yields a title-less candidate, which the normalizer drops; the
/// discovery anchor text is only used when the page could not be fetched.
pub fn extract_listing_page(html: &str, target: &ListingTarget) -> RawCandidate {
    let document = Html::parse_document(html);
    RawCandidate {
        listing_url: Some(target.url.clone()),
        title: TITLE_CHAIN.extract(&document),
        price_whole: PRICE_WHOLE_CHAIN.extract(&document),
        price_fraction: PRICE_FRACTION_CHAIN.extract(&document),
        price_text: PRICE_TEXT_CHAIN.extract(&document),
        rating: RATING_CHAIN.extract(&document),
        review_count: REVIEW_COUNT_CHAIN.extract(&document),
        availability: AVAILABILITY_CHAIN.extract(&document),
    }
}

/// Collect product links from a search page, query strings stripped,
/// absolutized against `base_url` and de-duplicated in page order.
pub fn parse_search_page(html: &str, base_url: &str) -> Vec<ListingTarget> {
    let document = Html::parse_document(html);
    for selector in LISTING_LINK_SELECTORS {
        let Ok(sel) = Selector::parse(selector) else {
            continue;
        };
        let targets = collect_listing_links(&document, &sel, base_url);
        if !targets.is_empty() {
            return targets;
        }
    }
    Vec::new()
}

fn collect_listing_links(document: &Html, sel: &Selector, base_url: &str) -> Vec<ListingTarget> {
    let mut targets: Vec<ListingTarget> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for anchor in document.select(sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let path = href.split(['?', '#']).next().unwrap_or_default().trim();
        if path.is_empty() {
            continue;
        }
        let url = absolutize(base_url, path);
        let hint = element_text(anchor);

        match seen.get(&url) {
            Some(&idx) => {
                if targets[idx].title_hint.is_none() {
                    targets[idx].title_hint = hint;
                }
            }
            None => {
                seen.insert(url.clone(), targets.len());
                targets.push(ListingTarget {
                    url,
                    title_hint: hint,
                });
            }
        }
    }
    targets
}

fn absolutize(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchPoolConfig {
    pub concurrency: usize,
    pub fetch_timeout: Duration,
}

impl Default for FetchPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fetch_timeout: Duration::from_secs(20),
        }
    }
}

pub type PageExtractor = fn(&str, &ListingTarget) -> RawCandidate;

async fn load_with_timeout(
    loader: &dyn PageLoader,
    url: &str,
    after: Duration,
) -> Result<FetchedResponse, FetchError> {
    match tokio::time::timeout(after, loader.load_page(url)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            url: url.to_string(),
            after,
        }),
    }
}

async fn fetch_one(
    loader: &dyn PageLoader,
    target: &ListingTarget,
    fetch_timeout: Duration,
    extract: PageExtractor,
) -> RawCandidate {
    match load_with_timeout(loader, &target.url, fetch_timeout).await {
        Ok(page) => extract(&page.text(), target),
        Err(err) => {
            warn!(url = %target.url, error = %err, "listing fetch failed; keeping title only");
            target.fetch_failed()
        }
    }
}

/// Fetch all targets with at most `config.concurrency` requests in flight.
/// Returns only after every fetch has finished, one candidate per target in
/// target order.
pub async fn fetch_all(
    loader: Arc<dyn PageLoader>,
    targets: &[ListingTarget],
    config: FetchPoolConfig,
    extract: PageExtractor,
) -> Vec<RawCandidate> {
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (idx, target) in targets.iter().cloned().enumerate() {
        let loader = Arc::clone(&loader);
        let permits = Arc::clone(&permits);
        let span = info_span!("listing_fetch", url = %target.url);
        tasks.spawn(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (idx, target.fetch_failed());
                };
                let candidate =
                    fetch_one(loader.as_ref(), &target, config.fetch_timeout, extract).await;
                (idx, candidate)
            }
            .instrument(span),
        );
    }

    let mut slots: Vec<Option<RawCandidate>> = vec![None; targets.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, candidate)) => slots[idx] = Some(candidate),
            Err(err) => warn!(error = %err, "listing fetch task did not complete"),
        }
    }

    slots
        .into_iter()
        .zip(targets)
        .map(|(slot, target)| {
            slot.unwrap_or_else(|| target.fetch_failed())
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SearchSourceConfig {
    pub source_id: String,
    pub search_url: String,
    pub base_url: String,
    pub pool: FetchPoolConfig,
}

/// Retailer search-result source: one search page, then one product page per
/// listing link.
pub struct SearchResultSource {
    config: SearchSourceConfig,
    loader: Arc<dyn PageLoader>,
}

impl SearchResultSource {
    pub fn new(config: SearchSourceConfig, loader: Arc<dyn PageLoader>) -> Self {
        Self { config, loader }
    }

    pub fn config(&self) -> &SearchSourceConfig {
        &self.config
    }
}

#[async_trait]
impl RecordSource for SearchResultSource {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    async fn discover_listings(
        &self,
        ctx: &AdapterContext,
    ) -> Result<Vec<ListingTarget>, AdapterError> {
        let url = self.config.search_url.as_str();
        let page = load_with_timeout(self.loader.as_ref(), url, self.config.pool.fetch_timeout)
            .instrument(info_span!("listing_discovery", run_id = %ctx.run_id, url))
            .await
            .map_err(|source| AdapterError::Discovery {
                url: url.to_string(),
                source,
            })?;

        let targets = parse_search_page(&page.text(), &self.config.base_url);
        if targets.is_empty() {
            return Err(AdapterError::NoListings {
                url: url.to_string(),
            });
        }
        info!(source_id = %self.config.source_id, listings = targets.len(), "found product links");
        Ok(targets)
    }

    async fn fetch_listings(
        &self,
        _ctx: &AdapterContext,
        targets: &[ListingTarget],
    ) -> Vec<RawCandidate> {
        fetch_all(
            Arc::clone(&self.loader),
            targets,
            self.config.pool,
            extract_listing_page,
        )
        .await
    }
}

/// Captured pages for an offline run: the search page plus product pages keyed
/// by absolute URL. Pages missing from the bundle behave like failed fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub captured_from_url: String,
    pub base_url: String,
    pub fetched_at: DateTime<Utc>,
    pub extractor_version: String,
    pub search_page: FixturePage,
    #[serde(default)]
    pub detail_pages: BTreeMap<String, FixturePage>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FixturePage {
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub path: Option<String>,
    pub inline_text: Option<String>,
}

fn default_content_type() -> String {
    "text/html".to_string()
}

impl FixtureBundle {
    fn page_for(&self, url: &str) -> Option<&FixturePage> {
        if url == self.captured_from_url {
            Some(&self.search_page)
        } else {
            self.detail_pages.get(url)
        }
    }
}

#[async_trait]
impl PageLoader for FixtureBundle {
    async fn load_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        match self.page_for(url).and_then(|p| p.inline_text.as_deref()) {
            Some(text) => Ok(FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                body: text.as_bytes().to_vec(),
            }),
            None => Err(FetchError::NotCaptured {
                url: url.to_string(),
            }),
        }
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let mut bundle: FixtureBundle = read_json_file(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    hydrate_inline_text(base_dir, &mut bundle.search_page)?;
    for page in bundle.detail_pages.values_mut() {
        hydrate_inline_text(base_dir, page)?;
    }
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_inline_text(base_dir: &Path, page: &mut FixturePage) -> Result<()> {
    if page.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &page.path else {
        return Ok(());
    };
    let raw_path = base_dir.join(rel_path);
    if !raw_path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(&raw_path)
        .with_context(|| format!("reading fixture page {}", raw_path.display()))?;
    page.inline_text = Some(raw);
    Ok(())
}

/// Build the search-result source that replays a fixture bundle.
pub fn fixture_source(bundle: FixtureBundle, pool: FetchPoolConfig) -> SearchResultSource {
    let config = SearchSourceConfig {
        source_id: bundle.source_id.clone(),
        search_url: bundle.captured_from_url.clone(),
        base_url: bundle.base_url.clone(),
        pool,
    };
    SearchResultSource::new(config, Arc::new(bundle))
}
