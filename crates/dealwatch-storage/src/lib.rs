//! Historical observation store + HTTP page fetch utilities for dealwatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use dealwatch_core::Observation;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, REFERER};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealwatch-storage";

/// Column order of the persisted store. Stable across versions.
pub const STORE_COLUMNS: [&str; 6] = [
    "title",
    "price",
    "rating",
    "reviews",
    "availability",
    "scraped_date",
];

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("encoding store rows: {0}")]
    Encode(#[source] csv::Error),
}

impl StoreError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

/// Result of reading the persisted store. A missing file is the bootstrap
/// case, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSnapshot {
    Absent,
    Present(Vec<Observation>),
}

impl StoreSnapshot {
    pub fn is_absent(&self) -> bool {
        matches!(self, StoreSnapshot::Absent)
    }

    pub fn into_observations(self) -> Vec<Observation> {
        match self {
            StoreSnapshot::Absent => Vec::new(),
            StoreSnapshot::Present(observations) => observations,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreRow {
    title: String,
    price: Option<String>,
    rating: Option<String>,
    reviews: Option<String>,
    availability: String,
    scraped_date: String,
}

impl StoreRow {
    fn from_observation(observation: &Observation) -> Self {
        Self {
            title: observation.title.clone(),
            price: observation.price.map(|p| p.to_string()),
            rating: observation.rating.clone(),
            reviews: observation.review_count.clone(),
            availability: observation.availability.clone(),
            scraped_date: observation.observed_date.format(DATE_FORMAT).to_string(),
        }
    }

    fn into_observation(self) -> Result<Observation, String> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err("empty title".to_string());
        }
        let price = match self.price.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(text) => match Decimal::from_str(text) {
                Ok(price) if !price.is_sign_negative() => Some(price),
                _ => return Err(format!("invalid price {text:?}")),
            },
        };
        let observed_date = NaiveDate::parse_from_str(self.scraped_date.trim(), DATE_FORMAT)
            .map_err(|e| format!("invalid scraped_date {:?}: {e}", self.scraped_date))?;
        Ok(Observation {
            title: title.to_string(),
            price,
            rating: self.rating.filter(|s| !s.is_empty()),
            review_count: self.reviews.filter(|s| !s.is_empty()),
            availability: self.availability,
            observed_date,
        })
    }
}

/// Row-oriented file holding every observation ever captured. Rewritten in
/// full on each save.
#[derive(Debug, Clone)]
pub struct HistoricalStore {
    path: PathBuf,
}

impl HistoricalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted store yet");
                return Ok(StoreSnapshot::Absent);
            }
            Err(source) => {
                return Err(StoreError::Io {
                    op: "reading store",
                    path: self.path.clone(),
                    source,
                })
            }
        };
        decode_rows(&self.path, &bytes).map(StoreSnapshot::Present)
    }

    /// Replace the persisted store with `observations` using a temp-file rename.
    pub async fn save(&self, observations: &[Observation]) -> Result<(), StoreError> {
        let bytes = encode_rows(observations)?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if let Some(parent) = &parent {
            fs::create_dir_all(parent)
                .await
                .map_err(io_error("creating store directory", parent))?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store.csv".to_string());
        let temp_name = format!(".{file_name}.{}.tmp", Uuid::new_v4());
        let temp_path = match &parent {
            Some(parent) => parent.join(temp_name),
            None => PathBuf::from(temp_name),
        };

        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .map_err(io_error("opening temp store file", &temp_path))?;
            file.write_all(&bytes)
                .await
                .map_err(io_error("writing temp store file", &temp_path))?;
            file.flush()
                .await
                .map_err(io_error("flushing temp store file", &temp_path))?;
            drop(file);
            fs::rename(&temp_path, &self.path)
                .await
                .map_err(io_error("renaming temp store file onto", &self.path))
        }
        .await;

        if write_result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        write_result
    }
}

fn io_error(op: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { op, path, source }
}

pub fn encode_rows(observations: &[Observation]) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(STORE_COLUMNS)
        .map_err(StoreError::Encode)?;
    for observation in observations {
        writer
            .serialize(StoreRow::from_observation(observation))
            .map_err(StoreError::Encode)?;
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::Encode(csv::Error::from(e.into_error())))
}

pub fn decode_rows(path: &Path, bytes: &[u8]) -> Result<Vec<Observation>, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new().from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| corrupt(format!("unreadable header: {e}")))?
        .clone();
    if !headers.iter().eq(STORE_COLUMNS) {
        return Err(corrupt(format!(
            "unexpected header {:?}, expected {:?}",
            headers.iter().collect::<Vec<_>>(),
            STORE_COLUMNS
        )));
    }

    let mut observations = Vec::new();
    for (idx, row) in reader.deserialize::<StoreRow>().enumerate() {
        let line = idx + 2;
        let row = row.map_err(|e| corrupt(format!("line {line}: {e}")))?;
        let observation = row
            .into_observation()
            .map_err(|reason| corrupt(format!("line {line}: {reason}")))?;
        observations.push(observation);
    }
    Ok(observations)
}

/// Union of `existing` and `incoming` keyed by `(title, observed_date)`.
///
/// Incoming observations replace colliding keys in place; new keys are
/// appended in incoming order. Other days are never dropped.
pub fn merge(existing: Vec<Observation>, incoming: Vec<Observation>) -> Vec<Observation> {
    let mut merged: Vec<Observation> = Vec::with_capacity(existing.len() + incoming.len());
    let mut index: HashMap<(String, NaiveDate), usize> = HashMap::new();

    for observation in existing.into_iter().chain(incoming) {
        let key = (observation.title.clone(), observation.observed_date);
        match index.get(&key) {
            Some(&slot) => merged[slot] = observation,
            None => {
                index.insert(key, merged.len());
                merged.push(observation);
            }
        }
    }
    merged
}

pub fn slice(store: &[Observation], date: NaiveDate) -> Vec<Observation> {
    store
        .iter()
        .filter(|o| o.observed_date == date)
        .cloned()
        .collect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub referer: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            accept_language: None,
            referer: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch of {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },
    #[error("no captured page for {url}")]
    NotCaptured { url: String },
}

/// Anything that can hand back the body of a page by URL: the live HTTP
/// fetcher or a captured fixture bundle.
#[async_trait]
pub trait PageLoader: Send + Sync {
    async fn load_page(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(lang) = &config.accept_language {
            headers.insert(
                ACCEPT_LANGUAGE,
                HeaderValue::from_str(lang).context("invalid Accept-Language header")?,
            );
        }
        if let Some(referer) = &config.referer {
            headers.insert(
                REFERER,
                HeaderValue::from_str(referer).context("invalid Referer header")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status: status.as_u16(),
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl PageLoader for HttpFetcher {
    async fn load_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    fn obs(title: &str, price: Option<&str>, d: u32) -> Observation {
        Observation {
            title: title.to_string(),
            price: price.map(|p| Decimal::from_str(p).unwrap()),
            rating: None,
            review_count: None,
            availability: "In Stock".to_string(),
            observed_date: date(d),
        }
    }

    #[tokio::test]
    async fn missing_file_loads_as_absent() {
        let dir = tempdir().expect("tempdir");
        let store = HistoricalStore::new(dir.path().join("nope.csv"));
        let snapshot = store.load().await.expect("load");
        assert!(snapshot.is_absent());
        assert!(snapshot.into_observations().is_empty());
    }

    #[tokio::test]
    async fn save_then_load_keeps_optional_fields_distinct() {
        let dir = tempdir().expect("tempdir");
        let store = HistoricalStore::new(dir.path().join("nested").join("store.csv"));
        let mut rated = obs("Sneaker, \"Classic\"", Some("45.00"), 18);
        rated.rating = Some("4.5 out of 5 stars".into());
        rated.review_count = Some("1,024 ratings".into());
        let observations = vec![rated, obs("Unpriced", None, 18), obs("Free", Some("0"), 19)];

        store.save(&observations).await.expect("save");
        let loaded = store.load().await.expect("load").into_observations();
        assert_eq!(loaded, observations);
        assert_eq!(loaded[1].price, None);
        assert_eq!(loaded[2].price, Some(Decimal::ZERO));

        let leftovers = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn empty_collection_still_writes_header() {
        let dir = tempdir().expect("tempdir");
        let store = HistoricalStore::new(dir.path().join("store.csv"));
        store.save(&[]).await.expect("save");
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(text.trim_end(), "title,price,rating,reviews,availability,scraped_date");
        assert_eq!(store.load().await.unwrap(), StoreSnapshot::Present(vec![]));
    }

    #[tokio::test]
    async fn unparseable_store_is_corrupt_not_absent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.csv");

        std::fs::write(&path, "name,cost\nfoo,1\n").unwrap();
        let err = HistoricalStore::new(&path).load().await.unwrap_err();
        assert!(err.is_corrupt(), "{err}");

        std::fs::write(
            &path,
            "title,price,rating,reviews,availability,scraped_date\nA,abc,,,In Stock,2026-10-18\n",
        )
        .unwrap();
        let err = HistoricalStore::new(&path).load().await.unwrap_err();
        assert!(err.is_corrupt(), "{err}");
        assert!(err.to_string().contains("line 2"));

        std::fs::write(
            &path,
            "title,price,rating,reviews,availability,scraped_date\nA,1.00,,,In Stock,yesterday\n",
        )
        .unwrap();
        assert!(HistoricalStore::new(&path).load().await.unwrap_err().is_corrupt());

        std::fs::write(&path, "").unwrap();
        assert!(HistoricalStore::new(&path).load().await.unwrap_err().is_corrupt());
    }

    #[test]
    fn merge_replaces_same_key_and_keeps_other_days() {
        let existing = vec![
            obs("A", Some("45"), 18),
            obs("B", Some("60"), 18),
            obs("A", Some("44"), 19),
        ];
        let incoming = vec![obs("A", Some("35"), 19), obs("C", Some("30"), 19)];

        let merged = merge(existing, incoming);
        assert_eq!(
            merged,
            vec![
                obs("A", Some("45"), 18),
                obs("B", Some("60"), 18),
                obs("A", Some("35"), 19),
                obs("C", Some("30"), 19),
            ]
        );
    }

    #[test]
    fn merge_is_idempotent_and_safe_on_empty_existing() {
        let incoming = vec![obs("A", Some("35"), 19), obs("C", None, 19)];
        let once = merge(Vec::new(), incoming.clone());
        assert_eq!(once, incoming);
        let twice = merge(once.clone(), incoming);
        assert_eq!(twice, once);
    }

    #[test]
    fn slice_selects_a_single_day() {
        let store = vec![obs("A", Some("45"), 18), obs("A", Some("35"), 19), obs("B", None, 18)];
        let day18 = slice(&store, date(18));
        assert_eq!(day18, vec![obs("A", Some("45"), 18), obs("B", None, 18)]);
        assert!(slice(&store, date(17)).is_empty());
    }

    #[test]
    fn fetcher_rejects_invalid_header_values() {
        let err = HttpFetcher::new(HttpClientConfig {
            accept_language: Some("en\nbad".to_string()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("Accept-Language"));

        HttpFetcher::new(HttpClientConfig {
            user_agent: Some("dealwatch-test/0.1".to_string()),
            accept_language: Some("en-CA,en;q=0.9".to_string()),
            referer: Some("https://www.amazon.ca/".to_string()),
            ..Default::default()
        })
        .expect("valid config builds");
    }
}
