//! Run-once tracker pipeline: reconcile today's capture, filter deals, persist, notify.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use dealwatch_adapters::{
    fixture_source, load_fixture_bundle, AdapterContext, AdapterError, FetchPoolConfig,
    RecordSource, SearchResultSource, SearchSourceConfig,
};
use dealwatch_core::{normalize_all, ChangeKind, ChangeSetEntry, DealAlert, Observation};
use dealwatch_notify::{AlertCopy, MailConfig, Notifier, NotifyOutcome, SmtpNotifier};
use dealwatch_storage::{merge, slice, HistoricalStore, HttpClientConfig, HttpFetcher, StoreError};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealwatch-sync";

pub const DEFAULT_SEARCH_URL: &str = "https://www.amazon.ca/s?k=shoes+for+women+sneakers";
pub const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 ",
    "(KHTML, like Gecko) Chrome/116.0.0.0 Safari/537.36"
);

pub fn default_threshold() -> Decimal {
    Decimal::new(5000, 2)
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub source_id: String,
    pub retailer: String,
    pub search_url: String,
    pub base_url: String,
    pub store_path: PathBuf,
    pub threshold: Decimal,
    pub concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    pub accept_language: String,
    pub fixture_path: Option<PathBuf>,
    pub mail: Option<MailConfig>,
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mail = match (
            var("EMAIL_SENDER"),
            var("EMAIL_PASSWORD"),
            var("EMAIL_RECEIVER"),
        ) {
            (Some(sender), Some(password), Some(recipient)) => Some(MailConfig {
                sender,
                password,
                recipient,
                smtp_host: var("DEALWATCH_SMTP_HOST")
                    .unwrap_or_else(|| "smtp.gmail.com".to_string()),
            }),
            _ => None,
        };

        Self {
            source_id: var("DEALWATCH_SOURCE_ID").unwrap_or_else(|| "amazon-ca".to_string()),
            retailer: var("DEALWATCH_RETAILER").unwrap_or_else(|| "Amazon".to_string()),
            search_url: var("DEALWATCH_SEARCH_URL")
                .unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
            base_url: var("DEALWATCH_BASE_URL")
                .unwrap_or_else(|| "https://www.amazon.ca".to_string()),
            store_path: var("DEALWATCH_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("amazon_data.csv")),
            threshold: var("DEALWATCH_THRESHOLD")
                .and_then(|v| Decimal::from_str(v.trim()).ok())
                .filter(|t| !t.is_sign_negative())
                .unwrap_or_else(default_threshold),
            concurrency: var("DEALWATCH_CONCURRENCY")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(4),
            fetch_timeout_secs: var("DEALWATCH_FETCH_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            user_agent: var("DEALWATCH_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            accept_language: var("DEALWATCH_ACCEPT_LANGUAGE")
                .unwrap_or_else(|| "en-CA,en;q=0.9".to_string()),
            fixture_path: var("DEALWATCH_FIXTURE").map(PathBuf::from),
            mail,
        }
    }

    pub fn pool(&self) -> FetchPoolConfig {
        FetchPoolConfig {
            concurrency: self.concurrency,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }
}

/// Left-join `today` against `previous` by title.
///
/// Prices compare with absent ≠ present; when `previous` repeats a title the
/// first occurrence is used.
pub fn reconcile(today: &[Observation], previous: &[Observation]) -> Vec<ChangeSetEntry> {
    let mut by_title: HashMap<&str, &Observation> = HashMap::with_capacity(previous.len());
    for observation in previous {
        by_title.entry(observation.title.as_str()).or_insert(observation);
    }

    today
        .iter()
        .map(|observation| {
            let prior = by_title.get(observation.title.as_str()).copied();
            let kind = match prior {
                None => ChangeKind::New,
                Some(prior) if prior.price != observation.price => ChangeKind::PriceChanged,
                Some(_) => ChangeKind::Unchanged,
            };
            ChangeSetEntry {
                observation: observation.clone(),
                previous: prior.cloned(),
                kind,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSetCounts {
    pub new: usize,
    pub price_changed: usize,
    pub unchanged: usize,
}

impl ChangeSetCounts {
    pub fn tally(change_set: &[ChangeSetEntry]) -> Self {
        change_set.iter().fold(Self::default(), |mut counts, entry| {
            match entry.kind {
                ChangeKind::New => counts.new += 1,
                ChangeKind::PriceChanged => counts.price_changed += 1,
                ChangeKind::Unchanged => counts.unchanged += 1,
            }
            counts
        })
    }
}

/// Keeps new or price-changed entries priced strictly below the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DealFilter {
    threshold: Decimal,
}

impl Default for DealFilter {
    fn default() -> Self {
        Self::new(default_threshold())
    }
}

impl DealFilter {
    pub fn new(threshold: Decimal) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    pub fn filter(&self, change_set: &[ChangeSetEntry]) -> Vec<DealAlert> {
        change_set
            .iter()
            .filter(|entry| entry.kind.is_change())
            .filter_map(|entry| {
                let price = entry.observation.price?;
                (price < self.threshold).then(|| DealAlert {
                    entry: entry.clone(),
                    price,
                })
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Discovery(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotificationStatus {
    NothingToSend,
    NotConfigured,
    Sent { rows: usize },
    Failed { error: String },
}

impl NotificationStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, NotificationStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub source_id: String,
    pub discovered_listings: usize,
    pub dropped_candidates: usize,
    pub observations: usize,
    pub store_bootstrapped: bool,
    pub counts: ChangeSetCounts,
    pub alerts: Vec<DealAlert>,
    pub stored_rows: usize,
    pub notification: NotificationStatus,
}

impl RunSummary {
    /// Process exit status: 2 when the store was saved but delivery failed.
    pub fn exit_code(&self) -> u8 {
        if self.notification.is_failure() {
            2
        } else {
            0
        }
    }
}

pub struct TrackerPipeline {
    store: HistoricalStore,
    source: Box<dyn RecordSource>,
    filter: DealFilter,
    notifier: Option<Box<dyn Notifier>>,
}

impl TrackerPipeline {
    pub fn new(store: HistoricalStore, source: Box<dyn RecordSource>, filter: DealFilter) -> Self {
        Self {
            store,
            source,
            filter,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &HistoricalStore {
        &self.store
    }

    /// One capture for `run_date`. Discovery and store failures abort before
    /// the store is written; notification failures are reported in the summary
    /// after the save.
    pub async fn run_once(&self, run_date: NaiveDate) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let source_id = self.source.source_id();
        let span = info_span!("dealwatch_run", %run_id, %run_date, source_id);
        self.run_inner(run_id, run_date).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, run_date: NaiveDate) -> Result<RunSummary, RunError> {
        let ctx = AdapterContext {
            run_id,
            observed_date: run_date,
        };

        let targets = self.source.discover_listings(&ctx).await?;

        let snapshot = self.store.load().await?;
        let store_bootstrapped = snapshot.is_absent();
        if store_bootstrapped {
            info!(path = %self.store.path().display(), "no store yet; starting a new history");
        }
        let existing = snapshot.into_observations();

        let raws = self.source.fetch_listings(&ctx, &targets).await;
        let normalized = normalize_all(&raws, run_date);
        if normalized.dropped > 0 {
            warn!(dropped = normalized.dropped, "discarded candidates without a title");
        }
        let today = merge(Vec::new(), normalized.observations);

        let previous = run_date
            .pred_opt()
            .map(|day| slice(&existing, day))
            .unwrap_or_default();
        let change_set = reconcile(&today, &previous);
        let counts = ChangeSetCounts::tally(&change_set);
        let alerts = self.filter.filter(&change_set);

        let observations = today.len();
        let merged = merge(existing, today);
        self.store.save(&merged).await?;
        info!(
            rows = merged.len(),
            new = counts.new,
            price_changed = counts.price_changed,
            unchanged = counts.unchanged,
            alerts = alerts.len(),
            "store updated"
        );

        let notification = self.deliver(&alerts).await;

        Ok(RunSummary {
            run_id,
            run_date,
            source_id: self.source.source_id().to_string(),
            discovered_listings: targets.len(),
            dropped_candidates: normalized.dropped,
            observations,
            store_bootstrapped,
            counts,
            alerts,
            stored_rows: merged.len(),
            notification,
        })
    }

    async fn deliver(&self, alerts: &[DealAlert]) -> NotificationStatus {
        if alerts.is_empty() {
            info!("no qualifying deals; notification skipped");
            return NotificationStatus::NothingToSend;
        }
        let Some(notifier) = &self.notifier else {
            warn!(alerts = alerts.len(), "mail settings incomplete; notification suppressed");
            return NotificationStatus::NotConfigured;
        };
        match notifier.notify(alerts).await {
            Ok(NotifyOutcome::Sent { rows }) => NotificationStatus::Sent { rows },
            Ok(NotifyOutcome::Skipped) => NotificationStatus::NothingToSend,
            Err(err) => {
                warn!(error = %err, "deal alert delivery failed; store already saved");
                NotificationStatus::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

/// Wire the pipeline from configuration: fixture replay when
/// `fixture_path` is set, live HTTP otherwise; SMTP only with full mail settings.
/// Mail settings are not validated here; bad addresses fail delivery after the
/// store is saved.
pub fn build_pipeline(config: &TrackerConfig) -> Result<TrackerPipeline> {
    let source: Box<dyn RecordSource> = match &config.fixture_path {
        Some(path) => {
            let bundle = load_fixture_bundle(path)
                .with_context(|| format!("loading fixture bundle {}", path.display()))?;
            Box::new(fixture_source(bundle, config.pool()))
        }
        None => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.fetch_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                accept_language: Some(config.accept_language.clone()),
                referer: Some(format!("{}/", config.base_url.trim_end_matches('/'))),
            })?;
            Box::new(SearchResultSource::new(
                SearchSourceConfig {
                    source_id: config.source_id.clone(),
                    search_url: config.search_url.clone(),
                    base_url: config.base_url.clone(),
                    pool: config.pool(),
                },
                Arc::new(http),
            ))
        }
    };

    let mut pipeline = TrackerPipeline::new(
        HistoricalStore::new(config.store_path.clone()),
        source,
        DealFilter::new(config.threshold),
    );
    if let Some(mail) = &config.mail {
        let copy = AlertCopy::for_threshold(&config.retailer, config.threshold);
        pipeline = pipeline.with_notifier(Box::new(SmtpNotifier::new(mail.clone(), copy)));
    }
    Ok(pipeline)
}
