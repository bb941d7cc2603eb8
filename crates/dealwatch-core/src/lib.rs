//! Core listing model, change-set types and the candidate normalizer.

use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dealwatch-core";

/// Availability recorded when a listing page does not state one.
pub const DEFAULT_AVAILABILITY: &str = "Not Available";

/// Raw field values as produced by a record source, before any cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawCandidate {
    pub listing_url: Option<String>,
    pub title: Option<String>,
    pub price_whole: Option<String>,
    pub price_fraction: Option<String>,
    pub price_text: Option<String>,
    pub rating: Option<String>,
    pub review_count: Option<String>,
    pub availability: Option<String>,
}

impl RawCandidate {
    /// Candidate for a listing whose page could not be read; only the title survives.
    pub fn title_only(listing_url: Option<String>, title: Option<String>) -> Self {
        Self {
            listing_url,
            title,
            ..Self::default()
        }
    }
}

/// One listing's normalized state on one calendar day. `title` is the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub title: String,
    pub price: Option<Decimal>,
    pub rating: Option<String>,
    pub review_count: Option<String>,
    pub availability: String,
    pub observed_date: NaiveDate,
}

impl Observation {
    /// Store key: at most one observation per `(title, observed_date)`.
    pub fn key(&self) -> (&str, NaiveDate) {
        (self.title.as_str(), self.observed_date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    PriceChanged,
    Unchanged,
}

impl ChangeKind {
    pub fn is_change(self) -> bool {
        matches!(self, ChangeKind::New | ChangeKind::PriceChanged)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::PriceChanged => "price_changed",
            ChangeKind::Unchanged => "unchanged",
        }
    }
}

/// Today's observation joined with the same title from the prior capture day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetEntry {
    pub observation: Observation,
    pub previous: Option<Observation>,
    pub kind: ChangeKind,
}

/// A change-set entry that qualified for notification. `price` is the
/// observation's price lifted out of its `Option`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealAlert {
    pub entry: ChangeSetEntry,
    pub price: Decimal,
}

impl DealAlert {
    pub fn observation(&self) -> &Observation {
        &self.entry.observation
    }

    pub fn previous_price(&self) -> Option<Decimal> {
        self.entry.previous.as_ref().and_then(|p| p.price)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizeOutcome {
    pub observations: Vec<Observation>,
    pub dropped: usize,
}

/// Convert one raw candidate into an observation for `observed_date`.
///
/// Returns `None` when the candidate has no usable title. Every other field
/// degrades to absent (or the availability default) instead of failing.
pub fn normalize(raw: &RawCandidate, observed_date: NaiveDate) -> Option<Observation> {
    let title = raw.title.as_deref().and_then(text_or_none)?;

    Some(Observation {
        title,
        price: parse_price(raw),
        rating: raw.rating.as_deref().and_then(text_or_none),
        review_count: raw.review_count.as_deref().and_then(text_or_none),
        availability: raw
            .availability
            .as_deref()
            .and_then(text_or_none)
            .unwrap_or_else(|| DEFAULT_AVAILABILITY.to_string()),
        observed_date,
    })
}

pub fn normalize_all(raws: &[RawCandidate], observed_date: NaiveDate) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();
    for raw in raws {
        match normalize(raw, observed_date) {
            Some(observation) => outcome.observations.push(observation),
            None => outcome.dropped += 1,
        }
    }
    outcome
}

/// Price strategies in priority order: split whole/fraction, then a
/// pre-formatted currency string.
pub fn parse_price(raw: &RawCandidate) -> Option<Decimal> {
    let split = match (raw.price_whole.as_deref(), raw.price_fraction.as_deref()) {
        (Some(whole), Some(fraction)) => parse_whole_fraction(whole, fraction),
        _ => None,
    };
    split.or_else(|| raw.price_text.as_deref().and_then(parse_price_text))
}

/// `"12,999"` + `"99"` → `12999.99`. Both parts must be plain digits once
/// grouping separators (and a trailing decimal point on the whole part) are gone.
pub fn parse_whole_fraction(whole: &str, fraction: &str) -> Option<Decimal> {
    let whole = strip_grouping(whole);
    let whole = whole.trim_end_matches('.');
    let fraction = fraction.trim();
    if !is_digits(whole) || !is_digits(fraction) {
        return None;
    }
    Decimal::from_str(&format!("{whole}.{fraction}")).ok()
}

/// `"$1,299.00"`, `"CDN$ 45.50"` → decimal. Signs and stray characters reject.
pub fn parse_price_text(text: &str) -> Option<Decimal> {
    let compact = strip_grouping(text);
    if compact.contains('-') {
        return None;
    }
    let numeric = compact
        .trim_start_matches(|c: char| !c.is_ascii_digit() && c != '.')
        .trim_end_matches(|c: char| c.is_alphabetic());
    if !is_decimal_literal(numeric) {
        return None;
    }
    Decimal::from_str(numeric).ok()
}

fn strip_grouping(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect()
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

fn is_decimal_literal(value: &str) -> bool {
    match value.split_once('.') {
        Some((whole, fraction)) => is_digits(whole) && is_digits(fraction),
        None => is_digits(value),
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
