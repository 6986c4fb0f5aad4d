use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Wikipedia,
    Flickr,
    Youtube,
    Inaturalist,
    Gbif,
    Facebook,
    Instagram,
    Reddit,
}

impl Source {
    pub const ALL: [Source; 8] = [
        Source::Wikipedia,
        Source::Flickr,
        Source::Youtube,
        Source::Inaturalist,
        Source::Gbif,
        Source::Facebook,
        Source::Instagram,
        Source::Reddit,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Source::Wikipedia => "wikipedia",
            Source::Flickr => "flickr",
            Source::Youtube => "youtube",
            Source::Inaturalist => "inaturalist",
            Source::Gbif => "gbif",
            Source::Facebook => "facebook",
            Source::Instagram => "instagram",
            Source::Reddit => "reddit",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Source::ALL
            .into_iter()
            .find(|source| source.tag().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown source '{value}'"))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LocaleKind {
    Country,
    Language,
}

impl fmt::Display for LocaleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocaleKind::Country => f.write_str("country"),
            LocaleKind::Language => f.write_str("language"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocaleEncoding {
    CountryName,
    Iso2,
    Language,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub entity: String,
    pub locale: String,
}

impl PairKey {
    pub fn new(entity: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            locale: locale.into(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.entity, self.locale)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub entity: String,
    pub locale: String,
    pub date: NaiveDate,
    pub count: f64,
    pub source: Source,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
    pub entity: String,
    pub locale: String,
    pub date: NaiveDate,
    pub count: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyAggregate {
    pub source: Source,
    pub entity: String,
    pub locale: String,
    pub month: NaiveDate,
    pub total_count: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntroductionRecord {
    pub entity: String,
    pub country: String,
    pub introduction_year: Option<i32>,
    pub group: String,
    pub habitat: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntroducedMonthlyAggregate {
    pub source: Source,
    pub entity: String,
    pub locale: String,
    pub month: NaiveDate,
    pub total_count: f64,
    pub introduction_year: Option<i32>,
    pub group: String,
    pub habitat: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FittedPoint {
    pub date: NaiveDate,
    pub fit: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertState {
    Normal,
    Alert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientHistory { observed: usize, required: usize },
    FitFailure { message: String },
    NoEvaluationData,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InsufficientHistory { observed, required } => write!(
                f,
                "insufficient history ({observed} non-zero observations, need {required})"
            ),
            SkipReason::FitFailure { message } => write!(f, "fit failure: {message}"),
            SkipReason::NoEvaluationData => f.write_str("no evaluation-year data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Modeled {
        terminal_alert: bool,
        alert_days: usize,
        last_date: NaiveDate,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairOutcome {
    pub key: PairKey,
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEntry {
    pub entity: String,
    pub locale: String,
    pub terminal_alert: bool,
}
