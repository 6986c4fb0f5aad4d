use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate, Utc};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::baseline::BaselineConfig;
use crate::error::ConfigError;
use crate::models::{LocaleKind, Source};
use crate::sources::SourceSpec;

pub const DEFAULT_CONFIG_FILE: &str = "early-warning.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub start: NaiveDate,
    // Today when unset.
    #[serde(default)]
    pub end: Option<NaiveDate>,
    pub cutoff: NaiveDate,
    pub locale_kind: LocaleKind,
    // Empty means all sources.
    #[serde(default)]
    pub alert_sources: Vec<Source>,
    pub workers: usize,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub introductions: Option<PathBuf>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let today = Utc::now().date_naive();
        let cutoff = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
        Self {
            start: NaiveDate::from_ymd_opt(today.year() - 5, 1, 1).unwrap_or(today),
            end: None,
            cutoff,
            locale_kind: LocaleKind::Country,
            alert_sources: Vec::new(),
            workers: std::thread::available_parallelism().map_or(4, usize::from),
            output_dir: PathBuf::from("output"),
            introductions: None,
            database_url: None,
            baseline: BaselineConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: Self = Self::figment(path).extract()?;
        if config.database_url.is_none() {
            config.database_url = std::env::var("DATABASE_URL").ok();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        match path {
            Some(path) => figment = figment.merge(Toml::file_exact(path)),
            None => {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                if local.exists() {
                    figment = figment.merge(Toml::file(local));
                }
            }
        }

        // EARLY_WARNING_BASELINE__BASIS_SIZE sets baseline.basis_size
        figment.merge(Env::prefixed("EARLY_WARNING_").split("__"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let end = self.end_date();
        if self.start > end {
            return Err(invalid("start", format!("{} is after end {end}", self.start)));
        }
        if self.cutoff <= self.start {
            return Err(invalid(
                "cutoff",
                format!("{} leaves no history after start {}", self.cutoff, self.start),
            ));
        }
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1".to_string()));
        }
        if self.baseline.basis_size < 4 {
            return Err(invalid("baseline.basis_size", "must be at least 4".to_string()));
        }
        if self.baseline.log10_lambdas.is_empty() {
            return Err(invalid(
                "baseline.log10_lambdas",
                "needs at least one value".to_string(),
            ));
        }
        if self.baseline.confidence_z.is_nan() || self.baseline.confidence_z <= 0.0 {
            return Err(invalid("baseline.confidence_z", "must be positive".to_string()));
        }
        Ok(())
    }

    pub fn end_date(&self) -> NaiveDate {
        self.end.unwrap_or_else(|| Utc::now().date_naive())
    }

    pub fn alert_sources(&self) -> Vec<Source> {
        if self.alert_sources.is_empty() {
            Source::ALL.to_vec()
        } else {
            self.alert_sources.clone()
        }
    }

    pub fn unified_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("unified_daily_{}.csv", self.locale_kind))
    }

    pub fn monthly_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("monthly_{}.csv", self.locale_kind))
    }

    pub fn monthly_introductions_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("monthly_introductions_{}.csv", self.locale_kind))
    }

    pub fn alert_report_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("alerts_{}.csv", self.locale_kind))
    }

    pub fn progress_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("alert_progress_{}.jsonl", self.locale_kind))
    }
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason,
    }
}
