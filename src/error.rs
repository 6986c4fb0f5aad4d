use std::path::PathBuf;

use thiserror::Error;

use crate::models::Source;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("schema mismatch in {platform} extract {path}: {reason}")]
    SchemaMismatch {
        platform: Source,
        path: PathBuf,
        reason: String,
    },

    #[error("invalid count {value:?} in {platform} extract at line {line}")]
    InvalidCount {
        platform: Source,
        line: u64,
        value: String,
    },

    #[error("failed to read {path}: {err}")]
    Csv {
        path: PathBuf,
        #[source]
        err: csv::Error,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("insufficient data: need at least {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("fit failure: {0}")]
    FitFailure(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

pub type ModelResult<T> = std::result::Result<T, ModelError>;
