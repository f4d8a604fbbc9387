use std::io;

use thiserror::Error;

/// Failures raised while decoding, reading or reducing one experiment directory.
///
/// Every variant is directory-scoped: the pipeline logs it against the offending
/// directory and moves on to the next one.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("malformed identifier segment '{segment}': expected key=value")]
    MalformedIdentifier { segment: String },
    #[error("unknown parameter key '{key}'")]
    UnknownKey { key: String },
    #[error("missing parameter {name}")]
    MissingParameter { name: String },
    #[error("invalid value '{value}' for parameter {name}")]
    InvalidParameterValue { name: String, value: String },
    #[error("sample row {row} lacks column '{column}'")]
    MissingColumn { column: String, row: usize },
    #[error("summary record lacks field '{field}'")]
    MissingField { field: String },
    #[error("invalid value '{value}' in column '{column}'")]
    InvalidValue { column: String, value: String },
    #[error("no samples found for any participant")]
    NoSamples,
    #[error("inconsistent field registry: {0}")]
    InconsistentRegistry(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StatsResult<T> = Result<T, StatsError>;
