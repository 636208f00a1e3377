//! Error taxonomy for catalog loading and the search pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The `algorithm` option named an unknown search strategy.
    #[error("unsupported algorithm: {0:?}")]
    UnsupportedAlgorithm(String),

    /// A search option is outside its permitted range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The dosage solver failed to converge within its sweep budget.
    /// Recovered inside the evaluator; a query never aborts because of it.
    #[error("dosage solver did not converge")]
    OptimizerNonConvergent,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed YAML catalog: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("malformed CSV catalog: {0}")]
    Csv(#[from] csv::Error),

    /// A catalog row or NAME:AMOUNT field that cannot be parsed.
    #[error("malformed catalog entry: {0}")]
    Entry(String),

    /// A catalog file whose extension names no known format.
    #[error("unsupported catalog format: {0:?}")]
    UnknownFormat(String),
}

pub type Result<T> = std::result::Result<T, Error>;
