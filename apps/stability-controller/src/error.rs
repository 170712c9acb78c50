use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StabilityError {
    /// A sensor read returned nothing usable; the cycle must be skipped.
    #[error("sensor data unavailable: {0}")]
    DataUnavailable(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("action executor failed: {0}")]
    Executor(String),
    #[error("non-monotonic timestamps: {next} arrived after {previous}")]
    NonMonotonic {
        previous: DateTime<Utc>,
        next: DateTime<Utc>,
    },
}

pub type StabilityResult<T> = Result<T, StabilityError>;
