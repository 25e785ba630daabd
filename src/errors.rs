//! Error taxonomy for the ingestion → forecast → publication path.
//!
//! - `InvalidReading`: one payload rejected; absorbed by the coordinator.
//! - `ForecastError`: one forecast cycle lost (`InferenceFailed`) or forecasting halted
//!   for good (`DegenerateStatistics`).
//! - `SinkError`: one sink write lost; the other sinks are unaffected.
//! - `ConfigError`: the process refuses to start.

use thiserror::Error;

/// Malformed or incomplete inbound payload. Never reaches the window buffer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidReading {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not numeric")]
    NotNumeric { field: &'static str },
    #[error("field `{field}` is not a finite number")]
    NonFinite { field: &'static str },
    #[error("wind_speed must be non-negative, got {0}")]
    NegativeWindSpeed(f64),
}

/// Failure of the forecasting model itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },
    #[error("model runtime failure: {0}")]
    Runtime(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForecastError {
    #[error("forecast needs exactly {expected} readings, window holds {actual}")]
    WindowSize { expected: usize, actual: usize },
    /// Zero (or non-finite) standard deviation in the configured statistics.
    /// Recurs on every cycle, so the coordinator stops forecasting when it sees it.
    #[error("degenerate normalization statistics for `{feature}`")]
    DegenerateStatistics { feature: &'static str },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

impl From<ModelError> for ForecastError {
    fn from(err: ModelError) -> Self {
        ForecastError::InferenceFailed(err.to_string())
    }
}

impl ForecastError {
    /// Configuration-class errors recur on every cycle and must halt forecasting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ForecastError::DegenerateStatistics { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("serialization failed: {0}")]
    Serialize(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse JSON configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_errors_become_inference_failures() {
        let err: ForecastError = ModelError::Runtime("boom".into()).into();
        assert!(matches!(err, ForecastError::InferenceFailed(ref msg) if msg.contains("boom")));
        assert!(!err.is_fatal());
    }

    #[test]
    fn degenerate_statistics_is_fatal() {
        let err = ForecastError::DegenerateStatistics { feature: "humidity" };
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "degenerate normalization statistics for `humidity`");
    }
}
