//! Fixed per-feature normalization statistics.
//!
//! Must be the exact mean/std the model was trained with; a mismatch silently degrades
//! accuracy and cannot be detected here. A zero std is caught before any division.

use serde::{Deserialize, Serialize};

use crate::errors::ForecastError;
use crate::ingest::reading::{Feature, MODEL_FEATURE_ORDER};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: f64,
    pub std: f64,
}

impl FeatureStats {
    pub const fn new(mean: f64, std: f64) -> Self {
        Self { mean, std }
    }

    pub fn normalize(&self, raw: f64) -> f64 {
        (raw - self.mean) / self.std
    }

    pub fn denormalize(&self, normalized: f64) -> f64 {
        normalized * self.std + self.mean
    }

    fn is_degenerate(&self) -> bool {
        self.std == 0.0 || !self.std.is_finite() || !self.mean.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStatistics {
    pub air_pressure: FeatureStats,
    pub temperature: FeatureStats,
    pub humidity: FeatureStats,
    pub wind_speed: FeatureStats,
}

impl Default for NormalizationStatistics {
    /// Training-set statistics of the reference model.
    fn default() -> Self {
        Self {
            air_pressure: FeatureStats::new(988.656301, 8.296812),
            temperature: FeatureStats::new(9.107596, 8.654242),
            humidity: FeatureStats::new(75.904082, 16.557117),
            wind_speed: FeatureStats::new(2.15457, 1.530114),
        }
    }
}

impl NormalizationStatistics {
    pub fn for_feature(&self, feature: Feature) -> &FeatureStats {
        match feature {
            Feature::AirPressure => &self.air_pressure,
            Feature::Temperature => &self.temperature,
            Feature::Humidity => &self.humidity,
            Feature::WindSpeed => &self.wind_speed,
        }
    }

    /// Fails on the first feature (in model order) whose std cannot be divided by.
    pub fn check(&self) -> Result<(), ForecastError> {
        match MODEL_FEATURE_ORDER
            .iter()
            .find(|f| self.for_feature(**f).is_degenerate())
        {
            Some(feature) => Err(ForecastError::DegenerateStatistics {
                feature: feature.key(),
            }),
            None => Ok(()),
        }
    }

    /// Normalizes a row laid out in `MODEL_FEATURE_ORDER`.
    pub fn normalize_row(&self, row: [f64; 4]) -> [f64; 4] {
        let mut out = [0.0; 4];
        for (i, feature) in MODEL_FEATURE_ORDER.iter().enumerate() {
            out[i] = self.for_feature(*feature).normalize(row[i]);
        }
        out
    }

    pub fn denormalize_row(&self, row: [f64; 4]) -> [f64; 4] {
        let mut out = [0.0; 4];
        for (i, feature) in MODEL_FEATURE_ORDER.iter().enumerate() {
            out[i] = self.for_feature(*feature).denormalize(row[i]);
        }
        out
    }
}
