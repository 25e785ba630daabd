//! Forecast engine: full window snapshot → 4 horizon records.
//!
//! 1. Project each reading onto `[air_pressure, temperature, humidity, wind_speed]`.
//! 2. Normalize per column with the fixed statistics (zero std fails before dividing).
//! 3. Run the model on `[1, N, 4]`, expect `[1, N, 4]` back.
//! 4. Denormalize, keep the configured timestep indices, stamp `now + k * step`.
//!
//! No partial output: any failure yields an error and zero records.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ForecastError, ModelError};
use crate::forecast::{
    model::{ForecastModel, Tensor3},
    stats::NormalizationStatistics,
};
use crate::ingest::reading::{MODEL_FEATURE_ORDER, Reading};

/// Output timesteps kept from the model, ascending. Tied to 10-minute readings.
pub const DEFAULT_HORIZON_INDICES: [usize; 4] = [5, 11, 17, 23];

/// One predicted future state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    #[serde(rename = "timestamp")]
    pub forecast_timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub air_pressure: f64,
    pub wind_speed: f64,
}

/// Wire envelope for one forecast batch: `{"predictions": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastBatch {
    pub predictions: Vec<ForecastRecord>,
}

#[derive(Clone)]
pub struct ForecastEngine {
    model: Arc<dyn ForecastModel>,
    stats: NormalizationStatistics,
    window_size: usize,
    horizon_indices: Vec<usize>,
    horizon_step: Duration,
}

impl ForecastEngine {
    pub fn new(
        model: Arc<dyn ForecastModel>,
        stats: NormalizationStatistics,
        window_size: usize,
        horizon_indices: Vec<usize>,
        horizon_step: Duration,
    ) -> Self {
        Self {
            model,
            stats,
            window_size,
            horizon_indices,
            horizon_step,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn forecast(
        &self,
        window: &[Reading],
        computed_at: DateTime<Utc>,
    ) -> Result<Vec<ForecastRecord>, ForecastError> {
        if window.len() != self.window_size {
            return Err(ForecastError::WindowSize {
                expected: self.window_size,
                actual: window.len(),
            });
        }
        self.stats.check()?;

        let input = self.build_input(window);
        let output = self.model.predict(&input)?;
        if output.shape() != input.shape() {
            return Err(ModelError::ShapeMismatch {
                expected: input.shape(),
                actual: output.shape(),
            }
            .into());
        }

        let mut records = Vec::with_capacity(self.horizon_indices.len());
        for (ordinal, &t) in self.horizon_indices.iter().enumerate() {
            if t >= output.shape()[1] {
                return Err(ForecastError::InferenceFailed(format!(
                    "horizon index {} outside model output",
                    t
                )));
            }
            let mut normalized = [0.0f64; 4];
            for (f, slot) in normalized.iter_mut().enumerate() {
                *slot = output.get(0, t, f) as f64;
            }
            let raw = self.stats.denormalize_row(normalized);
            if raw.iter().any(|v| !v.is_finite()) {
                return Err(ForecastError::InferenceFailed(format!(
                    "non-finite prediction at timestep {}",
                    t
                )));
            }
            records.push(to_record(raw, computed_at + self.horizon_step * (ordinal as i32 + 1)));
        }
        Ok(records)
    }

    fn build_input(&self, window: &[Reading]) -> Tensor3 {
        let mut input = Tensor3::zeros([1, window.len(), MODEL_FEATURE_ORDER.len()]);
        for (t, reading) in window.iter().enumerate() {
            let row = self.stats.normalize_row(reading.model_row());
            for (f, value) in row.iter().enumerate() {
                input.set(0, t, f, *value as f32);
            }
        }
        input
    }
}

/// `raw` is in `MODEL_FEATURE_ORDER`.
fn to_record(raw: [f64; 4], forecast_timestamp: DateTime<Utc>) -> ForecastRecord {
    ForecastRecord {
        forecast_timestamp,
        air_pressure: round2(raw[0]),
        temperature: round2(raw[1]),
        humidity: round2(raw[2]),
        wind_speed: round2(raw[3]),
    }
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::model::IdentityModel;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    struct BrokenModel;

    impl ForecastModel for BrokenModel {
        fn name(&self) -> &str {
            "broken"
        }
        fn predict(&self, _input: &Tensor3) -> Result<Tensor3, ModelError> {
            Err(ModelError::Runtime("interpreter crashed".into()))
        }
    }

    struct TruncatingModel;

    impl ForecastModel for TruncatingModel {
        fn name(&self) -> &str {
            "truncating"
        }
        fn predict(&self, _input: &Tensor3) -> Result<Tensor3, ModelError> {
            Ok(Tensor3::zeros([1, 12, 4]))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 18, 14, 30, 0).unwrap()
    }

    fn steady_window(n: usize) -> Vec<Reading> {
        (0..n)
            .map(|i| Reading {
                timestamp: now() - Duration::minutes(10 * (n - i) as i64),
                temperature: 20.0,
                humidity: 60.0,
                air_pressure: 1012.0,
                wind_speed: 3.0,
            })
            .collect()
    }

    fn engine(model: Arc<dyn ForecastModel>, stats: NormalizationStatistics) -> ForecastEngine {
        ForecastEngine::new(model, stats, 27, DEFAULT_HORIZON_INDICES.to_vec(), Duration::hours(1))
    }

    #[test]
    fn steady_state_survives_identity_model() {
        let e = engine(Arc::new(IdentityModel), NormalizationStatistics::default());
        let records = e.forecast(&steady_window(27), now()).unwrap();
        assert_eq!(records.len(), 4);
        for r in &records {
            assert_abs_diff_eq!(r.temperature, 20.0, epsilon = 0.01);
            assert_abs_diff_eq!(r.humidity, 60.0, epsilon = 0.01);
            assert_abs_diff_eq!(r.air_pressure, 1012.0, epsilon = 0.01);
            assert_abs_diff_eq!(r.wind_speed, 3.0, epsilon = 0.01);
        }
    }

    #[test]
    fn timestamps_step_one_hour_from_computation() {
        let e = engine(Arc::new(IdentityModel), NormalizationStatistics::default());
        let records = e.forecast(&steady_window(27), now()).unwrap();
        let stamps: Vec<_> = records.iter().map(|r| r.forecast_timestamp).collect();
        assert_eq!(
            stamps,
            (1..=4).map(|h| now() + Duration::hours(h)).collect::<Vec<_>>()
        );
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn selects_configured_timesteps() {
        // Temperature ramps with the index so each selected timestep is recognisable.
        let mut window = steady_window(27);
        for (i, r) in window.iter_mut().enumerate() {
            r.temperature = i as f64;
        }
        let e = engine(Arc::new(IdentityModel), NormalizationStatistics::default());
        let temps: Vec<f64> = e
            .forecast(&window, now())
            .unwrap()
            .iter()
            .map(|r| r.temperature)
            .collect();
        assert_eq!(temps, vec![5.0, 11.0, 17.0, 23.0]);
    }

    #[test]
    fn values_are_rounded_to_two_decimals() {
        let mut window = steady_window(27);
        window[5].humidity = 61.23456;
        let e = engine(Arc::new(IdentityModel), NormalizationStatistics::default());
        let records = e.forecast(&window, now()).unwrap();
        assert_eq!(records[0].humidity, 61.23);
    }

    #[test]
    fn zero_std_fails_without_dividing() {
        let mut stats = NormalizationStatistics::default();
        stats.wind_speed.std = 0.0;
        let e = engine(Arc::new(IdentityModel), stats);
        assert_eq!(
            e.forecast(&steady_window(27), now()),
            Err(ForecastError::DegenerateStatistics { feature: "wind_speed" })
        );
    }

    #[test]
    fn model_failure_is_inference_failed() {
        let e = engine(Arc::new(BrokenModel), NormalizationStatistics::default());
        assert!(matches!(
            e.forecast(&steady_window(27), now()),
            Err(ForecastError::InferenceFailed(_))
        ));
    }

    #[test]
    fn output_shape_mismatch_is_inference_failed() {
        let e = engine(Arc::new(TruncatingModel), NormalizationStatistics::default());
        let err = e.forecast(&steady_window(27), now()).unwrap_err();
        assert!(matches!(err, ForecastError::InferenceFailed(ref m) if m.contains("shape mismatch")));
    }

    #[test]
    fn rejects_partial_window() {
        let e = engine(Arc::new(IdentityModel), NormalizationStatistics::default());
        assert_eq!(
            e.forecast(&steady_window(10), now()),
            Err(ForecastError::WindowSize { expected: 27, actual: 10 })
        );
    }

    #[test]
    fn envelope_serializes_with_predictions_key() {
        let e = engine(Arc::new(IdentityModel), NormalizationStatistics::default());
        let batch = ForecastBatch {
            predictions: e.forecast(&steady_window(27), now()).unwrap(),
        };
        let json = serde_json::to_value(&batch).unwrap();
        let preds = json["predictions"].as_array().unwrap();
        assert_eq!(preds.len(), 4);
        assert_eq!(preds[0]["timestamp"], "2025-03-18T15:30:00Z");
        assert!(preds[0]["air_pressure"].is_number());
    }
}
