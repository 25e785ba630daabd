//! Typed sensor sample and the fixed feature set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four environmental features, in the order the forecasting model was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    AirPressure,
    Temperature,
    Humidity,
    WindSpeed,
}

/// Column order of the model input/output tensors. Deployment contract, not checked at runtime.
pub const MODEL_FEATURE_ORDER: [Feature; 4] = [
    Feature::AirPressure,
    Feature::Temperature,
    Feature::Humidity,
    Feature::WindSpeed,
];

impl Feature {
    /// Canonical payload key.
    pub fn key(&self) -> &'static str {
        match self {
            Feature::AirPressure => "air_pressure",
            Feature::Temperature => "temperature",
            Feature::Humidity => "humidity",
            Feature::WindSpeed => "wind_speed",
        }
    }

    /// Unit-suffixed label used by the training set and some sensor producers.
    pub fn external_label(&self) -> &'static str {
        match self {
            Feature::AirPressure => "p (mbar)",
            Feature::Temperature => "T (degC)",
            Feature::Humidity => "rh (%)",
            Feature::WindSpeed => "wv (m/s)",
        }
    }
}

/// One accepted sensor sample. Immutable once built by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub air_pressure: f64,
    pub wind_speed: f64,
}

impl Reading {
    pub fn value(&self, feature: Feature) -> f64 {
        match feature {
            Feature::AirPressure => self.air_pressure,
            Feature::Temperature => self.temperature,
            Feature::Humidity => self.humidity,
            Feature::WindSpeed => self.wind_speed,
        }
    }

    /// Projection onto `MODEL_FEATURE_ORDER`.
    pub fn model_row(&self) -> [f64; 4] {
        MODEL_FEATURE_ORDER.map(|f| self.value(f))
    }
}
