//! Publication router: decides WHAT gets written where, as a list of effects.
//!
//! - Reading  → latest (`sensor_data`, full overwrite) → history append → `sensor_update`.
//! - Forecast → `forecast_update` → latest (`forecast_data`) → republish on the forecast topic.
//!
//! Nothing is executed here; the sink worker applies the effects best-effort.

use serde_json::Value;

use crate::forecast::engine::{ForecastBatch, ForecastRecord};
use crate::ingest::reading::Reading;
use crate::publish::sinks::LiveEvent;

/// Latest-state key for the most recent accepted reading.
pub const LATEST_READING_KEY: &str = "sensor_data";
/// Latest-state key for the most recent forecast envelope.
pub const LATEST_FORECAST_KEY: &str = "forecast_data";

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SetLatest { key: &'static str, value: Value },
    AppendHistory(Reading),
    Broadcast(LiveEvent),
    Publish { topic: String, payload: Vec<u8> },
}

impl Effect {
    /// Sink name used in logs and failure counters.
    pub fn sink(&self) -> &'static str {
        match self {
            Effect::SetLatest { .. } => "latest",
            Effect::AppendHistory(_) => "history",
            Effect::Broadcast(_) => "live",
            Effect::Publish { .. } => "transport",
        }
    }
}

pub type Effects = Vec<Effect>;

#[derive(Debug, Clone)]
pub struct PublicationRouter {
    forecast_topic: String,
}

impl PublicationRouter {
    pub fn new(forecast_topic: impl Into<String>) -> Self {
        Self {
            forecast_topic: forecast_topic.into(),
        }
    }

    pub fn forecast_topic(&self) -> &str {
        &self.forecast_topic
    }

    pub fn on_reading(&self, reading: &Reading) -> Effects {
        let mut effects = Vec::with_capacity(3);
        match serde_json::to_value(reading) {
            Ok(value) => effects.push(Effect::SetLatest {
                key: LATEST_READING_KEY,
                value,
            }),
            Err(e) => log::error!("latest reading not serializable, skipping latest write: {}", e),
        }
        effects.push(Effect::AppendHistory(reading.clone()));
        effects.push(Effect::Broadcast(LiveEvent::SensorUpdate(reading.clone())));
        effects
    }

    pub fn on_forecast(&self, predictions: Vec<ForecastRecord>) -> Effects {
        let batch = ForecastBatch { predictions };
        let mut effects = Vec::with_capacity(3);
        effects.push(Effect::Broadcast(LiveEvent::ForecastUpdate(batch.clone())));
        match serde_json::to_value(&batch) {
            Ok(value) => {
                let payload = value.to_string().into_bytes();
                effects.push(Effect::SetLatest {
                    key: LATEST_FORECAST_KEY,
                    value,
                });
                effects.push(Effect::Publish {
                    topic: self.forecast_topic.clone(),
                    payload,
                });
            }
            Err(e) => log::error!("forecast envelope not serializable, only broadcasting: {}", e),
        }
        effects
    }
}
