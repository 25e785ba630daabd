//! Ingestion coordinator: the single owner of the window buffer.
//!
//! States:
//! - `AwaitingWindow`: buffer not yet full, readings are only published.
//! - `Streaming`: entered the instant a push fills the buffer (that reading already
//!   forecasts); every accepted reading from then on also forecasts on a fresh snapshot.
//!
//! The coordinator never performs I/O. It returns `Effects` for the publication sinks
//! and hands the caller the snapshot to forecast on, so the async service can bound the
//! model call with a timeout while tests and the replay tool drive `handle` synchronously.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::errors::{ForecastError, InvalidReading};
use crate::forecast::engine::{ForecastEngine, ForecastRecord};
use crate::ingest::{
    normalizer::{decode_payload, normalize, translate_keys},
    reading::Reading,
    window::WindowBuffer,
};
use crate::publish::router::{Effects, PublicationRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    AwaitingWindow,
    Streaming,
}

/// Outcome of accepting one payload.
#[derive(Debug)]
pub struct Accepted {
    pub reading: Reading,
    /// Reading fan-out, to be applied before any forecast effects.
    pub effects: Effects,
    /// Frozen window to forecast on; `None` while filling or once forecasting is halted.
    pub snapshot: Option<Vec<Reading>>,
}

pub struct IngestionCoordinator {
    window: WindowBuffer,
    engine: ForecastEngine,
    router: PublicationRouter,
    state: CoordinatorState,
    forecasting_halted: bool,
}

impl IngestionCoordinator {
    pub fn new(engine: ForecastEngine, router: PublicationRouter) -> Self {
        Self {
            window: WindowBuffer::new(engine.window_size()),
            engine,
            router,
            state: CoordinatorState::AwaitingWindow,
            forecasting_halted: false,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn window(&self) -> &WindowBuffer {
        &self.window
    }

    pub fn engine(&self) -> &ForecastEngine {
        &self.engine
    }

    pub fn forecasting_halted(&self) -> bool {
        self.forecasting_halted
    }

    /// Decode → translate → normalize → push. An invalid payload leaves the buffer
    /// and the state untouched.
    pub fn accept(
        &mut self,
        body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Accepted, InvalidReading> {
        let payload = translate_keys(decode_payload(body)?);
        let reading = normalize(&payload, received_at)?;

        let became_full = self.window.push(reading.clone()).is_full;
        if became_full && self.state == CoordinatorState::AwaitingWindow {
            self.state = CoordinatorState::Streaming;
            info!(
                "window full ({} readings), streaming forecasts with model `{}`",
                self.window.len(),
                self.engine.model_name()
            );
        } else if self.state == CoordinatorState::AwaitingWindow {
            debug!("window filling: {}/{}", self.window.len(), self.window.capacity());
        }

        let effects = self.router.on_reading(&reading);
        let snapshot = (self.state == CoordinatorState::Streaming && !self.forecasting_halted)
            .then(|| self.window.snapshot());

        Ok(Accepted {
            reading,
            effects,
            snapshot,
        })
    }

    /// Turns one forecast outcome into effects. A fatal error halts forecasting for
    /// the rest of the process; ingestion keeps going.
    pub fn forecast_effects(
        &mut self,
        outcome: Result<Vec<ForecastRecord>, ForecastError>,
    ) -> Effects {
        match outcome {
            Ok(records) => {
                info!("forecast published: {} horizons", records.len());
                self.router.on_forecast(records)
            }
            Err(e) if e.is_fatal() => {
                if !self.forecasting_halted {
                    error!("forecasting halted, fix the deployment configuration: {}", e);
                }
                self.forecasting_halted = true;
                Vec::new()
            }
            Err(e) => {
                warn!("forecast cycle skipped: {}", e);
                Vec::new()
            }
        }
    }

    /// Full synchronous path for one raw message: reading effects, then forecast
    /// effects when the window is full. Invalid payloads yield no effects.
    pub fn handle(&mut self, body: &[u8], now: DateTime<Utc>) -> Effects {
        let accepted = match self.accept(body, now) {
            Ok(a) => a,
            Err(e) => {
                warn!("dropping invalid reading: {}", e);
                return Vec::new();
            }
        };
        let mut effects = accepted.effects;
        if let Some(snapshot) = accepted.snapshot {
            let outcome = self.engine.forecast(&snapshot, now);
            effects.extend(self.forecast_effects(outcome));
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::{
        engine::DEFAULT_HORIZON_INDICES, model::IdentityModel, stats::NormalizationStatistics,
    };
    use crate::publish::router::Effect;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 18, 14, 30, 0).unwrap()
    }

    fn coordinator_with(stats: NormalizationStatistics) -> IngestionCoordinator {
        let engine = ForecastEngine::new(
            Arc::new(IdentityModel),
            stats,
            27,
            DEFAULT_HORIZON_INDICES.to_vec(),
            Duration::hours(1),
        );
        IngestionCoordinator::new(engine, PublicationRouter::new("forecast/predictions"))
    }

    fn coordinator() -> IngestionCoordinator {
        coordinator_with(NormalizationStatistics::default())
    }

    fn payload(i: usize) -> Vec<u8> {
        format!(
            r#"{{"temperature": {}, "humidity": 60.0, "air_pressure": 1012.0, "wind_speed": 3.0}}"#,
            20.0 + i as f64 * 0.1
        )
        .into_bytes()
    }

    fn publishes(effects: &Effects) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Publish { .. }))
            .count()
    }

    #[test]
    fn starts_awaiting_with_empty_window() {
        let c = coordinator();
        assert_eq!(c.state(), CoordinatorState::AwaitingWindow);
        assert!(c.window().is_empty());
    }

    #[test]
    fn filling_reading_switches_to_streaming_and_forecasts() {
        let mut c = coordinator();
        for i in 0..26 {
            let effects = c.handle(&payload(i), now());
            assert_eq!(effects.len(), 3);
            assert_eq!(publishes(&effects), 0);
        }
        assert_eq!(c.state(), CoordinatorState::AwaitingWindow);

        let effects = c.handle(&payload(26), now());
        assert_eq!(c.state(), CoordinatorState::Streaming);
        assert_eq!(publishes(&effects), 1);
    }

    #[test]
    fn every_reading_after_fill_forecasts() {
        let mut c = coordinator();
        for i in 0..27 {
            c.handle(&payload(i), now());
        }
        for i in 27..30 {
            assert_eq!(publishes(&c.handle(&payload(i), now())), 1);
        }
        assert_eq!(c.window().len(), 27);
        assert_eq!(c.state(), CoordinatorState::Streaming);
    }

    #[test]
    fn invalid_payload_is_transparent_to_window() {
        let mut clean = coordinator();
        let mut noisy = coordinator();
        for i in 0..27 {
            clean.handle(&payload(i), now());
            noisy.handle(&payload(i), now());
            if i == 12 {
                let effects = noisy.handle(br#"{"temperature": 20.0, "humidity": 60.0}"#, now());
                assert!(effects.is_empty());
            }
        }
        assert_eq!(clean.window().snapshot(), noisy.window().snapshot());
        assert_eq!(noisy.state(), CoordinatorState::Streaming);
    }

    #[test]
    fn invalid_payload_never_transitions() {
        let mut c = coordinator();
        for i in 0..26 {
            c.handle(&payload(i), now());
        }
        assert!(c.accept(b"not json", now()).is_err());
        assert_eq!(c.state(), CoordinatorState::AwaitingWindow);
        assert_eq!(c.window().len(), 26);
    }

    #[test]
    fn degenerate_statistics_halt_forecasting_not_ingestion() {
        let mut stats = NormalizationStatistics::default();
        stats.temperature.std = 0.0;
        let mut c = coordinator_with(stats);
        for i in 0..27 {
            c.handle(&payload(i), now());
        }
        assert!(c.forecasting_halted());

        let accepted = c.accept(&payload(27), now()).unwrap();
        assert!(accepted.snapshot.is_none());
        assert_eq!(accepted.effects.len(), 3);
    }

    #[test]
    fn inference_failure_skips_one_cycle_only() {
        let mut c = coordinator();
        let effects =
            c.forecast_effects(Err(ForecastError::InferenceFailed("model timed out".into())));
        assert!(effects.is_empty());
        assert!(!c.forecasting_halted());
    }

    #[test]
    fn missing_timestamp_uses_receive_instant() {
        let mut c = coordinator();
        let accepted = c.accept(&payload(0), now()).unwrap();
        assert_eq!(accepted.reading.timestamp, now());
    }
}
