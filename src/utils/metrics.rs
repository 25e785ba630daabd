//! Pipeline metrics for the live dashboard and the end-of-run summary.
//!
//! - Counters: accepted/rejected readings, forecasts emitted/failed, sink failures, dropped effect batches.
//! - Forecast latency (µs) kept in a bounded buffer (last 1000 cycles).
//!
//! Shared as `Arc<Mutex<PipelineMetrics>>`; every lock goes through `lock_metrics`,
//! which recovers from a poisoned mutex instead of panicking.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::Serialize;

pub const MAX_POINTS: usize = 1_000;

#[derive(Debug, Default, Clone)]
pub struct PipelineMetrics {
    pub readings_accepted: u64,
    pub readings_rejected: u64,
    pub forecasts_emitted: u64,
    pub forecasts_failed: u64,
    pub sink_failures: u64,
    pub effects_dropped: u64,

    /// Snapshot → records, microseconds (last 1000 forecasts)
    pub forecast_latency_us: VecDeque<u64>,

    pub forecasting_halted: bool,
}

impl PipelineMetrics {
    pub fn record_forecast_latency(&mut self, latency_us: u64) {
        push_capped_u64(&mut self.forecast_latency_us, latency_us);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = calculate_stats_u64(&self.forecast_latency_us);
        MetricsSnapshot {
            readings_accepted: self.readings_accepted,
            readings_rejected: self.readings_rejected,
            forecasts_emitted: self.forecasts_emitted,
            forecasts_failed: self.forecasts_failed,
            sink_failures: self.sink_failures,
            effects_dropped: self.effects_dropped,
            forecasting_halted: self.forecasting_halted,
            forecast_latency_samples: latency.as_ref().map_or(0, |s| s.count),
            forecast_latency_us_min: latency.as_ref().map(|s| s.min),
            forecast_latency_us_avg: latency.as_ref().map(|s| s.mean),
            forecast_latency_us_max: latency.as_ref().map(|s| s.max),
        }
    }
}

/// Serializable view served on `/metrics.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub readings_accepted: u64,
    pub readings_rejected: u64,
    pub forecasts_emitted: u64,
    pub forecasts_failed: u64,
    pub sink_failures: u64,
    pub effects_dropped: u64,
    pub forecasting_halted: bool,
    /// Forecast cycles the latency figures cover (at most `MAX_POINTS`).
    pub forecast_latency_samples: usize,
    pub forecast_latency_us_min: Option<f64>,
    pub forecast_latency_us_avg: Option<f64>,
    pub forecast_latency_us_max: Option<f64>,
}

pub type SharedMetrics = Arc<Mutex<PipelineMetrics>>;

pub fn shared() -> SharedMetrics {
    Arc::new(Mutex::new(PipelineMetrics::default()))
}

/// Locks the shared metrics; a poisoned lock is recovered, metrics are best-effort.
pub fn lock_metrics(metrics: &SharedMetrics) -> MutexGuard<'_, PipelineMetrics> {
    match metrics.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Appends value to metrics buffer; removes oldest if at capacity.
#[inline]
pub fn push_capped_u64(buf: &mut VecDeque<u64>, val: u64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

#[derive(Debug, Clone)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

/// Computes min, max, mean for u64 buffer (cast to f64).
pub fn calculate_stats_u64(data: &VecDeque<u64>) -> Option<Stats> {
    if data.is_empty() {
        return None;
    }

    let count = data.len();
    let min = data.iter().map(|&x| x as f64).fold(f64::INFINITY, f64::min);
    let max = data.iter().map(|&x| x as f64).fold(f64::NEG_INFINITY, f64::max);
    let mean = data.iter().map(|&x| x as f64).sum::<f64>() / count as f64;

    Some(Stats { min, max, mean, count })
}
