//! Sink contracts and their in-memory implementations.
//!
//! - `LatestStore`: key → value, full overwrite (`sensor_data`, `forecast_data`).
//! - `HistoryLog`: append-only readings in acceptance order, bounded ring.
//! - `LiveBroadcast`: push channel for `sensor_update` / `forecast_update` events.
//!
//! Traits are synchronous: every implementation here is in-process and non-blocking.
//! Slow backends belong behind the sink worker, which already runs off the ingestion path.

use std::{collections::VecDeque, sync::Arc};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::errors::SinkError;
use crate::forecast::engine::ForecastBatch;
use crate::ingest::reading::Reading;
use crate::publish::history_csv::CsvHistoryMirror;

const LIVE_CHANNEL_CAPACITY: usize = 256;

pub trait LatestStore: Send + Sync {
    fn write(&self, key: &str, value: Value) -> Result<(), SinkError>;

    fn read(&self, key: &str) -> Result<Option<Value>, SinkError>;
}

pub trait HistoryLog: Send + Sync {
    fn append(&self, reading: &Reading) -> Result<(), SinkError>;

    /// All retained readings, oldest first.
    fn all(&self) -> Result<Vec<Reading>, SinkError>;

    /// The `n` most recent readings, oldest first.
    fn tail(&self, n: usize) -> Result<Vec<Reading>, SinkError> {
        let mut readings = self.all()?;
        let start = readings.len().saturating_sub(n);
        Ok(readings.split_off(start))
    }
}

pub trait LiveBroadcast: Send + Sync {
    fn broadcast(&self, event: &LiveEvent) -> Result<(), SinkError>;
}

/// Event pushed to live subscribers, serialized as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LiveEvent {
    SensorUpdate(Reading),
    ForecastUpdate(ForecastBatch),
}

impl LiveEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::SensorUpdate(_) => "sensor_update",
            LiveEvent::ForecastUpdate(_) => "forecast_update",
        }
    }

    /// Body of the event without the envelope.
    pub fn data_json(&self) -> Result<String, SinkError> {
        let res = match self {
            LiveEvent::SensorUpdate(r) => serde_json::to_string(r),
            LiveEvent::ForecastUpdate(b) => serde_json::to_string(b),
        };
        res.map_err(|e| SinkError::Serialize(e.to_string()))
    }
}

// ============================================================================
// Latest-value store
// ============================================================================

#[derive(Default)]
pub struct MemoryLatestStore {
    entries: DashMap<String, Value>,
}

impl MemoryLatestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LatestStore for MemoryLatestStore {
    fn write(&self, key: &str, value: Value) -> Result<(), SinkError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Value>, SinkError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }
}

// ============================================================================
// History log
// ============================================================================

/// Bounded history: once `capacity` readings are held the oldest is evicted.
pub struct MemoryHistoryLog {
    readings: Mutex<VecDeque<Reading>>,
    capacity: usize,
    mirror: Option<CsvHistoryMirror>,
}

impl MemoryHistoryLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            readings: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            mirror: None,
        }
    }

    /// Every appended reading is also handed to the CSV mirror.
    pub fn with_mirror(capacity: usize, mirror: CsvHistoryMirror) -> Self {
        Self {
            mirror: Some(mirror),
            ..Self::new(capacity)
        }
    }

    pub fn mirror(&self) -> Option<&CsvHistoryMirror> {
        self.mirror.as_ref()
    }
}

impl HistoryLog for MemoryHistoryLog {
    fn append(&self, reading: &Reading) -> Result<(), SinkError> {
        {
            let mut readings = self.readings.lock();
            if readings.len() >= self.capacity {
                readings.pop_front();
            }
            readings.push_back(reading.clone());
        }
        if let Some(mirror) = &self.mirror {
            mirror.record(reading);
        }
        Ok(())
    }

    fn all(&self) -> Result<Vec<Reading>, SinkError> {
        Ok(self.readings.lock().iter().cloned().collect())
    }

    fn tail(&self, n: usize) -> Result<Vec<Reading>, SinkError> {
        let readings = self.readings.lock();
        let start = readings.len().saturating_sub(n);
        Ok(readings.iter().skip(start).cloned().collect())
    }
}

// ============================================================================
// Live subscribers
// ============================================================================

/// Fan-out to live subscribers over a tokio broadcast channel.
///
/// Having no subscriber is not an error. A subscriber that falls more than
/// `LIVE_CHANNEL_CAPACITY` events behind skips the oldest ones.
#[derive(Clone)]
pub struct SubscriberHub {
    tx: broadcast::Sender<LiveEvent>,
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl LiveBroadcast for SubscriberHub {
    fn broadcast(&self, event: &LiveEvent) -> Result<(), SinkError> {
        // Err only means nobody is listening right now.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// The three persistence/fan-out sinks, shared between the sink worker and the dashboard.
#[derive(Clone)]
pub struct Sinks {
    pub latest: Arc<dyn LatestStore>,
    pub history: Arc<dyn HistoryLog>,
    pub live: Arc<dyn LiveBroadcast>,
}
