//! Effect dispatch: hands effect batches from the coordinator to the sink worker.
//!
//! - `EffectDispatcher::dispatch` is a non-blocking `try_send`; a saturated queue drops
//!   the batch and counts it, so a slow sink never stalls ingestion.
//! - History appends of a dropped batch are carried over and sent ahead of the next batch,
//!   so the history log only loses readings once `MAX_CARRIED_APPENDS` is exceeded.
//! - The sink worker applies each batch in order. Every effect is attempted; one failing
//!   sink is logged and counted without touching the others.

use std::sync::Arc;

use log::{debug, error, warn};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::errors::SinkError;
use crate::publish::{
    router::{Effect, Effects},
    sinks::Sinks,
};
use crate::transport::broker::Transport;
use crate::utils::metrics::{SharedMetrics, lock_metrics};

/// Upper bound on history appends held back while the sink worker is saturated.
pub const MAX_CARRIED_APPENDS: usize = 10_000;

pub struct EffectDispatcher {
    tx: mpsc::Sender<Effects>,
    metrics: SharedMetrics,
    carried: Effects,
}

impl EffectDispatcher {
    pub fn new(tx: mpsc::Sender<Effects>, metrics: SharedMetrics) -> Self {
        Self {
            tx,
            metrics,
            carried: Vec::new(),
        }
    }

    /// History appends waiting for the next successful send.
    pub fn carried_appends(&self) -> usize {
        self.carried.len()
    }

    /// Non-blocking; drops the batch when the sink worker is saturated or gone.
    pub fn dispatch(&mut self, effects: Effects) {
        if effects.is_empty() && self.carried.is_empty() {
            return;
        }
        let batch = if self.carried.is_empty() {
            effects
        } else {
            let mut batch = std::mem::take(&mut self.carried);
            batch.extend(effects);
            batch
        };

        match self.tx.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(batch)) => {
                lock_metrics(&self.metrics).effects_dropped += 1;
                self.carry_history(batch);
                warn!(
                    "sink worker saturated, effect batch dropped ({} history appends held back)",
                    self.carried.len()
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                lock_metrics(&self.metrics).effects_dropped += 1;
                warn!("sink worker stopped, effect batch dropped");
            }
        }
    }

    /// Waits for queue space and hands over any held-back history appends.
    pub async fn flush(&mut self) {
        if self.carried.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.carried);
        let count = batch.len();
        if self.tx.send(batch).await.is_err() {
            warn!("sink worker stopped, {} held-back history appends lost", count);
        }
    }

    fn carry_history(&mut self, batch: Effects) {
        self.carried = batch
            .into_iter()
            .filter(|effect| matches!(effect, Effect::AppendHistory(_)))
            .collect();
        if self.carried.len() > MAX_CARRIED_APPENDS {
            let excess = self.carried.len() - MAX_CARRIED_APPENDS;
            self.carried.drain(..excess);
            warn!("{} oldest held-back history appends discarded", excess);
        }
    }
}

/// Applies one batch in order. Returns the number of failed effects.
pub fn apply_effects(
    effects: Effects,
    sinks: &Sinks,
    transport: &dyn Transport,
    metrics: &SharedMetrics,
) -> usize {
    let mut failures = 0;
    for effect in effects {
        let sink = effect.sink();
        if let Err(e) = apply_one(effect, sinks, transport) {
            error!("{} sink write failed: {}", sink, e);
            failures += 1;
        }
    }
    if failures > 0 {
        lock_metrics(metrics).sink_failures += failures as u64;
    }
    failures
}

fn apply_one(effect: Effect, sinks: &Sinks, transport: &dyn Transport) -> Result<(), SinkError> {
    match effect {
        Effect::SetLatest { key, value } => sinks.latest.write(key, value),
        Effect::AppendHistory(reading) => sinks.history.append(&reading),
        Effect::Broadcast(event) => sinks.live.broadcast(&event),
        Effect::Publish { topic, payload } => transport.publish(&topic, payload),
    }
}

/// Spawns the sink worker; it exits once every dispatcher is dropped and the queue is drained.
pub fn spawn_sink_worker(
    mut rx: mpsc::Receiver<Effects>,
    sinks: Sinks,
    transport: Arc<dyn Transport>,
    metrics: SharedMetrics,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(effects) = rx.recv().await {
            apply_effects(effects, &sinks, transport.as_ref(), &metrics);
        }
        debug!("sink worker exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::reading::Reading;
    use crate::publish::{
        router::{LATEST_READING_KEY, PublicationRouter},
        sinks::{
            HistoryLog, LatestStore, LiveEvent, MemoryHistoryLog, MemoryLatestStore, SubscriberHub,
        },
    };
    use crate::transport::broker::InProcessBroker;
    use crate::utils::metrics::shared;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    struct DownStore;

    impl LatestStore for DownStore {
        fn write(&self, _key: &str, _value: Value) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("connection refused".into()))
        }
        fn read(&self, _key: &str) -> Result<Option<Value>, SinkError> {
            Err(SinkError::Unavailable("connection refused".into()))
        }
    }

    fn reading() -> Reading {
        Reading {
            timestamp: Utc.with_ymd_and_hms(2025, 3, 18, 10, 0, 0).unwrap(),
            temperature: 20.0,
            humidity: 60.0,
            air_pressure: 1012.0,
            wind_speed: 3.0,
        }
    }

    #[test]
    fn failing_sink_does_not_block_the_others() {
        let history = Arc::new(MemoryHistoryLog::new(10));
        let hub = SubscriberHub::new();
        let mut rx = hub.subscribe();
        let sinks = Sinks {
            latest: Arc::new(DownStore),
            history: history.clone(),
            live: Arc::new(hub),
        };
        let metrics = shared();
        let broker = InProcessBroker::new();

        let effects = PublicationRouter::new("forecast/predictions").on_reading(&reading());
        let failures = apply_effects(effects, &sinks, &broker, &metrics);

        assert_eq!(failures, 1);
        assert_eq!(history.all().unwrap().len(), 1);
        assert!(matches!(rx.try_recv().unwrap(), LiveEvent::SensorUpdate(_)));
        assert_eq!(lock_metrics(&metrics).sink_failures, 1);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (tx, _rx) = mpsc::channel(1);
        let metrics = shared();
        let mut dispatcher = EffectDispatcher::new(tx, metrics.clone());
        let effects = PublicationRouter::new("forecast/predictions").on_reading(&reading());

        dispatcher.dispatch(effects.clone());
        dispatcher.dispatch(effects);

        assert_eq!(lock_metrics(&metrics).effects_dropped, 1);
        assert_eq!(dispatcher.carried_appends(), 1);
    }

    #[test]
    fn history_of_a_dropped_batch_goes_out_with_the_next_one() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut dispatcher = EffectDispatcher::new(tx, shared());
        let router = PublicationRouter::new("forecast/predictions");
        let batch_for = |t: f64| {
            let mut r = reading();
            r.temperature = t;
            router.on_reading(&r)
        };

        dispatcher.dispatch(batch_for(1.0));
        dispatcher.dispatch(batch_for(2.0));
        rx.try_recv().unwrap();
        dispatcher.dispatch(batch_for(3.0));

        let history: Vec<f64> = rx
            .try_recv()
            .unwrap()
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::AppendHistory(r) => Some(r.temperature),
                _ => None,
            })
            .collect();
        assert_eq!(history, vec![2.0, 3.0]);
        assert_eq!(dispatcher.carried_appends(), 0);
    }

    #[tokio::test]
    async fn flush_delivers_held_back_appends() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut dispatcher = EffectDispatcher::new(tx, shared());
        let router = PublicationRouter::new("forecast/predictions");

        dispatcher.dispatch(router.on_reading(&reading()));
        dispatcher.dispatch(router.on_reading(&reading()));
        assert_eq!(dispatcher.carried_appends(), 1);

        rx.recv().await.unwrap();
        dispatcher.flush().await;
        let flushed = rx.recv().await.unwrap();
        assert_eq!(flushed.len(), 1);
        assert!(matches!(flushed[0], Effect::AppendHistory(_)));
    }

    #[tokio::test]
    async fn worker_applies_batches_in_order() {
        let latest = Arc::new(MemoryLatestStore::new());
        let history = Arc::new(MemoryHistoryLog::new(10));
        let sinks = Sinks {
            latest: latest.clone(),
            history: history.clone(),
            live: Arc::new(SubscriberHub::new()),
        };
        let metrics = shared();
        let (tx, rx) = mpsc::channel(8);
        let worker = spawn_sink_worker(rx, sinks, Arc::new(InProcessBroker::new()), metrics.clone());
        let mut dispatcher = EffectDispatcher::new(tx, metrics);
        let router = PublicationRouter::new("forecast/predictions");

        for t in [1.0, 2.0, 3.0] {
            let mut r = reading();
            r.temperature = t;
            dispatcher.dispatch(router.on_reading(&r));
        }
        drop(dispatcher);
        worker.await.unwrap();

        let temps: Vec<f64> = history.all().unwrap().iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![1.0, 2.0, 3.0]);
        assert_eq!(latest.read(LATEST_READING_KEY).unwrap().unwrap()["temperature"], 3.0);
    }
}
