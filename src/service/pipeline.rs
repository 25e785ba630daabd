//! Async service loop around the ingestion coordinator.
//!
//! - One task owns the coordinator and processes inbound messages strictly in order.
//! - Forecasts run on the blocking pool under `model_timeout`; the loop awaits each one
//!   before taking the next message (serialize-then-continue). A timeout counts as
//!   `InferenceFailed`; the abandoned model call finishes in the background and is discarded.
//! - At most one model call is ever in flight: while a timed-out call is still running,
//!   later triggers fail fast instead of stacking up blocking threads.
//! - Effects go to the sink worker through a bounded queue and never block this loop.
//! - Shutdown: pending messages are drained first (`biased` select), then the loop exits,
//!   the dispatcher is dropped and the sink worker finishes its queue.

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::{
    sync::{mpsc, watch},
    task::{self, JoinError, JoinHandle},
    time::{self, Duration},
};

use crate::errors::ForecastError;
use crate::forecast::engine::{ForecastEngine, ForecastRecord};
use crate::ingest::{coordinator::IngestionCoordinator, reading::Reading};
use crate::publish::{
    dispatcher::{EffectDispatcher, spawn_sink_worker},
    sinks::Sinks,
};
use crate::transport::broker::{Message, Transport};
use crate::utils::metrics::{SharedMetrics, lock_metrics};

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub model_timeout: Duration,
    pub effect_queue_capacity: usize,
}

pub struct PipelineHandles {
    pub coordinator: JoinHandle<IngestionCoordinator>,
    pub sink_worker: JoinHandle<()>,
}

impl PipelineHandles {
    /// Waits for the coordinator loop, then for the sink worker to drain.
    pub async fn join(self) -> Result<IngestionCoordinator, JoinError> {
        let coordinator = self.coordinator.await?;
        self.sink_worker.await?;
        Ok(coordinator)
    }
}

pub fn spawn_pipeline(
    coordinator: IngestionCoordinator,
    inbound: mpsc::Receiver<Message>,
    sinks: Sinks,
    transport: Arc<dyn Transport>,
    settings: PipelineSettings,
    metrics: SharedMetrics,
    shutdown: watch::Receiver<bool>,
) -> PipelineHandles {
    let (tx, rx) = mpsc::channel(settings.effect_queue_capacity.max(1));
    let sink_worker = spawn_sink_worker(rx, sinks, transport, metrics.clone());
    let dispatcher = EffectDispatcher::new(tx, metrics.clone());

    let coordinator = tokio::spawn(run_coordinator(
        coordinator,
        inbound,
        dispatcher,
        settings.model_timeout,
        metrics,
        shutdown,
    ));

    PipelineHandles {
        coordinator,
        sink_worker,
    }
}

pub async fn run_coordinator(
    mut coordinator: IngestionCoordinator,
    mut inbound: mpsc::Receiver<Message>,
    mut dispatcher: EffectDispatcher,
    model_timeout: Duration,
    metrics: SharedMetrics,
    mut shutdown: watch::Receiver<bool>,
) -> IngestionCoordinator {
    info!(
        "coordinator started: window={}, model=`{}`, timeout={:?}",
        coordinator.window().capacity(),
        coordinator.engine().model_name(),
        model_timeout
    );
    let mut runner = ForecastRunner::new(model_timeout);

    loop {
        let msg = tokio::select! {
            biased;
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => {
                    debug!("inbound subscription closed");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let accepted = match coordinator.accept(&msg.payload, Utc::now()) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("dropping invalid reading from `{}`: {}", msg.topic, e);
                lock_metrics(&metrics).readings_rejected += 1;
                continue;
            }
        };
        lock_metrics(&metrics).readings_accepted += 1;
        dispatcher.dispatch(accepted.effects);

        let Some(snapshot) = accepted.snapshot else {
            continue;
        };

        let started = Instant::now();
        let outcome = runner
            .run(coordinator.engine().clone(), snapshot, Utc::now())
            .await;
        {
            let mut m = lock_metrics(&metrics);
            m.record_forecast_latency(started.elapsed().as_micros() as u64);
            match &outcome {
                Ok(_) => m.forecasts_emitted += 1,
                Err(_) => m.forecasts_failed += 1,
            }
        }

        let effects = coordinator.forecast_effects(outcome);
        if coordinator.forecasting_halted() {
            lock_metrics(&metrics).forecasting_halted = true;
        }
        dispatcher.dispatch(effects);
    }

    dispatcher.flush().await;
    info!("coordinator stopped in state {:?}", coordinator.state());
    coordinator
}

type ForecastOutcome = Result<Vec<ForecastRecord>, ForecastError>;

/// Runs forecasts on the blocking pool, one at a time, each bounded by `limit`.
///
/// A call that overruns `limit` is kept as `stalled` until it finishes; no new model
/// call starts before then.
pub struct ForecastRunner {
    limit: Duration,
    stalled: Option<JoinHandle<ForecastOutcome>>,
}

impl ForecastRunner {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            stalled: None,
        }
    }

    /// True while a timed-out model call is still occupying the model.
    pub fn is_stalled(&mut self) -> bool {
        if self.stalled.as_ref().is_some_and(|h| !h.is_finished()) {
            return true;
        }
        self.stalled = None;
        false
    }

    pub async fn run(
        &mut self,
        engine: ForecastEngine,
        snapshot: Vec<Reading>,
        computed_at: DateTime<Utc>,
    ) -> ForecastOutcome {
        if self.is_stalled() {
            return Err(ForecastError::InferenceFailed(
                "previous forecast still running".into(),
            ));
        }

        let mut model_task =
            task::spawn_blocking(move || engine.forecast(&snapshot, computed_at));
        match time::timeout(self.limit, &mut model_task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(ForecastError::InferenceFailed(format!(
                "model task failed: {}",
                e
            ))),
            Err(_) => {
                self.stalled = Some(model_task);
                Err(ForecastError::InferenceFailed(format!(
                    "model exceeded {:?}",
                    self.limit
                )))
            }
        }
    }
}
