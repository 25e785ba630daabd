//! # Weather Forecast Service Entry Point
//!
//! Wires the in-process pipeline and runs it until Ctrl-C (or `RUN_SECONDS`).
//!
//! ## Key Architecture
//! - **Source:** synthetic sensor (every 2 s by default) or JSONL replay → `sensor/data`.
//! - **Coordinator:** one task, strict arrival order, forecast under a timeout once the window is full.
//! - **Sink worker:** latest store, bounded history (+ optional CSV mirror), live hub, `forecast/predictions`.
//! - **Dashboard:** `http://127.0.0.1:8080` (JSON routes, SVG chart, SSE).
//!
//! ## Shutdown
//! - Watch flag stops the source and the coordinator; the sink worker drains its queue.
//! - Metrics summary appended to `data/logs/run_summary.csv`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use log::{error, info, warn};
use tokio::sync::watch;

use weather_forecast::{
    config::{PipelineConfig, SourceConfig},
    ingest::coordinator::IngestionCoordinator,
    publish::{
        history_csv::CsvHistoryMirror,
        router::PublicationRouter,
        sinks::{MemoryHistoryLog, MemoryLatestStore, Sinks, SubscriberHub},
    },
    service::{
        dashboard::{DashboardContext, start_dashboard},
        pipeline::{PipelineSettings, spawn_pipeline},
    },
    transport::{
        broker::{InProcessBroker, Transport},
        sources::{ReplaySource, SyntheticSource},
    },
    utils::{
        metrics::{lock_metrics, shared as shared_metrics},
        metrics_export::export_summary_csv,
    },
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    info!("=== WEATHER FORECAST SERVICE START ===");

    let cfg = PipelineConfig::from_env()?;
    let metrics = shared_metrics();

    // ------------------------------------------------------------------------
    // Sinks
    // ------------------------------------------------------------------------
    let history = match &cfg.history_csv {
        Some(path) => Arc::new(MemoryHistoryLog::with_mirror(
            cfg.history_capacity,
            CsvHistoryMirror::start(path)?,
        )),
        None => Arc::new(MemoryHistoryLog::new(cfg.history_capacity)),
    };
    let latest = Arc::new(MemoryLatestStore::new());
    let hub = SubscriberHub::new();
    let sinks = Sinks {
        latest: latest.clone(),
        history: history.clone(),
        live: Arc::new(hub.clone()),
    };

    // ------------------------------------------------------------------------
    // Transport + pipeline
    // ------------------------------------------------------------------------
    let broker = Arc::new(InProcessBroker::new());
    let inbound = broker.subscribe(&cfg.sensor_topic, cfg.ingest_queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = IngestionCoordinator::new(
        cfg.build_engine(),
        PublicationRouter::new(cfg.forecast_topic.clone()),
    );
    let model_name = coordinator.engine().model_name().to_string();
    let pipeline = spawn_pipeline(
        coordinator,
        inbound,
        sinks,
        broker.clone(),
        PipelineSettings {
            model_timeout: cfg.model_timeout(),
            effect_queue_capacity: cfg.effect_queue_capacity,
        },
        metrics.clone(),
        shutdown_rx.clone(),
    );

    let transport: Arc<dyn Transport> = broker.clone();
    let source = match cfg.source.clone() {
        SourceConfig::Synthetic {
            interval_ms,
            external_labels,
        } => {
            let source = SyntheticSource {
                interval: Duration::from_millis(interval_ms),
                external_labels,
            };
            tokio::spawn(source.run(transport, cfg.sensor_topic.clone(), shutdown_rx.clone()))
        }
        SourceConfig::Replay { path, interval_ms } => {
            let source = ReplaySource {
                path,
                interval: Duration::from_millis(interval_ms),
            };
            let topic = cfg.sensor_topic.clone();
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = source.run(transport, topic, shutdown).await {
                    error!("replay source failed: {}", e);
                }
            })
        }
    };

    // ------------------------------------------------------------------------
    // Dashboard
    // ------------------------------------------------------------------------
    let dashboard = match &cfg.dashboard_addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse()?;
            let ctx = DashboardContext {
                latest,
                history: history.clone(),
                hub,
                metrics: metrics.clone(),
            };
            Some(start_dashboard(addr, ctx)?)
        }
        None => None,
    };

    // ------------------------------------------------------------------------
    // Run until Ctrl-C or the configured duration
    // ------------------------------------------------------------------------
    match cfg.run_seconds {
        Some(secs) => {
            info!("running for {} seconds", secs);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Ctrl-C received");
        }
    }

    info!("Stopping pipeline...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = source.await {
        warn!("source task ended abnormally: {}", e);
    }
    let coordinator = pipeline.join().await?;
    if let Some(dashboard) = dashboard {
        dashboard.stop();
    }
    if let Some(mirror) = history.mirror() {
        mirror.stop();
        info!(
            "history CSV {:?}: {} rows written, {} dropped",
            mirror.path(),
            mirror.written_rows(),
            mirror.dropped_rows()
        );
    }

    let snapshot = lock_metrics(&metrics).snapshot();
    info!(
        "final state {:?}: accepted={}, rejected={}, forecasts={}, failed={}",
        coordinator.state(),
        snapshot.readings_accepted,
        snapshot.readings_rejected,
        snapshot.forecasts_emitted,
        snapshot.forecasts_failed
    );
    if let Err(e) = export_summary_csv(&metrics, &model_name, &cfg.summary_csv) {
        error!("failed to export metrics summary: {}", e);
    }

    info!("=== WEATHER FORECAST SERVICE FINISHED ===");
    Ok(())
}
