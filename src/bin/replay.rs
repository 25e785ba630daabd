//! Offline replay: feeds a JSONL file of readings through the coordinator and prints
//! every forecast envelope (one JSON line per forecast) to stdout.
//!
//! Usage: `replay <readings.jsonl>`
//!
//! Runs synchronously with no broker and no sinks; configuration comes from the same
//! environment variables as the service (`WINDOW_SIZE`, `FORECAST_MODEL`, ...).
//! Forecast timestamps are anchored on each reading's own timestamp, so a replay of
//! historical data yields the forecasts the live service would have produced at the time.

use std::{
    env,
    fs::File,
    io::{self, BufRead, BufReader, Write},
};

use chrono::Utc;
use log::info;

use weather_forecast::{
    config::PipelineConfig,
    ingest::{coordinator::IngestionCoordinator, normalizer},
    publish::router::{Effect, PublicationRouter},
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .ok_or("usage: replay <readings.jsonl>")?;
    let cfg = PipelineConfig::from_env()?;
    let mut coordinator = IngestionCoordinator::new(
        cfg.build_engine(),
        PublicationRouter::new(cfg.forecast_topic.clone()),
    );

    let reader = BufReader::new(File::open(&path)?);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let (mut lines, mut forecasts) = (0usize, 0usize);

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        let now = reading_instant(line.as_bytes()).unwrap_or_else(Utc::now);
        for effect in coordinator.handle(line.as_bytes(), now) {
            if let Effect::Publish { payload, .. } = effect {
                out.write_all(&payload)?;
                out.write_all(b"\n")?;
                forecasts += 1;
            }
        }
    }
    out.flush()?;

    info!(
        "replayed {} lines from {}: {} forecasts, final state {:?}",
        lines,
        path,
        forecasts,
        coordinator.state()
    );
    Ok(())
}

/// Timestamp carried by the payload, if it has a usable one.
fn reading_instant(body: &[u8]) -> Option<chrono::DateTime<Utc>> {
    let payload = normalizer::decode_payload(body).ok()?;
    payload
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(normalizer::parse_timestamp)
}
