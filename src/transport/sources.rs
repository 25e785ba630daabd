//! Reading sources feeding the sensor topic.
//!
//! - `SyntheticSource`: periodic random readings around a steady state (tokio interval,
//!   missed ticks skipped). Can emit the external unit-suffixed labels to exercise key translation.
//! - `ReplaySource`: replays a JSON-lines file, one payload per line, at a fixed pace.
//!
//! Both stop when the shutdown flag flips to `true` or its sender is dropped.

use std::{path::PathBuf, sync::Arc};

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::{Map, Value, json};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
    time::{self, Duration, MissedTickBehavior},
};

use crate::forecast::engine::round2;
use crate::ingest::reading::Feature;
use crate::transport::broker::Transport;

const SYNTHETIC_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Uniform ranges per feature, around a mild steady state.
const SYNTHETIC_RANGES: [(Feature, f64, f64); 4] = [
    (Feature::Temperature, 19.5, 20.5),
    (Feature::WindSpeed, 2.5, 3.5),
    (Feature::AirPressure, 1011.0, 1013.0),
    (Feature::Humidity, 58.0, 62.0),
];

pub struct SyntheticSource {
    pub interval: Duration,
    pub external_labels: bool,
}

impl SyntheticSource {
    /// One random payload, values rounded to 2 decimals.
    pub fn sample(&self) -> Value {
        let mut payload = Map::new();
        payload.insert(
            "timestamp".into(),
            json!(Utc::now().format(SYNTHETIC_TIMESTAMP_FORMAT).to_string()),
        );
        for (feature, lo, hi) in SYNTHETIC_RANGES {
            let key = if self.external_labels {
                feature.external_label()
            } else {
                feature.key()
            };
            payload.insert(key.into(), json!(round2(rand::random_range(lo..hi))));
        }
        Value::Object(payload)
    }

    pub async fn run(
        self,
        transport: Arc<dyn Transport>,
        topic: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("synthetic source publishing on `{}` every {:?}", topic, self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let body = self.sample().to_string().into_bytes();
                    if let Err(e) = transport.publish(&topic, body) {
                        warn!("synthetic source publish failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("synthetic source stopped");
    }
}

pub struct ReplaySource {
    pub path: PathBuf,
    pub interval: Duration,
}

impl ReplaySource {
    /// Returns the number of lines published. Blank lines are skipped; invalid ones are
    /// published as-is so the coordinator sees exactly what the file holds.
    pub async fn run(
        self,
        transport: Arc<dyn Transport>,
        topic: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<usize> {
        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("replaying {:?} on `{}`", self.path, topic);

        let mut published = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if let Err(e) = transport.publish(&topic, line.into_bytes()) {
                warn!("replay publish failed: {}", e);
                continue;
            }
            published += 1;
        }
        info!("replay finished, {} lines published", published);
        Ok(published)
    }
}
