//! CSV export of the end-of-run summary.
//!
//! One row per run: counters plus average/max forecast latency. Appends to the file,
//! writing the header only when the file is new, so several runs can share one summary.

use std::{
    fs::{OpenOptions, create_dir_all},
    io::{self, Write},
    path::Path,
};

use log::info;

use crate::utils::metrics::{SharedMetrics, lock_metrics};

const HEADER: &str = "model,readings_accepted,readings_rejected,forecasts_emitted,forecasts_failed,sink_failures,effects_dropped,avg_forecast_latency_us,max_forecast_latency_us\n";

pub fn export_summary_csv(
    metrics: &SharedMetrics,
    model_name: &str,
    csv_path: impl AsRef<Path>,
) -> io::Result<()> {
    let csv_path = csv_path.as_ref();
    if let Some(parent) = csv_path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }
    let file_exists = csv_path.exists();

    let snap = lock_metrics(metrics).snapshot();
    let row = format!(
        "{},{},{},{},{},{},{},{:.0},{:.0}\n",
        model_name,
        snap.readings_accepted,
        snap.readings_rejected,
        snap.forecasts_emitted,
        snap.forecasts_failed,
        snap.sink_failures,
        snap.effects_dropped,
        snap.forecast_latency_us_avg.unwrap_or(0.0),
        snap.forecast_latency_us_max.unwrap_or(0.0),
    );

    let mut file = OpenOptions::new().create(true).append(true).open(csv_path)?;
    if !file_exists {
        file.write_all(HEADER.as_bytes())?;
    }
    file.write_all(row.as_bytes())?;
    info!("Summary exported to: {:?}", csv_path);
    Ok(())
}
