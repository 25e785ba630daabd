//! Pipeline configuration.
//!
//! Layering, lowest to highest priority:
//! 1. Built-in defaults (the reference deployment: N = 27, horizons 5/11/17/23, training stats).
//! 2. Optional JSON file named by `PIPELINE_CONFIG` (any subset of fields).
//! 3. Individual environment overrides (`WINDOW_SIZE`, `MODEL_TIMEOUT_MS`, ...).
//!
//! `validate` runs last. Degenerate statistics are accepted here on purpose: they
//! surface at the first forecast attempt and halt forecasting only.

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use serde::Deserialize;

use crate::errors::ConfigError;
use crate::forecast::{
    engine::{DEFAULT_HORIZON_INDICES, ForecastEngine},
    model::{ForecastModel, IdentityModel, LinearTrendModel},
    stats::NormalizationStatistics,
};

pub const DEFAULT_SENSOR_TOPIC: &str = "sensor/data";
pub const DEFAULT_FORECAST_TOPIC: &str = "forecast/predictions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    #[default]
    Identity,
    LinearTrend,
}

impl ModelKind {
    pub fn build(self) -> Arc<dyn ForecastModel> {
        match self {
            ModelKind::Identity => Arc::new(IdentityModel),
            ModelKind::LinearTrend => Arc::new(LinearTrendModel::default()),
        }
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(ModelKind::Identity),
            "linear-trend" => Ok(ModelKind::LinearTrend),
            other => Err(format!("unknown model `{}` (identity | linear-trend)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Synthetic {
        interval_ms: u64,
        #[serde(default)]
        external_labels: bool,
    },
    Replay {
        path: PathBuf,
        interval_ms: u64,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Synthetic {
            interval_ms: 2_000,
            external_labels: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub window_size: usize,
    pub horizon_indices: Vec<usize>,
    pub horizon_step_minutes: i64,
    pub stats: NormalizationStatistics,
    pub model: ModelKind,
    pub model_timeout_ms: u64,
    pub sensor_topic: String,
    pub forecast_topic: String,
    /// Capacity of the coordinator's inbound subscription.
    pub ingest_queue_capacity: usize,
    pub effect_queue_capacity: usize,
    pub history_capacity: usize,
    pub history_csv: Option<PathBuf>,
    /// `None` disables the dashboard server.
    pub dashboard_addr: Option<String>,
    pub source: SourceConfig,
    pub run_seconds: Option<u64>,
    pub summary_csv: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size: 27,
            horizon_indices: DEFAULT_HORIZON_INDICES.to_vec(),
            horizon_step_minutes: 60,
            stats: NormalizationStatistics::default(),
            model: ModelKind::default(),
            model_timeout_ms: 2_000,
            sensor_topic: DEFAULT_SENSOR_TOPIC.to_string(),
            forecast_topic: DEFAULT_FORECAST_TOPIC.to_string(),
            ingest_queue_capacity: 1024,
            effect_queue_capacity: 1024,
            history_capacity: 10_000,
            history_csv: None,
            dashboard_addr: Some("127.0.0.1:8080".to_string()),
            source: SourceConfig::default(),
            run_seconds: None,
            summary_csv: PathBuf::from("data/logs/run_summary.csv"),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = match lookup("PIPELINE_CONFIG") {
            Some(path) => Self::from_json_file(&path)?,
            None => Self::default(),
        };

        if let Some(v) = lookup("WINDOW_SIZE") {
            cfg.window_size = parse_var("WINDOW_SIZE", &v)?;
        }
        if let Some(v) = lookup("FORECAST_MODEL") {
            cfg.model = parse_var("FORECAST_MODEL", &v)?;
        }
        if let Some(v) = lookup("MODEL_TIMEOUT_MS") {
            cfg.model_timeout_ms = parse_var("MODEL_TIMEOUT_MS", &v)?;
        }
        if let Some(path) = lookup("FORECAST_STATS_FILE") {
            cfg.stats = load_stats(&path)?;
        }
        if let Some(v) = lookup("SENSOR_TOPIC") {
            cfg.sensor_topic = v;
        }
        if let Some(v) = lookup("FORECAST_TOPIC") {
            cfg.forecast_topic = v;
        }
        if let Some(v) = lookup("HISTORY_CAPACITY") {
            cfg.history_capacity = parse_var("HISTORY_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("HISTORY_CSV") {
            cfg.history_csv = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DASHBOARD_ADDR") {
            cfg.dashboard_addr = (v != "off").then_some(v);
        }
        if let Some(v) = lookup("RUN_SECONDS") {
            cfg.run_seconds = Some(parse_var("RUN_SECONDS", &v)?);
        }

        let interval_override = lookup("SENSOR_INTERVAL_MS")
            .map(|v| parse_var::<u64>("SENSOR_INTERVAL_MS", &v))
            .transpose()?;
        if let Some(path) = lookup("REPLAY_FILE") {
            cfg.source = SourceConfig::Replay {
                path: PathBuf::from(path),
                interval_ms: interval_override.unwrap_or(100),
            };
        } else if let Some(ms) = interval_override {
            match &mut cfg.source {
                SourceConfig::Synthetic { interval_ms, .. }
                | SourceConfig::Replay { interval_ms, .. } => *interval_ms = ms,
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: &str) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(invalid("window_size", "must be at least 1"));
        }
        if self.horizon_indices.is_empty() {
            return Err(invalid("horizon_indices", "at least one horizon is required"));
        }
        if let Some(&bad) = self.horizon_indices.iter().find(|&&i| i >= self.window_size) {
            return Err(invalid(
                "horizon_indices",
                format!("index {} outside a window of {}", bad, self.window_size),
            ));
        }
        if self.horizon_indices.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("horizon_indices", "indices must be strictly ascending"));
        }
        if self.horizon_step_minutes <= 0 {
            return Err(invalid("horizon_step_minutes", "must be positive"));
        }
        if self.model_timeout_ms == 0 {
            return Err(invalid("model_timeout_ms", "must be positive"));
        }
        if let Some(addr) = &self.dashboard_addr {
            addr.parse::<SocketAddr>()
                .map_err(|e| invalid("dashboard_addr", format!("{}: {}", addr, e)))?;
        }
        Ok(())
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn horizon_step(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.horizon_step_minutes)
    }

    pub fn build_engine(&self) -> ForecastEngine {
        ForecastEngine::new(
            self.model.build(),
            self.stats,
            self.window_size,
            self.horizon_indices.clone(),
            self.horizon_step(),
        )
    }
}

/// Reads `{"air_pressure": {"mean": .., "std": ..}, ...}`.
pub fn load_stats(path: impl AsRef<Path>) -> Result<NormalizationStatistics, ConfigError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

fn parse_var<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, format!("`{}`: {}", raw, e)))
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_reference_deployment() {
        let cfg = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.window_size, 27);
        assert_eq!(cfg.horizon_indices, vec![5, 11, 17, 23]);
        assert_eq!(cfg.sensor_topic, "sensor/data");
        assert_eq!(cfg.forecast_topic, "forecast/predictions");
        assert_eq!(cfg.model_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.horizon_step(), chrono::Duration::hours(1));
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = PipelineConfig::from_lookup(lookup(&[
            ("WINDOW_SIZE", "30"),
            ("FORECAST_MODEL", "linear-trend"),
            ("SENSOR_INTERVAL_MS", "250"),
            ("DASHBOARD_ADDR", "off"),
        ]))
        .unwrap();
        assert_eq!(cfg.window_size, 30);
        assert_eq!(cfg.model, ModelKind::LinearTrend);
        assert_eq!(cfg.dashboard_addr, None);
        assert_eq!(
            cfg.source,
            SourceConfig::Synthetic {
                interval_ms: 250,
                external_labels: false
            }
        );
    }

    #[test]
    fn replay_file_switches_source() {
        let cfg = PipelineConfig::from_lookup(lookup(&[("REPLAY_FILE", "data/readings.jsonl")]))
            .unwrap();
        assert!(matches!(cfg.source, SourceConfig::Replay { interval_ms: 100, .. }));
    }

    #[test]
    fn horizon_beyond_window_is_rejected() {
        let err = PipelineConfig::from_lookup(lookup(&[("WINDOW_SIZE", "20")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "horizon_indices", .. }));
    }

    #[test]
    fn garbage_number_is_rejected() {
        let err = PipelineConfig::from_lookup(lookup(&[("MODEL_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "MODEL_TIMEOUT_MS", .. }));
    }

    #[test]
    fn zero_window_is_rejected() {
        let cfg = PipelineConfig {
            window_size: 0,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn degenerate_stats_load_without_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"air_pressure": {{"mean": 1000.0, "std": 10.0}},
                "temperature": {{"mean": 10.0, "std": 0.0}},
                "humidity": {{"mean": 70.0, "std": 15.0}},
                "wind_speed": {{"mean": 2.0, "std": 1.5}}}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cfg = PipelineConfig::from_lookup(lookup(&[("FORECAST_STATS_FILE", path.as_str())])).unwrap();
        assert_eq!(cfg.stats.temperature.std, 0.0);
    }

    #[test]
    fn partial_json_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"forecast_topic": "wx/out", "model": "linear-trend"}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cfg = PipelineConfig::from_lookup(lookup(&[("PIPELINE_CONFIG", path.as_str())])).unwrap();
        assert_eq!(cfg.forecast_topic, "wx/out");
        assert_eq!(cfg.model, ModelKind::LinearTrend);
        assert_eq!(cfg.window_size, 27);
    }

    #[test]
    fn missing_stats_file_is_io_error() {
        let err = load_stats("/nonexistent/stats.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
