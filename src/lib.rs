//! # Weather Forecast Pipeline
//!
//! Sliding-window ingestion of environmental sensor readings into a multivariate
//! forecasting model, with fan-out of readings and forecasts to a latest-value store,
//! a history log, live subscribers and the transport layer.
//!
//! ## Flow
//! - **Transport:** raw JSON payloads arrive on the sensor topic.
//! - **Ingest:** key translation → normalizer → window buffer (FIFO, N = 27).
//! - **Forecast:** full window → normalize → model → denormalize → 4 horizon records.
//! - **Publish:** router turns readings/forecasts into effects; a sink worker applies them.
//!
//! The coordinator is a plain state machine (`handle(raw) -> Effects`), so the whole
//! transition logic can be exercised without a broker, a runtime or any sink.

pub mod config;
pub mod errors;
pub mod forecast;
pub mod ingest;
pub mod publish;
pub mod service;
pub mod transport;
pub mod utils;
