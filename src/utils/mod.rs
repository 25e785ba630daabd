// Run-wide metrics and their CSV summary export.

pub mod metrics;
pub mod metrics_export;
