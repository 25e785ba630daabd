// Forecasting: normalization statistics, the model seam and the engine that ties them together.

pub mod engine;
pub mod model;
pub mod stats;
