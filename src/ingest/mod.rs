// Ingestion: payload normalization, the sliding window and the coordinator that owns it.

pub mod coordinator;
pub mod normalizer;
pub mod reading;
pub mod window;
