// Broker seam and the sources that feed it.

pub mod broker;
pub mod sources;
