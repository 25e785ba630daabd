pub mod dashboard;
pub mod pipeline;
