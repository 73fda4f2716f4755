pub mod manager;
pub mod worker;

pub use manager::{InflightGauge, WorkerPool};
pub use worker::Outcome;
