pub mod broker;
pub mod config;
pub mod generator;
pub mod pipeline;
pub mod pool;
pub mod store;
pub mod telemetry;
