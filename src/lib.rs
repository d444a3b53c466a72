pub mod batch;
pub mod config;
pub mod metrics;
pub mod payload;
pub mod server;
