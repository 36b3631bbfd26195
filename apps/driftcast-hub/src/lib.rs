pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod media;
pub mod store;
pub mod sweeper;
pub mod telemetry;
pub mod tracker;
