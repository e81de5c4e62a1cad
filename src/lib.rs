pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod locks;
pub mod logging;
pub mod metrics;
pub mod origins;
pub mod proxy;
pub mod server;
pub mod timeseries;
