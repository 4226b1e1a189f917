pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod extract;
pub mod labels;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod poller;

pub use error::{ExporterError, Result};
