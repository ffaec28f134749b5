//! Export and import of MLflow experiments, runs and registered models.
//!
//! Objects are exported from a tracking server into a directory tree (see
//! [`format`]) and replayed into another server, keeping metrics, params, tags,
//! artifacts, model version stages and the link between a version and its run.

pub mod api;
pub mod backend;
pub mod bulk;
pub mod config;
pub mod error;
pub mod experiment;
pub mod format;
pub mod model;
pub mod report;
pub mod run;
pub mod tags;

pub use api::client::Client;
pub use api::id::{ExperimentId, RunId};
pub use error::{Error, Result};

/// Utility function to create a MLflow timestamp.
pub fn timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
