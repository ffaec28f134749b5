//! Provenance stamps and the rewriting of cross-entity references.
//!
//! Every imported entity carries tags under the `mlflow_export_import` namespace
//! recording where it came from. A model version's `source` embeds the run id of
//! its backing run; it is captured as a [`SourceReference`] at export time and
//! resolved against the newly created run at import time.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{Error, Result},
    RunId,
};

pub const PREFIX: &str = "mlflow_export_import";
pub const SOURCE_ID: &str = "mlflow_export_import.metadata.source_id";
pub const SOURCE_HOST: &str = "mlflow_export_import.metadata.source_host";
pub const EXPORT_TIME: &str = "mlflow_export_import.metadata.export_time";
pub const SOURCE_VERSION: &str = "mlflow_export_import.field.version";

pub const USER: &str = "mlflow.user";
pub const SOURCE_NAME: &str = "mlflow.source.name";
pub const SOURCE_TYPE: &str = "mlflow.source.type";
pub const DATABRICKS_NOTEBOOK_PATH: &str = "mlflow.databricks.notebookPath";

pub fn is_reserved(key: &str) -> bool {
    key.starts_with(PREFIX) && key[PREFIX.len()..].starts_with('.')
}

/// Where an exported entity came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    pub source_host: String,
    pub export_time: i64,
}

impl Provenance {
    pub fn new(source_id: impl Into<String>, source_host: impl Into<String>, export_time: i64) -> Self {
        Provenance {
            source_id: source_id.into(),
            source_host: source_host.into(),
            export_time,
        }
    }

    pub fn tags(&self) -> Vec<(&'static str, String)> {
        vec![
            (SOURCE_ID, self.source_id.clone()),
            (SOURCE_HOST, self.source_host.clone()),
            (EXPORT_TIME, self.export_time.to_string()),
        ]
    }
}

/// Location of a model inside its backing run's artifact tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReference {
    pub run_id: RunId,
    /// Path below the artifact root, `/`-separated, empty for the root itself.
    pub relative_path: String,
}

impl SourceReference {
    /// Locates `run_id` in a version `source` such as
    /// `dbfs:/databricks/mlflow-tracking/1812/<run_id>/artifacts/model` or `runs:/<run_id>/model`.
    pub fn parse(source: &str, run_id: &RunId) -> Result<Self> {
        let normalized = source.replace('\\', "/");
        let malformed = || Error::MalformedSourceReference {
            reference: source.to_owned(),
            run_id: run_id.to_string(),
        };

        let rest: Vec<&str> = if let Some(path) = normalized.strip_prefix("runs:/") {
            let mut segments = path.split('/').filter(|s| !s.is_empty());
            if segments.next() != Some(run_id.as_ref()) {
                return Err(malformed());
            }
            segments.collect()
        } else {
            let segments: Vec<&str> = normalized.split('/').collect();
            let position = segments
                .iter()
                .rposition(|segment| *segment == run_id.as_ref())
                .ok_or_else(malformed)?;
            let mut rest: Vec<&str> = segments[position + 1..]
                .iter()
                .copied()
                .filter(|s| !s.is_empty())
                .collect();
            if rest.first() == Some(&"artifacts") {
                rest.remove(0);
            }
            rest
        };

        Ok(SourceReference {
            run_id: run_id.clone(),
            relative_path: rest.join("/"),
        })
    }

    /// The same location below another run's artifact root.
    pub fn resolve(&self, artifact_uri: &str) -> String {
        path_join(artifact_uri, &self.relative_path)
    }
}

/// Joins with `/`, also converting any backslash separators in `base`.
pub fn path_join(base: &str, relative: &str) -> String {
    let base = base.replace('\\', "/");
    let base = base.trim_end_matches('/');
    let relative = relative.trim_matches('/');
    if relative.is_empty() {
        base.to_owned()
    } else {
        format!("{}/{}", base, relative)
    }
}

/// Rewrites a source that could not be parsed at export time by replacing the
/// old run id with the new one wherever it occurs.
pub fn splice_raw_source(source: &str, old_run_id: &RunId, new_run_id: &RunId) -> Result<String> {
    let normalized = source.replace('\\', "/");
    if old_run_id.as_ref().is_empty() || !normalized.contains(old_run_id.as_ref()) {
        return Err(Error::MalformedSourceReference {
            reference: source.to_owned(),
            run_id: old_run_id.to_string(),
        });
    }
    warn!(
        source = %source,
        old_run_id = %old_run_id,
        new_run_id = %new_run_id,
        "rewriting unstructured version source by raw run id replacement"
    );
    Ok(normalized.replace(old_run_id.as_ref(), new_run_id.as_ref()))
}
