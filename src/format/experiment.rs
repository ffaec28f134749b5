use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{
    error::Result,
    format::{read_json, write_json, ExportInfo, EXPERIMENT_FILE},
    ExperimentId, RunId,
};

/// Contents of `experiment.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentExport {
    pub info: ExportInfo,
    pub experiment: ExperimentRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub experiment_id: ExperimentId,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Runs exported below this directory, in export order.
    pub runs: Vec<RunId>,
    #[serde(default)]
    pub failed_runs: Vec<RunId>,
}

impl ExperimentExport {
    pub fn write(&self, dir: &Path) -> Result<()> {
        write_json(&dir.join(EXPERIMENT_FILE), self)
    }

    pub fn read(dir: &Path) -> Result<Self> {
        read_json(&dir.join(EXPERIMENT_FILE))
    }
}

pub fn run_dir(dir: &Path, run_id: &RunId) -> PathBuf {
    dir.join(run_id.as_ref())
}
