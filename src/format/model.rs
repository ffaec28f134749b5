use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use crate::{
    api::model::Stage,
    error::Result,
    format::{read_json, write_json, ExportInfo, MODEL_FILE},
    tags::SourceReference,
    ExperimentId, RunId,
};

pub const RUNS_DIR: &str = "runs";
pub const EXPERIMENTS_DIR: &str = "experiments";

/// Contents of `model.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelExport {
    pub info: ExportInfo,
    pub filter: ModelFilter,
    pub model: ModelRecord,
}

/// Selection the export was made with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFilter {
    #[serde(default)]
    pub stages: Option<BTreeSet<Stage>>,
    #[serde(default)]
    pub versions: Option<BTreeSet<String>>,
    #[serde(default)]
    pub export_all_runs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Selected versions in ascending version order.
    pub versions: Vec<VersionRecord>,
    #[serde(default)]
    pub failed_versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    pub current_stage: Stage,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Source as reported by the exporting server.
    pub source: String,
    /// Parsed form of `source`, absent when it could not be parsed.
    #[serde(default)]
    pub reference: Option<SourceReference>,
    #[serde(default)]
    pub run_id: Option<RunId>,
    pub backing: Backing,
}

/// Where the export of a version's backing run lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backing {
    /// `runs/<run_id>/` below the model directory.
    Nested,
    /// `experiments/<experiment_id>/<run_id>/` below the model directory.
    InExperiment { experiment_id: ExperimentId },
    /// Exported by a sibling experiment export; must exist at the destination.
    Reference,
    /// The version has no run and is imported stage-only.
    None,
}

impl ModelExport {
    pub fn write(&self, dir: &Path) -> Result<()> {
        write_json(&dir.join(MODEL_FILE), self)
    }

    pub fn read(dir: &Path) -> Result<Self> {
        read_json(&dir.join(MODEL_FILE))
    }
}

pub fn nested_run_dir(dir: &Path, run_id: &RunId) -> PathBuf {
    dir.join(RUNS_DIR).join(run_id.as_ref())
}

pub fn experiment_dir(dir: &Path, experiment_id: &ExperimentId) -> PathBuf {
    dir.join(EXPERIMENTS_DIR).join(experiment_id.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ObjectType;

    #[test]
    fn backing_is_tagged() {
        let json = serde_json::to_value(Backing::InExperiment { experiment_id: "7".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "in_experiment", "experiment_id": "7"}));
        let json = serde_json::to_value(Backing::Reference).unwrap();
        assert_eq!(json, serde_json::json!({"type": "reference"}));
    }

    #[test]
    fn manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let export = ModelExport {
            info: ExportInfo::at(ObjectType::RegisteredModel, "m", "http://src", 0),
            filter: ModelFilter {
                stages: Some(vec![Stage::Production].into_iter().collect()),
                versions: None,
                export_all_runs: false,
            },
            model: ModelRecord {
                name: "m".into(),
                description: "Hello description".into(),
                tags: vec![("city".to_owned(), "franconia".to_owned())].into_iter().collect(),
                versions: vec![VersionRecord {
                    version: "1".into(),
                    current_stage: Stage::Production,
                    description: String::new(),
                    tags: BTreeMap::new(),
                    source: "mlflow-artifacts:/1/r1/artifacts/model".into(),
                    reference: Some(SourceReference { run_id: "r1".into(), relative_path: "model".into() }),
                    run_id: Some("r1".into()),
                    backing: Backing::Nested,
                }],
                failed_versions: vec![],
            },
        };
        export.write(dir.path()).unwrap();
        assert_eq!(ModelExport::read(dir.path()).unwrap(), export);
    }
}
