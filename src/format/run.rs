use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Component, Path, PathBuf},
};

use crate::{
    api::{client::LifecycleStage, notebook::NotebookFormat, run::RunStatus},
    error::Result,
    format::{read_json, write_json, ExportInfo, RUN_FILE},
    ExperimentId, RunId,
};

pub const ARTIFACTS_DIR: &str = "artifacts";
pub const NOTEBOOKS_DIR: &str = "notebooks";

/// Contents of `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunExport {
    pub info: ExportInfo,
    pub run: RunRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub experiment_id: ExperimentId,
    pub status: RunStatus,
    pub lifecycle_stage: LifecycleStage,
    #[serde(default)]
    pub user_id: Option<String>,
    pub start_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Full history per key, in the order the server reported it.
    #[serde(default)]
    pub metrics: BTreeMap<String, Vec<MetricPoint>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactEntry>,
    #[serde(default)]
    pub notebook_formats: Vec<NotebookFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    #[serde(with = "float")]
    pub value: f64,
    pub timestamp: i64,
    pub step: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// `/`-separated path below the artifact root.
    pub path: String,
    pub file_size: u64,
}

impl RunExport {
    pub fn write(&self, dir: &Path) -> Result<()> {
        write_json(&dir.join(RUN_FILE), self)
    }

    pub fn read(dir: &Path) -> Result<Self> {
        read_json(&dir.join(RUN_FILE))
    }
}

pub fn artifacts_dir(dir: &Path) -> PathBuf {
    dir.join(ARTIFACTS_DIR)
}

pub fn notebook_file(dir: &Path, format: NotebookFormat) -> PathBuf {
    dir.join(NOTEBOOKS_DIR).join(format!("notebook.{}", format.extension()))
}

/// Local file for an artifact path, creating its parent directories.
///
/// Only plain path segments are accepted, so the file always lies below `artifacts/`.
pub fn artifact_file(dir: &Path, path: &str) -> Result<PathBuf> {
    let mut file = artifacts_dir(dir);
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !segment.contains('\\') => file.push(segment),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("artifact path '{}' leaves the artifact directory", path),
                )
                .into())
            }
        }
    }
    if file == artifacts_dir(dir) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("empty artifact path '{}'", path)).into());
    }
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(file)
}

/// Every file below `artifacts/`, sorted by path.
pub fn list_local_artifacts(dir: &Path) -> Result<Vec<ArtifactEntry>> {
    let root = artifacts_dir(dir);
    let mut entries = Vec::new();
    if root.is_dir() {
        walk(&root, "", &mut entries)?;
    }
    entries.sort();
    Ok(entries)
}

fn walk(dir: &Path, prefix: &str, entries: &mut Vec<ArtifactEntry>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = if prefix.is_empty() { name } else { format!("{}/{}", prefix, name) };
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            walk(&entry.path(), &path, entries)?;
        } else {
            entries.push(ArtifactEntry { path, file_size: metadata.len() });
        }
    }
    Ok(())
}

// JSON has no NaN or infinities, so those are written as strings
mod float {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "Infinity" } else { "-Infinity" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(de::Error::custom(format!("invalid metric value '{}'", other))),
            },
        }
    }
}
