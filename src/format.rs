//! On-disk interchange format.
//!
//! ```text
//! <run>/                    <experiment>/              <model>/
//! +-run.json                +-experiment.json          +-model.json
//! +-artifacts/...           +-<run_id>/ (run layout)   +-runs/<run_id>/ (run layout)
//! +-notebooks/notebook.*                               +-experiments/<experiment_id>/
//! ```
//!
//! Reading and writing manifests never touches a tracking server.

pub mod experiment;
pub mod model;
pub mod run;

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use crate::error::Result;

pub const RUN_FILE: &str = "run.json";
pub const EXPERIMENT_FILE: &str = "experiment.json";
pub const MODEL_FILE: &str = "model.json";
pub const EXPERIMENTS_FILE: &str = "experiments.json";
pub const MODELS_FILE: &str = "models.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Run,
    Experiment,
    RegisteredModel,
    Experiments,
    Models,
}

/// Header of every manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
    pub object_type: ObjectType,
    pub source_id: String,
    pub source_host: String,
    /// Milliseconds since the epoch.
    pub export_time: i64,
    pub export_time_iso: String,
}

impl ExportInfo {
    pub fn new(object_type: ObjectType, source_id: impl Into<String>, source_host: impl Into<String>) -> Self {
        Self::at(object_type, source_id, source_host, crate::timestamp())
    }

    pub fn at(object_type: ObjectType, source_id: impl Into<String>, source_host: impl Into<String>, export_time: i64) -> Self {
        let export_time_iso = Utc
            .timestamp_millis_opt(export_time)
            .single()
            .map(|time| time.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();
        ExportInfo {
            object_type,
            source_id: source_id.into(),
            source_host: source_host.into(),
            export_time,
            export_time_iso,
        }
    }

    pub fn provenance(&self) -> crate::tags::Provenance {
        crate::tags::Provenance::new(self.source_id.clone(), self.source_host.clone(), self.export_time)
    }
}

/// Root manifest of a bulk export, listing each object's export directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkManifest {
    pub info: ExportInfo,
    pub exported: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

impl BulkManifest {
    pub fn write(&self, dir: &Path, file: &str) -> Result<()> {
        write_json(&dir.join(file), self)
    }

    pub fn read(dir: &Path, file: &str) -> Result<Self> {
        read_json(&dir.join(file))
    }
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_time_iso() {
        let info = ExportInfo::at(ObjectType::Run, "r1", "http://src", 1_600_000_000_123);
        assert_eq!(info.export_time_iso, "2020-09-13T12:26:40.123Z");
        assert_eq!(info.provenance().export_time, 1_600_000_000_123);
    }

    #[test]
    fn bulk_manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = BulkManifest {
            info: ExportInfo::at(ObjectType::Experiments, "all", "http://src", 0),
            exported: vec!["1".into(), "2".into()],
            failed: vec!["3".into()],
        };
        manifest.write(dir.path(), EXPERIMENTS_FILE).unwrap();
        assert_eq!(BulkManifest::read(dir.path(), EXPERIMENTS_FILE).unwrap(), manifest);
    }
}
