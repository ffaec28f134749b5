//! Export of one run to a directory and its replay under a destination experiment.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::{self, File}, path::Path, thread};
use tracing::{debug, info, warn};

use crate::{
    api::{
        client::Client,
        error::StorageError,
        notebook::{NotebookFormat, NotebookSource},
        run::{Run, RunStatus, RunTag},
    },
    config::RetryPolicy,
    error::{Error, Result},
    format::{
        run::{artifact_file, list_local_artifacts, notebook_file, ArtifactEntry, MetricPoint, RunExport, RunRecord},
        ExportInfo, ObjectType,
    },
    tags, ExperimentId, RunId,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunExportOptions {
    /// Notebook representations to fetch for runs created from a notebook.
    pub notebook_formats: Vec<NotebookFormat>,
    pub retry: RetryPolicy,
}

pub struct RunExporter<'a, C: ?Sized> {
    client: &'a C,
    notebooks: &'a (dyn NotebookSource + Sync),
    options: RunExportOptions,
}

impl<'a, C: Client + ?Sized> RunExporter<'a, C> {
    pub fn new(client: &'a C, notebooks: &'a (dyn NotebookSource + Sync), options: RunExportOptions) -> Self {
        RunExporter { client, notebooks, options }
    }

    /// Writes `run.json`, `artifacts/` and the requested notebook formats into `dir`.
    pub fn export_run(&self, run_id: &RunId, dir: &Path) -> Result<RunExport> {
        let run = self.client.get_run(run_id)?;
        fs::create_dir_all(dir)?;

        let mut metrics = BTreeMap::new();
        for metric in &run.data.metrics {
            let history = self.client.get_metric_history(run_id, &metric.key)?;
            let points = history
                .into_iter()
                .map(|m| MetricPoint { value: m.value, timestamp: m.timestamp, step: m.step })
                .collect();
            metrics.insert(metric.key.clone(), points);
        }

        let mut artifacts = Vec::new();
        self.copy_artifacts(run_id, None, dir, &mut artifacts)?;
        let notebook_formats = self.export_notebooks(&run, dir)?;

        let export = RunExport {
            info: ExportInfo::new(ObjectType::Run, run_id.as_ref(), self.client.host()),
            run: RunRecord {
                run_id: run.info.run_id.clone(),
                experiment_id: run.info.experiment_id.clone(),
                status: run.info.status,
                lifecycle_stage: run.info.lifecycle_stage,
                user_id: run.info.user_id.clone(),
                start_time: run.info.start_time,
                end_time: run.info.end_time,
                params: run.data.params.iter().map(|p| (p.key.clone(), p.value.clone())).collect(),
                metrics,
                tags: run.data.tags.iter().map(|t| (t.key.clone(), t.value.clone())).collect(),
                artifacts,
                notebook_formats,
            },
        };
        export.write(dir)?;
        info!(run_id = %run_id, dir = %dir.display(), artifacts = export.run.artifacts.len(), "exported run");
        Ok(export)
    }

    fn copy_artifacts(&self, run_id: &RunId, path: Option<&str>, dir: &Path, copied: &mut Vec<ArtifactEntry>) -> Result<()> {
        let listing = self.client.list_artifacts(run_id, path)?;
        for entry in listing {
            if entry.is_dir {
                self.copy_artifacts(run_id, Some(&entry.path), dir, copied)?;
                continue;
            }
            let target = artifact_file(dir, &entry.path)?;
            let size = with_retry(&self.options.retry, &entry.path, || {
                let mut file = File::create(&target)
                    .with_context(|| format!("creating {}", target.display()))?;
                self.client.download_artifact(run_id, &entry.path, &mut file)
            })?;
            debug!(run_id = %run_id, path = %entry.path, size, "downloaded artifact");
            copied.push(ArtifactEntry { path: entry.path, file_size: size });
        }
        Ok(())
    }

    fn export_notebooks(&self, run: &Run, dir: &Path) -> Result<Vec<NotebookFormat>> {
        let mut written = Vec::new();
        if self.options.notebook_formats.is_empty() {
            return Ok(written);
        }
        let path = match notebook_path(run) {
            Some(path) => path,
            None => return Ok(written),
        };
        for &format in &self.options.notebook_formats {
            match self.notebooks.export_notebook(path, format) {
                Ok(Some(bytes)) => {
                    let file = notebook_file(dir, format);
                    if let Some(parent) = file.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&file, bytes)?;
                    written.push(format);
                }
                Ok(None) => warn!(notebook = %path, format = %format, "notebook not available in format"),
                Err(error) => warn!(notebook = %path, format = %format, error = %error, "notebook export failed"),
            }
        }
        Ok(written)
    }
}

fn notebook_path(run: &Run) -> Option<&str> {
    if let Some(path) = run.tag(tags::DATABRICKS_NOTEBOOK_PATH) {
        return Some(path);
    }
    match run.tag(tags::SOURCE_TYPE) {
        Some("NOTEBOOK") => run.tag(tags::SOURCE_NAME),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunImportOptions {
    /// Replay the source `mlflow.user` tag instead of stamping the importing user.
    pub use_src_user_id: bool,
    /// Importing principal written to `mlflow.user`.
    pub user: String,
    pub retry: RetryPolicy,
}

impl Default for RunImportOptions {
    fn default() -> Self {
        RunImportOptions {
            use_src_user_id: false,
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_owned()),
            retry: RetryPolicy::default(),
        }
    }
}

/// A run created at the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunImport {
    pub source_run_id: RunId,
    pub run_id: RunId,
    pub artifact_uri: String,
}

pub struct RunImporter<'a, C: ?Sized> {
    client: &'a C,
    options: RunImportOptions,
}

impl<'a, C: Client + ?Sized> RunImporter<'a, C> {
    pub fn new(client: &'a C, options: RunImportOptions) -> Self {
        RunImporter { client, options }
    }

    pub fn import_run(&self, dir: &Path, experiment_id: &ExperimentId) -> Result<RunImport> {
        let export = RunExport::read(dir)?;
        let record = &export.run;
        let run_tags = import_tags(&export, &self.options);

        let run = self.client.create_run(experiment_id, record.start_time, &run_tags)?;
        let run_id = run.info.run_id.clone();
        if let Err(error) = self.replay(dir, record, &run_id) {
            // leave the partial run recognizable
            if let Err(mark_error) = self.client.update_run(&run_id, RunStatus::Failed, Some(crate::timestamp())) {
                warn!(run_id = %run_id, error = %mark_error, "could not mark partially imported run as failed");
            }
            return Err(error);
        }
        self.client.update_run(&run_id, record.status, record.end_time)?;

        info!(source_run_id = %record.run_id, run_id = %run_id, experiment_id = %experiment_id, "imported run");
        Ok(RunImport {
            source_run_id: record.run_id.clone(),
            run_id,
            artifact_uri: run.info.artifact_uri,
        })
    }

    fn replay(&self, dir: &Path, record: &RunRecord, run_id: &RunId) -> Result<()> {
        for (key, value) in &record.params {
            self.client.log_param(run_id, key, value)?;
        }
        for (key, history) in &record.metrics {
            for point in history {
                self.client.log_metric(run_id, key, point.value, point.timestamp, point.step)?;
            }
        }
        for entry in list_local_artifacts(dir)? {
            let local = artifact_file(dir, &entry.path)?;
            with_retry(&self.options.retry, &entry.path, || {
                let mut file = File::open(&local)
                    .with_context(|| format!("opening {}", local.display()))?;
                self.client.upload_artifact(run_id, &entry.path, &mut file)
            })?;
            debug!(run_id = %run_id, path = %entry.path, "uploaded artifact");
        }
        Ok(())
    }
}

/// Source tags with provenance stamps, honoring the user policy.
fn import_tags(export: &RunExport, options: &RunImportOptions) -> Vec<RunTag> {
    let mut run_tags: BTreeMap<String, String> = export
        .run
        .tags
        .iter()
        .filter(|(key, _)| !tags::is_reserved(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if !options.use_src_user_id {
        run_tags.insert(tags::USER.to_owned(), options.user.clone());
    } else if let Some(user) = &export.run.user_id {
        run_tags.entry(tags::USER.to_owned()).or_insert_with(|| user.clone());
    }
    for (key, value) in export.info.provenance().tags() {
        run_tags.insert(key.to_owned(), value);
    }
    run_tags.into_iter().map(|(key, value)| RunTag { key, value }).collect()
}

pub(crate) fn with_retry<T>(policy: &RetryPolicy, path: &str, mut op: impl FnMut() -> Result<T, StorageError>) -> Result<T> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(cause) if attempt >= attempts => {
                return Err(Error::ArtifactCopy { path: path.to_owned(), attempts, cause });
            }
            Err(cause) => {
                warn!(path = %path, attempt, error = %cause, "artifact copy failed, retrying");
                attempt += 1;
                thread::sleep(policy.delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::client::LifecycleStage, format::ObjectType};
    use std::{cell::Cell, time::Duration};

    fn export_with_tags(tags: &[(&str, &str)]) -> RunExport {
        RunExport {
            info: ExportInfo::at(ObjectType::Run, "src-run", "http://src", 42),
            run: RunRecord {
                run_id: "src-run".into(),
                experiment_id: "1".into(),
                status: RunStatus::Finished,
                lifecycle_stage: LifecycleStage::Active,
                user_id: Some("alice".into()),
                start_time: 0,
                end_time: None,
                params: BTreeMap::new(),
                metrics: BTreeMap::new(),
                tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                artifacts: vec![],
                notebook_formats: vec![],
            },
        }
    }

    fn tag<'t>(tags: &'t [RunTag], key: &str) -> Option<&'t str> {
        tags.iter().find(|t| t.key == key).map(|t| t.value.as_str())
    }

    #[test]
    fn importing_user_replaces_creator_by_default() {
        let export = export_with_tags(&[(tags::USER, "alice"), ("my_tag", "my_val")]);
        let options = RunImportOptions { user: "bob".into(), ..RunImportOptions::default() };
        let tags = import_tags(&export, &options);
        assert_eq!(tag(&tags, tags::USER), Some("bob"));
        assert_eq!(tag(&tags, "my_tag"), Some("my_val"));
        assert_eq!(tag(&tags, tags::SOURCE_ID), Some("src-run"));
        assert_eq!(tag(&tags, tags::EXPORT_TIME), Some("42"));
    }

    #[test]
    fn source_user_kept_on_request() {
        let export = export_with_tags(&[(tags::USER, "alice")]);
        let options = RunImportOptions { use_src_user_id: true, user: "bob".into(), ..RunImportOptions::default() };
        assert_eq!(tag(&import_tags(&export, &options), tags::USER), Some("alice"));
    }

    #[test]
    fn stale_provenance_is_replaced() {
        let export = export_with_tags(&[(tags::SOURCE_ID, "older-run")]);
        let tags = import_tags(&export, &RunImportOptions::default());
        assert_eq!(tags.iter().filter(|t| t.key == tags::SOURCE_ID).count(), 1);
        assert_eq!(tag(&tags, tags::SOURCE_ID), Some("src-run"));
    }

    #[test]
    fn retry_is_bounded() {
        let policy = RetryPolicy { attempts: 3, delay: Duration::from_millis(0) };
        let calls = Cell::new(0);
        let result: Result<()> = with_retry(&policy, "model/model.pkl", || {
            calls.set(calls.get() + 1);
            Err(anyhow::anyhow!("connection reset"))
        });
        assert_eq!(calls.get(), 3);
        assert!(matches!(result, Err(Error::ArtifactCopy { attempts: 3, .. })));

        let calls = Cell::new(0);
        let result = with_retry(&policy, "x", || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 { Err(anyhow::anyhow!("flaky")) } else { Ok(7) }
        });
        assert_eq!(result.unwrap(), 7);
    }
}
