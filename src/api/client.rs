use crate::api::{artifact::*, error::*, experiment::*, id::*, model::*, run::*, search::*};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewType {
    #[serde(rename = "ACTIVE_ONLY")]
    Active,
    #[serde(rename = "DELETED_ONLY")]
    Deleted,
    #[serde(rename = "ALL")]
    All,
}

impl ViewType {
    pub fn includes(self, stage: LifecycleStage) -> bool {
        match self {
            ViewType::Active => stage == LifecycleStage::Active,
            ViewType::Deleted => stage == LifecycleStage::Deleted,
            ViewType::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStage {
    Active,
    Deleted,
}

/// Capabilities of a tracking server used by the exporters and importers.
///
/// Implementations must tolerate concurrent calls; the bulk functions share one
/// client between worker threads.
#[rustfmt::skip]
pub trait Client {
    /// Tracking URI recorded in provenance tags.
    fn host(&self) -> &str;

    fn create_experiment(&self, name: &str, tags: &[ExperimentTag]) -> Result<ExperimentId, CreateError>;
    fn search_experiments(&self, view_type: ViewType, filter: Option<&str>) -> Result<Vec<Experiment>, StorageError>;
    fn get_experiment(&self, id: &ExperimentId) -> Result<Experiment, GetError>;
    fn get_experiment_by_name(&self, name: &str) -> Result<Experiment, GetError>;
    fn set_experiment_tag(&self, id: &ExperimentId, key: &str, value: &str) -> Result<(), UpdateError>;
    fn delete_experiment(&self, id: &ExperimentId) -> Result<(), DeleteError>;

    fn create_run(&self, experiment: &ExperimentId, start_time: i64, tags: &[RunTag]) -> Result<Run, StorageError>;
    fn get_run(&self, id: &RunId) -> Result<Run, GetError>;
    fn update_run(&self, id: &RunId, status: RunStatus, end_time: Option<i64>) -> Result<RunInfo, UpdateError>;
    fn search_runs(&self, experiment_ids: &[&ExperimentId], filter: &str, run_view_type: ViewType, max_results: i32, page_token: Option<&PageToken>) -> Result<Search, StorageError>;
    fn get_metric_history(&self, run: &RunId, metric: &str) -> Result<Vec<Metric>, GetError>;
    fn log_param(&self, run: &RunId, key: &str, value: &str) -> Result<(), StorageError>;
    fn log_metric(&self, run: &RunId, key: &str, value: f64, timestamp: i64, step: i64) -> Result<(), StorageError>;
    fn set_tag(&self, run: &RunId, key: &str, value: &str) -> Result<(), StorageError>;

    /// Direct children of `path` (the artifact root when `None`).
    fn list_artifacts(&self, run: &RunId, path: Option<&str>) -> Result<Vec<FileInfo>, StorageError>;
    fn download_artifact(&self, run: &RunId, path: &str, sink: &mut dyn Write) -> Result<u64, StorageError>;
    fn upload_artifact(&self, run: &RunId, path: &str, source: &mut dyn Read) -> Result<(), StorageError>;

    fn create_registered_model(&self, name: &str, description: &str, tags: &[ModelTag]) -> Result<RegisteredModel, CreateError>;
    fn get_registered_model(&self, name: &str) -> Result<RegisteredModel, GetError>;
    fn delete_registered_model(&self, name: &str) -> Result<(), DeleteError>;
    fn search_registered_models(&self, filter: Option<&str>) -> Result<Vec<RegisteredModel>, StorageError>;
    fn set_registered_model_tag(&self, name: &str, key: &str, value: &str) -> Result<(), UpdateError>;

    fn create_model_version(&self, name: &str, source: &str, run_id: Option<&RunId>, description: &str, tags: &[ModelTag]) -> Result<ModelVersion, StorageError>;
    fn get_model_version(&self, name: &str, version: &str) -> Result<ModelVersion, GetError>;
    /// All versions of the model, regardless of stage.
    fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>, StorageError>;
    fn transition_model_version_stage(&self, name: &str, version: &str, stage: Stage, archive_existing: bool) -> Result<ModelVersion, UpdateError>;
    fn set_model_version_tag(&self, name: &str, version: &str, key: &str, value: &str) -> Result<(), UpdateError>;
}

/// Iterates all pages of a run search.
pub fn search_all_runs<C: Client + ?Sized>(client: &C, experiment_ids: &[&ExperimentId], filter: &str, run_view_type: ViewType) -> Result<Vec<Run>, StorageError> {
    let mut runs = Vec::new();
    let mut page_token: Option<PageToken> = None;
    loop {
        let page = client.search_runs(experiment_ids, filter, run_view_type, MAX_RESULTS, page_token.as_ref())?;
        runs.extend(page.runs);
        match page.next_page_token {
            Some(token) if !token.as_ref().is_empty() => page_token = Some(token),
            _ => return Ok(runs),
        }
    }
}
