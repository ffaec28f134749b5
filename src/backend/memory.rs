//! In-process tracking server.
//!
//! Keeps experiments, runs, artifacts and the model registry in memory behind a
//! single lock. Used as the destination and source in tests and demos; it also
//! injects the failures a real server produces: broken artifact transfers and
//! model versions that stay pending for a while.

use anyhow::anyhow;
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, BTreeSet},
    hash::{Hash, Hasher},
    io::{Read, Write},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    api::{
        artifact::FileInfo,
        client::{Client, LifecycleStage, ViewType},
        error::{CreateError, DeleteError, GetError, StorageError, UpdateError},
        experiment::{Experiment, ExperimentTag},
        model::{ModelTag, ModelVersion, ModelVersionStatus, RegisteredModel, Stage},
        notebook::{NotebookFormat, NotebookSource},
        run::{Metric, Param, Run, RunData, RunInfo, RunStatus, RunTag},
        search::{PageToken, Search},
    },
    tags, timestamp, ExperimentId, RunId,
};

pub struct InMemory {
    host: String,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    experiments: BTreeMap<ExperimentId, Experiment>,
    runs: BTreeMap<RunId, StoredRun>,
    models: BTreeMap<String, StoredModel>,
    notebooks: BTreeMap<(String, NotebookFormat), Vec<u8>>,
    failing_artifacts: BTreeSet<String>,
    registration_polls: u32,
    mutations: usize,
}

struct StoredRun {
    run: Run,
    history: BTreeMap<String, Vec<Metric>>,
    artifacts: BTreeMap<String, Vec<u8>>,
}

struct StoredModel {
    model: RegisteredModel,
    next_version: u64,
    versions: BTreeMap<u64, StoredVersion>,
}

struct StoredVersion {
    version: ModelVersion,
    pending_polls: u32,
}

impl InMemory {
    /// `host` is reported as the tracking URI in provenance tags.
    pub fn new(host: impl Into<String>) -> Self {
        InMemory {
            host: host.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Every download and upload of an artifact at `path` fails, for any run.
    pub fn fail_artifact(&self, path: impl Into<String>) {
        self.state().failing_artifacts.insert(path.into());
    }

    /// New model versions answer `PENDING_REGISTRATION` to this many polls before turning ready.
    pub fn set_registration_delay(&self, polls: u32) {
        self.state().registration_polls = polls;
    }

    pub fn add_notebook(&self, path: impl Into<String>, format: NotebookFormat, bytes: impl Into<Vec<u8>>) {
        self.state().notebooks.insert((path.into(), format), bytes.into());
    }

    /// Number of successful mutating calls so far.
    pub fn mutations(&self) -> usize {
        self.state().mutations
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn run(&self, id: &RunId) -> Result<&StoredRun, GetError> {
        self.runs.get(id).ok_or_else(|| GetError::DoesNotExist(id.to_string()))
    }

    fn run_mut(&mut self, id: &RunId) -> Result<&mut StoredRun, GetError> {
        self.runs.get_mut(id).ok_or_else(|| GetError::DoesNotExist(id.to_string()))
    }

    fn model_mut(&mut self, name: &str) -> Result<&mut StoredModel, GetError> {
        self.models.get_mut(name).ok_or_else(|| GetError::DoesNotExist(name.to_owned()))
    }

    fn version_mut(&mut self, name: &str, version: &str) -> Result<&mut StoredVersion, GetError> {
        let missing = || GetError::DoesNotExist(format!("{}/{}", name, version));
        let number: u64 = version.parse().map_err(|_| missing())?;
        self.model_mut(name)?.versions.get_mut(&number).ok_or_else(missing)
    }

    fn active_run(&mut self, id: &RunId) -> Result<&mut StoredRun, StorageError> {
        let stored = self.run_mut(id)?;
        if stored.run.info.lifecycle_stage != LifecycleStage::Active {
            return Err(anyhow!("run {} is deleted", id));
        }
        Ok(stored)
    }

    fn check_artifact(&self, path: &str) -> Result<(), StorageError> {
        if self.failing_artifacts.contains(path) {
            return Err(anyhow!("simulated transfer failure for artifact '{}'", path));
        }
        Ok(())
    }
}

fn run_id(host: &str, n: u64) -> RunId {
    let mut hasher = DefaultHasher::new();
    (host, n).hash(&mut hasher);
    RunId::from(format!("{:016x}{:016x}", hasher.finish(), n))
}

fn set_run_tag(run_tags: &mut Vec<RunTag>, key: &str, value: &str) {
    match run_tags.iter_mut().find(|t| t.key == key) {
        Some(tag) => tag.value = value.to_owned(),
        None => run_tags.push(RunTag::new(key, value)),
    }
}

fn set_model_tag(model_tags: &mut Vec<ModelTag>, key: &str, value: &str) {
    match model_tags.iter_mut().find(|t| t.key == key) {
        Some(tag) => tag.value = value.to_owned(),
        None => model_tags.push(ModelTag::new(key, value)),
    }
}

/// Conditions of a run search: `params.k = 'v'`, `tags.k = 'v'` or
/// `attributes.status = 'FINISHED'`, joined with `and`.
#[derive(Debug, PartialEq)]
enum Condition {
    Param(String, String),
    Tag(String, String),
    Status(String),
}

fn parse_filter(filter: &str) -> Result<Vec<Condition>, StorageError> {
    let mut conditions = Vec::new();
    if filter.trim().is_empty() {
        return Ok(conditions);
    }
    for clause in split_and(filter) {
        let (lhs, rhs) = clause
            .split_once('=')
            .ok_or_else(|| anyhow!("unsupported filter clause '{}'", clause))?;
        let value = unquote(rhs.trim(), '\'').ok_or_else(|| anyhow!("filter value must be quoted: '{}'", clause))?;
        let (kind, key) = lhs
            .trim()
            .split_once('.')
            .ok_or_else(|| anyhow!("unsupported filter key '{}'", lhs.trim()))?;
        let key = unquote(key, '"').or_else(|| unquote(key, '`')).unwrap_or(key).to_owned();
        let condition = match kind {
            "params" | "param" => Condition::Param(key, value.to_owned()),
            "tags" | "tag" => Condition::Tag(key, value.to_owned()),
            "attributes" | "attribute" if key == "status" => Condition::Status(value.to_owned()),
            _ => return Err(anyhow!("unsupported filter key '{}'", lhs.trim())),
        };
        conditions.push(condition);
    }
    Ok(conditions)
}

fn split_and(filter: &str) -> Vec<&str> {
    let mut clauses = Vec::new();
    let lower = filter.to_ascii_lowercase();
    let mut start = 0;
    while let Some(offset) = lower[start..].find(" and ") {
        clauses.push(filter[start..start + offset].trim());
        start += offset + " and ".len();
    }
    clauses.push(filter[start..].trim());
    clauses
}

fn unquote(s: &str, quote: char) -> Option<&str> {
    s.strip_prefix(quote)?.strip_suffix(quote)
}

fn run_matches(run: &Run, conditions: &[Condition]) -> bool {
    conditions.iter().all(|condition| match condition {
        Condition::Param(key, value) => run.data.params.iter().any(|p| &p.key == key && &p.value == value),
        Condition::Tag(key, value) => run.tag(key) == Some(value.as_str()),
        Condition::Status(status) => run.info.status.to_string().eq_ignore_ascii_case(status),
    })
}

fn name_filter(filter: Option<&str>) -> Result<Option<String>, StorageError> {
    let filter = match filter.map(str::trim).filter(|f| !f.is_empty()) {
        Some(filter) => filter,
        None => return Ok(None),
    };
    let value = filter
        .split_once('=')
        .filter(|(lhs, _)| lhs.trim() == "name")
        .and_then(|(_, rhs)| unquote(rhs.trim(), '\''))
        .ok_or_else(|| anyhow!("unsupported filter '{}'", filter))?;
    Ok(Some(value.to_owned()))
}

fn latest_versions(versions: &BTreeMap<u64, StoredVersion>) -> Vec<ModelVersion> {
    let mut latest: BTreeMap<Stage, &ModelVersion> = BTreeMap::new();
    for stored in versions.values() {
        latest.insert(stored.version.current_stage, &stored.version);
    }
    latest.into_values().cloned().collect()
}

impl Client for InMemory {
    fn host(&self) -> &str {
        &self.host
    }

    fn create_experiment(&self, name: &str, tags: &[ExperimentTag]) -> Result<ExperimentId, CreateError> {
        let mut state = self.state();
        if state.experiments.values().any(|e| e.name == name) {
            return Err(CreateError::AlreadyExists(name.to_owned()));
        }
        let id = ExperimentId::from(state.next_id().to_string());
        let now = timestamp();
        state.experiments.insert(
            id.clone(),
            Experiment {
                experiment_id: id.clone(),
                name: name.to_owned(),
                artifact_location: format!("mlflow-artifacts:/{}", id),
                lifecycle_stage: LifecycleStage::Active,
                last_update_time: Some(now),
                creation_time: Some(now),
                tags: tags.to_vec(),
            },
        );
        state.mutations += 1;
        Ok(id)
    }

    fn search_experiments(&self, view_type: ViewType, filter: Option<&str>) -> Result<Vec<Experiment>, StorageError> {
        let name = name_filter(filter)?;
        let state = self.state();
        Ok(state
            .experiments
            .values()
            .filter(|e| view_type.includes(e.lifecycle_stage))
            .filter(|e| name.as_ref().map_or(true, |name| &e.name == name))
            .cloned()
            .collect())
    }

    fn get_experiment(&self, id: &ExperimentId) -> Result<Experiment, GetError> {
        self.state()
            .experiments
            .get(id)
            .cloned()
            .ok_or_else(|| GetError::DoesNotExist(id.to_string()))
    }

    fn get_experiment_by_name(&self, name: &str) -> Result<Experiment, GetError> {
        self.state()
            .experiments
            .values()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| GetError::DoesNotExist(name.to_owned()))
    }

    fn set_experiment_tag(&self, id: &ExperimentId, key: &str, value: &str) -> Result<(), UpdateError> {
        let mut state = self.state();
        let experiment = state
            .experiments
            .get_mut(id)
            .ok_or_else(|| GetError::DoesNotExist(id.to_string()))?;
        match experiment.tags.iter_mut().find(|t| t.key == key) {
            Some(tag) => tag.value = value.to_owned(),
            None => experiment.tags.push(ExperimentTag { key: key.to_owned(), value: value.to_owned() }),
        }
        state.mutations += 1;
        Ok(())
    }

    fn delete_experiment(&self, id: &ExperimentId) -> Result<(), DeleteError> {
        let mut state = self.state();
        let experiment = state
            .experiments
            .get_mut(id)
            .ok_or_else(|| GetError::DoesNotExist(id.to_string()))?;
        experiment.lifecycle_stage = LifecycleStage::Deleted;
        for stored in state.runs.values_mut().filter(|r| &r.run.info.experiment_id == id) {
            stored.run.info.lifecycle_stage = LifecycleStage::Deleted;
        }
        state.mutations += 1;
        Ok(())
    }

    fn create_run(&self, experiment: &ExperimentId, start_time: i64, run_tags: &[RunTag]) -> Result<Run, StorageError> {
        let mut state = self.state();
        match state.experiments.get(experiment) {
            Some(e) if e.lifecycle_stage == LifecycleStage::Active => {}
            Some(_) => return Err(anyhow!("experiment {} is deleted", experiment)),
            None => return Err(GetError::DoesNotExist(experiment.to_string()).into()),
        }
        let n = state.next_id();
        let id = run_id(&self.host, n);
        let user_id = run_tags.iter().find(|t| t.key == tags::USER).map(|t| t.value.clone());
        let run = Run {
            info: RunInfo {
                run_id: id.clone(),
                experiment_id: experiment.clone(),
                user_id,
                status: RunStatus::Running,
                start_time,
                end_time: None,
                artifact_uri: format!("mlflow-artifacts:/{}/{}/artifacts", experiment, id),
                lifecycle_stage: LifecycleStage::Active,
            },
            data: RunData {
                metrics: vec![],
                params: vec![],
                tags: run_tags.to_vec(),
            },
        };
        state.runs.insert(
            id,
            StoredRun {
                run: run.clone(),
                history: BTreeMap::new(),
                artifacts: BTreeMap::new(),
            },
        );
        state.mutations += 1;
        Ok(run)
    }

    fn get_run(&self, id: &RunId) -> Result<Run, GetError> {
        Ok(self.state().run(id)?.run.clone())
    }

    fn update_run(&self, id: &RunId, status: RunStatus, end_time: Option<i64>) -> Result<RunInfo, UpdateError> {
        let mut state = self.state();
        let stored = state.run_mut(id)?;
        stored.run.info.status = status;
        if end_time.is_some() {
            stored.run.info.end_time = end_time;
        }
        let info = stored.run.info.clone();
        state.mutations += 1;
        Ok(info)
    }

    fn search_runs(&self, experiment_ids: &[&ExperimentId], filter: &str, run_view_type: ViewType, max_results: i32, page_token: Option<&PageToken>) -> Result<Search, StorageError> {
        let conditions = parse_filter(filter)?;
        let offset: usize = match page_token {
            Some(token) => token.as_ref().parse().map_err(|_| anyhow!("invalid page token '{}'", token.as_ref()))?,
            None => 0,
        };
        let state = self.state();
        let matching: Vec<&Run> = state
            .runs
            .values()
            .map(|stored| &stored.run)
            .filter(|run| experiment_ids.contains(&&run.info.experiment_id))
            .filter(|run| run_view_type.includes(run.info.lifecycle_stage))
            .filter(|run| run_matches(run, &conditions))
            .collect();
        let page_size = max_results.max(1) as usize;
        let runs: Vec<Run> = matching.iter().skip(offset).take(page_size).map(|run| (*run).clone()).collect();
        let next = offset + runs.len();
        Ok(Search {
            runs,
            next_page_token: (next < matching.len()).then(|| PageToken::from(next.to_string())),
        })
    }

    fn get_metric_history(&self, run: &RunId, metric: &str) -> Result<Vec<Metric>, GetError> {
        let state = self.state();
        Ok(state.run(run)?.history.get(metric).cloned().unwrap_or_default())
    }

    fn log_param(&self, run: &RunId, key: &str, value: &str) -> Result<(), StorageError> {
        let mut state = self.state();
        let params = &mut state.active_run(run)?.run.data.params;
        match params.iter().find(|p| p.key == key) {
            Some(existing) if existing.value != value => {
                return Err(anyhow!("param '{}' of run {} is immutable", key, run));
            }
            Some(_) => {}
            None => params.push(Param { key: key.to_owned(), value: value.to_owned() }),
        }
        state.mutations += 1;
        Ok(())
    }

    fn log_metric(&self, run: &RunId, key: &str, value: f64, timestamp: i64, step: i64) -> Result<(), StorageError> {
        let mut state = self.state();
        let stored = state.active_run(run)?;
        let metric = Metric { key: key.to_owned(), value, timestamp, step };
        stored.history.entry(key.to_owned()).or_default().push(metric.clone());
        match stored.run.data.metrics.iter_mut().find(|m| m.key == key) {
            Some(latest) if (latest.step, latest.timestamp) <= (step, timestamp) => *latest = metric,
            Some(_) => {}
            None => stored.run.data.metrics.push(metric),
        }
        state.mutations += 1;
        Ok(())
    }

    fn set_tag(&self, run: &RunId, key: &str, value: &str) -> Result<(), StorageError> {
        let mut state = self.state();
        set_run_tag(&mut state.active_run(run)?.run.data.tags, key, value);
        state.mutations += 1;
        Ok(())
    }

    fn list_artifacts(&self, run: &RunId, path: Option<&str>) -> Result<Vec<FileInfo>, StorageError> {
        let state = self.state();
        let stored = state.run(run)?;
        let prefix = match path.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            Some(path) => format!("{}/", path),
            None => String::new(),
        };
        let mut entries: BTreeMap<String, FileInfo> = BTreeMap::new();
        for (key, bytes) in stored.artifacts.range(prefix.clone()..) {
            let rest = match key.strip_prefix(&prefix) {
                Some(rest) => rest,
                None => break,
            };
            let entry = match rest.split_once('/') {
                Some((dir, _)) => FileInfo { path: format!("{}{}", prefix, dir), is_dir: true, file_size: None },
                None => FileInfo { path: key.clone(), is_dir: false, file_size: Some(bytes.len() as i64) },
            };
            entries.entry(entry.path.clone()).or_insert(entry);
        }
        Ok(entries.into_values().collect())
    }

    fn download_artifact(&self, run: &RunId, path: &str, sink: &mut dyn Write) -> Result<u64, StorageError> {
        let state = self.state();
        state.check_artifact(path)?;
        let bytes = state
            .run(run)?
            .artifacts
            .get(path)
            .ok_or_else(|| anyhow!("artifact '{}' of run {} does not exist", path, run))?;
        sink.write_all(bytes)?;
        Ok(bytes.len() as u64)
    }

    fn upload_artifact(&self, run: &RunId, path: &str, source: &mut dyn Read) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes)?;
        let mut state = self.state();
        state.check_artifact(path)?;
        state.active_run(run)?.artifacts.insert(path.trim_matches('/').to_owned(), bytes);
        state.mutations += 1;
        Ok(())
    }

    fn create_registered_model(&self, name: &str, description: &str, tags: &[ModelTag]) -> Result<RegisteredModel, CreateError> {
        let mut state = self.state();
        if state.models.contains_key(name) {
            return Err(CreateError::AlreadyExists(name.to_owned()));
        }
        let now = timestamp();
        let model = RegisteredModel {
            name: name.to_owned(),
            creation_timestamp: Some(now),
            last_updated_timestamp: Some(now),
            description: description.to_owned(),
            latest_versions: vec![],
            tags: tags.to_vec(),
        };
        state.models.insert(
            name.to_owned(),
            StoredModel { model: model.clone(), next_version: 1, versions: BTreeMap::new() },
        );
        state.mutations += 1;
        Ok(model)
    }

    fn get_registered_model(&self, name: &str) -> Result<RegisteredModel, GetError> {
        let state = self.state();
        let stored = state.models.get(name).ok_or_else(|| GetError::DoesNotExist(name.to_owned()))?;
        Ok(RegisteredModel {
            latest_versions: latest_versions(&stored.versions),
            ..stored.model.clone()
        })
    }

    fn delete_registered_model(&self, name: &str) -> Result<(), DeleteError> {
        let mut state = self.state();
        state.models.remove(name).ok_or_else(|| GetError::DoesNotExist(name.to_owned()))?;
        state.mutations += 1;
        Ok(())
    }

    fn search_registered_models(&self, filter: Option<&str>) -> Result<Vec<RegisteredModel>, StorageError> {
        let name = name_filter(filter)?;
        let state = self.state();
        Ok(state
            .models
            .values()
            .filter(|m| name.as_ref().map_or(true, |name| &m.model.name == name))
            .map(|m| RegisteredModel { latest_versions: latest_versions(&m.versions), ..m.model.clone() })
            .collect())
    }

    fn set_registered_model_tag(&self, name: &str, key: &str, value: &str) -> Result<(), UpdateError> {
        let mut state = self.state();
        set_model_tag(&mut state.model_mut(name)?.model.tags, key, value);
        state.mutations += 1;
        Ok(())
    }

    fn create_model_version(&self, name: &str, source: &str, run_id: Option<&RunId>, description: &str, tags: &[ModelTag]) -> Result<ModelVersion, StorageError> {
        let mut state = self.state();
        if let Some(run_id) = run_id {
            state.active_run(run_id)?;
        }
        let pending_polls = state.registration_polls;
        let stored = state.model_mut(name)?;
        let number = stored.next_version;
        stored.next_version += 1;
        let version = ModelVersion {
            name: name.to_owned(),
            version: number.to_string(),
            creation_timestamp: Some(timestamp()),
            current_stage: Stage::None,
            description: description.to_owned(),
            source: source.to_owned(),
            run_id: run_id.cloned(),
            status: if pending_polls > 0 { ModelVersionStatus::PendingRegistration } else { ModelVersionStatus::Ready },
            tags: tags.to_vec(),
        };
        stored.versions.insert(number, StoredVersion { version: version.clone(), pending_polls });
        state.mutations += 1;
        Ok(version)
    }

    fn get_model_version(&self, name: &str, version: &str) -> Result<ModelVersion, GetError> {
        let mut state = self.state();
        let stored = state.version_mut(name, version)?;
        if stored.pending_polls > 0 {
            stored.pending_polls -= 1;
            if stored.pending_polls == 0 {
                stored.version.status = ModelVersionStatus::Ready;
            }
            let mut pending = stored.version.clone();
            pending.status = ModelVersionStatus::PendingRegistration;
            return Ok(pending);
        }
        Ok(stored.version.clone())
    }

    fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>, StorageError> {
        let state = self.state();
        Ok(state
            .models
            .get(name)
            .map(|m| m.versions.values().map(|v| v.version.clone()).collect())
            .unwrap_or_default())
    }

    fn transition_model_version_stage(&self, name: &str, version: &str, stage: Stage, archive_existing: bool) -> Result<ModelVersion, UpdateError> {
        let mut state = self.state();
        state.version_mut(name, version)?.version.current_stage = stage;
        if archive_existing && matches!(stage, Stage::Staging | Stage::Production) {
            let stored = state.model_mut(name)?;
            for other in stored.versions.values_mut().filter(|v| v.version.version != version) {
                if other.version.current_stage == stage {
                    other.version.current_stage = Stage::Archived;
                }
            }
        }
        let transitioned = state.version_mut(name, version)?.version.clone();
        state.mutations += 1;
        Ok(transitioned)
    }

    fn set_model_version_tag(&self, name: &str, version: &str, key: &str, value: &str) -> Result<(), UpdateError> {
        let mut state = self.state();
        set_model_tag(&mut state.version_mut(name, version)?.version.tags, key, value);
        state.mutations += 1;
        Ok(())
    }
}

impl NotebookSource for InMemory {
    fn export_notebook(&self, path: &str, format: NotebookFormat) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.state().notebooks.get(&(path.to_owned(), format)).cloned())
    }
}
