//! Export of a registered model's versions together with their backing runs,
//! and replay against a destination model.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    thread,
};
use tracing::{debug, info, warn};

use crate::{
    api::{
        client::{Client, LifecycleStage, ViewType},
        error::GetError,
        model::{ModelTag, ModelVersion, ModelVersionStatus, Stage},
        notebook::NotebookSource,
    },
    config::{OnConflict, PollPolicy},
    error::{Error, Result},
    experiment::{imported_runs, ExperimentExportOptions, ExperimentExporter, ExperimentImportOptions, ExperimentImporter},
    format::{
        experiment::ExperimentExport,
        model::{experiment_dir, nested_run_dir, Backing, ModelExport, ModelFilter, ModelRecord, VersionRecord},
        ExportInfo, ObjectType,
    },
    report::Failure,
    run::{RunExporter, RunImportOptions, RunImporter},
    tags::{self, splice_raw_source, SourceReference},
    ExperimentId, RunId,
};

/// Which versions of a model to export. Stages and versions exclude each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSelection {
    stages: Option<BTreeSet<Stage>>,
    versions: Option<BTreeSet<String>>,
}

impl VersionSelection {
    pub fn all() -> Self {
        VersionSelection::default()
    }

    /// Empty sets count as absent.
    pub fn new(stages: Option<BTreeSet<Stage>>, versions: Option<BTreeSet<String>>) -> Result<Self> {
        let stages = stages.filter(|s| !s.is_empty());
        let versions = versions.filter(|v| !v.is_empty());
        if let (Some(stages), Some(versions)) = (&stages, &versions) {
            return Err(Error::ConflictingSelector {
                stages: stages.iter().map(|s| s.to_string()).collect(),
                versions: versions.iter().cloned().collect(),
            });
        }
        Ok(VersionSelection { stages, versions })
    }

    /// Parses comma-delimited selectors such as `"production,staging"` and `"1,2"`.
    pub fn parse(stages: Option<&str>, versions: Option<&str>) -> Result<Self> {
        let stages = match stages {
            Some(stages) => Some(
                split_list(stages)
                    .map(|s| s.parse::<Stage>().map_err(|e| Error::Configuration(e.to_string())))
                    .collect::<Result<BTreeSet<_>>>()?,
            ),
            None => None,
        };
        let versions = versions.map(|v| split_list(v).map(str::to_owned).collect());
        Self::new(stages, versions)
    }

    pub fn matches(&self, version: &ModelVersion) -> bool {
        if let Some(stages) = &self.stages {
            return stages.contains(&version.current_stage);
        }
        if let Some(versions) = &self.versions {
            return versions.contains(&version.version);
        }
        true
    }

    pub fn stages(&self) -> Option<&BTreeSet<Stage>> {
        self.stages.as_ref()
    }

    pub fn versions(&self) -> Option<&BTreeSet<String>> {
        self.versions.as_ref()
    }
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|part| !part.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelExportOptions {
    pub stages: Option<BTreeSet<Stage>>,
    pub versions: Option<BTreeSet<String>>,
    /// Export every run of each backing run's experiment, not only the backing runs.
    pub export_all_runs: bool,
    pub experiment: ExperimentExportOptions,
}

/// What a model export wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelExportSummary {
    pub name: String,
    pub versions: Vec<String>,
    /// Backing runs per source experiment.
    pub backing_runs: BTreeMap<ExperimentId, BTreeSet<RunId>>,
    pub failures: Vec<Failure>,
}

pub struct ModelExporter<'a, C: ?Sized> {
    client: &'a C,
    notebooks: &'a (dyn NotebookSource + Sync),
    options: ModelExportOptions,
    embed_runs: bool,
}

impl<'a, C: Client + ?Sized> ModelExporter<'a, C> {
    pub fn new(client: &'a C, notebooks: &'a (dyn NotebookSource + Sync), options: ModelExportOptions) -> Self {
        ModelExporter { client, notebooks, options, embed_runs: true }
    }

    /// Writes reference-only version records; the caller exports the backing runs
    /// listed in [`ModelExportSummary::backing_runs`] as sibling experiments.
    pub fn referencing_runs(mut self) -> Self {
        self.embed_runs = false;
        self
    }

    pub fn export_model(&self, name: &str, dir: &Path) -> Result<ModelExportSummary> {
        let selection = VersionSelection::new(self.options.stages.clone(), self.options.versions.clone())?;
        let model = self.client.get_registered_model(name)?;
        let mut versions: Vec<ModelVersion> = self
            .client
            .search_model_versions(name)?
            .into_iter()
            .filter(|version| selection.matches(version))
            .collect();
        versions.sort_by_key(|version| version_number(&version.version));

        let runs = RunExporter::new(self.client, self.notebooks, self.options.experiment.run.clone());
        let experiments = ExperimentExporter::new(self.client, self.notebooks, self.options.experiment.clone());
        let mut backing = ExportedBacking::default();
        let mut records = Vec::new();
        let mut failed_versions = Vec::new();
        let mut failures = Vec::new();

        for version in versions {
            let object = format!("model {} / version {}", name, version.version);
            match self.export_version(&version, dir, &object, &runs, &experiments, &mut backing) {
                Ok(record) => records.push(record),
                Err(failure) => {
                    warn!(model = %name, version = %version.version, error = %failure.message, "version export failed");
                    failures.push(failure);
                    failed_versions.push(version.version.clone());
                }
            }
        }
        failures.extend(backing.failures);
        let backing_runs = backing.referenced;

        let export = ModelExport {
            info: ExportInfo::new(ObjectType::RegisteredModel, name, self.client.host()),
            filter: ModelFilter {
                stages: selection.stages().cloned(),
                versions: selection.versions().cloned(),
                export_all_runs: self.options.export_all_runs,
            },
            model: ModelRecord {
                name: model.name.clone(),
                description: model.description.clone(),
                tags: model.tags.iter().map(|t| (t.key.clone(), t.value.clone())).collect(),
                versions: records,
                failed_versions,
            },
        };
        export.write(dir)?;
        let versions: Vec<String> = export.model.versions.iter().map(|v| v.version.clone()).collect();
        info!(model = %name, versions = versions.len(), failed = failures.len(), "exported model");
        Ok(ModelExportSummary {
            name: model.name,
            versions,
            backing_runs,
            failures,
        })
    }

    fn export_version(
        &self,
        version: &ModelVersion,
        dir: &Path,
        object: &str,
        runs: &RunExporter<'a, C>,
        experiments: &ExperimentExporter<'a, C>,
        backing: &mut ExportedBacking,
    ) -> Result<VersionRecord, Failure> {
        let run_id = match &version.run_id {
            Some(run_id) => run_id,
            None => return Ok(version_record(version, None, Backing::None)),
        };
        let fail = |error: Error| Failure::new(object, &error);
        let run = self.client.get_run(run_id).map_err(|error| fail(error.into()))?;
        let experiment_id = run.info.experiment_id;

        let kind = if !self.embed_runs {
            backing.referenced.entry(experiment_id).or_default().insert(run_id.clone());
            Backing::Reference
        } else if self.options.export_all_runs {
            if !backing.experiments.contains(&experiment_id) {
                let exported = self
                    .client
                    .get_experiment(&experiment_id)
                    .map_err(Error::from)
                    .and_then(|experiment| experiments.export_runs(&experiment, None, &experiment_dir(dir, &experiment_id)));
                match exported {
                    Ok(summary) => {
                        backing.runs.extend(summary.exported);
                        for (failed, failure) in summary.failed.iter().zip(&summary.failures) {
                            backing.broken_runs.insert(failed.clone(), failure.clone());
                        }
                        backing.failures.extend(summary.failures);
                    }
                    Err(error) => {
                        let failure = Failure::new(format!("experiment {}", experiment_id), &error);
                        backing.broken_experiments.insert(experiment_id.clone(), failure);
                    }
                }
                backing.experiments.insert(experiment_id.clone());
            }
            if let Some(failure) = backing.broken_experiments.get(&experiment_id) {
                return Err(dependent_failure(object, run_id, failure));
            }
            if !backing.runs.contains(run_id) && !backing.broken_runs.contains_key(run_id) {
                return Err(fail(Error::NotFound(format!("run {} in the export of experiment {}", run_id, experiment_id))));
            }
            Backing::InExperiment { experiment_id }
        } else {
            if !backing.runs.contains(run_id) && !backing.broken_runs.contains_key(run_id) {
                match runs.export_run(run_id, &nested_run_dir(dir, run_id)) {
                    Ok(_) => {
                        backing.runs.insert(run_id.clone());
                    }
                    Err(error) => {
                        let failure = fail(error);
                        backing.broken_runs.insert(run_id.clone(), failure.clone());
                        return Err(failure);
                    }
                }
            }
            Backing::Nested
        };
        if let Some(failure) = backing.broken_runs.get(run_id) {
            return Err(dependent_failure(object, run_id, failure));
        }
        Ok(version_record(version, Some(run_id), kind))
    }
}

/// Backing runs and experiments written so far during one model export.
#[derive(Default)]
struct ExportedBacking {
    runs: BTreeSet<RunId>,
    experiments: BTreeSet<ExperimentId>,
    broken_runs: BTreeMap<RunId, Failure>,
    broken_experiments: BTreeMap<ExperimentId, Failure>,
    /// Reference-only backing runs per source experiment.
    referenced: BTreeMap<ExperimentId, BTreeSet<RunId>>,
    /// Run failures inside exported backing experiments.
    failures: Vec<Failure>,
}

fn dependent_failure(object: &str, run_id: &RunId, cause: &Failure) -> Failure {
    Failure {
        object: object.to_owned(),
        kind: cause.kind,
        message: format!("backing run {} was not exported: {}", run_id, cause.message),
    }
}

fn version_record(version: &ModelVersion, run_id: Option<&RunId>, backing: Backing) -> VersionRecord {
    let reference = run_id.and_then(|run_id| match SourceReference::parse(&version.source, run_id) {
        Ok(reference) => Some(reference),
        Err(error) => {
            warn!(model = %version.name, version = %version.version, error = %error, "keeping unstructured version source");
            None
        }
    });
    VersionRecord {
        version: version.version.clone(),
        current_stage: version.current_stage,
        description: version.description.clone(),
        tags: version.tags.iter().map(|t| (t.key.clone(), t.value.clone())).collect(),
        source: version.source.clone(),
        reference,
        run_id: run_id.cloned(),
        backing,
    }
}

// versions are decimal strings; unparsable ones sort last
fn version_number(version: &str) -> (u64, String) {
    (version.parse().unwrap_or(u64::MAX), version.to_owned())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelImportOptions {
    pub on_conflict: OnConflict,
    /// Delete and recreate an existing destination model. Irreversible.
    #[serde(default)]
    pub delete_model: bool,
    /// Archive the current occupants of a stage when transitioning a version into it.
    #[serde(default)]
    pub archive_existing_versions: bool,
    /// Destination experiment for nested backing runs; the model name when absent.
    #[serde(default)]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub poll: PollPolicy,
    #[serde(default)]
    pub run: RunImportOptions,
}

impl ModelImportOptions {
    pub fn new(on_conflict: OnConflict) -> Self {
        ModelImportOptions {
            on_conflict,
            delete_model: false,
            archive_existing_versions: false,
            experiment_name: None,
            poll: PollPolicy::default(),
            run: RunImportOptions::default(),
        }
    }
}

/// Result of a model import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelImport {
    pub name: String,
    /// Source version to destination version.
    pub versions: BTreeMap<String, String>,
    /// Source versions skipped because an earlier import already created them.
    pub skipped: Vec<String>,
    pub failures: Vec<Failure>,
}

pub struct ModelImporter<'a, C: ?Sized> {
    client: &'a C,
    options: ModelImportOptions,
    run_map: BTreeMap<RunId, RunId>,
}

impl<'a, C: Client + ?Sized> ModelImporter<'a, C> {
    pub fn new(client: &'a C, options: ModelImportOptions) -> Self {
        ModelImporter { client, options, run_map: BTreeMap::new() }
    }

    /// Source to destination run ids of experiments imported beforehand,
    /// used to resolve reference-only versions.
    pub fn with_run_map(mut self, run_map: BTreeMap<RunId, RunId>) -> Self {
        self.run_map = run_map;
        self
    }

    pub fn import_model(&self, name: &str, dir: &Path) -> Result<ModelImport> {
        let export = ModelExport::read(dir)?;
        verify_filter(&export)?;
        self.destination_model(name, &export)?;

        let already: BTreeSet<String> = if self.options.on_conflict == OnConflict::Reuse {
            self.client
                .search_model_versions(name)?
                .iter()
                .filter_map(|version| version.tag(tags::SOURCE_VERSION).map(str::to_owned))
                .collect()
        } else {
            BTreeSet::new()
        };

        let mut backing = BackingRuns::new(self, name, dir);
        let mut versions = BTreeMap::new();
        let mut skipped = Vec::new();
        let mut failures = Vec::new();
        for record in &export.model.versions {
            if already.contains(&record.version) {
                info!(model = %name, version = %record.version, "version already imported, skipping");
                skipped.push(record.version.clone());
                continue;
            }
            match self.import_version(name, &export, record, &mut backing) {
                Ok(version) => {
                    versions.insert(record.version.clone(), version.version);
                }
                Err(error) => {
                    warn!(model = %name, version = %record.version, error = %error, "version import failed");
                    failures.push(Failure::new(format!("model {} / version {}", name, record.version), &error));
                }
            }
        }
        failures.extend(backing.failures);
        info!(model = %name, versions = versions.len(), skipped = skipped.len(), failed = failures.len(), "imported model");
        Ok(ModelImport { name: name.to_owned(), versions, skipped, failures })
    }

    fn destination_model(&self, name: &str, export: &ModelExport) -> Result<()> {
        let mut model_tags: Vec<ModelTag> = export
            .model
            .tags
            .iter()
            .filter(|(key, _)| !tags::is_reserved(key))
            .map(|(key, value)| ModelTag::new(key.clone(), value.clone()))
            .collect();
        model_tags.extend(export.info.provenance().tags().into_iter().map(|(key, value)| ModelTag::new(key, value)));

        match self.client.get_registered_model(name) {
            Ok(_) if self.options.delete_model => {
                warn!(model = %name, "deleting existing destination model");
                self.client.delete_registered_model(name)?;
            }
            Ok(_) => {
                match self.options.on_conflict {
                    OnConflict::Fail => return Err(Error::DestinationConflict(format!("registered model '{}'", name))),
                    OnConflict::Append => warn!(model = %name, "model exists, appending versions"),
                    OnConflict::Reuse => info!(model = %name, "reusing existing model"),
                }
                for tag in &model_tags {
                    self.client.set_registered_model_tag(name, &tag.key, &tag.value)?;
                }
                return Ok(());
            }
            Err(GetError::DoesNotExist(_)) => {}
            Err(error) => return Err(error.into()),
        }
        self.client.create_registered_model(name, &export.model.description, &model_tags)?;
        Ok(())
    }

    fn import_version(&self, name: &str, export: &ModelExport, record: &VersionRecord, backing: &mut BackingRuns<'_, 'a, C>) -> Result<ModelVersion> {
        let destination_run = match &record.run_id {
            Some(run_id) => Some((run_id, backing.resolve(record, run_id)?)),
            None => None,
        };
        let source = match (&destination_run, &record.reference) {
            (Some((_, run)), Some(reference)) => reference.resolve(&run.artifact_uri),
            (Some((old_run_id, run)), None) => splice_raw_source(&record.source, old_run_id, &run.run_id)?,
            (None, _) => record.source.clone(),
        };

        let mut version_tags: Vec<ModelTag> = record
            .tags
            .iter()
            .filter(|(key, _)| !tags::is_reserved(key))
            .map(|(key, value)| ModelTag::new(key.clone(), value.clone()))
            .collect();
        version_tags.extend(export.info.provenance().tags().into_iter().map(|(key, value)| ModelTag::new(key, value)));
        version_tags.push(ModelTag::new(tags::SOURCE_VERSION, record.version.clone()));

        let run_id = destination_run.as_ref().map(|(_, run)| &run.run_id);
        let created = self.client.create_model_version(name, &source, run_id, &record.description, &version_tags)?;
        let mut version = self.wait_until_ready(name, &created.version)?;
        if record.current_stage != Stage::None {
            version = self.client.transition_model_version_stage(
                name,
                &version.version,
                record.current_stage,
                self.options.archive_existing_versions,
            )?;
        }
        debug!(model = %name, source_version = %record.version, version = %version.version, source = %source, "imported version");
        Ok(version)
    }

    fn wait_until_ready(&self, name: &str, version: &str) -> Result<ModelVersion> {
        let mut delays = self.options.poll.delays();
        loop {
            let current = self.client.get_model_version(name, version)?;
            match current.status {
                ModelVersionStatus::Ready => return Ok(current),
                ModelVersionStatus::FailedRegistration => {
                    return Err(Error::Storage(anyhow!("registration of model version {}/{} failed", name, version)));
                }
                ModelVersionStatus::PendingRegistration => {}
            }
            match delays.next() {
                Some(delay) => {
                    debug!(model = %name, version = %version, delay_ms = delay.as_millis() as u64, "waiting for model version");
                    thread::sleep(delay);
                }
                None => {
                    return Err(Error::RemoteTimeout {
                        name: name.to_owned(),
                        version: version.to_owned(),
                        waited: self.options.poll.max_wait,
                    });
                }
            }
        }
    }
}

/// Refuses manifests whose versions contradict the recorded filter.
fn verify_filter(export: &ModelExport) -> Result<()> {
    let filter = &export.filter;
    let selection = VersionSelection::new(filter.stages.clone(), filter.versions.clone())?;
    for record in &export.model.versions {
        let consistent = match (selection.stages(), selection.versions()) {
            (Some(stages), _) => stages.contains(&record.current_stage),
            (_, Some(versions)) => versions.contains(&record.version),
            _ => true,
        };
        if !consistent {
            return Err(Error::Configuration(format!(
                "version {} of model {} does not match the export filter",
                record.version, export.model.name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct DestinationRun {
    run_id: RunId,
    artifact_uri: String,
}

/// Resolves source run ids to destination runs during one model import,
/// importing nested runs and experiments on first use.
struct BackingRuns<'i, 'a, C: ?Sized> {
    importer: &'i ModelImporter<'a, C>,
    model: &'i str,
    dir: &'i Path,
    run_map: BTreeMap<RunId, RunId>,
    imported_experiments: BTreeSet<ExperimentId>,
    nested_experiment: Option<ExperimentId>,
    searched_destination: bool,
    failures: Vec<Failure>,
}

impl<'i, 'a, C: Client + ?Sized> BackingRuns<'i, 'a, C> {
    fn new(importer: &'i ModelImporter<'a, C>, model: &'i str, dir: &'i Path) -> Self {
        BackingRuns {
            importer,
            model,
            dir,
            run_map: importer.run_map.clone(),
            imported_experiments: BTreeSet::new(),
            nested_experiment: None,
            searched_destination: false,
            failures: Vec::new(),
        }
    }

    fn resolve(&mut self, record: &VersionRecord, run_id: &RunId) -> Result<DestinationRun> {
        let client = self.importer.client;
        if !self.run_map.contains_key(run_id) {
            match &record.backing {
                Backing::Nested => {
                    let experiment_id = self.nested_experiment()?;
                    let importer = RunImporter::new(client, self.importer.options.run.clone());
                    let imported = importer.import_run(&nested_run_dir(self.dir, run_id), &experiment_id)?;
                    self.run_map.insert(imported.source_run_id, imported.run_id);
                }
                Backing::InExperiment { experiment_id } => self.import_experiment(experiment_id)?,
                Backing::Reference | Backing::None => self.search_destination()?,
            }
        }
        let missing = || Error::MissingBackingRun {
            version: record.version.clone(),
            run_id: run_id.to_string(),
        };
        let destination = self.run_map.get(run_id).ok_or_else(missing)?;
        match client.get_run(destination) {
            Ok(run) if run.info.lifecycle_stage == LifecycleStage::Active => Ok(DestinationRun {
                run_id: run.info.run_id,
                artifact_uri: run.info.artifact_uri,
            }),
            Ok(_) | Err(GetError::DoesNotExist(_)) => Err(missing()),
            Err(error) => Err(error.into()),
        }
    }

    fn nested_experiment(&mut self) -> Result<ExperimentId> {
        if let Some(id) = &self.nested_experiment {
            return Ok(id.clone());
        }
        let client = self.importer.client;
        let name = self.importer.options.experiment_name.as_deref().unwrap_or(self.model);
        let id = match client.get_experiment_by_name(name) {
            Ok(existing) if existing.lifecycle_stage == LifecycleStage::Active => existing.experiment_id,
            Ok(_) => return Err(Error::DestinationConflict(format!("deleted experiment '{}'", name))),
            Err(GetError::DoesNotExist(_)) => client.create_experiment(name, &[])?,
            Err(error) => return Err(error.into()),
        };
        self.nested_experiment = Some(id.clone());
        Ok(id)
    }

    fn import_experiment(&mut self, experiment_id: &ExperimentId) -> Result<()> {
        if !self.imported_experiments.insert(experiment_id.clone()) {
            return Ok(());
        }
        let dir = experiment_dir(self.dir, experiment_id);
        let name = ExperimentExport::read(&dir)?.experiment.name;
        let options = ExperimentImportOptions {
            on_conflict: self.importer.options.on_conflict,
            run: self.importer.options.run.clone(),
        };
        let imported = ExperimentImporter::new(self.importer.client, options).import_experiment(&name, &dir)?;
        self.run_map.extend(imported.run_map);
        self.failures.extend(imported.failures.into_iter().map(|failure| Failure {
            object: format!("experiment {} / {}", experiment_id, failure.object),
            ..failure
        }));
        Ok(())
    }

    // runs created by earlier imports carry their source run id as a tag
    fn search_destination(&mut self) -> Result<()> {
        if self.searched_destination {
            return Ok(());
        }
        self.searched_destination = true;
        let client = self.importer.client;
        let experiments = client.search_experiments(ViewType::Active, None)?;
        let ids: Vec<&ExperimentId> = experiments.iter().map(|e| &e.experiment_id).collect();
        for (source, destination) in imported_runs(client, &ids)? {
            self.run_map.entry(source).or_insert(destination);
        }
        Ok(())
    }
}
