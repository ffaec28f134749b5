//! Export of an experiment with its runs and replay into a destination experiment.

use serde::{Deserialize, Serialize};
use std::{collections::{BTreeMap, BTreeSet}, fs, path::Path};
use tracing::{info, warn};

use crate::{
    api::{
        client::{search_all_runs, Client, LifecycleStage, ViewType},
        error::GetError,
        experiment::{Experiment, ExperimentTag},
        notebook::NotebookSource,
    },
    config::OnConflict,
    error::{Error, Result},
    format::{
        experiment::{run_dir, ExperimentExport, ExperimentRecord},
        ExportInfo, ObjectType,
    },
    report::Failure,
    run::{RunExportOptions, RunExporter, RunImportOptions, RunImporter},
    tags, ExperimentId, RunId,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentExportOptions {
    /// Search filter restricting the exported runs, e.g. `tags.run_index = '1'`.
    pub run_filter: Option<String>,
    pub include_deleted_runs: bool,
    pub run: RunExportOptions,
}

/// What an experiment export wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentExportSummary {
    pub experiment_id: ExperimentId,
    pub name: String,
    pub exported: Vec<RunId>,
    /// Runs that failed to export, in the order of `failures`.
    pub failed: Vec<RunId>,
    pub failures: Vec<Failure>,
}

pub struct ExperimentExporter<'a, C: ?Sized> {
    client: &'a C,
    runs: RunExporter<'a, C>,
    options: ExperimentExportOptions,
}

impl<'a, C: Client + ?Sized> ExperimentExporter<'a, C> {
    pub fn new(client: &'a C, notebooks: &'a (dyn NotebookSource + Sync), options: ExperimentExportOptions) -> Self {
        ExperimentExporter {
            client,
            runs: RunExporter::new(client, notebooks, options.run.clone()),
            options,
        }
    }

    /// Exports the experiment named or identified by `experiment`.
    pub fn export_experiment(&self, experiment: &str, dir: &Path) -> Result<ExperimentExportSummary> {
        let experiment = resolve_experiment(self.client, experiment)?;
        self.export_runs(&experiment, None, dir)
    }

    /// Exports the runs of `experiment` matching the filter, restricted to `only` when given.
    pub fn export_runs(&self, experiment: &Experiment, only: Option<&BTreeSet<RunId>>, dir: &Path) -> Result<ExperimentExportSummary> {
        fs::create_dir_all(dir)?;
        let view_type = if self.options.include_deleted_runs { ViewType::All } else { ViewType::Active };
        let filter = self.options.run_filter.as_deref().unwrap_or("");
        let runs = search_all_runs(self.client, &[&experiment.experiment_id], filter, view_type)?;

        let mut exported = Vec::new();
        let mut failed = Vec::new();
        let mut failures = Vec::new();
        for run in runs {
            let run_id = run.info.run_id;
            if only.map_or(false, |only| !only.contains(&run_id)) {
                continue;
            }
            match self.runs.export_run(&run_id, &run_dir(dir, &run_id)) {
                Ok(_) => exported.push(run_id),
                Err(error) => {
                    warn!(experiment_id = %experiment.experiment_id, run_id = %run_id, error = %error, "run export failed");
                    failures.push(Failure::new(format!("run {}", run_id), &error));
                    failed.push(run_id);
                }
            }
        }

        let export = ExperimentExport {
            info: ExportInfo::new(ObjectType::Experiment, experiment.experiment_id.as_ref(), self.client.host()),
            experiment: ExperimentRecord {
                experiment_id: experiment.experiment_id.clone(),
                name: experiment.name.clone(),
                tags: experiment.tags.iter().map(|t| (t.key.clone(), t.value.clone())).collect(),
                runs: exported.clone(),
                failed_runs: failed.clone(),
            },
        };
        export.write(dir)?;
        info!(
            experiment_id = %experiment.experiment_id,
            name = %experiment.name,
            runs = exported.len(),
            failed = failures.len(),
            "exported experiment"
        );
        Ok(ExperimentExportSummary {
            experiment_id: experiment.experiment_id.clone(),
            name: experiment.name.clone(),
            exported,
            failed,
            failures,
        })
    }
}

/// Looks `experiment` up by name first, then by id.
pub fn resolve_experiment<C: Client + ?Sized>(client: &C, experiment: &str) -> Result<Experiment> {
    match client.get_experiment_by_name(experiment) {
        Ok(found) => Ok(found),
        Err(GetError::DoesNotExist(_)) => Ok(client.get_experiment(&ExperimentId::from(experiment))?),
        Err(error) => Err(error.into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentImportOptions {
    pub on_conflict: OnConflict,
    #[serde(default)]
    pub run: RunImportOptions,
}

impl ExperimentImportOptions {
    pub fn new(on_conflict: OnConflict) -> Self {
        ExperimentImportOptions { on_conflict, run: RunImportOptions::default() }
    }
}

/// Result of an experiment import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentImport {
    pub experiment_id: ExperimentId,
    /// Source run id to destination run id, including runs reused from earlier imports.
    pub run_map: BTreeMap<RunId, RunId>,
    /// Source runs skipped because an earlier import already created them.
    pub skipped: Vec<RunId>,
    pub failures: Vec<Failure>,
}

pub struct ExperimentImporter<'a, C: ?Sized> {
    client: &'a C,
    runs: RunImporter<'a, C>,
    on_conflict: OnConflict,
}

impl<'a, C: Client + ?Sized> ExperimentImporter<'a, C> {
    pub fn new(client: &'a C, options: ExperimentImportOptions) -> Self {
        ExperimentImporter {
            client,
            runs: RunImporter::new(client, options.run),
            on_conflict: options.on_conflict,
        }
    }

    /// Imports the export in `dir` into the destination experiment `name`.
    pub fn import_experiment(&self, name: &str, dir: &Path) -> Result<ExperimentImport> {
        let export = ExperimentExport::read(dir)?;
        let experiment_id = self.destination(name, &export)?;

        let mut run_map = if self.on_conflict == OnConflict::Reuse {
            imported_runs(self.client, &[&experiment_id])?
        } else {
            BTreeMap::new()
        };
        let mut skipped = Vec::new();
        let mut failures = Vec::new();
        for source_run_id in &export.experiment.runs {
            if run_map.contains_key(source_run_id) {
                info!(source_run_id = %source_run_id, "run already imported, skipping");
                skipped.push(source_run_id.clone());
                continue;
            }
            match self.runs.import_run(&run_dir(dir, source_run_id), &experiment_id) {
                Ok(imported) => {
                    run_map.insert(imported.source_run_id, imported.run_id);
                }
                Err(error) => {
                    warn!(experiment_id = %experiment_id, source_run_id = %source_run_id, error = %error, "run import failed");
                    failures.push(Failure::new(format!("run {}", source_run_id), &error));
                }
            }
        }
        info!(
            name = %name,
            experiment_id = %experiment_id,
            runs = export.experiment.runs.len() - failures.len() - skipped.len(),
            skipped = skipped.len(),
            failed = failures.len(),
            "imported experiment"
        );
        Ok(ExperimentImport { experiment_id, run_map, skipped, failures })
    }

    /// Creates the destination experiment or applies the conflict policy to an existing one.
    fn destination(&self, name: &str, export: &ExperimentExport) -> Result<ExperimentId> {
        let mut experiment_tags: Vec<ExperimentTag> = export
            .experiment
            .tags
            .iter()
            .filter(|(key, _)| !tags::is_reserved(key))
            .map(|(key, value)| ExperimentTag { key: key.clone(), value: value.clone() })
            .collect();
        experiment_tags.extend(
            export
                .info
                .provenance()
                .tags()
                .into_iter()
                .map(|(key, value)| ExperimentTag { key: key.to_owned(), value }),
        );

        match self.client.get_experiment_by_name(name) {
            Ok(existing) => {
                if existing.lifecycle_stage == LifecycleStage::Deleted {
                    return Err(Error::DestinationConflict(format!("deleted experiment '{}'", name)));
                }
                match self.on_conflict {
                    OnConflict::Fail => return Err(Error::DestinationConflict(format!("experiment '{}'", name))),
                    OnConflict::Append => warn!(name = %name, experiment_id = %existing.experiment_id, "experiment exists, appending runs"),
                    OnConflict::Reuse => info!(name = %name, experiment_id = %existing.experiment_id, "reusing existing experiment"),
                }
                for tag in &experiment_tags {
                    self.client.set_experiment_tag(&existing.experiment_id, &tag.key, &tag.value)?;
                }
                Ok(existing.experiment_id)
            }
            Err(GetError::DoesNotExist(_)) => Ok(self.client.create_experiment(name, &experiment_tags)?),
            Err(error) => Err(error.into()),
        }
    }
}

/// Source run id to destination run id for every run in `experiment_ids` stamped by an import.
pub fn imported_runs<C: Client + ?Sized>(client: &C, experiment_ids: &[&ExperimentId]) -> Result<BTreeMap<RunId, RunId>> {
    if experiment_ids.is_empty() {
        return Ok(BTreeMap::new());
    }
    let runs = search_all_runs(client, experiment_ids, "", ViewType::Active)?;
    Ok(runs
        .into_iter()
        .filter_map(|run| {
            let source = run.tag(tags::SOURCE_ID)?.to_owned();
            Some((RunId::from(source), run.info.run_id))
        })
        .collect())
}
