//! Export and import of many experiments or models in one batch.
//!
//! Every top-level object is one task. Tasks run in input order, or on a rayon
//! pool bounded by [`BulkOptions::concurrency`]; each task fills its own result
//! slot and a failed object never stops the others.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    convert::Infallible,
    fmt,
    path::Path,
    str::FromStr,
    thread,
};
use tracing::{info, warn};

use crate::{
    api::{client::{Client, ViewType}, notebook::NotebookSource},
    error::{Error, Result},
    experiment::{
        resolve_experiment, ExperimentExportOptions, ExperimentExporter, ExperimentImportOptions, ExperimentImporter,
    },
    format::{
        experiment::ExperimentExport,
        model::{ModelExport, EXPERIMENTS_DIR},
        BulkManifest, ExportInfo, ObjectType, EXPERIMENTS_FILE, MODELS_FILE,
    },
    model::{ModelExportOptions, ModelExporter, ModelImportOptions, ModelImporter, VersionSelection},
    report::{BatchReport, Failure, ObjectReport},
    ExperimentId, RunId,
};

pub const MODELS_DIR: &str = "models";

/// Which top-level objects a batch covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Every object visible at the source when the batch is dispatched.
    All,
    /// Experiment names or ids, or model names.
    Names(Vec<String>),
}

impl Selector {
    /// `"all"` or `"*"`, else a comma-delimited list.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "all" | "*" => Selector::All,
            list => Selector::Names(
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect(),
            ),
        }
    }

    /// Ids of the selected experiments.
    pub fn experiments<C: Client + ?Sized>(&self, client: &C) -> Result<Vec<String>> {
        match self {
            Selector::All => Ok(client
                .search_experiments(ViewType::Active, None)?
                .into_iter()
                .map(|experiment| experiment.experiment_id.to_string())
                .collect()),
            Selector::Names(names) => Ok(names.clone()),
        }
    }

    /// Names of the selected registered models.
    pub fn models<C: Client + ?Sized>(&self, client: &C) -> Result<Vec<String>> {
        match self {
            Selector::All => Ok(client
                .search_registered_models(None)?
                .into_iter()
                .map(|model| model.name)
                .collect()),
            Selector::Names(names) => Ok(names.clone()),
        }
    }
}

impl FromStr for Selector {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Selector::parse(s))
    }
}

impl From<Vec<String>> for Selector {
    fn from(names: Vec<String>) -> Self {
        Selector::Names(names)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All => f.write_str("all"),
            Selector::Names(names) => f.write_str(&names.join(",")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkOptions {
    /// Run objects on a worker pool instead of one after another.
    pub use_threads: bool,
    /// Worker pool size.
    pub concurrency: usize,
}

impl Default for BulkOptions {
    fn default() -> Self {
        BulkOptions {
            use_threads: false,
            concurrency: thread::available_parallelism().map_or(4, |n| n.get()),
        }
    }
}

/// Runs `task` once per item, returning results in input order.
fn dispatch<T, R, F>(items: &[T], options: &BulkOptions, task: F) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    if !options.use_threads || items.len() < 2 {
        return Ok(items.iter().map(task).collect());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.concurrency.max(1))
        .thread_name(|i| format!("bulk-worker-{}", i))
        .build()
        .map_err(|error| Error::Configuration(format!("cannot start worker pool: {}", error)))?;
    Ok(pool.install(|| items.par_iter().map(|item| task(item)).collect()))
}

fn object_report(object: String, outcome: &Result<Vec<Failure>>) -> ObjectReport {
    let failures = match outcome {
        Ok(failures) => failures.clone(),
        Err(error) => {
            warn!(object = %object, error = %error, "object failed");
            vec![Failure::new(object.clone(), error)]
        }
    };
    ObjectReport { object, failures }
}

/// Exports each selected experiment into `dir/<experiment_id>/`.
pub fn export_experiments<C>(
    client: &C,
    notebooks: &(dyn NotebookSource + Sync),
    selector: &Selector,
    dir: &Path,
    options: &ExperimentExportOptions,
    bulk: &BulkOptions,
) -> Result<BatchReport>
where
    C: Client + Sync + ?Sized,
{
    let experiments = selector.experiments(client)?;
    info!(count = experiments.len(), selector = %selector, "exporting experiments");
    let exporter = ExperimentExporter::new(client, notebooks, options.clone());
    let results = dispatch(&experiments, bulk, |experiment| {
        let outcome = resolve_experiment(client, experiment).and_then(|found| {
            exporter.export_runs(&found, None, &dir.join(found.experiment_id.as_ref()))
        });
        let dir_name = outcome.as_ref().ok().map(|summary| summary.experiment_id.to_string());
        let outcome = outcome.map(|summary| summary.failures);
        (object_report(format!("experiment {}", experiment), &outcome), dir_name)
    })?;
    finish(client, dir, EXPERIMENTS_FILE, ObjectType::Experiments, selector, &experiments, results)
}

fn finish<C: Client + ?Sized>(
    client: &C,
    dir: &Path,
    file: &str,
    object_type: ObjectType,
    selector: &Selector,
    objects: &[String],
    results: Vec<(ObjectReport, Option<String>)>,
) -> Result<BatchReport> {
    let mut manifest = BulkManifest {
        info: ExportInfo::new(object_type, selector.to_string(), client.host()),
        exported: vec![],
        failed: vec![],
    };
    let mut report = BatchReport::default();
    for (object, (object_report, dir_name)) in objects.iter().zip(results) {
        match dir_name {
            Some(dir_name) => manifest.exported.push(dir_name),
            None => manifest.failed.push(object.clone()),
        }
        report.objects.push(object_report);
    }
    manifest.write(dir, file)?;
    info!(succeeded = report.succeeded(), failed = report.failed(), "batch finished");
    Ok(report)
}

/// Imports every experiment listed in `dir/experiments.json` under its exported name.
pub fn import_experiments<C>(client: &C, dir: &Path, options: &ExperimentImportOptions, bulk: &BulkOptions) -> Result<BatchReport>
where
    C: Client + Sync + ?Sized,
{
    Ok(import_experiments_mapped(client, dir, options, bulk)?.0)
}

fn import_experiments_mapped<C>(
    client: &C,
    dir: &Path,
    options: &ExperimentImportOptions,
    bulk: &BulkOptions,
) -> Result<(BatchReport, BTreeMap<RunId, RunId>)>
where
    C: Client + Sync + ?Sized,
{
    let manifest = BulkManifest::read(dir, EXPERIMENTS_FILE)?;
    info!(count = manifest.exported.len(), dir = %dir.display(), "importing experiments");
    let importer = ExperimentImporter::new(client, options.clone());
    let results = dispatch(&manifest.exported, bulk, |dir_name| {
        let experiment_dir = dir.join(dir_name);
        let outcome = ExperimentExport::read(&experiment_dir)
            .and_then(|export| importer.import_experiment(&export.experiment.name, &experiment_dir));
        let (outcome, run_map) = match outcome {
            Ok(imported) => (Ok(imported.failures), imported.run_map),
            Err(error) => (Err(error), BTreeMap::new()),
        };
        (object_report(format!("experiment {}", dir_name), &outcome), run_map)
    })?;

    let mut report = BatchReport::default();
    let mut run_map = BTreeMap::new();
    for (object, runs) in results {
        report.objects.push(object);
        run_map.extend(runs);
    }
    Ok((report, run_map))
}

/// Exports each selected model into `dir/models/<name>/` with its backing runs
/// in sibling experiment exports under `dir/experiments/<experiment_id>/`.
pub fn export_models<C>(
    client: &C,
    notebooks: &(dyn NotebookSource + Sync),
    selector: &Selector,
    dir: &Path,
    options: &ModelExportOptions,
    bulk: &BulkOptions,
) -> Result<BatchReport>
where
    C: Client + Sync + ?Sized,
{
    VersionSelection::new(options.stages.clone(), options.versions.clone())?;
    let models = selector.models(client)?;
    info!(count = models.len(), selector = %selector, "exporting models");
    let models_dir = dir.join(MODELS_DIR);
    let experiments_dir = dir.join(EXPERIMENTS_DIR);

    let exporter = ModelExporter::new(client, notebooks, options.clone()).referencing_runs();
    let results = dispatch(&models, bulk, |model| {
        match exporter.export_model(model, &models_dir.join(model_dir_name(model))) {
            Ok(summary) => {
                let report = ObjectReport { object: format!("model {}", model), failures: summary.failures };
                (report, Some(model_dir_name(model)), summary.backing_runs)
            }
            Err(error) => (object_report(format!("model {}", model), &Err(error)), None, BTreeMap::new()),
        }
    })?;

    // None exports the whole experiment
    let mut backing: BTreeMap<ExperimentId, Option<BTreeSet<RunId>>> = BTreeMap::new();
    let mut model_results = Vec::new();
    for (report, dir_name, runs) in results {
        for (experiment_id, run_ids) in runs {
            let entry = backing.entry(experiment_id).or_insert_with(|| Some(BTreeSet::new()));
            if options.export_all_runs {
                *entry = None;
            } else if let Some(selected) = entry {
                selected.extend(run_ids);
            }
        }
        model_results.push((report, dir_name));
    }
    let mut report = finish(client, &models_dir, MODELS_FILE, ObjectType::Models, selector, &models, model_results)?;

    let experiments: Vec<(ExperimentId, Option<BTreeSet<RunId>>)> = backing.into_iter().collect();
    let experiment_ids: Vec<String> = experiments.iter().map(|(id, _)| id.to_string()).collect();
    let experiment_exporter = ExperimentExporter::new(client, notebooks, options.experiment.clone());
    let results = dispatch(&experiments, bulk, |(experiment_id, only)| {
        let outcome = client
            .get_experiment(experiment_id)
            .map_err(Error::from)
            .and_then(|experiment| {
                experiment_exporter.export_runs(&experiment, only.as_ref(), &experiments_dir.join(experiment_id.as_ref()))
            })
            .map(|summary| summary.failures);
        let dir_name = outcome.as_ref().ok().map(|_| experiment_id.to_string());
        (object_report(format!("experiment {}", experiment_id), &outcome), dir_name)
    })?;
    let experiments_selector = Selector::Names(experiment_ids.clone());
    let experiment_report = finish(
        client,
        &experiments_dir,
        EXPERIMENTS_FILE,
        ObjectType::Experiments,
        &experiments_selector,
        &experiment_ids,
        results,
    )?;
    report.objects.extend(experiment_report.objects);
    Ok(report)
}

/// Imports a [`export_models`] tree: sibling experiments first, then every model
/// with the run ids those experiments were given at the destination.
pub fn import_models<C>(client: &C, dir: &Path, options: &ModelImportOptions, bulk: &BulkOptions) -> Result<BatchReport>
where
    C: Client + Sync + ?Sized,
{
    let models_dir = dir.join(MODELS_DIR);
    let manifest = BulkManifest::read(&models_dir, MODELS_FILE)?;

    let experiments_dir = dir.join(EXPERIMENTS_DIR);
    let (mut report, run_map) = if experiments_dir.join(EXPERIMENTS_FILE).exists() {
        let experiment_options = ExperimentImportOptions {
            on_conflict: options.on_conflict,
            run: options.run.clone(),
        };
        import_experiments_mapped(client, &experiments_dir, &experiment_options, bulk)?
    } else {
        (BatchReport::default(), BTreeMap::new())
    };

    info!(count = manifest.exported.len(), runs = run_map.len(), "importing models");
    let importer = ModelImporter::new(client, options.clone()).with_run_map(run_map);
    let results = dispatch(&manifest.exported, bulk, |dir_name| {
        let model_dir = models_dir.join(dir_name);
        let outcome = ModelExport::read(&model_dir)
            .and_then(|export| importer.import_model(&export.model.name, &model_dir))
            .map(|imported| imported.failures);
        object_report(format!("model {}", dir_name), &outcome)
    })?;
    report.objects.extend(results);
    info!(succeeded = report.succeeded(), failed = report.failed(), "batch finished");
    Ok(report)
}

/// Directory name of a model export; model names may contain path separators.
pub fn model_dir_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_selectors() {
        assert_eq!(Selector::parse("all"), Selector::All);
        assert_eq!(Selector::parse(" * "), Selector::All);
        assert_eq!(
            Selector::parse("sklearn_wine, ,keras_mnist"),
            Selector::Names(vec!["sklearn_wine".into(), "keras_mnist".into()])
        );
        assert_eq!(Selector::parse("").to_string(), "");
    }

    #[test]
    fn dispatch_keeps_input_order() {
        let items: Vec<u32> = (0..32).collect();
        let options = BulkOptions { use_threads: true, concurrency: 4 };
        let doubled = dispatch(&items, &options, |n| n * 2).unwrap();
        assert_eq!(doubled, items.iter().map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn model_dir_names() {
        assert_eq!(model_dir_name("team/model:v1"), "team_model_v1");
    }
}
