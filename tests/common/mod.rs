#![allow(dead_code)]

use mlflow_export_import::{
    api::{model::Stage, run::{RunStatus, RunTag}},
    backend::memory::InMemory,
    config::{OnConflict, PollPolicy, RetryPolicy},
    experiment::{ExperimentExportOptions, ExperimentImportOptions},
    model::{ModelExportOptions, ModelImportOptions},
    run::{RunExportOptions, RunImportOptions},
    Client, ExperimentId, RunId,
};
use nanorand::{WyRand, RNG};
use std::{io::Read, time::Duration};

pub const MODEL_FILE: &[u8] = b"artifact_path: model\nflavors:\n  sklearn: {}\n";

pub fn source() -> InMemory {
    InMemory::new("http://source:5000")
}

pub fn destination() -> InMemory {
    InMemory::new("http://destination:5000")
}

pub fn no_wait_retry() -> RetryPolicy {
    RetryPolicy { attempts: 2, delay: Duration::from_millis(0) }
}

pub fn run_export() -> RunExportOptions {
    RunExportOptions { retry: no_wait_retry(), ..RunExportOptions::default() }
}

pub fn experiment_export() -> ExperimentExportOptions {
    ExperimentExportOptions { run: run_export(), ..ExperimentExportOptions::default() }
}

pub fn model_export() -> ModelExportOptions {
    ModelExportOptions { experiment: experiment_export(), ..ModelExportOptions::default() }
}

pub fn run_import() -> RunImportOptions {
    RunImportOptions { user: "importer".into(), retry: no_wait_retry(), ..RunImportOptions::default() }
}

pub fn experiment_import(on_conflict: OnConflict) -> ExperimentImportOptions {
    ExperimentImportOptions { on_conflict, run: run_import() }
}

pub fn quick_poll() -> PollPolicy {
    PollPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_wait: Duration::from_millis(40),
    }
}

pub fn model_import(on_conflict: OnConflict) -> ModelImportOptions {
    ModelImportOptions { poll: quick_poll(), run: run_import(), ..ModelImportOptions::new(on_conflict) }
}

/// Logs a finished run with random metric history, params, tags and a nested model directory.
pub fn seed_run(server: &InMemory, experiment: &ExperimentId, seed: u64) -> RunId {
    let tags = [RunTag::new("mlflow.user", "alice"), RunTag::new("run_index", seed.to_string())];
    let run = server.create_run(experiment, 1_600_000_000_000 + seed as i64, &tags).unwrap();
    let run_id = run.info.run_id;
    server.log_param(&run_id, "alpha", &format!("0.{}", seed)).unwrap();
    server.log_param(&run_id, "max_depth", "4").unwrap();
    let mut rng = WyRand::new_seed(seed);
    for step in 0..5 {
        let value: f64 = rng.generate::<u16>().into();
        server
            .log_metric(&run_id, "rmse", value / f64::from(u16::MAX), 1_600_000_000_000 + step, step)
            .unwrap();
    }
    server.upload_artifact(&run_id, "model/MLmodel", &mut MODEL_FILE).unwrap();
    server.upload_artifact(&run_id, "model/data/model.pkl", &mut &[seed as u8; 16][..]).unwrap();
    server.upload_artifact(&run_id, "plot.png", &mut &b"png"[..]).unwrap();
    server.update_run(&run_id, RunStatus::Finished, Some(1_600_000_100_000)).unwrap();
    run_id
}

pub fn seed_experiment(server: &InMemory, name: &str, runs: u64) -> (ExperimentId, Vec<RunId>) {
    let experiment = server
        .create_experiment(name, &[mlflow_export_import::api::experiment::ExperimentTag {
            key: "team".into(),
            value: "ml".into(),
        }])
        .unwrap();
    let runs = (0..runs).map(|seed| seed_run(server, &experiment, seed)).collect();
    (experiment, runs)
}

/// A model whose versions 1 to 4 sit in Production, Staging, Archived and None,
/// each backed by its own run of `<name>_experiment`.
pub fn seed_model(server: &InMemory, name: &str) -> (ExperimentId, Vec<RunId>) {
    let (experiment, runs) = seed_experiment(server, &format!("{}_experiment", name), 4);
    server.create_registered_model(name, "Hello description", &[]).unwrap();
    server.set_registered_model_tag(name, "city", "franconia").unwrap();
    let stages = [Stage::Production, Stage::Staging, Stage::Archived, Stage::None];
    for (run_id, stage) in runs.iter().zip(stages.iter()) {
        let run = server.get_run(run_id).unwrap();
        let source = format!("{}/model", run.info.artifact_uri);
        let version = server.create_model_version(name, &source, Some(run_id), "", &[]).unwrap();
        if *stage != Stage::None {
            server.transition_model_version_stage(name, &version.version, *stage, false).unwrap();
        }
    }
    (experiment, runs)
}

pub fn download(server: &InMemory, run: &RunId, path: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    server.download_artifact(run, path, &mut bytes).unwrap();
    bytes
}

pub fn read_all(mut reader: impl Read) -> Vec<u8> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).unwrap();
    bytes
}
