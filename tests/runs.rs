mod common;

use common::*;
use mlflow_export_import::{
    api::{notebook::NotebookFormat, run::RunStatus},
    error::ErrorKind,
    format::run::RunExport,
    run::{RunExportOptions, RunExporter, RunImporter},
    tags, Client,
};

#[test]
fn run_round_trip() {
    let source = source();
    let (_, runs) = seed_experiment(&source, "round_trip", 1);
    let source_run = source.get_run(&runs[0]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let exported = RunExporter::new(&source, &source, run_export()).export_run(&runs[0], dir.path()).unwrap();
    assert_eq!(exported.run.artifacts.len(), 3);
    assert_eq!(RunExport::read(dir.path()).unwrap(), exported);

    let destination = destination();
    let experiment = destination.create_experiment("imported", &[]).unwrap();
    let imported = RunImporter::new(&destination, run_import()).import_run(dir.path(), &experiment).unwrap();
    assert_eq!(imported.source_run_id, runs[0]);
    assert_ne!(imported.run_id, runs[0]);

    let run = destination.get_run(&imported.run_id).unwrap();
    assert_eq!(run.info.status, RunStatus::Finished);
    assert_eq!(run.info.start_time, source_run.info.start_time);
    assert_eq!(run.info.end_time, source_run.info.end_time);

    let mut params = run.data.params.clone();
    params.sort_by(|a, b| a.key.cmp(&b.key));
    let mut source_params = source_run.data.params.clone();
    source_params.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(params, source_params);

    assert_eq!(
        destination.get_metric_history(&imported.run_id, "rmse").unwrap(),
        source.get_metric_history(&runs[0], "rmse").unwrap()
    );

    assert_eq!(run.tag("run_index"), Some("0"));
    assert_eq!(run.tag(tags::USER), Some("importer"));
    assert_eq!(run.tag(tags::SOURCE_ID), Some(runs[0].as_ref()));
    assert_eq!(run.tag(tags::SOURCE_HOST), Some("http://source:5000"));

    for path in &["model/MLmodel", "model/data/model.pkl", "plot.png"] {
        assert_eq!(download(&destination, &imported.run_id, path), download(&source, &runs[0], path));
    }
}

#[test]
fn failing_artifact_is_retried_then_reported() {
    let source = source();
    let (_, runs) = seed_experiment(&source, "broken", 1);
    source.fail_artifact("plot.png");

    let dir = tempfile::tempdir().unwrap();
    let error = RunExporter::new(&source, &source, run_export())
        .export_run(&runs[0], dir.path())
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ArtifactCopy);
    assert!(error.to_string().contains("after 2 attempts"));
}

#[test]
fn failed_upload_marks_destination_run_failed() {
    let source = source();
    let (_, runs) = seed_experiment(&source, "upload", 1);
    let dir = tempfile::tempdir().unwrap();
    RunExporter::new(&source, &source, run_export()).export_run(&runs[0], dir.path()).unwrap();

    let destination = destination();
    destination.fail_artifact("model/MLmodel");
    let experiment = destination.create_experiment("imported", &[]).unwrap();
    let error = RunImporter::new(&destination, run_import()).import_run(dir.path(), &experiment).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ArtifactCopy);

    let runs = mlflow_export_import::api::client::search_all_runs(
        &destination,
        &[&experiment],
        "",
        mlflow_export_import::api::client::ViewType::All,
    )
    .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].info.status, RunStatus::Failed);
}

#[test]
fn notebooks_are_exported_when_available() {
    let source = source();
    let experiment = source.create_experiment("notebooks", &[]).unwrap();
    let notebook_tags = [
        mlflow_export_import::api::run::RunTag::new(tags::SOURCE_TYPE, "NOTEBOOK"),
        mlflow_export_import::api::run::RunTag::new(tags::SOURCE_NAME, "/Users/alice/train"),
    ];
    let run = source.create_run(&experiment, 0, &notebook_tags).unwrap().info.run_id;
    source.add_notebook("/Users/alice/train", NotebookFormat::Source, "print(1)");

    let options = RunExportOptions {
        notebook_formats: vec![NotebookFormat::Source, NotebookFormat::Dbc],
        ..run_export()
    };
    let dir = tempfile::tempdir().unwrap();
    let exported = RunExporter::new(&source, &source, options).export_run(&run, dir.path()).unwrap();
    assert_eq!(exported.run.notebook_formats, vec![NotebookFormat::Source]);
    let notebook = mlflow_export_import::format::run::notebook_file(dir.path(), NotebookFormat::Source);
    assert_eq!(std::fs::read(notebook).unwrap(), b"print(1)");
}

#[test]
fn source_user_is_kept_on_request() {
    let source = source();
    let (_, runs) = seed_experiment(&source, "users", 1);
    let dir = tempfile::tempdir().unwrap();
    RunExporter::new(&source, &source, run_export()).export_run(&runs[0], dir.path()).unwrap();

    let destination = destination();
    let experiment = destination.create_experiment("imported", &[]).unwrap();
    let options = mlflow_export_import::run::RunImportOptions { use_src_user_id: true, ..run_import() };
    let imported = RunImporter::new(&destination, options).import_run(dir.path(), &experiment).unwrap();
    let run = destination.get_run(&imported.run_id).unwrap();
    assert_eq!(run.tag(tags::USER), Some("alice"));
    assert_eq!(run.info.user_id.as_deref(), Some("alice"));
}

#[test]
fn artifact_paths_cannot_leave_the_export_directory() {
    let source = source();
    let experiment = source.create_experiment("escape", &[]).unwrap();
    let run = source.create_run(&experiment, 0, &[]).unwrap().info.run_id;
    source.upload_artifact(&run, "../../escaped.txt", &mut &b"x"[..]).unwrap();

    let root = tempfile::tempdir().unwrap();
    let run_dir = root.path().join("a").join("b");
    let error = RunExporter::new(&source, &source, run_export()).export_run(&run, &run_dir).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Io);
    assert!(!root.path().join("a").join("escaped.txt").exists());
    assert!(!root.path().join("escaped.txt").exists());
}
