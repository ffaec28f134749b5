mod common;

use common::*;
use mlflow_export_import::{
    api::{
        client::{search_all_runs, ViewType},
        model::{ModelVersion, Stage},
    },
    backend::memory::InMemory,
    bulk::{self, BulkOptions, Selector},
    config::{OnConflict, PollPolicy},
    error::{Error, ErrorKind},
    experiment::{ExperimentExporter, ExperimentImporter},
    format::{
        experiment::ExperimentExport,
        model::{experiment_dir, Backing, ModelExport},
    },
    model::{ModelExportOptions, ModelExporter, ModelImportOptions, ModelImporter},
    tags, Client,
};
use std::{collections::BTreeSet, path::Path, time::Duration};

fn export_model(source: &InMemory, name: &str, options: ModelExportOptions, dir: &Path) {
    ModelExporter::new(source, source, options).export_model(name, dir).unwrap();
}

fn versions(server: &InMemory, name: &str) -> Vec<ModelVersion> {
    let mut versions = server.search_model_versions(name).unwrap();
    versions.sort_by_key(|v| v.version.parse::<u32>().unwrap());
    versions
}

fn stages(list: &[Stage]) -> Option<BTreeSet<Stage>> {
    Some(list.iter().copied().collect())
}

#[test]
fn conflicting_selectors_fail_before_any_call() {
    let source = source();
    seed_model(&source, "sklearn_wine");
    let before = source.mutations();
    let options = ModelExportOptions {
        stages: stages(&[Stage::Production]),
        versions: Some(vec!["1".to_owned()].into_iter().collect()),
        ..model_export()
    };
    let dir = tempfile::tempdir().unwrap();
    let error = ModelExporter::new(&source, &source, options.clone())
        .export_model("sklearn_wine", dir.path())
        .unwrap_err();
    assert!(matches!(error, Error::ConflictingSelector { .. }));
    assert_eq!(source.mutations(), before);
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());

    let error = bulk::export_models(&source, &source, &Selector::All, dir.path(), &options, &BulkOptions::default()).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ConflictingSelector);
}

#[test]
fn conflicting_manifest_is_refused_without_destination_mutations() {
    let source = source();
    seed_model(&source, "sklearn_wine");
    let dir = tempfile::tempdir().unwrap();
    export_model(&source, "sklearn_wine", model_export(), dir.path());

    let mut manifest = ModelExport::read(dir.path()).unwrap();
    manifest.filter.stages = stages(&[Stage::Production]);
    manifest.filter.versions = Some(vec!["1".to_owned()].into_iter().collect());
    manifest.write(dir.path()).unwrap();

    let destination = destination();
    let error = ModelImporter::new(&destination, model_import(OnConflict::Fail))
        .import_model("sklearn_wine", dir.path())
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ConflictingSelector);
    assert_eq!(destination.mutations(), 0);
}

#[test]
fn stage_selection_imports_only_production() {
    let source = source();
    seed_model(&source, "sklearn_wine");
    let options = ModelExportOptions { stages: stages(&[Stage::Production]), ..model_export() };
    let dir = tempfile::tempdir().unwrap();
    export_model(&source, "sklearn_wine", options, dir.path());

    let destination = destination();
    let imported = ModelImporter::new(&destination, model_import(OnConflict::Fail))
        .import_model("sklearn_wine", dir.path())
        .unwrap();
    assert!(imported.failures.is_empty());

    let versions = versions(&destination, "sklearn_wine");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].current_stage, Stage::Production);
    assert_eq!(versions[0].tag(tags::SOURCE_VERSION), Some("1"));

    let model = destination.get_registered_model("sklearn_wine").unwrap();
    assert_eq!(model.description, "Hello description");
    assert!(model.tags.iter().any(|t| t.key == "city" && t.value == "franconia"));
}

#[test]
fn versions_link_to_newly_created_runs() {
    let source = source();
    let (_, source_runs) = seed_model(&source, "sklearn_wine");
    let dir = tempfile::tempdir().unwrap();
    export_model(&source, "sklearn_wine", model_export(), dir.path());

    let manifest = ModelExport::read(dir.path()).unwrap();
    assert!(manifest.model.versions.iter().all(|v| v.backing == Backing::Nested));
    assert!(manifest.model.versions.iter().all(|v| v.reference.as_ref().map(|r| r.relative_path.as_str()) == Some("model")));

    let destination = destination();
    let imported = ModelImporter::new(&destination, model_import(OnConflict::Fail))
        .import_model("sklearn_wine", dir.path())
        .unwrap();
    assert_eq!(imported.versions.len(), 4);

    let expected = [Stage::Production, Stage::Staging, Stage::Archived, Stage::None];
    for (version, stage) in versions(&destination, "sklearn_wine").iter().zip(expected.iter()) {
        assert_eq!(version.current_stage, *stage);
        let run_id = version.run_id.as_ref().unwrap();
        assert!(!source_runs.contains(run_id));
        let run = destination.get_run(run_id).unwrap();
        assert_eq!(version.source, format!("{}/model", run.info.artifact_uri));
        assert!(source_runs.iter().all(|source_run| !version.source.contains(source_run.as_ref())));
        assert_eq!(download(&destination, run_id, "model/MLmodel"), MODEL_FILE);
    }

    // nested runs land in an experiment named after the model
    let experiment = destination.get_experiment_by_name("sklearn_wine").unwrap();
    assert_eq!(
        search_all_runs(&destination, &[&experiment.experiment_id], "", ViewType::Active)
            .unwrap()
            .len(),
        4
    );
}

#[test]
fn export_all_runs_nests_whole_experiments() {
    let source = source();
    let (experiment, _) = seed_model(&source, "sklearn_wine");
    seed_run(&source, &experiment, 99);
    let options = ModelExportOptions {
        stages: stages(&[Stage::Production, Stage::Staging]),
        export_all_runs: true,
        ..model_export()
    };
    let dir = tempfile::tempdir().unwrap();
    export_model(&source, "sklearn_wine", options, dir.path());

    let manifest = ModelExport::read(dir.path()).unwrap();
    assert_eq!(manifest.model.versions.len(), 2);
    assert!(manifest
        .model
        .versions
        .iter()
        .all(|v| v.backing == Backing::InExperiment { experiment_id: experiment.clone() }));
    let nested = ExperimentExport::read(&experiment_dir(dir.path(), &experiment)).unwrap();
    assert_eq!(nested.experiment.runs.len(), 5);

    let destination = destination();
    let imported = ModelImporter::new(&destination, model_import(OnConflict::Fail))
        .import_model("sklearn_wine", dir.path())
        .unwrap();
    assert!(imported.failures.is_empty());
    let experiment = destination.get_experiment_by_name("sklearn_wine_experiment").unwrap();
    let runs = search_all_runs(
        &destination,
        &[&experiment.experiment_id],
        "",
        ViewType::Active,
    )
    .unwrap();
    assert_eq!(runs.len(), 5);
}

#[test]
fn readiness_timeout_fails_only_the_version() {
    let source = source();
    seed_model(&source, "sklearn_wine");
    let dir = tempfile::tempdir().unwrap();
    export_model(&source, "sklearn_wine", model_export(), dir.path());

    let destination = destination();
    destination.set_registration_delay(u32::MAX);
    let imported = ModelImporter::new(&destination, model_import(OnConflict::Fail))
        .import_model("sklearn_wine", dir.path())
        .unwrap();
    assert_eq!(imported.failures.len(), 4);
    assert!(imported.failures.iter().all(|f| f.kind == ErrorKind::RemoteTimeout));
}

#[test]
fn zero_poll_delays_still_time_out() {
    let source = source();
    let options = ModelExportOptions { stages: stages(&[Stage::Production]), ..model_export() };
    seed_model(&source, "sklearn_wine");
    let dir = tempfile::tempdir().unwrap();
    export_model(&source, "sklearn_wine", options, dir.path());

    let destination = destination();
    destination.set_registration_delay(u32::MAX);
    let poll = PollPolicy {
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        max_wait: Duration::from_millis(10),
    };
    let imported = ModelImporter::new(&destination, ModelImportOptions { poll, ..model_import(OnConflict::Fail) })
        .import_model("sklearn_wine", dir.path())
        .unwrap();
    assert_eq!(imported.failures.len(), 1);
    assert_eq!(imported.failures[0].kind, ErrorKind::RemoteTimeout);
}

#[test]
fn pending_versions_are_awaited() {
    let source = source();
    seed_model(&source, "sklearn_wine");
    let dir = tempfile::tempdir().unwrap();
    export_model(&source, "sklearn_wine", model_export(), dir.path());

    let destination = destination();
    destination.set_registration_delay(2);
    let imported = ModelImporter::new(&destination, model_import(OnConflict::Fail))
        .import_model("sklearn_wine", dir.path())
        .unwrap();
    assert!(imported.failures.is_empty());
    assert_eq!(versions(&destination, "sklearn_wine")[0].current_stage, Stage::Production);
}

#[test]
fn reuse_skips_imported_versions() {
    let source = source();
    seed_model(&source, "sklearn_wine");
    let dir = tempfile::tempdir().unwrap();
    export_model(&source, "sklearn_wine", model_export(), dir.path());

    let destination = destination();
    let importer = ModelImporter::new(&destination, model_import(OnConflict::Reuse));
    importer.import_model("sklearn_wine", dir.path()).unwrap();
    let second = importer.import_model("sklearn_wine", dir.path()).unwrap();
    assert_eq!(second.skipped, vec!["1", "2", "3", "4"]);
    assert_eq!(versions(&destination, "sklearn_wine").len(), 4);

    let append = ModelImporter::new(&destination, model_import(OnConflict::Append));
    append.import_model("sklearn_wine", dir.path()).unwrap();
    assert_eq!(versions(&destination, "sklearn_wine").len(), 8);
}

#[test]
fn delete_model_recreates_destination() {
    let source = source();
    seed_model(&source, "sklearn_wine");
    let dir = tempfile::tempdir().unwrap();
    export_model(&source, "sklearn_wine", model_export(), dir.path());

    let destination = destination();
    ModelImporter::new(&destination, model_import(OnConflict::Append))
        .import_model("sklearn_wine", dir.path())
        .unwrap();
    let options = ModelImportOptions { delete_model: true, ..model_import(OnConflict::Fail) };
    ModelImporter::new(&destination, options).import_model("sklearn_wine", dir.path()).unwrap();
    let versions = versions(&destination, "sklearn_wine");
    assert_eq!(versions.len(), 4);
    assert_eq!(versions[0].version, "1");
}

#[test]
fn archive_existing_versions_on_transition() {
    let source = source();
    seed_model(&source, "sklearn_wine");
    let options = ModelExportOptions { stages: stages(&[Stage::Production]), ..model_export() };
    let dir = tempfile::tempdir().unwrap();
    export_model(&source, "sklearn_wine", options, dir.path());

    let destination = destination();
    let append = model_import(OnConflict::Append);
    ModelImporter::new(&destination, append.clone()).import_model("sklearn_wine", dir.path()).unwrap();
    let archiving = ModelImportOptions { archive_existing_versions: true, ..append };
    ModelImporter::new(&destination, archiving).import_model("sklearn_wine", dir.path()).unwrap();

    let versions = versions(&destination, "sklearn_wine");
    assert_eq!(versions[0].current_stage, Stage::Archived);
    assert_eq!(versions[1].current_stage, Stage::Production);
}

#[test]
fn reference_without_backing_run_is_skipped() {
    let source = source();
    seed_model(&source, "sklearn_wine");
    let dir = tempfile::tempdir().unwrap();
    ModelExporter::new(&source, &source, model_export())
        .referencing_runs()
        .export_model("sklearn_wine", dir.path())
        .unwrap();

    let destination = destination();
    let imported = ModelImporter::new(&destination, model_import(OnConflict::Fail))
        .import_model("sklearn_wine", dir.path())
        .unwrap();
    assert_eq!(imported.failures.len(), 4);
    assert!(imported.failures.iter().all(|f| f.kind == ErrorKind::MissingBackingRun));
    assert!(destination.get_registered_model("sklearn_wine").is_ok());
}

#[test]
fn reference_resolves_through_provenance_tags() {
    let source = source();
    seed_model(&source, "sklearn_wine");
    let model_dir = tempfile::tempdir().unwrap();
    let summary = ModelExporter::new(&source, &source, model_export())
        .referencing_runs()
        .export_model("sklearn_wine", model_dir.path())
        .unwrap();
    assert_eq!(summary.backing_runs.values().map(|runs| runs.len()).sum::<usize>(), 4);

    // the backing experiment is migrated on its own beforehand
    let experiment_dir = tempfile::tempdir().unwrap();
    ExperimentExporter::new(&source, &source, experiment_export())
        .export_experiment("sklearn_wine_experiment", experiment_dir.path())
        .unwrap();
    let destination = destination();
    ExperimentImporter::new(&destination, experiment_import(OnConflict::Fail))
        .import_experiment("sklearn_wine_experiment", experiment_dir.path())
        .unwrap();

    let imported = ModelImporter::new(&destination, model_import(OnConflict::Fail))
        .import_model("sklearn_wine", model_dir.path())
        .unwrap();
    assert!(imported.failures.is_empty());
    for version in versions(&destination, "sklearn_wine") {
        let run = destination.get_run(version.run_id.as_ref().unwrap()).unwrap();
        assert_eq!(version.source, format!("{}/model", run.info.artifact_uri));
    }
}

#[test]
fn bulk_models_round_trip() {
    let source = source();
    seed_model(&source, "sklearn_wine");
    seed_model(&source, "keras_mnist");
    let dir = tempfile::tempdir().unwrap();
    let bulk_options = BulkOptions { use_threads: true, concurrency: 2 };
    let options = ModelExportOptions { stages: stages(&[Stage::Production, Stage::Staging]), ..model_export() };
    let exported = bulk::export_models(&source, &source, &Selector::parse("all"), dir.path(), &options, &bulk_options).unwrap();
    assert!(!exported.has_failures());
    // two models plus their two backing experiments
    assert_eq!(exported.objects.len(), 4);

    let destination = destination();
    let report = bulk::import_models(&destination, dir.path(), &model_import(OnConflict::Fail), &bulk_options).unwrap();
    assert!(!report.has_failures(), "{}", report);

    for name in &["sklearn_wine", "keras_mnist"] {
        let versions = versions(&destination, name);
        assert_eq!(versions.iter().map(|v| v.current_stage).collect::<Vec<_>>(), vec![Stage::Production, Stage::Staging]);
        for version in versions {
            let run = destination.get_run(version.run_id.as_ref().unwrap()).unwrap();
            assert_eq!(version.source, format!("{}/model", run.info.artifact_uri));
        }
        // only the backing runs travel along
        let experiment = destination.get_experiment_by_name(&format!("{}_experiment", name)).unwrap();
        let runs = search_all_runs(
            &destination,
            &[&experiment.experiment_id],
            "",
            ViewType::Active,
        )
        .unwrap();
        assert_eq!(runs.len(), 2);
    }
}

#[test]
fn versions_sharing_a_broken_run_all_fail() {
    for export_all_runs in &[false, true] {
        let source = source();
        let (experiment, runs) = seed_experiment(&source, "shared_experiment", 1);
        let run = source.get_run(&runs[0]).unwrap();
        source.create_registered_model("shared", "", &[]).unwrap();
        for _ in 0..2 {
            let model_source = format!("{}/model", run.info.artifact_uri);
            source.create_model_version("shared", &model_source, Some(&runs[0]), "", &[]).unwrap();
        }
        source.fail_artifact("plot.png");

        let options = ModelExportOptions { export_all_runs: *export_all_runs, ..model_export() };
        let dir = tempfile::tempdir().unwrap();
        let summary = ModelExporter::new(&source, &source, options).export_model("shared", dir.path()).unwrap();
        assert!(summary.versions.is_empty(), "export_all_runs={}", export_all_runs);
        assert!(summary.failures.iter().any(|f| f.object == "model shared / version 2" && f.kind == ErrorKind::ArtifactCopy));

        let manifest = ModelExport::read(dir.path()).unwrap();
        assert!(manifest.model.versions.is_empty());
        assert_eq!(manifest.model.failed_versions, vec!["1", "2"]);
        if *export_all_runs {
            let nested = ExperimentExport::read(&experiment_dir(dir.path(), &experiment)).unwrap();
            assert_eq!(nested.experiment.failed_runs, runs);
        }
    }
}
