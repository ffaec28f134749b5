use anyhow::{bail, Result};
use mlflow_export_import::{
    api::notebook::NotebookFormat,
    backend::{memory::InMemory, rest::Server},
    bulk::{self, BulkOptions, Selector},
    config::{OnConflict, TrackingConfig},
    experiment::{ExperimentExportOptions, ExperimentImportOptions},
    model::{ModelExportOptions, ModelImportOptions, VersionSelection},
    report::BatchReport,
    run::{RunExportOptions, RunImportOptions},
    Client,
};
use nanorand::{WyRand, RNG};
use std::path::PathBuf;

const USAGE: &str = "\
usage: migrate <command> [options]

commands:
  export-experiments  --experiments <all|name,...> --dir <dir>
  import-experiments  --dir <dir>
  export-models       --models <all|name,...> --dir <dir>
  import-models       --dir <dir>
  demo                copies random runs between two in-memory servers

options:
  --stages <stage,...>         export only versions in these stages
  --versions <version,...>     export only these versions
  --export-all-runs            export whole experiments of backing runs
  --notebook-formats <f,...>   SOURCE, HTML, JUPYTER or DBC
  --on-conflict <policy>       append, fail or reuse (default: fail)
  --delete-model               delete destination models before import
  --archive-existing           archive versions occupying a transitioned stage
  --use-src-user-id            keep the source run creator
  --threads <n>                process objects on n worker threads

The tracking server is read from MLFLOW_TRACKING_URI and MLFLOW_TRACKING_TOKEN.";

struct Args {
    command: String,
    dir: Option<PathBuf>,
    experiments: Option<Selector>,
    models: Option<Selector>,
    stages: Option<String>,
    versions: Option<String>,
    export_all_runs: bool,
    notebook_formats: Vec<NotebookFormat>,
    on_conflict: OnConflict,
    delete_model: bool,
    archive_existing: bool,
    use_src_user_id: bool,
    threads: Option<usize>,
}

impl Args {
    pub fn from_env() -> Result<Self> {
        let mut args = pico_args::Arguments::from_env();
        if args.contains(["-h", "--help"]) {
            println!("{}", USAGE);
            std::process::exit(0);
        }
        let command = args.subcommand()?.unwrap_or_default();
        let notebook_formats: Option<String> = args.opt_value_from_str("--notebook-formats")?;
        Ok(Args {
            command,
            dir: args.opt_value_from_str(["-d", "--dir"])?,
            experiments: args.opt_value_from_str("--experiments")?,
            models: args.opt_value_from_str("--models")?,
            stages: args.opt_value_from_str("--stages")?,
            versions: args.opt_value_from_str("--versions")?,
            export_all_runs: args.contains("--export-all-runs"),
            notebook_formats: NotebookFormat::parse_list(&notebook_formats.unwrap_or_default())?,
            on_conflict: args.opt_value_from_str("--on-conflict")?.unwrap_or(OnConflict::Fail),
            delete_model: args.contains("--delete-model"),
            archive_existing: args.contains("--archive-existing"),
            use_src_user_id: args.contains("--use-src-user-id"),
            threads: args.opt_value_from_str("--threads")?,
        })
    }

    fn dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => bail!("--dir is required\n\n{}", USAGE),
        }
    }

    fn bulk(&self) -> BulkOptions {
        match self.threads {
            Some(concurrency) => BulkOptions { use_threads: true, concurrency },
            None => BulkOptions::default(),
        }
    }

    fn experiment_export(&self) -> ExperimentExportOptions {
        ExperimentExportOptions {
            run: RunExportOptions {
                notebook_formats: self.notebook_formats.clone(),
                ..RunExportOptions::default()
            },
            ..ExperimentExportOptions::default()
        }
    }

    fn run_import(&self) -> RunImportOptions {
        RunImportOptions {
            use_src_user_id: self.use_src_user_id,
            ..RunImportOptions::default()
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::from_env()?;
    let report = match args.command.as_str() {
        "demo" => demo(&args)?,
        "" => bail!("{}", USAGE),
        command => {
            let config = TrackingConfig::from_env()?;
            let server = Server::new(&config);
            run(&args, command, &server)?
        }
    };
    print!("{}", report);
    if report.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

fn run(args: &Args, command: &str, server: &Server) -> Result<BatchReport> {
    let dir = args.dir()?;
    let report = match command {
        "export-experiments" => {
            let selector = args.experiments.clone().unwrap_or(Selector::All);
            bulk::export_experiments(server, server, &selector, &dir, &args.experiment_export(), &args.bulk())?
        }
        "import-experiments" => {
            let options = ExperimentImportOptions {
                on_conflict: args.on_conflict,
                run: args.run_import(),
            };
            bulk::import_experiments(server, &dir, &options, &args.bulk())?
        }
        "export-models" => {
            let selection = VersionSelection::parse(args.stages.as_deref(), args.versions.as_deref())?;
            let options = ModelExportOptions {
                stages: selection.stages().cloned(),
                versions: selection.versions().cloned(),
                export_all_runs: args.export_all_runs,
                experiment: args.experiment_export(),
            };
            let selector = args.models.clone().unwrap_or(Selector::All);
            bulk::export_models(server, server, &selector, &dir, &options, &args.bulk())?
        }
        "import-models" => {
            let options = ModelImportOptions {
                delete_model: args.delete_model,
                archive_existing_versions: args.archive_existing,
                run: args.run_import(),
                ..ModelImportOptions::new(args.on_conflict)
            };
            bulk::import_models(server, &dir, &options, &args.bulk())?
        }
        other => bail!("unknown command '{}'\n\n{}", other, USAGE),
    };
    Ok(report)
}

/// Logs a few random runs into one in-memory server and migrates them into another.
fn demo(args: &Args) -> Result<BatchReport> {
    const EXPERIMENT: &str = "My Experiment";
    let source = InMemory::new("memory://source");
    let experiment = source.create_experiment(EXPERIMENT, &[])?;
    for i in 0..3 {
        let run = source.create_run(&experiment, mlflow_export_import::timestamp(), &[])?.info.run_id;
        source.log_param(&run, "i", &format!("{}", i))?;
        source.log_param(&run, "constant", "42")?;
        let mut rng = WyRand::new_seed(i);
        for s in 0..10 {
            let int: f64 = rng.generate::<u16>().into();
            let max: f64 = std::u16::MAX.into();
            source.log_metric(&run, "rand", int / max, mlflow_export_import::timestamp(), s)?;
        }
        source.upload_artifact(&run, "notes/summary.txt", &mut format!("run {}", i).as_bytes())?;
    }

    let dir = match &args.dir {
        Some(dir) => dir.clone(),
        None => std::env::temp_dir().join("mlflow-export-import-demo"),
    };
    let exported = bulk::export_experiments(
        &source,
        &source,
        &Selector::All,
        &dir,
        &ExperimentExportOptions::default(),
        &args.bulk(),
    )?;
    if exported.has_failures() {
        return Ok(exported);
    }

    let destination = InMemory::new("memory://destination");
    let report = bulk::import_experiments(
        &destination,
        &dir,
        &ExperimentImportOptions::new(OnConflict::Append),
        &args.bulk(),
    )?;
    let imported = destination.get_experiment_by_name(EXPERIMENT)?;
    println!("Experiment {} now lives at the destination as {}", EXPERIMENT, imported.experiment_id);
    Ok(report)
}
