use crate::{
    api::{
        artifact::FileInfo,
        client::{Client, ViewType},
        error::{CreateError, DeleteError, GetError, StorageError, UpdateError},
        experiment::{Experiment, ExperimentTag},
        model::{ModelTag, ModelVersion, RegisteredModel, Stage},
        notebook::{NotebookFormat, NotebookSource},
        run::{Metric, Run, RunInfo, RunStatus, RunTag},
        search::{PageToken, Search, MAX_RESULTS},
    },
    config::TrackingConfig,
    ExperimentId, RunId,
};
use anyhow::{anyhow, Context, Error};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::Display,
    io::{self, Read, Write},
    sync::{Mutex, PoisonError},
};
use tracing::debug;

#[derive(Deserialize)]
struct RestErrorResponse {
    pub error_code: RestErrorCode,
    pub message: String,
}
#[derive(Debug, Clone, thiserror::Error)]
pub enum RestError {
    #[error("{status} {code}: {message}")]
    Known { status: u16, code: RestErrorCode, message: String },
    #[error("Unknown {status} error:\n{body}")]
    Unknown { status: u16, body: String },
}
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "&str")]
pub enum RestErrorCode {
    ResourceAlreadyExists,
    ResourceDoesNotExist,
    InvalidParameterValue,
    Unknown(String),
}
impl From<&str> for RestErrorCode {
    fn from(value: &str) -> Self {
        match value {
            "RESOURCE_ALREADY_EXISTS" => RestErrorCode::ResourceAlreadyExists,
            "RESOURCE_DOES_NOT_EXIST" => RestErrorCode::ResourceDoesNotExist,
            "INVALID_PARAMETER_VALUE" => RestErrorCode::InvalidParameterValue,
            _ => return RestErrorCode::Unknown(value.to_owned()),
        }
    }
}
impl Display for RestErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl RestError {
    fn is(&self, expected: RestErrorCode) -> bool {
        match self {
            RestError::Known { code, .. } => *code == expected,
            // artifact and workspace routes answer plain 404s
            RestError::Unknown { status, .. } => expected == RestErrorCode::ResourceDoesNotExist && *status == 404,
        }
    }
}

fn not_found(key: impl Into<String>) -> impl FnOnce(RestError) -> GetError {
    let key = key.into();
    move |error| {
        if error.is(RestErrorCode::ResourceDoesNotExist) {
            GetError::DoesNotExist(key)
        } else {
            GetError::Storage(error.into())
        }
    }
}

fn already_exists(key: impl Into<String>) -> impl FnOnce(RestError) -> CreateError {
    let key = key.into();
    move |error| {
        if error.is(RestErrorCode::ResourceAlreadyExists) {
            CreateError::AlreadyExists(key)
        } else {
            CreateError::Storage(error.into())
        }
    }
}

/// MLflow tracking server reached over its REST API.
pub struct Server {
    host: String,
    api_url: String,
    token: Option<String>,
    /// Proxy path of each run's artifact root, looked up on the first transfer.
    artifact_roots: Mutex<BTreeMap<RunId, String>>,
}

fn parse_error(response: ureq::Response) -> RestError {
    let status = response.status();
    let body = response
        .into_string()
        .unwrap_or_else(|_| "Could not turn error body into String.".to_string());

    let response = serde_json::from_str::<RestErrorResponse>(&body).ok();
    if let Some(response) = response {
        RestError::Known {
            status,
            code: response.error_code,
            message: response.message,
        }
    } else {
        RestError::Unknown { status, body }
    }
}

impl Server {
    pub fn new(config: &TrackingConfig) -> Self {
        Server {
            host: config.uri.clone(),
            api_url: config.api_url(),
            token: config.token.clone(),
            artifact_roots: Mutex::new(BTreeMap::new()),
        }
    }

    fn request(&self, method: Method, url: &str) -> ureq::Request {
        let mut request = method.request(url);
        if let Some(token) = &self.token {
            request.set("Authorization", &format!("Bearer {}", token));
        }
        request
    }

    fn execute<Ep, Val, Hand, Err>(&self, request: Ep, error_handler: Hand) -> Result<Val, Err>
    where
        Ep: Endpoint<Value = Val> + EndpointExt,
        Hand: FnOnce(RestError) -> Err,
        Err: From<anyhow::Error>,
    {
        let url = format!("{}/{}", self.api_url, Ep::PATH);
        debug!(method = ?Ep::METHOD, path = Ep::PATH, "rest call");
        let http_response = if Ep::METHOD == Method::Get {
            let query = Ep::write_request_query(&request).context("serializing request failed")?;
            self.request(Ep::METHOD, &format!("{}?{}", url, query)).call()
        } else {
            let buffer = Ep::write_request_string(&request).context("serializing request failed")?;
            self.request(Ep::METHOD, &url)
                .set("Content-Type", "application/json")
                .send_string(&buffer)
        };
        if http_response.error() {
            let error = parse_error(http_response);
            Err(error_handler(error))
        } else {
            let response_string = http_response.into_string().context("failed to turn response into string")?;
            let response = Ep::read_response_string(&response_string)
                .with_context(|| format!("deserializing response failed:\n{}", &response_string))?;
            let value = Ep::extract(response);
            Ok(value)
        }
    }

    /// Proxy URL of `path` below the run's artifact root.
    fn artifact_url(&self, run: &RunId, path: &str) -> Result<String, StorageError> {
        let cached = self.artifact_roots().get(run).cloned();
        let root = match cached {
            Some(root) => root,
            None => {
                let info = self.get_run(run).map_err(|error| anyhow!(error))?.info;
                let root = proxy_path(&info.artifact_uri)
                    .ok_or_else(|| anyhow!("artifact root '{}' is not served through the tracking server", info.artifact_uri))?
                    .to_owned();
                self.artifact_roots().insert(run.clone(), root.clone());
                root
            }
        };
        Ok(artifact_proxy_url(&self.api_url, &root, path))
    }

    fn artifact_roots(&self) -> std::sync::MutexGuard<'_, BTreeMap<RunId, String>> {
        self.artifact_roots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn artifact_proxy_url(api_url: &str, root: &str, path: &str) -> String {
    let segments: Vec<_> = root
        .split('/')
        .chain(path.split('/'))
        .filter(|segment| !segment.is_empty())
        .map(urlencoding::encode)
        .collect();
    format!("{}/2.0/mlflow-artifacts/artifacts/{}", api_url, segments.join("/"))
}

/// Path of an `mlflow-artifacts:` URI relative to the artifact proxy, dropping any authority.
fn proxy_path(artifact_uri: &str) -> Option<&str> {
    let rest = artifact_uri.strip_prefix("mlflow-artifacts:")?;
    let rest = match rest.strip_prefix("//") {
        Some(authority_and_path) => authority_and_path.find('/').map(|i| &authority_and_path[i..])?,
        None => rest,
    };
    Some(rest.trim_matches('/'))
}

impl Client for Server {
    fn host(&self) -> &str {
        &self.host
    }

    fn create_experiment(&self, name: &str, tags: &[ExperimentTag]) -> Result<ExperimentId, CreateError> {
        let request = CreateExperiment { name, tags };
        self.execute(request, already_exists(name))
    }

    fn search_experiments(&self, view_type: ViewType, filter: Option<&str>) -> Result<Vec<Experiment>, StorageError> {
        let mut experiments = Vec::new();
        let mut page_token = None;
        loop {
            let request = SearchExperiments {
                view_type,
                filter,
                max_results: MAX_RESULTS,
                page_token: page_token.as_ref(),
            };
            let page = self.execute(request, StorageError::from)?;
            experiments.extend(page.experiments);
            match page.next_page_token {
                Some(token) if !token.as_ref().is_empty() => page_token = Some(token),
                _ => return Ok(experiments),
            }
        }
    }

    fn get_experiment(&self, id: &ExperimentId) -> Result<Experiment, GetError> {
        let request = GetExperiment { experiment_id: id };
        self.execute(request, not_found(id.as_ref()))
    }

    fn get_experiment_by_name(&self, name: &str) -> Result<Experiment, GetError> {
        let request = GetExperimentByName { experiment_name: name };
        self.execute(request, not_found(name))
    }

    fn set_experiment_tag(&self, id: &ExperimentId, key: &str, value: &str) -> Result<(), UpdateError> {
        let request = SetExperimentTag { experiment_id: id, key, value };
        self.execute(request, not_found(id.as_ref()))
    }

    fn delete_experiment(&self, id: &ExperimentId) -> Result<(), DeleteError> {
        let request = DeleteExperiment { experiment_id: id };
        self.execute(request, not_found(id.as_ref()))
    }

    fn create_run(&self, experiment_id: &ExperimentId, start_time: i64, tags: &[RunTag]) -> Result<Run, StorageError> {
        let request = CreateRun { experiment_id, start_time, tags };
        self.execute(request, StorageError::from)
    }

    fn get_run(&self, id: &RunId) -> Result<Run, GetError> {
        let request = GetRun { run_id: id };
        self.execute(request, not_found(id.as_ref()))
    }

    fn update_run(&self, id: &RunId, status: RunStatus, end_time: Option<i64>) -> Result<RunInfo, UpdateError> {
        let request = UpdateRun { run_id: id, status, end_time };
        self.execute(request, not_found(id.as_ref()))
    }

    fn search_runs(&self, experiment_ids: &[&ExperimentId], filter: &str, run_view_type: ViewType, max_results: i32, page_token: Option<&PageToken>) -> Result<Search, StorageError> {
        let request = SearchRuns {
            experiment_ids,
            filter,
            run_view_type,
            max_results,
            page_token,
        };
        self.execute(request, StorageError::from)
    }

    fn get_metric_history(&self, run: &RunId, metric: &str) -> Result<Vec<Metric>, GetError> {
        let request = GetMetricHistory { run_id: run, metric_key: metric };
        self.execute(request, not_found(run.as_ref()))
    }

    fn log_param(&self, run_id: &RunId, key: &str, value: &str) -> Result<(), StorageError> {
        let request = LogParam { run_id, key, value };
        self.execute(request, StorageError::from)
    }

    fn log_metric(&self, run_id: &RunId, key: &str, value: f64, timestamp: i64, step: i64) -> Result<(), StorageError> {
        let request = LogMetric { run_id, key, value, timestamp, step };
        self.execute(request, StorageError::from)
    }

    fn set_tag(&self, run_id: &RunId, key: &str, value: &str) -> Result<(), StorageError> {
        let request = SetTag { run_id, key, value };
        self.execute(request, StorageError::from)
    }

    fn list_artifacts(&self, run: &RunId, path: Option<&str>) -> Result<Vec<FileInfo>, StorageError> {
        let request = ListArtifacts { run_id: run, path };
        self.execute(request, StorageError::from)
    }

    fn download_artifact(&self, run: &RunId, path: &str, sink: &mut dyn Write) -> Result<u64, StorageError> {
        let url = self.artifact_url(run, path)?;
        let response = self.request(Method::Get, &url).call();
        if response.error() {
            return Err(parse_error(response)).with_context(|| format!("downloading artifact '{}'", path));
        }
        let copied = io::copy(&mut response.into_reader(), sink).with_context(|| format!("downloading artifact '{}'", path))?;
        Ok(copied)
    }

    fn upload_artifact(&self, run: &RunId, path: &str, source: &mut dyn Read) -> Result<(), StorageError> {
        let url = self.artifact_url(run, path)?;
        let response = self.request(Method::Put, &url).send(source);
        if response.error() {
            return Err(parse_error(response)).with_context(|| format!("uploading artifact '{}'", path));
        }
        Ok(())
    }

    fn create_registered_model(&self, name: &str, description: &str, tags: &[ModelTag]) -> Result<RegisteredModel, CreateError> {
        let request = CreateRegisteredModel { name, description, tags };
        self.execute(request, already_exists(name))
    }

    fn get_registered_model(&self, name: &str) -> Result<RegisteredModel, GetError> {
        let request = GetRegisteredModel { name };
        self.execute(request, not_found(name))
    }

    fn delete_registered_model(&self, name: &str) -> Result<(), DeleteError> {
        let request = DeleteRegisteredModel { name };
        self.execute(request, not_found(name))
    }

    fn search_registered_models(&self, filter: Option<&str>) -> Result<Vec<RegisteredModel>, StorageError> {
        let mut models = Vec::new();
        let mut page_token = None;
        loop {
            let request = SearchRegisteredModels {
                filter,
                max_results: MAX_RESULTS,
                page_token: page_token.as_ref(),
            };
            let page = self.execute(request, StorageError::from)?;
            models.extend(page.registered_models);
            match page.next_page_token {
                Some(token) if !token.as_ref().is_empty() => page_token = Some(token),
                _ => return Ok(models),
            }
        }
    }

    fn set_registered_model_tag(&self, name: &str, key: &str, value: &str) -> Result<(), UpdateError> {
        let request = SetRegisteredModelTag { name, key, value };
        self.execute(request, not_found(name))
    }

    fn create_model_version(&self, name: &str, source: &str, run_id: Option<&RunId>, description: &str, tags: &[ModelTag]) -> Result<ModelVersion, StorageError> {
        let request = CreateModelVersion { name, source, run_id, description, tags };
        self.execute(request, StorageError::from)
    }

    fn get_model_version(&self, name: &str, version: &str) -> Result<ModelVersion, GetError> {
        let request = GetModelVersion { name, version };
        self.execute(request, not_found(format!("{}/{}", name, version)))
    }

    fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>, StorageError> {
        let filter = format!("name='{}'", name.replace('\'', "\\'"));
        let mut versions = Vec::new();
        let mut page_token = None;
        loop {
            let request = SearchModelVersions {
                filter: &filter,
                max_results: MAX_RESULTS,
                page_token: page_token.as_ref(),
            };
            let page = self.execute(request, StorageError::from)?;
            versions.extend(page.model_versions);
            match page.next_page_token {
                Some(token) if !token.as_ref().is_empty() => page_token = Some(token),
                _ => return Ok(versions),
            }
        }
    }

    fn transition_model_version_stage(&self, name: &str, version: &str, stage: Stage, archive_existing: bool) -> Result<ModelVersion, UpdateError> {
        let request = TransitionModelVersionStage {
            name,
            version,
            stage,
            archive_existing_versions: archive_existing,
        };
        self.execute(request, not_found(format!("{}/{}", name, version)))
    }

    fn set_model_version_tag(&self, name: &str, version: &str, key: &str, value: &str) -> Result<(), UpdateError> {
        let request = SetModelVersionTag { name, version, key, value };
        self.execute(request, not_found(format!("{}/{}", name, version)))
    }
}

impl NotebookSource for Server {
    fn export_notebook(&self, path: &str, format: NotebookFormat) -> Result<Option<Vec<u8>>, StorageError> {
        let query = serde_qs::to_string(&ExportNotebook {
            path,
            format: format.as_str(),
            direct_download: true,
        })?;
        let url = format!("{}/2.0/workspace/export?{}", self.api_url, query);
        let response = self.request(Method::Get, &url).call();
        if response.error() {
            let error = parse_error(response);
            if error.is(RestErrorCode::ResourceDoesNotExist) || error.is(RestErrorCode::InvalidParameterValue) {
                return Ok(None);
            }
            return Err(error).with_context(|| format!("exporting notebook '{}' as {}", path, format));
        }
        let mut bytes = Vec::new();
        response.into_reader().read_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    fn request(self, url: &str) -> ureq::Request {
        match self {
            Method::Get => ureq::get(url),
            Method::Post => ureq::post(url),
            Method::Put => ureq::put(url),
            Method::Delete => ureq::delete(url),
        }
    }
}

trait Endpoint {
    const PATH: &'static str;
    const METHOD: Method;

    type Response;
    type Value;

    fn extract(response: Self::Response) -> Self::Value;
}
trait VoidEndpoint {
    const PATH: &'static str;
    const METHOD: Method;
}
trait EndpointExt: Endpoint {
    fn read_response_string(response: &str) -> Result<Self::Response, Error>;
    fn write_request_string(request: &Self) -> Result<String, Error>;
    fn write_request_query(request: &Self) -> Result<String, Error>;
}
impl<E> Endpoint for E
where
    E: VoidEndpoint,
{
    const PATH: &'static str = E::PATH;
    const METHOD: Method = E::METHOD;

    type Response = VoidResponse;
    type Value = ();

    fn extract(_response: Self::Response) -> Self::Value {}
}
impl<P, R, V> EndpointExt for P
where
    P: Serialize,
    R: DeserializeOwned,
    P: Endpoint<Response = R, Value = V>,
{
    fn read_response_string(response: &str) -> Result<Self::Response, Error> {
        let response = serde_json::from_str::<'_, R>(response)?;
        Ok(response)
    }

    fn write_request_string(request: &Self) -> Result<String, Error> {
        Ok(serde_json::to_string(request)?)
    }

    fn write_request_query(request: &Self) -> Result<String, Error> {
        Ok(serde_qs::to_string(request)?)
    }
}

#[derive(Deserialize)]
struct VoidResponse {}

#[derive(Debug, Clone, Copy, Serialize)]
struct CreateExperiment<'a> {
    pub name: &'a str,
    pub tags: &'a [ExperimentTag],
}
#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: ExperimentId,
}
impl Endpoint for CreateExperiment<'_> {
    const PATH: &'static str = "2.0/mlflow/experiments/create";
    const METHOD: Method = Method::Post;
    type Response = CreateExperimentResponse;
    type Value = ExperimentId;

    fn extract(response: Self::Response) -> Self::Value {
        response.experiment_id
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct GetExperiment<'a> {
    pub experiment_id: &'a ExperimentId,
}
#[derive(Deserialize)]
struct GetExperimentResponse {
    experiment: Experiment,
}
impl Endpoint for GetExperiment<'_> {
    const PATH: &'static str = "2.0/mlflow/experiments/get";
    const METHOD: Method = Method::Get;
    type Value = Experiment;
    type Response = GetExperimentResponse;

    fn extract(response: Self::Response) -> Self::Value {
        response.experiment
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct SearchExperiments<'a> {
    pub view_type: ViewType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<&'a str>,
    pub max_results: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<&'a PageToken>,
}
#[derive(Deserialize)]
struct SearchExperimentsResponse {
    #[serde(default)]
    experiments: Vec<Experiment>,
    #[serde(default)]
    next_page_token: Option<PageToken>,
}
impl Endpoint for SearchExperiments<'_> {
    const PATH: &'static str = "2.0/mlflow/experiments/search";
    const METHOD: Method = Method::Post;
    type Response = SearchExperimentsResponse;
    type Value = SearchExperimentsResponse;

    fn extract(response: Self::Response) -> Self::Value {
        response
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct GetExperimentByName<'a> {
    pub experiment_name: &'a str,
}
impl Endpoint for GetExperimentByName<'_> {
    const PATH: &'static str = "2.0/mlflow/experiments/get-by-name";
    const METHOD: Method = Method::Get;
    type Value = Experiment;
    type Response = GetExperimentResponse;

    fn extract(response: Self::Response) -> Self::Value {
        response.experiment
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct SetExperimentTag<'a> {
    pub experiment_id: &'a ExperimentId,
    pub key: &'a str,
    pub value: &'a str,
}
impl VoidEndpoint for SetExperimentTag<'_> {
    const PATH: &'static str = "2.0/mlflow/experiments/set-experiment-tag";
    const METHOD: Method = Method::Post;
}

#[derive(Debug, Clone, Copy, Serialize)]
struct DeleteExperiment<'a> {
    pub experiment_id: &'a ExperimentId,
}
impl VoidEndpoint for DeleteExperiment<'_> {
    const PATH: &'static str = "2.0/mlflow/experiments/delete";
    const METHOD: Method = Method::Post;
}

#[derive(Debug, Clone, Copy, Serialize)]
struct CreateRun<'a> {
    pub experiment_id: &'a ExperimentId,
    pub start_time: i64,
    pub tags: &'a [RunTag],
}
#[derive(Deserialize)]
struct RunResponse {
    run: Run,
}
impl Endpoint for CreateRun<'_> {
    const PATH: &'static str = "2.0/mlflow/runs/create";
    const METHOD: Method = Method::Post;
    type Response = RunResponse;
    type Value = Run;

    fn extract(response: Self::Response) -> Self::Value {
        response.run
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct GetRun<'a> {
    pub run_id: &'a RunId,
}
impl Endpoint for GetRun<'_> {
    const PATH: &'static str = "2.0/mlflow/runs/get";
    const METHOD: Method = Method::Get;
    type Response = RunResponse;
    type Value = Run;

    fn extract(response: Self::Response) -> Self::Value {
        response.run
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct SearchRuns<'a> {
    pub experiment_ids: &'a [&'a ExperimentId],
    pub filter: &'a str,
    pub run_view_type: ViewType,
    pub max_results: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<&'a PageToken>,
}
impl Endpoint for SearchRuns<'_> {
    const PATH: &'static str = "2.0/mlflow/runs/search";
    const METHOD: Method = Method::Post;
    type Response = Search;
    type Value = Search;

    fn extract(response: Self::Response) -> Self::Value {
        response
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct GetMetricHistory<'a> {
    pub run_id: &'a RunId,
    pub metric_key: &'a str,
}
#[derive(Deserialize)]
struct GetMetricHistoryResponse {
    #[serde(default)]
    metrics: Vec<Metric>,
}
impl Endpoint for GetMetricHistory<'_> {
    const PATH: &'static str = "2.0/mlflow/metrics/get-history";
    const METHOD: Method = Method::Get;
    type Response = GetMetricHistoryResponse;
    type Value = Vec<Metric>;

    fn extract(response: Self::Response) -> Self::Value {
        response.metrics
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct LogParam<'a> {
    pub run_id: &'a RunId,
    pub key: &'a str,
    pub value: &'a str,
}
impl VoidEndpoint for LogParam<'_> {
    const PATH: &'static str = "2.0/mlflow/runs/log-parameter";
    const METHOD: Method = Method::Post;
}

#[derive(Debug, Clone, Copy, Serialize)]
struct LogMetric<'a> {
    pub run_id: &'a RunId,
    pub key: &'a str,
    pub value: f64,
    pub timestamp: i64,
    pub step: i64,
}
impl VoidEndpoint for LogMetric<'_> {
    const PATH: &'static str = "2.0/mlflow/runs/log-metric";
    const METHOD: Method = Method::Post;
}

#[derive(Debug, Clone, Copy, Serialize)]
struct SetTag<'a> {
    pub run_id: &'a RunId,
    pub key: &'a str,
    pub value: &'a str,
}
impl VoidEndpoint for SetTag<'_> {
    const PATH: &'static str = "2.0/mlflow/runs/set-tag";
    const METHOD: Method = Method::Post;
}

#[derive(Debug, Clone, Copy, Serialize)]
struct UpdateRun<'a> {
    pub run_id: &'a RunId,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}
#[derive(Deserialize)]
struct UpdateRunResponse {
    run_info: RunInfo,
}
impl Endpoint for UpdateRun<'_> {
    const PATH: &'static str = "2.0/mlflow/runs/update";
    const METHOD: Method = Method::Post;
    type Response = UpdateRunResponse;
    type Value = RunInfo;

    fn extract(response: Self::Response) -> Self::Value {
        response.run_info
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct ListArtifacts<'a> {
    pub run_id: &'a RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<&'a str>,
}
#[derive(Deserialize)]
struct ListArtifactsResponse {
    #[serde(default)]
    files: Vec<FileInfo>,
}
impl Endpoint for ListArtifacts<'_> {
    const PATH: &'static str = "2.0/mlflow/artifacts/list";
    const METHOD: Method = Method::Get;
    type Response = ListArtifactsResponse;
    type Value = Vec<FileInfo>;

    fn extract(response: Self::Response) -> Self::Value {
        response.files
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct CreateRegisteredModel<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub tags: &'a [ModelTag],
}
#[derive(Deserialize)]
struct RegisteredModelResponse {
    registered_model: RegisteredModel,
}
impl Endpoint for CreateRegisteredModel<'_> {
    const PATH: &'static str = "2.0/mlflow/registered-models/create";
    const METHOD: Method = Method::Post;
    type Response = RegisteredModelResponse;
    type Value = RegisteredModel;

    fn extract(response: Self::Response) -> Self::Value {
        response.registered_model
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct GetRegisteredModel<'a> {
    pub name: &'a str,
}
impl Endpoint for GetRegisteredModel<'_> {
    const PATH: &'static str = "2.0/mlflow/registered-models/get";
    const METHOD: Method = Method::Get;
    type Response = RegisteredModelResponse;
    type Value = RegisteredModel;

    fn extract(response: Self::Response) -> Self::Value {
        response.registered_model
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct DeleteRegisteredModel<'a> {
    pub name: &'a str,
}
impl VoidEndpoint for DeleteRegisteredModel<'_> {
    const PATH: &'static str = "2.0/mlflow/registered-models/delete";
    const METHOD: Method = Method::Delete;
}

#[derive(Debug, Clone, Copy, Serialize)]
struct SearchRegisteredModels<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<&'a str>,
    pub max_results: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<&'a PageToken>,
}
#[derive(Deserialize)]
struct SearchRegisteredModelsResponse {
    #[serde(default)]
    registered_models: Vec<RegisteredModel>,
    #[serde(default)]
    next_page_token: Option<PageToken>,
}
impl Endpoint for SearchRegisteredModels<'_> {
    const PATH: &'static str = "2.0/mlflow/registered-models/search";
    const METHOD: Method = Method::Get;
    type Response = SearchRegisteredModelsResponse;
    type Value = SearchRegisteredModelsResponse;

    fn extract(response: Self::Response) -> Self::Value {
        response
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct SetRegisteredModelTag<'a> {
    pub name: &'a str,
    pub key: &'a str,
    pub value: &'a str,
}
impl VoidEndpoint for SetRegisteredModelTag<'_> {
    const PATH: &'static str = "2.0/mlflow/registered-models/set-tag";
    const METHOD: Method = Method::Post;
}

#[derive(Debug, Clone, Copy, Serialize)]
struct CreateModelVersion<'a> {
    pub name: &'a str,
    pub source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<&'a RunId>,
    pub description: &'a str,
    pub tags: &'a [ModelTag],
}
#[derive(Deserialize)]
struct ModelVersionResponse {
    model_version: ModelVersion,
}
impl Endpoint for CreateModelVersion<'_> {
    const PATH: &'static str = "2.0/mlflow/model-versions/create";
    const METHOD: Method = Method::Post;
    type Response = ModelVersionResponse;
    type Value = ModelVersion;

    fn extract(response: Self::Response) -> Self::Value {
        response.model_version
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct GetModelVersion<'a> {
    pub name: &'a str,
    pub version: &'a str,
}
impl Endpoint for GetModelVersion<'_> {
    const PATH: &'static str = "2.0/mlflow/model-versions/get";
    const METHOD: Method = Method::Get;
    type Response = ModelVersionResponse;
    type Value = ModelVersion;

    fn extract(response: Self::Response) -> Self::Value {
        response.model_version
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct SearchModelVersions<'a> {
    pub filter: &'a str,
    pub max_results: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<&'a PageToken>,
}
#[derive(Deserialize)]
struct SearchModelVersionsResponse {
    #[serde(default)]
    model_versions: Vec<ModelVersion>,
    #[serde(default)]
    next_page_token: Option<PageToken>,
}
impl Endpoint for SearchModelVersions<'_> {
    const PATH: &'static str = "2.0/mlflow/model-versions/search";
    const METHOD: Method = Method::Get;
    type Response = SearchModelVersionsResponse;
    type Value = SearchModelVersionsResponse;

    fn extract(response: Self::Response) -> Self::Value {
        response
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct TransitionModelVersionStage<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub stage: Stage,
    pub archive_existing_versions: bool,
}
impl Endpoint for TransitionModelVersionStage<'_> {
    const PATH: &'static str = "2.0/mlflow/model-versions/transition-stage";
    const METHOD: Method = Method::Post;
    type Response = ModelVersionResponse;
    type Value = ModelVersion;

    fn extract(response: Self::Response) -> Self::Value {
        response.model_version
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct SetModelVersionTag<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub key: &'a str,
    pub value: &'a str,
}
impl VoidEndpoint for SetModelVersionTag<'_> {
    const PATH: &'static str = "2.0/mlflow/model-versions/set-tag";
    const METHOD: Method = Method::Post;
}

#[derive(Debug, Clone, Copy, Serialize)]
struct ExportNotebook<'a> {
    pub path: &'a str,
    pub format: &'a str,
    pub direct_download: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_get_experiment_response() {
        let response = r#"
        {
            "experiment": {
                "experiment_id": "1",
                "name": "T1",
                "artifact_location": "./mlruns/1",
                "lifecycle_stage": "active"
            }
        }
        "#;
        let parsed = serde_json::from_str::<GetExperimentResponse>(response).unwrap();
        assert_eq!(parsed.experiment.experiment_id.as_ref(), "1");
    }

    #[test]
    fn parse_model_version_response() {
        let response = r#"
        {
            "model_version": {
                "name": "sklearn_wine",
                "version": "3",
                "creation_timestamp": "1611337291323",
                "current_stage": "Production",
                "source": "mlflow-artifacts:/1/4cf4f1c5/artifacts/sklearn-model",
                "run_id": "4cf4f1c5",
                "status": "READY"
            }
        }
        "#;
        let parsed = serde_json::from_str::<ModelVersionResponse>(response).unwrap();
        assert_eq!(parsed.model_version.current_stage, Stage::Production);
        assert_eq!(parsed.model_version.run_id, Some(RunId::from("4cf4f1c5")));
    }

    #[test]
    fn get_requests_use_query_strings() {
        let run_id = RunId::from("abc");
        let query = GetMetricHistory::write_request_query(&GetMetricHistory { run_id: &run_id, metric_key: "rmse" }).unwrap();
        assert_eq!(query, "run_id=abc&metric_key=rmse");
    }

    #[test]
    fn parse_known_error_code() {
        let code: RestErrorCode = serde_json::from_str("\"RESOURCE_DOES_NOT_EXIST\"").unwrap();
        assert_eq!(code, RestErrorCode::ResourceDoesNotExist);
        let error = RestError::Unknown { status: 404, body: String::new() };
        assert!(error.is(RestErrorCode::ResourceDoesNotExist));
    }

    #[test]
    fn artifact_urls_are_encoded() {
        assert_eq!(
            artifact_proxy_url("http://h/api", "1/abc/artifacts", "/model/my model#1?.pkl"),
            "http://h/api/2.0/mlflow-artifacts/artifacts/1/abc/artifacts/model/my%20model%231%3F.pkl"
        );
    }

    #[test]
    fn artifact_root_is_cached() {
        let config = TrackingConfig::new(Some("http://127.0.0.1:9".into()), None).unwrap();
        let server = Server::new(&config);
        server.artifact_roots().insert(RunId::from("abc"), "1/abc/artifacts".into());
        assert_eq!(
            server.artifact_url(&RunId::from("abc"), "plot.png").unwrap(),
            "http://127.0.0.1:9/api/2.0/mlflow-artifacts/artifacts/1/abc/artifacts/plot.png"
        );
    }

    #[test]
    fn proxy_paths() {
        assert_eq!(proxy_path("mlflow-artifacts:/1/abc/artifacts"), Some("1/abc/artifacts"));
        assert_eq!(proxy_path("mlflow-artifacts://tracking:5000/1/abc/artifacts/"), Some("1/abc/artifacts"));
        assert_eq!(proxy_path("s3://bucket/1/abc/artifacts"), None);
    }
}
