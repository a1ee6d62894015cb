//! Client for the MLflow tracking server REST API (`/api/2.0/mlflow`).
//!
//! Credentials are read from the same environment variables the MLflow
//! clients use: `MLFLOW_TRACKING_TOKEN` for bearer auth, or
//! `MLFLOW_TRACKING_USERNAME` / `MLFLOW_TRACKING_PASSWORD` for basic auth.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::file_store::copy_dir;
use super::{
    Experiment, Metric, ModelVersion, Param, Result, Run, RunInfo, RunStatus, TrackingError,
    TrackingStore,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const RESOURCE_DOES_NOT_EXIST: &str = "RESOURCE_DOES_NOT_EXIST";
const RESOURCE_ALREADY_EXISTS: &str = "RESOURCE_ALREADY_EXISTS";

#[derive(Debug, Clone)]
enum Auth {
    Bearer(String),
    Basic {
        username: String,
        password: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ExperimentResponse {
    experiment: Experiment,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct RunResponse {
    run: Run,
}

#[derive(Deserialize)]
struct ModelVersionResponse {
    model_version: ModelVersion,
}

#[derive(Deserialize)]
struct SearchModelVersionsResponse {
    #[serde(default)]
    model_versions: Vec<ModelVersion>,
}

#[derive(Debug, Clone)]
pub struct MlflowClient {
    base_url: String,
    client: Client,
    auth: Option<Auth>,
}

impl MlflowClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            auth: None,
        })
    }

    pub fn from_env(base_url: &str) -> Result<Self> {
        let mut client = Self::new(base_url)?;
        if let Ok(token) = env::var("MLFLOW_TRACKING_TOKEN") {
            client.auth = Some(Auth::Bearer(token));
        } else if let Ok(username) = env::var("MLFLOW_TRACKING_USERNAME") {
            client.auth = Some(Auth::Basic {
                username,
                password: env::var("MLFLOW_TRACKING_PASSWORD").ok(),
            });
        }
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{path}", self.base_url)
    }

    fn artifact_endpoint(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow-artifacts/artifacts/{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(Auth::Bearer(token)) => request.bearer_auth(token),
            Some(Auth::Basic { username, password }) => request.basic_auth(username, password.as_ref()),
            None => request,
        }
    }

    fn send<T: DeserializeOwned>(&self, endpoint: &str, request: RequestBuilder) -> Result<T> {
        let response = self.authorize(request).send()?;
        let status = response.status();
        let body = response.text()?;
        log::debug!("{endpoint} -> HTTP {status}");

        if !status.is_success() {
            let error: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();
            return Err(TrackingError::Api {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                error_code: error.error_code,
                message: if error.message.is_empty() { body } else { error.message },
            });
        }

        let body = if body.trim().is_empty() { "{}" } else { body.as_str() };
        Ok(serde_json::from_str(body)?)
    }

    fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        self.send(path, self.client.get(self.endpoint(path)).query(query))
    }

    fn post<T: DeserializeOwned>(&self, path: &str, body: &impl Serialize) -> Result<T> {
        self.send(path, self.client.post(self.endpoint(path)).json(body))
    }

    fn upload_file(&self, remote_path: &str, file: &Path) -> Result<()> {
        let bytes = fs::read(file)?;
        log::debug!("Uploading {file:?} ({} bytes) to {remote_path}", bytes.len());
        let request = self
            .client
            .put(self.artifact_endpoint(remote_path))
            .body(bytes);
        self.send::<IgnoredAny>("mlflow-artifacts/artifacts", request)?;
        Ok(())
    }
}

impl TrackingStore for MlflowClient {
    fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        match self.get::<ExperimentResponse>("experiments/get-by-name", &[("experiment_name", name)]) {
            Ok(response) => Ok(Some(response.experiment)),
            Err(TrackingError::Api {
                status, error_code, ..
            }) if status == 404 || error_code == RESOURCE_DOES_NOT_EXIST => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_experiment(&self, name: &str) -> Result<String> {
        let response: CreateExperimentResponse =
            self.post("experiments/create", &json!({ "name": name }))?;
        Ok(response.experiment_id)
    }

    fn create_run(&self, experiment_id: &str, start_time: i64) -> Result<RunInfo> {
        let response: RunResponse = self.post(
            "runs/create",
            &json!({ "experiment_id": experiment_id, "start_time": start_time }),
        )?;
        Ok(response.run.info)
    }

    fn get_run(&self, run_id: &str) -> Result<Run> {
        match self.get::<RunResponse>("runs/get", &[("run_id", run_id)]) {
            Ok(response) => Ok(response.run),
            Err(TrackingError::Api { error_code, .. }) if error_code == RESOURCE_DOES_NOT_EXIST => {
                Err(TrackingError::RunNotFound(run_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn update_run(&self, run_id: &str, status: RunStatus, end_time: i64) -> Result<()> {
        self.post::<IgnoredAny>(
            "runs/update",
            &json!({ "run_id": run_id, "status": status, "end_time": end_time }),
        )?;
        Ok(())
    }

    fn log_param(&self, run_id: &str, param: &Param) -> Result<()> {
        self.post::<IgnoredAny>(
            "runs/log-parameter",
            &json!({ "run_id": run_id, "key": param.key, "value": param.value }),
        )?;
        Ok(())
    }

    fn log_metric(&self, run_id: &str, metric: &Metric) -> Result<()> {
        self.post::<IgnoredAny>(
            "runs/log-metric",
            &json!({
                "run_id": run_id,
                "key": metric.key,
                "value": metric.value,
                "timestamp": metric.timestamp,
                "step": metric.step,
            }),
        )?;
        Ok(())
    }

    fn log_artifacts(
        &self,
        run: &RunInfo,
        local_dir: &Path,
        artifact_path: &str,
    ) -> Result<String> {
        let destination = format!("{}/{artifact_path}", run.artifact_uri.trim_end_matches('/'));

        if let Some(remote_root) = proxied_artifact_path(&run.artifact_uri) {
            for (file, relative) in list_files(local_dir)? {
                self.upload_file(&format!("{remote_root}/{artifact_path}/{relative}"), &file)?;
            }
        } else if let Some(local_root) = local_artifact_path(&run.artifact_uri) {
            copy_dir(local_dir, &local_root.join(artifact_path))?;
        } else {
            return Err(TrackingError::UnsupportedArtifactUri(run.artifact_uri.clone()));
        }

        Ok(destination)
    }

    fn create_registered_model(&self, name: &str) -> Result<()> {
        match self.post::<IgnoredAny>("registered-models/create", &json!({ "name": name })) {
            Ok(_) => Ok(()),
            Err(TrackingError::Api { error_code, .. }) if error_code == RESOURCE_ALREADY_EXISTS => {
                log::debug!("Registered model {name} already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn create_model_version(&self, name: &str, source: &str, run_id: &str) -> Result<ModelVersion> {
        let response: ModelVersionResponse = self.post(
            "model-versions/create",
            &json!({ "name": name, "source": source, "run_id": run_id }),
        )?;
        Ok(response.model_version)
    }

    fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let filter = format!("name='{}'", name.replace('\'', "\\'"));
        let response: SearchModelVersionsResponse =
            self.get("model-versions/search", &[("filter", filter.as_str())])?;
        Ok(response.model_versions)
    }
}

/// Path of a proxied `mlflow-artifacts:` location relative to the server's
/// artifact root, e.g. `mlflow-artifacts:/1/abc/artifacts` -> `1/abc/artifacts`.
fn proxied_artifact_path(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("mlflow-artifacts:")?;
    let path = match rest.strip_prefix("//") {
        // mlflow-artifacts://host:port/path
        Some(authority) => authority.split_once('/').map(|(_, path)| path)?,
        None => rest,
    };
    Some(path.trim_matches('/').to_string())
}

fn local_artifact_path(uri: &str) -> Option<PathBuf> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    uri.starts_with('/').then(|| PathBuf::from(uri))
}

/// Files under `dir` with their `/`-separated paths relative to it.
fn list_files(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(dir) {
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((path.clone(), relative));
            }
        }
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}
