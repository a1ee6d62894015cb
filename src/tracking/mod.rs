//! Experiment tracking.
//!
//! The pipeline talks to the tracking service through an explicit
//! [`TrackingSession`] handle. Stores implement [`TrackingStore`]:
//!
//! - [`MlflowClient`]: an MLflow tracking server over its REST API
//! - [`FileStore`]: a local directory, used when no server is configured
//!
//! A run is created through the session and wrapped in an [`ActiveRun`]. The
//! guard marks the run `FAILED` if it is dropped before [`ActiveRun::finish`],
//! so an error or a panic inside the run scope never leaves it `RUNNING`.

pub mod autolog;
pub mod file_store;
pub mod mlflow;
pub mod signature;

use std::fmt;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use autolog::Autolog;
pub use file_store::FileStore;
pub use mlflow::MlflowClient;
pub use signature::{ColumnType, ModelSignature};

/// Status of a tracking run, spelled the way MLflow serializes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "RUNNING",
            Self::Scheduled => "SCHEDULED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    #[serde(default)]
    pub artifact_location: String,
    #[serde(default)]
    pub lifecycle_stage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    pub status: RunStatus,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub artifact_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    pub timestamp: i64,
    pub step: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunData {
    /// Latest value of every metric key.
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub params: Vec<Param>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub info: RunInfo,
    #[serde(default)]
    pub data: RunData,
}

impl Run {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.data
            .params
            .iter()
            .find(|param| param.key == key)
            .map(|param| param.value.as_str())
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.data
            .metrics
            .iter()
            .find(|metric| metric.key == key)
            .map(|metric| metric.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub creation_timestamp: i64,
    pub source: String,
    #[serde(default)]
    pub run_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} failed with HTTP {status} ({error_code}): {message}")]
    Api {
        endpoint: String,
        status: u16,
        error_code: String,
        message: String,
    },

    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} is {status}, not RUNNING")]
    RunNotActive { run_id: String, status: RunStatus },

    #[error("Unsupported artifact location: {0}")]
    UnsupportedArtifactUri(String),
}

pub type Result<T> = std::result::Result<T, TrackingError>;

/// Persistence and registry operations of a tracking service.
pub trait TrackingStore: Send + Sync {
    fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>>;

    /// Creates the experiment and returns its id.
    fn create_experiment(&self, name: &str) -> Result<String>;

    fn create_run(&self, experiment_id: &str, start_time: i64) -> Result<RunInfo>;

    fn get_run(&self, run_id: &str) -> Result<Run>;

    fn update_run(&self, run_id: &str, status: RunStatus, end_time: i64) -> Result<()>;

    fn log_param(&self, run_id: &str, param: &Param) -> Result<()>;

    fn log_metric(&self, run_id: &str, metric: &Metric) -> Result<()>;

    /// Uploads the files under `local_dir` to `<run artifacts>/<artifact_path>`
    /// and returns the URI of the uploaded directory.
    fn log_artifacts(&self, run: &RunInfo, local_dir: &Path, artifact_path: &str)
    -> Result<String>;

    /// Creates a registered model. Succeeds if the name is already registered.
    fn create_registered_model(&self, name: &str) -> Result<()>;

    fn create_model_version(&self, name: &str, source: &str, run_id: &str)
    -> Result<ModelVersion>;

    fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>>;
}

/// Picks a store for a tracking URI: `http(s)://` talks to an MLflow server,
/// anything else is a local directory (an optional `file://` prefix is
/// stripped).
pub fn open_store(uri: &str) -> Result<Box<dyn TrackingStore>> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        log::info!("Tracking to MLflow server at {uri}");
        Ok(Box::new(MlflowClient::from_env(uri)?))
    } else {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        log::info!("Tracking to local store at {path}");
        Ok(Box::new(FileStore::new(path)?))
    }
}

/// Returns the id of the experiment called `name`, creating it if needed.
pub fn ensure_experiment(store: &dyn TrackingStore, name: &str) -> Result<Experiment> {
    if let Some(experiment) = store.get_experiment_by_name(name)? {
        log::debug!("Found experiment {name} ({})", experiment.experiment_id);
        return Ok(experiment);
    }

    let experiment_id = store.create_experiment(name)?;
    log::info!("Created experiment {name} ({experiment_id})");
    store
        .get_experiment_by_name(name)?
        .ok_or_else(|| TrackingError::ExperimentNotFound(name.to_string()))
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Tracking handle for one experiment.
pub struct TrackingSession {
    store: Box<dyn TrackingStore>,
    experiment: Experiment,
}

impl TrackingSession {
    pub fn open(store: Box<dyn TrackingStore>, experiment_name: &str) -> Result<Self> {
        let experiment = ensure_experiment(store.as_ref(), experiment_name)?;
        Ok(Self { store, experiment })
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn store(&self) -> &dyn TrackingStore {
        self.store.as_ref()
    }

    pub fn create_run(&self) -> Result<RunInfo> {
        let info = self
            .store
            .create_run(&self.experiment.experiment_id, now_ms())?;
        log::info!(
            "Created run {} in experiment {}",
            info.run_id,
            self.experiment.name
        );
        Ok(info)
    }

    /// Scopes a created run: it is finalized when the returned guard ends.
    pub fn start_run(&self, info: RunInfo) -> ActiveRun<'_> {
        ActiveRun {
            store: self.store.as_ref(),
            info,
            finished: false,
        }
    }
}

pub struct ActiveRun<'a> {
    store: &'a dyn TrackingStore,
    info: RunInfo,
    finished: bool,
}

impl ActiveRun<'_> {
    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    pub fn log_param(&self, key: &str, value: impl fmt::Display) -> Result<()> {
        let param = Param {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.store.log_param(&self.info.run_id, &param)
    }

    pub fn log_metric(&self, key: &str, value: f64, step: i64) -> Result<()> {
        let metric = Metric {
            key: key.to_string(),
            value,
            timestamp: now_ms(),
            step,
        };
        self.store.log_metric(&self.info.run_id, &metric)
    }

    /// Uploads a staged model directory and registers it as a new version of
    /// `registered_name`.
    pub fn log_model(
        &self,
        local_dir: &Path,
        artifact_path: &str,
        registered_name: &str,
    ) -> Result<ModelVersion> {
        let source = self
            .store
            .log_artifacts(&self.info, local_dir, artifact_path)?;
        self.store.create_registered_model(registered_name)?;
        let version =
            self.store
                .create_model_version(registered_name, &source, &self.info.run_id)?;
        log::info!(
            "Registered {} version {} from {}",
            version.name,
            version.version,
            version.source
        );
        Ok(version)
    }

    /// Ends the run with `status`.
    pub fn finish(mut self, status: RunStatus) -> Result<()> {
        self.finished = true;
        log::info!("Run {} ended as {status}", self.info.run_id);
        self.store.update_run(&self.info.run_id, status, now_ms())
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!(
            "Run {} left its scope without finishing, marking it FAILED",
            self.info.run_id
        );
        if let Err(e) = self
            .store
            .update_run(&self.info.run_id, RunStatus::Failed, now_ms())
        {
            log::error!("Failed to mark run {} as FAILED: {e}", self.info.run_id);
        }
    }
}
