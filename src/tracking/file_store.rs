//! Local directory tracking store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <experiment_id>/meta.json
//! <experiment_id>/<run_id>/meta.json
//! <experiment_id>/<run_id>/params/<key>
//! <experiment_id>/<run_id>/metrics/<key>      "<timestamp> <value> <step>" per line
//! <experiment_id>/<run_id>/artifacts/...
//! models/<name>/meta.json
//! models/<name>/version-<n>/meta.json
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use super::{
    Experiment, Metric, ModelVersion, Param, Result, Run, RunData, RunInfo, RunStatus,
    TrackingError, TrackingStore, now_ms,
};

const META_FILE: &str = "meta.json";
const MODELS_DIR: &str = "models";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegisteredModel {
    name: String,
    creation_timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        let root = fs::canonicalize(root.as_ref())?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories of all experiments, i.e. numeric entries of the root.
    fn experiment_dirs(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().parse::<u64>();
            if let (Ok(id), true) = (id, entry.path().join(META_FILE).exists()) {
                dirs.push((id, entry.path()));
            }
        }
        dirs.sort_by_key(|(id, _)| *id);
        Ok(dirs)
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        for (_, dir) in self.experiment_dirs()? {
            let candidate = dir.join(run_id);
            if candidate.join(META_FILE).exists() {
                return Ok(candidate);
            }
        }
        Err(TrackingError::RunNotFound(run_id.to_string()))
    }

    fn active_run_dir(&self, run_id: &str) -> Result<PathBuf> {
        let dir = self.run_dir(run_id)?;
        let info: RunInfo = read_json(&dir.join(META_FILE))?;
        if info.status.is_terminal() {
            return Err(TrackingError::RunNotActive {
                run_id: run_id.to_string(),
                status: info.status,
            });
        }
        Ok(dir)
    }

    fn model_dir(&self, name: &str) -> PathBuf {
        self.root.join(MODELS_DIR).join(name)
    }

    fn read_params(dir: &Path) -> Result<Vec<Param>> {
        let mut params = Vec::new();
        if !dir.exists() {
            return Ok(params);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            params.push(Param {
                key: entry.file_name().to_string_lossy().into_owned(),
                value: fs::read_to_string(entry.path())?,
            });
        }
        params.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(params)
    }

    /// Runs of an experiment, oldest first.
    pub fn list_runs(&self, experiment_id: &str) -> Result<Vec<RunInfo>> {
        let dir = self.root.join(experiment_id);
        if !dir.join(META_FILE).exists() {
            return Err(TrackingError::ExperimentNotFound(experiment_id.to_string()));
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let meta = entry?.path().join(META_FILE);
            if meta.exists() {
                runs.push(read_json::<RunInfo>(&meta)?);
            }
        }
        runs.sort_by_key(|run| run.start_time);
        Ok(runs)
    }

    /// Full history of one metric, in logging order.
    pub fn metric_history(&self, run_id: &str, key: &str) -> Result<Vec<Metric>> {
        let path = self.run_dir(run_id)?.join("metrics").join(key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        parse_metric_lines(key, &fs::read_to_string(path)?)
    }

    fn latest_metrics(&self, run_id: &str, dir: &Path) -> Result<Vec<Metric>> {
        let mut metrics = Vec::new();
        if !dir.exists() {
            return Ok(metrics);
        }
        for entry in fs::read_dir(dir)? {
            let key = entry?.file_name().to_string_lossy().into_owned();
            let history = self.metric_history(run_id, &key)?;
            // MLflow reports the value with the highest step, latest timestamp first.
            if let Some(latest) = history
                .into_iter()
                .max_by_key(|metric| (metric.step, metric.timestamp))
            {
                metrics.push(latest);
            }
        }
        metrics.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metrics)
    }
}

impl TrackingStore for FileStore {
    fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        for (_, dir) in self.experiment_dirs()? {
            let experiment: Experiment = read_json(&dir.join(META_FILE))?;
            if experiment.name == name {
                return Ok(Some(experiment));
            }
        }
        Ok(None)
    }

    fn create_experiment(&self, name: &str) -> Result<String> {
        let next_id = self
            .experiment_dirs()?
            .last()
            .map(|(id, _)| id + 1)
            .unwrap_or(1);
        let dir = self.root.join(next_id.to_string());
        fs::create_dir_all(&dir)?;

        let experiment = Experiment {
            experiment_id: next_id.to_string(),
            name: name.to_string(),
            artifact_location: file_uri(&dir),
            lifecycle_stage: "active".to_string(),
        };
        write_json(&dir.join(META_FILE), &experiment)?;
        Ok(experiment.experiment_id)
    }

    fn create_run(&self, experiment_id: &str, start_time: i64) -> Result<RunInfo> {
        let experiment_dir = self.root.join(experiment_id);
        if !experiment_dir.join(META_FILE).exists() {
            return Err(TrackingError::ExperimentNotFound(experiment_id.to_string()));
        }

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run_dir = experiment_dir.join(&run_id);
        for sub in ["params", "metrics", "artifacts"] {
            fs::create_dir_all(run_dir.join(sub))?;
        }

        let info = RunInfo {
            run_id,
            experiment_id: experiment_id.to_string(),
            status: RunStatus::Running,
            start_time,
            end_time: None,
            artifact_uri: file_uri(&run_dir.join("artifacts")),
        };
        write_json(&run_dir.join(META_FILE), &info)?;
        Ok(info)
    }

    fn get_run(&self, run_id: &str) -> Result<Run> {
        let dir = self.run_dir(run_id)?;
        let info: RunInfo = read_json(&dir.join(META_FILE))?;
        let data = RunData {
            metrics: self.latest_metrics(run_id, &dir.join("metrics"))?,
            params: Self::read_params(&dir.join("params"))?,
        };
        Ok(Run { info, data })
    }

    fn update_run(&self, run_id: &str, status: RunStatus, end_time: i64) -> Result<()> {
        let path = self.run_dir(run_id)?.join(META_FILE);
        let mut info: RunInfo = read_json(&path)?;
        info.status = status;
        if status.is_terminal() {
            info.end_time = Some(end_time);
        }
        write_json(&path, &info)
    }

    fn log_param(&self, run_id: &str, param: &Param) -> Result<()> {
        let path = self.active_run_dir(run_id)?.join("params").join(&param.key);
        fs::write(path, &param.value)?;
        Ok(())
    }

    fn log_metric(&self, run_id: &str, metric: &Metric) -> Result<()> {
        let path = self.active_run_dir(run_id)?.join("metrics").join(&metric.key);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{} {} {}", metric.timestamp, metric.value, metric.step)?;
        Ok(())
    }

    fn log_artifacts(
        &self,
        run: &RunInfo,
        local_dir: &Path,
        artifact_path: &str,
    ) -> Result<String> {
        let destination = self
            .active_run_dir(&run.run_id)?
            .join("artifacts")
            .join(artifact_path);
        copy_dir(local_dir, &destination)?;
        Ok(file_uri(&destination))
    }

    fn create_registered_model(&self, name: &str) -> Result<()> {
        let dir = self.model_dir(name);
        let meta = dir.join(META_FILE);
        if meta.exists() {
            return Ok(());
        }
        fs::create_dir_all(&dir)?;
        write_json(
            &meta,
            &RegisteredModel {
                name: name.to_string(),
                creation_timestamp: now_ms(),
            },
        )
    }

    fn create_model_version(&self, name: &str, source: &str, run_id: &str) -> Result<ModelVersion> {
        let dir = self.model_dir(name);
        if !dir.join(META_FILE).exists() {
            return Err(TrackingError::Api {
                endpoint: "model-versions/create".to_string(),
                status: 404,
                error_code: "RESOURCE_DOES_NOT_EXIST".to_string(),
                message: format!("Registered model {name} not found"),
            });
        }

        let next = self
            .search_model_versions(name)?
            .iter()
            .filter_map(|version| version.version.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let version = ModelVersion {
            name: name.to_string(),
            version: next.to_string(),
            creation_timestamp: now_ms(),
            source: source.to_string(),
            run_id: run_id.to_string(),
        };

        let version_dir = dir.join(format!("version-{next}"));
        fs::create_dir_all(&version_dir)?;
        write_json(&version_dir.join(META_FILE), &version)?;
        Ok(version)
    }

    fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let dir = self.model_dir(name);
        let mut versions = Vec::new();
        if !dir.exists() {
            return Ok(versions);
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path().join(META_FILE);
            let is_version = path
                .parent()
                .and_then(Path::file_name)
                .is_some_and(|name| name.to_string_lossy().starts_with("version-"));
            if is_version && path.exists() {
                versions.push(read_json::<ModelVersion>(&path)?);
            }
        }
        versions.sort_by_key(|version| version.version.parse::<u64>().unwrap_or(0));
        Ok(versions)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn parse_metric_lines(key: &str, content: &str) -> Result<Vec<Metric>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let malformed = || {
                TrackingError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("malformed metric line for {key}: {line}"),
                ))
            };
            if fields.len() != 3 {
                return Err(malformed());
            }
            Ok(Metric {
                key: key.to_string(),
                timestamp: fields[0].parse().map_err(|_| malformed())?,
                value: fields[1].parse().map_err(|_| malformed())?,
                step: fields[2].parse().map_err(|_| malformed())?,
            })
        })
        .collect()
}

pub(crate) fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Recursively copies the contents of `from` into `to`.
pub(crate) fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mlruns")).unwrap();
        (dir, store)
    }

    #[test]
    fn experiments_get_increasing_ids() {
        let (_dir, store) = store();

        let first = store.create_experiment("first").unwrap();
        let second = store.create_experiment("second").unwrap();

        assert_eq!(first, "1");
        assert_eq!(second, "2");
        let found = store.get_experiment_by_name("second").unwrap().unwrap();
        assert_eq!(found.experiment_id, "2");
        assert!(store.get_experiment_by_name("third").unwrap().is_none());
    }

    #[test]
    fn run_for_unknown_experiment_fails() {
        let (_dir, store) = store();

        let err = store.create_run("42", 0).unwrap_err();

        assert!(matches!(err, TrackingError::ExperimentNotFound(_)));
    }

    #[test]
    fn metrics_keep_full_history_and_report_latest_step() {
        let (_dir, store) = store();
        let experiment_id = store.create_experiment("reviews").unwrap();
        let run = store.create_run(&experiment_id, 1).unwrap();

        for (step, value) in [(0, 1.5), (1, 1.1), (2, 0.9)] {
            let metric = Metric {
                key: "loss".to_string(),
                value,
                timestamp: 10 + step,
                step,
            };
            store.log_metric(&run.run_id, &metric).unwrap();
        }

        let history = store.metric_history(&run.run_id, "loss").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value, 1.5);

        let stored = store.get_run(&run.run_id).unwrap();
        assert_eq!(stored.metric("loss"), Some(0.9));
    }

    #[test]
    fn finished_run_rejects_new_values() {
        let (_dir, store) = store();
        let experiment_id = store.create_experiment("reviews").unwrap();
        let run = store.create_run(&experiment_id, 1).unwrap();
        store.update_run(&run.run_id, RunStatus::Finished, 2).unwrap();

        let param = Param {
            key: "epochs".to_string(),
            value: "3".to_string(),
        };
        let err = store.log_param(&run.run_id, &param).unwrap_err();

        assert!(matches!(
            err,
            TrackingError::RunNotActive {
                status: RunStatus::Finished,
                ..
            }
        ));
    }

    #[test]
    fn model_versions_increment_per_registration() {
        let (dir, store) = store();
        let experiment_id = store.create_experiment("reviews").unwrap();
        let run = store.create_run(&experiment_id, 1).unwrap();

        let staged = dir.path().join("staged");
        fs::create_dir_all(staged.join("data")).unwrap();
        fs::write(staged.join("MLmodel"), "{}").unwrap();
        fs::write(staged.join("data").join("model.mpk"), [1u8, 2, 3]).unwrap();

        let source = store.log_artifacts(&run, &staged, "Sentiment_detector").unwrap();
        assert!(source.ends_with("artifacts/Sentiment_detector"));
        let copied = store
            .run_dir(&run.run_id)
            .unwrap()
            .join("artifacts/Sentiment_detector/data/model.mpk");
        assert!(copied.exists());

        store.create_registered_model("detector").unwrap();
        store.create_registered_model("detector").unwrap();
        let v1 = store.create_model_version("detector", &source, &run.run_id).unwrap();
        let v2 = store.create_model_version("detector", &source, &run.run_id).unwrap();

        assert_eq!((v1.version.as_str(), v2.version.as_str()), ("1", "2"));
        assert_eq!(store.search_model_versions("detector").unwrap().len(), 2);
        assert!(store.search_model_versions("unknown").unwrap().is_empty());
    }

    #[test]
    fn version_of_unregistered_model_fails() {
        let (_dir, store) = store();

        let err = store.create_model_version("detector", "file:///tmp", "run").unwrap_err();

        assert!(matches!(err, TrackingError::Api { status: 404, .. }));
    }
}
