//! Stages a trained model as an MLflow model directory and registers it.
//!
//! ```text
//! <artifact_dir>/Sentiment_detector/
//!     MLmodel             descriptor with flavor, run id and signature
//!     data/model.mpk      full precision named MessagePack record
//!     data/config.json    training configuration
//!     data/tokenizer.json
//! ```
//!
//! `MLmodel` is written as JSON, which YAML parsers read as well.

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, RecorderError},
};
use serde_json::{Value, json};

use crate::{
    data::{TextTokenizer, TokenizerError},
    model::Model,
    tracking::{ActiveRun, ModelSignature, ModelVersion, TrackingError},
    train::TrainingConfig,
};

pub const ARTIFACT_PATH: &str = "Sentiment_detector";
pub const REGISTERED_MODEL_NAME: &str = "Sentiment_detector_RNN";

const DATA_DIR: &str = "data";
const RECORD_FILE: &str = "model";
const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const MLMODEL_FILE: &str = "MLmodel";

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to stage model files in {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to save model record: {0}")]
    Record(#[from] RecorderError),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error("Failed to write MLmodel descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
    #[error(transparent)]
    Tracking(#[from] TrackingError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PublishError + '_ {
    move |source| PublishError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes the model directory under `artifact_dir` and returns its path.
/// A previous staging directory is replaced.
pub fn stage_model<B: Backend>(
    model: &Model<B>,
    config: &TrainingConfig,
    tokenizer: &TextTokenizer,
    signature: &ModelSignature,
    run_id: &str,
    artifact_dir: &Path,
) -> Result<PathBuf, PublishError> {
    let stage = artifact_dir.join(ARTIFACT_PATH);
    let data = stage.join(DATA_DIR);
    if stage.exists() {
        fs::remove_dir_all(&stage).map_err(io_error(&stage))?;
    }
    fs::create_dir_all(&data).map_err(io_error(&data))?;

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model.clone().save_file(data.join(RECORD_FILE), &recorder)?;

    let config_path = data.join(CONFIG_FILE);
    config.save(&config_path).map_err(io_error(&config_path))?;
    tokenizer.save(&data.join(TOKENIZER_FILE))?;

    let descriptor = mlmodel_descriptor(run_id, signature)?;
    let descriptor_path = stage.join(MLMODEL_FILE);
    fs::write(&descriptor_path, serde_json::to_string_pretty(&descriptor)?)
        .map_err(io_error(&descriptor_path))?;

    log::info!("Staged model in {}", stage.display());
    Ok(stage)
}

pub fn mlmodel_descriptor(run_id: &str, signature: &ModelSignature) -> serde_json::Result<Value> {
    Ok(json!({
        "artifact_path": ARTIFACT_PATH,
        "flavors": {
            "burn": {
                "burn_version": "0.16",
                "record": format!("{DATA_DIR}/{RECORD_FILE}.mpk"),
                "record_settings": "full_precision",
                "config": format!("{DATA_DIR}/{CONFIG_FILE}"),
                "tokenizer": format!("{DATA_DIR}/{TOKENIZER_FILE}"),
            }
        },
        "model_uuid": uuid::Uuid::new_v4().simple().to_string(),
        "run_id": run_id,
        "signature": signature.to_mlmodel()?,
        "utc_time_created": chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
    }))
}

/// Stages the model, uploads it under the run's `Sentiment_detector` artifact
/// path and registers a new version of `Sentiment_detector_RNN`.
pub fn publish<B: Backend>(
    run: &ActiveRun<'_>,
    model: &Model<B>,
    config: &TrainingConfig,
    tokenizer: &TextTokenizer,
    signature: &ModelSignature,
    artifact_dir: &Path,
) -> Result<ModelVersion, PublishError> {
    let stage = stage_model(model, config, tokenizer, signature, run.run_id(), artifact_dir)?;
    Ok(run.log_model(&stage, ARTIFACT_PATH, REGISTERED_MODEL_NAME)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ReviewFrame, Tokenizer};
    use crate::model::ModelConfig;
    use crate::tracking::{FileStore, RunStatus, TrackingSession};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn fixture() -> (TextTokenizer, TrainingConfig, ModelSignature) {
        let frame =
            ReviewFrame::from_reader("review_format,stars\nsuper parc,5\ntrop cher,1\n".as_bytes())
                .unwrap();
        let tokenizer =
            TextTokenizer::from_corpus(frame.records.iter().map(|r| r.review_format.as_str()))
                .unwrap();
        let config = TrainingConfig::for_reviews(1, 0.01, ModelConfig::new(tokenizer.vocab_size(), 4));
        let signature = ModelSignature::infer(&frame, 5);
        (tokenizer, config, signature)
    }

    #[test]
    fn staged_directory_holds_record_config_and_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let (tokenizer, config, signature) = fixture();
        let model = config.model.init::<TestBackend>(&Default::default());

        let stage =
            stage_model(&model, &config, &tokenizer, &signature, "abc", dir.path()).unwrap();

        assert!(stage.join("data/model.mpk").exists());
        assert!(stage.join("data/config.json").exists());
        assert!(stage.join("data/tokenizer.json").exists());
        let descriptor: Value =
            serde_json::from_str(&fs::read_to_string(stage.join("MLmodel")).unwrap()).unwrap();
        assert_eq!(descriptor["run_id"], "abc");
        assert_eq!(descriptor["artifact_path"], ARTIFACT_PATH);
        assert!(descriptor["signature"]["outputs"].as_str().unwrap().contains("[-1,5]"));
    }

    #[test]
    fn each_publication_registers_a_new_version() {
        let dir = tempfile::tempdir().unwrap();
        let (tokenizer, config, signature) = fixture();
        let model = config.model.init::<TestBackend>(&Default::default());
        let session = TrackingSession::open(
            Box::new(FileStore::new(dir.path().join("mlruns")).unwrap()),
            "reviews",
        )
        .unwrap();

        for expected in ["1", "2"] {
            let run = session.start_run(session.create_run().unwrap());
            let version = publish(
                &run,
                &model,
                &config,
                &tokenizer,
                &signature,
                &dir.path().join("staging"),
            )
            .unwrap();
            assert_eq!(version.version, expected);
            assert!(version.source.ends_with(ARTIFACT_PATH));
            run.finish(RunStatus::Finished).unwrap();
        }

        let versions = session
            .store()
            .search_model_versions(REGISTERED_MODEL_NAME)
            .unwrap();
        assert_eq!(versions.len(), 2);
    }
}
