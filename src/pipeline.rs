//! End-to-end training run: load, weight, split, embed, train, publish.
//!
//! Everything after run creation happens inside the run scope; the run ends
//! `FINISHED` when every stage succeeds and `FAILED` otherwise.

use std::path::PathBuf;
use std::sync::Arc;

use burn::{module::AutodiffModule, tensor::backend::AutodiffBackend};

use crate::{
    data::{
        ClassWeights, DatasetSource, NUM_CLASSES, ReviewDataset, ReviewFrame, TRAIN_FRACTION,
        Tokenizer, split_train_test,
    },
    embedding::{EmbeddingError, EmbeddingSource, ResolvedEmbedding, WeightCache, weights_url},
    error::PipelineError,
    model::ModelConfig,
    publish::{self, PublishError},
    tracking::{
        ActiveRun, Autolog, ModelSignature, ModelVersion, RunStatus, TrackingSession, open_store,
    },
    train::{self, ARTIFACT_DIR, TrainingConfig, TrainingSummary},
};

pub const DEFAULT_EXPERIMENT: &str = "Disneyland_review_detector";
pub const DEFAULT_TRACKING_URI: &str = "./mlruns";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub epochs: usize,
    pub initial_lr: f64,
    pub tracking_uri: String,
    pub experiment_name: String,
    pub dataset: DatasetSource,
    pub embedding: EmbeddingSource,
    pub max_seq_len: usize,
    pub artifact_dir: PathBuf,
    /// Weight cache location, the platform cache directory when unset.
    pub cache_dir: Option<PathBuf>,
    /// Drop cached pretrained weights before resolving the embedding.
    pub refresh_weights: bool,
}

impl PipelineConfig {
    pub fn new(epochs: usize, initial_lr: f64) -> Self {
        Self {
            epochs,
            initial_lr,
            tracking_uri: DEFAULT_TRACKING_URI.to_string(),
            experiment_name: DEFAULT_EXPERIMENT.to_string(),
            dataset: DatasetSource::default(),
            embedding: EmbeddingSource::default(),
            max_seq_len: 256,
            artifact_dir: PathBuf::from(ARTIFACT_DIR),
            cache_dir: None,
            refresh_weights: false,
        }
    }
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub model_version: ModelVersion,
    pub summary: TrainingSummary,
}

/// Opens the tracking store named by `config.tracking_uri` and trains one run.
pub fn run<B: AutodiffBackend>(
    config: &PipelineConfig,
    device: B::Device,
) -> Result<PipelineOutcome, PipelineError> {
    let store = open_store(&config.tracking_uri)?;
    let session = TrackingSession::open(store, &config.experiment_name)?;
    run_in_session::<B>(config, &session, device)
}

pub fn run_in_session<B: AutodiffBackend>(
    config: &PipelineConfig,
    session: &TrackingSession,
    device: B::Device,
) -> Result<PipelineOutcome, PipelineError> {
    let run = session.start_run(session.create_run()?);
    let run_id = run.run_id().to_string();

    match execute::<B>(config, &run, &device) {
        Ok((model_version, summary)) => {
            run.finish(RunStatus::Finished)?;
            Ok(PipelineOutcome {
                run_id,
                model_version,
                summary,
            })
        }
        Err(e) => {
            log::error!("Run {run_id} failed: {e}");
            if let Err(finish_error) = run.finish(RunStatus::Failed) {
                log::error!("Could not mark run {run_id} as FAILED: {finish_error}");
            }
            Err(e)
        }
    }
}

fn execute<B: AutodiffBackend>(
    config: &PipelineConfig,
    run: &ActiveRun<'_>,
    device: &B::Device,
) -> Result<(ModelVersion, TrainingSummary), PipelineError> {
    train::create_artifact_dir(&config.artifact_dir).map_err(|source| PublishError::Io {
        path: config.artifact_dir.clone(),
        source,
    })?;

    let frame = ReviewFrame::load(&config.dataset)?;
    let class_weights = ClassWeights::from_labels(frame.labels())?;
    log::info!("Class weights: {class_weights}");

    let (train_records, test_records) = split_train_test(frame.records.clone(), TRAIN_FRACTION);

    let cache = match &config.cache_dir {
        Some(dir) => WeightCache::new(dir),
        None => WeightCache::new_default(),
    }
    .map_err(EmbeddingError::from)?;
    if let (true, EmbeddingSource::Pretrained { model_id, .. }) =
        (config.refresh_weights, &config.embedding)
    {
        log::info!("Fresh download requested, removing cached weights of {model_id}");
        cache.remove(&weights_url(model_id))?;
    }
    let embedding = ResolvedEmbedding::resolve(
        &config.embedding,
        &cache,
        train_records.iter().map(|record| record.review_format.as_str()),
    )?;

    let training = TrainingConfig::for_reviews(
        config.epochs,
        config.initial_lr,
        ModelConfig::new(embedding.vocab_size, embedding.embed_dim),
    )
    .with_max_seq_len(config.max_seq_len);

    let mut model = training.model.init::<B>(device);
    if let Some(table) = embedding.table {
        model = model.with_embedding_weights(table.into_tensor(device));
    }

    let tokenizer: Arc<dyn Tokenizer> = embedding.tokenizer.clone();
    let train_texts: Vec<String> = train_records
        .iter()
        .map(|record| record.review_format.clone())
        .collect();

    let mut autolog = Autolog::new(run);
    let (model, summary) = train::fit(
        &training,
        model,
        tokenizer.clone(),
        ReviewDataset::new(train_records),
        ReviewDataset::new(test_records),
        &class_weights,
        &mut autolog,
        device,
    )?;

    let model = model.valid();
    let predictions = train::predict(
        &model,
        tokenizer,
        train_texts,
        training.batch_size,
        training.max_seq_len,
        device,
    );
    let width = predictions
        .first()
        .map(|batch| batch.dims()[1])
        .unwrap_or(NUM_CLASSES);
    log::info!(
        "Predicted {} training reviews for the signature",
        predictions.iter().map(|batch| batch.dims()[0]).sum::<usize>()
    );
    let signature = ModelSignature::infer(&frame, width);

    let version = publish::publish(
        run,
        &model,
        &training,
        &embedding.tokenizer,
        &signature,
        &config.artifact_dir,
    )?;

    Ok((version, summary))
}
