use crate::{
    data::{
        ClassWeights, ReviewClassificationBatcher, ReviewClassificationInference, ReviewDataset,
        Tokenizer,
    },
    lr_schedule::StaircaseDecayConfig,
    model::{Model, ModelConfig, weighted_cross_entropy},
    tracking::TrackingError,
};
use burn::{
    data::{dataloader::DataLoaderBuilder, dataloader::batcher::Batcher, dataset::Dataset},
    lr_scheduler::LrScheduler,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
    train::ClassificationOutput,
};
use std::path::Path;
use std::sync::Arc;

pub static ARTIFACT_DIR: &str = "./model";

#[derive(Config)]
pub struct TrainingConfig {
    pub num_epochs: usize,

    #[config(default = 64)]
    pub batch_size: usize,

    pub model: ModelConfig,

    pub lr_schedule: StaircaseDecayConfig,

    #[config(default = 0.9)]
    pub beta_1: f32,

    #[config(default = 0.999)]
    pub beta_2: f32,

    #[config(default = 1e-7)]
    pub epsilon: f32,

    #[config(default = 256)]
    pub max_seq_len: usize,
}

impl TrainingConfig {
    /// Staircase decay starting at `initial_lr`, Adam with the Keras defaults.
    pub fn for_reviews(num_epochs: usize, initial_lr: f64, model: ModelConfig) -> Self {
        Self::new(num_epochs, model, StaircaseDecayConfig::new(initial_lr))
    }

    pub fn optimizer(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.beta_1)
            .with_beta_2(self.beta_2)
            .with_epsilon(self.epsilon)
    }

    pub fn steps_per_epoch(&self, num_samples: usize) -> usize {
        num_samples.div_ceil(self.batch_size)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("Invalid training configuration: {0}")]
    Config(String),
    #[error("Training callback failed: {0}")]
    Callback(#[from] TrackingError),
}

/// Hyperparameters reported to callbacks before the first epoch.
#[derive(Debug, Clone)]
pub struct TrainingParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub steps_per_epoch: usize,
    pub optimizer: &'static str,
    pub learning_rate: f64,
    pub decay_steps: usize,
    pub decay_rate: f64,
    pub staircase: bool,
    pub beta_1: f32,
    pub beta_2: f32,
    pub epsilon: f32,
    pub class_weight: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    /// Learning rate that the next optimizer update will use.
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingSummary {
    pub history: Vec<EpochMetrics>,
    pub optimizer_steps: usize,
}

/// Hooks called by [`fit`] around training.
pub trait TrainingCallback {
    fn on_train_begin(&mut self, _params: &TrainingParams) -> Result<(), TrackingError> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _metrics: &EpochMetrics) -> Result<(), TrackingError> {
        Ok(())
    }
}

/// Callback that only logs progress.
pub struct ProgressLogger;

impl TrainingCallback for ProgressLogger {}

/// Makes sure `artifact_dir` exists. Existing content is left alone.
pub fn create_artifact_dir(artifact_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(artifact_dir)
}

#[derive(Default)]
struct Accumulator {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl Accumulator {
    fn update<B: Backend>(&mut self, output: ClassificationOutput<B>) {
        let batch_size = output.targets.dims()[0];
        let loss = output.loss.into_scalar().elem::<f64>();
        let correct = output
            .output
            .argmax(1)
            .flatten::<1>(0, 1)
            .equal(output.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        // Batch losses are averaged weighted by batch size.
        self.loss_sum += loss * batch_size as f64;
        self.correct += correct as usize;
        self.samples += batch_size;
    }

    fn loss(&self) -> f64 {
        if self.samples == 0 { f64::NAN } else { self.loss_sum / self.samples as f64 }
    }

    fn accuracy(&self) -> f64 {
        if self.samples == 0 { 0.0 } else { self.correct as f64 / self.samples as f64 }
    }
}

/// Trains `model` on `train` for `config.num_epochs` epochs, evaluating on
/// `valid` after each one. The training loss is weighted by `class_weights`,
/// the validation loss is not.
#[allow(clippy::too_many_arguments)]
pub fn fit<B: AutodiffBackend>(
    config: &TrainingConfig,
    model: Model<B>,
    tokenizer: Arc<dyn Tokenizer>,
    train: ReviewDataset,
    valid: ReviewDataset,
    class_weights: &ClassWeights,
    callback: &mut dyn TrainingCallback,
    device: &B::Device,
) -> Result<(Model<B>, TrainingSummary), TrainingError> {
    let mut scheduler = config.lr_schedule.init().map_err(TrainingError::Config)?;
    if config.batch_size == 0 {
        return Err(TrainingError::Config("Batch size must be at least 1".to_string()));
    }

    let steps_per_epoch = config.steps_per_epoch(train.len());
    callback.on_train_begin(&TrainingParams {
        epochs: config.num_epochs,
        batch_size: config.batch_size,
        steps_per_epoch,
        optimizer: "Adam",
        learning_rate: config.lr_schedule.initial_lr,
        decay_steps: config.lr_schedule.decay_steps,
        decay_rate: config.lr_schedule.decay_rate,
        staircase: true,
        beta_1: config.beta_1,
        beta_2: config.beta_2,
        epsilon: config.epsilon,
        class_weight: class_weights.to_string(),
    })?;

    log::info!(
        "Training on {} reviews, validating on {} ({} epochs, {steps_per_epoch} steps each)",
        train.len(),
        valid.len(),
        config.num_epochs
    );

    let batcher_train =
        ReviewClassificationBatcher::<B>::new(tokenizer.clone(), device.clone(), config.max_seq_len);
    let batcher_valid = ReviewClassificationBatcher::<B::InnerBackend>::new(
        tokenizer,
        device.clone(),
        config.max_seq_len,
    );

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(rand::random())
        .build(train);
    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .build(valid);

    let weights = Tensor::<B, 1>::from_data(
        TensorData::new(class_weights.to_vec(), [crate::data::NUM_CLASSES]),
        device,
    );

    let mut model = model;
    let mut optim = config.optimizer().init();
    let mut summary = TrainingSummary::default();

    for epoch in 0..config.num_epochs {
        let mut train_metrics = Accumulator::default();
        for batch in dataloader_train.iter() {
            let lr = scheduler.step();
            let output = model.forward_classification(batch, Some(&weights));

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            train_metrics.update(ClassificationOutput {
                loss: output.loss.inner(),
                output: output.output.inner(),
                targets: output.targets.inner(),
            });
            model = optim.step(lr, model, grads);
            summary.optimizer_steps += 1;
        }

        let model_valid = model.valid();
        let mut valid_metrics = Accumulator::default();
        for batch in dataloader_valid.iter() {
            let targets = batch.labels;
            let output = model_valid.forward(batch.tokens, batch.mask_pad);
            let loss = weighted_cross_entropy(output.clone(), targets.clone(), None);
            valid_metrics.update(ClassificationOutput {
                loss,
                output,
                targets,
            });
        }

        let metrics = EpochMetrics {
            epoch,
            loss: train_metrics.loss(),
            accuracy: train_metrics.accuracy(),
            val_loss: valid_metrics.loss(),
            val_accuracy: valid_metrics.accuracy(),
            learning_rate: scheduler.current(),
        };
        log::info!(
            "Epoch {}/{} | loss={:.4} | accuracy={:.3} | val_loss={:.4} | val_accuracy={:.3} | lr={:.6}",
            epoch + 1,
            config.num_epochs,
            metrics.loss,
            metrics.accuracy,
            metrics.val_loss,
            metrics.val_accuracy,
            metrics.learning_rate
        );
        callback.on_epoch_end(&metrics)?;
        summary.history.push(metrics);
    }

    log::info!("Training complete after {} optimizer steps", summary.optimizer_steps);
    Ok((model, summary))
}

/// Class probabilities for every text, in input order.
pub fn predict<B: Backend>(
    model: &Model<B>,
    tokenizer: Arc<dyn Tokenizer>,
    texts: Vec<String>,
    batch_size: usize,
    max_seq_len: usize,
    device: &B::Device,
) -> Vec<Tensor<B, 2>> {
    let batcher = ReviewClassificationBatcher::<B>::new(tokenizer, device.clone(), max_seq_len);

    texts
        .chunks(batch_size.max(1))
        .map(|chunk| {
            let item: ReviewClassificationInference<B> = batcher.batch(chunk.to_vec());
            model.infer(item)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ReviewRecord, TextTokenizer};
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    struct Recorder {
        params: Option<TrainingParams>,
        epochs: Vec<EpochMetrics>,
    }

    impl TrainingCallback for Recorder {
        fn on_train_begin(&mut self, params: &TrainingParams) -> Result<(), TrackingError> {
            self.params = Some(params.clone());
            Ok(())
        }

        fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> Result<(), TrackingError> {
            self.epochs.push(*metrics);
            Ok(())
        }
    }

    fn records() -> Vec<ReviewRecord> {
        (0..12)
            .map(|i| ReviewRecord::new(format!("avis numero {i} parc"), (i % 3 + 1) as u8))
            .collect()
    }

    fn setup(epochs: usize) -> (TrainingConfig, Arc<TextTokenizer>, ClassWeights) {
        let records = records();
        let tokenizer = Arc::new(
            TextTokenizer::from_corpus(records.iter().map(|r| r.review_format.as_str())).unwrap(),
        );
        let weights = ClassWeights::from_labels(records.iter().map(ReviewRecord::label)).unwrap();
        let config = TrainingConfig::for_reviews(
            epochs,
            0.01,
            ModelConfig::new(tokenizer.vocab_size(), 8),
        )
        .with_batch_size(4)
        .with_max_seq_len(16);
        (config, tokenizer, weights)
    }

    #[test]
    fn one_epoch_reports_metrics_and_counts_steps() {
        let device = Default::default();
        let (config, tokenizer, weights) = setup(1);
        let model = config.model.init::<TestBackend>(&device);
        let mut recorder = Recorder {
            params: None,
            epochs: Vec::new(),
        };

        let (_, summary) = fit(
            &config,
            model,
            tokenizer,
            ReviewDataset::new(records()),
            ReviewDataset::new(records()[..4].to_vec()),
            &weights,
            &mut recorder,
            &device,
        )
        .unwrap();

        assert_eq!(summary.optimizer_steps, 3);
        assert_eq!(summary.history.len(), 1);
        assert_eq!(recorder.epochs.len(), 1);
        assert!(summary.history[0].loss.is_finite());
        assert!((0.0..=1.0).contains(&summary.history[0].val_accuracy));

        let params = recorder.params.unwrap();
        assert_eq!(params.steps_per_epoch, 3);
        assert_eq!(params.epsilon, 1e-7);
    }

    #[test]
    fn every_batch_but_the_last_is_full() {
        let device = Default::default();
        let (config, tokenizer, weights) = setup(2);
        let model = config.model.init::<TestBackend>(&device);
        let mut recorder = Recorder {
            params: None,
            epochs: Vec::new(),
        };

        // 10 reviews in batches of 4: 4 + 4 + 2.
        let (_, summary) = fit(
            &config,
            model,
            tokenizer,
            ReviewDataset::new(records()[..10].to_vec()),
            ReviewDataset::new(records()[..4].to_vec()),
            &weights,
            &mut recorder,
            &device,
        )
        .unwrap();

        let params = recorder.params.unwrap();
        assert_eq!(params.steps_per_epoch, 3);
        assert_eq!(summary.optimizer_steps, 2 * params.steps_per_epoch);
    }

    #[test]
    fn zero_epochs_perform_no_update() {
        let device = Default::default();
        let (config, tokenizer, weights) = setup(0);
        let model = config.model.init::<TestBackend>(&device);
        let initial = model.clone();

        let (trained, summary) = fit(
            &config,
            model,
            tokenizer,
            ReviewDataset::new(records()),
            ReviewDataset::new(records()),
            &weights,
            &mut ProgressLogger,
            &device,
        )
        .unwrap();

        assert_eq!(summary.optimizer_steps, 0);
        assert!(summary.history.is_empty());

        let tokens = Tensor::<NdArray<f32>, 2, Int>::from_data([[2, 3, 4], [5, 0, 0]], &device);
        let mask = tokens.clone().equal_elem(0);
        let before = initial.valid().forward(tokens.clone(), mask.clone());
        let after = trained.valid().forward(tokens, mask);
        before.into_data().assert_eq(&after.into_data(), true);
    }

    #[test]
    fn predictions_are_probabilities() {
        let device = Default::default();
        let (config, tokenizer, _) = setup(0);
        let model = config.model.init::<NdArray<f32>>(&device);
        let texts = vec!["avis parc".to_string(); 5];

        let batches = predict(&model, tokenizer, texts, 2, 16, &device);

        assert_eq!(batches.len(), 3);
        let sums = batches[0].clone().sum_dim(1).into_data();
        sums.assert_approx_eq(&TensorData::from([[1.0f32], [1.0]]), 4);
    }
}
