use super::{ActiveRun, Result};
use crate::train::{EpochMetrics, TrainingCallback, TrainingParams};

pub const LOSS: &str = "loss";
pub const ACCURACY: &str = "sparse_categorical_accuracy";
pub const VAL_LOSS: &str = "val_loss";
pub const VAL_ACCURACY: &str = "val_sparse_categorical_accuracy";
pub const LEARNING_RATE: &str = "lr";

/// Training callback that records hyperparameters and per-epoch metrics on a
/// run. Models are never logged from here.
pub struct Autolog<'r, 'a> {
    run: &'r ActiveRun<'a>,
}

impl<'r, 'a> Autolog<'r, 'a> {
    pub fn new(run: &'r ActiveRun<'a>) -> Self {
        Self { run }
    }
}

impl TrainingCallback for Autolog<'_, '_> {
    fn on_train_begin(&mut self, params: &TrainingParams) -> Result<()> {
        let run = self.run;
        run.log_param("epochs", params.epochs)?;
        run.log_param("batch_size", params.batch_size)?;
        run.log_param("steps_per_epoch", params.steps_per_epoch)?;
        run.log_param("opt_name", params.optimizer)?;
        run.log_param("opt_learning_rate", params.learning_rate)?;
        run.log_param("opt_decay_steps", params.decay_steps)?;
        run.log_param("opt_decay_rate", params.decay_rate)?;
        run.log_param("opt_staircase", if params.staircase { "True" } else { "False" })?;
        run.log_param("opt_beta_1", params.beta_1)?;
        run.log_param("opt_beta_2", params.beta_2)?;
        run.log_param("opt_epsilon", params.epsilon)?;
        run.log_param("class_weight", &params.class_weight)?;
        log::debug!("Logged training parameters to run {}", run.run_id());
        Ok(())
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> Result<()> {
        let step = metrics.epoch as i64;
        for (key, value) in [
            (LOSS, metrics.loss),
            (ACCURACY, metrics.accuracy),
            (VAL_LOSS, metrics.val_loss),
            (VAL_ACCURACY, metrics.val_accuracy),
            (LEARNING_RATE, metrics.learning_rate),
        ] {
            // MLflow rejects NaN; an empty validation split produces one.
            if value.is_finite() {
                self.run.log_metric(key, value, step)?;
            } else {
                log::warn!("Skipping non-finite {key} for epoch {}", metrics.epoch);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{FileStore, RunStatus, TrackingSession};

    fn params() -> TrainingParams {
        TrainingParams {
            epochs: 2,
            batch_size: 64,
            steps_per_epoch: 1,
            optimizer: "Adam",
            learning_rate: 0.01,
            decay_steps: 30,
            decay_rate: 0.96,
            staircase: true,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
            class_weight: "{0: 1.0}".to_string(),
        }
    }

    fn metrics(epoch: usize, loss: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            loss,
            accuracy: 0.5,
            val_loss: f64::NAN,
            val_accuracy: 0.25,
            learning_rate: 0.01,
        }
    }

    #[test]
    fn logs_params_and_epoch_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let session =
            TrackingSession::open(Box::new(FileStore::new(dir.path()).unwrap()), "reviews").unwrap();
        let run = session.start_run(session.create_run().unwrap());
        let run_id = run.run_id().to_string();

        let mut autolog = Autolog::new(&run);
        autolog.on_train_begin(&params()).unwrap();
        autolog.on_epoch_end(&metrics(0, 1.4)).unwrap();
        autolog.on_epoch_end(&metrics(1, 1.2)).unwrap();
        run.finish(RunStatus::Finished).unwrap();

        let stored = session.store().get_run(&run_id).unwrap();
        assert_eq!(stored.param("epochs"), Some("2"));
        assert_eq!(stored.param("opt_name"), Some("Adam"));
        assert_eq!(stored.param("opt_staircase"), Some("True"));
        assert_eq!(stored.metric(LOSS), Some(1.2));
        assert_eq!(stored.metric(VAL_ACCURACY), Some(0.25));
        assert_eq!(stored.metric(VAL_LOSS), None);
    }
}
