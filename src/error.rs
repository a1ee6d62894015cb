use crate::{
    data::DataError, embedding::EmbeddingError, publish::PublishError, tracking::TrackingError,
    train::TrainingError,
};

/// Failure of one pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Data stage failed: {0}")]
    Data(#[from] DataError),
    #[error("Embedding stage failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Tracking failed: {0}")]
    Tracking(#[from] TrackingError),
    #[error("Training failed: {0}")]
    Training(#[from] TrainingError),
    #[error("Publishing failed: {0}")]
    Publish(#[from] PublishError),
}
