use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::{
    data::{DatasetSource, REVIEWS_URL},
    embedding::{CORPUS_EMBED_DIM, EmbeddingSource},
    pipeline::{DEFAULT_EXPERIMENT, DEFAULT_TRACKING_URI, PipelineConfig},
    train::ARTIFACT_DIR,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbeddingKind {
    /// Tokenizer and token table of a multilingual sentence-transformer
    Pretrained,
    /// Word vocabulary of the training reviews with a fresh table
    Corpus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Wgpu,
    Ndarray,
}

/// Train the Disneyland review rating classifier and register it in MLflow.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Number of training epochs
    #[arg(long)]
    pub epochs: usize,

    /// Learning rate before decay
    #[arg(long = "initial_lr")]
    pub initial_lr: f64,

    /// MLflow server URL, or a local directory for a file store
    #[arg(long, env = "MLFLOW_TRACKING_URI", default_value = DEFAULT_TRACKING_URI)]
    pub tracking_uri: String,

    #[arg(long, default_value = DEFAULT_EXPERIMENT)]
    pub experiment_name: String,

    /// URL or path of the review CSV
    #[arg(long, default_value = REVIEWS_URL)]
    pub dataset: String,

    #[arg(long, value_enum, default_value_t = EmbeddingKind::Pretrained)]
    pub embedding: EmbeddingKind,

    /// Embedding width for the corpus vocabulary
    #[arg(long, default_value_t = CORPUS_EMBED_DIM)]
    pub embedding_dim: usize,

    #[arg(long, default_value_t = 256)]
    pub max_seq_len: usize,

    /// Local staging directory for the model files
    #[arg(long, default_value = ARTIFACT_DIR)]
    pub artifact_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu)]
    pub backend: BackendKind,

    /// Force a fresh download of the pretrained weights
    #[arg(short, long)]
    pub fresh: bool,
}

impl Args {
    pub fn pipeline_config(&self) -> PipelineConfig {
        let embedding = match self.embedding {
            EmbeddingKind::Pretrained => EmbeddingSource::default(),
            EmbeddingKind::Corpus => EmbeddingSource::Corpus {
                embed_dim: self.embedding_dim,
            },
        };

        PipelineConfig {
            tracking_uri: self.tracking_uri.clone(),
            experiment_name: self.experiment_name.clone(),
            dataset: DatasetSource::parse(&self.dataset),
            embedding,
            max_seq_len: self.max_seq_len,
            artifact_dir: self.artifact_dir.clone(),
            refresh_weights: self.fresh,
            ..PipelineConfig::new(self.epochs, self.initial_lr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epochs_and_learning_rate_are_required() {
        assert!(Args::try_parse_from(["train", "--epochs", "3"]).is_err());
        assert!(Args::try_parse_from(["train", "--initial_lr", "0.01"]).is_err());
        assert!(Args::try_parse_from(["train", "--epochs", "three", "--initial_lr", "0.01"]).is_err());
    }

    #[test]
    fn defaults_describe_the_hosted_setup() {
        let args =
            Args::try_parse_from(["train", "--epochs", "3", "--initial_lr", "0.01"]).unwrap();
        let config = args.pipeline_config();

        assert_eq!(config.epochs, 3);
        assert_eq!(config.initial_lr, 0.01);
        assert_eq!(config.experiment_name, "Disneyland_review_detector");
        assert_eq!(config.dataset, DatasetSource::Url(REVIEWS_URL.to_string()));
        assert_eq!(config.embedding, EmbeddingSource::default());
        assert_eq!(args.backend, BackendKind::Wgpu);
    }

    #[test]
    fn corpus_embedding_uses_requested_width() {
        let args = Args::try_parse_from([
            "train",
            "--epochs",
            "1",
            "--initial_lr",
            "0.1",
            "--embedding",
            "corpus",
            "--embedding-dim",
            "16",
            "--dataset",
            "reviews.csv",
            "--backend",
            "ndarray",
        ])
        .unwrap();
        let config = args.pipeline_config();

        assert_eq!(config.embedding, EmbeddingSource::Corpus { embed_dim: 16 });
        assert_eq!(config.dataset, DatasetSource::File(PathBuf::from("reviews.csv")));
        assert_eq!(args.backend, BackendKind::Ndarray);
    }
}
