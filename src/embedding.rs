//! Resolves the token-embedding stage of the classifier: the tokenizer and,
//! for pretrained sources, the initial embedding table.
//!
//! Pretrained tables are read from a Hugging Face `model.safetensors` file.
//! Downloads are cached under the platform cache directory (override with
//! `DISNEY_SENTIMENT_CACHE`), keyed by the SHA-256 of the URL, and a sidecar
//! digest of the content is checked before a cached file is reused.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::prelude::*;
use safetensors::{Dtype, SafeTensors};
use sha2::{Digest, Sha256};

use crate::data::{TextTokenizer, Tokenizer, TokenizerError};

pub const PRETRAINED_MODEL: &str = "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2";
pub const PRETRAINED_TENSOR: &str = "embeddings.word_embeddings.weight";
pub const CORPUS_EMBED_DIM: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Download error: {0}")]
    Download(#[from] reqwest::Error),
    #[error("Download of {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error("Invalid safetensors file: {0}")]
    SafeTensors(String),
    #[error("Tensor `{0}` not found in weights file")]
    MissingTensor(String),
    #[error("Tensor `{name}` has unsupported layout {dtype:?} {shape:?}, expected a 2D F32 table")]
    UnsupportedTensor {
        name: String,
        dtype: Dtype,
        shape: Vec<usize>,
    },
    #[error("Embedding table has {table} rows but the tokenizer produces ids up to {vocab}")]
    VocabularyMismatch { table: usize, vocab: usize },
}

/// Where the embedding stage comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingSource {
    /// Tokenizer and token table of a Hugging Face model.
    Pretrained { model_id: String, tensor: String },
    /// Word-level vocabulary of the training corpus with a fresh table.
    Corpus { embed_dim: usize },
}

impl Default for EmbeddingSource {
    fn default() -> Self {
        Self::Pretrained {
            model_id: PRETRAINED_MODEL.to_string(),
            tensor: PRETRAINED_TENSOR.to_string(),
        }
    }
}

/// Token table as loaded from disk, row-major `[vocab_size, embed_dim]`.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    pub values: Vec<f32>,
    pub vocab_size: usize,
    pub embed_dim: usize,
}

impl EmbeddingTable {
    pub fn into_tensor<B: Backend>(self, device: &B::Device) -> Tensor<B, 2> {
        Tensor::from_data(
            TensorData::new(self.values, [self.vocab_size, self.embed_dim]),
            device,
        )
    }
}

/// Tokenizer plus the dimensions (and optional initial weights) of the table.
pub struct ResolvedEmbedding {
    pub tokenizer: Arc<TextTokenizer>,
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub table: Option<EmbeddingTable>,
}

impl ResolvedEmbedding {
    pub fn resolve<'a, I>(
        source: &EmbeddingSource,
        cache: &WeightCache,
        corpus: I,
    ) -> Result<Self, EmbeddingError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        match source {
            EmbeddingSource::Pretrained { model_id, tensor } => {
                log::info!("Resolving pretrained embedding {model_id}");
                let tokenizer = TextTokenizer::from_pretrained(model_id)?;
                let weights = cache.fetch(&weights_url(model_id))?;
                let table = load_table(&weights, tensor)?;
                if table.vocab_size < tokenizer.vocab_size() {
                    return Err(EmbeddingError::VocabularyMismatch {
                        table: table.vocab_size,
                        vocab: tokenizer.vocab_size(),
                    });
                }
                log::info!(
                    "Pretrained table: {} tokens x {} dims",
                    table.vocab_size,
                    table.embed_dim
                );

                Ok(Self {
                    tokenizer: Arc::new(tokenizer),
                    vocab_size: table.vocab_size,
                    embed_dim: table.embed_dim,
                    table: Some(table),
                })
            }
            EmbeddingSource::Corpus { embed_dim } => {
                let tokenizer = TextTokenizer::from_corpus(corpus)?;
                log::info!(
                    "Corpus embedding: {} tokens x {} dims",
                    tokenizer.vocab_size(),
                    embed_dim
                );

                Ok(Self {
                    vocab_size: tokenizer.vocab_size(),
                    tokenizer: Arc::new(tokenizer),
                    embed_dim: *embed_dim,
                    table: None,
                })
            }
        }
    }
}

pub fn weights_url(model_id: &str) -> String {
    format!("https://huggingface.co/{model_id}/resolve/main/model.safetensors")
}

/// Reads one 2D `F32` tensor out of a safetensors file.
pub fn load_table(path: &Path, name: &str) -> Result<EmbeddingTable, EmbeddingError> {
    let bytes = fs::read(path)?;
    let tensors =
        SafeTensors::deserialize(&bytes).map_err(|e| EmbeddingError::SafeTensors(e.to_string()))?;
    let view = tensors
        .tensor(name)
        .map_err(|_| EmbeddingError::MissingTensor(name.to_string()))?;

    let shape = view.shape().to_vec();
    if view.dtype() != Dtype::F32 || shape.len() != 2 {
        return Err(EmbeddingError::UnsupportedTensor {
            name: name.to_string(),
            dtype: view.dtype(),
            shape,
        });
    }

    let values = view
        .data()
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    Ok(EmbeddingTable {
        values,
        vocab_size: shape[0],
        embed_dim: shape[1],
    })
}

/// Download cache for pretrained weight files.
#[derive(Debug, Clone)]
pub struct WeightCache {
    dir: PathBuf,
}

impl WeightCache {
    pub fn new_default() -> io::Result<Self> {
        Self::new(Self::default_dir())
    }

    pub fn default_dir() -> PathBuf {
        if let Ok(path) = env::var("DISNEY_SENTIMENT_CACHE") {
            return PathBuf::from(path).join("weights");
        }

        if let Some(cache_dir) = dirs::cache_dir() {
            return cache_dir.join("disneyland-sentiment").join("weights");
        }

        if let Some(home_dir) = dirs::home_dir() {
            return home_dir
                .join(".cache")
                .join("disneyland-sentiment")
                .join("weights");
        }

        env::temp_dir().join("disneyland-sentiment").join("weights")
    }

    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(sha256_hex(url.as_bytes()))
    }

    fn digest_path(path: &Path) -> PathBuf {
        path.with_extension("sha256")
    }

    /// Whether a cached copy of `url` exists and still matches its digest.
    pub fn is_cached(&self, url: &str) -> Result<bool, EmbeddingError> {
        let path = self.path_for(url);
        let digest_path = Self::digest_path(&path);
        if !path.exists() || !digest_path.exists() {
            return Ok(false);
        }

        let expected = fs::read_to_string(&digest_path)?;
        let actual = sha256_hex(&fs::read(&path)?);
        log::debug!("Cached {url}: expected {}, got {actual}", expected.trim());
        Ok(expected.trim() == actual)
    }

    /// Returns the local path of `url`, downloading it first if needed.
    pub fn fetch(&self, url: &str) -> Result<PathBuf, EmbeddingError> {
        let path = self.path_for(url);
        if self.is_cached(url)? {
            log::info!("Using cached weights at {path:?}");
            return Ok(path);
        }

        log::info!("Downloading {url} to {path:?}");
        let response = reqwest::blocking::get(url)?;
        log::debug!("Download response status: {}", response.status());
        if !response.status().is_success() {
            return Err(EmbeddingError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let bytes = response.bytes()?;
        log::info!("Downloaded {} bytes", bytes.len());

        fs::write(&path, &bytes)?;
        fs::write(Self::digest_path(&path), sha256_hex(&bytes))?;
        Ok(path)
    }

    pub fn remove(&self, url: &str) -> Result<(), EmbeddingError> {
        let path = self.path_for(url);
        for file in [Self::digest_path(&path), path] {
            if file.exists() {
                fs::remove_file(&file)?;
            }
        }
        Ok(())
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use safetensors::tensor::TensorView;

    fn write_table(path: &Path, name: &str, rows: usize, cols: usize) {
        let values: Vec<f32> = (0..rows * cols).map(|v| v as f32).collect();
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = TensorView::new(Dtype::F32, vec![rows, cols], &bytes).unwrap();
        let tensors = HashMap::from([(name.to_string(), view)]);
        safetensors::serialize_to_file(&tensors, &None, path).unwrap();
    }

    #[test]
    fn loads_named_table_from_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_table(&path, PRETRAINED_TENSOR, 3, 2);

        let table = load_table(&path, PRETRAINED_TENSOR).unwrap();

        assert_eq!((table.vocab_size, table.embed_dim), (3, 2));
        assert_eq!(table.values, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn reports_missing_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_table(&path, "pooler.dense.weight", 2, 2);

        let err = load_table(&path, PRETRAINED_TENSOR).unwrap_err();

        assert!(matches!(err, EmbeddingError::MissingTensor(_)));
    }

    #[test]
    fn cache_entry_is_rejected_after_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WeightCache::new(dir.path()).unwrap();
        let url = "https://huggingface.co/some/model/resolve/main/model.safetensors";
        let path = cache.path_for(url);

        fs::write(&path, b"weights").unwrap();
        fs::write(WeightCache::digest_path(&path), sha256_hex(b"weights")).unwrap();
        assert!(cache.is_cached(url).unwrap());

        fs::write(&path, b"tampered").unwrap();
        assert!(!cache.is_cached(url).unwrap());

        cache.remove(url).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn corpus_source_builds_vocabulary_without_table() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WeightCache::new(dir.path()).unwrap();

        let resolved = ResolvedEmbedding::resolve(
            &EmbeddingSource::Corpus { embed_dim: 8 },
            &cache,
            ["super parc", "trop cher"],
        )
        .unwrap();

        assert_eq!(resolved.vocab_size, 6);
        assert_eq!(resolved.embed_dim, 8);
        assert!(resolved.table.is_none());
    }

    #[test]
    fn weights_url_points_at_hub_file() {
        assert_eq!(
            weights_url("org/model"),
            "https://huggingface.co/org/model/resolve/main/model.safetensors"
        );
    }
}
