use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tokenizers::models::wordlevel::WordLevel;
use tokenizers::normalizers::Lowercase;
use tokenizers::pre_tokenizers::whitespace::WhitespaceSplit;

const UNK_TOKEN: &str = "[UNK]";
const PAD_TOKEN: &str = "[PAD]";

/// Pad tokens used by the common Hugging Face vocabularies, in lookup order.
const PAD_CANDIDATES: [&str; 3] = ["[PAD]", "<pad>", "<PAD>"];

pub trait Tokenizer: Send + Sync {
    fn encode(&self, value: &str) -> Vec<usize>;
    fn vocab_size(&self) -> usize;
    fn pad_token(&self) -> usize;
}

#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    #[error("failed to load tokenizer `{identifier}`: {message}")]
    Load { identifier: String, message: String },
    #[error("tokenizer `{0}` has no padding token")]
    NoPadToken(String),
    #[error("failed to build corpus vocabulary: {0}")]
    Build(String),
    #[error("failed to save tokenizer: {0}")]
    Save(String),
}

/// Wraps a `tokenizers` pipeline together with the id used for padding.
pub struct TextTokenizer {
    tokenizer: tokenizers::Tokenizer,
    pad_token: u32,
}

impl TextTokenizer {
    /// Resolves a tokenizer from the Hugging Face hub.
    pub fn from_pretrained(identifier: &str) -> Result<Self, TokenizerError> {
        let tokenizer = tokenizers::Tokenizer::from_pretrained(identifier, None).map_err(|e| {
            TokenizerError::Load {
                identifier: identifier.to_string(),
                message: e.to_string(),
            }
        })?;
        let pad_token = PAD_CANDIDATES
            .iter()
            .find_map(|token| tokenizer.token_to_id(token))
            .ok_or_else(|| TokenizerError::NoPadToken(identifier.to_string()))?;

        Ok(Self { tokenizer, pad_token })
    }

    /// Builds a lower-casing, whitespace-split word-level vocabulary over `texts`.
    ///
    /// Ids 0 and 1 are reserved for padding and unknown words; the remaining
    /// words are numbered in lexical order so the same corpus always yields
    /// the same vocabulary.
    pub fn from_corpus<'a, I>(texts: I) -> Result<Self, TokenizerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let words: BTreeSet<String> = texts
            .into_iter()
            .flat_map(|text| text.split_whitespace())
            .map(|word| word.to_lowercase())
            .collect();

        let mut vocab = HashMap::with_capacity(words.len() + 2);
        vocab.insert(PAD_TOKEN.to_string(), 0);
        vocab.insert(UNK_TOKEN.to_string(), 1);
        for word in words {
            let id = vocab.len() as u32;
            vocab.entry(word).or_insert(id);
        }

        let model = WordLevel::builder()
            .vocab(vocab.into_iter().collect())
            .unk_token(UNK_TOKEN.to_string())
            .build()
            .map_err(|e| TokenizerError::Build(e.to_string()))?;

        let mut tokenizer = tokenizers::Tokenizer::new(model);
        tokenizer.with_normalizer(Some(Lowercase));
        tokenizer.with_pre_tokenizer(Some(WhitespaceSplit));

        Ok(Self {
            tokenizer,
            pad_token: 0,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), TokenizerError> {
        self.tokenizer
            .save(path, false)
            .map_err(|e| TokenizerError::Save(e.to_string()))
    }
}

impl Tokenizer for TextTokenizer {
    fn encode(&self, value: &str) -> Vec<usize> {
        match self.tokenizer.encode(value, true) {
            Ok(encoding) => encoding.get_ids().iter().map(|t| *t as usize).collect(),
            Err(e) => {
                log::warn!("failed to encode review, treating it as empty: {e}");
                Vec::new()
            }
        }
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    fn pad_token(&self) -> usize {
        self.pad_token as usize
    }
}
