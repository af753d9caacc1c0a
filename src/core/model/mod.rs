pub mod catalog;

pub use catalog::{TensorCatalog, TensorRecord};

use crate::core::tokenizer::{SpecialTokens, Vocabulary, WordTokenizer};
use crate::envconfig::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::gguf::{GgufFile, TensorInfo};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TokenId(pub u32);

impl TokenId {
    pub const PAD: Self = Self(0);
    pub const UNK: Self = Self(1);
    pub const BOS: Self = Self(2);
    pub const EOS: Self = Self(3);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub const DEFAULT_VOCAB_SIZE: usize = 32000;
pub const DEFAULT_EMBEDDING_LENGTH: usize = 2048;
pub const DEFAULT_HEAD_COUNT: usize = 32;
pub const DEFAULT_BLOCK_COUNT: usize = 22;
pub const DEFAULT_CONTEXT_LENGTH: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Hyperparameters {
    pub vocab_size: usize,
    pub embedding_length: usize,
    pub head_count: usize,
    pub block_count: usize,
    pub context_length: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            vocab_size: DEFAULT_VOCAB_SIZE,
            embedding_length: DEFAULT_EMBEDDING_LENGTH,
            head_count: DEFAULT_HEAD_COUNT,
            block_count: DEFAULT_BLOCK_COUNT,
            context_length: DEFAULT_CONTEXT_LENGTH,
        }
    }
}

impl Hyperparameters {
    /// Reads `{arch}.*` keys, defaulting each absent one. The vocabulary size
    /// falls back to the token array length before the global default.
    pub fn from_gguf(file: &GgufFile) -> Result<Self> {
        let d = Self::default();
        let get = |suffix: &str, default: usize| {
            file.arch_u64(suffix).map_or(default, |v| v.min(usize::MAX as u64) as usize)
        };

        let token_count = file
            .get("tokenizer.ggml.tokens")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .filter(|&n| n > 0);

        let hp = Self {
            vocab_size: get("vocab_size", token_count.unwrap_or(d.vocab_size)),
            embedding_length: get("embedding_length", d.embedding_length),
            head_count: get("attention.head_count", d.head_count),
            block_count: get("block_count", d.block_count),
            context_length: get("context_length", d.context_length),
        };
        hp.validate()?;
        Ok(hp)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(RuntimeError::InvalidFormat(msg));

        if self.vocab_size < 4 {
            return bad(format!(
                "vocabulary size {} leaves no room for reserved tokens",
                self.vocab_size
            ));
        }
        let dims = [
            self.embedding_length,
            self.head_count,
            self.block_count,
            self.context_length,
        ];
        if dims.contains(&0) {
            return bad(format!("zero-sized hyperparameter in {:?}", self));
        }
        if self.embedding_length % self.head_count != 0 {
            return bad(format!(
                "embedding width {} is not divisible by {} heads",
                self.embedding_length, self.head_count
            ));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.embedding_length / self.head_count
    }
}

/// A loaded model: parsed header data, materialized tensors and tokenizer.
/// Shared read-only by every session built on it.
#[derive(Debug)]
pub struct ModelDescriptor {
    pub path: PathBuf,
    pub file_size: u64,
    pub format_version: u32,
    pub name: Option<String>,
    pub architecture: String,
    pub hparams: Hyperparameters,
    pub directory: Vec<TensorInfo>,
    pub catalog: TensorCatalog,
    pub tokenizer: WordTokenizer,
    loaded: bool,
}

impl ModelDescriptor {
    /// Parses `path` and materializes at most `tensor_budget` bytes of
    /// working-set tensors.
    pub fn load<P: AsRef<Path>>(
        path: P,
        config: &RuntimeConfig,
        tensor_budget: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file_size = std::fs::metadata(path)?.len();
        if file_size > config.max_model_file_bytes {
            return Err(RuntimeError::LimitExceeded {
                what: "model file size",
                limit: config.max_model_file_bytes as usize,
                actual: file_size as usize,
            });
        }

        let file = GgufFile::open(path)?;
        let hparams = Hyperparameters::from_gguf(&file)?;
        if hparams.vocab_size > config.max_vocab_size {
            return Err(RuntimeError::LimitExceeded {
                what: "vocabulary size",
                limit: config.max_vocab_size,
                actual: hparams.vocab_size,
            });
        }
        let vocab = build_vocabulary(&file, hparams.vocab_size)?;
        let catalog = TensorCatalog::materialize(&file, config, tensor_budget)?;

        tracing::info!(
            "loaded {} ({}): vocab={} embd={} heads={} layers={} ctx={}, {} tensors ({} bytes)",
            path.display(),
            file.architecture(),
            hparams.vocab_size,
            hparams.embedding_length,
            hparams.head_count,
            hparams.block_count,
            hparams.context_length,
            catalog.len(),
            catalog.bytes()
        );

        Ok(Self {
            path: path.to_path_buf(),
            file_size,
            format_version: file.header().version,
            name: file.get_str("general.name").map(str::to_string),
            architecture: file.architecture().to_string(),
            hparams,
            directory: file.tensors().to_vec(),
            catalog,
            tokenizer: WordTokenizer::new(vocab),
            loaded: true,
        })
    }

    /// Descriptor with no backing file and synthetic tensors.
    pub fn in_memory(hparams: Hyperparameters, vocab: Vocabulary) -> Result<Self> {
        hparams.validate()?;
        if vocab.size() != hparams.vocab_size {
            return Err(RuntimeError::InvalidInput(format!(
                "vocabulary has {} entries, hyperparameters declare {}",
                vocab.size(),
                hparams.vocab_size
            )));
        }
        Ok(Self {
            path: PathBuf::new(),
            file_size: 0,
            format_version: 0,
            name: None,
            architecture: "llama".to_string(),
            hparams,
            directory: Vec::new(),
            catalog: TensorCatalog::synthetic()?,
            tokenizer: WordTokenizer::new(vocab),
            loaded: true,
        })
    }

    pub fn vocab(&self) -> &Vocabulary {
        self.tokenizer.vocab()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Bytes attributed to this model by the memory budget: materialized
    /// tensors plus the token table.
    pub fn attributed_bytes(&self) -> usize {
        self.catalog.bytes() + self.vocab().bytes()
    }

    /// Structural check used by the health monitor.
    pub fn is_consistent(&self) -> bool {
        self.loaded
            && self.vocab().size() == self.hparams.vocab_size
            && self.catalog.is_consistent()
    }
}

fn build_vocabulary(file: &GgufFile, size: usize) -> Result<Vocabulary> {
    let special_id = |key: &str, default: TokenId| {
        file.get_u64(key)
            .and_then(|v| u32::try_from(v).ok())
            .map_or(default, TokenId)
    };
    let special = SpecialTokens {
        pad: special_id("tokenizer.ggml.padding_token_id", TokenId::PAD),
        unk: special_id("tokenizer.ggml.unknown_token_id", TokenId::UNK),
        bos: special_id("tokenizer.ggml.bos_token_id", TokenId::BOS),
        eos: special_id("tokenizer.ggml.eos_token_id", TokenId::EOS),
    };

    match file.get_strings("tokenizer.ggml.tokens") {
        Some(tokens) if !tokens.is_empty() => {
            if tokens.len() != size {
                tracing::warn!(
                    "token array has {} entries, vocabulary size is {}",
                    tokens.len(),
                    size
                );
            }
            Vocabulary::from_tokens(&tokens, size, special)
        }
        _ => {
            tracing::debug!("no token array, using built-in vocabulary padded to {}", size);
            Vocabulary::basic(size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hyperparameter_validation() {
        assert!(Hyperparameters::default().validate().is_ok());
        assert_eq!(Hyperparameters::default().head_dim(), 64);

        let uneven = Hyperparameters {
            embedding_length: 30,
            head_count: 4,
            ..Hyperparameters::default()
        };
        assert!(matches!(uneven.validate(), Err(RuntimeError::InvalidFormat(_))));

        let tiny_vocab = Hyperparameters {
            vocab_size: 3,
            ..Hyperparameters::default()
        };
        assert!(tiny_vocab.validate().is_err());
    }
}
