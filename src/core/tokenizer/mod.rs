pub mod traits;
pub mod word;

pub use traits::{DecodeOptions, EncodeOptions, Tokenizer};
pub use word::WordTokenizer;

use crate::core::TokenId;
use crate::error::{Result, RuntimeError};
use std::collections::HashMap;
use std::mem::size_of;

/// Entries longer than this are replaced by a placeholder.
pub const MAX_TOKEN_BYTES: usize = 100;

/// Per-entry cost of the id table plus the reverse index, string data aside.
const ENTRY_OVERHEAD: usize = 2 * size_of::<String>() + size_of::<TokenId>();

/// Fallback table used when a model carries no token array. The first four
/// entries are the reserved pad, unknown, sequence-start and sequence-end ids.
pub const BASIC_VOCAB: &[&str] = &[
    "<pad>", "<unk>", "<s>", "</s>", "the", "a", "an", "and", "or", "but", "in", "on", "at", "to",
    "for", "of", "with", "i", "you", "he", "she", "it", "we", "they", "am", "is", "are", "was",
    "were", "hello", "hi", "how", "what", "when", "where", "why", "who", "can", "will", "would",
    "good", "bad", "yes", "no", "please", "thank", "help", "time", "day", "night", "tensor",
    "model", "phase", "ai", "neural", "network", "gguf", "llama", "chat", "real", "data",
    "loading", "inference", "matrix", "attention", "layer", "embedding", ".", ",", "!", "?",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: TokenId,
    pub unk: TokenId,
    pub bos: TokenId,
    pub eos: TokenId,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            pad: TokenId::PAD,
            unk: TokenId::UNK,
            bos: TokenId::BOS,
            eos: TokenId::EOS,
        }
    }
}

/// Dense id ↔ string table. Every id in `0..size()` has a non-empty string.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, TokenId>,
    special: SpecialTokens,
}

impl Vocabulary {
    /// Builds a table of exactly `size` entries from a model token array.
    /// Missing, empty and oversized entries become `<token_N>`; reserved ids
    /// outside the table fall back to the defaults.
    pub fn from_tokens(tokens: &[String], size: usize, special: SpecialTokens) -> Result<Self> {
        let entries = (0..size).map(|i| match tokens.get(i) {
            Some(t) if !t.is_empty() && t.len() <= MAX_TOKEN_BYTES => t.clone(),
            _ => placeholder(i),
        });
        Self::build(size, entries, special)
    }

    /// The built-in table, truncated or padded with placeholders to `size`.
    pub fn basic(size: usize) -> Result<Self> {
        let entries =
            (0..size).map(|i| BASIC_VOCAB.get(i).map_or_else(|| placeholder(i), |t| t.to_string()));
        Self::build(size, entries, SpecialTokens::default())
    }

    fn build(
        size: usize,
        entries: impl Iterator<Item = String>,
        special: SpecialTokens,
    ) -> Result<Self> {
        let oom = || RuntimeError::AllocationFailure {
            bytes: size.saturating_mul(ENTRY_OVERHEAD),
        };
        let mut tokens = Vec::new();
        tokens.try_reserve_exact(size).map_err(|_| oom())?;
        let mut index = HashMap::new();
        index.try_reserve(size).map_err(|_| oom())?;

        for (i, t) in entries.enumerate() {
            index.entry(t.clone()).or_insert(TokenId(i as u32));
            tokens.push(t);
        }

        let defaults = SpecialTokens::default();
        let fit = |id: TokenId, fallback: TokenId| {
            if id.index() < tokens.len() {
                id
            } else {
                tracing::warn!(
                    "reserved token id {} outside vocabulary, using {}",
                    id.0,
                    fallback.0
                );
                fallback
            }
        };
        let special = SpecialTokens {
            pad: fit(special.pad, defaults.pad),
            unk: fit(special.unk, defaults.unk),
            bos: fit(special.bos, defaults.bos),
            eos: fit(special.eos, defaults.eos),
        };

        Ok(Self {
            tokens,
            index,
            special,
        })
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.tokens.get(id.index()).map(String::as_str)
    }

    pub fn id(&self, token: &str) -> Option<TokenId> {
        self.index.get(token).copied()
    }

    /// Approximate heap footprint of the table and its reverse index.
    pub fn bytes(&self) -> usize {
        self.tokens.iter().map(|t| ENTRY_OVERHEAD + 2 * t.len()).sum()
    }

    pub fn special(&self) -> SpecialTokens {
        self.special
    }

    /// Pad, sequence-start and sequence-end. The unknown token is content.
    pub fn is_control(&self, id: TokenId) -> bool {
        id == self.special.pad || id == self.special.bos || id == self.special.eos
    }
}

fn placeholder(i: usize) -> String {
    format!("<token_{}>", i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_vocab_padded() {
        let vocab = Vocabulary::basic(100).unwrap();
        assert_eq!(vocab.size(), 100);
        assert_eq!(vocab.token(TokenId(0)), Some("<pad>"));
        assert_eq!(vocab.id("hello"), Some(TokenId(29)));
        assert_eq!(vocab.token(TokenId(99)), Some("<token_99>"));
        assert_eq!(vocab.special(), SpecialTokens::default());
    }

    #[test]
    fn test_basic_vocab_truncated() {
        let vocab = Vocabulary::basic(6).unwrap();
        assert_eq!(vocab.size(), 6);
        assert_eq!(vocab.token(TokenId(5)), Some("a"));
        assert!(vocab.id("and").is_none());
    }

    #[test]
    fn test_from_tokens_replaces_bad_entries() {
        let tokens: Vec<String> =
            vec!["<pad>".into(), "".into(), "x".repeat(200), "ok".into(), "ok".into()];
        let vocab = Vocabulary::from_tokens(&tokens, 7, SpecialTokens::default()).unwrap();

        assert_eq!(vocab.size(), 7);
        assert_eq!(vocab.token(TokenId(1)), Some("<token_1>"));
        assert_eq!(vocab.token(TokenId(2)), Some("<token_2>"));
        assert_eq!(vocab.token(TokenId(6)), Some("<token_6>"));
        // First occurrence wins.
        assert_eq!(vocab.id("ok"), Some(TokenId(3)));
    }

    #[test]
    fn test_out_of_range_special_ids_fall_back() {
        let special = SpecialTokens {
            eos: TokenId(500),
            ..SpecialTokens::default()
        };
        let vocab = Vocabulary::basic(10).unwrap();
        let rebuilt = Vocabulary::from_tokens(&vocab.tokens, 10, special).unwrap();
        assert_eq!(rebuilt.special().eos, TokenId::EOS);
    }

    #[test]
    fn test_unallocatable_table_is_an_error() {
        let res = Vocabulary::basic(usize::MAX / 8);
        assert!(matches!(res, Err(RuntimeError::AllocationFailure { .. })));
    }

    #[test]
    fn test_bytes_grow_with_entries() {
        let small = Vocabulary::basic(8).unwrap();
        let large = Vocabulary::basic(800).unwrap();
        assert!(small.bytes() > 0);
        assert!(large.bytes() > small.bytes());
    }
}
