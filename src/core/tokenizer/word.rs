use super::traits::{DecodeOptions, EncodeOptions, Tokenizer};
use super::Vocabulary;
use crate::core::TokenId;
use crate::error::Result;

/// Longest subword prefix tried when a word is not in the vocabulary.
pub const SUBWORD_WINDOW: usize = 10;

/// Whole-word lookup with greedy longest-prefix fallback.
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    vocab: Vocabulary,
}

impl WordTokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        Self { vocab }
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    fn unk(&self) -> TokenId {
        self.vocab.special().unk
    }

    fn push_word(&self, word: &str, out: &mut Vec<TokenId>) {
        if word.is_empty() {
            return;
        }
        if let Some(id) = self.vocab.id(word) {
            out.push(id);
            return;
        }
        self.tokenize_word(word, out);
    }

    /// Emits known prefixes of at most `SUBWORD_WINDOW` characters. The first
    /// position with no match emits the unknown id and drops the remainder.
    fn tokenize_word(&self, word: &str, out: &mut Vec<TokenId>) {
        let chars: Vec<char> = word.chars().collect();
        let mut start = 0;
        let mut candidate = String::with_capacity(SUBWORD_WINDOW * 4);

        while start < chars.len() {
            let longest = SUBWORD_WINDOW.min(chars.len() - start);
            let found = (1..=longest).rev().find_map(|len| {
                candidate.clear();
                candidate.extend(&chars[start..start + len]);
                self.vocab.id(&candidate).map(|id| (id, len))
            });

            match found {
                Some((id, len)) => {
                    out.push(id);
                    start += len;
                }
                None => {
                    out.push(self.unk());
                    break;
                }
            }
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

impl Tokenizer for WordTokenizer {
    fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    fn encode_with(&self, text: &str, options: &EncodeOptions) -> Result<Vec<TokenId>> {
        let special = self.vocab.special();
        let mut tokens = Vec::new();
        if options.sequence_start {
            tokens.push(special.bos);
        }

        let mut word = String::new();
        let mut symbol = [0u8; 4];
        for c in text.chars() {
            if is_word_char(c) {
                word.extend(c.to_lowercase());
                continue;
            }

            self.push_word(&word, &mut tokens);
            word.clear();

            if !c.is_whitespace() {
                let s = c.encode_utf8(&mut symbol);
                tokens.push(self.vocab.id(s).unwrap_or(special.unk));
            }
        }
        self.push_word(&word, &mut tokens);

        if options.sequence_end {
            tokens.push(special.eos);
        }
        if let Some(max) = options.max_len {
            tokens.truncate(max);
        }
        Ok(tokens)
    }

    fn decode_with(&self, ids: &[TokenId], options: &DecodeOptions) -> Result<String> {
        let unk = self.vocab.token(self.unk()).unwrap_or("<unk>");
        let text = ids
            .iter()
            .filter(|&&id| options.keep_control || !self.vocab.is_control(id))
            .map(|&id| self.vocab.token(id).unwrap_or(unk))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(text)
    }
}
