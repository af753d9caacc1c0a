use super::Vocabulary;
use crate::core::TokenId;
use crate::error::Result;

/// Text to token ids and back over a fixed [`Vocabulary`].
pub trait Tokenizer: Send + Sync {
    fn vocabulary(&self) -> &Vocabulary;

    fn encode_with(&self, text: &str, options: &EncodeOptions) -> Result<Vec<TokenId>>;

    fn decode_with(&self, ids: &[TokenId], options: &DecodeOptions) -> Result<String>;

    /// Prompt encoding: the sequence-start id comes first.
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        self.encode_with(text, &EncodeOptions::prompt())
    }

    /// Space-joined text with control ids left out.
    fn decode(&self, ids: &[TokenId]) -> Result<String> {
        self.decode_with(ids, &DecodeOptions::default())
    }

    fn token_text(&self, id: TokenId) -> Option<&str> {
        self.vocabulary().token(id)
    }

    fn token_id(&self, token: &str) -> Option<TokenId> {
        self.vocabulary().id(token)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    pub sequence_start: bool,
    pub sequence_end: bool,
    /// Cap on the total length, markers included.
    pub max_len: Option<usize>,
}

impl EncodeOptions {
    pub fn prompt() -> Self {
        Self {
            sequence_start: true,
            ..Self::default()
        }
    }

    pub fn with_sequence_end(mut self) -> Self {
        self.sequence_end = true;
        self
    }

    pub fn limit(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Emit pad, sequence-start and sequence-end ids as text too.
    pub keep_control: bool,
}

impl DecodeOptions {
    pub fn verbatim() -> Self {
        Self { keep_control: true }
    }
}
