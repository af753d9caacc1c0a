//! Generation session state machine.
//!
//! ```text
//! Idle -> Prefilled -> Streaming -> Completed | Stopped | Errored
//! ```
//!
//! Faults during a step land in `Errored` instead of propagating; later
//! steps report nothing further.

use crate::core::model::ModelDescriptor;
use crate::core::pipeline::{ComputePipeline, Scratch};
use crate::core::tokenizer::Tokenizer;
use crate::core::TokenId;
use crate::error::{Result, RuntimeError};
use crate::runtime::Handle;
use crate::sample::Sampler;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Idle,
    Prefilled,
    Streaming,
    Completed,
    Stopped,
    Errored(String),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Errored(_))
    }

    /// Prefilled or streaming: work is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Prefilled | Self::Streaming)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Prefilled => f.write_str("prefilled"),
            Self::Streaming => f.write_str("streaming"),
            Self::Completed => f.write_str("completed"),
            Self::Stopped => f.write_str("stopped"),
            Self::Errored(reason) => write!(f, "errored: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub model: Handle,
    pub status: SessionStatus,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub sequence_len: usize,
    pub max_tokens: usize,
    pub scratch_bytes: usize,
}

pub struct GenerationSession {
    model_handle: Handle,
    model: Arc<ModelDescriptor>,
    sampler: Sampler,
    scratch: Scratch,
    tokens: Vec<TokenId>,
    prompt_len: usize,
    emitted: Vec<TokenId>,
    max_tokens: usize,
    status: SessionStatus,
}

impl fmt::Debug for GenerationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationSession")
            .field("model", &self.model_handle)
            .field("status", &self.status)
            .field("tokens", &self.tokens.len())
            .field("emitted", &self.emitted.len())
            .finish()
    }
}

impl GenerationSession {
    pub fn new(model_handle: Handle, model: Arc<ModelDescriptor>, sampler: Sampler) -> Self {
        Self {
            model_handle,
            model,
            sampler,
            scratch: Scratch::default(),
            tokens: Vec::new(),
            prompt_len: 0,
            emitted: Vec::new(),
            max_tokens: 0,
            status: SessionStatus::Idle,
        }
    }

    pub fn model_handle(&self) -> Handle {
        self.model_handle
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// True when no further token will be produced.
    pub fn is_complete(&self) -> bool {
        !self.status.is_active()
    }

    pub fn generated(&self) -> usize {
        self.emitted.len()
    }

    pub fn emitted(&self) -> &[TokenId] {
        &self.emitted
    }

    pub fn sequence(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn scratch_bytes(&self) -> usize {
        self.scratch.bytes()
    }

    /// Encodes `prompt` and seeds the running sequence. Any previous
    /// generation on this session is discarded.
    pub fn prefill(&mut self, prompt: &str, max_tokens: usize) -> Result<()> {
        let tokens = self.model.tokenizer.encode(prompt)?;
        self.prompt_len = tokens.len();
        self.tokens = tokens;
        self.emitted.clear();
        self.max_tokens = max_tokens;
        self.status = SessionStatus::Prefilled;
        tracing::debug!("prefilled {} prompt tokens, budget {}", self.prompt_len, max_tokens);
        Ok(())
    }

    /// Runs one pipeline pass and samples. Returns the emitted id, or `None`
    /// once the session is no longer active.
    pub fn step(&mut self, pipeline: &dyn ComputePipeline) -> Option<TokenId> {
        if !self.status.is_active() {
            return None;
        }
        if self.emitted.len() >= self.max_tokens {
            self.status = SessionStatus::Completed;
            return None;
        }
        self.status = SessionStatus::Streaming;

        match self.sample_next(pipeline) {
            Ok(id) if id == self.model.vocab().special().eos => {
                // Control ids never reach the caller, so the marker is not recorded.
                tracing::debug!("end of sequence after {} tokens", self.emitted.len());
                self.status = SessionStatus::Completed;
                None
            }
            Ok(id) => {
                self.tokens.push(id);
                self.emitted.push(id);
                if self.emitted.len() >= self.max_tokens {
                    self.status = SessionStatus::Completed;
                }
                Some(id)
            }
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    fn sample_next(&mut self, pipeline: &dyn ComputePipeline) -> Result<TokenId> {
        let logits = pipeline.forward(&self.tokens, &self.model, &mut self.scratch)?;
        if logits.len() != self.model.hparams.vocab_size {
            return Err(RuntimeError::generation_fault(format!(
                "pipeline returned {} logits for a vocabulary of {}",
                logits.len(),
                self.model.hparams.vocab_size
            )));
        }
        let index = self.sampler.sample(&logits)?;
        Ok(TokenId(index as u32))
    }

    /// Cancels in-flight generation. Has no effect otherwise.
    pub fn stop(&mut self) {
        if self.status.is_active() {
            self.status = SessionStatus::Stopped;
        }
    }

    pub fn fail(&mut self, err: RuntimeError) {
        tracing::error!("session failed: {}", err);
        self.status = SessionStatus::Errored(err.to_string());
    }

    /// Keeps the last `retain` tokens once the sequence exceeds `threshold`.
    /// Returns the number of tokens dropped.
    pub fn trim_history(&mut self, threshold: usize, retain: usize) -> usize {
        if self.tokens.len() <= threshold {
            return 0;
        }
        let drop = self.tokens.len() - retain.min(self.tokens.len());
        self.tokens.drain(..drop);
        self.prompt_len = self.prompt_len.saturating_sub(drop);
        drop
    }

    pub fn release_scratch(&mut self) {
        self.scratch.release();
    }

    /// Text of an emitted token; empty for ids outside the vocabulary.
    pub fn token_text(&self, id: TokenId) -> String {
        self.model.tokenizer.token_text(id).unwrap_or_default().to_string()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            model: self.model_handle,
            status: self.status.clone(),
            prompt_tokens: self.prompt_len,
            generated_tokens: self.emitted.len(),
            sequence_len: self.tokens.len(),
            max_tokens: self.max_tokens,
            scratch_bytes: self.scratch.bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Hyperparameters;
    use crate::core::tokenizer::Vocabulary;
    use crate::envconfig::SamplingConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Emits fixed ids in order, then the end-of-sequence id.
    struct Scripted {
        ids: Vec<u32>,
        calls: AtomicUsize,
        vocab: usize,
    }

    impl ComputePipeline for Scripted {
        fn forward(
            &self,
            _tokens: &[TokenId],
            _model: &ModelDescriptor,
            _scratch: &mut Scratch,
        ) -> Result<Vec<f32>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let target = self.ids.get(n).copied().unwrap_or(TokenId::EOS.0) as usize;
            let mut logits = vec![-100.0; self.vocab];
            logits[target] = 100.0;
            Ok(logits)
        }

        fn estimate_bytes(&self, _seq_len: usize, _hparams: &Hyperparameters) -> usize {
            0
        }
    }

    struct Broken;

    impl ComputePipeline for Broken {
        fn forward(
            &self,
            _tokens: &[TokenId],
            _model: &ModelDescriptor,
            _scratch: &mut Scratch,
        ) -> Result<Vec<f32>> {
            Err(RuntimeError::generation_fault("boom"))
        }

        fn estimate_bytes(&self, _seq_len: usize, _hparams: &Hyperparameters) -> usize {
            0
        }
    }

    fn session() -> GenerationSession {
        let hparams = Hyperparameters {
            vocab_size: 64,
            embedding_length: 16,
            head_count: 2,
            block_count: 2,
            context_length: 64,
        };
        let model = ModelDescriptor::in_memory(hparams, Vocabulary::basic(64).unwrap()).unwrap();
        let sampler = Sampler::new(&SamplingConfig {
            seed: Some(1),
            ..SamplingConfig::default()
        });
        GenerationSession::new(Handle::from_raw(1).unwrap(), Arc::new(model), sampler)
    }

    fn scripted(ids: &[u32]) -> Scripted {
        Scripted {
            ids: ids.to_vec(),
            calls: AtomicUsize::new(0),
            vocab: 64,
        }
    }

    #[test]
    fn test_idle_session_is_complete() {
        let mut s = session();
        assert!(s.is_complete());
        assert_eq!(s.step(&scripted(&[10])), None);
        assert_eq!(s.status(), &SessionStatus::Idle);
    }

    #[test]
    fn test_budget_completes() {
        let mut s = session();
        let p = scripted(&[10, 11, 12, 13]);
        s.prefill("hello", 2).unwrap();
        assert_eq!(s.status(), &SessionStatus::Prefilled);
        assert!(!s.is_complete());

        assert_eq!(s.step(&p), Some(TokenId(10)));
        assert_eq!(s.status(), &SessionStatus::Streaming);
        assert_eq!(s.step(&p), Some(TokenId(11)));
        assert_eq!(s.status(), &SessionStatus::Completed);
        assert_eq!(s.step(&p), None);
        assert_eq!(s.generated(), 2);
        assert_eq!(s.sequence().len(), 4);
    }

    #[test]
    fn test_end_of_sequence_completes() {
        let mut s = session();
        s.prefill("hello", 10).unwrap();
        let p = scripted(&[7]);
        assert_eq!(s.step(&p), Some(TokenId(7)));
        let before = s.sequence().len();
        assert_eq!(s.step(&p), None);
        assert_eq!(s.status(), &SessionStatus::Completed);
        // The end marker is neither emitted nor kept in the running sequence.
        assert_eq!(s.emitted(), &[TokenId(7)]);
        assert_eq!(s.sequence().len(), before);
        assert!(!s.sequence().contains(&TokenId::EOS));
    }

    #[test]
    fn test_stop_is_terminal() {
        let mut s = session();
        let p = scripted(&[5, 6, 7, 8]);
        s.prefill("hi", 10).unwrap();
        s.step(&p);
        s.stop();
        assert_eq!(s.status(), &SessionStatus::Stopped);
        assert!(s.is_complete());
        assert_eq!(s.step(&p), None);

        // Stopping again or after completion changes nothing.
        s.stop();
        assert_eq!(s.status(), &SessionStatus::Stopped);
    }

    #[test]
    fn test_fault_goes_to_errored() {
        let mut s = session();
        s.prefill("hi", 10).unwrap();
        assert_eq!(s.step(&Broken), None);
        assert!(matches!(s.status(), SessionStatus::Errored(msg) if msg.contains("boom")));
        assert!(s.is_complete());
    }

    #[test]
    fn test_prefill_restarts_finished_session() {
        let mut s = session();
        s.prefill("hi", 1).unwrap();
        s.step(&scripted(&[9]));
        assert!(s.is_complete());

        s.prefill("hello there", 3).unwrap();
        assert_eq!(s.generated(), 0);
        assert!(!s.is_complete());
    }

    #[test]
    fn test_trim_history() {
        let mut s = session();
        s.prefill("the a an and or but in on at to for of", 4).unwrap();
        let before = s.sequence().len();
        assert_eq!(before, 13);
        assert_eq!(s.trim_history(20, 5), 0);
        assert_eq!(s.trim_history(10, 5), 8);
        assert_eq!(s.sequence().len(), 5);
        assert_eq!(s.stats().prompt_tokens, 5);
    }
}
