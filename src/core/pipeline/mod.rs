//! Token sequence to logits.
//!
//! [`ComputePipeline`] is the seam between generation control and the
//! numerical work. [`PlaceholderPipeline`] runs the full data flow
//! (embedding, positional term, attention, feed-forward, projection) with
//! fixed arithmetic instead of trained weights.

pub mod attention;

use crate::core::model::{Hyperparameters, ModelDescriptor};
use crate::core::tensor::{Tensor, TensorOps};
use crate::core::TokenId;
use crate::error::{try_alloc, Result, RuntimeError};
use std::f32::consts::PI;

pub trait ComputePipeline: Send + Sync {
    /// Logits for the token following `tokens`; length equals the model's
    /// vocabulary size.
    fn forward(
        &self,
        tokens: &[TokenId],
        model: &ModelDescriptor,
        scratch: &mut Scratch,
    ) -> Result<Vec<f32>>;

    /// Upper bound of transient bytes one `forward` call over `seq_len`
    /// tokens needs, scratch included.
    fn estimate_bytes(&self, seq_len: usize, hparams: &Hyperparameters) -> usize;
}

/// Per-session working buffers, reused across steps.
#[derive(Debug, Default)]
pub struct Scratch {
    hidden: Tensor,
    mixed: Tensor,
    scores: Vec<f32>,
}

impl Scratch {
    pub fn bytes(&self) -> usize {
        self.hidden.capacity_bytes()
            + self.mixed.capacity_bytes()
            + self.scores.capacity() * std::mem::size_of::<f32>()
    }

    pub fn release(&mut self) {
        self.hidden.release();
        self.mixed.release();
        self.scores = Vec::new();
    }

    fn prepare(&mut self, seq: usize, width: usize) -> Result<()> {
        self.hidden.resize(seq, width)?;
        self.mixed.resize(seq, width)?;
        if self.scores.capacity() < seq {
            self.scores
                .try_reserve_exact(seq - self.scores.len())
                .map_err(|_| RuntimeError::AllocationFailure {
                    bytes: seq * std::mem::size_of::<f32>(),
                })?;
        }
        Ok(())
    }
}

const EMBED_TENSOR_WEIGHT: f32 = 0.01;
const POSITION_WEIGHT: f32 = 0.1;
const FFN_SCALE: f32 = 1.5;
const FREQUENCY_BIAS: f32 = 0.05;
const WEIGHT_MODULUS: usize = 97;

#[derive(Debug, Clone)]
pub struct PlaceholderPipeline {
    pub rms_eps: f32,
}

impl Default for PlaceholderPipeline {
    fn default() -> Self {
        Self { rms_eps: 1e-5 }
    }
}

impl PlaceholderPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn embed(&self, tokens: &[TokenId], model: &ModelDescriptor, out: &mut Tensor) {
        let vocab = model.hparams.vocab_size as f32;
        let seq = tokens.len() as f32;
        let table = model.catalog.find("token_embd").map(|r| r.data()).filter(|d| !d.is_empty());
        let width = out.cols();

        for (p, id) in tokens.iter().enumerate() {
            let phase = p as f32 / seq * PI;
            let row = out.row_mut(p);
            for (j, v) in row.iter_mut().enumerate() {
                let mut e = (id.0 as f32 + j as f32) / vocab * 2.0 - 1.0;
                if let Some(t) = table {
                    e += EMBED_TENSOR_WEIGHT * t[(id.index() * width + j) % t.len()];
                }
                *v = e + POSITION_WEIGHT * (phase * (j + 1) as f32).sin();
            }
        }
    }

    /// `logit[i] = sum_j h[j] * w(i, j) / sqrt(width) - bias(i)` with
    /// `w(i, j) = ((31i + 17j) mod 97) / 97 - 0.5`. Components are summed per
    /// residue of `17j` first, so each logit costs 97 products.
    fn project(&self, hidden: &[f32], width: usize, vocab: usize) -> Result<Vec<f32>> {
        let m = WEIGHT_MODULUS;
        let mut buckets = [0.0f32; WEIGHT_MODULUS];
        for j in 0..width {
            buckets[(17 * j) % m] += hidden.get(j).copied().unwrap_or(0.0);
        }
        let weights: Vec<f32> = (0..m).map(|r| r as f32 / m as f32 - 0.5).collect();
        let scale = 1.0 / (width.max(1) as f32).sqrt();

        let mut logits = try_alloc::<f32>(vocab)?;
        for (i, logit) in logits.iter_mut().enumerate() {
            let base = (31 * i) % m;
            let acc: f32 = buckets
                .iter()
                .enumerate()
                .map(|(r, b)| b * weights[(base + r) % m])
                .sum();
            *logit = acc * scale - FREQUENCY_BIAS * (1.0 + i as f32).ln();
        }
        Ok(logits)
    }
}

impl ComputePipeline for PlaceholderPipeline {
    fn forward(
        &self,
        tokens: &[TokenId],
        model: &ModelDescriptor,
        scratch: &mut Scratch,
    ) -> Result<Vec<f32>> {
        let hp = &model.hparams;
        let window = &tokens[tokens.len().saturating_sub(hp.context_length)..];
        if window.is_empty() {
            return Err(RuntimeError::generation_fault("empty token sequence"));
        }

        let seq = window.len();
        let width = hp.embedding_length;
        scratch.prepare(seq, width)?;
        self.embed(window, model, &mut scratch.hidden);

        let Scratch { hidden, mixed, scores } = scratch;
        for _ in 0..hp.block_count {
            attention::self_attention(hidden, hp.head_count, mixed, scores)?;
            mixed.add_assign(hidden)?;
            hidden.copy_from(mixed)?;
            mixed.relu_scaled(FFN_SCALE);
            hidden.add_assign(mixed)?;
            hidden.rms_norm_rows(self.rms_eps);
        }

        let logits = self.project(hidden.row(seq - 1), width, hp.vocab_size)?;
        if let Some(i) = logits.iter().position(|v| !v.is_finite()) {
            return Err(RuntimeError::generation_fault(format!("non-finite logit at {}", i)));
        }
        Ok(logits)
    }

    fn estimate_bytes(&self, seq_len: usize, hparams: &Hyperparameters) -> usize {
        let seq = seq_len.clamp(1, hparams.context_length);
        let f = std::mem::size_of::<f32>();
        (2 * seq * hparams.embedding_length + seq + hparams.vocab_size) * f
    }
}
