use crate::core::tensor::softmax;
use crate::envconfig::SamplingConfig;
use crate::error::{Result, RuntimeError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Temperature, top-k and nucleus sampling driven by one uniform draw per
/// token.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: &SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature: config.temperature,
            top_k: config.top_k.max(1),
            top_p: config.top_p,
            rng,
        }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Index of the sampled entry of `logits`.
    pub fn sample(&mut self, logits: &[f32]) -> Result<usize> {
        if logits.is_empty() {
            return Err(RuntimeError::generation_fault("no logits to sample from"));
        }

        let temperature = self.temperature.max(f32::EPSILON);
        let mut probs: Vec<f32> = logits.iter().map(|l| l / temperature).collect();
        softmax(&mut probs);

        let mut candidates: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
        let k = self.top_k.min(candidates.len());
        if k < candidates.len() {
            candidates.select_nth_unstable_by(k - 1, |a, b| b.1.total_cmp(&a.1));
            candidates.truncate(k);
        }
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        if self.top_p < 1.0 {
            let mut cumulative = 0.0;
            let keep = candidates
                .iter()
                .position(|&(_, p)| {
                    cumulative += p;
                    cumulative >= self.top_p
                })
                .map_or(candidates.len(), |i| i + 1);
            candidates.truncate(keep);
        }

        let mass: f32 = candidates.iter().map(|&(_, p)| p).sum();
        let r = self.rng.gen::<f32>() * mass;
        let mut cumulative = 0.0;
        for &(i, p) in &candidates {
            cumulative += p;
            if r < cumulative {
                return Ok(i);
            }
        }
        Ok(candidates.last().map_or(0, |&(i, _)| i))
    }
}
