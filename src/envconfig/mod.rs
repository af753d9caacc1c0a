use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;

const MIB: usize = 1024 * 1024;

/// Limits and tunables for one runtime instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub memory_ceiling_bytes: usize,
    pub max_model_file_bytes: u64,
    /// Largest declared vocabulary a model may carry.
    pub max_vocab_size: usize,
    pub max_input_bytes: usize,
    pub max_tokens_per_generation: usize,
    pub max_response_chars: usize,
    pub model_tensor_budget_bytes: usize,
    pub max_tensor_elements: usize,
    pub max_materialized_tensors: usize,
    pub session_scratch_bytes: usize,
    /// Running sequences longer than this are trimmed by forced cleanup.
    pub history_trim_threshold: usize,
    /// Number of most recent tokens kept when trimming.
    pub history_retain: usize,
    pub batch_max_tokens: usize,
    pub sampling: SamplingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 50,
            top_p: 1.0,
            seed: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: 512 * MIB,
            max_model_file_bytes: 1024 * 1024 * 1024,
            max_vocab_size: 256 * 1024,
            max_input_bytes: 8192,
            max_tokens_per_generation: 2048,
            max_response_chars: 4096,
            model_tensor_budget_bytes: 32 * MIB,
            max_tensor_elements: 1 << 20,
            max_materialized_tensors: 10,
            session_scratch_bytes: 16 * MIB,
            history_trim_threshold: 1024,
            history_retain: 512,
            batch_max_tokens: 20,
            sampling: SamplingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with any `GPT_LITE_*` variables that parse.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Reads a JSON file; absent fields keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let cfg: Self = serde_json::from_str(&text)
            .map_err(|e| {
                RuntimeError::InvalidInput(format!("config {}: {}", path.as_ref().display(), e))
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("GPT_LITE_MEMORY_CEILING") {
            self.memory_ceiling_bytes = v;
        }
        if let Some(v) = env_parse("GPT_LITE_MAX_MODEL_FILE") {
            self.max_model_file_bytes = v;
        }
        if let Some(v) = env_parse("GPT_LITE_MAX_VOCAB") {
            self.max_vocab_size = v;
        }
        if let Some(v) = env_parse("GPT_LITE_MAX_INPUT") {
            self.max_input_bytes = v;
        }
        if let Some(v) = env_parse("GPT_LITE_MAX_TOKENS") {
            self.max_tokens_per_generation = v;
        }
        if let Some(v) = env_parse("GPT_LITE_TENSOR_BUDGET") {
            self.model_tensor_budget_bytes = v;
        }
        if let Some(v) = env_parse("GPT_LITE_SESSION_SCRATCH") {
            self.session_scratch_bytes = v;
        }
        if let Some(v) = env_parse("GPT_LITE_TEMPERATURE") {
            self.sampling.temperature = v;
        }
        if let Some(v) = env_parse("GPT_LITE_TOP_K") {
            self.sampling.top_k = v;
        }
        if let Some(v) = env_parse("GPT_LITE_TOP_P") {
            self.sampling.top_p = v;
        }
        if let Some(v) = env_parse("GPT_LITE_SEED") {
            self.sampling.seed = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(RuntimeError::InvalidInput(msg.to_string()));

        if self.memory_ceiling_bytes == 0 {
            return fail("memory_ceiling_bytes must be non-zero");
        }
        if self.max_vocab_size < 4 {
            return fail("max_vocab_size must leave room for the four reserved tokens");
        }
        if self.max_tokens_per_generation == 0 {
            return fail("max_tokens_per_generation must be non-zero");
        }
        if self.history_retain > self.history_trim_threshold {
            return fail("history_retain must not exceed history_trim_threshold");
        }
        if self.sampling.top_k == 0 {
            return fail("sampling.top_k must be at least 1");
        }
        if !(self.sampling.temperature > 0.0 && self.sampling.temperature.is_finite()) {
            return fail("sampling.temperature must be a positive number");
        }
        if !(self.sampling.top_p > 0.0 && self.sampling.top_p <= 1.0) {
            return fail("sampling.top_p must be in (0, 1]");
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.memory_ceiling_bytes, 512 * MIB);
        assert_eq!(cfg.sampling.top_k, 50);
    }

    #[test]
    fn test_validate_rejects_bad_retention() {
        let cfg = RuntimeConfig {
            history_retain: 2000,
            ..RuntimeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(RuntimeError::InvalidInput(_))));

        let cfg = RuntimeConfig {
            max_vocab_size: 3,
            ..RuntimeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(RuntimeError::InvalidInput(_))));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_input_bytes": 64, "sampling": {{"seed": 7}}}}"#).unwrap();

        let cfg = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.max_input_bytes, 64);
        assert_eq!(cfg.sampling.seed, Some(7));
        assert_eq!(cfg.sampling.top_k, 50);
        assert_eq!(cfg.history_retain, 512);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(RuntimeConfig::from_file(file.path()).is_err());
    }
}
