//! On-device text generation runtime for GGUF models.
//!
//! Models and sessions are addressed through opaque [`Handle`]s issued by a
//! [`Runtime`]. Every byte a model or session holds is attributed against a
//! configurable memory ceiling, and the runtime frees idle state on its own
//! when that ceiling is crossed.

pub mod core;
pub mod envconfig;
pub mod error;
pub mod gguf;
pub mod logging;
pub mod memory;
pub mod quant;
pub mod runtime;
pub mod sample;
pub mod session;

pub use crate::core::{
    ComputePipeline, Hyperparameters, ModelDescriptor, PlaceholderPipeline, TokenId, Tokenizer,
    Vocabulary, WordTokenizer,
};
pub use envconfig::{RuntimeConfig, SamplingConfig};
pub use error::{Result, RuntimeError};
pub use gguf::{GgufFile, GgufHeader, MetadataValue, TensorInfo};
pub use memory::{MemoryReport, Owner};
pub use quant::QuantKind;
pub use runtime::{CleanupReport, Handle, Runtime};
pub use sample::Sampler;
pub use session::{SessionStats, SessionStatus};

/// Installs the tracing subscriber. Safe to call more than once.
pub fn init() {
    logging::init();
}
