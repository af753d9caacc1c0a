use crate::runtime::Handle;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid model file: {0}")]
    InvalidFormat(String),

    /// Never returned by load; kept so callers can name the condition in logs.
    #[error("unsupported quantization kind {0}")]
    UnsupportedQuantization(u32),

    #[error("could not allocate {bytes} bytes")]
    AllocationFailure { bytes: usize },

    #[error("memory ceiling exceeded: requested {requested} bytes, {available} available")]
    MemoryExhausted { requested: usize, available: usize },

    #[error("unknown handle {0}")]
    HandleNotFound(Handle),

    #[error("model {handle} is still referenced by {sessions} session(s)")]
    ResourceInUse { handle: Handle, sessions: usize },

    #[error("generation fault: {0}")]
    GenerationFault(String),

    #[error("{what} exceeds limit ({actual} > {limit})")]
    LimitExceeded {
        what: &'static str,
        limit: usize,
        actual: usize,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }

    pub fn generation_fault(msg: impl Into<String>) -> Self {
        Self::GenerationFault(msg.into())
    }

    /// Errors that get one forced-cleanup retry before surfacing.
    pub fn is_memory_pressure(&self) -> bool {
        matches!(
            self,
            Self::MemoryExhausted { .. } | Self::AllocationFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Allocates a zeroed `Vec` of exactly `len` elements, reporting failure
/// instead of aborting.
pub(crate) fn try_alloc<T: Clone + Default>(len: usize) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| RuntimeError::AllocationFailure {
            bytes: len.saturating_mul(std::mem::size_of::<T>()),
        })?;
    buf.resize(len, T::default());
    Ok(buf)
}
