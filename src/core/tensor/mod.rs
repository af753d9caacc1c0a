pub mod ops;

pub use ops::{dot, softmax, TensorOps};

use crate::error::{Result, RuntimeError};

/// Row-major `rows x cols` activation matrix whose storage is reused across
/// calls.
#[derive(Debug, Clone, Default)]
pub struct Tensor {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Tensor {
    pub fn zeros(rows: usize, cols: usize) -> Result<Self> {
        let mut t = Self::default();
        t.resize(rows, cols)?;
        Ok(t)
    }

    /// Reshapes to `rows x cols` and zeroes the contents, growing the
    /// allocation only when needed.
    pub fn resize(&mut self, rows: usize, cols: usize) -> Result<()> {
        let len = rows
            .checked_mul(cols)
            .ok_or_else(|| {
                RuntimeError::generation_fault(format!("tensor {}x{} overflows", rows, cols))
            })?;

        if len > self.data.capacity() {
            let extra = len - self.data.len();
            self.data
                .try_reserve_exact(extra)
                .map_err(|_| RuntimeError::AllocationFailure {
                    bytes: len * std::mem::size_of::<f32>(),
                })?;
        }
        self.data.clear();
        self.data.resize(len, 0.0);
        self.rows = rows;
        self.cols = cols;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let cols = self.cols;
        &mut self.data[i * cols..(i + 1) * cols]
    }

    pub fn capacity_bytes(&self) -> usize {
        self.data.capacity() * std::mem::size_of::<f32>()
    }

    /// Drops the backing allocation.
    pub fn release(&mut self) {
        self.data = Vec::new();
        self.rows = 0;
        self.cols = 0;
    }
}
