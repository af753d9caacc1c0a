use super::Tensor;
use crate::error::{Result, RuntimeError};

pub trait TensorOps {
    /// Element-wise `self += other`.
    fn add_assign(&mut self, other: &Tensor) -> Result<()>;
    /// `x = max(0, scale * x)`.
    fn relu_scaled(&mut self, scale: f32);
    /// Normalizes every row to unit root-mean-square.
    fn rms_norm_rows(&mut self, eps: f32);
    fn copy_from(&mut self, other: &Tensor) -> Result<()>;
}

impl TensorOps for Tensor {
    fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        check_same_shape(self, other)?;
        for (a, b) in self.data_mut().iter_mut().zip(other.data()) {
            *a += b;
        }
        Ok(())
    }

    fn relu_scaled(&mut self, scale: f32) {
        for v in self.data_mut() {
            *v = (*v * scale).max(0.0);
        }
    }

    fn rms_norm_rows(&mut self, eps: f32) {
        let cols = self.cols();
        if cols == 0 {
            return;
        }
        for row in self.data_mut().chunks_exact_mut(cols) {
            let ss: f32 = row.iter().map(|x| x * x).sum();
            let inv = 1.0 / (ss / cols as f32 + eps).sqrt();
            for x in row {
                *x *= inv;
            }
        }
    }

    fn copy_from(&mut self, other: &Tensor) -> Result<()> {
        check_same_shape(self, other)?;
        self.data_mut().copy_from_slice(other.data());
        Ok(())
    }
}

fn check_same_shape(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.rows() != b.rows() || a.cols() != b.cols() {
        return Err(RuntimeError::generation_fault(format!(
            "shape mismatch: {}x{} vs {}x{}",
            a.rows(),
            a.cols(),
            b.rows(),
            b.cols()
        )));
    }
    Ok(())
}

/// Numerically stable in-place softmax.
pub fn softmax(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
