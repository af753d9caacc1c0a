use crate::core::tensor::{dot, softmax, Tensor};
use crate::error::{Result, RuntimeError};

/// Multi-head self-attention where queries, keys and values are all the
/// head's slice of `x`. Writes `seq x width` into `out`; `scores` is
/// per-query workspace.
pub fn self_attention(
    x: &Tensor,
    heads: usize,
    out: &mut Tensor,
    scores: &mut Vec<f32>,
) -> Result<()> {
    let seq = x.rows();
    let width = x.cols();
    if heads == 0 || width % heads != 0 {
        return Err(RuntimeError::generation_fault(format!(
            "cannot split width {} into {} heads",
            width, heads
        )));
    }

    let head_dim = width / heads;
    let scale = 1.0 / (head_dim as f32).sqrt();
    out.resize(seq, width)?;
    scores.clear();
    scores.resize(seq, 0.0);

    for h in 0..heads {
        let (lo, hi) = (h * head_dim, (h + 1) * head_dim);
        for q in 0..seq {
            let query = &x.row(q)[lo..hi];
            for (k, s) in scores.iter_mut().enumerate() {
                *s = dot(query, &x.row(k)[lo..hi]) * scale;
            }
            softmax(scores);

            let dst = &mut out.row_mut(q)[lo..hi];
            for (k, &w) in scores.iter().enumerate() {
                for (o, v) in dst.iter_mut().zip(&x.row(k)[lo..hi]) {
                    *o += w * v;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_position_is_identity() {
        let mut x = Tensor::zeros(1, 4).unwrap();
        x.data_mut().copy_from_slice(&[0.5, -1.0, 2.0, 0.25]);
        let mut out = Tensor::default();
        let mut scores = Vec::new();

        self_attention(&x, 2, &mut out, &mut scores).unwrap();
        assert_eq!(out.data(), x.data());
    }

    #[test]
    fn test_output_is_convex_combination() {
        let mut x = Tensor::zeros(3, 2).unwrap();
        x.data_mut().copy_from_slice(&[1.0, 0.0, 0.0, 1.0, 2.0, 2.0]);
        let mut out = Tensor::default();
        let mut scores = Vec::new();

        self_attention(&x, 1, &mut out, &mut scores).unwrap();
        for q in 0..3 {
            for j in 0..2 {
                let v = out.row(q)[j];
                assert!((0.0..=2.0).contains(&v));
            }
        }
    }

    #[test]
    fn test_uneven_heads_rejected() {
        let x = Tensor::zeros(2, 6).unwrap();
        let mut out = Tensor::default();
        assert!(self_attention(&x, 4, &mut out, &mut Vec::new()).is_err());
    }
}
