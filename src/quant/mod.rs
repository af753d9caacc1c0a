//! Tensor element encodings and their expansion to `f32` buffers.
//!
//! Expansion is a deterministic simplification: packed codes are mapped to
//! `[-1, 1]` without per-block scales. Output length is always exactly the
//! requested target.

use crate::error::{try_alloc, Result};
use byteorder::{ByteOrder, LittleEndian};
use half::{bf16, f16};
use std::fmt;

/// Magnitude bound of the deterministic fill.
pub const FILL_MAGNITUDE: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum QuantKind {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    Q8_K,
    I8,
    I16,
    I32,
    I64,
    F64,
    BF16,
    Unsupported(u32),
}

impl From<u32> for QuantKind {
    fn from(tag: u32) -> Self {
        match tag {
            0 => QuantKind::F32,
            1 => QuantKind::F16,
            2 => QuantKind::Q4_0,
            3 => QuantKind::Q4_1,
            6 => QuantKind::Q5_0,
            7 => QuantKind::Q5_1,
            8 => QuantKind::Q8_0,
            9 => QuantKind::Q8_1,
            10 => QuantKind::Q2_K,
            11 => QuantKind::Q3_K,
            12 => QuantKind::Q4_K,
            13 => QuantKind::Q5_K,
            14 => QuantKind::Q6_K,
            15 => QuantKind::Q8_K,
            16 => QuantKind::I8,
            17 => QuantKind::I16,
            18 => QuantKind::I32,
            19 => QuantKind::I64,
            20 => QuantKind::F64,
            21 => QuantKind::BF16,
            other => QuantKind::Unsupported(other),
        }
    }
}

/// How the payload bytes of a kind are expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expansion {
    Float32,
    Float16,
    BFloat16,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    Nibbles,
    Crumbs,
    SignedBytes,
    Fill,
}

impl QuantKind {
    pub fn tag(&self) -> u32 {
        match self {
            QuantKind::F32 => 0,
            QuantKind::F16 => 1,
            QuantKind::Q4_0 => 2,
            QuantKind::Q4_1 => 3,
            QuantKind::Q5_0 => 6,
            QuantKind::Q5_1 => 7,
            QuantKind::Q8_0 => 8,
            QuantKind::Q8_1 => 9,
            QuantKind::Q2_K => 10,
            QuantKind::Q3_K => 11,
            QuantKind::Q4_K => 12,
            QuantKind::Q5_K => 13,
            QuantKind::Q6_K => 14,
            QuantKind::Q8_K => 15,
            QuantKind::I8 => 16,
            QuantKind::I16 => 17,
            QuantKind::I32 => 18,
            QuantKind::I64 => 19,
            QuantKind::F64 => 20,
            QuantKind::BF16 => 21,
            QuantKind::Unsupported(tag) => *tag,
        }
    }

    /// `(elements per block, bytes per block)`.
    pub fn block_geometry(&self) -> (usize, usize) {
        match self {
            QuantKind::F32 | QuantKind::I32 => (1, 4),
            QuantKind::F16 | QuantKind::BF16 | QuantKind::I16 => (1, 2),
            QuantKind::F64 | QuantKind::I64 => (1, 8),
            QuantKind::I8 => (1, 1),
            QuantKind::Q4_0 => (32, 18),
            QuantKind::Q4_1 => (32, 20),
            QuantKind::Q5_0 => (32, 22),
            QuantKind::Q5_1 => (32, 24),
            QuantKind::Q8_0 => (32, 34),
            QuantKind::Q8_1 => (32, 36),
            QuantKind::Q2_K => (256, 84),
            QuantKind::Q3_K => (256, 110),
            QuantKind::Q4_K => (256, 144),
            QuantKind::Q5_K => (256, 176),
            QuantKind::Q6_K => (256, 210),
            QuantKind::Q8_K => (256, 292),
            // Storage unknown; one byte per element is assumed.
            QuantKind::Unsupported(_) => (1, 1),
        }
    }

    pub fn is_block_quantized(&self) -> bool {
        self.block_geometry().0 > 1
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, QuantKind::Unsupported(_))
    }

    /// Declared on-disk size of `elements` values, rounded up to whole blocks.
    pub fn byte_size(&self, elements: u64) -> Option<u64> {
        let (block, bytes) = self.block_geometry();
        elements.div_ceil(block as u64).checked_mul(bytes as u64)
    }

    fn expansion(&self) -> Expansion {
        match self {
            QuantKind::F32 => Expansion::Float32,
            QuantKind::F16 => Expansion::Float16,
            QuantKind::BF16 => Expansion::BFloat16,
            QuantKind::F64 => Expansion::Float64,
            QuantKind::I8 => Expansion::Int8,
            QuantKind::I16 => Expansion::Int16,
            QuantKind::I32 => Expansion::Int32,
            QuantKind::I64 => Expansion::Int64,
            QuantKind::Q4_0
            | QuantKind::Q4_1
            | QuantKind::Q5_0
            | QuantKind::Q5_1
            | QuantKind::Q3_K
            | QuantKind::Q4_K
            | QuantKind::Q5_K
            | QuantKind::Q6_K => Expansion::Nibbles,
            QuantKind::Q2_K => Expansion::Crumbs,
            QuantKind::Q8_0 | QuantKind::Q8_1 | QuantKind::Q8_K => Expansion::SignedBytes,
            QuantKind::Unsupported(_) => Expansion::Fill,
        }
    }
}

impl fmt::Display for QuantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantKind::Unsupported(tag) => write!(f, "unsupported({})", tag),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Caps applied when sizing a materialized buffer.
#[derive(Debug, Clone, Copy)]
pub struct MaterializeLimits {
    pub max_elements: usize,
    /// Bytes still available in the owning model's tensor budget.
    pub remaining_bytes: usize,
}

/// Element count of the in-memory buffer for `byte_size` payload bytes.
pub fn target_elements(kind: QuantKind, byte_size: usize, limits: MaterializeLimits) -> usize {
    let (block, bytes) = kind.block_geometry();
    let whole_blocks = (byte_size / bytes) * block;
    let natural = if whole_blocks == 0 {
        byte_size * block / bytes
    } else {
        whole_blocks
    };

    natural
        .min(limits.max_elements)
        .min(limits.remaining_bytes / std::mem::size_of::<f32>())
}

/// Expands `data` into a buffer of exactly `target` floats.
pub fn dequantize(kind: QuantKind, data: &[u8], target: usize) -> Result<Vec<f32>> {
    let mut out = try_alloc::<f32>(target)?;
    let written = expand_into(kind.expansion(), data, &mut out);
    deterministic_fill(&mut out[written..], written);
    Ok(out)
}

/// Returns how many leading elements of `out` were written.
fn expand_into(expansion: Expansion, data: &[u8], out: &mut [f32]) -> usize {
    match expansion {
        Expansion::Float32 => {
            let n = out.len().min(data.len() / 4);
            match bytemuck::try_cast_slice::<u8, f32>(&data[..n * 4]) {
                Ok(src) if cfg!(target_endian = "little") => out[..n].copy_from_slice(src),
                _ => LittleEndian::read_f32_into(&data[..n * 4], &mut out[..n]),
            }
            n
        }
        Expansion::Float16 => {
            widen(data, 2, out, |c| f16::from_bits(LittleEndian::read_u16(c)).to_f32())
        }
        Expansion::BFloat16 => {
            widen(data, 2, out, |c| bf16::from_bits(LittleEndian::read_u16(c)).to_f32())
        }
        Expansion::Float64 => widen(data, 8, out, |c| LittleEndian::read_f64(c) as f32),
        Expansion::Int8 => widen(data, 1, out, |c| c[0] as i8 as f32),
        Expansion::Int16 => widen(data, 2, out, |c| LittleEndian::read_i16(c) as f32),
        Expansion::Int32 => widen(data, 4, out, |c| LittleEndian::read_i32(c) as f32),
        Expansion::Int64 => widen(data, 8, out, |c| LittleEndian::read_i64(c) as f32),
        Expansion::SignedBytes => widen(data, 1, out, |c| c[0] as i8 as f32 / 127.0),
        Expansion::Nibbles => unpack(data, 4, out),
        Expansion::Crumbs => unpack(data, 2, out),
        Expansion::Fill => 0,
    }
}

fn widen(data: &[u8], width: usize, out: &mut [f32], f: impl Fn(&[u8]) -> f32) -> usize {
    let mut n = 0;
    for (dst, chunk) in out.iter_mut().zip(data.chunks_exact(width)) {
        *dst = f(chunk);
        n += 1;
    }
    n
}

/// Sub-byte codes, least significant first, mapped to `v / max * 2 - 1`.
fn unpack(data: &[u8], bits: u32, out: &mut [f32]) -> usize {
    let per_byte = (8 / bits) as usize;
    let mask = (1u8 << bits) - 1;
    let max = mask as f32;

    let mut n = 0;
    'outer: for &byte in data {
        for k in 0..per_byte {
            if n == out.len() {
                break 'outer;
            }
            let code = (byte >> (k as u32 * bits)) & mask;
            out[n] = code as f32 / max * 2.0 - 1.0;
            n += 1;
        }
    }
    n
}

/// Low-magnitude values in `[-FILL_MAGNITUDE, FILL_MAGNITUDE)` derived from
/// the absolute element index.
pub fn deterministic_fill(out: &mut [f32], start_index: usize) {
    for (i, v) in out.iter_mut().enumerate() {
        *v = fill_value(start_index + i);
    }
}

fn fill_value(index: usize) -> f32 {
    let h = (index as u64 ^ 0x5DEE_CE66).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 40;
    (h as f32 / (1u64 << 24) as f32) * 2.0 * FILL_MAGNITUDE - FILL_MAGNITUDE
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TAGS: [u32; 22] = [
        0, 1, 2, 3, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 4, 99,
    ];

    fn unlimited() -> MaterializeLimits {
        MaterializeLimits {
            max_elements: usize::MAX,
            remaining_bytes: usize::MAX,
        }
    }

    #[test]
    fn test_tag_mapping() {
        assert_eq!(QuantKind::from(0), QuantKind::F32);
        assert_eq!(QuantKind::from(12), QuantKind::Q4_K);
        assert_eq!(QuantKind::from(4), QuantKind::Unsupported(4));
        for tag in ALL_TAGS {
            assert_eq!(QuantKind::from(tag).tag(), tag);
        }
    }

    #[test]
    fn test_byte_size_rounds_up_blocks() {
        assert_eq!(QuantKind::F32.byte_size(10), Some(40));
        assert_eq!(QuantKind::Q4_0.byte_size(32), Some(18));
        assert_eq!(QuantKind::Q4_0.byte_size(33), Some(36));
        assert_eq!(QuantKind::Q6_K.byte_size(512), Some(420));
        assert_eq!(QuantKind::F64.byte_size(u64::MAX), None);
    }

    #[test]
    fn test_target_elements() {
        assert_eq!(target_elements(QuantKind::F32, 400, unlimited()), 100);
        assert_eq!(target_elements(QuantKind::F16, 400, unlimited()), 200);
        assert_eq!(target_elements(QuantKind::Q4_0, 36, unlimited()), 64);
        // Shorter than one block: approximate from bit width.
        assert_eq!(target_elements(QuantKind::Q4_0, 9, unlimited()), 16);

        let capped = MaterializeLimits {
            max_elements: 50,
            remaining_bytes: usize::MAX,
        };
        assert_eq!(target_elements(QuantKind::F32, 400, capped), 50);

        let budget = MaterializeLimits {
            max_elements: usize::MAX,
            remaining_bytes: 40,
        };
        assert_eq!(target_elements(QuantKind::F32, 400, budget), 10);
    }

    #[test]
    fn test_nibble_order() {
        let out = dequantize(QuantKind::Q4_0, &[0xF0, 0x0F], 4).unwrap();
        assert_eq!(out, vec![-1.0, 1.0, 1.0, -1.0]);
    }

    #[test]
    fn test_two_bit_codes() {
        // 0b11_10_01_00
        let out = dequantize(QuantKind::Q2_K, &[0xE4], 4).unwrap();
        let expected = [-1.0, -1.0 / 3.0, 1.0 / 3.0, 1.0];
        for (a, b) in out.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_float_kinds() {
        let mut data = Vec::new();
        for v in [1.5f32, -2.0, 0.25] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(dequantize(QuantKind::F32, &data, 3).unwrap(), vec![1.5, -2.0, 0.25]);

        let data: Vec<u8> = [f16::from_f32(0.5), f16::from_f32(-3.0)]
            .iter()
            .flat_map(|h| h.to_bits().to_le_bytes())
            .collect();
        assert_eq!(dequantize(QuantKind::F16, &data, 2).unwrap(), vec![0.5, -3.0]);

        assert_eq!(dequantize(QuantKind::Q8_0, &[127, 0x81], 2).unwrap(), vec![1.0, -1.0]);
        assert_eq!(dequantize(QuantKind::I8, &[0xFE], 1).unwrap(), vec![-2.0]);
    }

    #[test]
    fn test_output_length_equals_target_for_every_kind() {
        let payload: Vec<u8> = (0..700u32).map(|i| (i * 37 % 251) as u8).collect();
        for tag in ALL_TAGS {
            let kind = QuantKind::from(tag);
            for size in [0usize, 1, 17, 300, 700] {
                let limits = MaterializeLimits {
                    max_elements: 256,
                    remaining_bytes: 4096,
                };
                let target = target_elements(kind, size, limits);
                let out = dequantize(kind, &payload[..size], target).unwrap();
                assert_eq!(out.len(), target, "{} with {} bytes", kind, size);
                assert!(out.iter().all(|v| v.is_finite()));
            }
        }
    }

    #[test]
    fn test_unsupported_fill_is_small_and_deterministic() {
        let kind = QuantKind::Unsupported(42);
        let a = dequantize(kind, &[1, 2, 3], 64).unwrap();
        let b = dequantize(kind, &[9, 9, 9], 64).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.abs() <= FILL_MAGNITUDE));
        assert!(a.iter().any(|v| *v != a[0]));
    }

    #[test]
    fn test_short_payload_is_completed_with_fill() {
        let out = dequantize(QuantKind::F32, &1.0f32.to_le_bytes(), 4).unwrap();
        assert_eq!(out[0], 1.0);
        assert!(out[1..].iter().all(|v| v.abs() <= FILL_MAGNITUDE));
    }
}
