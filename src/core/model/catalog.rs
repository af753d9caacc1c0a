//! Materialized tensors of a loaded model.

use crate::envconfig::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::gguf::{GgufFile, TensorInfo};
use crate::quant::{self, MaterializeLimits, QuantKind};
use std::collections::HashMap;

/// Name fragments of the tensors the pipeline reads, in priority order.
pub const WORKING_SET: [&str; 6] =
    ["token_embd", "output_norm", "output", "attn_q", "attn_k", "attn_v"];

/// Stand-ins created when a file holds none of the working-set tensors.
const SYNTHETIC: [(&str, usize); 2] = [("token_embd.weight", 64), ("output.weight", 32)];

#[derive(Debug, Clone)]
pub struct TensorRecord {
    pub name: String,
    pub kind: QuantKind,
    pub declared_bytes: u64,
    pub elements: usize,
    pub synthetic: bool,
    buffer: Vec<f32>,
}

impl TensorRecord {
    pub fn data(&self) -> &[f32] {
        &self.buffer
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn bytes(&self) -> usize {
        self.capacity() * std::mem::size_of::<f32>()
    }

    fn is_consistent(&self) -> bool {
        self.elements > 0 && self.buffer.len() == self.elements && self.elements <= self.capacity()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TensorCatalog {
    records: Vec<TensorRecord>,
    index: HashMap<String, usize>,
}

impl TensorCatalog {
    /// Expands the working-set tensors of `file` within `budget_bytes`.
    pub fn materialize(
        file: &GgufFile,
        config: &RuntimeConfig,
        budget_bytes: usize,
    ) -> Result<Self> {
        let mut catalog = Self::default();
        let mut remaining = budget_bytes.min(config.model_tensor_budget_bytes);

        for info in select_working_set(file.tensors(), config.max_materialized_tensors) {
            let limits = MaterializeLimits {
                max_elements: config.max_tensor_elements,
                remaining_bytes: remaining,
            };
            let target = quant::target_elements(info.kind, info.size as usize, limits);
            if target == 0 {
                tracing::debug!("skipping {}: no budget left", info.name);
                continue;
            }

            if !info.kind.is_supported() {
                tracing::warn!(
                    "{}: {}, using deterministic fill",
                    info.name,
                    RuntimeError::UnsupportedQuantization(info.kind.tag())
                );
            }

            let buffer = quant::dequantize(info.kind, file.tensor_data(info), target)?;
            remaining -= target * std::mem::size_of::<f32>();
            tracing::debug!(
                "materialized {} ({}, {} -> {} elements)",
                info.name,
                info.kind,
                info.num_elements(),
                target
            );

            catalog.push(TensorRecord {
                name: info.name.clone(),
                kind: info.kind,
                declared_bytes: info.size,
                elements: target,
                synthetic: false,
                buffer,
            });
        }

        if catalog.is_empty() {
            catalog.add_synthetic(remaining)?;
        }
        Ok(catalog)
    }

    /// Catalog holding only the synthetic stand-ins.
    pub fn synthetic() -> Result<Self> {
        let mut catalog = Self::default();
        catalog.add_synthetic(usize::MAX)?;
        Ok(catalog)
    }

    fn add_synthetic(&mut self, available: usize) -> Result<()> {
        let needed: usize = SYNTHETIC.iter().map(|(_, n)| n * std::mem::size_of::<f32>()).sum();
        if needed > available {
            return Err(RuntimeError::MemoryExhausted {
                requested: needed,
                available,
            });
        }

        tracing::info!("no working-set tensors in file, using synthetic stand-ins");
        for (name, elements) in SYNTHETIC {
            let mut buffer = crate::error::try_alloc::<f32>(elements)?;
            quant::deterministic_fill(&mut buffer, 0);
            self.push(TensorRecord {
                name: name.to_string(),
                kind: QuantKind::F32,
                declared_bytes: 0,
                elements,
                synthetic: true,
                buffer,
            });
        }
        Ok(())
    }

    fn push(&mut self, record: TensorRecord) {
        self.index.insert(record.name.clone(), self.records.len());
        self.records.push(record);
    }

    pub fn get(&self, name: &str) -> Option<&TensorRecord> {
        self.index.get(name).map(|&i| &self.records[i])
    }

    /// First record whose name contains `fragment`.
    pub fn find(&self, fragment: &str) -> Option<&TensorRecord> {
        self.records.iter().find(|r| r.name.contains(fragment))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.records.iter().map(TensorRecord::bytes).sum()
    }

    pub fn is_consistent(&self) -> bool {
        !self.records.is_empty()
            && self.index.len() == self.records.len()
            && self.records.iter().all(TensorRecord::is_consistent)
    }
}

/// Working-set tensors ordered by fragment priority, then file order.
fn select_working_set(tensors: &[TensorInfo], max: usize) -> Vec<&TensorInfo> {
    let mut picked: Vec<(usize, usize, &TensorInfo)> = tensors
        .iter()
        .enumerate()
        .filter_map(|(pos, t)| {
            WORKING_SET
                .iter()
                .position(|frag| t.name.contains(frag))
                .map(|rank| (rank, pos, t))
        })
        .collect();
    picked.sort_by_key(|&(rank, pos, _)| (rank, pos));
    picked.into_iter().take(max).map(|(_, _, t)| t).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> TensorInfo {
        TensorInfo {
            name: name.to_string(),
            dims: vec![4],
            kind: QuantKind::F32,
            offset: 0,
            size: 16,
        }
    }

    #[test]
    fn test_working_set_selection_order() {
        let tensors = vec![
            info("blk.0.ffn_up.weight"),
            info("blk.0.attn_q.weight"),
            info("output.weight"),
            info("token_embd.weight"),
            info("output_norm.weight"),
        ];
        let names: Vec<&str> = select_working_set(&tensors, 10)
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["token_embd.weight", "output_norm.weight", "output.weight", "blk.0.attn_q.weight"]
        );

        assert_eq!(select_working_set(&tensors, 1).len(), 1);
    }

    #[test]
    fn test_synthetic_catalog() {
        let mut catalog = TensorCatalog::default();
        catalog.add_synthetic(4096).unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.is_consistent());
        assert_eq!(catalog.get("token_embd.weight").map(|r| r.elements), Some(64));
        assert!(catalog.find("output").is_some_and(|r| r.synthetic));
        assert!(catalog.bytes() >= 96 * 4);
    }

    #[test]
    fn test_synthetic_needs_budget() {
        let mut catalog = TensorCatalog::default();
        assert!(matches!(catalog.add_synthetic(10), Err(RuntimeError::MemoryExhausted { .. })));
    }

    #[test]
    fn test_empty_catalog_is_inconsistent() {
        assert!(!TensorCatalog::default().is_consistent());
    }
}
