//! Byte accounting against a process-wide ceiling.

use crate::error::{Result, RuntimeError};
use crate::runtime::Handle;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Owner {
    Model(Handle),
    Session(Handle),
}

#[derive(Debug, Clone)]
pub struct MemoryBudget {
    ceiling: usize,
    attributed: BTreeMap<Owner, usize>,
    high_water: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub total_bytes: usize,
    pub ceiling_bytes: usize,
    pub high_water_bytes: usize,
    pub models: Vec<(Handle, usize)>,
    pub sessions: Vec<(Handle, usize)>,
}

impl MemoryBudget {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            attributed: BTreeMap::new(),
            high_water: 0,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn set_ceiling(&mut self, ceiling: usize) {
        self.ceiling = ceiling;
    }

    pub fn total(&self) -> usize {
        self.attributed.values().sum()
    }

    pub fn available(&self) -> usize {
        self.ceiling.saturating_sub(self.total())
    }

    pub fn is_within_ceiling(&self) -> bool {
        self.total() <= self.ceiling
    }

    pub fn attributed(&self, owner: Owner) -> Option<usize> {
        self.attributed.get(&owner).copied()
    }

    /// Fails with `MemoryExhausted` unless `extra` more bytes fit.
    pub fn check(&self, extra: usize) -> Result<()> {
        let available = self.available();
        if extra > available {
            return Err(RuntimeError::MemoryExhausted {
                requested: extra,
                available,
            });
        }
        Ok(())
    }

    /// Sets the bytes attributed to `owner`, replacing any earlier value.
    pub fn attribute(&mut self, owner: Owner, bytes: usize) {
        self.attributed.insert(owner, bytes);
        self.high_water = self.high_water.max(self.total());
    }

    pub fn release(&mut self, owner: Owner) -> usize {
        self.attributed.remove(&owner).unwrap_or(0)
    }

    pub fn report(&self) -> MemoryReport {
        let mut models = Vec::new();
        let mut sessions = Vec::new();
        for (owner, &bytes) in &self.attributed {
            match *owner {
                Owner::Model(h) => models.push((h, bytes)),
                Owner::Session(h) => sessions.push((h, bytes)),
            }
        }
        MemoryReport {
            total_bytes: self.total(),
            ceiling_bytes: self.ceiling,
            high_water_bytes: self.high_water,
            models,
            sessions,
        }
    }
}
