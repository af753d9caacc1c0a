//! Health checks and the two cleanup tiers.

use super::{Handle, RuntimeState};
use crate::error::{Result, RuntimeError};
use crate::memory::Owner;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sessions_freed: usize,
    pub models_freed: usize,
    pub tokens_trimmed: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

impl RuntimeState {
    pub(crate) fn is_healthy(&self) -> bool {
        if !self.budget.is_within_ceiling() {
            tracing::warn!(
                "memory usage {} exceeds ceiling {}",
                self.budget.total(),
                self.budget.ceiling()
            );
            return false;
        }

        for (handle, model) in self.models.iter() {
            let expected = model.descriptor.attributed_bytes();
            let attributed = self.budget.attributed(Owner::Model(handle));
            if !model.descriptor.is_consistent() || attributed != Some(expected) {
                tracing::warn!("model {} buffers are inconsistent", handle);
                return false;
            }
        }

        for (handle, _) in self.sessions.iter() {
            if self.budget.attributed(Owner::Session(handle)).is_none() {
                tracing::warn!("session {} has no memory attribution", handle);
                return false;
            }
        }
        true
    }

    /// Frees every session that is not generating, except `spare`, then
    /// trims history and scratch of the rest.
    pub(crate) fn forced_cleanup(&mut self, spare: Option<Handle>) -> CleanupReport {
        let bytes_before = self.budget.total();

        let idle: Vec<Handle> = self
            .sessions
            .iter()
            .filter(|(h, s)| !s.status().is_active() && Some(*h) != spare)
            .map(|(h, _)| h)
            .collect();
        for &h in &idle {
            self.sessions.remove(h);
            self.budget.release(Owner::Session(h));
        }

        let threshold = self.config.history_trim_threshold;
        let retain = self.config.history_retain;
        let reserve = self.config.session_scratch_bytes;
        let mut tokens_trimmed = 0;
        for (h, session) in self.sessions.iter_mut() {
            tokens_trimmed += session.trim_history(threshold, retain);
            session.release_scratch();
            self.budget.attribute(Owner::Session(h), reserve);
        }

        let report = CleanupReport {
            sessions_freed: idle.len(),
            models_freed: 0,
            tokens_trimmed,
            bytes_before,
            bytes_after: self.budget.total(),
        };
        tracing::info!(
            "forced cleanup: freed {} sessions, trimmed {} tokens, {} -> {} bytes",
            report.sessions_freed,
            report.tokens_trimmed,
            report.bytes_before,
            report.bytes_after
        );
        report
    }

    /// Frees all sessions and every model but the most recently loaded one.
    pub(crate) fn aggressive_recovery(&mut self) -> CleanupReport {
        let bytes_before = self.budget.total();

        let sessions = self.sessions.handles();
        for &h in &sessions {
            self.sessions.remove(h);
            self.budget.release(Owner::Session(h));
        }

        let newest = self
            .models
            .iter()
            .max_by_key(|(_, m)| m.load_seq)
            .map(|(h, _)| h);
        let stale: Vec<Handle> = self
            .models
            .handles()
            .into_iter()
            .filter(|h| Some(*h) != newest)
            .collect();
        for &h in &stale {
            self.models.remove(h);
            self.budget.release(Owner::Model(h));
        }

        let report = CleanupReport {
            sessions_freed: sessions.len(),
            models_freed: stale.len(),
            tokens_trimmed: 0,
            bytes_before,
            bytes_after: self.budget.total(),
        };
        tracing::warn!(
            "aggressive recovery: freed {} sessions and {} models, {} -> {} bytes",
            report.sessions_freed,
            report.models_freed,
            report.bytes_before,
            report.bytes_after
        );
        report
    }

    /// Restores health with forced cleanup, then aggressive recovery.
    pub(crate) fn ensure_healthy(&mut self, spare: Option<Handle>) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        self.forced_cleanup(spare);
        if self.is_healthy() {
            return Ok(());
        }
        self.aggressive_recovery();
        if self.is_healthy() {
            return Ok(());
        }
        tracing::error!("runtime still unhealthy after recovery");
        Err(RuntimeError::MemoryExhausted {
            requested: self.budget.total(),
            available: self.budget.ceiling(),
        })
    }

    /// Checks that a new allocation of `bytes` fits, running one forced
    /// cleanup if it does not.
    pub(crate) fn reserve(&mut self, bytes: usize) -> Result<()> {
        if self.budget.check(bytes).is_err() {
            self.forced_cleanup(None);
        }
        self.budget.check(bytes)
    }

    /// Grows `owner`'s attribution to `needed` bytes, running one forced
    /// cleanup if it does not fit.
    pub(crate) fn make_room(
        &mut self,
        owner: Owner,
        needed: usize,
        spare: Option<Handle>,
    ) -> Result<()> {
        let current = self.budget.attributed(owner).unwrap_or(0);
        if needed <= current {
            return Ok(());
        }
        if self.budget.check(needed - current).is_err() {
            self.forced_cleanup(spare);
        }

        let current = self.budget.attributed(owner).unwrap_or(0);
        if needed > current {
            self.budget.check(needed - current)?;
            self.budget.attribute(owner, needed);
        }
        Ok(())
    }
}
