//! The operation surface hosts call.
//!
//! All state lives in one [`RuntimeState`] behind a mutex, so every
//! operation runs to completion before the next starts. Generation is driven
//! by the caller one token at a time.

pub mod recovery;
pub mod registry;

pub use recovery::CleanupReport;
pub use registry::{Handle, Namespace, Registry};

use crate::core::model::ModelDescriptor;
use crate::core::pipeline::{ComputePipeline, PlaceholderPipeline};
use crate::envconfig::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::memory::{MemoryBudget, MemoryReport, Owner};
use crate::sample::Sampler;
use crate::session::{GenerationSession, SessionStats, SessionStatus};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

pub(crate) struct LoadedModel {
    pub(crate) descriptor: Arc<ModelDescriptor>,
    pub(crate) load_seq: u64,
}

pub(crate) struct RuntimeState {
    pub(crate) config: RuntimeConfig,
    pub(crate) models: Registry<LoadedModel>,
    pub(crate) sessions: Registry<GenerationSession>,
    pub(crate) budget: MemoryBudget,
    pipeline: Box<dyn ComputePipeline>,
    load_seq: u64,
    session_seq: u64,
}

pub struct Runtime {
    state: Mutex<RuntimeState>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Runtime")
            .field("models", &st.models.len())
            .field("sessions", &st.sessions.len())
            .field("memory", &st.budget.total())
            .finish()
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_pipeline(config, Box::new(PlaceholderPipeline::new()))
    }

    /// Runtime whose sessions run `pipeline` instead of the built-in one.
    pub fn with_pipeline(
        config: RuntimeConfig,
        pipeline: Box<dyn ComputePipeline>,
    ) -> Result<Self> {
        config.validate()?;
        let budget = MemoryBudget::new(config.memory_ceiling_bytes);
        Ok(Self {
            state: Mutex::new(RuntimeState {
                config,
                models: Registry::new(Namespace::Model),
                sessions: Registry::new(Namespace::Session),
                budget,
                pipeline,
                load_seq: 0,
                session_seq: 0,
            }),
        })
    }

    pub fn config(&self) -> RuntimeConfig {
        self.state.lock().config.clone()
    }

    pub fn load_model<P: AsRef<Path>>(&self, path: P) -> Result<Handle> {
        let path = path.as_ref();
        let mut st = self.state.lock();
        st.ensure_healthy(None)?;

        let descriptor = match st.load_descriptor(path) {
            Err(e) if e.is_memory_pressure() => {
                tracing::warn!(
                    "loading {} hit memory pressure, retrying after cleanup: {}",
                    path.display(),
                    e
                );
                st.forced_cleanup(None);
                st.load_descriptor(path)?
            }
            other => other?,
        };

        let bytes = descriptor.attributed_bytes();
        st.reserve(bytes)?;

        st.load_seq += 1;
        let loaded = LoadedModel {
            descriptor: Arc::new(descriptor),
            load_seq: st.load_seq,
        };
        let handle = st
            .models
            .insert(loaded)
            .ok_or(RuntimeError::AllocationFailure { bytes })?;
        st.budget.attribute(Owner::Model(handle), bytes);

        tracing::info!(
            "model {} loaded from {} ({} bytes attributed)",
            handle,
            path.display(),
            bytes
        );
        Ok(handle)
    }

    pub fn create_session(&self, model: Handle) -> Result<Handle> {
        let mut st = self.state.lock();
        if !st.models.contains(model) {
            return Err(RuntimeError::HandleNotFound(model));
        }
        st.ensure_healthy(None)?;

        let descriptor = st
            .models
            .get(model)
            .map(|m| Arc::clone(&m.descriptor))
            .ok_or(RuntimeError::HandleNotFound(model))?;

        let reserve = st.config.session_scratch_bytes;
        st.reserve(reserve)?;

        let sampler = st.next_sampler();
        let handle = st
            .sessions
            .insert(GenerationSession::new(model, descriptor, sampler))
            .ok_or(RuntimeError::AllocationFailure { bytes: reserve })?;
        st.budget.attribute(Owner::Session(handle), reserve);

        tracing::info!("session {} created on model {}", handle, model);
        Ok(handle)
    }

    /// Runs a whole generation and returns the decoded text.
    pub fn generate(&self, session: Handle, prompt: &str, max_tokens: usize) -> Result<String> {
        let mut st = self.state.lock();
        st.begin(session, prompt, max_tokens)?;

        let mut pieces = Vec::new();
        while let Some(text) = st.advance(session)? {
            if !text.is_empty() {
                pieces.push(text);
            }
        }

        let limit = st.config.max_response_chars;
        Ok(truncate_chars(pieces.join(" "), limit))
    }

    pub fn start_streaming(&self, session: Handle, prompt: &str, max_tokens: usize) -> Result<()> {
        self.state.lock().begin(session, prompt, max_tokens)
    }

    /// Next token text, or an empty string once the session is finished.
    pub fn next_token(&self, session: Handle) -> Result<String> {
        Ok(self.state.lock().advance(session)?.unwrap_or_default())
    }

    pub fn is_complete(&self, session: Handle) -> Result<bool> {
        self.with_session(session, |s| s.is_complete())
    }

    pub fn stop(&self, session: Handle) -> Result<()> {
        let mut st = self.state.lock();
        let s = st
            .sessions
            .get_mut(session)
            .ok_or(RuntimeError::HandleNotFound(session))?;
        s.stop();
        tracing::debug!("session {} stop requested, now {}", session, s.status());
        Ok(())
    }

    pub fn session_status(&self, session: Handle) -> Result<SessionStatus> {
        self.with_session(session, |s| s.status().clone())
    }

    pub fn session_stats(&self, session: Handle) -> Result<SessionStats> {
        self.with_session(session, |s| s.stats())
    }

    pub fn free_session(&self, session: Handle) -> Result<()> {
        let mut st = self.state.lock();
        let mut s = st
            .sessions
            .remove(session)
            .ok_or(RuntimeError::HandleNotFound(session))?;
        if s.status().is_active() {
            s.stop();
            tracing::debug!("session {} stopped before free", session);
        }
        st.budget.release(Owner::Session(session));
        tracing::info!("session {} freed", session);
        Ok(())
    }

    /// Refused with `ResourceInUse` while any session is built on `model`.
    pub fn free_model(&self, model: Handle) -> Result<()> {
        let mut st = self.state.lock();
        if !st.models.contains(model) {
            return Err(RuntimeError::HandleNotFound(model));
        }

        let users = st
            .sessions
            .iter()
            .filter(|(_, s)| s.model_handle() == model)
            .count();
        if users > 0 {
            tracing::warn!("model {} not freed: {} session(s) still use it", model, users);
            return Err(RuntimeError::ResourceInUse {
                handle: model,
                sessions: users,
            });
        }

        st.models.remove(model);
        st.budget.release(Owner::Model(model));
        tracing::info!("model {} freed", model);
        Ok(())
    }

    pub fn model(&self, model: Handle) -> Result<Arc<ModelDescriptor>> {
        let st = self.state.lock();
        st.models
            .get(model)
            .map(|m| Arc::clone(&m.descriptor))
            .ok_or(RuntimeError::HandleNotFound(model))
    }

    pub fn model_count(&self) -> usize {
        self.state.lock().models.len()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.state.lock().budget.total()
    }

    pub fn health_check(&self) -> bool {
        self.state.lock().is_healthy()
    }

    pub fn force_cleanup(&self) -> CleanupReport {
        self.state.lock().forced_cleanup(None)
    }

    pub fn aggressive_recovery(&self) -> CleanupReport {
        self.state.lock().aggressive_recovery()
    }

    /// Brings the runtime back under its ceiling after a failure. Forced
    /// cleanup runs first; aggressive recovery only if that is not enough.
    /// Returns whether the runtime ended up healthy.
    pub fn recover(&self) -> bool {
        self.state.lock().ensure_healthy(None).is_ok()
    }

    /// Adjusts the ceiling, e.g. on an OS memory-pressure signal. Existing
    /// attributions are kept; the next health check reflects the change.
    pub fn set_memory_ceiling(&self, bytes: usize) {
        let mut st = self.state.lock();
        tracing::info!("memory ceiling {} -> {} bytes", st.budget.ceiling(), bytes);
        st.budget.set_ceiling(bytes);
        st.config.memory_ceiling_bytes = bytes;
    }

    pub fn memory_report(&self) -> MemoryReport {
        self.state.lock().budget.report()
    }

    pub fn log_memory_stats(&self) {
        let st = self.state.lock();
        let report = st.budget.report();
        tracing::info!(
            "memory: {} / {} bytes (high water {}), {} models, {} sessions",
            report.total_bytes,
            report.ceiling_bytes,
            report.high_water_bytes,
            report.models.len(),
            report.sessions.len()
        );
        for (h, bytes) in &report.models {
            let name = st
                .models
                .get(*h)
                .map(|m| m.descriptor.path.display().to_string())
                .unwrap_or_default();
            tracing::info!("  model {} {}: {} bytes", h, name, bytes);
        }
        for (h, bytes) in &report.sessions {
            let status = st.sessions.get(*h).map(|s| s.status().to_string()).unwrap_or_default();
            tracing::info!("  session {} [{}]: {} bytes", h, status, bytes);
        }
    }

    fn with_session<T>(
        &self,
        session: Handle,
        f: impl FnOnce(&GenerationSession) -> T,
    ) -> Result<T> {
        let st = self.state.lock();
        st.sessions
            .get(session)
            .map(f)
            .ok_or(RuntimeError::HandleNotFound(session))
    }
}

impl RuntimeState {
    fn load_descriptor(&self, path: &Path) -> Result<ModelDescriptor> {
        let budget = self.budget.available().min(self.config.model_tensor_budget_bytes);
        ModelDescriptor::load(path, &self.config, budget)
    }

    fn next_sampler(&mut self) -> Sampler {
        let mut sampling = self.config.sampling.clone();
        sampling.seed = sampling.seed.map(|s| s.wrapping_add(self.session_seq));
        self.session_seq += 1;
        Sampler::new(&sampling)
    }

    fn check_request(&self, prompt: &str, max_tokens: usize) -> Result<()> {
        if prompt.trim().is_empty() {
            return Err(RuntimeError::InvalidInput("prompt is empty".to_string()));
        }
        if prompt.len() > self.config.max_input_bytes {
            return Err(RuntimeError::LimitExceeded {
                what: "prompt length",
                limit: self.config.max_input_bytes,
                actual: prompt.len(),
            });
        }
        if max_tokens == 0 {
            return Err(RuntimeError::InvalidInput("max_tokens must be at least 1".to_string()));
        }
        if max_tokens > self.config.max_tokens_per_generation {
            return Err(RuntimeError::LimitExceeded {
                what: "requested tokens",
                limit: self.config.max_tokens_per_generation,
                actual: max_tokens,
            });
        }
        Ok(())
    }

    fn begin(&mut self, session: Handle, prompt: &str, max_tokens: usize) -> Result<()> {
        if !self.sessions.contains(session) {
            return Err(RuntimeError::HandleNotFound(session));
        }
        self.check_request(prompt, max_tokens)?;
        self.ensure_healthy(Some(session))?;

        self.sessions
            .get_mut(session)
            .ok_or(RuntimeError::HandleNotFound(session))?
            .prefill(prompt, max_tokens)
    }

    /// One generation step. `None` once the session has nothing more to
    /// give; memory shortfalls end the session in `Errored`.
    fn advance(&mut self, session: Handle) -> Result<Option<String>> {
        let s = self
            .sessions
            .get(session)
            .ok_or(RuntimeError::HandleNotFound(session))?;
        if !s.status().is_active() {
            return Ok(None);
        }

        let needed = self
            .pipeline
            .estimate_bytes(s.sequence().len() + 1, &s.model().hparams)
            .max(self.config.session_scratch_bytes);
        if let Err(e) = self.make_room(Owner::Session(session), needed, Some(session)) {
            if let Some(s) = self.sessions.get_mut(session) {
                s.fail(e);
            }
            return Ok(None);
        }

        let RuntimeState { sessions, pipeline, .. } = self;
        let s = sessions
            .get_mut(session)
            .ok_or(RuntimeError::HandleNotFound(session))?;
        Ok(s.step(&**pipeline).map(|id| s.token_text(id)))
    }
}

fn truncate_chars(text: String, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello".to_string(), 10), "hello");
        assert_eq!(truncate_chars("hello".to_string(), 5), "hello");
        assert_eq!(truncate_chars("hello world".to_string(), 5), "hello...");
        assert_eq!(truncate_chars("héllo".to_string(), 2), "hé...");
    }

    #[test]
    fn test_request_limits() {
        let rt = Runtime::new(RuntimeConfig {
            max_input_bytes: 8,
            max_tokens_per_generation: 4,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let st = rt.state.lock();

        assert!(st.check_request("hi", 4).is_ok());
        assert!(matches!(st.check_request("   ", 1), Err(RuntimeError::InvalidInput(_))));
        assert!(matches!(
            st.check_request("too long text", 1),
            Err(RuntimeError::LimitExceeded { .. })
        ));
        assert!(matches!(st.check_request("hi", 0), Err(RuntimeError::InvalidInput(_))));
        assert!(matches!(st.check_request("hi", 5), Err(RuntimeError::LimitExceeded { .. })));
    }

    #[test]
    fn test_unknown_handles() {
        let rt = Runtime::new(RuntimeConfig::default()).unwrap();
        let bogus = Handle::from_raw(77).unwrap();
        assert!(matches!(rt.create_session(bogus), Err(RuntimeError::HandleNotFound(_))));
        assert!(matches!(rt.next_token(bogus), Err(RuntimeError::HandleNotFound(_))));
        assert!(matches!(rt.free_model(bogus), Err(RuntimeError::HandleNotFound(_))));
        assert!(matches!(rt.free_session(bogus), Err(RuntimeError::HandleNotFound(_))));
        assert!(rt.is_complete(bogus).is_err());
    }

    #[test]
    fn test_cleanup_on_empty_runtime() {
        let rt = Runtime::new(RuntimeConfig::default()).unwrap();
        assert_eq!(rt.force_cleanup(), CleanupReport::default());
        assert_eq!(rt.aggressive_recovery(), CleanupReport::default());
        assert!(rt.health_check());
        assert_eq!(rt.memory_usage(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = RuntimeConfig {
            memory_ceiling_bytes: 0,
            ..RuntimeConfig::default()
        };
        assert!(Runtime::new(cfg).is_err());
    }
}
