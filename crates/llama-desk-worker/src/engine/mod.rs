//! Inference engine abstraction.
//!
//! The worker owns three nested resources: a model, a context created from
//! the model, and a generation session created from the context. Each layer
//! is released explicitly, innermost first. Handles are not `Send`; they are
//! created and dropped on the executor thread only.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use llama_desk_types::GenerationParams;

#[cfg(feature = "llama")]
mod llama;
#[cfg(any(test, feature = "mock"))]
mod mock;

#[cfg(feature = "llama")]
pub use llama::LlamaEngine;
#[cfg(any(test, feature = "mock"))]
pub use mock::{EngineEvent, MockEngine};

/// Shared cancellation flag, checked by the engine between tokens.
pub type CancelFlag = Arc<AtomicBool>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Context creation failed: {0}")]
    Context(String),
    #[error("Session creation failed: {0}")]
    Session(String),
    #[error("{0}")]
    Generation(String),
    /// The bindings released a resource behind our back.
    #[error("Object is disposed")]
    Disposed,
    #[error("Generation cancelled")]
    Cancelled,
    #[error("Dispose failed: {0}")]
    Dispose(String),
}

/// Context creation parameters. `None` keeps the engine default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextParams {
    pub context_size: Option<u32>,
    pub threads: Option<u32>,
}

pub trait InferenceEngine: Send + 'static {
    /// Load a model file. `gpu_layers` of `None` lets the engine decide.
    fn load_model(
        &self,
        path: &Path,
        gpu_layers: Option<u32>,
    ) -> Result<Box<dyn ModelHandle>, EngineError>;
}

pub trait ModelHandle {
    /// Number of layers actually offloaded to a GPU.
    fn gpu_layers(&self) -> u32;
    fn create_context(&self, params: &ContextParams)
        -> Result<Box<dyn ContextHandle>, EngineError>;
    /// Idempotent.
    fn dispose(&mut self) -> Result<(), EngineError>;
}

pub trait ContextHandle {
    fn create_session(&self) -> Result<Box<dyn SessionHandle>, EngineError>;
    /// Idempotent.
    fn dispose(&mut self) -> Result<(), EngineError>;
}

pub trait SessionHandle {
    /// Generate a completion for `prompt`. Checks `cancel` between tokens.
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> Result<String, EngineError>;
    /// Whether the underlying resources were released.
    fn is_disposed(&self) -> bool;
    /// Idempotent.
    fn dispose(&mut self) -> Result<(), EngineError>;
}

/// Engine used when no inference backend is compiled in. Every load fails,
/// so the worker still answers `Status` and reports load failures cleanly.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableEngine;

impl InferenceEngine for UnavailableEngine {
    fn load_model(
        &self,
        _path: &Path,
        _gpu_layers: Option<u32>,
    ) -> Result<Box<dyn ModelHandle>, EngineError> {
        Err(EngineError::Load(
            "no inference backend compiled in; rebuild with `--features llama`".to_string(),
        ))
    }
}

/// Cut `text` at the earliest stop sequence. Returns whether a stop matched.
pub fn truncate_at_stop(text: &mut String, stop: &[String]) -> bool {
    let earliest = stop
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min();
    match earliest {
        Some(pos) => {
            text.truncate(pos);
            true
        }
        None => false,
    }
}
