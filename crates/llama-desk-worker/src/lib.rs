//! Inference worker: model discovery, the model lifecycle, and the threads
//! that serve controller requests.

pub mod engine;
pub mod locator;
pub mod runtime;
pub mod worker;

pub use engine::{CancelFlag, EngineError, InferenceEngine, UnavailableEngine};
#[cfg(feature = "llama")]
pub use engine::LlamaEngine;
#[cfg(any(test, feature = "mock"))]
pub use engine::{EngineEvent, MockEngine};
pub use locator::{find_preferred_model, list_models};
pub use runtime::WorkerRuntime;
pub use worker::{spawn, WorkerChannels, WorkerHandle};
