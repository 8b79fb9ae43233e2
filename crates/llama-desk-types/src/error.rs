use serde::{Deserialize, Serialize};

/// Category of a failure reported by the worker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No model path could be resolved, or the resolved file does not exist.
    NotFound,
    /// The engine rejected the model, context or session creation.
    LoadFailure,
    /// `Run` arrived while no generation session was live.
    NotInitialized,
    /// The engine failed while generating.
    Inference,
    /// The request was abandoned through a `Cancel` command.
    Cancelled,
    /// A handler panicked inside the worker.
    Internal,
}

/// Failure payload carried inside a worker result.
#[derive(thiserror::Error, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl WorkerFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn load(message: impl Into<String>) -> Self {
        Self::new(FailureKind::LoadFailure, message)
    }

    pub fn not_initialized() -> Self {
        Self::new(
            FailureKind::NotInitialized,
            "Model/session is not initialized",
        )
    }

    pub fn inference(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Inference, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "Generation cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}
