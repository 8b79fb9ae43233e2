//! Shared types for the controller ↔ worker protocol.

pub mod error;
pub mod options;
pub mod protocol;

pub use error::{FailureKind, WorkerFailure};
pub use options::{
    GenerationOptions, GenerationParams, ModelEntry, ModelTuning, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE, DEFAULT_TOP_P,
};
pub use protocol::{
    Backend, CommandKind, InitReport, WorkerCommand, WorkerRequest, WorkerResponse, WorkerResult,
    WorkerStatus,
};
