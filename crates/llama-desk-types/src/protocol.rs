//! Protocol types for controller ↔ worker communication.
//!
//! Every request carries a monotonic ID that the worker echoes back, so a
//! reply is matched to its request even when several calls of the same kind
//! are in flight. The result variant always mirrors the command variant.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::WorkerFailure;
use crate::options::{GenerationOptions, ModelTuning};

/// Request sent from the controller to the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    /// Monotonic request ID for correlating responses. 0 = fire-and-forget.
    pub id: u64,
    pub command: WorkerCommand,
}

/// Commands the controller can send to the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Load (or replace) the model. `None` lets the worker resolve a default.
    Initialize {
        #[serde(default)]
        model_path: Option<PathBuf>,
        #[serde(default)]
        tuning: ModelTuning,
    },
    /// Report the current backend and model state.
    Status,
    /// Generate a completion with the live session.
    Run {
        prompt: String,
        #[serde(default)]
        options: GenerationOptions,
    },
    /// Abandon the request with ID `target` if it is queued or running.
    Cancel { target: u64 },
    /// Release every resource and stop the worker.
    Shutdown,
}

/// Tag of a command or result, used for logging and reply validation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Initialize,
    Status,
    Run,
    Cancel,
    Shutdown,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Initialize => "initialize",
            CommandKind::Status => "status",
            CommandKind::Run => "run",
            CommandKind::Cancel => "cancel",
            CommandKind::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

impl WorkerCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            WorkerCommand::Initialize { .. } => CommandKind::Initialize,
            WorkerCommand::Status => CommandKind::Status,
            WorkerCommand::Run { .. } => CommandKind::Run,
            WorkerCommand::Cancel { .. } => CommandKind::Cancel,
            WorkerCommand::Shutdown => CommandKind::Shutdown,
        }
    }
}

/// Where the active model executes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Cpu,
    Gpu,
}

impl Backend {
    /// Any GPU-resident layer makes the model a GPU model.
    pub fn from_gpu_layers(gpu_layers: u32) -> Self {
        if gpu_layers > 0 {
            Backend::Gpu
        } else {
            Backend::Cpu
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => f.write_str("cpu"),
            Backend::Gpu => f.write_str("gpu"),
        }
    }
}

/// Snapshot of the worker state. The default is what callers see when the
/// worker cannot be reached.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub backend: Backend,
    pub model_loaded: bool,
    pub model_path: Option<PathBuf>,
}

/// Outcome of a successful `Initialize`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub backend: Backend,
    pub model_loaded: bool,
    pub model_path: PathBuf,
}

/// Result payloads from the worker, one variant per command.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "result", rename_all = "snake_case")]
pub enum WorkerResult {
    Initialize(Result<InitReport, WorkerFailure>),
    Status(WorkerStatus),
    Run(Result<String, WorkerFailure>),
    /// Acknowledges `Shutdown`.
    ShuttingDown,
}

impl WorkerResult {
    pub fn kind(&self) -> CommandKind {
        match self {
            WorkerResult::Initialize(_) => CommandKind::Initialize,
            WorkerResult::Status(_) => CommandKind::Status,
            WorkerResult::Run(_) => CommandKind::Run,
            WorkerResult::ShuttingDown => CommandKind::Shutdown,
        }
    }

    /// Whether the result reports a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            WorkerResult::Initialize(Err(_)) | WorkerResult::Run(Err(_))
        )
    }
}

/// Response sent from the worker to the controller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    /// Matches the request ID.
    pub id: u64,
    pub result: WorkerResult,
}

impl WorkerResponse {
    pub fn new(id: u64, result: WorkerResult) -> Self {
        Self { id, result }
    }
}
