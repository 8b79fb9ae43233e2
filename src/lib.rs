//! Desktop-side llama.cpp inference host.
//!
//! The [`controller`] owns one long-lived worker and exposes its operations
//! as futures with per-call timeouts. [`ipc`] wraps them into error-as-value
//! handlers for a UI, [`system`] reports host memory for it, and [`logger`]
//! configures log output for the binary.

pub mod controller;
pub mod ipc;
pub mod logger;
pub mod system;

pub use controller::{Controller, ControllerError, SharedController};
pub use ipc::{IpcReply, IpcRequest, MlIpc};
pub use system::SystemInfo;
