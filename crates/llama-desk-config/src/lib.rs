//! Environment-derived configuration for the controller and worker.

pub mod settings;

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

pub use settings::{AppSettings, SettingsError, SettingsStore};

// Environment variable keys
pub const MODEL_DIR_ENV: &str = "MODEL_DIR";
pub const LLAMA_MODEL_PATH_ENV: &str = "LLAMA_MODEL_PATH";
pub const AUTO_LOAD_ENV: &str = "LLAMA_AUTO_LOAD";
pub const SWAP_POLICY_ENV: &str = "LLAMA_SWAP_POLICY";
pub const INIT_SAFETY_ENV: &str = "LLAMA_INIT_SAFETY_MS";
pub const STATUS_TIMEOUT_ENV: &str = "LLAMA_STATUS_TIMEOUT_MS";
pub const RUN_TIMEOUT_ENV: &str = "LLAMA_RUN_TIMEOUT_MS";
pub const SWITCH_TIMEOUT_ENV: &str = "LLAMA_SWITCH_TIMEOUT_MS";

/// Whether a model is loaded on startup unless overridden by `LLAMA_AUTO_LOAD`.
pub const AUTO_LOAD_MODEL: bool = false;

/// Per-operation time budgets on the controller side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// How long `initialize` waits before letting the caller continue.
    pub init_safety: Duration,
    /// Status polls degrade to a default after this.
    pub status: Duration,
    /// Generation budget.
    pub run: Duration,
    /// Model switch budget.
    pub switch_model: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            init_safety: Duration::from_millis(8_000),
            status: Duration::from_millis(2_000),
            run: Duration::from_millis(120_000),
            switch_model: Duration::from_millis(120_000),
        }
    }
}

/// How `Initialize` replaces a model that is already live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SwapPolicy {
    /// Release the old model before loading the new one. Lower peak memory,
    /// but a failed switch leaves no model loaded.
    ReleaseFirst,
    /// Load the new model next to the old one and swap on success. A failed
    /// switch keeps the old model usable.
    #[default]
    Atomic,
}

impl FromStr for SwapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "atomic" | "swap" => Ok(SwapPolicy::Atomic),
            "release-first" | "release_first" | "release" => Ok(SwapPolicy::ReleaseFirst),
            other => Err(format!("unknown swap policy: {other}")),
        }
    }
}

/// Default model locations handed to the worker when it starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvDefaults {
    /// Explicit model file (`LLAMA_MODEL_PATH`).
    pub model_path: Option<PathBuf>,
    /// Directory searched for the preferred model (`MODEL_DIR`).
    pub model_dir: Option<PathBuf>,
}

impl EnvDefaults {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            model_path: non_empty(LLAMA_MODEL_PATH_ENV).map(PathBuf::from),
            model_dir: non_empty(MODEL_DIR_ENV).map(PathBuf::from),
        }
    }
}

/// Everything the controller needs to start and drive a worker.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub defaults: EnvDefaults,
    pub auto_load_model: bool,
    pub swap_policy: SwapPolicy,
    pub timeouts: Timeouts,
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Invalid values are logged and
    /// replaced by defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Timeouts::default();
        let millis = |key: &str, fallback: Duration| match lookup(key) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) => Duration::from_millis(ms),
                Err(_) => {
                    warn!("[CONFIG] Ignoring {key}={raw:?}: not a number of milliseconds");
                    fallback
                }
            },
            None => fallback,
        };

        let auto_load_model = match lookup(AUTO_LOAD_ENV) {
            Some(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            None => AUTO_LOAD_MODEL,
        };

        let swap_policy = match lookup(SWAP_POLICY_ENV) {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("[CONFIG] {e}; using atomic swaps");
                SwapPolicy::default()
            }),
            None => SwapPolicy::default(),
        };

        Self {
            defaults: EnvDefaults::from_lookup(&lookup),
            auto_load_model,
            swap_policy,
            timeouts: Timeouts {
                init_safety: millis(INIT_SAFETY_ENV, defaults.init_safety),
                status: millis(STATUS_TIMEOUT_ENV, defaults.status),
                run: millis(RUN_TIMEOUT_ENV, defaults.run),
                switch_model: millis(SWITCH_TIMEOUT_ENV, defaults.switch_model),
            },
        }
    }
}
