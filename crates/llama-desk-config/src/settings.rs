//! Persisted user settings (JSON file).
//!
//! Loading never fails: a missing or unreadable file yields the defaults, and
//! fields absent from the file are filled from the defaults. Updates merge one
//! level deep per top-level section before the whole document is rewritten.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use llama_desk_types::{GenerationOptions, ModelTuning};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid settings document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("settings patch must be a JSON object")]
    PatchNotObject,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub repeat_penalty_window: u32,
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            repeat_penalty_window: 64,
            stop_sequences: vec![
                "\n\n".to_string(),
                "Human:".to_string(),
                "Assistant:".to_string(),
            ],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PerformanceSettings {
    pub context_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub batch_size: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub low_vram: bool,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            context_size: 2048,
            threads: 4,
            gpu_layers: 0,
            batch_size: 512,
            use_mmap: true,
            use_mlock: false,
            low_vram: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
    Auto,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct UiSettings {
    pub theme: Theme,
    pub language: String,
    pub font_size: u32,
    pub auto_save: bool,
    pub auto_save_interval: u32,
    pub show_line_numbers: bool,
    pub word_wrap: bool,
    pub minimap: bool,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            theme: Theme::Dark,
            language: "en".to_string(),
            font_size: 14,
            auto_save: true,
            auto_save_interval: 30,
            show_line_numbers: true,
            word_wrap: true,
            minimap: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    /// One of `debug`, `info`, `warn`, `error`.
    pub level: String,
    pub max_log_entries: u32,
    pub enable_file_logging: bool,
    pub log_to_console: bool,
    pub log_performance: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            max_log_entries: 1000,
            enable_file_logging: true,
            log_to_console: true,
            log_performance: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AppBehaviorSettings {
    pub auto_start: bool,
    pub minimize_to_tray: bool,
    pub check_updates: bool,
    pub telemetry: bool,
    pub crash_reporting: bool,
}

impl Default for AppBehaviorSettings {
    fn default() -> Self {
        Self {
            auto_start: false,
            minimize_to_tray: true,
            check_updates: true,
            telemetry: false,
            crash_reporting: true,
        }
    }
}

/// The whole settings document.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    pub generation: GenerationSettings,
    pub performance: PerformanceSettings,
    pub ui: UiSettings,
    pub logging: LoggingSettings,
    pub app: AppBehaviorSettings,
}

impl AppSettings {
    /// Generation defaults in the form the controller accepts.
    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            max_tokens: Some(self.generation.max_tokens),
            temperature: Some(self.generation.temperature),
            top_p: Some(self.generation.top_p),
            stop: Some(self.generation.stop_sequences.clone()),
        }
    }

    /// Load-time tuning in the form the controller accepts.
    pub fn model_tuning(&self) -> ModelTuning {
        ModelTuning {
            context_size: Some(self.performance.context_size),
            gpu_layers: Some(self.performance.gpu_layers),
            threads: Some(self.performance.threads),
        }
    }
}

/// File-backed settings store.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/llama-desk/settings.json`, falling back to the working
    /// directory when the platform has no config dir.
    pub fn default_location() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llama-desk")
            .join("settings.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings; defaults when the file is missing or unreadable.
    pub fn get(&self) -> AppSettings {
        match self.read_value() {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("[SETTINGS] Invalid settings in {}: {e}", self.path.display());
                    AppSettings::default()
                }
            },
            Ok(None) => AppSettings::default(),
            Err(e) => {
                warn!("[SETTINGS] {e}");
                AppSettings::default()
            }
        }
    }

    /// Merge `patch` into the current settings and persist the result.
    ///
    /// Top-level sections that are objects in both documents are merged key by
    /// key; everything else in the patch replaces the current value. A `null`
    /// clears an optional field.
    pub fn set(&self, patch: Value) -> Result<AppSettings, SettingsError> {
        if !patch.is_object() {
            return Err(SettingsError::PatchNotObject);
        }
        let mut current = serde_json::to_value(self.get())?;
        merge_sections(&mut current, patch);
        let next: AppSettings = serde_json::from_value(current)?;
        self.write(&next)?;
        Ok(next)
    }

    /// Store the preferred model directory and file. `None` clears a value.
    pub fn set_model_prefs(
        &self,
        model_dir: Option<PathBuf>,
        model_path: Option<PathBuf>,
    ) -> Result<AppSettings, SettingsError> {
        self.set(serde_json::json!({
            "model_dir": model_dir,
            "model_path": model_path,
        }))
    }

    /// Overwrite the file with the defaults.
    pub fn reset(&self) -> Result<AppSettings, SettingsError> {
        let defaults = AppSettings::default();
        self.write(&defaults)?;
        info!("[SETTINGS] Reset to defaults: {}", self.path.display());
        Ok(defaults)
    }

    /// Write the current settings to `dest`.
    pub fn export(&self, dest: &Path) -> Result<(), SettingsError> {
        write_json(dest, &self.get())
    }

    /// Replace the settings with the document at `src`, filling gaps from the
    /// defaults, and persist it.
    pub fn import(&self, src: &Path) -> Result<AppSettings, SettingsError> {
        let raw = fs::read_to_string(src).map_err(|source| SettingsError::Io {
            path: src.to_path_buf(),
            source,
        })?;
        let imported: AppSettings = serde_json::from_str(&raw)?;
        self.write(&imported)?;
        info!("[SETTINGS] Imported settings from {}", src.display());
        Ok(imported)
    }

    fn read_value(&self) -> Result<Option<Value>, SettingsError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let value: Value = serde_json::from_str(&raw)?;
        Ok(value.is_object().then_some(value))
    }

    fn write(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        write_json(&self.path, settings)
    }
}

fn write_json(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json).map_err(io_err)
}

/// One-level-deep merge of `patch` into `target`.
fn merge_sections(target: &mut Value, patch: Value) {
    let (Some(target), Value::Object(patch)) = (target.as_object_mut(), patch) else {
        return;
    };
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(section)), Value::Object(update)) => {
                for (field, field_value) in update {
                    section.insert(field, field_value);
                }
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}
