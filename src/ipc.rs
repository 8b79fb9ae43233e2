//! Request handlers a UI binds to.
//!
//! Handlers never fail: every error becomes an `{ "error": message }` value.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use llama_desk_config::{AppSettings, SettingsStore};
use llama_desk_types::{GenerationOptions, ModelEntry, ModelTuning, WorkerStatus};

use crate::controller::SharedController;
use crate::system::{self, SystemInfo};

/// A handler result: the value itself, or an error object.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum IpcReply<T> {
    Value(T),
    Error { error: String },
}

impl<T> IpcReply<T> {
    fn from_result<E: Display>(channel: &str, result: Result<T, E>) -> Self {
        match result {
            Ok(value) => IpcReply::Value(value),
            Err(e) => {
                let error = e.to_string();
                error!("[IPC] {channel} error: {error}");
                IpcReply::Error { error }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, IpcReply::Error { .. })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub ok: bool,
}

/// Model file size in whole megabytes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSize {
    pub size: u64,
}

/// A request as it arrives over a text channel, e.g.
/// `{"channel": "ml:run", "prompt": "hi", "options": {"max_tokens": 32}}`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "channel")]
pub enum IpcRequest {
    #[serde(rename = "ml:status")]
    MlStatus,
    #[serde(rename = "ml:listModels")]
    MlListModels {
        #[serde(default)]
        root_dir: Option<PathBuf>,
    },
    #[serde(rename = "ml:run")]
    MlRun {
        prompt: String,
        #[serde(default)]
        options: Option<GenerationOptions>,
    },
    #[serde(rename = "ml:setModel")]
    MlSetModel {
        model_path: PathBuf,
        #[serde(default)]
        options: Option<ModelTuning>,
    },
    #[serde(rename = "settings:get")]
    SettingsGet,
    #[serde(rename = "settings:setModelPrefs")]
    SettingsSetModelPrefs {
        #[serde(default)]
        model_dir: Option<PathBuf>,
        #[serde(default)]
        model_path: Option<PathBuf>,
    },
    #[serde(rename = "system:info")]
    SystemInfo,
    #[serde(rename = "system:getModelSize")]
    SystemModelSize { model_path: PathBuf },
}

pub struct MlIpc {
    controller: SharedController,
    settings: SettingsStore,
}

impl MlIpc {
    pub fn new(controller: SharedController, settings: SettingsStore) -> Self {
        Self {
            controller,
            settings,
        }
    }

    pub async fn ml_status(&self) -> IpcReply<WorkerStatus> {
        info!("[IPC] ml:status");
        IpcReply::Value(self.controller.status().await)
    }

    pub fn ml_list_models(&self, root_dir: Option<&Path>) -> IpcReply<Vec<ModelEntry>> {
        info!("[IPC] ml:listModels root_dir={root_dir:?}");
        IpcReply::Value(self.controller.list_models(root_dir))
    }

    pub async fn ml_run(
        &self,
        prompt: &str,
        options: Option<GenerationOptions>,
    ) -> IpcReply<String> {
        info!(
            "[IPC] ml:run prompt_len={} opts={options:?}",
            prompt.len()
        );
        let result = self
            .controller
            .run(prompt, options.unwrap_or_default())
            .await;
        if let Ok(text) = &result {
            info!("[IPC] ml:run ok out_len={}", text.len());
        }
        IpcReply::from_result("ml:run", result)
    }

    pub async fn ml_set_model(
        &self,
        model_path: &Path,
        tuning: Option<ModelTuning>,
    ) -> IpcReply<Ack> {
        info!(
            "[IPC] ml:setModel {} opts={tuning:?}",
            model_path.display()
        );
        let result = self
            .controller
            .switch_model(model_path, tuning.unwrap_or_default())
            .await
            .map(|_| Ack { ok: true });
        IpcReply::from_result("ml:setModel", result)
    }

    pub fn settings_get(&self) -> IpcReply<AppSettings> {
        info!("[IPC] settings:get");
        IpcReply::Value(self.settings.get())
    }

    pub fn settings_set_model_prefs(
        &self,
        model_dir: Option<PathBuf>,
        model_path: Option<PathBuf>,
    ) -> IpcReply<AppSettings> {
        info!("[IPC] settings:setModelPrefs dir={model_dir:?} path={model_path:?}");
        IpcReply::from_result(
            "settings:setModelPrefs",
            self.settings.set_model_prefs(model_dir, model_path),
        )
    }

    pub fn system_info(&self) -> IpcReply<SystemInfo> {
        info!("[IPC] system:info");
        let result = system::collect();
        if let Ok(info) = &result {
            info!(
                "[IPC] system:info memory={}MB/{}MB rss={}MB",
                info.memory_usage.used, info.memory_usage.total, info.process_memory.rss
            );
        }
        IpcReply::from_result("system:info", result)
    }

    pub fn system_model_size(&self, model_path: &Path) -> IpcReply<ModelSize> {
        info!("[IPC] system:getModelSize {}", model_path.display());
        let result = match fs::metadata(model_path) {
            Ok(meta) if meta.is_file() => Ok(ModelSize {
                size: system::bytes_to_mb(meta.len()),
            }),
            _ => Err("Model file not found"),
        };
        IpcReply::from_result("system:getModelSize", result)
    }

    /// Route a decoded request to its handler.
    pub async fn handle(&self, request: IpcRequest) -> Value {
        match request {
            IpcRequest::MlStatus => to_json(self.ml_status().await),
            IpcRequest::MlListModels { root_dir } => {
                to_json(self.ml_list_models(root_dir.as_deref()))
            }
            IpcRequest::MlRun { prompt, options } => to_json(self.ml_run(&prompt, options).await),
            IpcRequest::MlSetModel {
                model_path,
                options,
            } => to_json(self.ml_set_model(&model_path, options).await),
            IpcRequest::SettingsGet => to_json(self.settings_get()),
            IpcRequest::SettingsSetModelPrefs {
                model_dir,
                model_path,
            } => to_json(self.settings_set_model_prefs(model_dir, model_path)),
            IpcRequest::SystemInfo => to_json(self.system_info()),
            IpcRequest::SystemModelSize { model_path } => {
                to_json(self.system_model_size(&model_path))
            }
        }
    }

    /// Decode one JSON line and handle it. Malformed input yields an error value.
    pub async fn handle_line(&self, line: &str) -> Value {
        match serde_json::from_str::<IpcRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                error!("[IPC] Failed to parse request: {e}");
                json!({ "error": format!("Invalid request: {e}") })
            }
        }
    }
}

fn to_json<T: Serialize>(reply: IpcReply<T>) -> Value {
    serde_json::to_value(&reply).unwrap_or_else(|e| json!({ "error": e.to_string() }))
}
