//! Model lifecycle owned by the executor thread.
//!
//! The runtime holds at most one loaded model together with its context and
//! session. Every failure is reported as a [`WorkerFailure`]; nothing here
//! panics on engine errors.

use std::mem;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{info, warn};

use llama_desk_config::{EnvDefaults, SwapPolicy};
use llama_desk_types::{
    Backend, GenerationOptions, InitReport, ModelTuning, WorkerFailure, WorkerStatus,
};

use crate::engine::{
    CancelFlag, ContextHandle, ContextParams, EngineError, InferenceEngine, ModelHandle,
    SessionHandle,
};
use crate::locator;

/// Message for a model whose resources were released during setup.
pub const DISPOSED_EARLY_MESSAGE: &str = "Model initialization failed because the inference bindings disposed resources early. This often indicates the model is too large for the available memory. Try a smaller quantized .gguf file.";

const NO_MODEL_MESSAGE: &str =
    "Model not found. Provide a model path, set LLAMA_MODEL_PATH, or put a .gguf file under MODEL_DIR";

/// A model with its context and session. Released innermost first on drop.
struct LoadedModel {
    backend: Backend,
    path: PathBuf,
    session: Box<dyn SessionHandle>,
    context: Box<dyn ContextHandle>,
    model: Box<dyn ModelHandle>,
}

fn log_dispose(what: &str, path: &Path, result: Result<(), EngineError>) {
    if let Err(e) = result {
        warn!("[WORKER] Failed to dispose {what} for {}: {e}", path.display());
    }
}

impl Drop for LoadedModel {
    fn drop(&mut self) {
        info!("[WORKER] Releasing model {}", self.path.display());
        log_dispose("session", &self.path, self.session.dispose());
        log_dispose("context", &self.path, self.context.dispose());
        log_dispose("model", &self.path, self.model.dispose());
    }
}

enum ModelState {
    Uninitialized,
    Ready(LoadedModel),
}

/// Engine errors phrased for the caller. Early disposal gets the
/// memory-pressure explanation.
fn describe_engine_error(error: &EngineError) -> String {
    match error {
        EngineError::Disposed => DISPOSED_EARLY_MESSAGE.to_string(),
        other => other.to_string(),
    }
}

pub struct WorkerRuntime {
    engine: Box<dyn InferenceEngine>,
    defaults: EnvDefaults,
    swap_policy: SwapPolicy,
    state: ModelState,
}

impl WorkerRuntime {
    pub fn new(
        engine: Box<dyn InferenceEngine>,
        defaults: EnvDefaults,
        swap_policy: SwapPolicy,
    ) -> Self {
        Self {
            engine,
            defaults,
            swap_policy,
            state: ModelState::Uninitialized,
        }
    }

    /// Explicit path, then `LLAMA_MODEL_PATH`, then the best file under `MODEL_DIR`.
    fn resolve_model_path(&self, explicit: Option<PathBuf>) -> Result<PathBuf, WorkerFailure> {
        let path = explicit
            .or_else(|| self.defaults.model_path.clone())
            .or_else(|| {
                self.defaults
                    .model_dir
                    .as_deref()
                    .and_then(locator::find_preferred_model)
            })
            .ok_or_else(|| WorkerFailure::not_found(NO_MODEL_MESSAGE))?;

        if !path.is_file() {
            return Err(WorkerFailure::not_found(format!(
                "Model file not found: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Load model, context and session, releasing whatever was created if a
    /// later step fails.
    fn acquire(&self, path: &Path, tuning: &ModelTuning) -> Result<LoadedModel, EngineError> {
        let mut model = self.engine.load_model(path, tuning.gpu_layers)?;

        let params = ContextParams {
            context_size: tuning.context_size,
            threads: tuning.threads,
        };
        let mut context = match model.create_context(&params) {
            Ok(context) => context,
            Err(e) => {
                log_dispose("model", path, model.dispose());
                return Err(e);
            }
        };

        let session = match context.create_session() {
            Ok(session) => session,
            Err(e) => {
                log_dispose("context", path, context.dispose());
                log_dispose("model", path, model.dispose());
                return Err(e);
            }
        };

        Ok(LoadedModel {
            backend: Backend::from_gpu_layers(model.gpu_layers()),
            path: path.to_path_buf(),
            session,
            context,
            model,
        })
    }

    fn release(&mut self) {
        // Dropping the previous state runs the ordered release.
        drop(mem::replace(&mut self.state, ModelState::Uninitialized));
    }

    /// Load a model, replacing any live one according to the swap policy.
    pub fn initialize(
        &mut self,
        model_path: Option<PathBuf>,
        tuning: &ModelTuning,
    ) -> Result<InitReport, WorkerFailure> {
        let started = Instant::now();
        let path = self.resolve_model_path(model_path)?;
        info!("[WORKER] Initializing model {}", path.display());

        if self.swap_policy == SwapPolicy::ReleaseFirst {
            self.release();
        }

        let loaded = self.acquire(&path, tuning).map_err(|e| {
            warn!("[WORKER] Init failed for {}: {e}", path.display());
            WorkerFailure::load(describe_engine_error(&e))
        })?;

        let report = InitReport {
            backend: loaded.backend,
            model_loaded: true,
            model_path: loaded.path.clone(),
        };
        let previous = mem::replace(&mut self.state, ModelState::Ready(loaded));
        drop(previous);

        info!(
            "[WORKER] Init ok in {:.1}s ({} backend)",
            started.elapsed().as_secs_f64(),
            report.backend
        );
        Ok(report)
    }

    pub fn status(&self) -> WorkerStatus {
        match &self.state {
            ModelState::Uninitialized => WorkerStatus::default(),
            ModelState::Ready(loaded) => WorkerStatus {
                backend: loaded.backend,
                model_loaded: !loaded.session.is_disposed(),
                model_path: Some(loaded.path.clone()),
            },
        }
    }

    /// Generate with the live session. Omitted options take their defaults.
    pub fn run(
        &mut self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancelFlag,
    ) -> Result<String, WorkerFailure> {
        let loaded = match &mut self.state {
            ModelState::Ready(loaded) if !loaded.session.is_disposed() => loaded,
            _ => return Err(WorkerFailure::not_initialized()),
        };
        let params = options.resolve();
        loaded
            .session
            .generate(prompt, &params, cancel)
            .map_err(|e| match e {
                EngineError::Cancelled => WorkerFailure::cancelled(),
                other => WorkerFailure::inference(describe_engine_error(&other)),
            })
    }

    /// Release everything. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if matches!(self.state, ModelState::Ready(_)) {
            info!("[WORKER] Shutting down, releasing model");
        }
        self.release();
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineEvent, MockEngine};
    use llama_desk_types::{FailureKind, GenerationParams};
    use std::fs;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    fn model_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"gguf").unwrap();
        path
    }

    fn runtime(engine: &MockEngine, policy: SwapPolicy) -> WorkerRuntime {
        WorkerRuntime::new(Box::new(engine.clone()), EnvDefaults::default(), policy)
    }

    fn no_cancel() -> CancelFlag {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_initialize_without_any_path_is_not_found() {
        let engine = MockEngine::new();
        let mut rt = runtime(&engine, SwapPolicy::Atomic);
        let err = rt.initialize(None, &ModelTuning::default()).unwrap_err();
        assert_eq!(err.kind, FailureKind::NotFound);
        assert!(engine.journal().is_empty());
    }

    #[test]
    fn test_initialize_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new();
        let mut rt = runtime(&engine, SwapPolicy::Atomic);
        let err = rt
            .initialize(Some(dir.path().join("gone.gguf")), &ModelTuning::default())
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::NotFound);
        assert!(err.message.contains("gone.gguf"));
    }

    #[test]
    fn test_initialize_then_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "a.gguf");
        let engine = MockEngine::new();
        let mut rt = runtime(&engine, SwapPolicy::Atomic);

        let report = rt
            .initialize(Some(path.clone()), &ModelTuning::default())
            .unwrap();
        assert_eq!(report.backend, Backend::Cpu);
        assert!(report.model_loaded);
        assert_eq!(report.model_path, path);

        let status = rt.status();
        assert!(status.model_loaded);
        assert_eq!(status.model_path, Some(path.clone()));

        let text = rt
            .run("hello", &GenerationOptions::default(), &no_cancel())
            .unwrap();
        assert_eq!(text, "[a.gguf] hello");

        let generated = engine.journal().into_iter().find_map(|e| match e {
            EngineEvent::Generate { params, .. } => Some(params),
            _ => None,
        });
        assert_eq!(generated, Some(GenerationParams::default()));
    }

    #[test]
    fn test_run_before_initialize() {
        let engine = MockEngine::new();
        let mut rt = runtime(&engine, SwapPolicy::Atomic);
        let err = rt
            .run("hi", &GenerationOptions::default(), &no_cancel())
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::NotInitialized);
        assert_eq!(err.message, "Model/session is not initialized");
        assert_eq!(rt.status(), WorkerStatus::default());
    }

    #[test]
    fn test_switch_releases_old_model_innermost_first() {
        let dir = tempfile::tempdir().unwrap();
        let a = model_file(dir.path(), "a.gguf");
        let b = model_file(dir.path(), "b.gguf");
        let engine = MockEngine::new();
        let mut rt = runtime(&engine, SwapPolicy::Atomic);

        rt.initialize(Some(a.clone()), &ModelTuning::default())
            .unwrap();
        rt.initialize(Some(b.clone()), &ModelTuning::default())
            .unwrap();

        assert_eq!(
            engine.journal(),
            vec![
                EngineEvent::LoadModel(a.clone()),
                EngineEvent::CreateContext(a.clone()),
                EngineEvent::CreateSession(a.clone()),
                EngineEvent::LoadModel(b.clone()),
                EngineEvent::CreateContext(b.clone()),
                EngineEvent::CreateSession(b.clone()),
                EngineEvent::DisposeSession(a.clone()),
                EngineEvent::DisposeContext(a.clone()),
                EngineEvent::DisposeModel(a),
            ]
        );
        assert_eq!(rt.status().model_path, Some(b));
    }

    #[test]
    fn test_failed_switch_keeps_old_model_when_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let good = model_file(dir.path(), "good.gguf");
        let bad = model_file(dir.path(), "bad.gguf");
        let engine = MockEngine::new().fail_load_when("bad");
        let mut rt = runtime(&engine, SwapPolicy::Atomic);

        rt.initialize(Some(good.clone()), &ModelTuning::default())
            .unwrap();
        let err = rt
            .initialize(Some(bad), &ModelTuning::default())
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::LoadFailure);

        let status = rt.status();
        assert!(status.model_loaded);
        assert_eq!(status.model_path, Some(good));
        assert!(rt
            .run("still here", &GenerationOptions::default(), &no_cancel())
            .is_ok());
    }

    #[test]
    fn test_failed_switch_leaves_nothing_when_release_first() {
        let dir = tempfile::tempdir().unwrap();
        let good = model_file(dir.path(), "good.gguf");
        let bad = model_file(dir.path(), "bad.gguf");
        let engine = MockEngine::new().fail_load_when("bad");
        let mut rt = runtime(&engine, SwapPolicy::ReleaseFirst);

        rt.initialize(Some(good.clone()), &ModelTuning::default())
            .unwrap();
        rt.initialize(Some(bad.clone()), &ModelTuning::default())
            .unwrap_err();

        assert_eq!(rt.status(), WorkerStatus::default());
        let journal = engine.journal();
        let disposed = journal
            .iter()
            .position(|e| *e == EngineEvent::DisposeModel(good.clone()))
            .unwrap();
        let loaded = journal
            .iter()
            .position(|e| *e == EngineEvent::LoadModel(bad.clone()))
            .unwrap();
        assert!(disposed < loaded);
    }

    #[test]
    fn test_unresolvable_path_keeps_current_model_under_release_first() {
        let dir = tempfile::tempdir().unwrap();
        let good = model_file(dir.path(), "good.gguf");
        let engine = MockEngine::new();
        let mut rt = runtime(&engine, SwapPolicy::ReleaseFirst);

        rt.initialize(Some(good.clone()), &ModelTuning::default())
            .unwrap();
        let err = rt
            .initialize(Some(dir.path().join("missing.gguf")), &ModelTuning::default())
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::NotFound);
        assert_eq!(rt.status().model_path, Some(good));
    }

    #[test]
    fn test_dispose_failures_do_not_block_switch() {
        let dir = tempfile::tempdir().unwrap();
        let a = model_file(dir.path(), "a.gguf");
        let b = model_file(dir.path(), "b.gguf");
        let engine = MockEngine::new().fail_dispose();
        let mut rt = runtime(&engine, SwapPolicy::Atomic);

        rt.initialize(Some(a.clone()), &ModelTuning::default())
            .unwrap();
        rt.initialize(Some(b.clone()), &ModelTuning::default())
            .unwrap();
        assert_eq!(rt.status().model_path, Some(b));
        assert!(engine
            .journal()
            .contains(&EngineEvent::DisposeModel(a)));
    }

    #[test]
    fn test_disposed_during_setup_is_explained() {
        let dir = tempfile::tempdir().unwrap();
        let big = model_file(dir.path(), "big-f32.gguf");
        let engine = MockEngine::new().dispose_early_when("big");
        let mut rt = runtime(&engine, SwapPolicy::Atomic);

        let err = rt
            .initialize(Some(big.clone()), &ModelTuning::default())
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::LoadFailure);
        assert_eq!(err.message, DISPOSED_EARLY_MESSAGE);
        assert!(engine.journal().contains(&EngineEvent::DisposeModel(big)));
    }

    #[test]
    fn test_context_failure_releases_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "ctx.gguf");
        let engine = MockEngine::new().fail_context_when("ctx");
        let mut rt = runtime(&engine, SwapPolicy::Atomic);

        let err = rt
            .initialize(Some(path.clone()), &ModelTuning::default())
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::LoadFailure);
        assert!(err.message.contains("Context creation failed"));
        assert_eq!(
            engine.journal(),
            vec![
                EngineEvent::LoadModel(path.clone()),
                EngineEvent::CreateContext(path.clone()),
                EngineEvent::DisposeModel(path),
            ]
        );
    }

    #[test]
    fn test_default_path_priority() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = model_file(dir.path(), "explicit.gguf");
        let env_path = model_file(dir.path(), "env.gguf");
        let models = dir.path().join("models");
        fs::create_dir_all(&models).unwrap();
        let scanned = model_file(&models, "scanned-q4_k_m.gguf");

        let engine = MockEngine::new();
        let defaults = EnvDefaults {
            model_path: Some(env_path.clone()),
            model_dir: Some(models.clone()),
        };
        let mut rt =
            WorkerRuntime::new(Box::new(engine.clone()), defaults, SwapPolicy::Atomic);

        let report = rt.initialize(None, &ModelTuning::default()).unwrap();
        assert_eq!(report.model_path, env_path);
        let report = rt
            .initialize(Some(explicit.clone()), &ModelTuning::default())
            .unwrap();
        assert_eq!(report.model_path, explicit);

        let mut dir_only = WorkerRuntime::new(
            Box::new(engine),
            EnvDefaults {
                model_path: None,
                model_dir: Some(models),
            },
            SwapPolicy::Atomic,
        );
        let report = dir_only.initialize(None, &ModelTuning::default()).unwrap();
        assert_eq!(report.model_path, scanned);
    }

    #[test]
    fn test_gpu_layers_select_gpu_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "a.gguf");
        let engine = MockEngine::new().with_gpu_layers(12);
        let mut rt = runtime(&engine, SwapPolicy::Atomic);

        let report = rt.initialize(Some(path), &ModelTuning::default()).unwrap();
        assert_eq!(report.backend, Backend::Gpu);
        assert_eq!(rt.status().backend, Backend::Gpu);

        let cpu = ModelTuning {
            gpu_layers: Some(0),
            ..Default::default()
        };
        let path = model_file(dir.path(), "b.gguf");
        assert_eq!(rt.initialize(Some(path), &cpu).unwrap().backend, Backend::Cpu);
    }

    #[test]
    fn test_run_failures_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "a.gguf");

        let engine = MockEngine::new().fail_generation("decode exploded");
        let mut rt = runtime(&engine, SwapPolicy::Atomic);
        rt.initialize(Some(path.clone()), &ModelTuning::default())
            .unwrap();
        let err = rt
            .run("x", &GenerationOptions::default(), &no_cancel())
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Inference);
        assert_eq!(err.message, "decode exploded");

        let engine = MockEngine::new().generation_delay(Duration::from_millis(200));
        let mut rt = runtime(&engine, SwapPolicy::Atomic);
        rt.initialize(Some(path), &ModelTuning::default()).unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let err = rt
            .run("x", &GenerationOptions::default(), &cancel)
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Cancelled);
    }

    #[test]
    fn test_run_disposed_is_explained() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "a.gguf");
        let engine = MockEngine::new().disposed_generation();
        let mut rt = runtime(&engine, SwapPolicy::Atomic);
        rt.initialize(Some(path), &ModelTuning::default()).unwrap();

        let err = rt
            .run("hi", &GenerationOptions::default(), &no_cancel())
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Inference);
        assert_eq!(err.message, DISPOSED_EARLY_MESSAGE);
    }

    #[test]
    fn test_shutdown_releases_and_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "a.gguf");
        let engine = MockEngine::new();
        let mut rt = runtime(&engine, SwapPolicy::Atomic);
        rt.initialize(Some(path.clone()), &ModelTuning::default())
            .unwrap();

        rt.shutdown();
        rt.shutdown();
        assert_eq!(rt.status(), WorkerStatus::default());
        let disposals = engine
            .journal()
            .into_iter()
            .filter(|e| *e == EngineEvent::DisposeModel(path.clone()))
            .count();
        assert_eq!(disposals, 1);
    }
}
