//! Async handle to the inference worker.
//!
//! Turns the worker's reply stream into request/response futures. Every call
//! registers a oneshot under a fresh request ID, sends, and awaits with a
//! timer. A reply that arrives after its timer fired finds no pending entry
//! and is dropped by the dispatcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};

use llama_desk_config::ControllerConfig;
use llama_desk_types::{
    CommandKind, GenerationOptions, InitReport, ModelEntry, ModelTuning, WorkerCommand,
    WorkerFailure, WorkerRequest, WorkerResponse, WorkerResult, WorkerStatus,
};
use llama_desk_worker::{locator, InferenceEngine, WorkerHandle};

/// How long `terminate` waits for the worker threads to exit.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Failed to start worker: {0}")]
    Spawn(#[from] std::io::Error),
    /// The worker handled the request and reported a failure.
    #[error(transparent)]
    Worker(#[from] WorkerFailure),
    #[error("{}", timeout_message(.operation, .after))]
    Timeout {
        operation: CommandKind,
        after: Duration,
    },
    #[error("Worker is not running")]
    Disconnected,
    #[error("Protocol error: {0}")]
    Protocol(String),
}

fn timeout_message(operation: &CommandKind, after: &Duration) -> String {
    match operation {
        CommandKind::Run => format!("Generation timeout after {after:?}"),
        CommandKind::Initialize => format!("Model init timeout after {after:?}"),
        other => format!("{other} timed out after {after:?}"),
    }
}

type Reply = Result<WorkerResult, ControllerError>;

struct PendingRequest {
    kind: CommandKind,
    tx: oneshot::Sender<Reply>,
}

type PendingTable = Arc<TokioMutex<HashMap<u64, PendingRequest>>>;

/// Shared reference to the Controller.
pub type SharedController = Arc<Controller>;

pub struct Controller {
    /// `None` once terminated.
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<WorkerRequest>>>,
    pending: PendingTable,
    next_id: AtomicU64,
    worker: Mutex<Option<WorkerHandle>>,
    config: ControllerConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Controller {
    /// Start a worker around `engine` and the dispatcher task. Must be called
    /// inside a tokio runtime.
    pub fn spawn(
        engine: Box<dyn InferenceEngine>,
        config: ControllerConfig,
    ) -> Result<Self, ControllerError> {
        let (handle, channels) = llama_desk_worker::spawn(
            engine,
            config.defaults.clone(),
            config.swap_policy,
        )?;
        let pending: PendingTable = Arc::new(TokioMutex::new(HashMap::new()));
        tokio::spawn(dispatcher_task(channels.responses, Arc::clone(&pending)));

        Ok(Self {
            cmd_tx: Mutex::new(Some(channels.requests)),
            pending,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(Some(handle)),
            config,
        })
    }

    /// Send without registering a reply.
    fn send_fire_and_forget(&self, command: WorkerCommand) -> bool {
        match lock(&self.cmd_tx).as_ref() {
            Some(tx) => tx.send(WorkerRequest { id: 0, command }).is_ok(),
            None => false,
        }
    }

    /// Register a pending entry and send. Returns the request ID and the
    /// reply receiver.
    async fn dispatch(
        &self,
        command: WorkerCommand,
    ) -> Result<(u64, oneshot::Receiver<Reply>), ControllerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = command.kind();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(id, PendingRequest { kind, tx });

        let sent = match lock(&self.cmd_tx).as_ref() {
            Some(cmd_tx) => cmd_tx.send(WorkerRequest { id, command }).is_ok(),
            None => false,
        };
        if !sent {
            self.pending.lock().await.remove(&id);
            return Err(ControllerError::Disconnected);
        }
        debug!("[BRIDGE] Sent {kind} id={id}");
        Ok((id, rx))
    }

    async fn await_reply(
        &self,
        id: u64,
        kind: CommandKind,
        rx: oneshot::Receiver<Reply>,
        after: Duration,
    ) -> Reply {
        match tokio::time::timeout(after, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ControllerError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                warn!("[BRIDGE] {kind} id={id} timed out after {after:?}");
                Err(ControllerError::Timeout {
                    operation: kind,
                    after,
                })
            }
        }
    }

    /// Optionally load a model at startup. When auto-load is disabled this
    /// only waits out the init safety delay. Never fails because of that
    /// delay; only an explicit worker failure before it elapses is an error.
    pub async fn initialize(&self, model_dir_hint: Option<&Path>) -> Result<(), ControllerError> {
        let safety = self.config.timeouts.init_safety;
        if !self.config.auto_load_model {
            debug!("[BRIDGE] Auto-load disabled, init is a no-op");
            tokio::time::sleep(safety).await;
            return Ok(());
        }

        let defaults = &self.config.defaults;
        let model_path: Option<PathBuf> = match model_dir_hint.or(defaults.model_dir.as_deref()) {
            Some(dir) => locator::find_preferred_model(dir),
            None => defaults.model_path.clone(),
        };
        info!("[BRIDGE] Auto-loading model: {model_path:?}");

        let (id, rx) = self
            .dispatch(WorkerCommand::Initialize {
                model_path,
                tuning: ModelTuning::default(),
            })
            .await?;
        match self.await_reply(id, CommandKind::Initialize, rx, safety).await {
            Ok(WorkerResult::Initialize(Ok(report))) => {
                info!("[BRIDGE] Model ready: {}", report.model_path.display());
                Ok(())
            }
            Ok(WorkerResult::Initialize(Err(failure))) => Err(failure.into()),
            Ok(other) => Err(unexpected(CommandKind::Initialize, &other)),
            Err(ControllerError::Timeout { .. }) => {
                info!("[BRIDGE] Init still running after {safety:?}, continuing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Current worker state. Falls back to the default when the worker does
    /// not answer within the status timeout or is gone.
    pub async fn status(&self) -> WorkerStatus {
        let reply = match self.dispatch(WorkerCommand::Status).await {
            Ok((id, rx)) => {
                self.await_reply(id, CommandKind::Status, rx, self.config.timeouts.status)
                    .await
            }
            Err(e) => Err(e),
        };
        match reply {
            Ok(WorkerResult::Status(status)) => status,
            Ok(other) => {
                warn!("[BRIDGE] {}", unexpected(CommandKind::Status, &other));
                WorkerStatus::default()
            }
            Err(e) => {
                debug!("[BRIDGE] Status unavailable: {e}");
                WorkerStatus::default()
            }
        }
    }

    /// Generate a completion. On timeout the worker is told to abandon it.
    pub async fn run(
        &self,
        prompt: &str,
        options: GenerationOptions,
    ) -> Result<String, ControllerError> {
        let (id, rx) = self
            .dispatch(WorkerCommand::Run {
                prompt: prompt.to_string(),
                options,
            })
            .await?;
        match self
            .await_reply(id, CommandKind::Run, rx, self.config.timeouts.run)
            .await
        {
            Ok(WorkerResult::Run(result)) => Ok(result?),
            Ok(other) => Err(unexpected(CommandKind::Run, &other)),
            Err(e @ ControllerError::Timeout { .. }) => {
                self.send_fire_and_forget(WorkerCommand::Cancel { target: id });
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Load `model_path` into the running worker.
    pub async fn switch_model(
        &self,
        model_path: &Path,
        tuning: ModelTuning,
    ) -> Result<InitReport, ControllerError> {
        info!("[BRIDGE] Switching model to {}", model_path.display());
        let (id, rx) = self
            .dispatch(WorkerCommand::Initialize {
                model_path: Some(model_path.to_path_buf()),
                tuning,
            })
            .await?;
        match self
            .await_reply(
                id,
                CommandKind::Initialize,
                rx,
                self.config.timeouts.switch_model,
            )
            .await?
        {
            WorkerResult::Initialize(result) => Ok(result?),
            other => Err(unexpected(CommandKind::Initialize, &other)),
        }
    }

    /// Model files under `root`, or under `MODEL_DIR` when `root` is `None`.
    pub fn list_models(&self, root: Option<&Path>) -> Vec<ModelEntry> {
        match root.or(self.config.defaults.model_dir.as_deref()) {
            Some(dir) => locator::list_models(dir),
            None => Vec::new(),
        }
    }

    /// Stop the worker and fail every pending call. Idempotent.
    pub async fn terminate(&self) {
        let Some(cmd_tx) = lock(&self.cmd_tx).take() else {
            return;
        };
        info!("[BRIDGE] Terminating worker");

        let drained: Vec<(u64, PendingRequest)> = self.pending.lock().await.drain().collect();
        for (id, request) in drained {
            if request.kind == CommandKind::Run {
                let _ = cmd_tx.send(WorkerRequest {
                    id: 0,
                    command: WorkerCommand::Cancel { target: id },
                });
            }
            let _ = request.tx.send(Err(ControllerError::Disconnected));
        }
        let _ = cmd_tx.send(WorkerRequest {
            id: 0,
            command: WorkerCommand::Shutdown,
        });
        drop(cmd_tx);

        let Some(handle) = lock(&self.worker).take() else {
            return;
        };
        let join = tokio::task::spawn_blocking(move || handle.join());
        match tokio::time::timeout(JOIN_TIMEOUT, join).await {
            Ok(Ok(())) => info!("[BRIDGE] Worker stopped"),
            Ok(Err(e)) => warn!("[BRIDGE] Worker join task failed: {e}"),
            Err(_) => warn!("[BRIDGE] Worker did not stop within {JOIN_TIMEOUT:?}"),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // Best effort; the worker also shuts down when the channel closes.
        self.send_fire_and_forget(WorkerCommand::Shutdown);
    }
}

fn unexpected(expected: CommandKind, got: &WorkerResult) -> ControllerError {
    ControllerError::Protocol(format!(
        "expected {expected} reply, got {}",
        got.kind()
    ))
}

/// Routes worker replies to their pending callers.
async fn dispatcher_task(
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
    pending: PendingTable,
) {
    while let Some(response) = responses.recv().await {
        let id = response.id;
        let mut pending_guard = pending.lock().await;
        let Some(request) = pending_guard.remove(&id) else {
            if id != 0 {
                debug!("[BRIDGE] No pending request for response id={id}");
            }
            continue;
        };
        drop(pending_guard);

        let reply = if response.result.kind() == request.kind {
            Ok(response.result)
        } else {
            Err(unexpected(request.kind, &response.result))
        };
        let _ = request.tx.send(reply);
    }

    // Worker gone: wake everyone still waiting.
    let mut pending_guard = pending.lock().await;
    for (_, request) in pending_guard.drain() {
        let _ = request.tx.send(Err(ControllerError::Disconnected));
    }
    debug!("[BRIDGE] Dispatcher task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_desk_config::{EnvDefaults, Timeouts};
    use llama_desk_types::{Backend, FailureKind};
    use llama_desk_worker::{EngineEvent, MockEngine};
    use std::fs;
    use std::time::Instant;

    fn config(timeouts: Timeouts) -> ControllerConfig {
        ControllerConfig {
            timeouts,
            ..Default::default()
        }
    }

    fn fast_timeouts() -> Timeouts {
        Timeouts {
            init_safety: Duration::from_millis(50),
            status: Duration::from_millis(200),
            run: Duration::from_secs(5),
            switch_model: Duration::from_secs(5),
        }
    }

    fn model_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"gguf").unwrap();
        path
    }

    #[tokio::test]
    async fn test_status_before_any_model() {
        let controller =
            Controller::spawn(Box::new(MockEngine::new()), config(fast_timeouts())).unwrap();
        assert_eq!(controller.status().await, WorkerStatus::default());
        controller.terminate().await;
    }

    #[tokio::test]
    async fn test_switch_model_then_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "chat-q4_0.gguf");
        let engine = MockEngine::new();
        let controller =
            Controller::spawn(Box::new(engine.clone()), config(fast_timeouts())).unwrap();

        let report = controller
            .switch_model(&path, ModelTuning::default())
            .await
            .unwrap();
        assert_eq!(report.model_path, path);
        assert_eq!(report.backend, Backend::Cpu);

        let status = controller.status().await;
        assert!(status.model_loaded);
        assert_eq!(status.model_path, Some(path));

        let options = GenerationOptions {
            max_tokens: Some(16),
            ..Default::default()
        };
        let text = controller.run("hello there", options).await.unwrap();
        assert_eq!(text, "[chat-q4_0.gguf] hello there");

        let params = engine.journal().into_iter().find_map(|e| match e {
            EngineEvent::Generate { params, .. } => Some(params),
            _ => None,
        });
        let params = params.unwrap();
        assert_eq!(params.max_tokens, 16);
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.top_p, 0.9);
        assert!(params.stop.is_empty());

        controller.terminate().await;
    }

    #[tokio::test]
    async fn test_run_without_model_fails() {
        let controller =
            Controller::spawn(Box::new(MockEngine::new()), config(fast_timeouts())).unwrap();
        let err = controller
            .run("hi", GenerationOptions::default())
            .await
            .unwrap_err();
        match err {
            ControllerError::Worker(failure) => {
                assert_eq!(failure.kind, FailureKind::NotInitialized)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        controller.terminate().await;
    }

    #[tokio::test]
    async fn test_switch_to_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let controller =
            Controller::spawn(Box::new(MockEngine::new()), config(fast_timeouts())).unwrap();
        let err = controller
            .switch_model(&dir.path().join("nope.gguf"), ModelTuning::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Worker(WorkerFailure { kind: FailureKind::NotFound, .. })
        ));
        assert!(!controller.status().await.model_loaded);
        controller.terminate().await;
    }

    #[tokio::test]
    async fn test_status_degrades_while_worker_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "slow.gguf");
        let engine = MockEngine::new().generation_delay(Duration::from_secs(2));
        let controller =
            Arc::new(Controller::spawn(Box::new(engine), config(fast_timeouts())).unwrap());
        controller
            .switch_model(&path, ModelTuning::default())
            .await
            .unwrap();

        let busy = Arc::clone(&controller);
        let run = tokio::spawn(async move { busy.run("wait", GenerationOptions::default()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let status = controller.status().await;
        assert_eq!(status, WorkerStatus::default());
        assert!(started.elapsed() < Duration::from_secs(1));

        controller.terminate().await;
        let result = run.await.unwrap();
        assert!(matches!(result, Err(ControllerError::Disconnected)));
    }

    #[tokio::test]
    async fn test_run_timeout_cancels_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "slow.gguf");
        let engine = MockEngine::new().generation_delay(Duration::from_secs(5));
        let timeouts = Timeouts {
            run: Duration::from_millis(100),
            ..fast_timeouts()
        };
        let controller = Controller::spawn(Box::new(engine.clone()), config(timeouts)).unwrap();
        controller
            .switch_model(&path, ModelTuning::default())
            .await
            .unwrap();

        let err = controller
            .run("never finishes", GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Timeout {
                operation: CommandKind::Run,
                ..
            }
        ));
        assert!(err.to_string().starts_with("Generation timeout"));

        // The worker abandons the generation and answers again.
        let deadline = Instant::now() + Duration::from_secs(2);
        while !engine
            .journal()
            .contains(&EngineEvent::GenerationCancelled(path.clone()))
        {
            assert!(Instant::now() < deadline, "generation was not cancelled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(controller.status().await.model_loaded);

        controller.terminate().await;
    }

    #[tokio::test]
    async fn test_concurrent_runs_get_their_own_replies() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "m.gguf");
        let controller = Arc::new(
            Controller::spawn(Box::new(MockEngine::new()), config(fast_timeouts())).unwrap(),
        );
        controller
            .switch_model(&path, ModelTuning::default())
            .await
            .unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    let text = controller
                        .run(&format!("prompt-{i}"), GenerationOptions::default())
                        .await
                        .unwrap();
                    (i, text)
                })
            })
            .collect();

        for task in tasks {
            let (i, text) = task.await.unwrap();
            assert_eq!(text, format!("[m.gguf] prompt-{i}"));
        }
        controller.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_twice_and_calls_after() {
        let controller =
            Controller::spawn(Box::new(MockEngine::new()), config(fast_timeouts())).unwrap();
        controller.terminate().await;
        controller.terminate().await;

        assert_eq!(controller.status().await, WorkerStatus::default());
        let err = controller
            .run("late", GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Disconnected));
    }

    #[tokio::test]
    async fn test_initialize_is_timed_noop_without_auto_load() {
        let engine = MockEngine::new();
        let controller =
            Controller::spawn(Box::new(engine.clone()), config(fast_timeouts())).unwrap();

        let started = Instant::now();
        controller.initialize(None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(engine.journal().is_empty());
        controller.terminate().await;
    }

    #[tokio::test]
    async fn test_initialize_auto_load_picks_from_hint() {
        let dir = tempfile::tempdir().unwrap();
        let preferred = model_file(dir.path(), "model-q4_k_m.gguf");
        model_file(dir.path(), "model-f16.gguf");
        let engine = MockEngine::new();
        let controller = Controller::spawn(
            Box::new(engine.clone()),
            ControllerConfig {
                auto_load_model: true,
                timeouts: Timeouts {
                    init_safety: Duration::from_secs(2),
                    ..fast_timeouts()
                },
                ..Default::default()
            },
        )
        .unwrap();

        controller.initialize(Some(dir.path())).await.unwrap();
        assert_eq!(controller.status().await.model_path, Some(preferred));
        controller.terminate().await;
    }

    #[tokio::test]
    async fn test_initialize_auto_load_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "broken.gguf");
        let engine = MockEngine::new().fail_load_when("broken");
        let controller = Controller::spawn(
            Box::new(engine),
            ControllerConfig {
                auto_load_model: true,
                defaults: EnvDefaults {
                    model_path: Some(path),
                    model_dir: None,
                },
                timeouts: Timeouts {
                    init_safety: Duration::from_secs(2),
                    ..fast_timeouts()
                },
                ..Default::default()
            },
        )
        .unwrap();

        let err = controller.initialize(None).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Worker(WorkerFailure {
                kind: FailureKind::LoadFailure,
                ..
            })
        ));
        controller.terminate().await;
    }

    #[tokio::test]
    async fn test_list_models_uses_root_or_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        model_file(dir.path(), "a.gguf");
        model_file(dir.path(), "b.GGUF");

        let controller =
            Controller::spawn(Box::new(MockEngine::new()), config(fast_timeouts())).unwrap();
        assert!(controller.list_models(None).is_empty());
        assert_eq!(controller.list_models(Some(dir.path())).len(), 2);
        controller.terminate().await;

        let controller = Controller::spawn(
            Box::new(MockEngine::new()),
            ControllerConfig {
                defaults: EnvDefaults {
                    model_path: None,
                    model_dir: Some(dir.path().to_path_buf()),
                },
                ..config(fast_timeouts())
            },
        )
        .unwrap();
        let names: Vec<String> = controller
            .list_models(None)
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["a.gguf", "b.GGUF"]);
        controller.terminate().await;
    }
}
