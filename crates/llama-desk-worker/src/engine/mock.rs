//! Scriptable in-process engine for tests and demos.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use llama_desk_types::GenerationParams;

use super::{
    truncate_at_stop, CancelFlag, ContextHandle, ContextParams, EngineError, InferenceEngine,
    ModelHandle, SessionHandle,
};

const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Something the mock engine did, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LoadModel(PathBuf),
    CreateContext(PathBuf),
    CreateSession(PathBuf),
    Generate {
        path: PathBuf,
        prompt: String,
        params: GenerationParams,
    },
    GenerationCancelled(PathBuf),
    DisposeSession(PathBuf),
    DisposeContext(PathBuf),
    DisposeModel(PathBuf),
}

#[derive(Debug, Default, Clone)]
struct MockBehavior {
    gpu_layers: u32,
    fail_load_when: Option<String>,
    fail_context_when: Option<String>,
    dispose_early_when: Option<String>,
    fail_dispose: bool,
    generation_delay: Duration,
    fail_generation: Option<String>,
    disposed_generation: bool,
    panic_when: Option<String>,
}

type Journal = Arc<Mutex<Vec<EngineEvent>>>;

/// Engine whose models echo their prompt. Clones share one journal.
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    behavior: Arc<MockBehavior>,
    journal: Journal,
}

fn path_matches(path: &Path, needle: &Option<String>) -> bool {
    needle
        .as_deref()
        .is_some_and(|n| path.to_string_lossy().contains(n))
}

fn record(journal: &Journal, event: EngineEvent) {
    journal
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(event);
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(mut self, change: impl FnOnce(&mut MockBehavior)) -> Self {
        change(Arc::make_mut(&mut self.behavior));
        self
    }

    /// Report this many GPU layers for every model.
    pub fn with_gpu_layers(self, layers: u32) -> Self {
        self.with(|b| b.gpu_layers = layers)
    }

    /// Fail loading any path containing `needle`.
    pub fn fail_load_when(self, needle: &str) -> Self {
        self.with(|b| b.fail_load_when = Some(needle.to_string()))
    }

    /// Fail context creation for paths containing `needle`.
    pub fn fail_context_when(self, needle: &str) -> Self {
        self.with(|b| b.fail_context_when = Some(needle.to_string()))
    }

    /// Context creation for paths containing `needle` reports a resource the
    /// bindings already released.
    pub fn dispose_early_when(self, needle: &str) -> Self {
        self.with(|b| b.dispose_early_when = Some(needle.to_string()))
    }

    /// Every dispose call reports an error after recording itself.
    pub fn fail_dispose(self) -> Self {
        self.with(|b| b.fail_dispose = true)
    }

    /// Make each generation take `delay`, polling the cancel flag meanwhile.
    pub fn generation_delay(self, delay: Duration) -> Self {
        self.with(|b| b.generation_delay = delay)
    }

    pub fn fail_generation(self, message: &str) -> Self {
        self.with(|b| b.fail_generation = Some(message.to_string()))
    }

    /// Generation reports that the session was released underneath it.
    pub fn disposed_generation(self) -> Self {
        self.with(|b| b.disposed_generation = true)
    }

    /// Panic while generating a prompt containing `needle`.
    pub fn panic_when(self, needle: &str) -> Self {
        self.with(|b| b.panic_when = Some(needle.to_string()))
    }

    /// Snapshot of every recorded event.
    pub fn journal(&self) -> Vec<EngineEvent> {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl InferenceEngine for MockEngine {
    fn load_model(
        &self,
        path: &Path,
        gpu_layers: Option<u32>,
    ) -> Result<Box<dyn ModelHandle>, EngineError> {
        record(&self.journal, EngineEvent::LoadModel(path.to_path_buf()));
        if path_matches(path, &self.behavior.fail_load_when) {
            return Err(EngineError::Load(format!(
                "mock refused {}",
                path.display()
            )));
        }
        let layers = gpu_layers.unwrap_or(self.behavior.gpu_layers);
        Ok(Box::new(MockModel {
            path: path.to_path_buf(),
            gpu_layers: layers,
            behavior: Arc::clone(&self.behavior),
            journal: Arc::clone(&self.journal),
            disposed: false,
        }))
    }
}

struct MockModel {
    path: PathBuf,
    gpu_layers: u32,
    behavior: Arc<MockBehavior>,
    journal: Journal,
    disposed: bool,
}

impl ModelHandle for MockModel {
    fn gpu_layers(&self) -> u32 {
        self.gpu_layers
    }

    fn create_context(
        &self,
        _params: &ContextParams,
    ) -> Result<Box<dyn ContextHandle>, EngineError> {
        record(&self.journal, EngineEvent::CreateContext(self.path.clone()));
        if path_matches(&self.path, &self.behavior.dispose_early_when) {
            return Err(EngineError::Disposed);
        }
        if path_matches(&self.path, &self.behavior.fail_context_when) {
            return Err(EngineError::Context("mock context failure".to_string()));
        }
        Ok(Box::new(MockContext {
            path: self.path.clone(),
            behavior: Arc::clone(&self.behavior),
            journal: Arc::clone(&self.journal),
            disposed: false,
        }))
    }

    fn dispose(&mut self) -> Result<(), EngineError> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        record(&self.journal, EngineEvent::DisposeModel(self.path.clone()));
        dispose_result(&self.behavior)
    }
}

struct MockContext {
    path: PathBuf,
    behavior: Arc<MockBehavior>,
    journal: Journal,
    disposed: bool,
}

impl ContextHandle for MockContext {
    fn create_session(&self) -> Result<Box<dyn SessionHandle>, EngineError> {
        record(&self.journal, EngineEvent::CreateSession(self.path.clone()));
        Ok(Box::new(MockSession {
            path: self.path.clone(),
            behavior: Arc::clone(&self.behavior),
            journal: Arc::clone(&self.journal),
            disposed: false,
        }))
    }

    fn dispose(&mut self) -> Result<(), EngineError> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        record(&self.journal, EngineEvent::DisposeContext(self.path.clone()));
        dispose_result(&self.behavior)
    }
}

struct MockSession {
    path: PathBuf,
    behavior: Arc<MockBehavior>,
    journal: Journal,
    disposed: bool,
}

impl MockSession {
    fn wait_out_delay(&self, cancel: &CancelFlag) -> Result<(), EngineError> {
        let mut remaining = self.behavior.generation_delay;
        while !remaining.is_zero() {
            if cancel.load(Ordering::SeqCst) {
                record(
                    &self.journal,
                    EngineEvent::GenerationCancelled(self.path.clone()),
                );
                return Err(EngineError::Cancelled);
            }
            let step = remaining.min(CANCEL_POLL);
            thread::sleep(step);
            remaining -= step;
        }
        Ok(())
    }
}

impl SessionHandle for MockSession {
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> Result<String, EngineError> {
        record(
            &self.journal,
            EngineEvent::Generate {
                path: self.path.clone(),
                prompt: prompt.to_string(),
                params: params.clone(),
            },
        );
        if self.disposed || self.behavior.disposed_generation {
            return Err(EngineError::Disposed);
        }
        if self
            .behavior
            .panic_when
            .as_deref()
            .is_some_and(|needle| prompt.contains(needle))
        {
            panic!("mock engine panicked on prompt {prompt:?}");
        }
        self.wait_out_delay(cancel)?;
        if let Some(message) = &self.behavior.fail_generation {
            return Err(EngineError::Generation(message.clone()));
        }

        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let echoed = format!("[{name}] {prompt}");
        let mut text = echoed
            .split_whitespace()
            .take(params.max_tokens as usize)
            .collect::<Vec<_>>()
            .join(" ");
        truncate_at_stop(&mut text, &params.stop);
        Ok(text)
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn dispose(&mut self) -> Result<(), EngineError> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        record(&self.journal, EngineEvent::DisposeSession(self.path.clone()));
        dispose_result(&self.behavior)
    }
}

fn dispose_result(behavior: &MockBehavior) -> Result<(), EngineError> {
    if behavior.fail_dispose {
        Err(EngineError::Dispose("mock dispose failure".to_string()))
    } else {
        Ok(())
    }
}
