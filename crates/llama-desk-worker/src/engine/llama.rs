//! llama.cpp engine backed by the `llama-cpp-2` bindings.

use std::cell::RefCell;
use std::num::NonZeroU32;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use log::{debug, info};

use llama_desk_types::GenerationParams;

use super::{
    truncate_at_stop, CancelFlag, ContextHandle, ContextParams, EngineError, InferenceEngine,
    ModelHandle, SessionHandle,
};

/// Prompt tokens decoded per batch.
const PROMPT_CHUNK: usize = 512;

/// Context slot shared by a context handle and its sessions. `None` once the
/// context has been released.
type ContextSlot = Rc<RefCell<Option<LlamaContext<'static>>>>;

pub struct LlamaEngine {
    backend: Arc<LlamaBackend>,
}

impl LlamaEngine {
    /// Initialize the llama.cpp backend. Only one backend may exist per process.
    pub fn new() -> Result<Self, EngineError> {
        let backend = LlamaBackend::init()
            .map_err(|e| EngineError::Load(format!("backend init failed: {e}")))?;
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl InferenceEngine for LlamaEngine {
    fn load_model(
        &self,
        path: &Path,
        gpu_layers: Option<u32>,
    ) -> Result<Box<dyn ModelHandle>, EngineError> {
        let mut params = LlamaModelParams::default();
        if let Some(layers) = gpu_layers {
            params = params.with_n_gpu_layers(layers);
        }
        info!("[ENGINE] Loading model from: {}", path.display());
        let model = LlamaModel::load_from_file(&self.backend, path, &params)
            .map_err(|e| EngineError::Load(e.to_string()))?;

        // Offload never exceeds the block count, and needs a GPU build at all.
        let offloaded = if cfg!(any(feature = "cuda", feature = "metal")) {
            (params.n_gpu_layers().max(0) as u32).min(model.n_layer())
        } else {
            0
        };
        info!("[ENGINE] Model loaded, {offloaded} layers offloaded to GPU");

        Ok(Box::new(LlamaModelHandle {
            model: Some(Arc::new(model)),
            backend: Arc::clone(&self.backend),
            gpu_layers: offloaded,
        }))
    }
}

struct LlamaModelHandle {
    model: Option<Arc<LlamaModel>>,
    backend: Arc<LlamaBackend>,
    gpu_layers: u32,
}

impl ModelHandle for LlamaModelHandle {
    fn gpu_layers(&self) -> u32 {
        self.gpu_layers
    }

    fn create_context(
        &self,
        params: &ContextParams,
    ) -> Result<Box<dyn ContextHandle>, EngineError> {
        let model = self.model.as_ref().ok_or(EngineError::Disposed)?;
        let mut ctx_params =
            LlamaContextParams::default().with_n_ctx(params.context_size.and_then(NonZeroU32::new));
        if let Some(threads) = params.threads {
            ctx_params = ctx_params.with_n_threads(threads as i32);
        }

        // SAFETY: the lifetime is erased so the context can live next to the
        // model it borrows. Every holder of the slot also holds an Arc of the
        // model in a field declared after the slot, so the context is always
        // dropped while the model is still alive.
        let context = unsafe {
            let real_ctx = model
                .new_context(&self.backend, ctx_params)
                .map_err(|e| EngineError::Context(e.to_string()))?;
            std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(real_ctx)
        };
        debug!("[ENGINE] Context created (n_ctx={})", context.n_ctx());

        Ok(Box::new(LlamaContextHandle {
            slot: Rc::new(RefCell::new(Some(context))),
            model: Arc::clone(model),
        }))
    }

    fn dispose(&mut self) -> Result<(), EngineError> {
        self.model = None;
        Ok(())
    }
}

struct LlamaContextHandle {
    slot: ContextSlot,
    model: Arc<LlamaModel>,
}

impl ContextHandle for LlamaContextHandle {
    fn create_session(&self) -> Result<Box<dyn SessionHandle>, EngineError> {
        if self.slot.borrow().is_none() {
            return Err(EngineError::Disposed);
        }
        Ok(Box::new(LlamaSession {
            slot: Some(Rc::clone(&self.slot)),
            model: Arc::clone(&self.model),
        }))
    }

    fn dispose(&mut self) -> Result<(), EngineError> {
        self.slot.borrow_mut().take();
        Ok(())
    }
}

struct LlamaSession {
    slot: Option<ContextSlot>,
    model: Arc<LlamaModel>,
}

fn build_sampler(params: &GenerationParams) -> LlamaSampler {
    if params.temperature <= 0.0 {
        return LlamaSampler::greedy();
    }
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    LlamaSampler::chain_simple([
        LlamaSampler::temp(params.temperature),
        LlamaSampler::top_p(params.top_p, 1),
        LlamaSampler::dist(seed),
    ])
}

impl SessionHandle for LlamaSession {
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> Result<String, EngineError> {
        let slot = self.slot.as_ref().ok_or(EngineError::Disposed)?;
        let mut guard = slot.borrow_mut();
        let ctx = guard.as_mut().ok_or(EngineError::Disposed)?;
        ctx.clear_kv_cache();

        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| EngineError::Generation(format!("Tokenization failed: {e}")))?;
        let n_ctx = ctx.n_ctx() as usize;
        if tokens.is_empty() || tokens.len() >= n_ctx {
            return Err(EngineError::Generation(format!(
                "Prompt of {} tokens does not fit a context of {n_ctx}",
                tokens.len()
            )));
        }

        let mut batch = LlamaBatch::new(PROMPT_CHUNK, 1);
        let last = tokens.len() - 1;
        for (chunk_index, chunk) in tokens.chunks(PROMPT_CHUNK).enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }
            batch.clear();
            for (offset, token) in chunk.iter().enumerate() {
                let pos = chunk_index * PROMPT_CHUNK + offset;
                batch
                    .add(*token, pos as i32, &[0], pos == last)
                    .map_err(|e| EngineError::Generation(format!("Batch add failed: {e}")))?;
            }
            ctx.decode(&mut batch)
                .map_err(|e| EngineError::Generation(format!("Prompt decode failed: {e}")))?;
        }

        let mut sampler = build_sampler(params);
        let mut output = String::new();
        let mut pos = tokens.len();
        for _ in 0..params.max_tokens {
            if cancel.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }
            let token = sampler.sample(ctx, -1);
            if self.model.is_eog_token(token) {
                break;
            }
            let piece = self
                .model
                .token_to_str(token, Special::Tokenize)
                .map_err(|e| EngineError::Generation(format!("Detokenization failed: {e}")))?;
            output.push_str(&piece);
            if truncate_at_stop(&mut output, &params.stop) || pos + 1 >= n_ctx {
                break;
            }

            batch.clear();
            batch
                .add(token, pos as i32, &[0], true)
                .map_err(|e| EngineError::Generation(format!("Batch add failed: {e}")))?;
            ctx.decode(&mut batch)
                .map_err(|e| EngineError::Generation(format!("Decode failed: {e}")))?;
            pos += 1;
        }
        Ok(output)
    }

    fn is_disposed(&self) -> bool {
        match &self.slot {
            Some(slot) => slot.borrow().is_none(),
            None => true,
        }
    }

    fn dispose(&mut self) -> Result<(), EngineError> {
        self.slot = None;
        Ok(())
    }
}
