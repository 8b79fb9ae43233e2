//! Worker threads.
//!
//! Thread design:
//! - intake: reads requests from the controller, applies `Cancel` at once,
//!   queues everything else for the executor
//! - executor: owns the [`WorkerRuntime`] and handles one request at a time,
//!   in arrival order
//!
//! Responses go back on a tokio channel so the async controller can await
//! them without blocking.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use llama_desk_config::{EnvDefaults, SwapPolicy};
use llama_desk_types::{WorkerCommand, WorkerFailure, WorkerRequest, WorkerResponse, WorkerResult};

use crate::engine::{CancelFlag, InferenceEngine};
use crate::runtime::WorkerRuntime;

/// Cancellation flags of queued or running requests, by request ID.
type CancelRegistry = Arc<Mutex<HashMap<u64, CancelFlag>>>;

fn lock_registry(registry: &CancelRegistry) -> MutexGuard<'_, HashMap<u64, CancelFlag>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A request waiting for the executor.
struct Job {
    id: u64,
    command: WorkerCommand,
    cancel: CancelFlag,
}

/// Controller side of the worker's channels.
pub struct WorkerChannels {
    pub requests: UnboundedSender<WorkerRequest>,
    pub responses: UnboundedReceiver<WorkerResponse>,
}

/// Join handles of the worker threads.
pub struct WorkerHandle {
    intake: JoinHandle<()>,
    executor: JoinHandle<()>,
}

impl WorkerHandle {
    /// Wait for both threads to exit.
    pub fn join(self) {
        if self.intake.join().is_err() {
            error!("[WORKER] Intake thread panicked");
        }
        if self.executor.join().is_err() {
            error!("[WORKER] Executor thread panicked");
        }
    }
}

/// Start a worker around `engine`. The runtime is built on the executor
/// thread and never leaves it.
pub fn spawn(
    engine: Box<dyn InferenceEngine>,
    defaults: EnvDefaults,
    swap_policy: SwapPolicy,
) -> io::Result<(WorkerHandle, WorkerChannels)> {
    let (request_tx, request_rx) = mpsc::unbounded_channel::<WorkerRequest>();
    let (response_tx, response_rx) = mpsc::unbounded_channel::<WorkerResponse>();
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
    let registry: CancelRegistry = Arc::new(Mutex::new(HashMap::new()));

    let executor = {
        let registry = Arc::clone(&registry);
        thread::Builder::new()
            .name("llama-desk-executor".to_string())
            .spawn(move || {
                let runtime = WorkerRuntime::new(engine, defaults, swap_policy);
                executor_loop(runtime, job_rx, registry, response_tx);
            })?
    };
    let intake = thread::Builder::new()
        .name("llama-desk-intake".to_string())
        .spawn(move || intake_loop(request_rx, job_tx, registry))?;

    info!("[WORKER] Started ({swap_policy:?} model swaps)");
    Ok((
        WorkerHandle { intake, executor },
        WorkerChannels {
            requests: request_tx,
            responses: response_rx,
        },
    ))
}

fn intake_loop(
    mut requests: UnboundedReceiver<WorkerRequest>,
    jobs: Sender<Job>,
    registry: CancelRegistry,
) {
    while let Some(request) = requests.blocking_recv() {
        let id = request.id;
        match request.command {
            WorkerCommand::Cancel { target } => match lock_registry(&registry).get(&target) {
                Some(flag) => {
                    info!("[WORKER] Cancelling request id={target}");
                    flag.store(true, Ordering::SeqCst);
                }
                None => debug!("[WORKER] Cancel for unknown or finished request id={target}"),
            },
            WorkerCommand::Shutdown => {
                info!("[WORKER] Shutdown requested");
                for flag in lock_registry(&registry).values() {
                    flag.store(true, Ordering::SeqCst);
                }
                let _ = jobs.send(Job {
                    id,
                    command: WorkerCommand::Shutdown,
                    cancel: Arc::new(AtomicBool::new(false)),
                });
                return;
            }
            command => {
                let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
                if id != 0 {
                    lock_registry(&registry).insert(id, Arc::clone(&cancel));
                }
                if jobs.send(Job { id, command, cancel }).is_err() {
                    warn!("[WORKER] Executor gone, dropping request id={id}");
                    return;
                }
            }
        }
    }

    // Controller hung up without a Shutdown; release resources anyway.
    info!("[WORKER] Request channel closed, shutting down");
    let _ = jobs.send(Job {
        id: 0,
        command: WorkerCommand::Shutdown,
        cancel: Arc::new(AtomicBool::new(false)),
    });
}

/// Run `f`, turning a panic into an `Internal` failure.
fn guarded<T>(
    what: &str,
    f: impl FnOnce() -> Result<T, WorkerFailure>,
) -> Result<T, WorkerFailure> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("[WORKER] {what} panicked: {detail}");
        Err(WorkerFailure::internal(format!("{what} panicked: {detail}")))
    })
}

fn executor_loop(
    mut runtime: WorkerRuntime,
    jobs: Receiver<Job>,
    registry: CancelRegistry,
    responses: UnboundedSender<WorkerResponse>,
) {
    info!("[WORKER] Ready, waiting for commands...");

    for job in jobs.iter() {
        let id = job.id;
        let cancelled = job.cancel.load(Ordering::SeqCst);
        let result = match job.command {
            WorkerCommand::Initialize { model_path, tuning } => {
                WorkerResult::Initialize(if cancelled {
                    Err(WorkerFailure::cancelled())
                } else {
                    guarded("initialize", || runtime.initialize(model_path, &tuning))
                })
            }
            WorkerCommand::Status => WorkerResult::Status(runtime.status()),
            WorkerCommand::Run { prompt, options } => WorkerResult::Run(if cancelled {
                debug!("[WORKER] Skipping request id={id}, cancelled before start");
                Err(WorkerFailure::cancelled())
            } else {
                guarded("run", || runtime.run(&prompt, &options, &job.cancel))
            }),
            WorkerCommand::Shutdown => {
                runtime.shutdown();
                let _ = responses.send(WorkerResponse::new(id, WorkerResult::ShuttingDown));
                break;
            }
            // Applied by the intake thread, never queued.
            WorkerCommand::Cancel { .. } => continue,
        };

        lock_registry(&registry).remove(&id);
        if result.is_failure() {
            debug!("[WORKER] Request id={id} ({}) failed", result.kind());
        }
        if responses.send(WorkerResponse::new(id, result)).is_err() {
            warn!("[WORKER] Response channel closed, dropping reply id={id}");
        }
    }

    runtime.shutdown();
    info!("[WORKER] Executor exiting");
}
