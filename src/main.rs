use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use llama_desk::{logger, Controller, MlIpc, SharedController};
use llama_desk_config::{AppSettings, ControllerConfig, SettingsStore};
use llama_desk_types::{GenerationOptions, ModelTuning};
use llama_desk_worker::{locator, InferenceEngine, UnavailableEngine};

#[derive(Parser)]
#[command(name = "llama_desk")]
#[command(version)]
#[command(about = "Run local llama.cpp models behind a worker", long_about = None)]
struct Cli {
    /// Settings file (defaults to the platform config dir)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Directory for log files
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the worker status as JSON
    Status,
    /// List model files under DIR (or the configured model directory)
    #[command(alias = "ls")]
    List { dir: Option<PathBuf> },
    /// Print the model that would be auto-selected from DIR
    Pick { dir: PathBuf },
    /// Load a model and generate a completion
    Run {
        prompt: String,
        #[arg(short, long)]
        model: Option<PathBuf>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        top_p: Option<f32>,
        /// Stop sequence, repeatable
        #[arg(long)]
        stop: Vec<String>,
        #[arg(long)]
        ctx: Option<u32>,
        #[arg(long)]
        gpu_layers: Option<u32>,
        #[arg(long)]
        threads: Option<u32>,
    },
    /// Read or change the settings file
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Serve JSON requests line by line on stdin, replying on stdout
    Ipc,
}

#[derive(Subcommand)]
enum SettingsAction {
    Get,
    Reset,
    Export { path: PathBuf },
    Import { path: PathBuf },
}

fn build_engine() -> Box<dyn InferenceEngine> {
    #[cfg(feature = "llama")]
    {
        match llama_desk_worker::LlamaEngine::new() {
            Ok(engine) => return Box::new(engine),
            Err(e) => warn!("llama.cpp backend unavailable: {e}"),
        }
    }
    #[cfg(not(feature = "llama"))]
    {
        warn!("Built without the llama feature; model loads will fail");
    }
    Box::new(UnavailableEngine)
}

fn start_controller(config: ControllerConfig) -> anyhow::Result<SharedController> {
    let controller = Controller::spawn(build_engine(), config).context("starting worker")?;
    Ok(Arc::new(controller))
}

/// Flag, then settings file, then environment.
fn resolve_model(
    flag: Option<PathBuf>,
    settings: &AppSettings,
    config: &ControllerConfig,
) -> Option<PathBuf> {
    flag.or_else(|| settings.model_path.clone())
        .or_else(|| {
            settings
                .model_dir
                .as_deref()
                .and_then(locator::find_preferred_model)
        })
        .or_else(|| config.defaults.model_path.clone())
        .or_else(|| {
            config
                .defaults
                .model_dir
                .as_deref()
                .and_then(locator::find_preferred_model)
        })
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve_ipc(ipc: &MlIpc) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    info!("[IPC] Serving requests on stdin");
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = ipc.handle_line(&line).await;
        stdout.write_all(format!("{reply}\n").as_bytes()).await?;
        stdout.flush().await?;
    }
    info!("[IPC] stdin closed");
    Ok(())
}

fn settings_command(store: &SettingsStore, action: SettingsAction) -> anyhow::Result<()> {
    match action {
        SettingsAction::Get => print_json(&store.get()),
        SettingsAction::Reset => print_json(&store.reset()?),
        SettingsAction::Export { path } => {
            store.export(&path)?;
            println!("Exported settings to {}", path.display());
            Ok(())
        }
        SettingsAction::Import { path } => print_json(&store.import(&path)?),
    }
}

async fn run_command(
    controller: &Controller,
    model: &Path,
    prompt: &str,
    options: GenerationOptions,
    tuning: ModelTuning,
) -> anyhow::Result<String> {
    let report = controller.switch_model(model, tuning).await?;
    info!(
        "Loaded {} on {}",
        report.model_path.display(),
        report.backend
    );
    Ok(controller.run(prompt, options).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let store = SettingsStore::new(
        cli.settings
            .clone()
            .unwrap_or_else(SettingsStore::default_location),
    );
    let settings = store.get();
    if let Err(e) = logger::setup_logging(&settings.logging, &cli.log_dir) {
        eprintln!("Failed to set up logging: {e}");
    }
    let config = ControllerConfig::from_env();

    match cli.command {
        Commands::List { dir } => {
            let root = dir
                .or_else(|| settings.model_dir.clone())
                .or_else(|| config.defaults.model_dir.clone());
            let Some(root) = root else {
                bail!("No model directory: pass DIR, set model_dir in settings, or set MODEL_DIR");
            };
            print_json(&locator::list_models(&root))
        }
        Commands::Pick { dir } => match locator::find_preferred_model(&dir) {
            Some(path) => {
                println!("{}", path.display());
                Ok(())
            }
            None => bail!("No .gguf model found under {}", dir.display()),
        },
        Commands::Settings { action } => settings_command(&store, action),
        Commands::Status => {
            let controller = start_controller(config.clone())?;
            if config.auto_load_model {
                if let Err(e) = controller.initialize(settings.model_dir.as_deref()).await {
                    warn!("Auto-load failed: {e}");
                }
            }
            let status = controller.status().await;
            controller.terminate().await;
            print_json(&status)
        }
        Commands::Run {
            prompt,
            model,
            max_tokens,
            temperature,
            top_p,
            stop,
            ctx,
            gpu_layers,
            threads,
        } => {
            let Some(model) = resolve_model(model, &settings, &config) else {
                bail!("No model: pass --model, set model_path or model_dir in settings, or set LLAMA_MODEL_PATH / MODEL_DIR");
            };
            let defaults = settings.generation_options();
            let options = GenerationOptions {
                max_tokens: max_tokens.or(defaults.max_tokens),
                temperature: temperature.or(defaults.temperature),
                top_p: top_p.or(defaults.top_p),
                stop: if stop.is_empty() { defaults.stop } else { Some(stop) },
            };
            let base = settings.model_tuning();
            let tuning = ModelTuning {
                context_size: ctx.or(base.context_size),
                gpu_layers: gpu_layers.or(base.gpu_layers),
                threads: threads.or(base.threads),
            };

            let controller = start_controller(config)?;
            let result = run_command(&controller, &model, &prompt, options, tuning).await;
            controller.terminate().await;
            println!("{}", result?);
            Ok(())
        }
        Commands::Ipc => {
            let controller = start_controller(config)?;
            let init = Arc::clone(&controller);
            let hint = settings.model_dir.clone();
            tokio::spawn(async move {
                if let Err(e) = init.initialize(hint.as_deref()).await {
                    warn!("Auto-load failed: {e}");
                }
            });
            let ipc = MlIpc::new(Arc::clone(&controller), store);
            let served = serve_ipc(&ipc).await;
            controller.terminate().await;
            served
        }
    }
}
