use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use llama_desk_config::settings::LoggingSettings;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Parse a level name, falling back to `Info`.
pub fn level_filter(level: &str) -> LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// `<log_dir>/<YYYY-mm-dd-HH_MM>.log`
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    log_dir.join(format!("{timestamp}.log"))
}

/// Build the log4rs config. The console appender writes to stderr so stdout
/// stays free for command output.
pub fn build_config(
    settings: &LoggingSettings,
    log_dir: &Path,
) -> Result<Config, Box<dyn std::error::Error>> {
    let mut builder = Config::builder();
    let mut root = Root::builder();

    if settings.enable_file_logging {
        fs::create_dir_all(log_dir)?;
        let file_appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(log_file_path(log_dir))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file_appender)));
        root = root.appender("file");
    }
    if settings.log_to_console {
        let console = ConsoleAppender::builder()
            .target(Target::Stderr)
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
    }

    Ok(builder.build(root.build(level_filter(&settings.level)))?)
}

pub fn setup_logging(
    settings: &LoggingSettings,
    log_dir: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(settings, log_dir)?;
    log4rs::init_config(config)?;
    Ok(())
}
