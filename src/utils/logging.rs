use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{fmt, fmt::format::FmtSpan, EnvFilter};

static INIT: Once = Once::new();

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level
    pub level: Level,
    /// Whether to include timestamps
    pub timestamps: bool,
    /// Whether to include thread ids
    pub thread_ids: bool,
    /// Whether to include source code locations
    pub source_location: bool,
    /// Whether to log span open/close events
    pub log_spans: bool,
    /// Output file path (None for stderr)
    pub file_path: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            timestamps: true,
            thread_ids: false,
            source_location: false,
            log_spans: false,
            file_path: None,
        }
    }
}

/// Initialize the global subscriber; later calls are no-ops
pub fn setup_logging(config: LogConfig) -> Result<(), String> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = setup_logging_internal(config);
    });

    result
}

fn setup_logging_internal(config: LogConfig) -> Result<(), String> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_thread_ids(config.thread_ids)
        .with_target(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(if config.log_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    match (config.file_path, config.timestamps) {
        (Some(path), timestamps) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| format!("Failed to open log file: {}", e))?;
            let builder = builder.with_writer(std::sync::Mutex::new(file)).with_ansi(false);
            if timestamps {
                builder.try_init()
            } else {
                builder.without_time().try_init()
            }
        }
        (None, true) => builder.with_writer(std::io::stderr).try_init(),
        (None, false) => builder.with_writer(std::io::stderr).without_time().try_init(),
    }
    .map_err(|e| format!("Failed to set global subscriber: {}", e))
}
