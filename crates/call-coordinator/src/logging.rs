//! `tracing` subscriber setup for hosts and demos

use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{CoordinatorError, CoordinatorResult};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// Emit JSON lines instead of the human format
    pub json: bool,
    pub file_info: bool,
    pub log_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        Self { level, ..Default::default() }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }
}

/// Install a global fmt subscriber.
///
/// Returns `false` when a subscriber was already installed; that one is kept.
pub fn setup_logging(config: LoggingConfig) -> bool {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());
    let span_events = if config.log_spans { FmtSpan::ACTIVE } else { FmtSpan::NONE };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        tracing::info!("callsync logging initialized v{}", crate::VERSION);
    }
    installed
}

pub fn parse_log_level(level: &str) -> CoordinatorResult<Level> {
    Level::from_str(level).map_err(|_| CoordinatorError::config("log_level", format!("invalid level: {}", level)))
}
