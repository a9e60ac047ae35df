//! Structured logging initialization.
//!
//! `tracing` + `tracing-subscriber` with a selectable pretty/compact/JSON
//! output format and idempotent initialization (a second `init` call, e.g.
//! from a re-exec'd child process sharing the same binary, is not an
//! error).

use crate::config::Settings;
use tracing::Level;
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Selectable output shape, matching `tracing_v4.rs`'s `OutputFormat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed, colorized, for interactive use.
    Pretty,
    /// Compact, uncolored, for production stdout/file logs.
    Compact,
    /// JSON, for log aggregation pipelines.
    Json,
}

/// Tracing initialization options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Minimum level to emit.
    pub level: Level,
    /// Output shape.
    pub format: OutputFormat,
    /// Include ENTER/CLOSE span events.
    pub with_span_events: bool,
    /// Include file/line in each event.
    pub with_file_and_line: bool,
    /// Enable ANSI colors (Pretty format only).
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: true,
            with_file_and_line: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Build from a loaded [`Settings`]'s `application.log_level`.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        let level = parse_log_level(&settings.application.log_level)?;
        Ok(Self { level, ..Default::default() })
    }

    /// Start from an explicit level with all other fields defaulted.
    pub fn new(level: Level) -> Self {
        Self { level, ..Default::default() }
    }

    /// Override the minimum level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Override the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Override ANSI color use.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from a loaded [`Settings`].
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(TracingConfig::from_settings(settings)?)
}

/// Initialize tracing with explicit configuration. Idempotent: a second call
/// (e.g. from a `run-component` child process re-execing the same binary)
/// returns `Ok(())` instead of erroring on "already initialized".
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE };

    let result = match config.format {
        OutputFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_ansi(config.with_ansi)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_ansi(false)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
    };

    result.or_else(|err| {
        if err.to_string().contains("a global default trace dispatcher has already been set") {
            Ok(())
        } else {
            Err(format!("failed to initialize tracing: {err}"))
        }
    })
}

/// Parse a level name (case-insensitive). Exposed so callers overriding a
/// loaded config's level (e.g. a `--log-level` CLI flag) can reuse the same
/// parsing `from_settings` applies, without having to build a throwaway
/// [`Settings`] just to route through it.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!("invalid log level '{level}', must be one of: trace, debug, info, warn, error")),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_level_is_case_insensitive() {
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("nonsense").is_err());
    }

    #[test]
    fn builder_overrides_apply() {
        let config = TracingConfig::new(Level::WARN).with_format(OutputFormat::Json).with_ansi(false);
        assert!(matches!(config.level, Level::WARN));
        assert!(matches!(config.format, OutputFormat::Json));
        assert!(!config.with_ansi);
    }
}
