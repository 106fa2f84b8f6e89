//! Tracing/logging configuration for coderun
//!
//! Supports:
//! - Multiple verbosity levels: default (WARN), verbose (INFO), debug (DEBUG), quiet (ERROR), silent (off)
//! - Pretty (colored), JSON or compact output formats
//! - File logging at DEBUG level while terminal shows configured level

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer, Registry,
};

/// Log output format
#[derive(Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Colored human-readable output
    #[default]
    Pretty,
    /// Structured JSON output (one JSON object per line)
    Json,
    /// Compact single-line format
    Compact,
}

/// Tracing configuration built from CLI args
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Verbose mode (INFO level)
    pub verbose: bool,
    /// Debug mode (DEBUG level)
    pub debug: bool,
    /// Quiet mode (ERROR only)
    pub quiet: bool,
    /// Silent mode (no terminal output)
    pub silent: bool,
    /// Output format
    pub format: LogFormat,
    /// Optional log file path (writes DEBUG+ regardless of terminal level)
    pub log_file: Option<PathBuf>,
}

impl TracingConfig {
    /// Terminal level, `None` when silent
    fn terminal_level(&self) -> Option<Level> {
        if self.silent {
            None
        } else if self.quiet {
            Some(Level::ERROR)
        } else if self.debug {
            Some(Level::DEBUG)
        } else if self.verbose {
            Some(Level::INFO)
        } else {
            Some(Level::WARN)
        }
    }

    fn level_specified(&self) -> bool {
        self.verbose || self.debug || self.quiet || self.silent
    }
}

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Boxed layer type alias for Registry
type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn crate_filter(level: Level) -> EnvFilter {
    EnvFilter::new(format!("coderun={},warn", level.as_str().to_lowercase()))
}

/// CLI flags take precedence over RUST_LOG
fn terminal_filter(level: Level, cli_specified: bool) -> EnvFilter {
    if cli_specified {
        crate_filter(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| crate_filter(level))
    }
}

/// Create a boxed terminal layer with the given format and filter
fn make_terminal_layer(format: &LogFormat, filter: EnvFilter) -> BoxedLayer {
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
    }
}

fn make_file_layer(file: std::fs::File) -> BoxedLayer {
    fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(file)
        .with_filter(crate_filter(Level::DEBUG))
        .boxed()
}

/// Initialize tracing with the given configuration.
///
/// This should be called early in main() after CLI args are parsed.
/// If called multiple times, subsequent calls are ignored.
pub fn init_tracing(config: TracingConfig) {
    if TRACING_INITIALIZED.set(()).is_err() {
        return;
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if let Some(log_path) = &config.log_file {
        match std::fs::File::create(log_path) {
            Ok(file) => layers.push(make_file_layer(file)),
            // Fall through to terminal-only logging
            Err(e) => eprintln!("Warning: Failed to create log file {:?}: {}", log_path, e),
        }
    }

    if let Some(level) = config.terminal_level() {
        let filter = terminal_filter(level, config.level_specified());
        layers.push(make_terminal_layer(&config.format, filter));
    }

    if layers.is_empty() {
        // Silent mode with no file - install a no-op subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
    } else {
        let _ = tracing_subscriber::registry().with(layers).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_default() {
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
        let parsed: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(parsed, LogFormat::Json);
    }

    #[test]
    fn test_terminal_level_precedence() {
        let mut config = TracingConfig::default();
        assert_eq!(config.terminal_level(), Some(Level::WARN));
        assert!(!config.level_specified());

        config.verbose = true;
        assert_eq!(config.terminal_level(), Some(Level::INFO));
        config.debug = true;
        assert_eq!(config.terminal_level(), Some(Level::DEBUG));
        config.quiet = true;
        assert_eq!(config.terminal_level(), Some(Level::ERROR));
        config.silent = true;
        assert_eq!(config.terminal_level(), None);
        assert!(config.level_specified());
    }
}
