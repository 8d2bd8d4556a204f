//! Tracing setup for applications embedding the cora runtime.
//!
//! Components log through `tracing` with structured fields such as
//! `session`, `tran_no`, `broker` and `table`. This module only installs a
//! subscriber: verbosity-derived `EnvFilter` (overridable through `RUST_LOG`),
//! text or JSON formatting, stderr or an append-mode file.

use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Map a verbosity count to a level name (0=error ... 4+=trace).
fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

fn default_filter(verbosity: u8) -> EnvFilter {
    let level = level_for(verbosity);
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cora_core={level},cora_client={level}")))
}

/// Initialize the logging system.
///
/// # Arguments
///
/// * `verbosity` - Verbosity level (0=error, 1=warn, 2=info, 3=debug, 4+=trace)
/// * `log_file` - Optional path to append logs to instead of stderr
/// * `format` - Output format (text or JSON)
///
/// # Example
///
/// ```ignore
/// use cora_core::logging::{init_logging, LogFormat};
///
/// init_logging(2, None, LogFormat::Text)?;
/// init_logging(3, Some(Path::new("/tmp/cora.log")), LogFormat::Json)?;
/// ```
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let detailed = verbosity >= 3;

    let layer: BoxedLayer = match (log_file, format) {
        (None, LogFormat::Text) => fmt::layer()
            .with_target(true)
            .with_file(detailed)
            .with_line_number(detailed)
            .boxed(),
        (None, LogFormat::Json) => fmt::layer().json().boxed(),
        (Some(path), format) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let writer = Mutex::new(file);
            match format {
                LogFormat::Text => fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(detailed)
                    .with_line_number(detailed)
                    .boxed(),
                LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
            }
        }
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(default_filter(verbosity))
        .try_init()
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))
}

/// Initialize logging with defaults for testing.
///
/// Ignores the error returned when a subscriber is already installed.
pub fn init_test_logging() {
    let _ = init_logging(2, None, LogFormat::Text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_default() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for(0), "error");
        assert_eq!(level_for(2), "info");
        assert_eq!(level_for(3), "debug");
        assert_eq!(level_for(9), "trace");
    }

    #[test]
    fn repeated_test_init_is_harmless() {
        init_test_logging();
        init_test_logging();
    }
}
