/*!
 * Diagnostic logging
 *
 * Progress lines own stdout, so log records never go there. Interactive runs
 * log compactly to stderr; `--log-file` appends JSON records to a file so
 * several invocations against the same graph can be read back in order.
 */

use std::fs::OpenOptions;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogLevel;
use crate::error::{ConcertError, Result};

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `level`; `verbose` forces debug.
pub fn init_logging(level: LogLevel, verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let log_level = if verbose {
        Level::DEBUG
    } else {
        level.to_tracing_level()
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directive(log_level)))
        .map_err(|e| ConcertError::Config(format!("Failed to create log filter: {}", e)))?;

    match log_file {
        Some(path) => init_file_logging(path, env_filter)?,
        None => init_stderr_logging(env_filter),
    }

    Ok(())
}

/// Filter covering the launcher and its channel interface crate
fn filter_directive(level: Level) -> String {
    format!("concert={},concert_core_interface={}", level, level)
}

fn init_stderr_logging(env_filter: EnvFilter) {
    // Messages already carry their `[host]` prefix
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(console::Term::stderr().features().colors_supported())
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = open_log_file(log_path)?;

    // SSH commands run on the blocking pool; thread ids tell concurrent ones apart
    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}

fn open_log_file(log_path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| ConcertError::Config(format!("Failed to open log file {}: {}", log_path.display(), e)))
}
