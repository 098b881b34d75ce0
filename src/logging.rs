//! Tracing setup for the `folio` binary.
//!
//! stderr always; when a log directory is configured, a daily-rolling
//! `folio.log` with everything the filter admits plus `folio-error.log`
//! with ERROR events only.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const DEFAULT_LOG_FILTER: &str = "folio=info";

/// Keeps the non-blocking file writers flushing. Hold until exit.
#[must_use = "dropping the guards stops file logging"]
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("folio=debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

pub fn init_logging(log_dir: Option<&Path>, verbose: bool) -> io::Result<LogGuards> {
    let mut guards = Vec::new();

    let (file_layer, error_layer) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let (file_writer, file_guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "folio.log"));
            let (error_writer, error_guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::daily(dir, "folio-error.log"),
            );
            guards.push(file_guard);
            guards.push(error_guard);
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_writer)
                        .with_ansi(false)
                        .with_filter(env_filter(verbose)),
                ),
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(error_writer)
                        .with_ansi(false)
                        .with_filter(LevelFilter::ERROR),
                ),
            )
        }
        None => (None, None),
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(env_filter(verbose));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(error_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    Ok(LogGuards { _guards: guards })
}
