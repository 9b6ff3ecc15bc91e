//! Logging utilities with structured JSON output support.
//!
//! Supports both human-readable and JSON log formats for log aggregation.

use crate::distributed::DistributedContext;
use std::fmt;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

/// Logging format options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    /// Human-readable format (default)
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact single-line format
    Compact,
}

impl LogFormat {
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Initialize logging with the default pretty format.
pub fn init_logging() {
    init_logging_with_format(LogFormat::Pretty);
}

/// Initialize logging with the specified format.
///
/// Set `RUST_LOG` environment variable to control log level.
/// Panics if a global subscriber is already installed; see
/// [`try_init_logging_with_format`].
pub fn init_logging_with_format(format: LogFormat) {
    if try_init_logging_with_format(format).is_err() {
        panic!("a global tracing subscriber is already installed");
    }
}

/// Like [`init_logging_with_format`] but reports a second initialisation
/// (common in tests) as an error instead of panicking.
pub fn try_init_logging_with_format(
    format: LogFormat,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            subscriber_fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .try_init()
        }
        LogFormat::Json => {
            subscriber_fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .flatten_event(true)
                .try_init()
        }
        LogFormat::Compact => {
            subscriber_fmt()
                .with_env_filter(filter)
                .compact()
                .with_target(false)
                .try_init()
        }
    }
}

/// Initialize logging based on environment variables.
///
/// Checks `SPMD_LOG_FORMAT` for format selection:
/// - "json" -> JSON format
/// - "compact" -> Compact format
/// - anything else -> Pretty format (default)
pub fn init_logging_from_env() {
    let format = std::env::var("SPMD_LOG_FORMAT")
        .map(|s| LogFormat::from_name(&s))
        .unwrap_or(LogFormat::Pretty);

    init_logging_with_format(format);
}

/// Prefix `msg` with this rank's coordinates, e.g. `[rank_5_pp1_tp1_dp0] msg`.
///
/// Every rank logs the same lines in SPMD, so the prefix is what tells them
/// apart.
pub fn rmsg(ctx: &DistributedContext, msg: impl fmt::Display) -> String {
    format!(
        "[rank_{}_pp{}_tp{}_dp{}] {}",
        ctx.rank(),
        ctx.pp_rank(),
        ctx.tp_rank(),
        ctx.dp_rank(),
        msg
    )
}
