//! Structured tracing for the call path
//!
//! Design:
//! - One `tracing` target per subsystem (`ffi`, `marshal`, `objects`, `closure`, `engine`)
//! - Every helper emits an `event = "..."` field so logs can be filtered by kind
//! - The subscriber is installed once; hosts that bring their own win
//! - File output goes through a non-blocking appender whose guard the caller keeps

use crate::config::LoggingConfig;
use crate::error::ArgumentWarning;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Directive prefixes the default filter covers
const TARGETS: [&str; 6] = ["callgate", "ffi", "marshal", "objects", "closure", "engine"];

/// Subscriber settings
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub level: Level,
    /// Write to this file instead of stderr
    pub file: Option<PathBuf>,
    pub json: bool,
    /// Emit span enter/close lines (one per foreign call)
    pub span_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: Level::INFO, file: None, json: false, span_events: false }
    }
}

impl LogConfig {
    /// Read `CALLGATE_LOG_LEVEL`, `CALLGATE_LOG_FILE`, `CALLGATE_LOG_JSON` and `CALLGATE_LOG_SPANS`
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self {
            level: var("CALLGATE_LOG_LEVEL").map(|l| parse_level(&l)).unwrap_or(Level::INFO),
            file: var("CALLGATE_LOG_FILE").map(PathBuf::from),
            json: var("CALLGATE_LOG_JSON").is_some(),
            span_events: var("CALLGATE_LOG_SPANS").is_some(),
        }
    }

    /// Everything at trace, with call spans
    pub fn verbose() -> Self {
        Self { level: Level::TRACE, span_events: true, ..Self::default() }
    }
}

impl From<&LoggingConfig> for LogConfig {
    fn from(section: &LoggingConfig) -> Self {
        Self {
            level: parse_level(&section.level),
            file: section.file.clone(),
            json: section.json,
            span_events: section.span_events,
        }
    }
}

fn parse_level(s: &str) -> Level {
    s.trim().parse().unwrap_or(Level::INFO)
}

fn default_filter(level: Level) -> EnvFilter {
    let level = level.as_str().to_ascii_lowercase();
    let directives = TARGETS.map(|target| format!("{target}={level}")).join(",");
    EnvFilter::new(directives)
}

/// Split a log path into the appender's directory and file name
fn appender_parts(path: &Path) -> (PathBuf, PathBuf) {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("callgate.log"));
    (dir, name)
}

/// Install the subscriber from `CALLGATE_LOG_*`
pub fn init() -> Option<WorkerGuard> {
    init_with_config(LogConfig::from_env())
}

/// Install the subscriber
///
/// Only the first call has any effect. `RUST_LOG` overrides the level when
/// set. Dropping the returned guard flushes and stops file output.
pub fn init_with_config(config: LogConfig) -> Option<WorkerGuard> {
    let mut guard = None;
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config.level));
        let spans = if config.span_events { FmtSpan::ENTER | FmtSpan::CLOSE } else { FmtSpan::NONE };

        let writer = match &config.file {
            Some(path) => {
                let (dir, name) = appender_parts(path);
                let (writer, worker) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
                guard = Some(worker);
                BoxMakeWriter::new(writer)
            }
            None => BoxMakeWriter::new(std::io::stderr),
        };

        let base = fmt::layer().with_writer(writer).with_span_events(spans).with_target(true);
        let layer = if config.json {
            base.json().boxed()
        } else {
            base.with_ansi(config.file.is_none()).with_line_number(cfg!(debug_assertions)).boxed()
        };

        // A host that already installed a subscriber keeps it.
        let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
    });
    guard
}

pub fn is_initialized() -> bool {
    INSTALLED.get().is_some()
}

/// A foreign call is about to be made; `verbose` raises it to debug
pub fn log_ffi_call(function: &str, args: usize, verbose: bool) {
    if verbose {
        debug!(target: "ffi", event = "ffi_call", function, args, "calling");
    } else {
        trace!(target: "ffi", event = "ffi_call", function, args, "calling");
    }
}

pub fn log_ffi_return(function: &str, results: usize) {
    trace!(target: "ffi", event = "ffi_return", function, results, "returned");
}

pub fn log_ffi_error(function: &str, error: &str) {
    debug!(target: "ffi", event = "ffi_error", function, error, "call failed");
}

pub fn log_argument_warning(warning: &ArgumentWarning) {
    warn!(target: "marshal", event = "argument_warning", %warning);
}

pub fn log_proxy_created(address: usize, ty: &str, handler: &str, alias: bool) {
    trace!(
        target: "objects",
        event = "proxy_created",
        address = %format_args!("{address:#x}"),
        ty,
        handler,
        alias
    );
}

pub fn log_proxy_finalized(address: usize, ty: &str, remaining_aliases: bool) {
    trace!(
        target: "objects",
        event = "proxy_finalized",
        address = %format_args!("{address:#x}"),
        ty,
        remaining_aliases
    );
}

pub fn log_closure_bound(function: &str, ty: &str) {
    debug!(target: "closure", event = "closure_bound", function, ty);
}

/// Native code called a trampoline whose closure is gone
pub fn log_closure_stale(function: &str) {
    error!(target: "closure", event = "closure_stale", function, "finalized closure invoked from native code");
}

/// Timing of coarse engine operations
pub mod perf {
    use std::time::Instant;

    /// Logs `operation` with its elapsed time when dropped
    #[must_use]
    pub struct Timed {
        operation: &'static str,
        subject: String,
        started: Instant,
    }

    pub fn track(operation: &'static str, subject: impl Into<String>) -> Timed {
        Timed { operation, subject: subject.into(), started: Instant::now() }
    }

    impl Drop for Timed {
        fn drop(&mut self) {
            tracing::debug!(
                target: "engine",
                event = self.operation,
                subject = %self.subject,
                elapsed_us = self.started.elapsed().as_micros() as u64
            );
        }
    }
}
