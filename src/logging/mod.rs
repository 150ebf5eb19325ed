//! Logging infrastructure - structured tracing for the native call engine
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels via environment
//! - Zero-cost when disabled
//! - Console or file output, human-readable or JSON

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Set once the subscriber is installed; holds the file writer guard if any
static LOGGER: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path (console output when unset)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // TYPTHON_NFI_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("TYPTHON_NFI_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        // TYPTHON_NFI_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("TYPTHON_NFI_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("TYPTHON_NFI_LOG_JSON").is_ok();
        config.show_spans = std::env::var("TYPTHON_NFI_LOG_SPANS").is_ok();

        config
    }

    /// Verbose config for debugging marshalling issues
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: None,
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration (idempotent)
pub fn init_with_config(config: LogConfig) {
    LOGGER.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "typthon_nfi={}",
                config.level.as_str().to_lowercase()
            ))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (writer, guard) = match config.log_path.as_deref().map(Path::new) {
            Some(path) => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let file = path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "typthon_nfi.log".to_string());
                let (non_blocking, guard) =
                    tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
                (BoxMakeWriter::new(non_blocking), Some(guard))
            }
            None => (BoxMakeWriter::new(io::stderr), None),
        };

        let layer = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(span_events)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
                .boxed()
        };

        // Another subscriber may already be installed by the host runtime
        let _ = tracing_subscriber::registry()
            .with(layer)
            .with(env_filter)
            .try_init();

        guard
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER.get().is_some()
}

// ============================================================================
// Engine-specific logging functions
// ============================================================================

/// Log a freshly compiled signature
pub fn log_signature_compiled(signature: &str, primitive_size: usize, object_slots: usize) {
    use tracing::debug;
    debug!(
        event = "signature_compiled",
        signature = signature,
        primitive_size = primitive_size,
        object_slots = object_slots,
        "Signature compiled"
    );
}

/// Log an outbound native call
#[inline]
pub fn log_native_call(signature: &str, address: usize, arg_count: usize) {
    use tracing::debug;
    debug!(
        event = "native_call",
        signature = signature,
        address = address,
        args = arg_count,
        "Native function called"
    );
}

/// Log a trampoline allocation
pub fn log_closure_allocated(code: usize, signature: &str) {
    use tracing::debug;
    debug!(
        event = "closure_allocated",
        code = code,
        signature = signature,
        "Closure trampoline allocated"
    );
}

/// Log a trampoline leaving the lookup map
pub fn log_closure_unregistered(code: usize) {
    use tracing::debug;
    debug!(
        event = "closure_unregistered",
        code = code,
        "Closure removed from lookup map"
    );
}

/// Log a destructor run by a reaper or teardown
#[inline]
pub fn log_reclaimed(queue: &str, id: u64) {
    use tracing::trace;
    trace!(
        event = "native_reclaimed",
        queue = queue,
        allocation = id,
        "Native allocation reclaimed"
    );
}

/// Log an error swallowed at the native boundary
pub fn log_callback_error(code: usize, error: &str) {
    use tracing::error;
    error!(
        event = "callback_error",
        code = code,
        error = error,
        "Closure invocation failed"
    );
}

/// Log context teardown
pub fn log_context_disposed(context: u64, closures: usize, allocations: usize) {
    use tracing::info;
    info!(
        event = "context_disposed",
        context = context,
        closures = closures,
        allocations = allocations,
        "Native context disposed"
    );
}
