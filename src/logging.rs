//! Structured logging and tracing for Talos
//!
//! Builds the tracing subscriber stack from [`LoggingConfig`]: a rolling
//! daily log file, optional console output and a broadcast channel that
//! feeds the web UI's live log stream. Each sink can run at its own level.

use crate::config::LoggingConfig;
use crate::error::{Result, TalosError};
use once_cell::sync::OnceCell;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Once;
use std::sync::RwLock as StdRwLock;
use tokio::sync::broadcast;
use tracing::{Level, debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

// Keep the non-blocking worker guard alive for the entire process lifetime
static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INIT_ONCE: Once = Once::new();
static INIT_ERROR: OnceCell<String> = OnceCell::new();
static LOG_BROADCAST_TX: OnceCell<broadcast::Sender<String>> = OnceCell::new();
static WEB_LOG_LEVEL: OnceCell<StdRwLock<Level>> = OnceCell::new();

/// Everything below the global env filter runs over this subscriber
type BaseSubscriber = Layered<EnvFilter, Registry>;

#[derive(Clone)]
struct BroadcastMakeWriter {
    tx: broadcast::Sender<String>,
}

struct BroadcastWriter {
    tx: broadcast::Sender<String>,
    buffer: Vec<u8>,
}

impl<'a> MakeWriter<'a> for BroadcastMakeWriter {
    type Writer = BroadcastWriter;
    fn make_writer(&'a self) -> Self::Writer {
        BroadcastWriter {
            tx: self.tx.clone(),
            buffer: Vec::with_capacity(256),
        }
    }
}

impl Write for BroadcastWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BroadcastWriter {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut line = String::from_utf8_lossy(&self.buffer).to_string();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        let _ = self.tx.send(line);
    }
}

fn get_or_init_log_tx() -> broadcast::Sender<String> {
    LOG_BROADCAST_TX
        .get_or_init(|| {
            let (tx, _rx) = broadcast::channel::<String>(1024);
            tx
        })
        .clone()
}

/// Build one formatting layer over a writer, honoring the JSON switch
fn sink_layer<W>(
    writer: W,
    json_format: bool,
    level: LevelFilter,
) -> Box<dyn Layer<BaseSubscriber> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false);
    if json_format {
        base.json().with_filter(level).boxed()
    } else {
        base.with_filter(level).boxed()
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    INIT_ONCE.call_once(|| {
        let init_result = build_subscriber(config);
        if let Err(e) = init_result {
            let _ = INIT_ERROR.set(e.to_string());
        }
    });

    if let Some(err) = INIT_ERROR.get() {
        return Err(TalosError::config(err.clone()));
    }
    Ok(())
}

fn build_subscriber(config: &LoggingConfig) -> Result<()> {
    let base_level = parse_log_level(&config.level)?;
    let console_level = config
        .console_level
        .as_ref()
        .and_then(|s| parse_log_level(s).ok())
        .unwrap_or(base_level);
    let file_level = config
        .file_level
        .as_ref()
        .and_then(|s| parse_log_level(s).ok())
        .unwrap_or(base_level);
    let web_level = config
        .web_level
        .as_ref()
        .and_then(|s| parse_log_level(s).ok())
        .unwrap_or(base_level);

    // The env filter must pass the most verbose sink; the per-layer
    // filters then narrow each sink back down
    let most_verbose = min_level(min_level(console_level, file_level), web_level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("talos={most_verbose},zbus=warn").into());

    let console_only = should_use_console_only();
    let mut layers: Vec<Box<dyn Layer<BaseSubscriber> + Send + Sync>> = Vec::new();

    if !console_only {
        let file_appender = rolling::Builder::new()
            .rotation(rolling::Rotation::DAILY)
            .filename_prefix("talos")
            .filename_suffix("log")
            .max_log_files(config.backup_count as usize)
            .build({
                // config.file may name a file or a directory
                let p = Path::new(&config.file);
                if p.extension().is_some() {
                    p.parent().unwrap_or(p)
                } else {
                    p
                }
            })
            .map_err(|e| TalosError::io(format!("Failed to create log file appender: {e}")))?;
        let (non_blocking_appender, guard) = non_blocking(file_appender);
        let _ = LOG_GUARD.set(guard);
        layers.push(sink_layer(
            non_blocking_appender,
            config.json_format,
            LevelFilter::from_level(file_level),
        ));
    }

    if console_only || config.console_output {
        layers.push(sink_layer(
            io::stdout,
            config.json_format,
            LevelFilter::from_level(console_level),
        ));
    }

    // The broadcast sink always captures everything; the web SSE endpoint
    // applies the runtime web level per line
    layers.push(sink_layer(
        BroadcastMakeWriter {
            tx: get_or_init_log_tx(),
        },
        config.json_format,
        LevelFilter::TRACE,
    ));

    tracing_subscriber::registry().with(filter).with(layers).init();
    let _ = WEB_LOG_LEVEL.set(StdRwLock::new(web_level));

    info!(
        "Logging initialized - console_level: {:?}, file_level: {:?}, web_level: {:?}",
        console_level, file_level, web_level
    );
    Ok(())
}

fn should_use_console_only() -> bool {
    cfg!(test) || std::env::var_os("TALOS_DISABLE_FILE_LOG").is_some()
}

/// Parse log level string to tracing Level
fn parse_log_level(level_str: &str) -> Result<Level> {
    match level_str.to_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        _ => Err(TalosError::config(format!(
            "Invalid log level: {level_str}"
        ))),
    }
}

/// Context information for log messages
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component name (e.g., "engine", "dbus", "web")
    pub component: String,

    /// Device instance for multi-controller setups
    pub device_instance: Option<u32>,

    /// Additional context fields
    pub extra_fields: std::collections::HashMap<String, String>,
}

impl LogContext {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            device_instance: None,
            extra_fields: std::collections::HashMap::new(),
        }
    }

    pub fn with_device_instance(mut self, device_instance: u32) -> Self {
        self.device_instance = Some(device_instance);
        self
    }

    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

/// Structured logger with context
#[derive(Clone)]
pub struct StructuredLogger {
    context: LogContext,
}

impl StructuredLogger {
    pub fn new(context: LogContext) -> Self {
        Self { context }
    }

    pub fn info(&self, message: &str) {
        let fields = self.format_fields();
        info!(%fields, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        let fields = self.format_fields();
        warn!(%fields, "{}", message);
    }

    pub fn error(&self, message: &str) {
        let fields = self.format_fields();
        error!(%fields, "{}", message);
    }

    pub fn debug(&self, message: &str) {
        let fields = self.format_fields();
        debug!(%fields, "{}", message);
    }

    pub fn trace(&self, message: &str) {
        let fields = self.format_fields();
        trace!(%fields, "{}", message);
    }

    fn format_fields(&self) -> String {
        let mut fields = vec![format!("component={}", self.context.component)];

        if let Some(device_instance) = self.context.device_instance {
            fields.push(format!("device_instance={device_instance}"));
        }

        for (key, value) in &self.context.extra_fields {
            fields.push(format!("{key}={value}"));
        }

        fields.join(",")
    }
}

/// Create a logger for a specific component
pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}

/// Create a logger with full context
pub fn get_logger_with_context(context: LogContext) -> StructuredLogger {
    StructuredLogger::new(context)
}

/// Shutdown logging system gracefully
pub fn shutdown() {
    // The non-blocking worker guard flushes on process exit
}

/// Subscribe to a stream of formatted log lines
pub fn subscribe_log_lines() -> broadcast::Receiver<String> {
    get_or_init_log_tx().subscribe()
}

/// Initialize or update the runtime web log level
pub fn set_web_log_level(new_level: Level) {
    if let Some(lock) = WEB_LOG_LEVEL.get() {
        if let Ok(mut guard) = lock.write() {
            *guard = new_level;
        }
    } else {
        let _ = WEB_LOG_LEVEL.set(StdRwLock::new(new_level));
    }
}

/// Helper to parse and set from string
pub fn set_web_log_level_str(level_str: &str) -> Result<()> {
    let lvl = parse_log_level(level_str)?;
    set_web_log_level(lvl);
    Ok(())
}

/// Get the current runtime web log level. Defaults to INFO if unset.
pub fn get_web_log_level() -> Level {
    if let Some(lock) = WEB_LOG_LEVEL.get()
        && let Ok(guard) = lock.read()
    {
        *guard
    } else {
        Level::INFO
    }
}

fn level_rank(level: Level) -> u8 {
    match level {
        Level::TRACE => 0,
        Level::DEBUG => 1,
        Level::INFO => 2,
        Level::WARN => 3,
        Level::ERROR => 4,
    }
}

fn min_level(a: Level, b: Level) -> Level {
    if level_rank(a) <= level_rank(b) { a } else { b }
}

/// Try to parse a level out of a formatted log line
pub fn parse_line_level(line: &str) -> Option<Level> {
    const LEVELS: [(&str, Level); 5] = [
        ("TRACE", Level::TRACE),
        ("DEBUG", Level::DEBUG),
        ("INFO", Level::INFO),
        ("WARN", Level::WARN),
        ("ERROR", Level::ERROR),
    ];
    for (name, level) in LEVELS {
        // JSON format: ... "level":"INFO" ...
        if line.contains(&format!("\"level\":\"{name}\"")) {
            return Some(level);
        }
        // Plain format: timestamp SPACE LEVEL SPACE ...
        if line.contains(&format!(" {name} ")) {
            return Some(level);
        }
    }
    None
}

/// Whether a formatted line should reach the web SSE stream given the
/// current runtime web level
pub fn should_emit_to_web(line: &str) -> bool {
    let current = get_web_log_level();
    match parse_line_level(line) {
        Some(line_lvl) => level_rank(line_lvl) >= level_rank(current),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn init_test_logging() {
        INIT.call_once(|| {
            let config = LoggingConfig::default();
            init_logging(&config).ok();
        });
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("ERROR").unwrap(), Level::ERROR);
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_log_context() {
        let context = LogContext::new("test")
            .with_device_instance(1)
            .with_field("key", "value".to_string());

        assert_eq!(context.component, "test");
        assert_eq!(context.device_instance, Some(1));
        assert_eq!(context.extra_fields.get("key"), Some(&"value".to_string()));
    }

    #[test]
    fn test_structured_logger() {
        init_test_logging();

        let logger = get_logger("test_component");

        // These should not panic
        logger.info("Test info message");
        logger.debug("Test debug message");
        logger.warn("Test warning message");
        logger.error("Test error message");
    }

    #[test]
    fn test_get_logger() {
        let logger = get_logger("test_component");
        assert_eq!(logger.context.component, "test_component");
    }

    #[test]
    fn test_parse_line_level() {
        assert_eq!(
            parse_line_level("2024-01-01T00:00:00Z  INFO fields: ..."),
            Some(Level::INFO)
        );
        assert_eq!(
            parse_line_level("{\"timestamp\":\"...\",\"level\":\"WARN\"}"),
            Some(Level::WARN)
        );
        assert_eq!(parse_line_level("no level marker here"), None);
    }

    #[test]
    fn test_web_level_filtering() {
        set_web_log_level(Level::WARN);
        assert!(should_emit_to_web("ts ERROR something failed"));
        assert!(!should_emit_to_web("ts DEBUG chatter"));
        // Unparseable lines always pass
        assert!(should_emit_to_web("free-form line"));
        set_web_log_level(Level::INFO);
    }

    #[test]
    fn test_min_level_picks_most_verbose() {
        assert_eq!(min_level(Level::INFO, Level::DEBUG), Level::DEBUG);
        assert_eq!(min_level(Level::ERROR, Level::WARN), Level::WARN);
    }
}
