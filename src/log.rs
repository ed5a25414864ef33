//! Logging Infrastructure
//!
//! Fiber-aware logging for effects.
//!
//! The runtime treats its log sink as an opaque, fire-and-forget
//! [`Logger`]. Entries carry the logging fiber's id and its annotations,
//! which live in a fiber ref so that forked fibers inherit them and joined
//! children merge theirs back into the parent.
//!
//! # Features
//!
//! - **Log Levels**: Trace, Debug, Info, Warn, Error, filtered by
//!   `LogConfig::level` before reaching the sink
//! - **Annotations**: key-value pairs scoped to a region of an effect
//! - **Output Formats**: Plain text and JSON lines, written by
//!   [`WriterLogger`] in the format chosen by `LogConfig::format`
//!
//! # Example
//!
//! ```rust,ignore
//! use skein::Effect;
//!
//! let request = Effect::annotate(
//!     "request_id",
//!     "42",
//!     Effect::log("request started").zip_right(handle()),
//! );
//! ```

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::config::{LogFormat, LogLevel};
use crate::effect::op;
use crate::effect::Effect;
use crate::fiber::FiberId;
use crate::fiber_ref::FiberRef;
use crate::value::Value;

/// A log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Fiber that logged the entry.
    pub fiber_id: FiberId,
    /// Annotations in force when the entry was logged.
    pub annotations: BTreeMap<String, String>,
    /// Timestamp (Unix milliseconds).
    pub timestamp: u64,
}

impl LogEntry {
    /// Create a new log entry stamped with the current time.
    pub fn new(level: LogLevel, message: impl Into<String>, fiber_id: FiberId) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            level,
            message: message.into(),
            fiber_id,
            annotations: BTreeMap::new(),
            timestamp,
        }
    }

    /// Add an annotation.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// `[secs.millis] LEVEL (fiber) message {k=v, ...}`
    pub fn format_plain(&self) -> String {
        let mut line = format!(
            "[{}.{:03}] {:<5} ({}) {}",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.level.as_str().to_uppercase(),
            self.fiber_id,
            self.message
        );
        if !self.annotations.is_empty() {
            let pairs: Vec<String> = self
                .annotations
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            let _ = write!(line, " {{{}}}", pairs.join(", "));
        }
        line
    }

    /// One JSON object: timestamp, level, fiber, message and, when present,
    /// annotations.
    pub fn format_json(&self) -> String {
        let mut line = format!(
            "{{\"timestamp\":{},\"level\":\"{}\",\"fiber\":{},\"message\":\"{}\"",
            self.timestamp,
            self.level.as_str().to_uppercase(),
            self.fiber_id.as_u64(),
            JsonStr(&self.message)
        );
        if !self.annotations.is_empty() {
            let pairs: Vec<String> = self
                .annotations
                .iter()
                .map(|(key, value)| format!("\"{}\":\"{}\"", JsonStr(key), JsonStr(value)))
                .collect();
            let _ = write!(line, ",\"annotations\":{{{}}}", pairs.join(","));
        }
        line.push('}');
        line
    }

    pub fn format(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Plain => self.format_plain(),
            LogFormat::Json => self.format_json(),
        }
    }
}

/// Displays a string escaped for a JSON string literal.
struct JsonStr<'a>(&'a str);

impl fmt::Display for JsonStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '"' => f.write_str("\\\"")?,
                '\\' => f.write_str("\\\\")?,
                '\n' => f.write_str("\\n")?,
                '\r' => f.write_str("\\r")?,
                '\t' => f.write_str("\\t")?,
                c if c.is_control() => write!(f, "\\u{:04x}", c as u32)?,
                c => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Destination for log entries produced by effects.
pub trait Logger: Send + Sync + 'static {
    /// Record an entry. Must not block for long.
    fn log(&self, entry: &LogEntry);
}

/// Forwards entries to `tracing` events under the `skein::log` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, entry: &LogEntry) {
        let fiber = entry.fiber_id.as_u64();
        let annotations = if entry.annotations.is_empty() {
            String::new()
        } else {
            entry
                .annotations
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let message = entry.message.as_str();
        match entry.level {
            LogLevel::Off => {}
            LogLevel::Error => {
                tracing::error!(target: "skein::log", fiber, annotations = %annotations, "{}", message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: "skein::log", fiber, annotations = %annotations, "{}", message)
            }
            LogLevel::Info => {
                tracing::info!(target: "skein::log", fiber, annotations = %annotations, "{}", message)
            }
            LogLevel::Debug => {
                tracing::debug!(target: "skein::log", fiber, annotations = %annotations, "{}", message)
            }
            LogLevel::Trace => {
                tracing::trace!(target: "skein::log", fiber, annotations = %annotations, "{}", message)
            }
        }
    }
}

/// Writes one formatted line per entry to an `io::Write`.
pub struct WriterLogger {
    writer: Mutex<Box<dyn Write + Send>>,
    format: LogFormat,
}

impl WriterLogger {
    pub fn new(writer: impl Write + Send + 'static, format: LogFormat) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
            format,
        }
    }

    /// Lines go to standard error.
    pub fn stderr(format: LogFormat) -> Self {
        Self::new(io::stderr(), format)
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }
}

impl Logger for WriterLogger {
    fn log(&self, entry: &LogEntry) {
        let line = entry.format(self.format);
        let mut writer = self.writer.lock();
        if let Err(err) = writeln!(writer, "{}", line).and_then(|()| writer.flush()) {
            tracing::warn!(error = %err, "log sink write failed");
        }
    }
}

impl fmt::Debug for WriterLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterLogger")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Keeps entries in memory. Handy in tests.
#[derive(Clone, Default)]
pub struct MemoryLogger {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryLogger {
    /// An empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries recorded so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Drop all recorded entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Logger for MemoryLogger {
    fn log(&self, entry: &LogEntry) {
        self.entries.lock().push(entry.clone());
    }
}

impl fmt::Debug for MemoryLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLogger")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

// ============================================================================
// Effects
// ============================================================================

/// Annotations: forks copy them, joins merge the child's keys in.
pub(crate) fn annotations_ref() -> &'static FiberRef<BTreeMap<String, String>> {
    static ANNOTATIONS: OnceLock<FiberRef<BTreeMap<String, String>>> = OnceLock::new();
    ANNOTATIONS.get_or_init(|| {
        FiberRef::with_policies(BTreeMap::new(), BTreeMap::clone, |parent, child| {
            let mut merged = parent.clone();
            merged.extend(child.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged
        })
    })
}

impl Effect<()> {
    /// Log a message at info level.
    pub fn log(message: impl Into<String>) -> Effect<()> {
        Effect::log_at(LogLevel::Info, message)
    }

    /// Log a message at `level`.
    pub fn log_at(level: LogLevel, message: impl Into<String>) -> Effect<()> {
        let message = message.into();
        let annotations = annotations_ref().clone();
        Effect::from_node(op::with_fiber(move |fiber| {
            if fiber.runtime.config.log.level.allows(level) {
                let mut entry = LogEntry::new(level, message.clone(), fiber.id);
                entry.annotations = annotations.current(&fiber.refs);
                fiber.runtime.logger.log(&entry);
            }
            op::unit()
        }))
    }

    /// Run `effect` with an extra log annotation.
    pub fn annotate<A: Value, E: Value>(
        key: impl Into<String>,
        value: impl Into<String>,
        effect: Effect<A, E>,
    ) -> Effect<A, E> {
        let key = key.into();
        let value = value.into();
        annotations_ref().locally_with(
            move |mut annotations| {
                annotations.insert(key.clone(), value.clone());
                annotations
            },
            effect,
        )
    }

    /// The running fiber's log annotations.
    pub fn log_annotations() -> Effect<BTreeMap<String, String>> {
        annotations_ref().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_plain() {
        let entry = LogEntry::new(LogLevel::Warn, "disk low", FiberId::new(7))
            .with_annotation("disk", "sda");
        let plain = entry.format_plain();
        assert!(plain.contains("WARN"));
        assert!(plain.contains("(Fiber(7))"));
        assert!(plain.ends_with("disk low {disk=sda}"));
    }

    #[test]
    fn test_format_json() {
        let entry = LogEntry::new(LogLevel::Info, "say \"hi\"", FiberId::new(3))
            .with_annotation("user", "a\nb");
        let json = entry.format_json();
        assert!(json.contains("\"level\":\"INFO\""));
        assert!(json.contains("\"fiber\":3"));
        assert!(json.contains("\"message\":\"say \\\"hi\\\"\""));
        assert!(json.contains("\"user\":\"a\\nb\""));
    }

    #[test]
    fn test_json_escapes_control_chars() {
        assert_eq!(JsonStr("\u{1}\t").to_string(), "\\u0001\\t");
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn test_writer_logger_writes_lines() {
        let buf = SharedBuf::default();
        let logger = WriterLogger::new(buf.clone(), LogFormat::Plain);
        logger.log(&LogEntry::new(LogLevel::Info, "first", FiberId::new(1)));
        logger.log(&LogEntry::new(LogLevel::Error, "second", FiberId::new(2)));
        let lines = buf.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("INFO  (Fiber(1)) first"));
        assert!(lines[1].contains("ERROR (Fiber(2)) second"));
    }

    #[test]
    fn test_runtime_log_writer_uses_configured_format() {
        use crate::config::RuntimeConfig;
        use crate::runtime::Runtime;

        let buf = SharedBuf::default();
        let config = RuntimeConfig::builder()
            .num_workers(1)
            .log_format(LogFormat::Json)
            .build_unchecked();
        let rt = Runtime::builder().config(config).log_writer(buf.clone()).build();

        let program = Effect::annotate("request", "7", Effect::log("handled"))
            .zip_right(Effect::log_at(LogLevel::Debug, "filtered"));
        assert!(rt.run_blocking(program).is_success());

        let lines = buf.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("{\"timestamp\":"));
        assert!(lines[0].contains("\"message\":\"handled\""));
        assert!(lines[0].ends_with(",\"annotations\":{\"request\":\"7\"}}"));
    }

    #[test]
    fn test_memory_logger() {
        let logger = MemoryLogger::new();
        logger.log(&LogEntry::new(LogLevel::Info, "a", FiberId::NONE));
        assert_eq!(logger.entries().len(), 1);
        logger.clear();
        assert!(logger.entries().is_empty());
    }
}
