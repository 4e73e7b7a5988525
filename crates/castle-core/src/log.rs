//! Timestamped log sinks for cluster nodes.
//!
//! Every node gets its own [`CastleLog`] (a `<node>.clog` file in the working
//! directory) and the cluster carries one more for cluster-wide messages.
//! Writes to a single instance are serialized, so a multi-line message from
//! one action is never split by a concurrent writer.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::Local;

use crate::error::Result;

/// File extension for per-node logs.
pub const LOG_EXTENSION: &str = "clog";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

type Sink = Box<dyn Write + Send>;

pub struct CastleLog {
    name: String,
    /// `None` once the log has been closed; later writes are dropped.
    sink: Mutex<Option<Sink>>,
    enable_debug: bool,
}

impl std::fmt::Debug for CastleLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CastleLog")
            .field("name", &self.name)
            .field("enable_debug", &self.enable_debug)
            .finish()
    }
}

impl CastleLog {
    pub fn new(name: impl Into<String>, sink: impl Write + Send + 'static, enable_debug: bool) -> Self {
        Self {
            name: name.into(),
            sink: Mutex::new(Some(Box::new(sink))),
            enable_debug,
        }
    }

    /// Open `<log_base>/<node_name>.clog` in append mode, so logs survive
    /// across runs against the same working directory.
    pub fn from_file(log_base: &Path, node_name: &str, enable_debug: bool) -> Result<Self> {
        let path = log_base.join(format!("{node_name}.{LOG_EXTENSION}"));
        let file = crate::io::open_append(&path)?;
        Ok(Self::new(node_name, file, enable_debug))
    }

    pub fn from_stdout(name: impl Into<String>, enable_debug: bool) -> Self {
        Self::new(name, io::stdout(), enable_debug)
    }

    pub fn from_dev_null(name: impl Into<String>, enable_debug: bool) -> Self {
        Self::new(name, io::sink(), enable_debug)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn debug_enabled(&self) -> bool {
        self.enable_debug
    }

    /// Write `text` prefixed with a `yyyy-MM-dd HH:mm:ss` timestamp.
    ///
    /// `text` is written as-is; callers supply their own trailing newline.
    pub fn print(&self, text: &str) {
        let line = format!("{} {}", Local::now().format(TIMESTAMP_FORMAT), text);
        if let Err(e) = self.write(line.as_bytes()) {
            tracing::warn!(log = %self.name, "failed to write castle log: {e}");
        }
        tracing::trace!("{}: {}", self.name, text.strip_suffix('\n').unwrap_or(text));
    }

    /// Print a single line at info level. Always enabled.
    pub fn info(&self, msg: &str) {
        self.print(&format!("{msg}\n"));
    }

    /// Print a single line only when this log was created with debug enabled.
    pub fn debug(&self, msg: &str) {
        if self.enable_debug {
            self.info(msg);
        }
    }

    /// Print `msg` followed by `err` and its full source chain.
    pub fn error_with(&self, msg: &str, err: &dyn std::error::Error) {
        self.print(&format!("{msg}: {}\n", error_chain(err)));
    }

    /// Write raw bytes. Mutually exclusive with every other write on this
    /// instance. A closed log silently drops the bytes.
    pub fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sink) = guard.as_mut() {
            sink.write_all(buf)?;
            sink.flush()?;
        }
        Ok(())
    }

    /// Release the destination. Idempotent.
    pub fn close(&self) -> io::Result<()> {
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner()).take();
        match sink {
            Some(mut sink) => sink.flush(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// Print the same message to several logs.
pub fn print_to_all(text: &str, logs: &[&CastleLog]) {
    for log in logs {
        log.print(text);
    }
}

/// Debug-print the same line to several logs; each log applies its own gate.
pub fn debug_to_all(msg: &str, logs: &[&CastleLog]) {
    for log in logs {
        log.debug(msg);
    }
}

/// Render an error together with every `source()` below it.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
