//! Diagnostic log sink chain.
//!
//! Session diagnostics ("logerror" output) are rendered once and fanned out
//! to every registered sink in registration order.

use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// A single diagnostic consumer.
pub type LogSink = Box<dyn FnMut(&str) + Send>;

/// Ordered list of diagnostic sinks with shared scratch storage.
#[derive(Default)]
pub struct LogSinks {
    sinks: Vec<LogSink>,
    scratch: String,
}

impl LogSinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sink. Phase checking is the caller's job.
    pub fn add(&mut self, sink: LogSink) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Render `args` and hand the text to every sink.
    ///
    /// Nothing is formatted when no sink is registered.
    pub fn write(&mut self, args: fmt::Arguments<'_>) {
        if self.sinks.is_empty() {
            return;
        }
        self.scratch.clear();
        let _ = self.scratch.write_fmt(args);
        for sink in self.sinks.iter_mut() {
            sink(&self.scratch);
        }
    }
}

impl fmt::Debug for LogSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSinks").field("sinks", &self.sinks.len()).finish()
    }
}

/// Sink appending each diagnostic as a line to `path` (the session error log).
pub fn file_sink(path: &Path) -> io::Result<LogSink> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(File::create(path)?);
    Ok(Box::new(move |text: &str| {
        let _ = writer.write_all(text.as_bytes());
        if !text.ends_with('\n') {
            let _ = writer.write_all(b"\n");
        }
        let _ = writer.flush();
    }))
}

/// Sink forwarding diagnostics to the `log` facade at debug level.
pub fn log_sink() -> LogSink {
    Box::new(|text: &str| {
        log::debug!(target: "logerror", "{}", text.trim_end());
    })
}
