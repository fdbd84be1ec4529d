//! Output sinks for script output, debug logs and rendered errors.

use std::io::Write;

use parking_lot::Mutex;

/// Three-part formatting interpolated into rendered errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFormat {
    pub error: String,
    pub highlight: String,
    pub reset: String,
}

impl ErrorFormat {
    pub fn ansi() -> Self {
        Self {
            error: "\x1b[31m".into(),
            highlight: "\x1b[1;31m".into(),
            reset: "\x1b[0m".into(),
        }
    }

    /// "No formatting" mode: every part is empty.
    pub fn plain() -> Self {
        Self {
            error: String::new(),
            highlight: String::new(),
            reset: String::new(),
        }
    }

    pub fn is_plain(&self) -> bool {
        self.error.is_empty() && self.highlight.is_empty() && self.reset.is_empty()
    }
}

impl Default for ErrorFormat {
    fn default() -> Self {
        Self::ansi()
    }
}

/// Destination for everything a program prints.
pub trait OutputSink: Send + Sync {
    fn write(&self, text: &str);

    fn write_line(&self, line: &str) {
        self.write(line);
        self.write("\n");
    }

    /// Parallel debug-log channel.
    fn debug(&self, line: &str);

    fn write_error(&self, rendered: &str);

    fn format(&self) -> &ErrorFormat;
}

/// Writes to the process stdout/stderr.
#[derive(Debug, Default)]
pub struct StdoutSink {
    format: ErrorFormat,
}

impl StdoutSink {
    pub fn new(format: ErrorFormat) -> Self {
        Self { format }
    }
}

impl OutputSink for StdoutSink {
    fn write(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    fn debug(&self, line: &str) {
        tracing::debug!(target: "quill::script", "{line}");
    }

    fn write_error(&self, rendered: &str) {
        eprintln!("{rendered}");
    }

    fn format(&self) -> &ErrorFormat {
        &self.format
    }
}

/// Captures everything in memory; used by embedders and tests.
#[derive(Debug)]
pub struct BufferSink {
    format: ErrorFormat,
    output: Mutex<String>,
    debug: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::with_format(ErrorFormat::plain())
    }

    pub fn with_format(format: ErrorFormat) -> Self {
        Self {
            format,
            output: Mutex::new(String::new()),
            debug: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn output(&self) -> String {
        self.output.lock().clone()
    }

    pub fn debug_lines(&self) -> Vec<String> {
        self.debug.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn clear(&self) {
        self.output.lock().clear();
        self.debug.lock().clear();
        self.errors.lock().clear();
    }
}

impl Default for BufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for BufferSink {
    fn write(&self, text: &str) {
        self.output.lock().push_str(text);
    }

    fn debug(&self, line: &str) {
        self.debug.lock().push(line.to_string());
    }

    fn write_error(&self, rendered: &str) {
        self.errors.lock().push(rendered.to_string());
    }

    fn format(&self) -> &ErrorFormat {
        &self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sink_captures_each_channel() {
        let sink = BufferSink::new();
        sink.write("a");
        sink.write_line("b");
        sink.debug("dbg");
        sink.write_error("bad");
        assert_eq!(sink.output(), "ab\n");
        assert_eq!(sink.debug_lines(), vec!["dbg".to_string()]);
        assert_eq!(sink.errors(), vec!["bad".to_string()]);
        sink.clear();
        assert!(sink.output().is_empty());
    }

    #[test]
    fn plain_format_is_empty() {
        assert!(ErrorFormat::plain().is_plain());
        assert!(!ErrorFormat::ansi().is_plain());
    }
}
