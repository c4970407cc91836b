//! Aggregating MCP proxy.
//!
//! Exposes a single MCP endpoint on the process's stdio while fanning tool
//! calls out to a dynamic set of upstream MCP servers, each a long-lived
//! child process spoken to over its own stdio. Upstreams can be added,
//! removed, disconnected, and hot-swapped at runtime through in-band
//! management tools, with optional JSONL recording of all traffic.

pub mod config;
pub mod protocol;
pub mod proxy;
pub mod upstream;

#[cfg(test)]
pub(crate) mod test_support;

use std::io::Write;
use std::path::Path;

/// Initialize the tracing subscriber — writes structured logs to a file,
/// because stdout and stdin carry the MCP transport.
///
/// Each log line is flushed to disk immediately so a crash or kill cannot
/// swallow the tail of the log.
pub fn init_tracing(log_path: &Path) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    if let Some(dir) = log_path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_proxy=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcp-proxy starting ==="
    );

    Ok(())
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// `tracing-subscriber` buffers log output internally; without explicit
/// flushing, lines can sit in OS buffers and be lost when the host kills
/// the proxy.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file.lock().expect("log file lock poisoned");
        let written = file.write(buf)?;
        file.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file
            .lock()
            .expect("log file lock poisoned")
            .flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
