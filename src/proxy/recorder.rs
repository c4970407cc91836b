//! JSONL session recorder.
//!
//! Append-only capture of every management and proxied tool call for later
//! inspection or playback. The file starts with two comment lines and a
//! session header object, then carries one JSON message object per line.
//!
//! A single mutex serializes writes; it is never held across an upstream
//! call, only around the marshal-write-flush of one line.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::{CallToolResult, ToolContent};

/// One recorded JSON-RPC message with metadata.
#[derive(Debug, Serialize)]
struct RecordedMessage<'a> {
    timestamp: String,
    direction: &'a str,
    message_type: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    tool_name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    server_name: &'a str,
    message: &'a serde_json::Value,
}

/// Session header written once after the comment lines. `messages` stays
/// empty in the header for format compatibility; the actual messages follow
/// as separate lines.
#[derive(Debug, Serialize)]
struct SessionHeader<'a> {
    start_time: String,
    server_info: &'a str,
    messages: Vec<serde_json::Value>,
}

/// An active recording session owning one append-only file handle.
pub struct Recorder {
    filename: String,
    absolute_path: PathBuf,
    start_time: DateTime<Utc>,
    file: Mutex<File>,
}

impl Recorder {
    /// Create the recording file and write the session header. Failing here
    /// is fatal to startup; failures later are logged and ignored.
    pub fn create(path: &Path, server_info: &str) -> std::io::Result<Self> {
        let mut file = File::create(path)?;
        let start_time = Utc::now();

        let header = SessionHeader {
            start_time: start_time.to_rfc3339(),
            server_info,
            messages: Vec::new(),
        };
        writeln!(file, "# MCP Recording Session")?;
        writeln!(file, "# Started: {}", start_time.to_rfc3339())?;
        writeln!(file, "{}", serde_json::to_string(&header)?)?;
        file.flush()?;

        let absolute_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        Ok(Self {
            filename: path.display().to_string(),
            absolute_path,
            start_time,
            file: Mutex::new(file),
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn absolute_path(&self) -> &Path {
        &self.absolute_path
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Append one message line. Write failures are logged, not raised:
    /// recording problems must never fail the call being recorded.
    pub fn record(
        &self,
        direction: &str,
        message_type: &str,
        tool_name: &str,
        server_name: &str,
        message: &serde_json::Value,
    ) {
        let recorded = RecordedMessage {
            timestamp: Utc::now().to_rfc3339(),
            direction,
            message_type,
            tool_name,
            server_name,
            message,
        };

        let line = match serde_json::to_string(&recorded) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to marshal message for recording");
                return;
            }
        };

        let mut file = self.file.lock().expect("recorder lock poisoned");
        if let Err(e) = writeln!(file, "{line}").and_then(|()| file.flush()) {
            tracing::warn!(error = %e, "failed to write recording line");
        }
    }

    /// Return a copy of `result` with a trailing metadata item naming the
    /// recording file. The input is left untouched; callers may still hold
    /// references to the original content.
    pub fn annotate(&self, result: &CallToolResult) -> CallToolResult {
        let metadata = format!(
            "Recording: {}\n   Full path: {}\n   Purpose: JSON-RPC message log for debugging and playback testing",
            self.filename,
            self.absolute_path.display(),
        );

        let mut content = Vec::with_capacity(result.content.len() + 1);
        content.extend(result.content.iter().cloned());
        content.push(ToolContent::text(metadata));

        CallToolResult {
            content,
            is_error: result.is_error,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
