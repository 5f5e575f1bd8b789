use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fsio;

/// Upper bound on one inbox read, so a pathologically large backlog cannot
/// exhaust memory in a single cycle.
const READ_WINDOW_BYTES: u64 = 10 * 1024 * 1024;

/// A message from the team lead. Arrival order is delivery order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboxMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub timestamp: String,
}

/// Worker-to-lead status messages. Internally tagged so consumers can skip
/// variants they do not know.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboxMessage {
    #[serde(rename_all = "camelCase")]
    TaskComplete {
        task_id: String,
        summary: String,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    TaskFailed {
        task_id: String,
        error: String,
        attempt: u32,
        timestamp: String,
    },
    Error { error: String, timestamp: String },
    Idle { message: String, timestamp: String },
    #[serde(rename_all = "camelCase")]
    ShutdownAck {
        request_id: String,
        timestamp: String,
    },
}

impl OutboxMessage {
    pub fn task_complete(task_id: &str, summary: &str) -> Self {
        OutboxMessage::TaskComplete {
            task_id: task_id.to_string(),
            summary: summary.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn task_failed(task_id: &str, error: &str, attempt: u32) -> Self {
        OutboxMessage::TaskFailed {
            task_id: task_id.to_string(),
            error: error.to_string(),
            attempt,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(error: &str) -> Self {
        OutboxMessage::Error {
            error: error.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn idle(message: &str) -> Self {
        OutboxMessage::Idle {
            message: message.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn shutdown_ack(request_id: &str) -> Self {
        OutboxMessage::ShutdownAck {
            request_id: request_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Cursor {
    bytes_read: u64,
}

/// Reader over the lead-appended inbox log, tracking a byte cursor in a
/// sidecar file.
pub struct InboxReader {
    path: PathBuf,
    cursor_path: PathBuf,
}

impl InboxReader {
    pub fn new(path: PathBuf, cursor_path: PathBuf) -> Self {
        Self { path, cursor_path }
    }

    fn read_cursor(&self) -> u64 {
        let Ok(Some(contents)) = fsio::read_to_string_opt(&self.cursor_path) else {
            return 0;
        };
        serde_json::from_str::<Cursor>(&contents)
            .map(|c| c.bytes_read)
            .unwrap_or(0)
    }

    fn write_cursor(&self, bytes_read: u64) -> anyhow::Result<()> {
        fsio::write_json_atomic(&self.cursor_path, &Cursor { bytes_read })
    }

    /// Deliver every message appended since the last read.
    ///
    /// The cursor only ever advances past the newline of a successfully
    /// decoded record. A malformed line (or a line still being appended)
    /// halts advancement at its start, so the next cycle re-observes it. A
    /// shrunken file resets the cursor to zero.
    pub fn read_new(&self) -> anyhow::Result<Vec<InboxMessage>> {
        let mut cursor = self.read_cursor();

        let len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("stat {}", self.path.display())))
            }
        };

        if len < cursor {
            debug!(inbox = %self.path.display(), "inbox shrank, resetting cursor");
            cursor = 0;
        }
        if len == cursor {
            return Ok(Vec::new());
        }

        let window = (len - cursor).min(READ_WINDOW_BYTES);
        if len - cursor > READ_WINDOW_BYTES {
            warn!(
                inbox = %self.path.display(),
                pending = len - cursor,
                "inbox backlog exceeds read window; draining in chunks"
            );
        }

        let mut file =
            File::open(&self.path).with_context(|| format!("opening {}", self.path.display()))?;
        file.seek(SeekFrom::Start(cursor))
            .with_context(|| format!("seeking {}", self.path.display()))?;
        let mut buf = vec![0u8; window as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .with_context(|| format!("reading {}", self.path.display()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        let mut messages = Vec::new();
        let mut offset = cursor;
        let mut start = 0usize;
        while let Some(nl) = buf[start..].iter().position(|&b| b == b'\n') {
            let line = &buf[start..start + nl];
            let consumed = nl as u64 + 1;
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                offset += consumed;
            } else {
                match serde_json::from_slice::<InboxMessage>(line) {
                    Ok(message) => {
                        messages.push(message);
                        offset += consumed;
                    }
                    Err(e) => {
                        warn!(
                            inbox = %self.path.display(),
                            at = offset,
                            error = %e,
                            "malformed inbox line; holding cursor"
                        );
                        break;
                    }
                }
            }
            start += nl + 1;
        }

        self.write_cursor(offset)?;
        Ok(messages)
    }

    /// Trim the inbox to its most recent half once it exceeds `max_bytes`,
    /// resetting the cursor. Not called by the bridge loop; exposed for
    /// external maintenance.
    pub fn rotate(&self, max_bytes: u64) -> anyhow::Result<()> {
        let Some(contents) = fsio::read_to_string_opt(&self.path)? else {
            return Ok(());
        };
        if contents.len() as u64 <= max_bytes {
            return Ok(());
        }
        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let keep = &lines[lines.len() / 2..];
        let mut doc = keep.join("\n");
        if !doc.is_empty() {
            doc.push('\n');
        }
        fsio::write_atomic(&self.path, &doc)?;
        self.write_cursor(0)
    }
}

/// Append-only worker status log.
pub struct Outbox {
    path: PathBuf,
}

impl Outbox {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, message: &OutboxMessage) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fsio::ensure_dir(parent)?;
        }
        let line = serde_json::to_string(message)
            .with_context(|| format!("serializing outbox message for {}", self.path.display()))?;
        fsio::append_line(&self.path, &line)
    }

    /// Keep the most recent half of the log once it exceeds `max_lines`
    /// non-empty lines. Invoked at the end of every cycle; failures are the
    /// caller's to log and ignore.
    pub fn rotate(&self, max_lines: usize) -> anyhow::Result<()> {
        let Some(contents) = fsio::read_to_string_opt(&self.path)? else {
            return Ok(());
        };
        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() <= max_lines {
            return Ok(());
        }
        let keep = &lines[lines.len() / 2..];
        let mut doc = keep.join("\n");
        doc.push('\n');
        fsio::write_atomic(&self.path, &doc)
    }

    /// Decode every readable message, skipping lines that do not parse.
    pub fn read_all(&self) -> anyhow::Result<Vec<OutboxMessage>> {
        let Some(contents) = fsio::read_to_string_opt(&self.path)? else {
            return Ok(Vec::new());
        };
        Ok(contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
