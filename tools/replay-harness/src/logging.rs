//! Append-only JSONL replay log.
//!
//! One `LogEvent` per line; oversized payloads are truncated so a stray
//! recorded body cannot bloat the log.

use crate::errors::HarnessError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), HarnessError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| HarnessError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| HarnessError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| HarnessError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| HarnessError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| HarnessError::Io(e.to_string()))?;
        Ok(())
    }
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    // The cut must land on a char boundary or String::truncate panics.
    let mut end = max_bytes.saturating_sub(3);
    while !rendered.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = rendered;
    truncated.truncate(end);
    Value::String(format!("{truncated}..."))
}
