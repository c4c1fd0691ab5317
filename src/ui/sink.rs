//! Optional JSON-lines event log, appended to alongside terminal output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub level: String,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

static LOG_FILE: RwLock<Option<PathBuf>> = RwLock::new(None);

pub fn set_log_file(path: Option<PathBuf>) -> anyhow::Result<()> {
    if let Some(parent) = path.as_deref().and_then(Path::parent) {
        create_dir_all(parent)?;
    }
    if let Ok(mut current) = LOG_FILE.write() {
        *current = path;
    }
    Ok(())
}

pub(crate) fn record(level: &str, code: &str, message: &str, data: Option<&serde_json::Value>) {
    let Some(path) = LOG_FILE.read().ok().and_then(|p| p.clone()) else {
        return;
    };

    let entry = LoggedEvent {
        timestamp: Utc::now(),
        pid: std::process::id(),
        level: level.to_string(),
        code: code.to_string(),
        message: message.to_string(),
        data: data.cloned(),
    };

    // Logging must never take an operation down with it.
    let Ok(line) = serde_json::to_string(&entry) else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "{line}");
    }
}

/// Read back the log, newest first.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<LoggedEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(line)?);
    }
    events.reverse();
    Ok(events)
}
