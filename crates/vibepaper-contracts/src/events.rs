use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::settings::{AspectRatio, Quality};

/// Something worth recording about a session. Serialized with its kind under
/// `type` and its fields alongside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        capability: String,
        history_count: usize,
    },
    BatchStarted {
        prompt: String,
        aspect_ratio: AspectRatio,
        quality: Quality,
        remix_of: Option<String>,
    },
    BatchCompleted {
        ids: Vec<String>,
        history_count: usize,
    },
    BatchFailed {
        error: String,
        auth_lost: bool,
    },
    /// A batch that was never issued: no credential, or another batch running.
    BatchRefused {
        reason: String,
    },
    HistoryCleared {
        removed: usize,
    },
    RemixSelected {
        id: String,
    },
}

/// Append-only JSONL log of [`SessionEvent`]s. Each line carries `type`,
/// `session_id` and `ts` next to the event fields. Clones share one file handle.
#[derive(Debug, Clone)]
pub struct EventWriter {
    path: PathBuf,
    session_id: Arc<str>,
    file: Arc<Mutex<Option<File>>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            session_id: Arc::from(session_id.into()),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Appends one line and returns the record as written.
    pub fn record(&self, event: &SessionEvent) -> anyhow::Result<Value> {
        let Value::Object(fields) = serde_json::to_value(event)? else {
            return Err(anyhow!("session event did not serialize to an object"));
        };
        let mut row = Map::new();
        if let Some(kind) = fields.get("type") {
            row.insert("type".to_string(), kind.clone());
        }
        row.insert(
            "session_id".to_string(),
            Value::String(self.session_id.to_string()),
        );
        row.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        row.extend(fields.into_iter().filter(|(key, _)| key != "type"));

        let mut line = serde_json::to_string(&row)?;
        line.push('\n');
        let mut slot = self
            .file
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        if slot.is_none() {
            *slot = Some(self.open_for_append()?);
        }
        if let Some(file) = slot.as_mut() {
            file.write_all(line.as_bytes())
                .with_context(|| format!("failed to append to {}", self.path.display()))?;
        }
        Ok(Value::Object(row))
    }

    fn open_for_append(&self) -> anyhow::Result<File> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))
    }
}
