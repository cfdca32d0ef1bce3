//! Append-only record of terminal task outcomes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::error::ActivityLogError;
use crate::common::types::{ForwardTask, TaskId, TaskStatus};

/// One terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: TaskId,
    pub recipient: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl ActivityEntry {
    pub fn from_task(task: &ForwardTask, finished_at: DateTime<Utc>) -> Self {
        Self {
            id: task.id,
            recipient: task.recipient.clone(),
            status: task.status,
            created_at: task.created_at,
            finished_at,
            attempt_count: task.attempt_count,
            last_error: task.last_error.clone(),
        }
    }
}

/// Destination for terminal outcomes.
pub trait ActivityLog: Send {
    fn append(&mut self, entry: &ActivityEntry) -> Result<(), ActivityLogError>;
}

/// JSON-lines file, one entry per line.
#[derive(Debug)]
pub struct FileActivityLog {
    path: PathBuf,
    file: File,
}

impl FileActivityLog {
    /// Open (or create) the log for appending, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ActivityLogError> {
        let path = path.as_ref().to_path_buf();
        let io_error = |source| ActivityLogError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;

        Ok(Self { path, file })
    }
}

impl ActivityLog for FileActivityLog {
    fn append(&mut self, entry: &ActivityEntry) -> Result<(), ActivityLogError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .map_err(|source| ActivityLogError::Io {
                path: self.path.display().to_string(),
                source,
            })
    }
}

/// In-memory log whose entries can be inspected through a shared handle.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MemoryActivityLog {
    entries: Arc<Mutex<Vec<ActivityEntry>>>,
    failures: Arc<Mutex<u32>>,
}

#[cfg(test)]
impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` appends.
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock().unwrap() = count;
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl ActivityLog for MemoryActivityLog {
    fn append(&mut self, entry: &ActivityEntry) -> Result<(), ActivityLogError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ActivityLogError::Io {
                    path: "memory".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "log unavailable"),
                });
            }
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.clone());
        }
        Ok(())
    }
}
