//! Delivery state kept across restarts.
//!
//! The engine rewrites the journal whenever its queue or dedup window
//! changes, so the file always holds the non-terminal tasks plus the ids
//! seen recently. On start the bridge loads it back. Loading leaves the
//! file in place; only the engine's next save replaces it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::error::JournalError;
use crate::common::types::{ForwardTask, TaskId, TaskStatus};

/// What the journal file holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalState {
    /// Tasks not yet delivered, failed or dropped.
    pub pending: Vec<ForwardTask>,
    /// Recently admitted ids, oldest first. Source events replayed after a
    /// restart are recognised as duplicates against these.
    #[serde(default)]
    pub seen: Vec<TaskId>,
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the journal contents with `state`.
    ///
    /// Written to a sibling temp file and renamed, so a crash mid-write
    /// leaves the previous journal intact.
    pub fn save(&self, state: &JournalState) -> Result<(), JournalError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp, body).map_err(|source| self.io_error(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.io_error(source))?;

        debug!(
            "Saved {} pending task(s) and {} seen id(s) to {}",
            state.pending.len(),
            state.seen.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read the saved state back.
    ///
    /// A missing journal is an empty one. Tasks caught mid-attempt come back
    /// as `Pending`; their attempt counts are kept.
    pub fn load(&self) -> Result<JournalState, JournalError> {
        let body = match fs::read(&self.path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No journal at {}", self.path.display());
                return Ok(JournalState::default());
            }
            Err(source) => return Err(self.io_error(source)),
        };

        let mut state: JournalState = serde_json::from_slice(&body)?;
        state.pending.retain(|t| !t.status.is_terminal());
        for task in &mut state.pending {
            task.status = TaskStatus::Pending;
        }

        info!(
            "Restored {} pending task(s) from {}",
            state.pending.len(),
            self.path.display()
        );
        Ok(state)
    }

    fn io_error(&self, source: std::io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}
