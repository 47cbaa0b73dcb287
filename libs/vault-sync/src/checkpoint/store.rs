//! Checkpoint persistence.
//!
//! The processing checkpoint is stored as a small JSON document and written
//! with write-to-temp-then-rename so a crash mid-save never leaves a torn file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default path for the checkpoint file
pub const DEFAULT_CHECKPOINT_PATH: &str = "./vault-sync-checkpoint.json";

/// Persisted form of the process-wide checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingCheckpoint {
    pub last_processed_block: u64,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingCheckpoint {
    pub fn new(last_processed_block: u64) -> Self {
        Self {
            last_processed_block,
            updated_at: Utc::now(),
        }
    }
}

/// Errors that can occur while loading or saving the checkpoint
#[derive(Debug)]
pub enum CheckpointError {
    ReadError { path: String, reason: String },
    WriteError { path: String, reason: String },
    ParseError { reason: String },
    SerializeError { reason: String },
    RenameError { from: String, to: String, reason: String },
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::ReadError { path, reason } => {
                write!(f, "Failed to read checkpoint '{}': {}", path, reason)
            }
            CheckpointError::WriteError { path, reason } => {
                write!(f, "Failed to write checkpoint '{}': {}", path, reason)
            }
            CheckpointError::ParseError { reason } => {
                write!(f, "Failed to parse checkpoint JSON: {}", reason)
            }
            CheckpointError::SerializeError { reason } => {
                write!(f, "Failed to serialize checkpoint: {}", reason)
            }
            CheckpointError::RenameError { from, to, reason } => {
                write!(f, "Failed to rename '{}' to '{}': {}", from, to, reason)
            }
        }
    }
}

impl std::error::Error for CheckpointError {}

/// Loads and saves the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }

    /// Load the persisted checkpoint. A missing file yields `None`.
    pub fn load(&self) -> Result<Option<ProcessingCheckpoint>, CheckpointError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path).map_err(|e| CheckpointError::ReadError {
            path: self.display_path(),
            reason: e.to_string(),
        })?;

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| CheckpointError::ParseError {
                reason: e.to_string(),
            })
    }

    pub fn save(&self, checkpoint: &ProcessingCheckpoint) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| CheckpointError::WriteError {
                    path: self.display_path(),
                    reason: format!("Failed to create parent directories: {}", e),
                })?;
            }
        }

        let json =
            serde_json::to_string_pretty(checkpoint).map_err(|e| CheckpointError::SerializeError {
                reason: e.to_string(),
            })?;

        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);
        let temp_display = temp_path.display().to_string();

        let mut file = fs::File::create(&temp_path).map_err(|e| CheckpointError::WriteError {
            path: temp_display.clone(),
            reason: e.to_string(),
        })?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| CheckpointError::WriteError {
                path: temp_display.clone(),
                reason: e.to_string(),
            })?;

        fs::rename(&temp_path, &self.path).map_err(|e| CheckpointError::RenameError {
            from: temp_display,
            to: self.display_path(),
            reason: e.to_string(),
        })
    }
}
