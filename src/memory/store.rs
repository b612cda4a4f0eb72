//! On-disk session documents.
//!
//! One JSON document per session under `sessions/<user>/<session_id>.json`.
//! Writes are atomic: the document is written to a temp sibling and then
//! renamed over the target, so readers never observe a partial file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::trace::ReasoningEntry;
use crate::types::Interaction;

/// Current schema version written into every document.
pub const SCHEMA_VERSION: u32 = 1;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("session store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Document (de)serialization failure.
    #[error("session document serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// An interaction record with its embedded reasoning trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedInteraction {
    /// The interaction itself.
    #[serde(flatten)]
    pub interaction: Interaction,
    /// Trace entries, present only when the trace feature was enabled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning_trace: Vec<ReasoningEntry>,
}

/// The full per-session document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    /// Schema version for forward migration.
    pub schema_version: u32,
    /// Interactions in creation order.
    #[serde(default)]
    pub interactions: Vec<PersistedInteraction>,
    /// Planning context shared across the session.
    #[serde(default)]
    pub planning_context: BTreeMap<String, serde_json::Value>,
}

/// Path of a session's document.
pub fn session_path(base_dir: &Path, user: &str, session_id: &str) -> PathBuf {
    base_dir.join(user).join(format!("{session_id}.json"))
}

/// Atomically write a session document.
///
/// Writes to a `.tmp` sibling first, then renames over the target so a
/// crash mid-write never leaves a partial document.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the write or
/// rename fails.
pub fn save_session(path: &Path, doc: &SessionDocument) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_vec_pretty(doc)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a session document, returning `None` when no file exists.
///
/// # Errors
///
/// Returns an error for unreadable or unparseable documents; the caller
/// decides whether to start empty.
pub fn load_session(path: &Path) -> Result<Option<SessionDocument>, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let doc: SessionDocument = serde_json::from_str(&contents)?;
    Ok(Some(doc))
}

/// Remove a session document if it exists.
///
/// # Errors
///
/// Returns an error for filesystem failures other than a missing file.
pub fn remove_session(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
