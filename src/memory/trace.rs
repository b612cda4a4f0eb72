//! Reasoning-trace entries: an append-only log of planning and execution
//! decisions per interaction.
//!
//! The trace is feature-flagged (`reasoning_trace.enabled`); when disabled
//! the session memory exposes the same operations as no-ops. Entries are
//! created `pending` and may move to a terminal outcome exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Pipeline stage an entry was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStage {
    /// Plan generation and repair.
    Planning,
    /// Step execution.
    Execution,
    /// Output verification.
    Verification,
    /// Critic-driven correction.
    Correction,
    /// Reply finalization.
    Finalization,
}

/// Outcome of a traced decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceOutcome {
    /// Not yet resolved; the only updatable state.
    Pending,
    /// Resolved successfully; terminal.
    Success,
    /// Partially resolved; terminal.
    Partial,
    /// Failed; terminal.
    Failed,
    /// Never carried out; terminal.
    Skipped,
}

/// A single reasoning-trace entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningEntry {
    /// Unique entry identifier.
    pub entry_id: Uuid,
    /// Interaction this entry belongs to.
    pub interaction_id: Uuid,
    /// Pipeline stage.
    pub stage: TraceStage,
    /// The decision or observation being recorded.
    pub thought: String,
    /// Tool action involved, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Parameters involved, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    /// Supporting evidence (payload fragments, verbatim notes).
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Current outcome; `pending` until finalized.
    pub outcome: TraceOutcome,
    /// Error text when the outcome is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Commitments made to the user (e.g. `send_email`, `attach_document`).
    #[serde(default)]
    pub commitments: Vec<String>,
    /// Artifact paths attached along the way.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Corrections applied after the fact.
    #[serde(default)]
    pub corrections: Vec<String>,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Fields applied when finalizing a pending entry.
#[derive(Debug, Clone, Default)]
pub struct TraceUpdate {
    /// New outcome; must not be `Pending`.
    pub outcome: Option<TraceOutcome>,
    /// Error text to attach.
    pub error: Option<String>,
    /// Corrections to append.
    pub corrections: Vec<String>,
    /// Attachments to append.
    pub attachments: Vec<String>,
    /// Evidence to append.
    pub evidence: Vec<String>,
}

/// Per-interaction collection of entries with id lookup.
#[derive(Debug, Default)]
pub struct ReasoningTrace {
    entries: Vec<ReasoningEntry>,
    by_id: HashMap<Uuid, usize>,
}

impl ReasoningTrace {
    /// Create an empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; returns its id.
    pub fn push(&mut self, entry: ReasoningEntry) -> Uuid {
        let id = entry.entry_id;
        self.by_id.insert(id, self.entries.len());
        self.entries.push(entry);
        id
    }

    /// Apply an update to a pending entry.
    ///
    /// Returns `false` if the entry is unknown or already finalized:
    /// an entry moves from `pending` to another outcome exactly once.
    pub fn update(&mut self, entry_id: Uuid, update: TraceUpdate) -> bool {
        let Some(index) = self.by_id.get(&entry_id) else {
            return false;
        };
        let Some(entry) = self.entries.get_mut(*index) else {
            return false;
        };
        if entry.outcome != TraceOutcome::Pending {
            return false;
        }

        if let Some(outcome) = update.outcome {
            if outcome != TraceOutcome::Pending {
                entry.outcome = outcome;
            }
        }
        if update.error.is_some() {
            entry.error = update.error;
        }
        entry.corrections.extend(update.corrections);
        entry.attachments.extend(update.attachments);
        entry.evidence.extend(update.evidence);
        true
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> &[ReasoningEntry] {
        &self.entries
    }

    /// Commitments from entries that are still pending.
    pub fn pending_commitments(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.outcome == TraceOutcome::Pending)
            .flat_map(|e| e.commitments.iter().cloned())
            .collect()
    }

    /// All attachments recorded across entries.
    pub fn attachments(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|e| e.attachments.iter().cloned())
            .collect()
    }

    /// All corrections recorded across entries.
    pub fn corrections(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|e| e.corrections.iter().cloned())
            .collect()
    }

    /// Render the most recent entries for planner context.
    ///
    /// One line per entry: `[stage] thought (outcome)`. When
    /// `corrections_only` is set, only entries carrying corrections appear.
    pub fn summary(&self, max_entries: usize, corrections_only: bool) -> String {
        let selected: Vec<&ReasoningEntry> = self
            .entries
            .iter()
            .filter(|e| !corrections_only || !e.corrections.is_empty())
            .collect();

        let start = selected.len().saturating_sub(max_entries);
        selected
            .get(start..)
            .unwrap_or(&[])
            .iter()
            .map(|e| {
                let stage = serde_json::to_string(&e.stage)
                    .unwrap_or_default()
                    .trim_matches('"')
                    .to_owned();
                let outcome = serde_json::to_string(&e.outcome)
                    .unwrap_or_default()
                    .trim_matches('"')
                    .to_owned();
                format!("[{stage}] {} ({outcome})", e.thought)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
