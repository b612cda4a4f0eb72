//! Session-scoped memory: interactions, planning context, reasoning trace.
//!
//! [`SessionMemory`] is the only shared mutable state visible to multiple
//! components. Every operation locks a per-instance mutex for the duration
//! of the map mutation only; the lock is never held across I/O or awaits.
//! Reads return deep copies, so callers never observe torn state.
//!
//! `clear` is safe to invoke from within a task owned by the same session:
//! the public entry point takes the lock once and delegates to unlocked
//! internal helpers.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::kernel::template::StepPayloads;
use crate::types::{Interaction, Plan, ReplyPayload, StepResult};

pub mod store;
pub mod trace;

use trace::{ReasoningEntry, ReasoningTrace, TraceOutcome, TraceStage, TraceUpdate};

// ── Session memory ──────────────────────────────────────────────

/// Fields for a new reasoning-trace entry; unset fields default to empty.
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    /// Tool action involved, when applicable.
    pub action: Option<String>,
    /// Parameters involved, when applicable.
    pub parameters: Option<serde_json::Value>,
    /// Supporting evidence.
    pub evidence: Vec<String>,
    /// Commitments made to the user.
    pub commitments: Vec<String>,
    /// Artifact paths.
    pub attachments: Vec<String>,
}

#[derive(Default)]
struct MemoryInner {
    interactions: Vec<Interaction>,
    planning_context: BTreeMap<String, serde_json::Value>,
    traces: HashMap<Uuid, ReasoningTrace>,
    entry_owner: HashMap<Uuid, Uuid>,
}

impl MemoryInner {
    fn interaction_mut(&mut self, interaction_id: Uuid) -> Option<&mut Interaction> {
        self.interactions
            .iter_mut()
            .find(|i| i.id == interaction_id)
    }

    fn clear(&mut self) {
        self.interactions.clear();
        self.planning_context.clear();
        self.traces.clear();
        self.entry_owner.clear();
    }
}

/// Per-session, thread-safe record of interactions, step results, planning
/// context and the optional reasoning trace.
pub struct SessionMemory {
    session_id: String,
    trace_enabled: bool,
    inner: Mutex<MemoryInner>,
}

impl SessionMemory {
    /// Create empty memory for a session.
    pub fn new(session_id: &str, trace_enabled: bool) -> Self {
        Self {
            session_id: session_id.to_owned(),
            trace_enabled,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// The session this memory belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned lock means a panic mid-mutation; recover the data
        // rather than propagating the poison to every later request.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Interactions ────────────────────────────────────────────

    /// Record a new interaction for a user request; returns its id.
    pub fn add_interaction(&self, user_request: &str) -> Uuid {
        let interaction = Interaction {
            id: Uuid::new_v4(),
            user_request: user_request.to_owned(),
            plan: None,
            step_results: BTreeMap::new(),
            reply: None,
            created_at: Utc::now(),
        };
        let id = interaction.id;
        self.lock().interactions.push(interaction);
        id
    }

    /// Attach the accepted plan to an interaction.
    pub fn set_plan(&self, interaction_id: Uuid, plan: Plan) {
        let mut inner = self.lock();
        match inner.interaction_mut(interaction_id) {
            Some(interaction) => interaction.plan = Some(plan),
            None => warn!(%interaction_id, "set_plan on unknown interaction"),
        }
    }

    /// Commit a finalized step result.
    pub fn set_step_result(&self, interaction_id: Uuid, result: StepResult) {
        let mut inner = self.lock();
        match inner.interaction_mut(interaction_id) {
            Some(interaction) => {
                interaction.step_results.insert(result.step_id, result);
            }
            None => warn!(%interaction_id, "set_step_result on unknown interaction"),
        }
    }

    /// Seal an interaction with its finalized reply.
    pub fn seal(&self, interaction_id: Uuid, reply: ReplyPayload) {
        let mut inner = self.lock();
        match inner.interaction_mut(interaction_id) {
            Some(interaction) => interaction.reply = Some(reply),
            None => warn!(%interaction_id, "seal on unknown interaction"),
        }
    }

    /// Deep-copy snapshot of one interaction.
    pub fn snapshot(&self, interaction_id: Uuid) -> Option<Interaction> {
        self.lock()
            .interactions
            .iter()
            .find(|i| i.id == interaction_id)
            .cloned()
    }

    /// Deep-copy snapshot of all interactions in creation order.
    pub fn interactions(&self) -> Vec<Interaction> {
        self.lock().interactions.clone()
    }

    /// Success payloads of an interaction's steps, keyed by step id, for
    /// template resolution. Errored and skipped steps are omitted.
    pub fn step_payloads(&self, interaction_id: Uuid) -> StepPayloads {
        let inner = self.lock();
        let mut payloads = StepPayloads::new();
        if let Some(interaction) = inner.interactions.iter().find(|i| i.id == interaction_id) {
            for (step_id, result) in &interaction.step_results {
                if result.status == crate::types::StepStatus::Success {
                    payloads.insert(*step_id, result.payload.clone());
                }
            }
        }
        payloads
    }

    // ── Planning context ────────────────────────────────────────

    /// Set a planning-context value shared across the session's interactions.
    pub fn set_context(&self, key: &str, value: serde_json::Value) {
        self.lock().planning_context.insert(key.to_owned(), value);
    }

    /// Read a planning-context value.
    pub fn get_context(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().planning_context.get(key).cloned()
    }

    /// Deep-copy snapshot of the whole planning context.
    pub fn context(&self) -> BTreeMap<String, serde_json::Value> {
        self.lock().planning_context.clone()
    }

    /// Drop all interactions, context, and trace entries.
    pub fn clear(&self) {
        self.lock().clear();
    }

    // ── Reasoning trace ─────────────────────────────────────────

    /// Whether trace recording is active.
    pub fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    /// Begin a trace for an interaction. No-op when the flag is off.
    pub fn start_reasoning_trace(&self, interaction_id: Uuid) {
        if !self.trace_enabled {
            return;
        }
        self.lock()
            .traces
            .entry(interaction_id)
            .or_insert_with(ReasoningTrace::new);
    }

    /// Record a pending entry; returns its id, or `None` when disabled.
    pub fn add_reasoning_entry(
        &self,
        interaction_id: Uuid,
        stage: TraceStage,
        thought: &str,
        extra: NewEntry,
    ) -> Option<Uuid> {
        if !self.trace_enabled {
            return None;
        }
        let entry = ReasoningEntry {
            entry_id: Uuid::new_v4(),
            interaction_id,
            stage,
            thought: thought.to_owned(),
            action: extra.action,
            parameters: extra.parameters,
            evidence: extra.evidence,
            outcome: TraceOutcome::Pending,
            error: None,
            commitments: extra.commitments,
            attachments: extra.attachments,
            corrections: vec![],
            timestamp: Utc::now(),
        };
        let entry_id = entry.entry_id;
        let mut inner = self.lock();
        inner.entry_owner.insert(entry_id, interaction_id);
        inner
            .traces
            .entry(interaction_id)
            .or_insert_with(ReasoningTrace::new)
            .push(entry);
        Some(entry_id)
    }

    /// Finalize a pending entry. Returns `false` when disabled, unknown,
    /// or already finalized.
    pub fn update_reasoning_entry(&self, entry_id: Uuid, update: TraceUpdate) -> bool {
        if !self.trace_enabled {
            return false;
        }
        let mut inner = self.lock();
        let Some(interaction_id) = inner.entry_owner.get(&entry_id).copied() else {
            return false;
        };
        inner
            .traces
            .get_mut(&interaction_id)
            .is_some_and(|trace| trace.update(entry_id, update))
    }

    /// Render recent trace entries across all interactions.
    /// Empty string when disabled.
    pub fn get_reasoning_summary(&self, max_entries: usize, corrections_only: bool) -> String {
        if !self.trace_enabled {
            return String::new();
        }
        let inner = self.lock();
        let mut parts: Vec<String> = Vec::new();
        for interaction in &inner.interactions {
            if let Some(trace) = inner.traces.get(&interaction.id) {
                let section = trace.summary(max_entries, corrections_only);
                if !section.is_empty() {
                    parts.push(section);
                }
            }
        }
        parts.join("\n")
    }

    /// Commitments from entries still pending. Empty when disabled.
    pub fn get_pending_commitments(&self) -> Vec<String> {
        if !self.trace_enabled {
            return Vec::new();
        }
        let inner = self.lock();
        inner
            .traces
            .values()
            .flat_map(ReasoningTrace::pending_commitments)
            .collect()
    }

    /// All attachments recorded in the trace. Empty when disabled.
    pub fn get_trace_attachments(&self) -> Vec<String> {
        if !self.trace_enabled {
            return Vec::new();
        }
        let inner = self.lock();
        inner
            .traces
            .values()
            .flat_map(ReasoningTrace::attachments)
            .collect()
    }

    /// All corrections recorded in the trace. Empty when disabled.
    pub fn get_trace_corrections(&self) -> Vec<String> {
        if !self.trace_enabled {
            return Vec::new();
        }
        let inner = self.lock();
        inner
            .traces
            .values()
            .flat_map(ReasoningTrace::corrections)
            .collect()
    }

    /// Trace entries for one interaction (for persistence embedding).
    pub fn trace_entries(&self, interaction_id: Uuid) -> Vec<ReasoningEntry> {
        if !self.trace_enabled {
            return Vec::new();
        }
        self.lock()
            .traces
            .get(&interaction_id)
            .map(|t| t.entries().to_vec())
            .unwrap_or_default()
    }

    /// Restore state loaded from disk. Replaces current contents.
    pub fn restore(
        &self,
        interactions: Vec<(Interaction, Vec<ReasoningEntry>)>,
        planning_context: BTreeMap<String, serde_json::Value>,
    ) {
        let mut inner = self.lock();
        inner.clear();
        inner.planning_context = planning_context;
        for (interaction, entries) in interactions {
            if !entries.is_empty() {
                let mut trace = ReasoningTrace::new();
                for entry in entries {
                    inner.entry_owner.insert(entry.entry_id, interaction.id);
                    trace.push(entry);
                }
                inner.traces.insert(interaction.id, trace);
            }
            inner.interactions.push(interaction);
        }
    }
}

// ── Memory store ────────────────────────────────────────────────

/// Registry of per-session memories plus their on-disk documents.
///
/// Sessions load lazily on first touch and persist after each sealed
/// interaction. One task per session means concurrent writers to the same
/// file are impossible by construction.
pub struct MemoryStore {
    base_dir: PathBuf,
    user: String,
    trace_enabled: bool,
    sessions: Mutex<HashMap<String, Arc<SessionMemory>>>,
}

impl MemoryStore {
    /// Create a store rooted at `base_dir` for the given user.
    pub fn new(base_dir: PathBuf, user: &str, trace_enabled: bool) -> Self {
        Self {
            base_dir,
            user: user.to_owned(),
            trace_enabled,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionMemory>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get or create the memory for a session, loading any persisted
    /// document on first touch.
    pub fn session(&self, session_id: &str) -> Arc<SessionMemory> {
        if let Some(existing) = self.lock_sessions().get(session_id) {
            return Arc::clone(existing);
        }

        // Load outside the registry lock; insert afterwards. A racing
        // first-touch loads the same document, so whichever insert wins
        // carries identical state.
        let memory = Arc::new(SessionMemory::new(session_id, self.trace_enabled));
        let path = store::session_path(&self.base_dir, &self.user, session_id);
        match store::load_session(&path) {
            Ok(Some(doc)) => {
                let restored = doc
                    .interactions
                    .into_iter()
                    .map(|p| (p.interaction, p.reasoning_trace))
                    .collect();
                memory.restore(restored, doc.planning_context);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(session_id, error = %e, "failed to load session document, starting empty");
            }
        }

        let mut sessions = self.lock_sessions();
        Arc::clone(sessions.entry(session_id.to_owned()).or_insert(memory))
    }

    /// Clear a session's memory and remove its persisted document.
    pub fn clear(&self, session_id: &str) {
        if let Some(memory) = self.lock_sessions().get(session_id) {
            memory.clear();
        }
        let path = store::session_path(&self.base_dir, &self.user, session_id);
        if let Err(e) = store::remove_session(&path) {
            warn!(session_id, error = %e, "failed to remove session document");
        }
    }

    /// Persist a session's current state to its JSON document.
    ///
    /// The snapshot is taken under the session lock; the write happens
    /// after it is released.
    pub fn persist(&self, session_id: &str) -> Result<(), store::StoreError> {
        let Some(memory) = self.lock_sessions().get(session_id).map(Arc::clone) else {
            return Ok(());
        };

        let interactions = memory
            .interactions()
            .into_iter()
            .map(|interaction| {
                let reasoning_trace = memory.trace_entries(interaction.id);
                store::PersistedInteraction {
                    interaction,
                    reasoning_trace,
                }
            })
            .collect();

        let doc = store::SessionDocument {
            schema_version: store::SCHEMA_VERSION,
            interactions,
            planning_context: memory.context(),
        };

        let path = store::session_path(&self.base_dir, &self.user, session_id);
        store::save_session(&path, &doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Complexity, ReplyStatus, StepStatus};
    use serde_json::json;

    fn step_result(step_id: u32, payload: serde_json::Value) -> StepResult {
        StepResult {
            step_id,
            status: StepStatus::Success,
            payload,
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_add_and_snapshot() {
        let memory = SessionMemory::new("s1", false);
        let id = memory.add_interaction("find duplicates");

        let snap = memory.snapshot(id).expect("snapshot");
        assert_eq!(snap.user_request, "find duplicates");
        assert!(snap.plan.is_none());
        assert!(!snap.is_sealed());
    }

    #[test]
    fn test_snapshot_is_deep_copy() {
        let memory = SessionMemory::new("s1", false);
        let id = memory.add_interaction("request");

        let snap = memory.snapshot(id).expect("snapshot");
        memory.set_step_result(id, step_result(1, json!({"n": 1})));

        // The earlier snapshot does not see the later mutation.
        assert!(snap.step_results.is_empty());
        let fresh = memory.snapshot(id).expect("snapshot");
        assert_eq!(fresh.step_results.len(), 1);
    }

    #[test]
    fn test_step_payloads() {
        let memory = SessionMemory::new("s1", false);
        let id = memory.add_interaction("request");
        memory.set_step_result(id, step_result(1, json!({"total": 2})));
        memory.set_step_result(id, step_result(2, json!("text")));

        let payloads = memory.step_payloads(id);
        assert_eq!(payloads.get(&1), Some(&json!({"total": 2})));
        assert_eq!(payloads.get(&2), Some(&json!("text")));
    }

    #[test]
    fn test_seal_and_plan() {
        let memory = SessionMemory::new("s1", false);
        let id = memory.add_interaction("request");

        memory.set_plan(
            id,
            Plan {
                goal: "g".to_owned(),
                complexity: Complexity::Simple,
                steps: vec![],
            },
        );
        memory.seal(
            id,
            ReplyPayload {
                message: "done".to_owned(),
                details: None,
                artifacts: vec![],
                status: ReplyStatus::Success,
            },
        );

        let snap = memory.snapshot(id).expect("snapshot");
        assert!(snap.plan.is_some());
        assert!(snap.is_sealed());
    }

    #[test]
    fn test_planning_context() {
        let memory = SessionMemory::new("s1", false);
        memory.set_context("favorite_folder", json!("/home/u/docs"));

        assert_eq!(
            memory.get_context("favorite_folder"),
            Some(json!("/home/u/docs"))
        );
        assert_eq!(memory.get_context("missing"), None);
        assert_eq!(memory.context().len(), 1);
    }

    #[test]
    fn test_clear() {
        let memory = SessionMemory::new("s1", false);
        memory.add_interaction("one");
        memory.set_context("k", json!(1));

        memory.clear();

        assert!(memory.interactions().is_empty());
        assert!(memory.context().is_empty());
    }

    #[test]
    fn test_trace_noop_when_disabled() {
        let memory = SessionMemory::new("s1", false);
        let id = memory.add_interaction("request");

        memory.start_reasoning_trace(id);
        let entry = memory.add_reasoning_entry(
            id,
            TraceStage::Planning,
            "thinking",
            NewEntry::default(),
        );
        assert!(entry.is_none());
        assert!(!memory.update_reasoning_entry(Uuid::new_v4(), TraceUpdate::default()));
        assert_eq!(memory.get_reasoning_summary(10, false), "");
        assert!(memory.get_pending_commitments().is_empty());
        assert!(memory.get_trace_attachments().is_empty());
        assert!(memory.get_trace_corrections().is_empty());
    }

    #[test]
    fn test_trace_enabled_records() {
        let memory = SessionMemory::new("s1", true);
        let id = memory.add_interaction("request");
        memory.start_reasoning_trace(id);

        let entry_id = memory
            .add_reasoning_entry(
                id,
                TraceStage::Planning,
                "will email the report",
                NewEntry {
                    commitments: vec!["send_email".to_owned()],
                    ..NewEntry::default()
                },
            )
            .expect("entry id");

        assert_eq!(memory.get_pending_commitments(), vec!["send_email"]);

        let updated = memory.update_reasoning_entry(
            entry_id,
            TraceUpdate {
                outcome: Some(TraceOutcome::Success),
                ..TraceUpdate::default()
            },
        );
        assert!(updated);
        assert!(memory.get_pending_commitments().is_empty());

        let summary = memory.get_reasoning_summary(10, false);
        assert!(summary.contains("will email the report"));
    }

    #[test]
    fn test_store_roundtrip() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = MemoryStore::new(dir.path().to_path_buf(), "alice", true);

        let memory = store.session("s1");
        let id = memory.add_interaction("find duplicates");
        memory.set_step_result(id, step_result(1, json!({"total": 2})));
        memory.set_context("k", json!("v"));
        memory.add_reasoning_entry(id, TraceStage::Planning, "planning", NewEntry::default());
        store.persist("s1").expect("persist");

        // A fresh store instance reloads the document from disk.
        let reloaded = MemoryStore::new(dir.path().to_path_buf(), "alice", true);
        let memory2 = reloaded.session("s1");
        let interactions = memory2.interactions();
        assert_eq!(interactions.len(), 1);
        assert_eq!(interactions[0].user_request, "find duplicates");
        assert_eq!(interactions[0].step_results.len(), 1);
        assert_eq!(memory2.get_context("k"), Some(json!("v")));
        assert_eq!(memory2.trace_entries(interactions[0].id).len(), 1);
    }

    #[test]
    fn test_store_clear_removes_document() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = MemoryStore::new(dir.path().to_path_buf(), "alice", false);

        let memory = store.session("s1");
        memory.add_interaction("request");
        store.persist("s1").expect("persist");
        store.clear("s1");

        assert!(memory.interactions().is_empty());
        let reloaded = MemoryStore::new(dir.path().to_path_buf(), "alice", false);
        assert!(reloaded.session("s1").interactions().is_empty());
    }
}
