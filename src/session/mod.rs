//! Session task lifecycle: at-most-one active task per session,
//! cooperative cancellation, and clear semantics.
//!
//! [`SessionTaskManager`] holds the active task and cancel signal per
//! session id behind a single mutex that is only ever held during map
//! mutation, never while tool work runs. The atomic check-and-register in
//! [`SessionTaskManager::submit`] guarantees at-most-one-active-task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::memory::MemoryStore;

// ── Cancellation ────────────────────────────────────────────────

/// Sending half of a one-shot cancel broadcast.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fire the signal. Idempotent; never blocks.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// A fresh observer of this signal.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observing half of a one-shot cancel broadcast. Cheap to clone; every
/// clone sees the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Suspend until the signal fires. If the sending half is dropped
    /// without firing, this never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected cancel handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

// ── Session task manager ────────────────────────────────────────

/// Task lifecycle errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A task is already running for this session.
    #[error("a task is already running for session '{session_id}'")]
    AlreadyRunning {
        /// The busy session.
        session_id: String,
    },
}

struct SessionTask {
    task_id: uuid::Uuid,
    handle: Option<JoinHandle<()>>,
    cancel: CancelHandle,
    started_at: DateTime<Utc>,
}

/// Owns the active task and cancel signal for each session.
pub struct SessionTaskManager {
    tasks: Mutex<HashMap<String, SessionTask>>,
    memory: Arc<MemoryStore>,
}

/// Removes the session's map entry when the task future finishes,
/// including on panic.
struct CompletionGuard {
    manager: Arc<SessionTaskManager>,
    session_id: String,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.manager.on_task_complete(&self.session_id);
    }
}

impl SessionTaskManager {
    /// Create a manager over the given memory store.
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            memory,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The memory store this manager clears through.
    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Atomically check-and-register a task for the session, then start it.
    ///
    /// The work closure receives the task's [`CancelToken`]. If a task is
    /// already registered for `session_id`, nothing is spawned.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyRunning`] when the session is busy.
    pub fn submit<F, Fut>(
        self: &Arc<Self>,
        session_id: &str,
        work: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (handle, token) = cancel_pair();
        let task_id = uuid::Uuid::new_v4();

        {
            let mut tasks = self.lock();
            if tasks.contains_key(session_id) {
                return Err(SessionError::AlreadyRunning {
                    session_id: session_id.to_owned(),
                });
            }
            tasks.insert(
                session_id.to_owned(),
                SessionTask {
                    task_id,
                    handle: None,
                    cancel: handle,
                    started_at: Utc::now(),
                },
            );
        }

        let guard = CompletionGuard {
            manager: Arc::clone(self),
            session_id: session_id.to_owned(),
        };
        let fut = work(token);
        let join = tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        });

        // Store the handle so `clear` can join. The task id check keeps a
        // stale handle from attaching to a newer task when this one
        // finished (and deregistered) before we got here.
        if let Some(task) = self.lock().get_mut(session_id) {
            if task.task_id == task_id {
                task.handle = Some(join);
            }
        }

        debug!(session_id, "session task registered");
        Ok(())
    }

    /// Fire the session's cancel signal, if a task is active.
    /// Does not wait; repeated calls are idempotent.
    pub fn cancel(&self, session_id: &str) {
        if let Some(task) = self.lock().get(session_id) {
            info!(session_id, "cancelling session task");
            task.cancel.cancel();
        }
    }

    /// Cancel any active task, wait for its cleanup to finish, then clear
    /// the session's memory and persisted document.
    pub async fn clear(&self, session_id: &str) {
        let handle = {
            let mut tasks = self.lock();
            match tasks.get_mut(session_id) {
                Some(task) => {
                    task.cancel.cancel();
                    task.handle.take()
                }
                None => None,
            }
        };

        if let Some(handle) = handle {
            // Joining outside the lock: the task's completion guard also
            // takes the lock to deregister itself.
            let _ = handle.await;
        }

        self.memory.clear(session_id);
        info!(session_id, "session cleared");
    }

    /// Deregister a finished task. Called from the task's completion guard.
    pub fn on_task_complete(&self, session_id: &str) {
        self.lock().remove(session_id);
        debug!(session_id, "session task complete");
    }

    /// Whether a task is currently registered for the session.
    pub fn is_active(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// When the session's active task started, if any.
    pub fn active_since(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.lock().get(session_id).map(|t| t.started_at)
    }
}
