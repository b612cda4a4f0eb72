//! Wire messages for the client transport.
//!
//! JSON objects tagged by a `type` field. Clients send `request`, `cancel`
//! and `clear`; the server answers with advisory `plan` and `step_update`
//! events and exactly one `reply` or `error` per request.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Plan, ReplyPayload, ReplyStatus, StepStatus};

/// Messages from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a new interaction on a session.
    Request {
        /// Target session.
        session_id: String,
        /// The user's request text.
        text: String,
    },
    /// Cancel the session's in-flight interaction.
    Cancel {
        /// Target session.
        session_id: String,
    },
    /// Cancel and wipe the session's memory.
    Clear {
        /// Target session.
        session_id: String,
    },
}

/// Messages from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Advisory: a plan was accepted and is about to execute.
    Plan {
        /// Interaction the plan belongs to.
        interaction_id: Uuid,
        /// The accepted plan.
        plan: Plan,
    },
    /// Advisory: a step reached a terminal status. May be coalesced.
    StepUpdate {
        /// Interaction the step belongs to.
        interaction_id: Uuid,
        /// The step.
        step_id: u32,
        /// Its terminal status.
        status: StepStatus,
    },
    /// The finalized reply; exactly one per successful request.
    Reply {
        /// Interaction being answered.
        interaction_id: Uuid,
        /// Primary message text.
        message: String,
        /// Rendered supporting detail.
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        /// Artifact paths surfaced unchanged.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<String>,
        /// Interaction outcome.
        status: ReplyStatus,
    },
    /// The request failed before producing a reply.
    Error {
        /// Stable machine-readable kind.
        kind: String,
        /// One-sentence description.
        message: String,
    },
}

impl ServerMessage {
    /// Wrap a finalized reply payload.
    pub fn reply(interaction_id: Uuid, payload: ReplyPayload) -> Self {
        Self::Reply {
            interaction_id,
            message: payload.message,
            details: payload.details,
            artifacts: payload.artifacts,
            status: payload.status,
        }
    }
}
