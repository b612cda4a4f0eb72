//! Core data model shared across the orchestration pipeline.
//!
//! A [`Plan`] is a DAG of [`Step`]s terminating in a `reply_to_user` step.
//! Executing a step produces a [`StepResult`]; one user request handled
//! end-to-end is an [`Interaction`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Action name of the terminal step every plan must end with.
pub const REPLY_ACTION: &str = "reply_to_user";

// ── Plan ────────────────────────────────────────────────────────

/// Planner-assessed difficulty of a user request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// One or two steps, no fan-in.
    Simple,
    /// A handful of dependent steps.
    Medium,
    /// Many steps or wide fan-out.
    Complex,
    /// Cannot be accomplished with the registered tools.
    Impossible,
}

/// A single planned tool invocation.
///
/// `parameters` values may embed template references (`$stepN.path` or
/// `{$stepN.path}`) that the executor resolves against earlier results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Monotonic identifier, unique within the plan, starting at 1.
    pub id: u32,
    /// Tool name; must exist in the tool registry.
    pub action: String,
    /// Named arguments for the tool.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Ids of earlier steps this step consumes results from.
    #[serde(default)]
    pub dependencies: Vec<u32>,
    /// Why the planner chose this step.
    #[serde(default)]
    pub reasoning: String,
    /// What the planner expects the step to produce.
    #[serde(default)]
    pub expected_output: String,
}

/// An ordered list of steps plus the goal they serve.
///
/// Invariant: exactly one terminal `reply_to_user` step; the dependency
/// graph is a DAG with no step depending on an equal or higher id. An
/// `impossible` plan contains a single explanatory `reply_to_user` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Restatement of what the user asked for.
    pub goal: String,
    /// Planner-assessed complexity.
    pub complexity: Complexity,
    /// Steps in id order.
    pub steps: Vec<Step>,
}

impl Plan {
    /// The terminal `reply_to_user` step, if the plan has exactly one.
    pub fn terminal_step(&self) -> Option<&Step> {
        let mut terminals = self.steps.iter().filter(|s| s.action == REPLY_ACTION);
        let first = terminals.next()?;
        if terminals.next().is_some() {
            return None;
        }
        Some(first)
    }
}

// ── Step results ────────────────────────────────────────────────

/// Terminal status of an executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// The tool ran and returned a payload.
    Success,
    /// The tool failed after exhausting retries.
    Error,
    /// Never ran: cancelled, or an upstream dependency failed.
    Skipped,
}

/// Classified error kinds surfaced by tools and the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or missing arguments.
    InvalidInput,
    /// The tool backend reported a failure.
    ToolFailed,
    /// The per-step deadline elapsed.
    DeadlineExceeded,
    /// A file path resolved outside the configured sandbox roots.
    OutOfSandbox,
    /// The request was cancelled mid-flight.
    Cancelled,
    /// Unexpected internal failure.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput => f.write_str("invalid_input"),
            Self::ToolFailed => f.write_str("tool_failed"),
            Self::DeadlineExceeded => f.write_str("deadline_exceeded"),
            Self::OutOfSandbox => f.write_str("out_of_sandbox"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Internal => f.write_str("internal"),
        }
    }
}

/// Error details attached to a failed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    /// Classified error kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Whether re-running the same step might succeed.
    pub retry_possible: bool,
}

/// The finalized record of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Id of the plan step this result belongs to.
    pub step_id: u32,
    /// Terminal status.
    pub status: StepStatus,
    /// Structured payload returned by the tool (null on error/skip).
    pub payload: serde_json::Value,
    /// Error details when `status == Error`.
    pub error: Option<StepError>,
    /// When execution of the step began.
    pub started_at: DateTime<Utc>,
    /// When the step reached its terminal status.
    pub finished_at: DateTime<Utc>,
}

// ── Reply ───────────────────────────────────────────────────────

/// Outcome attached to the user-visible reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Every step succeeded.
    Success,
    /// A non-terminal step errored but a reply was still produced.
    PartialSuccess,
    /// The request could not be completed.
    Error,
    /// The request was cancelled before completion.
    Cancelled,
}

/// The user-visible payload produced by the finalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPayload {
    /// Primary message text.
    pub message: String,
    /// Rendered supporting detail, when the plan produced any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// File paths produced by prior steps, surfaced unchanged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Outcome of the interaction.
    pub status: ReplyStatus,
}

// ── Interaction ─────────────────────────────────────────────────

/// One user request handled end-to-end within a session.
///
/// Created when the request arrives, mutated only by the owning
/// orchestration, sealed when the reply is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    /// Unique interaction identifier.
    pub id: Uuid,
    /// The raw user request text.
    pub user_request: String,
    /// The final accepted plan, once planning succeeds.
    pub plan: Option<Plan>,
    /// Finalized step results keyed by step id.
    #[serde(default)]
    pub step_results: BTreeMap<u32, StepResult>,
    /// The finalized user-visible reply; present once sealed.
    pub reply: Option<ReplyPayload>,
    /// When the request arrived.
    pub created_at: DateTime<Utc>,
}

impl Interaction {
    /// Whether the interaction has been sealed with a reply.
    pub fn is_sealed(&self) -> bool {
        self.reply.is_some()
    }
}

// ── Delivery intent ─────────────────────────────────────────────

/// Structured signal derived from the user request when it contains
/// configured delivery verbs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryIntent {
    /// Whether any configured verb matched.
    pub has_intent: bool,
    /// The verbs that matched, in configuration order.
    pub detected_verbs: Vec<String>,
    /// Tool the plan must include when `has_intent` is true.
    pub required_tool: String,
}

impl DeliveryIntent {
    /// An intent value that enforces nothing.
    pub fn none(required_tool: &str) -> Self {
        Self {
            has_intent: false,
            detected_verbs: Vec::new(),
            required_tool: required_tool.to_owned(),
        }
    }
}
