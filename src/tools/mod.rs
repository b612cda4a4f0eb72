//! Tool handlers and the contract they implement.
//!
//! Each tool is a concrete implementation of the [`Tool`] trait, registered
//! with a [`registry::ToolRegistry`] together with a declarative [`ToolSpec`]
//! (parameter schema, delivery-terminal flag, purity, default deadline).
//! Handlers receive resolved parameters and a per-request [`ToolContext`]
//! carrying the cancel signal and a bounded deadline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::session::CancelToken;
use crate::types::ErrorKind;

pub mod email;
pub mod files;
pub mod registry;
pub mod reply;
pub mod search;

// ── Tool spec ───────────────────────────────────────────────────

/// Declared parameter of a tool: name plus a basic type tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: String,
    /// Basic type tag shown to the planner ("string", "number", "boolean",
    /// "array", "object").
    pub kind: String,
    /// Whether the planner must supply this parameter.
    pub required: bool,
}

impl ParamSpec {
    /// Convenience constructor.
    pub fn new(name: &str, kind: &str, required: bool) -> Self {
        Self {
            name: name.to_owned(),
            kind: kind.to_owned(),
            required,
        }
    }
}

/// Declarative description of a tool, captured at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name the planner selects by.
    pub name: String,
    /// One-line description shown in the capability summary.
    pub description: String,
    /// Parameter names and basic types.
    pub parameters: Vec<ParamSpec>,
    /// Whether this tool satisfies delivery intent (`compose_email`).
    #[serde(default)]
    pub delivery_terminal: bool,
    /// No side effects; safe to retry and to run concurrently with other
    /// pure tools.
    #[serde(default)]
    pub pure: bool,
    /// Per-tool deadline override in milliseconds.
    #[serde(default)]
    pub default_deadline_ms: Option<u64>,
}

// ── Execution context ───────────────────────────────────────────

/// Per-request context handed to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Session the request belongs to.
    pub session_id: String,
    /// Interaction being executed.
    pub interaction_id: Uuid,
    /// One-shot cancellation signal; handlers should observe it at their
    /// own suspension points.
    pub cancel: CancelToken,
    /// Bounded execution time for this invocation.
    pub deadline: Duration,
}

// ── Errors ──────────────────────────────────────────────────────

/// Errors a tool handler (or the registry routing to it) can produce.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The requested tool name is not registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    /// Required parameters are missing or of the wrong type.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The backend reported a failure.
    #[error("{message}")]
    Failed {
        /// What went wrong.
        message: String,
        /// Whether the same invocation might succeed on retry.
        retry_possible: bool,
    },
    /// A file path resolved outside the configured sandbox roots.
    #[error("path outside sandbox: {0}")]
    OutOfSandbox(String),
    /// The per-step deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The request was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    /// Classify into the shared error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTool(_) => ErrorKind::Internal,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Failed { .. } => ErrorKind::ToolFailed,
            Self::OutOfSandbox(_) => ErrorKind::OutOfSandbox,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether re-running the same invocation might succeed.
    ///
    /// Deadline overruns are retryable; sandbox violations, bad input and
    /// cancellation never are.
    pub fn retry_possible(&self) -> bool {
        match self {
            Self::Failed { retry_possible, .. } => *retry_possible,
            Self::DeadlineExceeded => true,
            _ => false,
        }
    }
}

/// The wire shape tools use to report failure inside an `Ok` payload:
/// `{error: true, error_type, error_message, retry_possible}`.
pub fn error_result(error_type: ErrorKind, message: &str, retry_possible: bool) -> serde_json::Value {
    serde_json::json!({
        "error": true,
        "error_type": error_type,
        "error_message": message,
        "retry_possible": retry_possible,
    })
}

/// Whether a payload carries the explicit `{error: true}` shape.
pub fn is_error_result(payload: &serde_json::Value) -> bool {
    payload
        .get("error")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

// ── Tool trait ──────────────────────────────────────────────────

/// A tool handler: receives resolved parameters, returns a JSON payload.
///
/// Handlers signal failure either through `Err(ToolError)` or by returning
/// the explicit error shape (see [`error_result`]); the executor treats
/// both identically.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Name the handler is routed by; must match its registered spec.
    fn name(&self) -> &str;

    /// Execute with resolved parameters.
    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Extract a required string parameter.
pub(crate) fn require_str<'a>(
    params: &'a serde_json::Value,
    field: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(field)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ToolError::InvalidInput(format!("missing required field: {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_result_shape() {
        let payload = error_result(ErrorKind::ToolFailed, "backend down", true);
        assert_eq!(payload["error"], true);
        assert_eq!(payload["error_type"], "tool_failed");
        assert_eq!(payload["error_message"], "backend down");
        assert_eq!(payload["retry_possible"], true);
        assert!(is_error_result(&payload));
    }

    #[test]
    fn test_is_error_result_on_success_payload() {
        assert!(!is_error_result(&serde_json::json!({"status": "ok"})));
        assert!(!is_error_result(&serde_json::json!({"error": false})));
        assert!(!is_error_result(&serde_json::json!(null)));
    }

    #[test]
    fn test_tool_error_kinds() {
        assert_eq!(
            ToolError::InvalidInput("x".to_owned()).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(ToolError::DeadlineExceeded.kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(ToolError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            ToolError::OutOfSandbox("/etc".to_owned()).kind(),
            ErrorKind::OutOfSandbox
        );
    }

    #[test]
    fn test_retry_possible() {
        assert!(ToolError::DeadlineExceeded.retry_possible());
        assert!(ToolError::Failed {
            message: "x".to_owned(),
            retry_possible: true
        }
        .retry_possible());
        assert!(!ToolError::Cancelled.retry_possible());
        assert!(!ToolError::OutOfSandbox("p".to_owned()).retry_possible());
    }

    #[test]
    fn test_require_str() {
        let params = serde_json::json!({"to": "a@b.c"});
        assert_eq!(require_str(&params, "to").expect("present"), "a@b.c");
        assert!(require_str(&params, "subject").is_err());
    }
}
