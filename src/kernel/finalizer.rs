//! Reply finalization: the terminal step's payload becomes the
//! user-visible reply.
//!
//! Pure, total, and LLM-free: for every executed plan there is exactly one
//! reply payload with a non-empty message. Structured `details` go through
//! the reply formatter; artifacts pass through unchanged.

use std::collections::BTreeMap;

use crate::types::{Plan, ReplyPayload, ReplyStatus, StepResult, StepStatus};

use super::formatter;

/// Fallback message when the terminal payload carries none.
const FALLBACK_MESSAGE: &str = "Done.";

/// Build the user-visible reply from the terminal step's finalized result.
///
/// Status rules:
/// - `error` when the terminal step errored or never produced a result
/// - `cancelled` when the terminal step was skipped
/// - `partial_success` when any non-terminal step errored but a reply was
///   still produced
/// - `success` otherwise
pub fn finalize(plan: &Plan, step_results: &BTreeMap<u32, StepResult>) -> ReplyPayload {
    let Some(terminal) = plan.terminal_step() else {
        // Validation guarantees a terminal step; stay total anyway.
        return ReplyPayload {
            message: "The request produced no reply step.".to_owned(),
            details: None,
            artifacts: vec![],
            status: ReplyStatus::Error,
        };
    };

    let Some(result) = step_results.get(&terminal.id) else {
        return ReplyPayload {
            message: "The reply step never ran.".to_owned(),
            details: None,
            artifacts: vec![],
            status: ReplyStatus::Error,
        };
    };

    match result.status {
        StepStatus::Skipped => ReplyPayload {
            message: "The request was cancelled before completion.".to_owned(),
            details: None,
            artifacts: vec![],
            status: ReplyStatus::Cancelled,
        },
        StepStatus::Error => {
            let reason = result
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown error".to_owned());
            ReplyPayload {
                message: format!("The reply could not be composed: {reason}"),
                details: None,
                artifacts: vec![],
                status: ReplyStatus::Error,
            }
        }
        StepStatus::Success => {
            let payload = &result.payload;

            let message = payload
                .get("message")
                .and_then(serde_json::Value::as_str)
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(FALLBACK_MESSAGE)
                .to_owned();

            let details = payload
                .get("details")
                .filter(|d| !d.is_null())
                .map(formatter::format_details)
                .filter(|rendered| !rendered.is_empty());

            let artifacts: Vec<String> = payload
                .get("artifacts")
                .and_then(serde_json::Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(serde_json::Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();

            let any_nonterminal_error = step_results
                .values()
                .any(|r| r.step_id != terminal.id && r.status == StepStatus::Error);

            ReplyPayload {
                message,
                details,
                artifacts,
                status: if any_nonterminal_error {
                    ReplyStatus::PartialSuccess
                } else {
                    ReplyStatus::Success
                },
            }
        }
    }
}
