//! Planner: turns a user request into a JSON plan via the LLM.
//!
//! The planner is stateless between invocations. It composes a prompt from
//! the prompt-store sections, the registry's capability summary, the
//! session's planning context, and any delivery-intent or repair guidance,
//! then parses the response into a [`Plan`]. Malformed JSON is retried up
//! to a small bound; semantic problems are the validator's job, not ours.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

use crate::prompts::{sections, PromptStore};
use crate::providers::router::ModelRouter;
use crate::providers::{ChatMessage, ProviderError};
use crate::types::{DeliveryIntent, Plan};

/// Attempts at getting well-formed JSON out of the model.
const MAX_PARSE_ATTEMPTS: u32 = 3;

/// Token budget for a planning response.
const MAX_PLAN_TOKENS: u32 = 4_000;

/// Planner errors.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// No parseable plan after all attempts.
    #[error("failed to parse plan from LLM response: {0}")]
    InvalidPlanFormat(String),
    /// The provider call itself failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Why the planner is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// First plan for a fresh request.
    Initial,
    /// Validator rejected the previous plan; fix the listed violations.
    Repair,
    /// Execution failed partway; plan the remaining work.
    Replan,
}

/// Everything the planner sees for one invocation.
pub struct PlannerContext<'a> {
    /// The raw user request.
    pub user_request: &'a str,
    /// Capability summary from the tool registry.
    pub capabilities: String,
    /// Session planning context.
    pub planning_context: &'a BTreeMap<String, serde_json::Value>,
    /// Delivery intent for this request.
    pub delivery_intent: &'a DeliveryIntent,
    /// Rendered reasoning-trace summary, when the trace is enabled.
    pub trace_summary: Option<String>,
    /// Invocation mode.
    pub mode: PlanMode,
    /// Validator critique (repair) or critic rationale (replan).
    pub critique: Option<String>,
    /// Completed step results carried into a replan, as pretty JSON.
    pub completed_results: Option<String>,
}

/// LLM-driven plan generation.
pub struct Planner<'a> {
    router: &'a ModelRouter,
    prompts: &'a PromptStore,
}

impl<'a> Planner<'a> {
    /// Create a planner over the model router and prompt store.
    pub fn new(router: &'a ModelRouter, prompts: &'a PromptStore) -> Self {
        Self { router, prompts }
    }

    /// Produce a plan for the request.
    ///
    /// Retries malformed JSON up to three attempts, then fails with
    /// [`PlannerError::InvalidPlanFormat`].
    pub async fn plan(&self, ctx: &PlannerContext<'_>) -> Result<Plan, PlannerError> {
        let messages = self.compose_messages(ctx);

        let mut last_error = String::new();
        for attempt in 1..=MAX_PARSE_ATTEMPTS {
            let response = self
                .router
                .complete_for("planner", messages.clone(), Some(MAX_PLAN_TOKENS))
                .await?;

            match parse_plan(&response) {
                Ok(plan) => return Ok(plan),
                Err(PlannerError::InvalidPlanFormat(msg)) => {
                    warn!(attempt, error = %msg, "planner returned malformed JSON");
                    last_error = msg;
                }
                Err(other) => return Err(other),
            }
        }

        Err(PlannerError::InvalidPlanFormat(last_error))
    }

    /// Compose the system and user messages for one invocation.
    pub fn compose_messages(&self, ctx: &PlannerContext<'_>) -> Vec<ChatMessage> {
        let mut body = String::new();

        body.push_str("## Request\n");
        body.push_str(ctx.user_request);

        body.push_str("\n\n## Available Tools\n");
        body.push_str(&ctx.capabilities);

        body.push_str("\n\n## Planning Context\n");
        if ctx.planning_context.is_empty() {
            body.push_str("No prior context");
        } else {
            body.push_str(
                &serde_json::to_string_pretty(ctx.planning_context)
                    .unwrap_or_else(|_| "No prior context".to_owned()),
            );
        }

        if ctx.delivery_intent.has_intent {
            body.push_str("\n\n## Delivery\n");
            body.push_str(self.prompts.section(sections::DELIVERY_GUIDANCE));
            body.push_str("\nDetected verbs: ");
            body.push_str(&ctx.delivery_intent.detected_verbs.join(", "));
        }

        if let Some(trace) = &ctx.trace_summary {
            if !trace.is_empty() {
                body.push_str("\n\n## Recent Reasoning\n");
                body.push_str(trace);
            }
        }

        match ctx.mode {
            PlanMode::Initial => {}
            PlanMode::Repair => {
                body.push_str("\n\n## Repair\n");
                body.push_str(self.prompts.section(sections::REPAIR_GUIDANCE));
                if let Some(critique) = &ctx.critique {
                    body.push_str("\n\nViolations:\n");
                    body.push_str(critique);
                }
            }
            PlanMode::Replan => {
                body.push_str("\n\n## Replan\n");
                body.push_str(self.prompts.section(sections::REPLAN_GUIDANCE));
                if let Some(results) = &ctx.completed_results {
                    body.push_str("\n\nCompleted step results:\n");
                    body.push_str(results);
                }
                if let Some(critique) = &ctx.critique {
                    body.push_str("\n\nCritic guidance:\n");
                    body.push_str(critique);
                }
            }
        }

        vec![
            ChatMessage::system(self.prompts.section(sections::PLANNER_ROLE)),
            ChatMessage::user(&body),
        ]
    }
}

/// Parse an LLM response into a [`Plan`].
///
/// Strips reasoning-model tags, then tries raw JSON, then a fenced block.
pub fn parse_plan(response: &str) -> Result<Plan, PlannerError> {
    let cleaned = strip_reasoning_tags(response);
    let trimmed = cleaned.trim();

    if let Ok(plan) = serde_json::from_str::<Plan>(trimmed) {
        return Ok(plan);
    }

    if let Some(block) = extract_json_block(trimmed) {
        if let Ok(plan) = serde_json::from_str::<Plan>(block) {
            return Ok(plan);
        }
    }

    Err(PlannerError::InvalidPlanFormat(format!(
        "could not parse plan from response: {}",
        truncate_for_error(trimmed, 200)
    )))
}

/// Extract JSON content from a markdown code fence.
///
/// Supports both ```` ```json ```` and plain ```` ``` ```` fences.
pub(crate) fn extract_json_block(text: &str) -> Option<&str> {
    let start_marker_json = "```json";
    let start_marker_plain = "```";
    let end_marker = "```";

    let content_start = if let Some(pos) = text.find(start_marker_json) {
        pos.checked_add(start_marker_json.len())?
    } else if let Some(pos) = text.find(start_marker_plain) {
        pos.checked_add(start_marker_plain.len())?
    } else {
        return None;
    };

    let rest = text.get(content_start..)?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);

    let end_pos = rest.find(end_marker)?;
    let content = rest.get(..end_pos)?;
    Some(content.trim())
}

/// Strip `<think>...</think>` blocks some reasoning models wrap their
/// output in, leaving only the actual response.
pub fn strip_reasoning_tags(response: &str) -> String {
    let mut result = response.to_owned();

    while let Some(start) = result.find("<think>") {
        if let Some(end) = result.find("</think>") {
            let tag_end = end.saturating_add("</think>".len());
            result = format!(
                "{}{}",
                result.get(..start).unwrap_or_default(),
                result.get(tag_end..).unwrap_or_default()
            );
        } else {
            result = result.get(..start).unwrap_or_default().to_owned();
            break;
        }
    }

    result
}

/// Truncate a string for inclusion in error messages.
fn truncate_for_error(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        let mut end = max_len;
        while end > 0 && !s.is_char_boundary(end) {
            end = end.saturating_sub(1);
        }
        s.get(..end).unwrap_or(s)
    }
}
