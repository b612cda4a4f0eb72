//! Critic: structured corrective guidance after a step failure.
//!
//! Given the failing step, its resolved parameters, the error payload and
//! the relevant completed results, the critic produces a
//! [`CriticGuidance`] record that seeds either a single parameter-adjusted
//! retry or a full replan. A guidance that cannot be parsed is treated as
//! no guidance; the orchestrator escalates.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::prompts::{sections, PromptStore};
use crate::providers::router::ModelRouter;
use crate::providers::{ChatMessage, ProviderError};
use crate::types::{Step, StepError};

use super::planner::{extract_json_block, strip_reasoning_tags};

/// Token budget for a critic response.
const MAX_CRITIC_TOKENS: u32 = 1_000;

/// Critic errors.
#[derive(Debug, Error)]
pub enum CriticError {
    /// The response was not a parseable guidance record.
    #[error("failed to parse critic guidance: {0}")]
    InvalidFormat(String),
    /// The provider call itself failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Structured corrective guidance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticGuidance {
    /// Whether the same step is worth one parameter-adjusted retry.
    pub should_retry: bool,
    /// Parameter overrides to merge into the resolved parameters.
    #[serde(default)]
    pub suggested_parameter_adjustments: Option<serde_json::Map<String, serde_json::Value>>,
    /// A better-suited tool, if the critic sees one.
    #[serde(default)]
    pub alternative_tool: Option<String>,
    /// One or two sentences of justification, carried into the replan
    /// prompt.
    pub rationale: String,
}

/// What the critic sees about a failure.
pub struct FailureReport<'a> {
    /// The step that failed.
    pub step: &'a Step,
    /// Its parameters after template resolution.
    pub resolved_parameters: &'a serde_json::Value,
    /// The terminal error.
    pub error: &'a StepError,
    /// Completed step results relevant to the failure, as pretty JSON.
    pub completed_results: String,
}

/// LLM-backed failure reviewer.
pub struct Critic<'a> {
    router: &'a ModelRouter,
    prompts: &'a PromptStore,
}

impl<'a> Critic<'a> {
    /// Create a critic over the model router and prompt store.
    pub fn new(router: &'a ModelRouter, prompts: &'a PromptStore) -> Self {
        Self { router, prompts }
    }

    /// Review a failure and produce guidance.
    ///
    /// # Errors
    ///
    /// Returns [`CriticError::InvalidFormat`] when the model output is not
    /// a guidance record, or a provider error when the call fails.
    pub async fn review(&self, report: &FailureReport<'_>) -> Result<CriticGuidance, CriticError> {
        let messages = self.compose_messages(report);
        let response = self
            .router
            .complete_for("critic", messages, Some(MAX_CRITIC_TOKENS))
            .await?;
        parse_guidance(&response)
    }

    fn compose_messages(&self, report: &FailureReport<'_>) -> Vec<ChatMessage> {
        let params_json = serde_json::to_string_pretty(report.resolved_parameters)
            .unwrap_or_else(|_| "{}".to_owned());

        let body = format!(
            "## Failing Step\n\
             id: {}\naction: {}\nreasoning: {}\n\n\
             ## Resolved Parameters\n{params_json}\n\n\
             ## Error\nkind: {}\nmessage: {}\nretry_possible: {}\n\n\
             ## Completed Results\n{}",
            report.step.id,
            report.step.action,
            report.step.reasoning,
            report.error.kind,
            report.error.message,
            report.error.retry_possible,
            if report.completed_results.is_empty() {
                "none"
            } else {
                &report.completed_results
            },
        );

        vec![
            ChatMessage::system(self.prompts.section(sections::CRITIC_ROLE)),
            ChatMessage::user(&body),
        ]
    }
}

/// Parse a critic response into guidance.
pub fn parse_guidance(response: &str) -> Result<CriticGuidance, CriticError> {
    let cleaned = strip_reasoning_tags(response);
    let trimmed = cleaned.trim();

    if let Ok(guidance) = serde_json::from_str::<CriticGuidance>(trimmed) {
        return Ok(guidance);
    }

    if let Some(block) = extract_json_block(trimmed) {
        if let Ok(guidance) = serde_json::from_str::<CriticGuidance>(block) {
            return Ok(guidance);
        }
    }

    warn!("critic returned unparseable guidance");
    Err(CriticError::InvalidFormat(
        trimmed.chars().take(200).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CompletionRequest, CompletionResponse, LlmProvider};
    use crate::types::ErrorKind;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedProvider(String);

    #[async_trait]
    impl LlmProvider for FixedProvider {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                text: self.0.clone(),
                model: request.model,
            })
        }
    }

    fn step() -> Step {
        Step {
            id: 1,
            action: "folder_find_duplicates".to_owned(),
            parameters: serde_json::Map::new(),
            dependencies: vec![],
            reasoning: "scan the folder".to_owned(),
            expected_output: String::new(),
        }
    }

    fn error() -> StepError {
        StepError {
            kind: ErrorKind::ToolFailed,
            message: "folder not accessible".to_owned(),
            retry_possible: true,
        }
    }

    #[test]
    fn test_parse_guidance_full() {
        let raw = r#"{
            "should_retry": true,
            "suggested_parameter_adjustments": {"folder_path": "/home/user/Documents"},
            "alternative_tool": null,
            "rationale": "The default folder does not exist; try Documents."
        }"#;
        let guidance = parse_guidance(raw).expect("parse");
        assert!(guidance.should_retry);
        let adjustments = guidance
            .suggested_parameter_adjustments
            .expect("adjustments");
        assert_eq!(adjustments["folder_path"], "/home/user/Documents");
        assert!(guidance.alternative_tool.is_none());
    }

    #[test]
    fn test_parse_guidance_fenced() {
        let raw = "```json\n{\"should_retry\": false, \"rationale\": \"give up\"}\n```";
        let guidance = parse_guidance(raw).expect("parse");
        assert!(!guidance.should_retry);
        assert_eq!(guidance.rationale, "give up");
    }

    #[test]
    fn test_parse_guidance_invalid() {
        assert!(matches!(
            parse_guidance("the step failed because of reasons"),
            Err(CriticError::InvalidFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_review_composes_failure_context() {
        let provider = Arc::new(FixedProvider(
            r#"{"should_retry": true, "rationale": "retry"}"#.to_owned(),
        ));
        let router = ModelRouter::for_testing("test-model", provider as _);
        let prompts = PromptStore::builtin();
        let critic = Critic::new(&router, &prompts);

        let step = step();
        let error = error();
        let resolved = serde_json::json!({"folder_path": null});
        let report = FailureReport {
            step: &step,
            resolved_parameters: &resolved,
            error: &error,
            completed_results: String::new(),
        };

        // The composed prompt carries the failure details.
        let messages = critic.compose_messages(&report);
        assert!(messages[0].content.contains("You are the Critic"));
        assert!(messages[1].content.contains("folder_find_duplicates"));
        assert!(messages[1].content.contains("folder not accessible"));
        assert!(messages[1].content.contains("retry_possible: true"));

        let guidance = critic.review(&report).await.expect("review");
        assert!(guidance.should_retry);
    }
}
