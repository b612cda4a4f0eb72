//! Model router applying per-agent defaults and model constraints.
//!
//! Resolution order for the sampling temperature:
//! 1. `models.agent_defaults.<agent>` from configuration
//! 2. `models.constraints` patterns matched against the model name
//!    (first match wins, overriding the agent default)
//! 3. provider default when neither applies

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use regex::Regex;
use tracing::debug;

use crate::config::{LlmConfig, ModelsConfig};

use super::{ChatMessage, CompletionRequest, LlmProvider, ProviderError};

struct CompiledConstraint {
    pattern: Regex,
    temperature: f32,
    reason: String,
}

/// Routes completions to the configured provider with resolved sampling
/// parameters per agent role.
pub struct ModelRouter {
    provider: Arc<dyn LlmProvider>,
    model: String,
    constraints: Vec<CompiledConstraint>,
    agent_defaults: HashMap<String, f32>,
}

impl ModelRouter {
    /// Build a router from configuration over a concrete provider.
    ///
    /// # Errors
    ///
    /// Returns an error if a constraint pattern is not a valid regex.
    pub fn from_config(
        models: &ModelsConfig,
        llm: &LlmConfig,
        provider: Arc<dyn LlmProvider>,
    ) -> anyhow::Result<Self> {
        let mut constraints = Vec::with_capacity(models.constraints.len());
        for constraint in &models.constraints {
            let pattern = Regex::new(&constraint.pattern)
                .with_context(|| format!("invalid model constraint pattern '{}'", constraint.pattern))?;
            constraints.push(CompiledConstraint {
                pattern,
                temperature: constraint.temperature,
                reason: constraint.reason.clone(),
            });
        }

        let agent_defaults = models
            .agent_defaults
            .iter()
            .map(|(agent, defaults)| (agent.clone(), defaults.temperature))
            .collect();

        Ok(Self {
            provider,
            model: llm.model.clone(),
            constraints,
            agent_defaults,
        })
    }

    /// Create a router with no constraints for integration tests.
    #[doc(hidden)]
    pub fn for_testing(model: &str, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            model: model.to_owned(),
            constraints: Vec::new(),
            agent_defaults: HashMap::new(),
        }
    }

    /// The model name requests are routed to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Resolve the temperature for an agent against the active model.
    pub fn effective_temperature(&self, agent: &str) -> Option<f32> {
        let mut temperature = self.agent_defaults.get(agent).copied();

        for constraint in &self.constraints {
            if constraint.pattern.is_match(&self.model) {
                debug!(
                    model = %self.model,
                    temperature = constraint.temperature,
                    reason = %constraint.reason,
                    "model constraint applied"
                );
                temperature = Some(constraint.temperature);
                break;
            }
        }

        temperature
    }

    /// Run one completion on behalf of an agent role.
    ///
    /// # Errors
    ///
    /// Propagates any [`ProviderError`] from the underlying provider.
    pub async fn complete_for(
        &self,
        agent: &str,
        messages: Vec<ChatMessage>,
        max_tokens: Option<u32>,
    ) -> Result<String, ProviderError> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: self.effective_temperature(agent),
            max_tokens,
        };
        let response = self.provider.complete(request).await?;
        Ok(response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentDefaults, ModelConstraint};
    use crate::providers::CompletionResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records the requests it receives and replies with a fixed string.
    struct RecordingProvider {
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl RecordingProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
            })
        }

        fn last_temperature(&self) -> Option<f32> {
            self.requests
                .lock()
                .expect("test lock")
                .last()
                .and_then(|r| r.temperature)
        }
    }

    #[async_trait]
    impl LlmProvider for RecordingProvider {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            let model = request.model.clone();
            self.requests.lock().expect("test lock").push(request);
            Ok(CompletionResponse {
                text: "ok".to_owned(),
                model,
            })
        }
    }

    fn models_config() -> ModelsConfig {
        ModelsConfig {
            constraints: vec![ModelConstraint {
                pattern: "^o[13]".to_owned(),
                temperature: 1.0,
                reason: "reasoning models reject custom temperatures".to_owned(),
            }],
            agent_defaults: HashMap::from([
                ("planner".to_owned(), AgentDefaults { temperature: 0.2 }),
                ("critic".to_owned(), AgentDefaults { temperature: 0.0 }),
            ]),
        }
    }

    fn llm_config(model: &str) -> LlmConfig {
        LlmConfig {
            model: model.to_owned(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_agent_default_applies() {
        let router = ModelRouter::from_config(
            &models_config(),
            &llm_config("gpt-4o"),
            RecordingProvider::new(),
        )
        .expect("router");

        assert_eq!(router.effective_temperature("planner"), Some(0.2));
        assert_eq!(router.effective_temperature("critic"), Some(0.0));
        assert_eq!(router.effective_temperature("unknown"), None);
    }

    #[test]
    fn test_constraint_overrides_agent_default() {
        let router = ModelRouter::from_config(
            &models_config(),
            &llm_config("o1-preview"),
            RecordingProvider::new(),
        )
        .expect("router");

        // The "^o[13]" constraint forces 1.0 regardless of agent defaults.
        assert_eq!(router.effective_temperature("planner"), Some(1.0));
        assert_eq!(router.effective_temperature("unknown"), Some(1.0));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut models = models_config();
        models.constraints.push(ModelConstraint {
            pattern: "[unclosed".to_owned(),
            temperature: 0.5,
            reason: String::new(),
        });
        let result =
            ModelRouter::from_config(&models, &llm_config("gpt-4o"), RecordingProvider::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_complete_for_threads_temperature() {
        let provider = RecordingProvider::new();
        let router = ModelRouter::from_config(
            &models_config(),
            &llm_config("gpt-4o"),
            Arc::clone(&provider) as Arc<dyn LlmProvider>,
        )
        .expect("router");

        let text = router
            .complete_for("planner", vec![ChatMessage::user("plan this")], Some(256))
            .await
            .expect("completion");

        assert_eq!(text, "ok");
        assert_eq!(provider.last_temperature(), Some(0.2));
    }
}
