//! The terminal `reply_to_user` tool.
//!
//! Every plan ends with this step. The handler validates and echoes its
//! resolved parameters; the finalizer turns that payload into the
//! user-visible reply. Keeping it a registered tool means the validator's
//! unknown-tool check covers the terminal step like any other.

use std::sync::Arc;

use super::{require_str, ParamSpec, Tool, ToolContext, ToolError, ToolSpec};
use crate::types::REPLY_ACTION;

/// Handler for the terminal reply step.
pub struct ReplyTool;

impl ReplyTool {
    /// Registration spec.
    pub fn spec() -> ToolSpec {
        ToolSpec {
            name: REPLY_ACTION.to_owned(),
            description: "Compose the final reply shown to the user".to_owned(),
            parameters: vec![
                ParamSpec::new("message", "string", true),
                ParamSpec::new("details", "any", false),
                ParamSpec::new("artifacts", "array", false),
                ParamSpec::new("status", "string", false),
            ],
            delivery_terminal: false,
            pure: true,
            default_deadline_ms: None,
        }
    }

    /// Registration factory.
    pub fn factory() -> Arc<dyn Tool> {
        Arc::new(Self)
    }
}

#[async_trait::async_trait]
impl Tool for ReplyTool {
    fn name(&self) -> &str {
        REPLY_ACTION
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        require_str(&params, "message")?;
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::cancel_pair;
    use std::time::Duration;
    use uuid::Uuid;

    fn ctx() -> ToolContext {
        let (_handle, token) = cancel_pair();
        ToolContext {
            session_id: "s1".to_owned(),
            interaction_id: Uuid::nil(),
            cancel: token,
            deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_echoes_parameters() {
        let params = serde_json::json!({
            "message": "Found 2 group(s)",
            "details": [{"a": 1}],
            "artifacts": ["/tmp/x.pdf"]
        });
        let payload = ReplyTool
            .execute(params.clone(), &ctx())
            .await
            .expect("execute");
        assert_eq!(payload, params);
    }

    #[tokio::test]
    async fn test_missing_message_rejected() {
        let err = ReplyTool
            .execute(serde_json::json!({"details": "x"}), &ctx())
            .await
            .expect_err("missing message");
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }
}
