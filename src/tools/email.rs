//! The `compose_email` delivery tool.
//!
//! Builds an outbound email from resolved parameters and hands it to a
//! [`Mailer`] backend. The real mail transport is an external collaborator
//! behind the trait; the default [`LogMailer`] records the message and
//! returns a synthetic id, which is enough for drafts and tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{ParamSpec, Tool, ToolContext, ToolError, ToolSpec};

/// Tool name registered for delivery enforcement.
pub const COMPOSE_EMAIL: &str = "compose_email";

/// An email ready for the transport backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEmail {
    /// Recipient address; the owner's own address when omitted.
    pub to: Option<String>,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
    /// File paths to attach.
    pub attachments: Vec<String>,
    /// Send immediately (`true`) or leave as a draft (`false`).
    pub send: bool,
}

/// Mail transport contract.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver (or draft) the message; returns the backend's message id.
    async fn deliver(&self, email: &OutboundEmail) -> Result<String, ToolError>;
}

/// Default backend: logs the outbound message and keeps it in memory.
#[derive(Default)]
pub struct LogMailer {
    delivered: Mutex<Vec<OutboundEmail>>,
}

impl LogMailer {
    /// Create an empty logging mailer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages handed to this backend so far.
    pub fn delivered(&self) -> Vec<OutboundEmail> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn deliver(&self, email: &OutboundEmail) -> Result<String, ToolError> {
        let message_id = format!("draft-{}", Uuid::new_v4());
        info!(
            to = email.to.as_deref().unwrap_or("(owner)"),
            subject = %email.subject,
            send = email.send,
            attachments = email.attachments.len(),
            %message_id,
            "outbound email recorded"
        );
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(email.clone());
        Ok(message_id)
    }
}

/// Handler for `compose_email`.
pub struct ComposeEmailTool {
    mailer: Arc<dyn Mailer>,
}

impl ComposeEmailTool {
    /// Create the handler over a mail backend.
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    /// Registration spec. Delivery-terminal; not pure (sending twice
    /// sends twice).
    pub fn spec() -> ToolSpec {
        ToolSpec {
            name: COMPOSE_EMAIL.to_owned(),
            description: "Compose an email, optionally sending it, with optional attachments"
                .to_owned(),
            parameters: vec![
                ParamSpec::new("to", "string", false),
                ParamSpec::new("subject", "string", false),
                ParamSpec::new("body", "string", false),
                ParamSpec::new("attachments", "array", false),
                ParamSpec::new("send", "boolean", false),
            ],
            delivery_terminal: true,
            pure: false,
            default_deadline_ms: None,
        }
    }
}

#[async_trait]
impl Tool for ComposeEmailTool {
    fn name(&self) -> &str {
        COMPOSE_EMAIL
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let body = params
            .get("body")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_owned();
        let attachments: Vec<String> = params
            .get("attachments")
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        if body.trim().is_empty() && attachments.is_empty() {
            return Err(ToolError::InvalidInput(
                "an email needs a non-empty body or at least one attachment".to_owned(),
            ));
        }

        let email = OutboundEmail {
            to: params
                .get("to")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned),
            subject: params
                .get("subject")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("(no subject)")
                .to_owned(),
            body,
            attachments,
            send: params
                .get("send")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
        };

        let message_id = self.mailer.deliver(&email).await?;

        Ok(serde_json::json!({
            "message_id": message_id,
            "sent": email.send,
            "recipient": email.to,
            "attachment_count": email.attachments.len(),
        }))
    }
}
