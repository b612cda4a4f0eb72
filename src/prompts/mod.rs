//! Named markdown prompt sections, loaded once at startup.
//!
//! Built-in sections cover the planner role, delivery guidance, repair and
//! replan critiques, and the critic role. A configured prompts directory
//! may override any section by file name (`<section>.md`).

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

/// Section names recognized by the orchestration core.
pub mod sections {
    /// Planner role and plan JSON contract.
    pub const PLANNER_ROLE: &str = "planner_role";
    /// Extra guidance injected when delivery intent is detected.
    pub const DELIVERY_GUIDANCE: &str = "delivery_guidance";
    /// Critique framing for validator-driven repair rounds.
    pub const REPAIR_GUIDANCE: &str = "repair_guidance";
    /// Critique framing for critic-driven replans.
    pub const REPLAN_GUIDANCE: &str = "replan_guidance";
    /// Critic role and guidance JSON contract.
    pub const CRITIC_ROLE: &str = "critic_role";
}

const PLANNER_ROLE_TEXT: &str = "\
You are the Planner for a personal assistant. Turn the user's request into
a JSON plan: a dependency-ordered list of tool invocations.

Rules:
- Use only tools from the Available Tools list.
- Step ids are integers starting at 1, strictly increasing.
- A step's `dependencies` may only name lower step ids.
- Reference earlier results in parameters with `$stepN.field.path`
  (whole-value, keeps the JSON type) or `{$stepN.field.path}` inside a
  longer string. Every referenced step must appear in `dependencies`.
- The last step must be `reply_to_user` with a `message` parameter and,
  when useful, `details` and `artifacts`.
- Assess `complexity` as one of: simple, medium, complex, impossible.
- If the request cannot be done with the available tools, return
  complexity `impossible` and a single `reply_to_user` step explaining why.

Output exactly one JSON object:
{
  \"goal\": \"...\",
  \"complexity\": \"simple\",
  \"steps\": [
    {\"id\": 1, \"action\": \"tool_name\", \"parameters\": {...},
     \"dependencies\": [], \"reasoning\": \"...\", \"expected_output\": \"...\"}
  ]
}";

const DELIVERY_GUIDANCE_TEXT: &str = "\
The user asked for the result to be delivered. The plan MUST include a
`compose_email` step with `send: true`, wired to the artifacts or summary
the user asked to receive. Do not reply that delivery is unsupported.";

const REPAIR_GUIDANCE_TEXT: &str = "\
Your previous plan was rejected by validation. Produce a corrected plan
that fixes every violation listed below while preserving the original
goal. Do not repeat the rejected structure.";

const REPLAN_GUIDANCE_TEXT: &str = "\
Execution of the previous plan failed partway. Completed step results are
listed below and remain available: reference them with their original step
ids instead of redoing that work. Produce a new plan for the remaining
work that follows the critic guidance.";

const CRITIC_ROLE_TEXT: &str = "\
You are the Critic. A plan step failed; judge whether it can be salvaged.

You receive the failing step, its resolved parameters, the error payload,
and relevant earlier results.

Output exactly one JSON object:
{
  \"should_retry\": true|false,
  \"suggested_parameter_adjustments\": {\"param\": \"new value\"} | null,
  \"alternative_tool\": \"tool_name\" | null,
  \"rationale\": \"one or two sentences\"
}

Suggest `should_retry: true` with parameter adjustments only when a
different parameterization plausibly fixes the failure. Suggest an
alternative tool only if one clearly fits better.";

/// Immutable store of named markdown prompt sections.
pub struct PromptStore {
    store: HashMap<String, String>,
}

impl PromptStore {
    /// The embedded default sections.
    pub fn builtin() -> Self {
        let mut store = HashMap::new();
        store.insert(sections::PLANNER_ROLE.to_owned(), PLANNER_ROLE_TEXT.to_owned());
        store.insert(
            sections::DELIVERY_GUIDANCE.to_owned(),
            DELIVERY_GUIDANCE_TEXT.to_owned(),
        );
        store.insert(
            sections::REPAIR_GUIDANCE.to_owned(),
            REPAIR_GUIDANCE_TEXT.to_owned(),
        );
        store.insert(
            sections::REPLAN_GUIDANCE.to_owned(),
            REPLAN_GUIDANCE_TEXT.to_owned(),
        );
        store.insert(sections::CRITIC_ROLE.to_owned(), CRITIC_ROLE_TEXT.to_owned());
        Self { store }
    }

    /// Built-ins plus any `<section>.md` overrides found in `dir`.
    ///
    /// Unreadable files are skipped with a warning; the built-in text
    /// stays in place.
    pub fn load(dir: Option<&Path>) -> Self {
        let mut prompts = Self::builtin();
        let Some(dir) = dir else {
            return prompts;
        };

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "prompts directory unreadable, using built-ins");
                return prompts;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    debug!(section = name, "prompt section overridden");
                    prompts.store.insert(name.to_owned(), text);
                }
                Err(e) => warn!(section = name, error = %e, "failed to read prompt override"),
            }
        }

        prompts
    }

    /// Look up a section by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.store.get(name).map(String::as_str)
    }

    /// Look up a section, falling back to empty text.
    pub fn section(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }
}
