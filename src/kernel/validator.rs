//! Plan validation: structural invariants a plan must satisfy before the
//! executor will touch it.
//!
//! The validator never mutates plans. It returns the ordered list of
//! violations; the orchestrator feeds them back to the planner as a
//! structured critique for up to `planning.max_repair_rounds` repairs.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::warn;

use crate::tools::registry::ToolRegistry;
use crate::types::{Complexity, DeliveryIntent, Plan, REPLY_ACTION};

use super::template;

/// A single invariant violation found in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// A step names a tool that is not registered.
    #[error("step {step_id} uses unknown tool '{action}'")]
    UnknownTool {
        /// Offending step.
        step_id: u32,
        /// The unregistered tool name.
        action: String,
    },
    /// A dependency is missing, self-referential, or a back-edge.
    #[error("step {step_id} has invalid dependency on step {dependency}")]
    InvalidDependency {
        /// Offending step.
        step_id: u32,
        /// The invalid dependency id.
        dependency: u32,
    },
    /// A template reference names a step outside the declared dependencies.
    #[error("step {step_id} references step {referenced_step} without depending on it")]
    DanglingReference {
        /// Offending step.
        step_id: u32,
        /// The referenced but undeclared step.
        referenced_step: u32,
    },
    /// No terminal `reply_to_user` step.
    #[error("plan has no terminal reply_to_user step")]
    MissingTerminal,
    /// More than one `reply_to_user` step.
    #[error("plan has multiple reply_to_user steps")]
    MultipleTerminals,
    /// Delivery intent was detected but the required tool is absent.
    #[error("user asked for delivery but the plan has no '{required_tool}' step")]
    MissingDelivery {
        /// The tool the plan must include.
        required_tool: String,
    },
    /// A `compose_email` step has neither body nor attachments.
    #[error("step {step_id} composes an email with no body and no attachments")]
    EmptyEmail {
        /// Offending step.
        step_id: u32,
    },
    /// Step ids are duplicated or do not start at 1.
    #[error("step id {step_id} is duplicated or out of sequence")]
    DuplicateId {
        /// Offending step id.
        step_id: u32,
    },
    /// An `impossible` plan must be a single explanatory reply step.
    #[error("impossible plan must contain exactly one reply_to_user step")]
    MalformedImpossible,
}

/// Validates plans against the registry and the request's delivery intent.
pub struct PlanValidator<'a> {
    registry: &'a ToolRegistry,
}

impl<'a> PlanValidator<'a> {
    /// Create a validator over the given registry.
    pub fn new(registry: &'a ToolRegistry) -> Self {
        Self { registry }
    }

    /// Check every invariant; returns violations in check order,
    /// empty when the plan is acceptable.
    ///
    /// `reject_missing_tool` downgrades the delivery check to a warning
    /// when false (`delivery.validation.reject_missing_tool`).
    pub fn validate(
        &self,
        plan: &Plan,
        intent: &DeliveryIntent,
        reject_missing_tool: bool,
    ) -> Vec<Violation> {
        let mut violations = Vec::new();

        // Unknown tools.
        for step in &plan.steps {
            if !self.registry.contains(&step.action) {
                violations.push(Violation::UnknownTool {
                    step_id: step.id,
                    action: step.action.clone(),
                });
            }
        }

        // Dependencies: must name existing, strictly lower ids. Since a
        // step may only depend on lower ids, any cycle would need a
        // back-edge, so this check also establishes acyclicity.
        let ids: BTreeSet<u32> = plan.steps.iter().map(|s| s.id).collect();
        for step in &plan.steps {
            for dep in &step.dependencies {
                if *dep >= step.id || !ids.contains(dep) {
                    violations.push(Violation::InvalidDependency {
                        step_id: step.id,
                        dependency: *dep,
                    });
                }
            }
        }

        // Template references must be declared dependencies.
        for step in &plan.steps {
            let params = serde_json::Value::Object(step.parameters.clone());
            let mut referenced = Vec::new();
            template::referenced_steps(&params, &mut referenced);
            referenced.sort_unstable();
            referenced.dedup();
            for referenced_step in referenced {
                if !step.dependencies.contains(&referenced_step) {
                    violations.push(Violation::DanglingReference {
                        step_id: step.id,
                        referenced_step,
                    });
                }
            }
        }

        // Exactly one terminal reply step.
        let terminal_count = plan
            .steps
            .iter()
            .filter(|s| s.action == REPLY_ACTION)
            .count();
        match terminal_count {
            0 => violations.push(Violation::MissingTerminal),
            1 => {}
            _ => violations.push(Violation::MultipleTerminals),
        }

        // Delivery enforcement.
        if intent.has_intent && !plan.steps.iter().any(|s| s.action == intent.required_tool) {
            if reject_missing_tool {
                violations.push(Violation::MissingDelivery {
                    required_tool: intent.required_tool.clone(),
                });
            } else {
                warn!(
                    required_tool = %intent.required_tool,
                    "delivery intent detected but required tool missing (rejection disabled)"
                );
            }
        }

        // compose_email steps need content.
        for step in &plan.steps {
            if self
                .registry
                .spec(&step.action)
                .is_some_and(|spec| spec.delivery_terminal)
            {
                let body_present = step
                    .parameters
                    .get("body")
                    .and_then(serde_json::Value::as_str)
                    .is_some_and(|b| !b.trim().is_empty());
                let attachments_present = step
                    .parameters
                    .get("attachments")
                    .and_then(serde_json::Value::as_array)
                    .is_some_and(|a| !a.is_empty());
                if !body_present && !attachments_present {
                    violations.push(Violation::EmptyEmail { step_id: step.id });
                }
            }
        }

        // Ids: unique, starting at 1.
        let mut seen = BTreeSet::new();
        for step in &plan.steps {
            if !seen.insert(step.id) || step.id == 0 {
                violations.push(Violation::DuplicateId { step_id: step.id });
            }
        }
        if let Some(min) = seen.iter().next() {
            if *min != 1 {
                violations.push(Violation::DuplicateId { step_id: *min });
            }
        }

        // Impossible plans are a single explanatory reply.
        if plan.complexity == Complexity::Impossible
            && (plan.steps.len() != 1 || plan.steps.first().map(|s| s.action.as_str()) != Some(REPLY_ACTION))
        {
            violations.push(Violation::MalformedImpossible);
        }

        violations
    }
}

/// Render violations as a numbered critique for the repair prompt.
pub fn critique(violations: &[Violation]) -> String {
    violations
        .iter()
        .enumerate()
        .map(|(i, v)| format!("{}. {v}", i.saturating_add(1)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{email::ComposeEmailTool, reply::ReplyTool, ParamSpec, Tool, ToolContext, ToolError, ToolSpec};
    use crate::types::Step;
    use std::sync::Arc;

    struct NoopTool(&'static str);

    #[async_trait::async_trait]
    impl Tool for NoopTool {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(
            &self,
            _params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(ReplyTool::spec(), ReplyTool::factory);
        registry.register(ComposeEmailTool::spec(), || {
            Arc::new(NoopTool("compose_email"))
        });
        registry.register(
            ToolSpec {
                name: "google_search".to_owned(),
                description: "Search".to_owned(),
                parameters: vec![ParamSpec::new("query", "string", true)],
                delivery_terminal: false,
                pure: true,
                default_deadline_ms: None,
            },
            || Arc::new(NoopTool("google_search")),
        );
        registry
    }

    fn step(id: u32, action: &str, params: serde_json::Value, deps: &[u32]) -> Step {
        Step {
            id,
            action: action.to_owned(),
            parameters: params.as_object().cloned().unwrap_or_default(),
            dependencies: deps.to_vec(),
            reasoning: String::new(),
            expected_output: String::new(),
        }
    }

    fn plan(complexity: Complexity, steps: Vec<Step>) -> Plan {
        Plan {
            goal: "test".to_owned(),
            complexity,
            steps,
        }
    }

    fn no_intent() -> DeliveryIntent {
        DeliveryIntent::none("compose_email")
    }

    fn intent() -> DeliveryIntent {
        DeliveryIntent {
            has_intent: true,
            detected_verbs: vec!["email".to_owned()],
            required_tool: "compose_email".to_owned(),
        }
    }

    #[test]
    fn test_well_formed_plan_accepted() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);
        let plan = plan(
            Complexity::Simple,
            vec![
                step(1, "google_search", serde_json::json!({"query": "x"}), &[]),
                step(
                    2,
                    REPLY_ACTION,
                    serde_json::json!({"message": "{$step1.summary}"}),
                    &[1],
                ),
            ],
        );
        assert!(validator.validate(&plan, &no_intent(), true).is_empty());
    }

    #[test]
    fn test_unknown_tool() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);
        let plan = plan(
            Complexity::Simple,
            vec![
                step(1, "teleport", serde_json::json!({}), &[]),
                step(2, REPLY_ACTION, serde_json::json!({"message": "m"}), &[]),
            ],
        );
        let violations = validator.validate(&plan, &no_intent(), true);
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::UnknownTool { step_id: 1, .. })));
    }

    #[test]
    fn test_back_edge_rejected() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);

        // Self-dependency and a forward dependency are both back-edges.
        let plan = plan(
            Complexity::Medium,
            vec![
                step(1, "google_search", serde_json::json!({"query": "x"}), &[2]),
                step(2, "google_search", serde_json::json!({"query": "y"}), &[2]),
                step(3, REPLY_ACTION, serde_json::json!({"message": "m"}), &[]),
            ],
        );
        let violations = validator.validate(&plan, &no_intent(), true);
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::InvalidDependency { step_id: 1, dependency: 2 })));
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::InvalidDependency { step_id: 2, dependency: 2 })));
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);
        let plan = plan(
            Complexity::Simple,
            vec![
                step(2, "google_search", serde_json::json!({"query": "x"}), &[1]),
                step(3, REPLY_ACTION, serde_json::json!({"message": "m"}), &[]),
            ],
        );
        let violations = validator.validate(&plan, &no_intent(), true);
        // Dependency on absent step 1, and ids do not start at 1.
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::InvalidDependency { step_id: 2, dependency: 1 })));
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::DuplicateId { step_id: 2 })));
    }

    #[test]
    fn test_dangling_reference() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);
        let plan = plan(
            Complexity::Simple,
            vec![
                step(1, "google_search", serde_json::json!({"query": "x"}), &[]),
                step(
                    2,
                    REPLY_ACTION,
                    serde_json::json!({"message": "{$step1.summary}"}),
                    &[],
                ),
            ],
        );
        let violations = validator.validate(&plan, &no_intent(), true);
        assert!(violations.iter().any(|v| matches!(
            v,
            Violation::DanglingReference {
                step_id: 2,
                referenced_step: 1
            }
        )));
    }

    #[test]
    fn test_missing_terminal() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);
        let plan = plan(
            Complexity::Simple,
            vec![step(1, "google_search", serde_json::json!({"query": "x"}), &[])],
        );
        let violations = validator.validate(&plan, &no_intent(), true);
        assert!(violations.contains(&Violation::MissingTerminal));
    }

    #[test]
    fn test_multiple_terminals() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);
        let plan = plan(
            Complexity::Simple,
            vec![
                step(1, REPLY_ACTION, serde_json::json!({"message": "a"}), &[]),
                step(2, REPLY_ACTION, serde_json::json!({"message": "b"}), &[]),
            ],
        );
        let violations = validator.validate(&plan, &no_intent(), true);
        assert!(violations.contains(&Violation::MultipleTerminals));
    }

    #[test]
    fn test_delivery_enforced() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);
        let plan = plan(
            Complexity::Simple,
            vec![
                step(1, "google_search", serde_json::json!({"query": "x"}), &[]),
                step(2, REPLY_ACTION, serde_json::json!({"message": "m"}), &[1]),
            ],
        );
        let violations = validator.validate(&plan, &intent(), true);
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::MissingDelivery { .. })));

        // With rejection disabled the same plan passes.
        assert!(validator.validate(&plan, &intent(), false).is_empty());
    }

    #[test]
    fn test_delivery_satisfied() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);
        let plan = plan(
            Complexity::Medium,
            vec![
                step(1, "google_search", serde_json::json!({"query": "x"}), &[]),
                step(
                    2,
                    "compose_email",
                    serde_json::json!({"body": "$step1.summary", "send": true}),
                    &[1],
                ),
                step(3, REPLY_ACTION, serde_json::json!({"message": "sent"}), &[2]),
            ],
        );
        assert!(validator.validate(&plan, &intent(), true).is_empty());
    }

    #[test]
    fn test_empty_email() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);
        let plan = plan(
            Complexity::Simple,
            vec![
                step(1, "compose_email", serde_json::json!({"subject": "hi"}), &[]),
                step(2, REPLY_ACTION, serde_json::json!({"message": "m"}), &[]),
            ],
        );
        let violations = validator.validate(&plan, &no_intent(), true);
        assert!(violations.contains(&Violation::EmptyEmail { step_id: 1 }));
    }

    #[test]
    fn test_email_with_attachments_only_ok() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);
        let plan = plan(
            Complexity::Simple,
            vec![
                step(
                    1,
                    "compose_email",
                    serde_json::json!({"attachments": ["/tmp/a.pdf"]}),
                    &[],
                ),
                step(2, REPLY_ACTION, serde_json::json!({"message": "m"}), &[]),
            ],
        );
        assert!(validator.validate(&plan, &no_intent(), true).is_empty());
    }

    #[test]
    fn test_duplicate_ids() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);
        let plan = plan(
            Complexity::Simple,
            vec![
                step(1, "google_search", serde_json::json!({"query": "x"}), &[]),
                step(1, REPLY_ACTION, serde_json::json!({"message": "m"}), &[]),
            ],
        );
        let violations = validator.validate(&plan, &no_intent(), true);
        assert!(violations.contains(&Violation::DuplicateId { step_id: 1 }));
    }

    #[test]
    fn test_impossible_shape() {
        let registry = registry();
        let validator = PlanValidator::new(&registry);

        let good = plan(
            Complexity::Impossible,
            vec![step(
                1,
                REPLY_ACTION,
                serde_json::json!({"message": "I cannot print physical documents."}),
                &[],
            )],
        );
        assert!(validator.validate(&good, &no_intent(), true).is_empty());

        let bad = plan(
            Complexity::Impossible,
            vec![
                step(1, "google_search", serde_json::json!({"query": "x"}), &[]),
                step(2, REPLY_ACTION, serde_json::json!({"message": "m"}), &[1]),
            ],
        );
        let violations = validator.validate(&bad, &no_intent(), true);
        assert!(violations.contains(&Violation::MalformedImpossible));
    }

    #[test]
    fn test_critique_numbers_violations() {
        let text = critique(&[
            Violation::MissingTerminal,
            Violation::EmptyEmail { step_id: 3 },
        ]);
        assert!(text.starts_with("1. plan has no terminal"));
        assert!(text.contains("2. step 3 composes an email"));
    }
}
