//! The orchestrator: one user request in, exactly one reply out.
//!
//! Flow per interaction:
//! 1. detect delivery intent
//! 2. plan, validate, repair (up to `planning.max_repair_rounds`)
//! 3. execute; on step failure consult the critic, retry once with merged
//!    parameters when suggested, otherwise replan (up to
//!    `planning.max_replan_rounds`) preserving completed artifacts
//! 4. finalize the terminal step into the reply, seal, persist
//!
//! Validator violations are never shown raw to the user; they feed the
//! next planner call. Cancellation short-circuits everything.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::memory::trace::{TraceOutcome, TraceStage, TraceUpdate};
use crate::memory::{MemoryStore, NewEntry, SessionMemory};
use crate::prompts::PromptStore;
use crate::providers::router::ModelRouter;
use crate::session::CancelToken;
use crate::tools::registry::ToolRegistry;
use crate::types::{DeliveryIntent, Plan, ReplyPayload, ReplyStatus};

use super::critic::{Critic, FailureReport};
use super::executor::{ExecOutcome, Executor};
use super::finalizer;
use super::intent::detect_delivery_intent;
use super::planner::{PlanMode, Planner, PlannerContext, PlannerError};
use super::validator::{critique, PlanValidator};
use super::ProgressSink;

/// Failures surfaced to the transport as an `error` message rather than a
/// reply.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The request was empty or unusable.
    #[error("empty request")]
    InputError,
    /// Unexpected failure; detail goes to the logs, not the user.
    #[error("internal error")]
    Internal(String),
}

/// Wires the pipeline components together per session.
pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<ToolRegistry>,
    router: Arc<ModelRouter>,
    prompts: Arc<PromptStore>,
    memory: Arc<MemoryStore>,
}

impl Orchestrator {
    /// Create an orchestrator over shared components.
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ToolRegistry>,
        router: Arc<ModelRouter>,
        prompts: Arc<PromptStore>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self {
            config,
            registry,
            router,
            prompts,
            memory,
        }
    }

    /// The memory store interactions are recorded in.
    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Handle one user request end-to-end.
    ///
    /// Returns the interaction id and the finalized reply. Every code path
    /// that gets past input validation seals the interaction with exactly
    /// one reply.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InputError`] for an empty request and
    /// [`OrchestratorError::Internal`] when the LLM provider is unusable.
    pub async fn run_interaction(
        &self,
        session_id: &str,
        request: &str,
        cancel: CancelToken,
        progress: &dyn ProgressSink,
    ) -> Result<(Uuid, ReplyPayload), OrchestratorError> {
        if request.trim().is_empty() {
            return Err(OrchestratorError::InputError);
        }

        let memory = self.memory.session(session_id);
        let interaction_id = memory.add_interaction(request);
        memory.start_reasoning_trace(interaction_id);
        info!(session_id, %interaction_id, "interaction started");

        let intent = detect_delivery_intent(request, &self.config.delivery);

        // ── Plan / validate / repair ────────────────────────────
        let plan = match self
            .plan_with_repairs(request, &intent, &memory, interaction_id)
            .await?
        {
            Ok(plan) => plan,
            Err(reason) => {
                let reply = ReplyPayload {
                    message: format!("I couldn't work out a valid plan for this request: {reason}"),
                    details: None,
                    artifacts: vec![],
                    status: ReplyStatus::Error,
                };
                self.seal(&memory, session_id, interaction_id, reply.clone());
                return Ok((interaction_id, reply));
            }
        };

        memory.set_plan(interaction_id, plan.clone());
        progress.plan_accepted(interaction_id, &plan);

        // ── Execute with critic-seeded replans ──────────────────
        let executor = Executor::new(&self.registry, &self.config.executor);
        let mut active_plan = plan;
        let mut replan_round: u32 = 0;

        let reply = loop {
            let outcome = executor
                .run(
                    &active_plan,
                    interaction_id,
                    session_id,
                    &memory,
                    &cancel,
                    progress,
                )
                .await;

            match outcome {
                ExecOutcome::Completed | ExecOutcome::Cancelled => {
                    let snapshot = memory
                        .snapshot(interaction_id)
                        .ok_or_else(|| internal("interaction vanished mid-flight"))?;
                    break finalizer::finalize(&active_plan, &snapshot.step_results);
                }
                ExecOutcome::Failed {
                    step_id,
                    error,
                    resolved_parameters,
                } => {
                    warn!(step_id, kind = %error.kind, "step failed terminally");

                    if cancel.is_cancelled() {
                        let snapshot = memory
                            .snapshot(interaction_id)
                            .ok_or_else(|| internal("interaction vanished mid-flight"))?;
                        break finalizer::finalize(&active_plan, &snapshot.step_results);
                    }

                    let correction_entry = memory.add_reasoning_entry(
                        interaction_id,
                        TraceStage::Correction,
                        &format!("step {step_id} ({}) failed: {}", step_name(&active_plan, step_id), error.message),
                        NewEntry::default(),
                    );

                    // Ask the critic what to do with the failure.
                    let guidance = self
                        .consult_critic(&active_plan, step_id, &resolved_parameters, &error, &memory, interaction_id)
                        .await;

                    // A parameter-only suggestion earns one merged retry of
                    // the same step before any replan.
                    if let Some(guidance) = &guidance {
                        if guidance.should_retry && guidance.alternative_tool.is_none() {
                            if let Some(adjustments) = &guidance.suggested_parameter_adjustments {
                                if let Some(step) =
                                    active_plan.steps.iter().find(|s| s.id == step_id)
                                {
                                    let merged =
                                        merge_parameters(&resolved_parameters, adjustments);
                                    let retried = executor
                                        .run_single_with_params(
                                            step,
                                            merged,
                                            interaction_id,
                                            session_id,
                                            &memory,
                                            &cancel,
                                            progress,
                                        )
                                        .await;
                                    if retried.is_ok() {
                                        if let Some(entry) = correction_entry {
                                            memory.update_reasoning_entry(
                                                entry,
                                                TraceUpdate {
                                                    outcome: Some(TraceOutcome::Success),
                                                    corrections: vec![
                                                        guidance.rationale.clone()
                                                    ],
                                                    ..TraceUpdate::default()
                                                },
                                            );
                                        }
                                        continue;
                                    }
                                }
                            }
                        }
                    }

                    // Escalate to a replan seeded with completed artifacts.
                    if replan_round >= self.config.planning.max_replan_rounds {
                        if let Some(entry) = correction_entry {
                            memory.update_reasoning_entry(
                                entry,
                                TraceUpdate {
                                    outcome: Some(TraceOutcome::Failed),
                                    error: Some(error.message.clone()),
                                    ..TraceUpdate::default()
                                },
                            );
                        }
                        break ReplyPayload {
                            message: format!(
                                "I couldn't complete the request: {}.",
                                error.message.trim_end_matches('.')
                            ),
                            details: None,
                            artifacts: vec![],
                            status: ReplyStatus::Error,
                        };
                    }
                    replan_round = replan_round.saturating_add(1);

                    let rationale = guidance
                        .as_ref()
                        .map(|g| g.rationale.clone())
                        .unwrap_or_else(|| error.message.clone());

                    match self
                        .replan(request, &intent, &memory, interaction_id, &rationale)
                        .await?
                    {
                        Ok(new_plan) => {
                            if let Some(entry) = correction_entry {
                                memory.update_reasoning_entry(
                                    entry,
                                    TraceUpdate {
                                        outcome: Some(TraceOutcome::Partial),
                                        corrections: vec![rationale],
                                        ..TraceUpdate::default()
                                    },
                                );
                            }
                            memory.set_plan(interaction_id, new_plan.clone());
                            progress.plan_accepted(interaction_id, &new_plan);
                            active_plan = new_plan;
                        }
                        Err(reason) => {
                            break ReplyPayload {
                                message: format!(
                                    "I couldn't recover from a failing step: {reason}"
                                ),
                                details: None,
                                artifacts: vec![],
                                status: ReplyStatus::Error,
                            };
                        }
                    }
                }
            }
        };

        self.seal(&memory, session_id, interaction_id, reply.clone());
        Ok((interaction_id, reply))
    }

    /// Plan and validate, repairing up to the configured round budget.
    ///
    /// `Ok(Err(reason))` means the request failed user-visibly (exhausted
    /// repairs or unparseable plans); `Err` means the provider broke.
    async fn plan_with_repairs(
        &self,
        request: &str,
        intent: &DeliveryIntent,
        memory: &SessionMemory,
        interaction_id: Uuid,
    ) -> Result<Result<Plan, String>, OrchestratorError> {
        let planner = Planner::new(&self.router, &self.prompts);
        let validator = PlanValidator::new(&self.registry);
        let planning_context = memory.context();
        let trace_summary = Some(memory.get_reasoning_summary(10, false));

        let mut mode = PlanMode::Initial;
        let mut last_critique: Option<String> = None;

        let max_rounds = self.config.planning.max_repair_rounds;
        for round in 0..=max_rounds {
            let entry = memory.add_reasoning_entry(
                interaction_id,
                TraceStage::Planning,
                if round == 0 { "drafting plan" } else { "repairing plan" },
                NewEntry::default(),
            );

            let ctx = PlannerContext {
                user_request: request,
                capabilities: self.registry.capability_summary(),
                planning_context: &planning_context,
                delivery_intent: intent,
                trace_summary: trace_summary.clone(),
                mode,
                critique: last_critique.clone(),
                completed_results: None,
            };

            let plan = match planner.plan(&ctx).await {
                Ok(plan) => plan,
                Err(PlannerError::InvalidPlanFormat(msg)) => {
                    warn!(round, error = %msg, "planner output unusable");
                    if let Some(entry) = entry {
                        memory.update_reasoning_entry(
                            entry,
                            TraceUpdate {
                                outcome: Some(TraceOutcome::Failed),
                                error: Some(msg),
                                ..TraceUpdate::default()
                            },
                        );
                    }
                    return Ok(Err("the planner produced no usable plan".to_owned()));
                }
                Err(PlannerError::Provider(e)) => {
                    return Err(internal_from(e));
                }
            };

            let violations = validator.validate(
                &plan,
                intent,
                self.config.delivery.validation.reject_missing_tool,
            );

            if violations.is_empty() {
                if let Some(entry) = entry {
                    memory.update_reasoning_entry(
                        entry,
                        TraceUpdate {
                            outcome: Some(TraceOutcome::Success),
                            ..TraceUpdate::default()
                        },
                    );
                }
                return Ok(Ok(plan));
            }

            let rendered = critique(&violations);
            info!(round, violations = violations.len(), "plan rejected by validator");
            if let Some(entry) = entry {
                memory.update_reasoning_entry(
                    entry,
                    TraceUpdate {
                        outcome: Some(TraceOutcome::Failed),
                        error: Some(rendered.clone()),
                        ..TraceUpdate::default()
                    },
                );
            }
            mode = PlanMode::Repair;
            last_critique = Some(rendered);
        }

        Ok(Err("plan validation kept failing after repairs".to_owned()))
    }

    /// Request a repair plan seeded with completed results and critic
    /// guidance, then validate it through the same repair loop.
    async fn replan(
        &self,
        request: &str,
        intent: &DeliveryIntent,
        memory: &SessionMemory,
        interaction_id: Uuid,
        rationale: &str,
    ) -> Result<Result<Plan, String>, OrchestratorError> {
        let planner = Planner::new(&self.router, &self.prompts);
        let validator = PlanValidator::new(&self.registry);
        let planning_context = memory.context();

        let completed = memory.step_payloads(interaction_id);
        let completed_json =
            serde_json::to_string_pretty(&completed).unwrap_or_else(|_| "{}".to_owned());

        let mut critique_text = rationale.to_owned();

        let max_rounds = self.config.planning.max_repair_rounds;
        for _round in 0..=max_rounds {
            let ctx = PlannerContext {
                user_request: request,
                capabilities: self.registry.capability_summary(),
                planning_context: &planning_context,
                delivery_intent: intent,
                trace_summary: Some(memory.get_reasoning_summary(10, true)),
                mode: PlanMode::Replan,
                critique: Some(critique_text.clone()),
                completed_results: Some(completed_json.clone()),
            };

            let plan = match planner.plan(&ctx).await {
                Ok(plan) => plan,
                Err(PlannerError::InvalidPlanFormat(_)) => {
                    return Ok(Err("the repair plan was unusable".to_owned()));
                }
                Err(PlannerError::Provider(e)) => return Err(internal_from(e)),
            };

            let violations = validator.validate(
                &plan,
                intent,
                self.config.delivery.validation.reject_missing_tool,
            );
            if violations.is_empty() {
                return Ok(Ok(plan));
            }
            critique_text = format!("{rationale}\n\nValidation failures:\n{}", critique(&violations));
        }

        Ok(Err("repair plans kept failing validation".to_owned()))
    }

    async fn consult_critic(
        &self,
        plan: &Plan,
        step_id: u32,
        resolved_parameters: &serde_json::Value,
        error: &crate::types::StepError,
        memory: &SessionMemory,
        interaction_id: Uuid,
    ) -> Option<super::critic::CriticGuidance> {
        let step = plan.steps.iter().find(|s| s.id == step_id)?;
        let completed = memory.step_payloads(interaction_id);
        let completed_results =
            serde_json::to_string_pretty(&completed).unwrap_or_else(|_| String::new());

        let critic = Critic::new(&self.router, &self.prompts);
        let report = FailureReport {
            step,
            resolved_parameters,
            error,
            completed_results,
        };

        match critic.review(&report).await {
            Ok(guidance) => {
                // An alternative tool outside the registry is discarded;
                // the failure escalates to a full replan instead.
                if let Some(alternative) = &guidance.alternative_tool {
                    if !self.registry.contains(alternative) {
                        warn!(%alternative, "critic suggested an unregistered tool, ignoring");
                        return Some(super::critic::CriticGuidance {
                            alternative_tool: None,
                            should_retry: false,
                            ..guidance
                        });
                    }
                }
                Some(guidance)
            }
            Err(e) => {
                warn!(error = %e, "critic unavailable, escalating to replan");
                None
            }
        }
    }

    fn seal(
        &self,
        memory: &SessionMemory,
        session_id: &str,
        interaction_id: Uuid,
        reply: ReplyPayload,
    ) {
        memory.add_reasoning_entry(
            interaction_id,
            TraceStage::Finalization,
            &format!("reply sealed with status {:?}", reply.status),
            NewEntry::default(),
        );
        memory.seal(interaction_id, reply);
        if let Err(e) = self.memory.persist(session_id) {
            warn!(session_id, error = %e, "failed to persist session document");
        }
        info!(session_id, %interaction_id, "interaction sealed");
    }
}

fn step_name(plan: &Plan, step_id: u32) -> String {
    plan.steps
        .iter()
        .find(|s| s.id == step_id)
        .map(|s| s.action.clone())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Overlay critic adjustments onto resolved parameters.
fn merge_parameters(
    resolved: &serde_json::Value,
    adjustments: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    let mut merged = resolved.as_object().cloned().unwrap_or_default();
    for (key, value) in adjustments {
        merged.insert(key.clone(), value.clone());
    }
    serde_json::Value::Object(merged)
}

fn internal(message: &str) -> OrchestratorError {
    warn!(message, "internal orchestrator failure");
    OrchestratorError::Internal(message.to_owned())
}

fn internal_from(e: impl std::error::Error) -> OrchestratorError {
    warn!(error = %e, "internal orchestrator failure");
    OrchestratorError::Internal(e.to_string())
}
