//! Plan execution: topological walk, template resolution, per-step retry,
//! cancellation, and deadlines.
//!
//! Steps run in an order consistent with their dependencies. In each round
//! the executor gathers the ready steps; when more than one pure step is
//! ready they run concurrently in one joined batch, everything else runs
//! serially in id order. Results are committed to session memory sorted by
//! step id, so observers always see a linearized history.

use std::collections::BTreeSet;

use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn};

use crate::config::ExecutorConfig;
use crate::memory::SessionMemory;
use crate::session::CancelToken;
use crate::tools::registry::ToolRegistry;
use crate::tools::{is_error_result, ToolContext, ToolError};
use crate::types::{ErrorKind, Plan, Step, StepError, StepResult, StepStatus};
use uuid::Uuid;

use super::{template, ProgressSink};

/// Backoff added per retry attempt.
const RETRY_BACKOFF_STEP_MS: u64 = 200;

/// Upper bound on backoff jitter.
const RETRY_JITTER_MS: u64 = 100;

/// How a plan execution ended.
#[derive(Debug)]
pub enum ExecOutcome {
    /// Every step finalized successfully.
    Completed,
    /// The cancel signal fired; unfinished steps were recorded `skipped`.
    Cancelled,
    /// A step failed after exhausting its retries.
    Failed {
        /// The failing step id.
        step_id: u32,
        /// The terminal error.
        error: StepError,
        /// The step's parameters after template resolution, for the critic.
        resolved_parameters: serde_json::Value,
    },
}

/// Walks a validated plan and invokes tools via the registry.
pub struct Executor<'a> {
    registry: &'a ToolRegistry,
    config: &'a ExecutorConfig,
}

impl<'a> Executor<'a> {
    /// Create an executor over the registry with the configured retry and
    /// deadline settings.
    pub fn new(registry: &'a ToolRegistry, config: &'a ExecutorConfig) -> Self {
        Self { registry, config }
    }

    /// Execute all steps of `plan` that do not yet have a successful
    /// result in memory.
    ///
    /// Re-invoking after a partial failure resumes where execution left
    /// off; completed artifacts are never recomputed.
    pub async fn run(
        &self,
        plan: &Plan,
        interaction_id: Uuid,
        session_id: &str,
        memory: &SessionMemory,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> ExecOutcome {
        loop {
            if cancel.is_cancelled() {
                self.record_skipped_remaining(plan, interaction_id, memory, progress);
                return ExecOutcome::Cancelled;
            }

            let done: BTreeSet<u32> = memory.step_payloads(interaction_id).keys().copied().collect();

            let ready: Vec<&Step> = plan
                .steps
                .iter()
                .filter(|step| {
                    !done.contains(&step.id)
                        && step.dependencies.iter().all(|dep| done.contains(dep))
                })
                .collect();

            if ready.is_empty() {
                if plan.steps.iter().all(|s| done.contains(&s.id)) {
                    return ExecOutcome::Completed;
                }
                // Unreachable after validation; defend anyway.
                let error = StepError {
                    kind: ErrorKind::Internal,
                    message: "no ready steps but plan incomplete".to_owned(),
                    retry_possible: false,
                };
                return ExecOutcome::Failed {
                    step_id: plan
                        .steps
                        .iter()
                        .map(|s| s.id)
                        .find(|id| !done.contains(id))
                        .unwrap_or(0),
                    error,
                    resolved_parameters: serde_json::Value::Null,
                };
            }

            // Pure ready steps run as one joined batch; otherwise the
            // lowest-id ready step runs alone.
            let batch: Vec<&Step> = {
                let pure: Vec<&Step> = ready
                    .iter()
                    .copied()
                    .filter(|s| self.registry.is_pure(&s.action))
                    .collect();
                if pure.is_empty() {
                    ready.into_iter().take(1).collect()
                } else {
                    pure
                }
            };

            let payloads = memory.step_payloads(interaction_id);
            let executions = batch.iter().map(|step| {
                let payloads = payloads.clone();
                async move {
                    let outcome = self
                        .execute_step(step, &payloads, interaction_id, session_id, cancel)
                        .await;
                    (*step, outcome)
                }
            });
            let mut results: Vec<(&Step, StepExecution)> = join_all(executions).await;
            // Linearize commits by step id.
            results.sort_by_key(|(step, _)| step.id);

            let mut failure: Option<(u32, StepError, serde_json::Value)> = None;
            let mut cancelled = false;

            for (step, execution) in results {
                match execution {
                    StepExecution::Success { result } => {
                        progress.step_update(interaction_id, step.id, StepStatus::Success);
                        memory.set_step_result(interaction_id, result);
                    }
                    StepExecution::Cancelled => {
                        cancelled = true;
                    }
                    StepExecution::Failed { result, resolved } => {
                        progress.step_update(interaction_id, step.id, StepStatus::Error);
                        let error = result.error.clone().unwrap_or(StepError {
                            kind: ErrorKind::Internal,
                            message: "missing error detail".to_owned(),
                            retry_possible: false,
                        });
                        memory.set_step_result(interaction_id, result);
                        if failure.is_none() {
                            failure = Some((step.id, error, resolved));
                        }
                    }
                }
            }

            if cancelled {
                self.record_skipped_remaining(plan, interaction_id, memory, progress);
                return ExecOutcome::Cancelled;
            }
            if let Some((step_id, error, resolved_parameters)) = failure {
                return ExecOutcome::Failed {
                    step_id,
                    error,
                    resolved_parameters,
                };
            }
        }
    }

    /// Re-run a single step once with critic-merged parameters.
    ///
    /// The parameters are used as-is (they were resolved before the critic
    /// saw them). On success the result is committed like any other.
    pub async fn run_single_with_params(
        &self,
        step: &Step,
        merged_parameters: serde_json::Value,
        interaction_id: Uuid,
        session_id: &str,
        memory: &SessionMemory,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> Result<(), StepError> {
        let started_at = Utc::now();
        match self
            .invoke_with_retries(step, merged_parameters, interaction_id, session_id, cancel)
            .await
        {
            Ok(payload) => {
                progress.step_update(interaction_id, step.id, StepStatus::Success);
                memory.set_step_result(
                    interaction_id,
                    StepResult {
                        step_id: step.id,
                        status: StepStatus::Success,
                        payload,
                        error: None,
                        started_at,
                        finished_at: Utc::now(),
                    },
                );
                Ok(())
            }
            Err(error) => {
                progress.step_update(interaction_id, step.id, StepStatus::Error);
                memory.set_step_result(
                    interaction_id,
                    StepResult {
                        step_id: step.id,
                        status: StepStatus::Error,
                        payload: serde_json::Value::Null,
                        error: Some(error.clone()),
                        started_at,
                        finished_at: Utc::now(),
                    },
                );
                Err(error)
            }
        }
    }

    async fn execute_step(
        &self,
        step: &Step,
        payloads: &template::StepPayloads,
        interaction_id: Uuid,
        session_id: &str,
        cancel: &CancelToken,
    ) -> StepExecution {
        let started_at = Utc::now();
        info!(step_id = step.id, action = %step.action, "executing step");

        // Resolve templates against accumulated results.
        let raw = serde_json::Value::Object(step.parameters.clone());
        let resolved = match template::resolve(&raw, payloads) {
            Ok(resolved) => resolved,
            Err(e) => {
                let error = StepError {
                    kind: ErrorKind::InvalidInput,
                    message: e.to_string(),
                    retry_possible: false,
                };
                return StepExecution::Failed {
                    result: StepResult {
                        step_id: step.id,
                        status: StepStatus::Error,
                        payload: serde_json::Value::Null,
                        error: Some(error),
                        started_at,
                        finished_at: Utc::now(),
                    },
                    resolved: raw,
                };
            }
        };

        match self
            .invoke_with_retries(step, resolved.clone(), interaction_id, session_id, cancel)
            .await
        {
            Ok(payload) => StepExecution::Success {
                result: StepResult {
                    step_id: step.id,
                    status: StepStatus::Success,
                    payload,
                    error: None,
                    started_at,
                    finished_at: Utc::now(),
                },
            },
            Err(error) if error.kind == ErrorKind::Cancelled => StepExecution::Cancelled,
            Err(error) => StepExecution::Failed {
                result: StepResult {
                    step_id: step.id,
                    status: StepStatus::Error,
                    payload: serde_json::Value::Null,
                    error: Some(error),
                    started_at,
                    finished_at: Utc::now(),
                },
                resolved,
            },
        }
    }

    /// Invoke the tool, retrying with the same resolved parameters while
    /// the error is retryable and budget remains.
    async fn invoke_with_retries(
        &self,
        step: &Step,
        resolved: serde_json::Value,
        interaction_id: Uuid,
        session_id: &str,
        cancel: &CancelToken,
    ) -> Result<serde_json::Value, StepError> {
        let deadline = self
            .registry
            .deadline_for(&step.action, self.config.default_deadline_ms);
        let ctx = ToolContext {
            session_id: session_id.to_owned(),
            interaction_id,
            cancel: cancel.clone(),
            deadline,
        };

        let max_attempts = self.config.per_step_retries.saturating_add(1);
        let mut last_error = StepError {
            kind: ErrorKind::Internal,
            message: "step never attempted".to_owned(),
            retry_possible: false,
        };

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(StepError {
                    kind: ErrorKind::Cancelled,
                    message: "cancelled before invocation".to_owned(),
                    retry_possible: false,
                });
            }

            let invocation = self.registry.execute(&step.action, resolved.clone(), &ctx);
            let outcome = tokio::select! {
                result = tokio::time::timeout(deadline, invocation) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ToolError::DeadlineExceeded),
                },
                () = cancel.cancelled() => Err(ToolError::Cancelled),
            };

            let error = match outcome {
                Ok(payload) if is_error_result(&payload) => step_error_from_payload(&payload),
                Ok(payload) => return Ok(payload),
                Err(e) => StepError {
                    kind: e.kind(),
                    message: e.to_string(),
                    retry_possible: e.retry_possible(),
                },
            };

            if error.kind == ErrorKind::Cancelled {
                return Err(error);
            }

            warn!(
                step_id = step.id,
                action = %step.action,
                attempt,
                kind = %error.kind,
                message = %error.message,
                "step attempt failed"
            );

            if !error.retry_possible || attempt == max_attempts {
                return Err(error);
            }
            last_error = error;
            tokio::time::sleep(retry_backoff(attempt)).await;
        }

        Err(last_error)
    }

    /// Record `skipped` for every step without a finalized result.
    fn record_skipped_remaining(
        &self,
        plan: &Plan,
        interaction_id: Uuid,
        memory: &SessionMemory,
        progress: &dyn ProgressSink,
    ) {
        let recorded: BTreeSet<u32> = memory
            .snapshot(interaction_id)
            .map(|i| i.step_results.keys().copied().collect())
            .unwrap_or_default();

        let now = Utc::now();
        for step in &plan.steps {
            if !recorded.contains(&step.id) {
                progress.step_update(interaction_id, step.id, StepStatus::Skipped);
                memory.set_step_result(
                    interaction_id,
                    StepResult {
                        step_id: step.id,
                        status: StepStatus::Skipped,
                        payload: serde_json::Value::Null,
                        error: None,
                        started_at: now,
                        finished_at: now,
                    },
                );
            }
        }
    }
}

/// Linear backoff with jitter so parallel retries do not stampede a
/// struggling backend.
fn retry_backoff(attempt: u32) -> std::time::Duration {
    use rand::Rng;
    let base_ms = u64::from(attempt).saturating_mul(RETRY_BACKOFF_STEP_MS);
    let jitter_ms: u64 = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
    std::time::Duration::from_millis(base_ms.saturating_add(jitter_ms))
}

enum StepExecution {
    Success {
        result: StepResult,
    },
    Cancelled,
    Failed {
        result: StepResult,
        resolved: serde_json::Value,
    },
}

/// Build a [`StepError`] from an explicit `{error: true}` payload.
fn step_error_from_payload(payload: &serde_json::Value) -> StepError {
    let kind = payload
        .get("error_type")
        .and_then(|v| serde_json::from_value::<ErrorKind>(v.clone()).ok())
        .unwrap_or(ErrorKind::ToolFailed);
    StepError {
        kind,
        message: payload
            .get("error_message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("tool reported an error")
            .to_owned(),
        retry_possible: payload
            .get("retry_possible")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::NullProgress;
    use crate::session::cancel_pair;
    use crate::tools::{error_result, ParamSpec, Tool, ToolSpec};
    use crate::types::Complexity;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(params)
        }
    }

    /// Fails `failures` times with a retryable error, then succeeds.
    struct FlakyTool {
        failures: u32,
        attempts: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(
            &self,
            _params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(ToolError::Failed {
                    message: "transient".to_owned(),
                    retry_possible: true,
                })
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
    }

    /// Returns the explicit error-result shape.
    struct ErrorShapeTool;

    #[async_trait::async_trait]
    impl Tool for ErrorShapeTool {
        fn name(&self) -> &str {
            "error_shape"
        }

        async fn execute(
            &self,
            _params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(error_result(
                ErrorKind::ToolFailed,
                "backend said no",
                false,
            ))
        }
    }

    /// Sleeps until cancelled.
    struct HangingTool;

    #[async_trait::async_trait]
    impl Tool for HangingTool {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn execute(
            &self,
            _params: serde_json::Value,
            ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            ctx.cancel.cancelled().await;
            Err(ToolError::Cancelled)
        }
    }

    fn spec(name: &str, pure: bool) -> ToolSpec {
        ToolSpec {
            name: name.to_owned(),
            description: format!("{name} tool"),
            parameters: vec![ParamSpec::new("value", "any", false)],
            delivery_terminal: false,
            pure,
            default_deadline_ms: None,
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(spec("echo", true), || Arc::new(EchoTool));
        registry.register(spec("error_shape", true), || Arc::new(ErrorShapeTool));
        registry.register(spec("hanging", false), || Arc::new(HangingTool));
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

    fn plan(steps: Vec<Step>) -> Plan {
        Plan {
            goal: "test".to_owned(),
            complexity: Complexity::Simple,
            steps,
        }
    }

    fn exec_config() -> ExecutorConfig {
        ExecutorConfig {
            per_step_retries: 1,
            default_deadline_ms: 2_000,
        }
    }

    #[tokio::test]
    async fn test_runs_in_dependency_order_with_templates() {
        let registry = registry();
        let config = exec_config();
        let executor = Executor::new(&registry, &config);
        let memory = SessionMemory::new("s1", false);
        let interaction_id = memory.add_interaction("req");
        let (_handle, token) = cancel_pair();

        let plan = plan(vec![
            step(1, "echo", serde_json::json!({"value": {"count": 2}}), &[]),
            step(
                2,
                "echo",
                serde_json::json!({"value": "counted {$step1.value.count}"}),
                &[1],
            ),
        ]);

        let outcome = executor
            .run(&plan, interaction_id, "s1", &memory, &token, &NullProgress)
            .await;
        assert!(matches!(outcome, ExecOutcome::Completed));

        let snap = memory.snapshot(interaction_id).expect("snapshot");
        assert_eq!(snap.step_results.len(), 2);
        let second = snap.step_results.get(&2).expect("step 2");
        assert_eq!(second.payload["value"], "counted 2");
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let mut registry = ToolRegistry::new();
        registry.register(spec("flaky", false), || {
            Arc::new(FlakyTool {
                failures: 1,
                attempts: AtomicU32::new(0),
            })
        });
        let config = exec_config();
        let executor = Executor::new(&registry, &config);
        let memory = SessionMemory::new("s1", false);
        let interaction_id = memory.add_interaction("req");
        let (_handle, token) = cancel_pair();

        let plan = plan(vec![step(1, "flaky", serde_json::json!({}), &[])]);
        let outcome = executor
            .run(&plan, interaction_id, "s1", &memory, &token, &NullProgress)
            .await;
        assert!(matches!(outcome, ExecOutcome::Completed));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mut registry = ToolRegistry::new();
        registry.register(spec("flaky", false), || {
            Arc::new(FlakyTool {
                failures: 10,
                attempts: AtomicU32::new(0),
            })
        });
        let config = exec_config();
        let executor = Executor::new(&registry, &config);
        let memory = SessionMemory::new("s1", false);
        let interaction_id = memory.add_interaction("req");
        let (_handle, token) = cancel_pair();

        let plan = plan(vec![step(1, "flaky", serde_json::json!({}), &[])]);
        let outcome = executor
            .run(&plan, interaction_id, "s1", &memory, &token, &NullProgress)
            .await;

        let ExecOutcome::Failed { step_id, error, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(step_id, 1);
        assert_eq!(error.kind, ErrorKind::ToolFailed);

        let snap = memory.snapshot(interaction_id).expect("snapshot");
        assert_eq!(
            snap.step_results.get(&1).expect("result").status,
            StepStatus::Error
        );
    }

    #[tokio::test]
    async fn test_error_shape_payload_is_failure() {
        let registry = registry();
        let config = exec_config();
        let executor = Executor::new(&registry, &config);
        let memory = SessionMemory::new("s1", false);
        let interaction_id = memory.add_interaction("req");
        let (_handle, token) = cancel_pair();

        let plan = plan(vec![step(1, "error_shape", serde_json::json!({}), &[])]);
        let outcome = executor
            .run(&plan, interaction_id, "s1", &memory, &token, &NullProgress)
            .await;

        let ExecOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error.message, "backend said no");
        assert!(!error.retry_possible);
    }

    #[tokio::test]
    async fn test_cancellation_skips_downstream() {
        let registry = registry();
        let config = exec_config();
        let executor = Executor::new(&registry, &config);
        let memory = SessionMemory::new("s1", false);
        let interaction_id = memory.add_interaction("req");
        let (handle, token) = cancel_pair();

        // Fire the cancel shortly after execution starts on the hanging tool.
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.cancel();
        });

        let plan = plan(vec![
            step(1, "hanging", serde_json::json!({}), &[]),
            step(2, "echo", serde_json::json!({}), &[1]),
        ]);
        let outcome = executor
            .run(&plan, interaction_id, "s1", &memory, &token, &NullProgress)
            .await;
        let _ = canceller.await;

        assert!(matches!(outcome, ExecOutcome::Cancelled));
        let snap = memory.snapshot(interaction_id).expect("snapshot");
        assert_eq!(
            snap.step_results.get(&1).expect("step 1").status,
            StepStatus::Skipped
        );
        assert_eq!(
            snap.step_results.get(&2).expect("step 2").status,
            StepStatus::Skipped
        );
    }

    #[tokio::test]
    async fn test_deadline_exceeded_is_retryable_error() {
        let mut registry = ToolRegistry::new();
        let mut hanging_spec = spec("hanging", false);
        hanging_spec.default_deadline_ms = Some(30);
        registry.register(hanging_spec, || Arc::new(HangingTool));

        let config = ExecutorConfig {
            per_step_retries: 0,
            default_deadline_ms: 30,
        };
        let executor = Executor::new(&registry, &config);
        let memory = SessionMemory::new("s1", false);
        let interaction_id = memory.add_interaction("req");
        let (_handle, token) = cancel_pair();

        let plan = plan(vec![step(1, "hanging", serde_json::json!({}), &[])]);
        let outcome = executor
            .run(&plan, interaction_id, "s1", &memory, &token, &NullProgress)
            .await;

        let ExecOutcome::Failed { error, .. } = outcome else {
            panic!("expected deadline failure");
        };
        assert_eq!(error.kind, ErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_steps() {
        let registry = registry();
        let config = exec_config();
        let executor = Executor::new(&registry, &config);
        let memory = SessionMemory::new("s1", false);
        let interaction_id = memory.add_interaction("req");
        let (_handle, token) = cancel_pair();

        // Pre-record step 1 as completed.
        memory.set_step_result(
            interaction_id,
            StepResult {
                step_id: 1,
                status: StepStatus::Success,
                payload: serde_json::json!({"value": "precomputed"}),
                error: None,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            },
        );

        let plan = plan(vec![
            step(1, "error_shape", serde_json::json!({}), &[]),
            step(2, "echo", serde_json::json!({"value": "$step1.value"}), &[1]),
        ]);
        let outcome = executor
            .run(&plan, interaction_id, "s1", &memory, &token, &NullProgress)
            .await;

        // error_shape would fail, but step 1 is already done, so only
        // step 2 runs and consumes the preserved artifact.
        assert!(matches!(outcome, ExecOutcome::Completed));
        let snap = memory.snapshot(interaction_id).expect("snapshot");
        assert_eq!(snap.step_results.get(&2).expect("step 2").payload["value"], "precomputed");
    }

    #[tokio::test]
    async fn test_run_single_with_params() {
        let registry = registry();
        let config = exec_config();
        let executor = Executor::new(&registry, &config);
        let memory = SessionMemory::new("s1", false);
        let interaction_id = memory.add_interaction("req");
        let (_handle, token) = cancel_pair();

        let step = step(3, "echo", serde_json::json!({}), &[]);
        executor
            .run_single_with_params(
                &step,
                serde_json::json!({"value": "merged"}),
                interaction_id,
                "s1",
                &memory,
                &token,
                &NullProgress,
            )
            .await
            .expect("single run");

        let snap = memory.snapshot(interaction_id).expect("snapshot");
        assert_eq!(snap.step_results.get(&3).expect("step 3").payload["value"], "merged");
    }
}
