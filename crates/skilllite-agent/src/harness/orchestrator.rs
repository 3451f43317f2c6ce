//! Thin main loop tying the harness together:
//!
//!   context -> LLM -> reasoner -> executor -> loop
//!
//! The orchestrator owns no business logic of its own; it wires the
//! [`Reasoner`], [`Executor`], and [`AgentContext`] together, drives the
//! checkpoint engine's snapshot/rollback cadence, and emits events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;

use super::checkpoint::{detect_git, CheckpointEngine};
use super::context::AgentContext;
use super::events::EventBus;
use super::executor::Executor;
use super::llm::error_recovery::ErrorRecoveryMiddleware;
use super::llm::middleware::{LLMRequest, LlmCaller, MiddlewarePipeline};
use super::llm::prompt_optimizer::{PromptOptimizerMiddleware, ThinkingMode};
use super::llm::router::ModelRouter;
use super::planner::{Plan, PlanCritic, PlanStep, Planner, MAX_PLAN_STEPS};
use super::policy::{category_for, PolicyEngine, ToolCategory};
use super::reasoner::{Reasoner, ReasonerDecision};
use super::tools::ToolRegistry;
use super::types::{AgentEvent, EventType};

const WRITE_SNAPSHOT_INTERVAL: u32 = 5;

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// A plan step counts as failed when its `run()` terminated on an error or
/// step-limit path rather than a normal `RESPOND` decision.
fn is_step_failure(result: &str) -> bool {
    result.starts_with("Agent error") || result == "Step limit reached" || result.contains("budget")
}

pub struct Orchestrator {
    router: ModelRouter,
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    events: Arc<EventBus>,
    pipeline: MiddlewarePipeline,
    reasoner: Reasoner,
    executor: Executor,
    checkpoint: CheckpointEngine,
    context_budget: usize,
    writes_since_snapshot: u32,
    cancelled: Arc<AtomicBool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: ModelRouter,
        registry: Arc<ToolRegistry>,
        policy: Arc<PolicyEngine>,
        events: Arc<EventBus>,
        pipeline: Option<MiddlewarePipeline>,
        max_steps: u32,
        context_budget: usize,
        project_root: impl Into<String>,
    ) -> Self {
        let project_root = project_root.into();
        let has_git = detect_git(&project_root);
        let pipeline = pipeline.unwrap_or_else(|| {
            let client: Arc<dyn LlmCaller> = router.get_client();
            let mut pipeline = MiddlewarePipeline::new(client);
            pipeline.use_middleware(Arc::new(PromptOptimizerMiddleware::new(ThinkingMode::Auto)));

            let profile = router.profile().clone();
            let mut error_recovery = ErrorRecoveryMiddleware::new(registry.tool_names());
            error_recovery.on_escalate = Some(Box::new(move |current: &str| profile.next_tier_model(current)));
            pipeline.use_middleware(Arc::new(error_recovery));

            pipeline
        });
        let executor = Executor::new(registry.clone(), policy.clone(), events.clone());
        Self {
            router,
            registry,
            policy,
            events,
            pipeline,
            reasoner: Reasoner::new(max_steps),
            executor,
            checkpoint: CheckpointEngine::new(project_root, has_git),
            context_budget,
            writes_since_snapshot: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the agent loop until completion or cancellation, returning the
    /// final text response.
    pub async fn run(&mut self, goal: &str, context: Option<AgentContext>) -> String {
        self.cancelled.store(false, Ordering::SeqCst);
        self.reasoner.reset();
        self.writes_since_snapshot = 0;
        self.policy.begin_goal();
        self.checkpoint.begin();

        let mut ctx = context.unwrap_or_default();
        if ctx.system.tools_description.is_empty() {
            ctx.system.tools_description = self.registry.get_compact_prompt_description();
        }
        ctx.add_user_message(goal);

        self.emit(EventType::AgentStarted, json!({ "goal": goal })).await;

        let mut final_response = String::new();
        let mut was_cancelled = false;

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                was_cancelled = true;
                break;
            }
            tokio::task::yield_now().await;

            let messages = ctx.to_messages(self.context_budget);
            let request = LLMRequest::new(self.router.current_model(), messages);
            let response = match self.pipeline.execute(request).await {
                Ok(r) => r,
                Err(e) => {
                    final_response = format!("Agent error: {e}");
                    self.emit(EventType::AgentError, json!({ "error": final_response })).await;
                    break;
                }
            };

            self.emit(
                EventType::LlmResponse,
                json!({
                    "model": response.model,
                    "has_tool_calls": response.has_tool_calls(),
                    "content_length": response.content.chars().count(),
                    "latency_ms": response.latency_ms,
                }),
            )
            .await;

            if let Some(usage) = &response.usage {
                self.policy.record_usage(usage.total_tokens);
                if let Err(violation) = self.policy.check_token_budget() {
                    final_response = violation.message;
                    break;
                }
            }

            if let Some(thinking) = &response.thinking {
                if !thinking.is_empty() {
                    self.emit(EventType::LlmThinking, json!({ "thinking": thinking })).await;
                }
            }

            let decision = self.reasoner.decide(&response);
            self.emit(
                EventType::ReasonerDecision,
                json!({ "decision": format!("{decision:?}"), "step": self.reasoner.step_count() }),
            )
            .await;

            match decision {
                ReasonerDecision::Done(text) => {
                    ctx.add_assistant_message(text.clone());
                    final_response = text;
                    break;
                }
                ReasonerDecision::StepLimitReached => {
                    final_response = "Step limit reached".to_string();
                    break;
                }
                ReasonerDecision::Error(err) => {
                    self.emit(EventType::AgentError, json!({ "error": err })).await;
                    final_response = err;
                    break;
                }
                ReasonerDecision::ExecuteTools(calls) => {
                    ctx.add_assistant_message(response.content.clone());
                    ctx.cycle_working();

                    let names: Vec<String> = calls.iter().map(|c| c.name.clone()).collect();
                    let outcome = self.executor.execute(calls, false).await;

                    for (name, result) in names.iter().zip(outcome.results.iter()) {
                        ctx.add_tool_result(name, &result.to_message());

                        if result.success {
                            if category_for(name) == ToolCategory::Write {
                                self.writes_since_snapshot += 1;
                                if self.writes_since_snapshot >= WRITE_SNAPSHOT_INTERVAL {
                                    self.checkpoint.snapshot(&format!(
                                        "after {} writes (step {})",
                                        self.writes_since_snapshot,
                                        self.reasoner.step_count()
                                    ));
                                    self.writes_since_snapshot = 0;
                                }
                            }
                        } else if name == "run_tests" && !self.checkpoint.snapshots().is_empty() {
                            self.checkpoint.rollback(None);
                            ctx.add_user_message(
                                "[ROLLBACK] Changes have been rolled back due to a failing test. \
                                 Review the previous steps and try a different approach.",
                            );
                        }
                    }
                }
            }
        }

        if was_cancelled && final_response.is_empty() {
            final_response = "Agent cancelled".to_string();
        }

        self.checkpoint.finish(true);

        let done_type = if was_cancelled { EventType::AgentCancelled } else { EventType::AgentDone };
        self.emit(
            done_type,
            json!({ "response": truncate(&final_response, 500), "steps": self.reasoner.step_count() }),
        )
        .await;

        final_response
    }

    /// Decompose `goal` into a short plan via [`Planner`], execute each step
    /// in turn through [`Self::run`], and fall back to direct single-prompt
    /// execution (a plain `run(goal, None)`) whenever planning itself fails,
    /// the critic rejects the plan, or a step fails and the replan budget is
    /// exhausted.
    pub async fn run_goal(&mut self, goal: &str) -> String {
        let original_max_steps = self.reasoner.max_steps;

        let mut planner = Planner::new(MAX_PLAN_STEPS);
        let critic = PlanCritic::new(MAX_PLAN_STEPS);

        let plan = match planner.create_plan(goal, "", &self.router, &self.pipeline, 0).await {
            Ok(plan) => plan,
            Err(_) => return self.run(goal, None).await,
        };
        if !critic.validate(&plan).is_empty() {
            return self.run(goal, None).await;
        }

        let result = self.run_plan(goal, plan, &mut planner, &critic).await;
        self.reasoner = Reasoner::new(original_max_steps);
        result
    }

    /// Execute a validated [`Plan`] one step at a time, replanning the
    /// remaining work when a step fails and falling through to direct
    /// execution once the replan budget or the plan itself is exhausted.
    async fn run_plan(&mut self, goal: &str, mut plan: Plan, planner: &mut Planner, critic: &PlanCritic) -> String {
        let mut completed: Vec<PlanStep> = Vec::new();
        let mut summaries = Vec::new();
        let mut idx = 0;

        while idx < plan.steps.len() {
            let step = plan.steps[idx].clone();
            self.reasoner = Reasoner::new(step.max_agent_steps);

            let mut ctx = AgentContext::default();
            ctx.plan.steps = plan.steps.iter().map(|s| s.title.clone()).collect();
            ctx.plan.current_step = idx;

            let step_result = self.run(&step.instruction, Some(ctx)).await;

            if is_step_failure(&step_result) {
                match planner
                    .replan_remaining(goal, &completed, &step, &step_result, &self.router, &self.pipeline, 0)
                    .await
                {
                    Ok(revised) if critic.validate(&revised).is_empty() => {
                        plan.steps.truncate(idx);
                        plan.steps.extend(revised.steps);
                        continue;
                    }
                    _ => return self.run(goal, None).await,
                }
            }

            summaries.push(format!("{}. {} — {}", idx + 1, step.title, truncate(&step_result, 200)));
            completed.push(step);
            idx += 1;
        }

        format!("Completed a {}-step plan:\n{}", completed.len(), summaries.join("\n"))
    }

    /// Request cancellation of the running loop. Safe to call from
    /// another task while `run` is in flight.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// A cloneable handle that can cancel this orchestrator from a task
    /// that doesn't (and can't, while `run` holds `&mut self`) have
    /// direct access to it.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancelled.clone())
    }

    async fn emit(&self, event_type: EventType, data: serde_json::Value) {
        self.events.emit(AgentEvent::new(event_type, data)).await;
    }
}

#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::llm::client::ProfileSpec;
    use crate::harness::policy::PolicySpec;
    use crate::harness::tools::builtin;
    use crate::harness::types::{LLMResponse, ToolCall};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct ScriptedClient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmCaller for ScriptedClient {
        async fn call(&self, _request: LLMRequest) -> anyhow::Result<LLMResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(LLMResponse {
                    content: "{\"tool\": \"git_status\", \"args\": {}}".to_string(),
                    tool_calls: vec![ToolCall {
                        name: "git_status".into(),
                        arguments: serde_json::Map::new(),
                        raw: String::new(),
                    }],
                    ..Default::default()
                })
            } else {
                Ok(LLMResponse { content: "all done".to_string(), ..Default::default() })
            }
        }
    }

    fn profile() -> ProfileSpec {
        ProfileSpec {
            url: "http://localhost:11434/v1".into(),
            api_key: String::new(),
            api_type: crate::harness::llm::client::ApiType::Ollama,
            extra_params: serde_json::Map::new(),
            models: vec!["test-model".to_string()],
        }
    }

    #[tokio::test]
    async fn runs_a_tool_then_returns_final_text() {
        let mut registry = ToolRegistry::new();
        builtin::register_defaults(&mut registry);
        let policy = Arc::new(PolicyEngine::new(PolicySpec::preset("full")));
        let events = Arc::new(EventBus::default());
        let router = ModelRouter::new(profile());

        let client: Arc<dyn LlmCaller> = Arc::new(ScriptedClient { calls: AtomicU32::new(0) });
        let pipeline = MiddlewarePipeline::new(client);

        let mut orchestrator =
            Orchestrator::new(router, Arc::new(registry), policy, events, Some(pipeline), 10, 0, "/tmp");

        let response = orchestrator.run("check repo status", None).await;
        assert_eq!(response, "all done");
    }

    struct AlwaysPlainTextClient;

    #[async_trait]
    impl LlmCaller for AlwaysPlainTextClient {
        async fn call(&self, _request: LLMRequest) -> anyhow::Result<LLMResponse> {
            Ok(LLMResponse { content: "sure thing, all done".to_string(), ..Default::default() })
        }
    }

    #[tokio::test]
    async fn run_goal_falls_back_to_direct_execution_when_planning_fails() {
        let registry = ToolRegistry::new();
        let policy = Arc::new(PolicyEngine::new(PolicySpec::preset("full")));
        let events = Arc::new(EventBus::default());
        let router = ModelRouter::new(profile());
        let client: Arc<dyn LlmCaller> = Arc::new(AlwaysPlainTextClient);
        let pipeline = MiddlewarePipeline::new(client);

        let mut orchestrator =
            Orchestrator::new(router, Arc::new(registry), policy, events, Some(pipeline), 10, 0, "/tmp");

        // The planner's own request also goes through `AlwaysPlainTextClient`,
        // which never answers with plan JSON, so `run_goal` must fall through
        // to a direct `run()` rather than getting stuck.
        let response = orchestrator.run_goal("do a simple thing").await;
        assert_eq!(response, "sure thing, all done");
    }

    struct NeverDoneClient;

    #[async_trait]
    impl LlmCaller for NeverDoneClient {
        async fn call(&self, _request: LLMRequest) -> anyhow::Result<LLMResponse> {
            Ok(LLMResponse {
                content: "{\"tool\": \"noop\", \"args\": {}}".to_string(),
                tool_calls: vec![ToolCall {
                    name: "noop".into(),
                    arguments: serde_json::Map::new(),
                    raw: String::new(),
                }],
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn cancel_handle_stops_a_loop_that_would_otherwise_run_to_the_step_limit() {
        let registry = ToolRegistry::new();
        let policy = Arc::new(PolicyEngine::new(PolicySpec::preset("full")));
        let events = Arc::new(EventBus::default());
        let router = ModelRouter::new(profile());
        let client: Arc<dyn LlmCaller> = Arc::new(NeverDoneClient);
        let pipeline = MiddlewarePipeline::new(client);

        let mut orchestrator =
            Orchestrator::new(router, Arc::new(registry), policy, events, Some(pipeline), 10_000, 0, "/tmp");
        let handle = orchestrator.cancel_handle();

        let canceller = async {
            tokio::task::yield_now().await;
            handle.cancel();
        };
        let (response, _) = tokio::join!(orchestrator.run("anything", None), canceller);
        assert_eq!(response, "Agent cancelled");
    }
}
