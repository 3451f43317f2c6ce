//! Dispatches parsed [`ToolCall`]s against the registry, enforcing policy
//! and emitting lifecycle events either sequentially or concurrently.

use std::sync::Arc;

use serde_json::json;

use super::events::EventBus;
use super::policy::PolicyEngine;
use super::tools::ToolRegistry;
use super::types::{AgentEvent, EventType, ToolCall, ToolResult};

pub struct ExecutionResult {
    pub results: Vec<ToolResult>,
    pub violations: Vec<String>,
}

impl ExecutionResult {
    pub fn all_succeeded(&self) -> bool {
        self.violations.is_empty() && self.results.iter().all(|r| r.success)
    }
}

pub struct Executor {
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    events: Arc<EventBus>,
}

impl Executor {
    pub fn new(registry: Arc<ToolRegistry>, policy: Arc<PolicyEngine>, events: Arc<EventBus>) -> Self {
        Self { registry, policy, events }
    }

    pub async fn execute(&self, calls: Vec<ToolCall>, concurrent: bool) -> ExecutionResult {
        if concurrent {
            self.execute_concurrent(calls).await
        } else {
            self.execute_sequential(calls).await
        }
    }

    async fn execute_sequential(&self, calls: Vec<ToolCall>) -> ExecutionResult {
        let mut results = Vec::with_capacity(calls.len());
        let mut violations = Vec::new();

        for call in calls {
            if let Err(violation) = self.policy.check(&call.name, &call.arguments) {
                self.events
                    .emit(AgentEvent::new(
                        EventType::PolicyViolation,
                        json!({"tool": call.name, "message": violation.message}),
                    ))
                    .await;
                violations.push(violation.to_string());
                results.push(ToolResult::err(violation.to_string()));
                continue;
            }

            self.events
                .emit(AgentEvent::new(EventType::ToolExecuting, json!({"tool": call.name})))
                .await;

            let result = self.registry.execute(&call.name, &call.arguments).await;
            self.policy.record(&call.name);

            if result.success {
                self.events
                    .emit(AgentEvent::new(
                        EventType::ToolExecuted,
                        json!({"tool": call.name, "success": true}),
                    ))
                    .await;
            } else {
                self.events
                    .emit(AgentEvent::new(
                        EventType::ToolError,
                        json!({"tool": call.name, "error": result.error.clone()}),
                    ))
                    .await;
            }
            results.push(result);
        }

        ExecutionResult { results, violations }
    }

    async fn execute_concurrent(&self, calls: Vec<ToolCall>) -> ExecutionResult {
        let mut violations = Vec::new();
        let mut results: Vec<Option<ToolResult>> = Vec::with_capacity(calls.len());
        let mut to_run: Vec<(usize, ToolCall)> = Vec::new();

        for (idx, call) in calls.into_iter().enumerate() {
            match self.policy.check(&call.name, &call.arguments) {
                Ok(()) => {
                    results.push(None);
                    to_run.push((idx, call));
                }
                Err(violation) => {
                    self.events
                        .emit(AgentEvent::new(
                            EventType::PolicyViolation,
                            json!({"tool": call.name, "message": violation.message}),
                        ))
                        .await;
                    violations.push(violation.to_string());
                    results.push(Some(ToolResult::err(violation.to_string())));
                }
            }
        }

        let mut set = tokio::task::JoinSet::new();
        for (idx, call) in to_run {
            let registry = self.registry.clone();
            let policy = self.policy.clone();
            let events = self.events.clone();
            set.spawn(async move {
                events
                    .emit(AgentEvent::new(EventType::ToolExecuting, json!({"tool": call.name})))
                    .await;
                let result = registry.execute(&call.name, &call.arguments).await;
                policy.record(&call.name);
                if result.success {
                    events
                        .emit(AgentEvent::new(
                            EventType::ToolExecuted,
                            json!({"tool": call.name, "success": true}),
                        ))
                        .await;
                } else {
                    events
                        .emit(AgentEvent::new(
                            EventType::ToolError,
                            json!({"tool": call.name, "error": result.error.clone()}),
                        ))
                        .await;
                }
                (idx, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => {
                    tracing::error!("tool task panicked: {e}");
                }
            }
        }

        let results = results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| ToolResult::err("tool task did not complete")))
            .collect();

        ExecutionResult { results, violations }
    }
}
