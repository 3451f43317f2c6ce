//! Planner → Critic → Executor loop for autonomous goal execution.
//!
//! Breaks a goal into a small number of discrete steps, executes each
//! with verification, and degrades gracefully to direct execution if
//! planning itself fails — important for weak local models that can't
//! reliably produce structured plans.

pub mod goal_boundaries;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::context::ContextMessage;
use super::llm::middleware::{LLMRequest, MiddlewarePipeline};
use super::llm::router::ModelRouter;

/// Hard cap on plan size, independent of any caller-supplied limit.
pub const MAX_PLAN_STEPS: usize = 8;
const PLANNING_MAX_TOKENS: u32 = 2048;
const PLANNING_TEMPERATURE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy)]
pub struct ComplexityProfile {
    pub max_steps: usize,
    pub max_agent_steps: u32,
    pub replan_depth: u32,
}

impl Complexity {
    pub fn profile(self) -> ComplexityProfile {
        match self {
            Complexity::Low => ComplexityProfile { max_steps: 3, max_agent_steps: 8, replan_depth: 0 },
            Complexity::Medium => ComplexityProfile { max_steps: 5, max_agent_steps: 12, replan_depth: 1 },
            Complexity::High => ComplexityProfile { max_steps: 8, max_agent_steps: 15, replan_depth: 2 },
        }
    }
}

const HIGH_COMPLEXITY_KEYWORDS: &[&str] = &[
    "refactor", "migrate", "architecture", "redesign", "overhaul",
    "integrate", "multi-file", "multiple files", "full test suite",
    "performance", "optimize", "security audit", "database schema",
];

const MEDIUM_COMPLEXITY_KEYWORDS: &[&str] = &[
    "implement", "feature", "add", "create", "build", "modify",
    "update", "fix bug", "debug", "test", "review", "analyze",
];

/// Estimates goal complexity from goal text to tune planning parameters.
pub struct GoalComplexityEstimator;

impl GoalComplexityEstimator {
    pub fn estimate(goal: &str) -> Complexity {
        let goal_lower = goal.to_lowercase();
        let word_count = goal.split_whitespace().count();

        if word_count > 100 {
            return Complexity::High;
        }

        let high_count = HIGH_COMPLEXITY_KEYWORDS.iter().filter(|kw| goal_lower.contains(*kw)).count();
        if high_count >= 2 {
            return Complexity::High;
        }

        let med_count = MEDIUM_COMPLEXITY_KEYWORDS.iter().filter(|kw| goal_lower.contains(*kw)).count();
        if med_count >= 2 || high_count >= 1 {
            return Complexity::Medium;
        }

        if word_count < 15 {
            return Complexity::Low;
        }

        Complexity::Medium
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    pub title: String,
    pub instruction: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default = "default_max_agent_steps")]
    pub max_agent_steps: u32,
}

fn default_max_agent_steps() -> u32 {
    12
}

impl PlanStep {
    pub fn to_prompt(&self) -> String {
        let criteria = if self.success_criteria.is_empty() {
            "  - Step completes without errors".to_string()
        } else {
            self.success_criteria.iter().map(|c| format!("  - {c}")).collect::<Vec<_>>().join("\n")
        };
        format!(
            "## Step: {}\n\n{}\n\nSuccess criteria:\n{criteria}\n\nFocus ONLY on this step. Do not work on other steps.",
            self.title, self.instruction,
        )
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
    pub assumptions: Vec<String>,
}

impl Plan {
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("Plan ({} steps):", self.steps.len())];
        for (i, s) in self.steps.iter().enumerate() {
            parts.push(format!("  {}. {}", i + 1, s.title));
        }
        parts.join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub summary: String,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct PlanFailure {
    pub reason: String,
    pub raw_output: String,
    pub recoverable: bool,
}

impl PlanFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), raw_output: String::new(), recoverable: true }
    }

    fn with_raw(reason: impl Into<String>, raw: &str) -> Self {
        Self { reason: reason.into(), raw_output: truncate(raw, 500), recoverable: true }
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

const PLAN_SYSTEM_PROMPT: &str = "You are a planning assistant. Given a goal, break it into a small number of concrete steps.

RULES:
- Maximum {max_steps} steps. Fewer is better.
- Each step must be independently verifiable.
- Steps should be ordered by dependency.
- Be specific and actionable - no vague steps.

Respond with ONLY a JSON object in this exact format (no markdown, no extra text):
{
  \"steps\": [
    {
      \"title\": \"Short title\",
      \"instruction\": \"Detailed instruction for what to do\",
      \"success_criteria\": [\"How to verify this step succeeded\"]
    }
  ],
  \"assumptions\": [\"Any assumptions about the project\"]
}";

fn plan_system_prompt(max_steps: usize) -> String {
    PLAN_SYSTEM_PROMPT.replace("{max_steps}", &max_steps.to_string())
}

fn replan_prompt(goal: &str, completed: &[PlanStep], failed_title: &str, failure_reason: &str) -> String {
    let completed_text = if completed.is_empty() {
        "  (none)".to_string()
    } else {
        completed.iter().enumerate().map(|(i, s)| format!("  {}. {} (DONE)", i + 1, s.title)).collect::<Vec<_>>().join("\n")
    };
    format!(
        "The original goal was: {goal}\n\nCompleted steps:\n{completed_text}\n\nStep \"{failed_title}\" FAILED: {failure_reason}\n\nCreate a revised plan for the REMAINING work only. The completed steps are already done.\nRespond with ONLY a JSON object in the same format as before."
    )
}

/// Extract a JSON object from potentially messy LLM output: whole trimmed
/// text first, then a fenced ```json block, then a balanced-brace scan.
fn extract_json(text: &str) -> Option<String> {
    let text = text.trim();
    if text.starts_with('{') {
        return Some(text.to_string());
    }
    if let Ok(re) = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```") {
        if let Some(cap) = re.captures(text) {
            return cap.get(1).map(|m| m.as_str().to_string());
        }
    }
    if let Some(start) = text.find('{') {
        return super::llm::response_parser::extract_balanced_json(text, start);
    }
    None
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    assumptions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default)]
    success_criteria: serde_json::Value,
}

fn criteria_from_value(v: serde_json::Value) -> Vec<String> {
    match v {
        serde_json::Value::String(s) => vec![s],
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_plan(goal: &str, raw: &str, max_steps: usize) -> Result<Plan, PlanFailure> {
    let json_str = extract_json(raw).ok_or_else(|| PlanFailure::with_raw("Could not extract JSON from planner output", raw))?;

    let data: RawPlan = serde_json::from_str(&json_str)
        .map_err(|e| PlanFailure::with_raw(format!("Invalid JSON: {e}"), raw))?;

    if data.steps.is_empty() {
        return Err(PlanFailure::with_raw("No steps in plan", raw));
    }

    let steps: Vec<PlanStep> = data
        .steps
        .into_iter()
        .take(max_steps)
        .enumerate()
        .map(|(i, s)| {
            let title = s.title.unwrap_or_else(|| format!("Step {}", i + 1));
            let instruction = s.instruction.unwrap_or_else(|| title.clone());
            PlanStep {
                step_id: format!("step_{}", i + 1),
                title,
                instruction,
                success_criteria: criteria_from_value(s.success_criteria),
                max_agent_steps: default_max_agent_steps(),
            }
        })
        .collect();

    if steps.is_empty() {
        return Err(PlanFailure::with_raw("No valid steps parsed", raw));
    }

    Ok(Plan { goal: goal.to_string(), steps, assumptions: data.assumptions })
}

/// Creates structured plans from goals via an LLM call, adapting step
/// count and replan budget to the goal's estimated complexity.
pub struct Planner {
    max_steps: usize,
    complexity: Complexity,
    replan_depth: u32,
    replan_count: u32,
}

impl Planner {
    pub fn new(max_steps: usize) -> Self {
        Self {
            max_steps: max_steps.min(MAX_PLAN_STEPS),
            complexity: Complexity::Medium,
            replan_depth: 1,
            replan_count: 0,
        }
    }

    pub fn complexity(&self) -> Complexity {
        self.complexity
    }

    /// Generate a plan for `goal`, estimating complexity first to tune
    /// `max_steps`/`replan_depth`/each step's `max_agent_steps`.
    pub async fn create_plan(
        &mut self,
        goal: &str,
        context: &str,
        router: &ModelRouter,
        pipeline: &MiddlewarePipeline,
        tier: usize,
    ) -> Result<Plan, PlanFailure> {
        self.complexity = GoalComplexityEstimator::estimate(goal);
        let profile = self.complexity.profile();
        let effective_max_steps = profile.max_steps.min(self.max_steps);
        self.replan_depth = profile.replan_depth;
        self.replan_count = 0;

        let system = plan_system_prompt(effective_max_steps);
        let mut user_msg = format!("GOAL: {goal}");
        let boundaries = goal_boundaries::extract_goal_boundaries(goal);
        if !boundaries.is_empty() {
            user_msg.push_str(&format!("\n\n{}", boundaries.to_planning_block()));
        }
        if !context.is_empty() {
            user_msg.push_str(&format!("\n\nCONTEXT:\n{context}"));
        }

        let mut request = LLMRequest::new(
            router.model_for_tier(tier),
            vec![ContextMessage::new("system", system), ContextMessage::new("user", user_msg)],
        );
        request.max_tokens = PLANNING_MAX_TOKENS;
        request.temperature = PLANNING_TEMPERATURE;

        let response = pipeline.execute(request).await.map_err(|e| PlanFailure::new(format!("LLM error: {e}")))?;
        if response.content.is_empty() {
            return Err(PlanFailure::new("Empty response from LLM"));
        }

        let mut plan = parse_plan(goal, &response.content, effective_max_steps)?;
        for step in &mut plan.steps {
            step.max_agent_steps = profile.max_agent_steps;
        }
        Ok(plan)
    }

    /// Revise the remaining plan after `failed_step` fails, bounded by
    /// the replan depth set by the last `create_plan` call.
    pub async fn replan_remaining(
        &mut self,
        goal: &str,
        completed: &[PlanStep],
        failed_step: &PlanStep,
        failure_reason: &str,
        router: &ModelRouter,
        pipeline: &MiddlewarePipeline,
        tier: usize,
    ) -> Result<Plan, PlanFailure> {
        self.replan_count += 1;
        if self.replan_count > self.replan_depth {
            return Err(PlanFailure {
                reason: format!("Replan depth exceeded ({} > {})", self.replan_count, self.replan_depth),
                raw_output: String::new(),
                recoverable: false,
            });
        }

        let system = plan_system_prompt(self.max_steps);
        let user_msg = replan_prompt(goal, completed, &failed_step.title, failure_reason);

        let mut request = LLMRequest::new(
            router.model_for_tier(tier),
            vec![ContextMessage::new("system", system), ContextMessage::new("user", user_msg)],
        );
        request.max_tokens = PLANNING_MAX_TOKENS;
        request.temperature = PLANNING_TEMPERATURE;

        let response = pipeline.execute(request).await.map_err(|e| PlanFailure::new(format!("Replan LLM error: {e}")))?;
        if response.content.is_empty() {
            return Err(PlanFailure::new("Empty replan response"));
        }

        parse_plan(goal, &response.content, self.max_steps)
    }
}

/// Validates plans with rule-based checks. No LLM call needed.
pub struct PlanCritic {
    max_steps: usize,
}

impl PlanCritic {
    pub fn new(max_steps: usize) -> Self {
        Self { max_steps }
    }

    /// Returns a list of issues; empty means the plan is OK.
    pub fn validate(&self, plan: &Plan) -> Vec<String> {
        let mut issues = Vec::new();

        if plan.steps.is_empty() {
            issues.push("Plan has no steps".to_string());
            return issues;
        }

        if plan.steps.len() > self.max_steps {
            issues.push(format!("Too many steps ({} > {})", plan.steps.len(), self.max_steps));
        }

        for step in &plan.steps {
            if step.title.trim().is_empty() {
                issues.push(format!("Step {} has empty title", step.step_id));
            }
            if step.instruction.trim().is_empty() {
                issues.push(format!("Step {} has empty instruction", step.step_id));
            }
            if step.instruction.len() < 10 {
                issues.push(format!("Step {} instruction too vague: '{}'", step.step_id, step.instruction));
            }
        }

        let mut titles: Vec<String> = plan.steps.iter().map(|s| s.title.to_lowercase().trim().to_string()).collect();
        titles.sort();
        titles.dedup();
        if titles.len() < plan.steps.len() {
            issues.push("Plan contains duplicate step titles (possible hallucination)".to_string());
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_low_complexity_for_short_goal() {
        assert_eq!(GoalComplexityEstimator::estimate("fix the typo"), Complexity::Low);
    }

    #[test]
    fn estimates_high_complexity_for_long_goal() {
        let goal = "word ".repeat(101);
        assert_eq!(GoalComplexityEstimator::estimate(&goal), Complexity::High);
    }

    #[test]
    fn estimates_high_complexity_for_two_high_keywords() {
        assert_eq!(
            GoalComplexityEstimator::estimate("refactor the architecture of the billing module"),
            Complexity::High
        );
    }

    #[test]
    fn estimates_medium_complexity_for_two_medium_keywords() {
        assert_eq!(
            GoalComplexityEstimator::estimate("implement and test the new login feature end to end"),
            Complexity::Medium
        );
    }

    #[test]
    fn parse_plan_extracts_fenced_json() {
        let raw = "Sure thing!\n```json\n{\"steps\": [{\"title\": \"Do it\", \"instruction\": \"Do the thing carefully\"}]}\n```";
        let plan = parse_plan("goal", raw, MAX_PLAN_STEPS).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].title, "Do it");
    }

    #[test]
    fn parse_plan_rejects_missing_steps() {
        let err = parse_plan("goal", "{\"assumptions\": []}", MAX_PLAN_STEPS).unwrap_err();
        assert_eq!(err.reason, "No steps in plan");
    }

    #[test]
    fn parse_plan_enforces_step_cap() {
        let steps: Vec<String> = (0..10)
            .map(|i| format!("{{\"title\": \"s{i}\", \"instruction\": \"do the work for step {i}\"}}"))
            .collect();
        let raw = format!("{{\"steps\": [{}]}}", steps.join(","));
        let plan = parse_plan("goal", &raw, 3).unwrap();
        assert_eq!(plan.steps.len(), 3);
    }

    fn sample_plan() -> Plan {
        Plan {
            goal: "goal".to_string(),
            steps: vec![
                PlanStep {
                    step_id: "step_1".into(),
                    title: "Read the file".into(),
                    instruction: "Open and read the config file".into(),
                    success_criteria: vec![],
                    max_agent_steps: 12,
                },
                PlanStep {
                    step_id: "step_2".into(),
                    title: "Write the file".into(),
                    instruction: "Write the updated config back".into(),
                    success_criteria: vec![],
                    max_agent_steps: 12,
                },
            ],
            assumptions: vec![],
        }
    }

    #[test]
    fn critic_accepts_well_formed_plan() {
        let critic = PlanCritic::new(MAX_PLAN_STEPS);
        assert!(critic.validate(&sample_plan()).is_empty());
    }

    #[test]
    fn critic_flags_duplicate_titles() {
        let critic = PlanCritic::new(MAX_PLAN_STEPS);
        let mut plan = sample_plan();
        plan.steps[1].title = "Read the file".to_string();
        let issues = critic.validate(&plan);
        assert!(issues.iter().any(|i| i.contains("duplicate")));
    }

    #[test]
    fn critic_flags_vague_instruction() {
        let critic = PlanCritic::new(MAX_PLAN_STEPS);
        let mut plan = sample_plan();
        plan.steps[0].instruction = "fix it".to_string();
        let issues = critic.validate(&plan);
        assert!(issues.iter().any(|i| i.contains("too vague")));
    }

    #[test]
    fn critic_flags_too_many_steps() {
        let critic = PlanCritic::new(1);
        let issues = critic.validate(&sample_plan());
        assert!(issues.iter().any(|i| i.contains("Too many steps")));
    }

    struct CapturingClient {
        last_request: std::sync::Mutex<Option<LLMRequest>>,
    }

    #[async_trait::async_trait]
    impl super::super::llm::middleware::LlmCaller for CapturingClient {
        async fn call(&self, request: LLMRequest) -> anyhow::Result<crate::harness::types::LLMResponse> {
            *self.last_request.lock().unwrap() = Some(request);
            Ok(crate::harness::types::LLMResponse {
                content: r#"{"steps": [{"title": "Do it", "instruction": "Do the thing carefully"}]}"#.to_string(),
                ..Default::default()
            })
        }
    }

    fn test_router() -> ModelRouter {
        ModelRouter::new(super::super::llm::client::ProfileSpec {
            url: "http://localhost:11434/v1".into(),
            api_key: String::new(),
            api_type: super::super::llm::client::ApiType::Ollama,
            extra_params: serde_json::Map::new(),
            models: vec!["small".into()],
        })
    }

    #[tokio::test]
    async fn create_plan_includes_goal_boundaries_in_the_prompt() {
        let client = std::sync::Arc::new(CapturingClient { last_request: std::sync::Mutex::new(None) });
        let pipeline = MiddlewarePipeline::new(client.clone());
        let router = test_router();
        let mut planner = Planner::new(MAX_PLAN_STEPS);

        planner
            .create_plan(
                "Add a login page. Exclude: the billing module. Done when: all tests pass.",
                "",
                &router,
                &pipeline,
                0,
            )
            .await
            .unwrap();

        let request = client.last_request.lock().unwrap().clone().unwrap();
        let user_msg = &request.messages.iter().find(|m| m.role == "user").unwrap().content;
        assert!(user_msg.contains("billing module"));
        assert!(user_msg.contains("tests pass"));
    }
}
