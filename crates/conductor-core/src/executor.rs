//! Agent executor (C6, §4.2): executes exactly one task end to end. Never
//! panics or propagates an error out of `execute` — every outcome, success
//! or failure, is reported through [`ExecuteResult`].

use std::sync::Arc;

use conductor_budget::BudgetState;
use conductor_providers::{LlmClient, ProviderError, ProviderErrorCode};
use conductor_skills::SkillRegistry;
use conductor_tools::ToolRegistry;
use conductor_types::{
    estimate_cost_usd, ModelSelection, ModelSelectionSource, ModelTier, Squad, Task, TaskStatus,
};
use conductor_wire::{ContentBlock, CreateMessageRequest, CreateMessageResponse, StopReason, WireMessage};
use conductor_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::config::AnthropicConfig;
use crate::prompt_builder::build_prompt;
use crate::storage::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorErrorCode {
    SkillNotFound,
    /// Reserved for taxonomy completeness (§4.2): missing task inputs are
    /// recorded as prompt-builder warnings rather than failing the task.
    InputNotFound,
    ApiError,
    RateLimited,
    Timeout,
    ApiOverloaded,
    ResponseEmpty,
    Truncated,
    MalformedOutput,
    BudgetExhausted,
    TaskNotExecutable,
    WorkspaceWriteFailed,
    Aborted,
    ToolError,
    ToolLoopLimit,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ExecutorError {
    pub code: ExecutorErrorCode,
    pub message: String,
}

impl From<ProviderError> for ExecutorError {
    fn from(err: ProviderError) -> Self {
        let code = match err.code {
            ProviderErrorCode::ApiError => ExecutorErrorCode::ApiError,
            ProviderErrorCode::RateLimited => ExecutorErrorCode::RateLimited,
            ProviderErrorCode::Timeout => ExecutorErrorCode::Timeout,
            ProviderErrorCode::ApiOverloaded => ExecutorErrorCode::ApiOverloaded,
            ProviderErrorCode::ResponseEmpty => ExecutorErrorCode::ResponseEmpty,
            ProviderErrorCode::Unknown => ExecutorErrorCode::Unknown,
        };
        ExecutorError {
            code,
            message: err.message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub status: TaskStatus,
    pub error: Option<ExecutorError>,
    pub output_path: Option<String>,
    pub model_tier: Option<ModelTier>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub tool_iterations: u32,
}

impl ExecuteResult {
    fn failed(code: ExecutorErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            error: Some(ExecutorError {
                code,
                message: message.into(),
            }),
            output_path: None,
            model_tier: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            tool_iterations: 0,
        }
    }
}

pub struct AgentExecutor {
    workspace: Arc<Workspace>,
    skills: Arc<SkillRegistry>,
    tools: Arc<ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    anthropic: AnthropicConfig,
    max_tool_iterations: u32,
}

impl AgentExecutor {
    pub fn new(
        workspace: Arc<Workspace>,
        skills: Arc<SkillRegistry>,
        tools: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
        anthropic: AnthropicConfig,
        max_tool_iterations: u32,
    ) -> Self {
        Self {
            workspace,
            skills,
            tools,
            llm,
            anthropic,
            max_tool_iterations,
        }
    }

    /// Fallible inner variant (`executeOrThrow`, §4.2): same pipeline, but
    /// raises the recorded error instead of returning it in the result.
    pub async fn execute_or_throw(
        &self,
        task: &Task,
        explicit_model: Option<ModelTier>,
        budget: &BudgetState,
        cancel: CancellationToken,
    ) -> Result<ExecuteResult, ExecutorError> {
        let result = self.execute(task, explicit_model, budget, cancel).await;
        match result.error {
            Some(ref err) => Err(err.clone()),
            None => Ok(result),
        }
    }

    pub async fn execute(
        &self,
        task: &Task,
        explicit_model: Option<ModelTier>,
        budget: &BudgetState,
        cancel: CancellationToken,
    ) -> ExecuteResult {
        if cancel.is_cancelled() {
            return ExecuteResult::failed(ExecutorErrorCode::Aborted, "cancelled before start");
        }
        if !task.status.is_executable() {
            return ExecuteResult::failed(
                ExecutorErrorCode::TaskNotExecutable,
                format!("task status {:?} is not executable", task.status),
            );
        }
        if budget.level == conductor_budget::BudgetLevel::Exhausted || !budget.allows(task.priority) {
            return ExecuteResult::failed(
                ExecutorErrorCode::BudgetExhausted,
                "budget level excludes this task's priority",
            );
        }

        let Some(skill) = self.skills.get(&task.skill).cloned() else {
            return ExecuteResult::failed(
                ExecutorErrorCode::SkillNotFound,
                format!("unknown skill `{}`", task.skill),
            );
        };

        let selection = select_model(explicit_model, budget.model_override, &skill);

        let prompt = match build_prompt(&self.workspace, &skill, task, self.anthropic.prompt_token_budget).await {
            Ok(prompt) => prompt,
            Err(err) => {
                return ExecuteResult::failed(ExecutorErrorCode::WorkspaceWriteFailed, err.to_string())
            }
        };

        if let Err(err) = self
            .workspace
            .update_task_status(&task.id, TaskStatus::InProgress)
            .await
        {
            return ExecuteResult::failed(ExecutorErrorCode::WorkspaceWriteFailed, err.to_string());
        }

        let model_id = self.anthropic.model_for_tier(selection.tier).to_string();
        let tools = self.tools.definitions_for_skill(&task.skill);
        let tool_definitions = if tools.is_empty() { None } else { Some(tools) };

        let mut messages = vec![WireMessage::user_text(prompt.user_message.clone())];
        let request = CreateMessageRequest {
            model: model_id.clone(),
            system: prompt.system_prompt.clone(),
            messages: messages.clone(),
            max_tokens: self.anthropic.max_response_tokens,
            timeout_ms: self.anthropic.request_timeout_ms,
            tools: tool_definitions.clone(),
        };

        let first = match self.llm.create_message(request, cancel.clone()).await {
            Ok(response) => response,
            Err(err) => return self.fail_task(task, err.into()).await,
        };

        let mut total_input_tokens = first.input_tokens;
        let mut total_output_tokens = first.output_tokens;
        let mut response = first;

        if response.stop_reason != StopReason::EndOfTurn
            && response.stop_reason != StopReason::ToolUse
            && !cancel.is_cancelled()
        {
            messages.push(WireMessage::assistant_text(response.content.clone()));
            messages.push(WireMessage::user_text("Please continue, but be more concise."));
            let retry_request = CreateMessageRequest {
                model: model_id.clone(),
                system: prompt.system_prompt.clone(),
                messages: messages.clone(),
                max_tokens: self.anthropic.max_response_tokens,
                timeout_ms: self.anthropic.request_timeout_ms,
                tools: tool_definitions.clone(),
            };
            match self.llm.create_message(retry_request, cancel.clone()).await {
                Ok(retry_response) => {
                    total_input_tokens += retry_response.input_tokens;
                    total_output_tokens += retry_response.output_tokens;
                    if retry_response.content.len() > response.content.len() {
                        response = retry_response;
                    } else if retry_response.stop_reason == StopReason::EndOfTurn {
                        response = retry_response;
                    }
                }
                Err(err) => return self.fail_task(task, err.into()).await,
            }
            if response.stop_reason != StopReason::EndOfTurn && response.stop_reason != StopReason::ToolUse {
                return self
                    .fail_task(
                        task,
                        ExecutorError {
                            code: ExecutorErrorCode::Truncated,
                            message: "response truncated after one recovery attempt".to_string(),
                        },
                    )
                    .await;
            }
        }

        let mut tool_iterations = 0u32;
        while response.stop_reason == StopReason::ToolUse {
            if tool_iterations >= self.max_tool_iterations {
                return self
                    .fail_task(
                        task,
                        ExecutorError {
                            code: ExecutorErrorCode::ToolLoopLimit,
                            message: format!("exceeded {} tool iterations", self.max_tool_iterations),
                        },
                    )
                    .await;
            }
            tool_iterations += 1;

            messages.push(WireMessage {
                role: conductor_wire::MessageRole::Assistant,
                blocks: response.content_blocks.clone(),
            });

            for block in &response.tool_use_blocks {
                let ContentBlock::ToolUse { id, name, input } = block else {
                    continue;
                };
                let allowed = self.tools.skill_allowed(
                    name.split_once("__").map(|(tool, _)| tool).unwrap_or(name.as_str()),
                    &task.skill,
                );
                let result = if !allowed {
                    Err(format!("tool `{name}` is not authorized for skill `{}`", task.skill))
                } else {
                    self.tools.invoke(name, input)
                };
                let wire_message = match result {
                    Ok(value) => WireMessage::tool_result(id.clone(), value, false),
                    Err(reason) => {
                        WireMessage::tool_result(id.clone(), serde_json::json!({ "error": reason }), true)
                    }
                };
                messages.push(wire_message);
            }

            let follow_up = CreateMessageRequest {
                model: model_id.clone(),
                system: prompt.system_prompt.clone(),
                messages: messages.clone(),
                max_tokens: self.anthropic.max_response_tokens,
                timeout_ms: self.anthropic.request_timeout_ms,
                tools: tool_definitions.clone(),
            };
            response = match self.llm.create_message(follow_up, cancel.clone()).await {
                Ok(response) => response,
                Err(err) => return self.fail_task(task, err.into()).await,
            };
            total_input_tokens += response.input_tokens;
            total_output_tokens += response.output_tokens;
        }

        if response.content.trim().is_empty() {
            return self
                .fail_task(
                    task,
                    ExecutorError {
                        code: ExecutorErrorCode::ResponseEmpty,
                        message: "model returned empty content".to_string(),
                    },
                )
                .await;
        }

        if let Err(err) = self
            .workspace
            .write_output(&task.output.path, &response.content)
            .await
        {
            return self.fail_task(task, ExecutorError {
                code: ExecutorErrorCode::WorkspaceWriteFailed,
                message: err.to_string(),
            }).await;
        }

        if let Err(err) = self
            .workspace
            .update_task_status(&task.id, TaskStatus::Completed)
            .await
        {
            return ExecuteResult::failed(ExecutorErrorCode::WorkspaceWriteFailed, err.to_string());
        }

        let cost_usd = estimate_cost_usd(selection.tier, total_input_tokens, total_output_tokens);

        emit_event(
            Level::INFO,
            ProcessKind::Runtime,
            ObservabilityEvent {
                event: "task_completed",
                component: "executor",
                correlation_id: None,
                run_id: None,
                task_id: Some(&task.id),
                goal_id: task.goal_id.as_deref(),
                pipeline_id: task.pipeline_id.as_deref(),
                provider_id: Some("anthropic"),
                model_id: Some(&model_id),
                status: Some("completed"),
                error_code: None,
                detail: None,
            },
        );

        ExecuteResult {
            status: TaskStatus::Completed,
            error: None,
            output_path: Some(task.output.path.clone()),
            model_tier: Some(selection.tier),
            input_tokens: total_input_tokens,
            output_tokens: total_output_tokens,
            cost_usd,
            tool_iterations,
        }
    }

    /// Best-effort status update on the error path (§4.2 step 13): a failed
    /// workspace write here does not mask the original error.
    async fn fail_task(&self, task: &Task, error: ExecutorError) -> ExecuteResult {
        let _ = self.workspace.update_task_status(&task.id, TaskStatus::Failed).await;
        let error_code = format!("{:?}", error.code);
        emit_event(
            Level::WARN,
            ProcessKind::Runtime,
            ObservabilityEvent {
                event: "task_failed",
                component: "executor",
                correlation_id: None,
                run_id: None,
                task_id: Some(&task.id),
                goal_id: task.goal_id.as_deref(),
                pipeline_id: task.pipeline_id.as_deref(),
                provider_id: Some("anthropic"),
                model_id: None,
                status: Some("failed"),
                error_code: Some(&error_code),
                detail: Some(&error.message),
            },
        );
        ExecuteResult {
            status: TaskStatus::Failed,
            error: Some(error),
            output_path: None,
            model_tier: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            tool_iterations: 0,
        }
    }
}

/// Precedence: explicit override > budget override > squad default
/// (`strategy ∪ foundation → opus`, others → `sonnet`, §4.2 step 5).
fn select_model(
    explicit: Option<ModelTier>,
    budget_override: Option<ModelTier>,
    skill: &conductor_types::SkillManifest,
) -> ModelSelection {
    if let Some(tier) = explicit {
        return ModelSelection {
            tier,
            source: ModelSelectionSource::Explicit,
        };
    }
    if let Some(tier) = budget_override {
        return ModelSelection {
            tier,
            source: ModelSelectionSource::Budget,
        };
    }
    let tier = if skill.is_foundation {
        Squad::Foundation.default_model_tier()
    } else {
        skill
            .squad
            .map(Squad::default_model_tier)
            .unwrap_or(ModelTier::Sonnet)
    };
    ModelSelection {
        tier,
        source: ModelSelectionSource::SquadDefault,
    }
}
