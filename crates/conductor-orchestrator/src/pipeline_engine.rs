//! Pipeline engine (C8, §4.4): executes a pipeline definition step by step.
//! Never throws — unexpected failures are captured as a typed step error.

use std::sync::Arc;

use chrono::Utc;
use conductor_budget::{BudgetState, BudgetThresholds};
use conductor_core::{AgentExecutor, Workspace};
use conductor_types::{
    generate_id, NextAction, OutputDescriptor, PipelineDefinition, PipelineRun, PipelineRunStatus,
    PipelineStep, Priority, Squad, Task, TaskInput, TaskStatus,
};
use tokio_util::sync::CancellationToken;

use crate::concurrency::{run_bounded, HarnessTask};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("workspace error: {0}")]
    Workspace(#[from] conductor_core::WorkspaceError),
    #[error("run `{0}` is not startable from its current status")]
    NotStartable(String),
    #[error("step index {0} out of range for pipeline `{1}`")]
    StepOutOfRange(usize, String),
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed { output_paths: Vec<String> },
    Paused,
    /// `code` is set for failures with a stable machine-readable identity
    /// (e.g. `NO_STEPS`, §8 B4); `None` for ordinary step-execution failures.
    Failed { message: String, code: Option<String> },
    Cancelled,
}

/// A pipeline definition with no steps (§8 B4).
pub const NO_STEPS: &str = "NO_STEPS";

pub struct PipelineEngine {
    workspace: Arc<Workspace>,
    executor: Arc<AgentExecutor>,
    max_concurrency: usize,
}

impl PipelineEngine {
    pub fn new(workspace: Arc<Workspace>, executor: Arc<AgentExecutor>, max_concurrency: usize) -> Self {
        Self {
            workspace,
            executor,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Starts or resumes `run` against `definition`, executing steps until a
    /// terminal state, a pause, or cancellation (§4.4).
    pub async fn advance(
        &self,
        definition: &PipelineDefinition,
        mut run: PipelineRun,
        goal_text: &str,
        priority: Priority,
        initial_input_paths: Option<Vec<String>>,
        cancel: CancellationToken,
    ) -> Result<(PipelineRun, StepOutcome), PipelineError> {
        if !run.status.is_startable() {
            return Err(PipelineError::NotStartable(run.id.clone()));
        }
        run.status = PipelineRunStatus::Running;
        run.updated_at = Utc::now();

        // Resuming past a review pause: the caller's input paths become the
        // next step's input, and the paused review step itself is skipped.
        let mut input_paths = match initial_input_paths {
            Some(paths) => {
                run.current_step_index += 1;
                paths
            }
            None => Vec::new(),
        };

        if definition.steps.is_empty() {
            run.status = PipelineRunStatus::Failed;
            run.updated_at = Utc::now();
            return Ok((
                run,
                StepOutcome::Failed {
                    message: format!("pipeline `{}` has no steps", definition.id),
                    code: Some(NO_STEPS.to_string()),
                },
            ));
        }

        loop {
            if cancel.is_cancelled() {
                run.status = PipelineRunStatus::Cancelled;
                run.updated_at = Utc::now();
                return Ok((run, StepOutcome::Cancelled));
            }
            let Some(step) = definition.steps.get(run.current_step_index) else {
                run.status = PipelineRunStatus::Completed;
                run.updated_at = Utc::now();
                return Ok((run, StepOutcome::Completed { output_paths: input_paths }));
            };

            let outcome = self
                .run_step(step, &run, goal_text, priority, &input_paths, cancel.clone())
                .await;

            match outcome {
                StepOutcome::Completed { output_paths: next_paths } => {
                    input_paths = next_paths;
                    run.current_step_index += 1;
                    run.updated_at = Utc::now();
                    continue;
                }
                StepOutcome::Paused => {
                    run.status = PipelineRunStatus::Paused;
                    run.updated_at = Utc::now();
                    return Ok((run, StepOutcome::Paused));
                }
                StepOutcome::Failed { message, code } => {
                    run.status = PipelineRunStatus::Failed;
                    run.updated_at = Utc::now();
                    return Ok((run, StepOutcome::Failed { message, code }));
                }
                StepOutcome::Cancelled => {
                    run.status = PipelineRunStatus::Cancelled;
                    run.updated_at = Utc::now();
                    return Ok((run, StepOutcome::Cancelled));
                }
            }
        }
    }

    async fn run_step(
        &self,
        step: &PipelineStep,
        run: &PipelineRun,
        goal_text: &str,
        priority: Priority,
        input_paths: &[String],
        cancel: CancellationToken,
    ) -> StepOutcome {
        match step {
            PipelineStep::Sequential { skill } => {
                let task = self.factory_task(skill, run, goal_text, priority, input_paths);
                if self.workspace.write_task(&task).await.is_err() {
                    return StepOutcome::Failed {
                        message: format!("failed to persist task for skill `{skill}`"),
                        code: None,
                    };
                }
                let budget = unrestricted_budget();
                let result = self.executor.execute(&task, None, &budget, cancel).await;
                if result.error.is_some() {
                    return StepOutcome::Failed {
                        message: result
                            .error
                            .map(|e| e.message)
                            .unwrap_or_else(|| "sequential step failed".to_string()),
                        code: None,
                    };
                }
                StepOutcome::Completed {
                    output_paths: result.output_path.into_iter().collect(),
                }
            }
            PipelineStep::Parallel { skills } => {
                let tasks: Vec<Task> = skills
                    .iter()
                    .map(|skill| self.factory_task(skill, run, goal_text, priority, input_paths))
                    .collect();
                for task in &tasks {
                    if self.workspace.write_task(task).await.is_err() {
                        return StepOutcome::Failed {
                            message: "failed to persist parallel step tasks".to_string(),
                            code: None,
                        };
                    }
                }
                let executor = self.executor.clone();
                let harness_tasks: Vec<HarnessTask<Result<String, String>>> = tasks
                    .into_iter()
                    .map(|task| {
                        let executor = executor.clone();
                        Box::new(move |child: CancellationToken| {
                            let executor = executor.clone();
                            Box::pin(async move {
                                let budget = unrestricted_budget();
                                let result = executor.execute(&task, None, &budget, child).await;
                                match (result.error, result.output_path) {
                                    (None, Some(path)) => Ok(path),
                                    (None, None) => Err("step produced no output".to_string()),
                                    (Some(err), _) => Err(err.message),
                                }
                            })
                                as std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, String>> + Send>>
                        }) as HarnessTask<Result<String, String>>
                    })
                    .collect();

                let outcome = run_bounded(harness_tasks, self.max_concurrency, cancel, |r| r.is_err()).await;
                if outcome.aborted {
                    return StepOutcome::Cancelled;
                }
                if let Some(index) = outcome.first_failure_index {
                    let message = outcome
                        .results
                        .iter()
                        .find(|item| item.index == index)
                        .and_then(|item| item.output.as_ref().err())
                        .cloned()
                        .unwrap_or_else(|| "parallel step failed".to_string());
                    return StepOutcome::Failed { message, code: None };
                }
                let output_paths = outcome
                    .results
                    .into_iter()
                    .filter_map(|item| item.output.ok())
                    .collect();
                StepOutcome::Completed { output_paths }
            }
            PipelineStep::Review { .. } => StepOutcome::Paused,
        }
    }

    fn factory_task(
        &self,
        skill: &str,
        run: &PipelineRun,
        goal_text: &str,
        priority: Priority,
        input_paths: &[String],
    ) -> Task {
        let now = Utc::now();
        let id = generate_id("task", now);
        let inputs: Vec<TaskInput> = input_paths
            .iter()
            .map(|path| TaskInput {
                path: path.clone(),
                description: "output of the previous pipeline step".to_string(),
            })
            .collect();
        Task {
            id: id.clone(),
            sender: "pipeline_engine".to_string(),
            skill: skill.to_string(),
            priority,
            deadline: None,
            status: TaskStatus::Pending,
            revision_count: 0,
            goal_id: run.goal_id.clone(),
            pipeline_id: Some(run.id.clone()),
            goal_text: goal_text.to_string(),
            inputs,
            requirements: format!("step {} of pipeline `{}`", run.current_step_index, run.definition_id),
            output: OutputDescriptor {
                path: Task::compute_output_path(skill, None::<Squad>, false, &id),
                format: "markdown".to_string(),
            },
            next: NextAction::PipelineContinue,
            tags: vec![run.definition_id.clone()],
            metadata: serde_json::Value::Null,
        }
    }
}

/// Pipeline-driven execution is gated by the scheduler/queue before a run
/// ever starts; step execution itself runs at full budget.
fn unrestricted_budget() -> BudgetState {
    BudgetState::derive(0.0, 1_000_000.0, BudgetThresholds::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_providers::{LlmClient, ProviderError};
    use conductor_tools::ToolRegistry;
    use conductor_wire::{ContentBlock, CreateMessageResponse};
    use conductor_wire::StopReason;
    use std::sync::Arc;

    struct StubLlm;

    #[async_trait::async_trait]
    impl LlmClient for StubLlm {
        async fn create_message(
            &self,
            _request: conductor_wire::CreateMessageRequest,
            _cancel: CancellationToken,
        ) -> Result<CreateMessageResponse, ProviderError> {
            Ok(CreateMessageResponse {
                content: "## Output\nDone.".to_string(),
                model: "claude-haiku".to_string(),
                input_tokens: 10,
                output_tokens: 10,
                stop_reason: StopReason::EndOfTurn,
                duration_ms: 5,
                tool_use_blocks: vec![],
                content_blocks: vec![ContentBlock::Text {
                    text: "## Output\nDone.".to_string(),
                }],
            })
        }
    }

    async fn engine_with(max_concurrency: usize) -> (PipelineEngine, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Arc::new(Workspace::new(tmp.path()).await.unwrap());
        let skills = Arc::new(conductor_skills::SkillRegistry::from_manifests(vec![]).unwrap());
        let tools = Arc::new(ToolRegistry::from_map(std::collections::HashMap::new()).unwrap());
        let executor = Arc::new(AgentExecutor::new(
            workspace.clone(),
            skills,
            tools,
            Arc::new(StubLlm),
            conductor_core::AnthropicConfig::default(),
            4,
        ));
        (PipelineEngine::new(workspace, executor, max_concurrency), tmp)
    }

    fn run_for(definition_id: &str) -> PipelineRun {
        let now = Utc::now();
        PipelineRun {
            id: generate_id("run", now),
            definition_id: definition_id.to_string(),
            goal_id: None,
            status: PipelineRunStatus::Pending,
            current_step_index: 0,
            task_ids: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn sequential_step_completes() {
        let (engine, _tmp) = engine_with(2).await;
        let definition = PipelineDefinition {
            id: "launch".to_string(),
            name: "Launch".to_string(),
            steps: vec![PipelineStep::Sequential { skill: "draft-copy".to_string() }],
        };
        let run = run_for("launch");
        let (run, outcome) = engine
            .advance(&definition, run, "grow signups", Priority::P1, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, PipelineRunStatus::Completed);
        matches!(outcome, StepOutcome::Completed { .. });
    }

    #[tokio::test]
    async fn empty_pipeline_fails_with_no_steps_code() {
        let (engine, _tmp) = engine_with(2).await;
        let definition = PipelineDefinition {
            id: "empty".to_string(),
            name: "Empty".to_string(),
            steps: vec![],
        };
        let run = run_for("empty");
        let (run, outcome) = engine
            .advance(&definition, run, "grow signups", Priority::P1, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, PipelineRunStatus::Failed);
        assert!(matches!(outcome, StepOutcome::Failed { code: Some(ref c), .. } if c == NO_STEPS));
    }

    #[tokio::test]
    async fn review_step_pauses_the_run() {
        let (engine, _tmp) = engine_with(2).await;
        let definition = PipelineDefinition {
            id: "launch".to_string(),
            name: "Launch".to_string(),
            steps: vec![
                PipelineStep::Sequential { skill: "draft-copy".to_string() },
                PipelineStep::Review { reviewer: "director".to_string() },
                PipelineStep::Sequential { skill: "publish".to_string() },
            ],
        };
        let run = run_for("launch");
        let (run, outcome) = engine
            .advance(&definition, run, "grow signups", Priority::P1, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, PipelineRunStatus::Paused);
        assert!(matches!(outcome, StepOutcome::Paused));

        let (run, outcome) = engine
            .advance(&definition, run, "grow signups", Priority::P1, Some(vec!["outputs/draft.md".to_string()]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, PipelineRunStatus::Completed);
        matches!(outcome, StepOutcome::Completed { .. });
    }

    #[tokio::test]
    async fn parallel_step_collects_results_in_order() {
        let (engine, _tmp) = engine_with(2).await;
        let definition = PipelineDefinition {
            id: "audit".to_string(),
            name: "Audit".to_string(),
            steps: vec![PipelineStep::Parallel {
                skills: vec!["seo-audit".to_string(), "competitor-scan".to_string()],
            }],
        };
        let run = run_for("audit");
        let (run, outcome) = engine
            .advance(&definition, run, "audit the market", Priority::P1, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, PipelineRunStatus::Completed);
        if let StepOutcome::Completed { output_paths } = outcome {
            assert_eq!(output_paths.len(), 2);
        } else {
            panic!("expected completion");
        }
    }
}
