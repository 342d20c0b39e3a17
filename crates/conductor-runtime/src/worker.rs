//! Worker processor (C11, §4.8): pulls one job at a time off the queue,
//! checks budget, runs it through the executor, and hands the result to the
//! completion router — re-enqueueing whatever the router produces.

use std::sync::Arc;

use conductor_budget::BudgetState;
use conductor_core::{AgentExecutor, Workspace, WorkspaceError};
use conductor_types::CostEntry;
use conductor_observability::{emit_event, ObservabilityEvent, ProcessKind};
use conductor_orchestrator::{CompletionRouter, FailureTracker, RouteOutcome, RouterError};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::queue::{EnqueueOutcome, QueueError, QueueManager};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("router error: {0}")]
    Router(#[from] RouterError),
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// No job was waiting on the queue.
    Idle,
    /// A job ran to some conclusion; `paused_pipeline` is set once the
    /// failure tracker's threshold is crossed for `job.task.pipeline_id`.
    /// `cost_entry` is `None` when the job never reached the executor's RPC
    /// (deferred for budget, or failed before any model call).
    Processed {
        job_id: String,
        paused_pipeline: Option<String>,
        cost_entry: Option<CostEntry>,
    },
}

pub struct QueueWorker {
    workspace: Arc<Workspace>,
    queue: Arc<QueueManager>,
    executor: Arc<AgentExecutor>,
    router: Arc<CompletionRouter>,
    failures: Arc<FailureTracker>,
    required_sections: Vec<String>,
}

impl QueueWorker {
    pub fn new(
        workspace: Arc<Workspace>,
        queue: Arc<QueueManager>,
        executor: Arc<AgentExecutor>,
        router: Arc<CompletionRouter>,
        failures: Arc<FailureTracker>,
        required_sections: Vec<String>,
    ) -> Self {
        Self {
            workspace,
            queue,
            executor,
            router,
            failures,
            required_sections,
        }
    }

    /// Processes exactly one job, if the queue has one waiting (§4.8).
    pub async fn process_one(
        &self,
        budget: &BudgetState,
        cancel: CancellationToken,
    ) -> Result<WorkerOutcome, WorkerError> {
        let Some(job) = self.queue.pop().await else {
            return Ok(WorkerOutcome::Idle);
        };

        if !budget.allows(job.task.priority) {
            match self.queue.enqueue(&job.task, budget).await? {
                EnqueueOutcome::Deferred | EnqueueOutcome::Fallback { .. } | EnqueueOutcome::Enqueued { .. } => {}
            }
            return Ok(WorkerOutcome::Processed {
                job_id: job.id,
                paused_pipeline: None,
                cost_entry: None,
            });
        }

        let result = self
            .executor
            .execute(&job.task, None, budget, cancel.clone())
            .await;

        let cost_entry = result.model_tier.map(|model_tier| CostEntry {
            timestamp: chrono::Utc::now(),
            task_id: job.task.id.clone(),
            skill: job.task.skill.clone(),
            model_tier,
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            estimated_cost_usd: result.cost_usd,
        });

        let pipeline_id = job.task.pipeline_id.clone();
        let mut paused_pipeline = None;
        if let Some(pid) = &pipeline_id {
            if result.error.is_some() {
                if self.failures.record_failure(pid) {
                    paused_pipeline = Some(pid.clone());
                    emit_event(
                        Level::WARN,
                        ProcessKind::Runtime,
                        ObservabilityEvent {
                            event: "pipeline_failure_threshold_reached",
                            component: "worker",
                            correlation_id: None,
                            run_id: None,
                            task_id: Some(&job.task.id),
                            goal_id: job.task.goal_id.as_deref(),
                            pipeline_id: Some(pid),
                            provider_id: None,
                            model_id: None,
                            status: Some("paused"),
                            error_code: None,
                            detail: None,
                        },
                    );
                }
            } else {
                self.failures.record_success(pid);
            }
        }

        let outcome = self
            .router
            .route(&job.task, &result, &self.required_sections, cancel)
            .await?;

        match outcome {
            RouteOutcome::Complete => {}
            RouteOutcome::EnqueueTasks { tasks } => {
                for task in &tasks {
                    self.workspace.write_task(task).await?;
                    self.queue.enqueue(task, budget).await?;
                }
            }
            RouteOutcome::PauseCascade { .. } => {}
        }

        Ok(WorkerOutcome::Processed { job_id: job.id, paused_pipeline, cost_entry })
    }
}
