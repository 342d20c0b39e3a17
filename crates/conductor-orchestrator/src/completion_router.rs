//! Completion router (C12, §4.9): routes a completed task by `task.next`'s
//! type, performing all persistence before returning so a caller never has
//! to follow up with its own writes.

use std::sync::Arc;

use conductor_core::{ExecuteResult, Workspace};
use conductor_types::{NextAction, Task, TaskStatus};
use tokio_util::sync::CancellationToken;

use crate::director::{AdvanceOutcome, Director, DirectorAction, DirectorError};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("workspace error: {0}")]
    Workspace(#[from] conductor_core::WorkspaceError),
    #[error("director error: {0}")]
    Director(#[from] DirectorError),
}

#[derive(Debug, Clone)]
pub enum RouteOutcome {
    Complete,
    EnqueueTasks { tasks: Vec<Task> },
    PauseCascade { reason: String },
}

pub struct CompletionRouter {
    workspace: Arc<Workspace>,
    director: Arc<Director>,
}

impl CompletionRouter {
    pub fn new(workspace: Arc<Workspace>, director: Arc<Director>) -> Self {
        Self { workspace, director }
    }

    /// Routes `task` after its execution result, per `task.next.type` (§4.9).
    pub async fn route(
        &self,
        task: &Task,
        result: &ExecuteResult,
        required_sections: &[String],
        cancel: CancellationToken,
    ) -> Result<RouteOutcome, RouterError> {
        if result.error.is_some() {
            return Ok(RouteOutcome::PauseCascade {
                reason: result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "task execution failed".to_string()),
            });
        }

        match task.next {
            NextAction::Complete => {
                self.workspace
                    .update_task_status(&task.id, TaskStatus::Approved)
                    .await?;
                if let Some(goal_id) = &task.goal_id {
                    self.director.advance_goal(goal_id).await?;
                }
                Ok(RouteOutcome::Complete)
            }
            NextAction::DirectorReview => {
                let decision = self
                    .director
                    .review_task(task, required_sections, cancel)
                    .await?;
                Ok(match decision.action {
                    DirectorAction::Approve
                    | DirectorAction::Revise
                    | DirectorAction::RejectReassign
                    | DirectorAction::GoalIterate => {
                        if decision.next_tasks.is_empty() {
                            RouteOutcome::Complete
                        } else {
                            RouteOutcome::EnqueueTasks { tasks: decision.next_tasks }
                        }
                    }
                    DirectorAction::EscalateHuman => RouteOutcome::PauseCascade {
                        reason: decision
                            .escalation
                            .unwrap_or_else(|| "escalated to a human reviewer".to_string()),
                    },
                    DirectorAction::PipelineNext | DirectorAction::GoalComplete => RouteOutcome::Complete,
                })
            }
            NextAction::PipelineContinue => {
                let Some(goal_id) = &task.goal_id else {
                    return Ok(RouteOutcome::Complete);
                };
                match self.director.advance_goal(goal_id).await? {
                    AdvanceOutcome::Materialized { tasks } if !tasks.is_empty() => {
                        Ok(RouteOutcome::EnqueueTasks { tasks })
                    }
                    _ => Ok(RouteOutcome::Complete),
                }
            }
        }
    }
}
