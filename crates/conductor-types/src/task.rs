use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Approved,
    Revision,
    Failed,
    Blocked,
    Deferred,
    Cancelled,
}

impl TaskStatus {
    /// Only these statuses are executable by the agent executor (§4.2 step 2).
    pub fn is_executable(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Revision
        )
    }

    /// The legal transition table referenced in §9 Design Notes: centralize
    /// status transitions so illegal ones are rejected at the workspace
    /// boundary.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Assigned | InProgress | Cancelled | Blocked | Deferred) => true,
            (Assigned, InProgress | Cancelled | Blocked | Deferred) => true,
            (InProgress, Completed | Failed | Blocked | Cancelled) => true,
            (Completed, Approved | Revision | Failed) => true,
            (Revision, InProgress | Assigned | Cancelled) => true,
            (Failed, Revision | Cancelled | Blocked) => true,
            (Blocked, Pending | Assigned | Cancelled) => true,
            (Deferred, Pending | Assigned | Cancelled) => true,
            (same, next) if same == next => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub path: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub path: String,
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NextAction {
    Complete,
    DirectorReview,
    PipelineContinue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub sender: String,
    pub skill: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub status: TaskStatus,
    #[serde(default)]
    pub revision_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    pub goal_text: String,
    #[serde(default)]
    pub inputs: Vec<TaskInput>,
    pub requirements: String,
    pub output: OutputDescriptor,
    pub next: NextAction,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl Task {
    /// Output path is deterministic from squad/skill/id (invariant I1).
    pub fn compute_output_path(
        skill: &str,
        squad: Option<crate::Squad>,
        is_foundation: bool,
        task_id: &str,
    ) -> String {
        if is_foundation {
            return "context/product-marketing-context.md".to_string();
        }
        match squad {
            Some(squad) => format!("outputs/{}/{skill}/{task_id}.md", squad.directory_name()),
            None => format!("outputs/{skill}/{task_id}.md"),
        }
    }
}
