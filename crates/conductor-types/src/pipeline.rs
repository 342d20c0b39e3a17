use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineStep {
    Sequential { skill: String },
    Parallel { skills: Vec<String> },
    Review { reviewer: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<PipelineStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineRunStatus::Completed | PipelineRunStatus::Failed | PipelineRunStatus::Cancelled
        )
    }

    /// A run is startable only from `pending` or `paused` (§4.4).
    pub fn is_startable(self) -> bool {
        matches!(self, PipelineRunStatus::Pending | PipelineRunStatus::Paused)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub definition_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    pub status: PipelineRunStatus,
    pub current_step_index: usize,
    #[serde(default)]
    pub task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_and_paused_are_startable() {
        assert!(PipelineRunStatus::Pending.is_startable());
        assert!(PipelineRunStatus::Paused.is_startable());
        assert!(!PipelineRunStatus::Running.is_startable());
        assert!(!PipelineRunStatus::Completed.is_startable());
    }

    #[test]
    fn terminal_statuses() {
        for status in [
            PipelineRunStatus::Completed,
            PipelineRunStatus::Failed,
            PipelineRunStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
        }
        assert!(!PipelineRunStatus::Running.is_terminal());
    }
}
