use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalCategory {
    Strategic,
    Content,
    Optimization,
    Retention,
    Competitive,
    Measurement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub description: String,
    pub category: GoalCategory,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// One grouping of skills derived from a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub description: String,
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor_phase_index: Option<usize>,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalPlan {
    pub goal_id: String,
    pub phases: Vec<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_template: Option<String>,
    pub estimated_task_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_goal() -> Goal {
        Goal {
            id: "goal-20260801-abcdef".to_string(),
            description: "Grow signups 20% this quarter".to_string(),
            category: GoalCategory::Strategic,
            priority: Priority::P1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deadline: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn goal_round_trips_through_json() {
        let goal = sample_goal();
        let json = serde_json::to_string(&goal).unwrap();
        let back: Goal = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, goal.id);
        assert_eq!(back.description, goal.description);
        assert_eq!(back.category, goal.category);
        assert_eq!(back.priority, goal.priority);
        assert_eq!(back.deadline, goal.deadline);
    }
}
