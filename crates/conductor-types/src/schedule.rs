use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GoalCategory, Priority};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub target: ScheduleTarget,
    pub enabled: bool,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_category: Option<GoalCategory>,
    #[serde(default)]
    pub catch_up: bool,
}

/// Either a named pipeline template, or the `goal:{skill}` shorthand that
/// asks the Director to create a goal targeting a single skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleTarget {
    PipelineTemplate { name: String },
    Goal { skill: String },
}

impl ScheduleTarget {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix("goal:") {
            Some(skill) => ScheduleTarget::Goal {
                skill: skill.to_string(),
            },
            None => ScheduleTarget::PipelineTemplate {
                name: raw.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleState {
    pub schedule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_skip_reason: Option<String>,
    #[serde(default)]
    pub fire_count: u64,
}

impl ScheduleState {
    pub fn new(schedule_id: impl Into<String>) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            last_fired_at: None,
            last_skip_reason: None,
            fire_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_goal_shorthand() {
        let target = ScheduleTarget::parse("goal:seo-audit");
        assert!(matches!(target, ScheduleTarget::Goal { skill } if skill == "seo-audit"));
    }

    #[test]
    fn parses_pipeline_template_name() {
        let target = ScheduleTarget::parse("weekly-content-refresh");
        assert!(
            matches!(target, ScheduleTarget::PipelineTemplate { name } if name == "weekly-content-refresh")
        );
    }
}
