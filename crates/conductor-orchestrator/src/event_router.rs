//! Event bus (C15, §4.11): the dedup/cooldown/condition-eval layer that sits
//! on top of `conductor_core::EventBus`'s raw broadcast transport, mapping
//! incoming events to pipeline/goal starts through the Director.

use std::collections::HashMap;
use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use conductor_core::Workspace;
use conductor_types::{
    generate_id, Event, GoalCategory, PipelineRun, PipelineRunStatus, Priority, ScheduleTarget,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::director::Director;
use crate::pipeline_engine::{PipelineEngine, PipelineError};
use crate::pipeline_templates::PipelineTemplateRegistry;

/// A declarative predicate over `event.data`, evaluated without side effects
/// (§4.11 "pure, declarative expressions: thresholds, string matches").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    GreaterThan { field: String, threshold: f64 },
    LessThan { field: String, threshold: f64 },
    Equals { field: String, value: Value },
    Contains { field: String, substring: String },
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    pub fn evaluate(&self, data: &HashMap<String, Value>) -> bool {
        match self {
            Condition::GreaterThan { field, threshold } => {
                data.get(field).and_then(Value::as_f64).is_some_and(|v| v > *threshold)
            }
            Condition::LessThan { field, threshold } => {
                data.get(field).and_then(Value::as_f64).is_some_and(|v| v < *threshold)
            }
            Condition::Equals { field, value } => data.get(field) == Some(value),
            Condition::Contains { field, substring } => data
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|v| v.contains(substring.as_str())),
            Condition::All(conditions) => conditions.iter().all(|c| c.evaluate(data)),
            Condition::Any(conditions) => conditions.iter().any(|c| c.evaluate(data)),
        }
    }
}

/// One configured event-type → pipeline/goal mapping.
#[derive(Debug, Clone)]
pub struct EventMapping {
    pub event_type: String,
    pub target: ScheduleTarget,
    pub condition: Option<Condition>,
    pub cooldown: Duration,
    pub priority: Priority,
    pub goal_category: Option<GoalCategory>,
}

#[derive(Debug, thiserror::Error)]
pub enum EventRouterError {
    #[error("workspace error: {0}")]
    Workspace(#[from] conductor_core::WorkspaceError),
    #[error("director error: {0}")]
    Director(#[from] crate::director::DirectorError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("unknown pipeline template `{0}`")]
    UnknownPipelineTemplate(String),
}

#[derive(Debug, Clone, Default)]
pub struct TriggerOutcome {
    pub pipelines_triggered: usize,
    pub pipeline_ids: Vec<String>,
    pub skipped_reasons: Vec<String>,
}

/// Bounded ring buffer with O(1) membership test, used for event-id dedup
/// (§4.11 "bounded LRU of recent event ids" — no eviction policy beyond
/// capacity is needed since only membership, not recency ordering, matters).
struct BoundedIdSet {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl BoundedIdSet {
    fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), order: VecDeque::new(), seen: HashSet::new() }
    }

    /// Returns `true` if `id` was already present.
    fn insert_and_check(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return true;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        false
    }
}

pub struct EventRouter {
    workspace: std::sync::Arc<Workspace>,
    director: std::sync::Arc<Director>,
    pipelines: std::sync::Arc<PipelineEngine>,
    templates: std::sync::Arc<PipelineTemplateRegistry>,
    mappings: Vec<EventMapping>,
    seen_ids: Mutex<BoundedIdSet>,
    last_triggered: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl EventRouter {
    pub fn new(
        workspace: std::sync::Arc<Workspace>,
        director: std::sync::Arc<Director>,
        pipelines: std::sync::Arc<PipelineEngine>,
        templates: std::sync::Arc<PipelineTemplateRegistry>,
        mappings: Vec<EventMapping>,
    ) -> Self {
        Self {
            workspace,
            director,
            pipelines,
            templates,
            mappings,
            seen_ids: Mutex::new(BoundedIdSet::new(4096)),
            last_triggered: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `event` through dedup, cooldown, and condition evaluation,
    /// dispatching every matching mapping (§4.11).
    pub async fn emit(&self, event: Event) -> Result<TriggerOutcome, EventRouterError> {
        let mut outcome = TriggerOutcome::default();

        if self.seen_ids.lock().await.insert_and_check(&event.id) {
            outcome.skipped_reasons.push("duplicate_id".to_string());
            return Ok(outcome);
        }

        let matching: Vec<&EventMapping> =
            self.mappings.iter().filter(|m| m.event_type == event.event_type).collect();
        if matching.is_empty() {
            return Ok(outcome);
        }

        {
            let last = self.last_triggered.lock().await;
            if let Some(fired_at) = last.get(&event.event_type) {
                let cooldown = matching.iter().map(|m| m.cooldown).max().unwrap_or_default();
                if event.timestamp - *fired_at < cooldown {
                    outcome.skipped_reasons.push("cooldown".to_string());
                    return Ok(outcome);
                }
            }
        }

        for mapping in matching {
            if let Some(condition) = &mapping.condition {
                if !condition.evaluate(&event.data) {
                    outcome.skipped_reasons.push(format!("condition_not_met:{}", mapping.event_type));
                    continue;
                }
            }

            let pipeline_id = self.dispatch(mapping).await?;
            outcome.pipelines_triggered += 1;
            outcome.pipeline_ids.push(pipeline_id);
            self.last_triggered.lock().await.insert(event.event_type.clone(), event.timestamp);
        }

        Ok(outcome)
    }

    async fn dispatch(&self, mapping: &EventMapping) -> Result<String, EventRouterError> {
        match &mapping.target {
            ScheduleTarget::Goal { skill } => {
                let category = mapping.goal_category.unwrap_or(GoalCategory::Competitive);
                let goal = self
                    .director
                    .create_goal(
                        format!("event-triggered goal for skill `{skill}`"),
                        category,
                        mapping.priority,
                        None,
                    )
                    .await?;
                let plan = self.director.decompose(&goal, None);
                self.workspace.write_goal_plan(&plan).await?;
                self.director.materialize_phase(&goal, &plan, 0, &[]).await?;
                Ok(goal.id)
            }
            ScheduleTarget::PipelineTemplate { name } => {
                let definition = self
                    .templates
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EventRouterError::UnknownPipelineTemplate(name.clone()))?;
                let now = Utc::now();
                let run = PipelineRun {
                    id: generate_id("run", now),
                    definition_id: definition.id.clone(),
                    goal_id: None,
                    status: PipelineRunStatus::Pending,
                    current_step_index: 0,
                    task_ids: Vec::new(),
                    created_at: now,
                    updated_at: now,
                };
                let run_id = run.id.clone();
                self.pipelines
                    .advance(&definition, run, name, mapping.priority, None, CancellationToken::new())
                    .await?;
                Ok(run_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conductor_core::{AgentExecutor, AnthropicConfig, Workspace};
    use conductor_providers::{LlmClient, ProviderError};
    use conductor_skills::SkillRegistry;
    use conductor_tools::ToolRegistry;
    use conductor_types::{SkillManifest, Squad};
    use conductor_wire::{CreateMessageRequest, CreateMessageResponse};
    use std::sync::Arc;

    struct NullLlm;
    #[async_trait]
    impl LlmClient for NullLlm {
        async fn create_message(
            &self,
            _request: CreateMessageRequest,
            _cancel: CancellationToken,
        ) -> Result<CreateMessageResponse, ProviderError> {
            unreachable!("no pipeline templates are exercised in these tests")
        }
    }

    async fn router_with(mappings: Vec<EventMapping>) -> (EventRouter, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Arc::new(Workspace::new(tmp.path()).await.unwrap());
        let skills = Arc::new(
            SkillRegistry::from_manifests(vec![SkillManifest {
                name: "competitor-watch".to_string(),
                squad: Some(Squad::Measure),
                system_prompt: "watch competitors".to_string(),
                reference_files: vec![],
                tools: vec![],
                is_foundation: false,
            }])
            .unwrap(),
        );
        let director = Arc::new(Director::new(workspace.clone(), skills.clone(), None, "sonnet".to_string()));
        let executor = Arc::new(AgentExecutor::new(
            workspace.clone(),
            skills,
            Arc::new(ToolRegistry::from_map(Default::default()).unwrap()),
            Arc::new(NullLlm),
            AnthropicConfig::default(),
            10,
        ));
        let pipelines = Arc::new(PipelineEngine::new(workspace.clone(), executor, 4));
        let templates = Arc::new(PipelineTemplateRegistry::from_definitions(vec![]).unwrap());
        (EventRouter::new(workspace, director, pipelines, templates, mappings), tmp)
    }

    fn event(id: &str, event_type: &str, data: HashMap<String, Value>) -> Event {
        Event {
            id: id.to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            source: "test".to_string(),
            data,
        }
    }

    fn goal_mapping(event_type: &str, cooldown: Duration) -> EventMapping {
        EventMapping {
            event_type: event_type.to_string(),
            target: ScheduleTarget::Goal { skill: "competitor-watch".to_string() },
            condition: None,
            cooldown,
            priority: Priority::P1,
            goal_category: Some(GoalCategory::Competitive),
        }
    }

    #[tokio::test]
    async fn duplicate_event_id_is_skipped() {
        let (router, _tmp) = router_with(vec![goal_mapping("competitor_launch", Duration::zero())]).await;
        let first = router.emit(event("e1", "competitor_launch", HashMap::new())).await.unwrap();
        assert_eq!(first.pipelines_triggered, 1);
        let second = router.emit(event("e1", "competitor_launch", HashMap::new())).await.unwrap();
        assert_eq!(second.pipelines_triggered, 0);
        assert_eq!(second.skipped_reasons, vec!["duplicate_id".to_string()]);
    }

    #[tokio::test]
    async fn second_event_within_cooldown_is_skipped() {
        let (router, _tmp) = router_with(vec![goal_mapping("competitor_launch", Duration::minutes(30))]).await;
        router.emit(event("e1", "competitor_launch", HashMap::new())).await.unwrap();
        let second = router.emit(event("e2", "competitor_launch", HashMap::new())).await.unwrap();
        assert_eq!(second.pipelines_triggered, 0);
        assert_eq!(second.skipped_reasons, vec!["cooldown".to_string()]);
    }

    #[tokio::test]
    async fn condition_gates_the_mapping() {
        let mapping = EventMapping {
            condition: Some(Condition::GreaterThan { field: "severity".to_string(), threshold: 5.0 }),
            ..goal_mapping("competitor_launch", Duration::zero())
        };
        let (router, _tmp) = router_with(vec![mapping]).await;
        let mut low = HashMap::new();
        low.insert("severity".to_string(), Value::from(2));
        let skipped = router.emit(event("e1", "competitor_launch", low)).await.unwrap();
        assert_eq!(skipped.pipelines_triggered, 0);

        let mut high = HashMap::new();
        high.insert("severity".to_string(), Value::from(9));
        let fired = router.emit(event("e2", "competitor_launch", high)).await.unwrap();
        assert_eq!(fired.pipelines_triggered, 1);
    }

    #[tokio::test]
    async fn unmatched_event_type_triggers_nothing() {
        let (router, _tmp) = router_with(vec![goal_mapping("competitor_launch", Duration::zero())]).await;
        let outcome = router.emit(event("e1", "other_event", HashMap::new())).await.unwrap();
        assert_eq!(outcome.pipelines_triggered, 0);
        assert!(outcome.skipped_reasons.is_empty());
    }

    #[test]
    fn bounded_id_set_evicts_oldest_beyond_capacity() {
        let mut set = BoundedIdSet::new(2);
        assert!(!set.insert_and_check("a"));
        assert!(!set.insert_and_check("b"));
        assert!(!set.insert_and_check("c"));
        // "a" was evicted to make room for "c"; re-inserting reports it as new.
        assert!(!set.insert_and_check("a"));
    }
}
