//! Director (C9, §4.6): owns the goal lifecycle — creation, decomposition
//! into phases, phase materialization into tasks, reviewing completed task
//! output, and advancing a goal from one approved phase to the next.

use std::collections::HashMap;

use chrono::Utc;
use conductor_core::Workspace;
use conductor_providers::LlmClient;
use conductor_skills::SkillRegistry;
use conductor_types::{
    generate_id, Goal, GoalCategory, GoalPlan, Learning, NextAction, OutputDescriptor, Phase,
    Priority, Review, Squad, Task, TaskInput, TaskStatus,
};
use tokio_util::sync::CancellationToken;

use crate::review_engine::{ReviewEngine, ReviewInput};

#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error("workspace error: {0}")]
    Workspace(#[from] conductor_core::WorkspaceError),
    #[error("goal `{0}` not found")]
    GoalNotFound(String),
    #[error("goal `{0}` has no plan")]
    PlanNotFound(String),
    #[error("task `{0}` not found")]
    TaskNotFound(String),
    #[error("task `{0}` has no output yet")]
    OutputNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectorAction {
    Approve,
    Revise,
    RejectReassign,
    EscalateHuman,
    PipelineNext,
    GoalComplete,
    GoalIterate,
}

impl DirectorAction {
    /// Static action → status map (§4.6): decided once here so every review
    /// outcome updates task status the same way.
    pub fn task_status(self) -> TaskStatus {
        match self {
            DirectorAction::Approve
            | DirectorAction::PipelineNext
            | DirectorAction::GoalComplete
            | DirectorAction::GoalIterate => TaskStatus::Approved,
            DirectorAction::Revise => TaskStatus::Revision,
            DirectorAction::RejectReassign => TaskStatus::Failed,
            DirectorAction::EscalateHuman => TaskStatus::Blocked,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReviewDecision {
    pub action: DirectorAction,
    pub review: Review,
    pub next_tasks: Vec<Task>,
    pub learning: Option<Learning>,
    pub escalation: Option<String>,
    pub reasoning: String,
}

pub enum AdvanceOutcome {
    Complete,
    Materialized { tasks: Vec<Task> },
}

/// Maximum number of times a task is revised before being escalated (rather
/// than looping forever on a reject/revise cycle).
const MAX_REVISION_ATTEMPTS: u32 = 2;

pub struct Director {
    workspace: std::sync::Arc<Workspace>,
    skills: std::sync::Arc<SkillRegistry>,
    llm: Option<std::sync::Arc<dyn LlmClient>>,
    review_model: String,
}

impl Director {
    pub fn new(
        workspace: std::sync::Arc<Workspace>,
        skills: std::sync::Arc<SkillRegistry>,
        llm: Option<std::sync::Arc<dyn LlmClient>>,
        review_model: String,
    ) -> Self {
        Self {
            workspace,
            skills,
            llm,
            review_model,
        }
    }

    pub async fn create_goal(
        &self,
        description: impl Into<String>,
        category: GoalCategory,
        priority: Priority,
        deadline: Option<chrono::DateTime<Utc>>,
    ) -> Result<Goal, DirectorError> {
        let now = Utc::now();
        let goal = Goal {
            id: generate_id("goal", now),
            description: description.into(),
            category,
            priority,
            created_at: now,
            updated_at: now,
            deadline,
            metadata: HashMap::new(),
        };
        self.workspace.write_goal(&goal).await?;
        Ok(goal)
    }

    /// Routes a goal's category through the static squad sequence and turns
    /// it into a phase-by-phase plan. The measure squad always closes the
    /// sequence (§4.6).
    pub fn decompose(&self, goal: &Goal, pipeline_template: Option<String>) -> GoalPlan {
        let squads = routing_table(goal.category);
        let mut phases = Vec::with_capacity(squads.len());
        for (index, (squad, rationale)) in squads.iter().enumerate() {
            let skills = self.skills.skills_for_squad(*squad);
            phases.push(Phase {
                name: format!("{squad}"),
                description: rationale.to_string(),
                parallel: skills.len() > 1,
                predecessor_phase_index: if index == 0 { None } else { Some(index - 1) },
                skills,
            });
        }
        let estimated_task_count = phases.iter().map(|p| p.skills.len().max(1)).sum();
        GoalPlan {
            goal_id: goal.id.clone(),
            phases,
            pipeline_template,
            estimated_task_count,
        }
    }

    /// Materializes the tasks for `phase_index`, persisting them to the
    /// workspace. `input_paths` seeds every task's inputs (empty for phase
    /// 0).
    pub async fn materialize_phase(
        &self,
        goal: &Goal,
        plan: &GoalPlan,
        phase_index: usize,
        input_paths: &[String],
    ) -> Result<Vec<Task>, DirectorError> {
        let phase = plan
            .phases
            .get(phase_index)
            .ok_or_else(|| DirectorError::PlanNotFound(goal.id.clone()))?;
        let now = Utc::now();
        let inputs: Vec<TaskInput> = input_paths
            .iter()
            .map(|path| TaskInput {
                path: path.clone(),
                description: "output of the predecessor phase".to_string(),
            })
            .collect();

        let mut tasks = Vec::with_capacity(phase.skills.len());
        for skill in &phase.skills {
            let id = generate_id("task", now);
            let squad = self.skills.squad_of(skill);
            let is_foundation = self
                .skills
                .get(skill)
                .map(|m| m.is_foundation)
                .unwrap_or(false);
            let task = Task {
                id: id.clone(),
                sender: "director".to_string(),
                skill: skill.clone(),
                priority: goal.priority,
                deadline: goal.deadline,
                status: TaskStatus::Pending,
                revision_count: 0,
                goal_id: Some(goal.id.clone()),
                pipeline_id: None,
                goal_text: goal.description.clone(),
                inputs: inputs.clone(),
                requirements: phase.description.clone(),
                output: OutputDescriptor {
                    path: Task::compute_output_path(skill, squad, is_foundation, &id),
                    format: "markdown".to_string(),
                },
                next: NextAction::DirectorReview,
                tags: vec![phase.name.clone()],
                metadata: serde_json::Value::Null,
            };
            self.workspace.write_task(&task).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Reviews a completed task's output and derives a decision (§4.6).
    pub async fn review_task(
        &self,
        task: &Task,
        required_sections: &[String],
        cancel: CancellationToken,
    ) -> Result<ReviewDecision, DirectorError> {
        let content = self
            .workspace
            .read_output(&task.output.path)
            .await?
            .ok_or_else(|| DirectorError::OutputNotFound(task.id.clone()))?;

        let llm_ref = self
            .llm
            .as_ref()
            .map(|client| (client.as_ref() as &dyn LlmClient, self.review_model.as_str()));
        let scoring = ReviewEngine::review(
            ReviewInput {
                content: &content,
                required_sections,
            },
            llm_ref,
            cancel,
        )
        .await;

        let now = Utc::now();
        let review = Review {
            id: generate_id("review", now),
            task_id: task.id.clone(),
            reviewer: "director".to_string(),
            verdict: scoring.verdict,
            findings: scoring.findings.clone(),
            created_at: now,
        };

        let (action, next_tasks, learning, escalation, reasoning) = match scoring.verdict {
            conductor_types::Verdict::Approve => {
                let (action, reasoning) = match task.next {
                    NextAction::Complete => (DirectorAction::GoalComplete, "approved, final step".to_string()),
                    NextAction::PipelineContinue => {
                        (DirectorAction::PipelineNext, "approved, continuing pipeline".to_string())
                    }
                    NextAction::DirectorReview => {
                        (DirectorAction::GoalIterate, "approved, advancing goal phase".to_string())
                    }
                };
                (action, Vec::new(), None, None, reasoning)
            }
            conductor_types::Verdict::Revise => {
                if task.revision_count < MAX_REVISION_ATTEMPTS {
                    let mut revised = task.clone();
                    revised.revision_count += 1;
                    revised.status = TaskStatus::Revision;
                    (
                        DirectorAction::Revise,
                        vec![revised],
                        None,
                        None,
                        format!("revise: weighted score {:.1}", scoring.weighted_average),
                    )
                } else {
                    (
                        DirectorAction::EscalateHuman,
                        Vec::new(),
                        None,
                        Some(format!(
                            "task `{}` exceeded {} revision attempts",
                            task.id, MAX_REVISION_ATTEMPTS
                        )),
                        "revision budget exhausted".to_string(),
                    )
                }
            }
            conductor_types::Verdict::Reject => {
                if task.revision_count < MAX_REVISION_ATTEMPTS {
                    let id = generate_id("task", now);
                    let reassigned = Task {
                        id,
                        revision_count: task.revision_count + 1,
                        status: TaskStatus::Pending,
                        ..task.clone()
                    };
                    (
                        DirectorAction::RejectReassign,
                        vec![reassigned],
                        Some(Learning {
                            timestamp: now,
                            agent: task.skill.clone(),
                            goal_id: task.goal_id.clone(),
                            outcome: "rejected".to_string(),
                            learning: scoring
                                .findings
                                .first()
                                .map(|f| f.description.clone())
                                .unwrap_or_else(|| "output rejected by review".to_string()),
                            action_taken: "reassigned to a new task".to_string(),
                        }),
                        None,
                        "rejected, reassigning".to_string(),
                    )
                } else {
                    (
                        DirectorAction::EscalateHuman,
                        Vec::new(),
                        None,
                        Some(format!("task `{}` rejected past the reassignment limit", task.id)),
                        "reassignment budget exhausted".to_string(),
                    )
                }
            }
        };

        self.workspace.write_review(&review).await?;
        for next_task in &next_tasks {
            self.workspace.write_task(next_task).await?;
        }
        if let Some(learning) = &learning {
            self.workspace.append_learning(learning).await?;
        }
        self.workspace
            .update_task_status(&task.id, action.task_status())
            .await?;

        Ok(ReviewDecision {
            action,
            review,
            next_tasks,
            learning,
            escalation,
            reasoning,
        })
    }

    /// Computes the next phase to materialize by counting `approved` tasks
    /// per skill and consuming them phase-by-phase; returns `Complete` once
    /// every phase's skills have been consumed (§4.6).
    pub async fn advance_goal(&self, goal_id: &str) -> Result<AdvanceOutcome, DirectorError> {
        let goal = self
            .workspace
            .read_goal(goal_id)
            .await?
            .ok_or_else(|| DirectorError::GoalNotFound(goal_id.to_string()))?;
        let plan = self
            .workspace
            .read_goal_plan(goal_id)
            .await?
            .ok_or_else(|| DirectorError::PlanNotFound(goal_id.to_string()))?;

        let all_tasks = self.workspace.list_tasks().await?;
        let approved: Vec<&Task> = all_tasks
            .iter()
            .filter(|t| t.goal_id.as_deref() == Some(goal_id) && t.status == TaskStatus::Approved)
            .collect();

        let mut approved_counts: HashMap<String, u32> = HashMap::new();
        for task in &approved {
            *approved_counts.entry(task.skill.clone()).or_insert(0) += 1;
        }

        let mut consumed: HashMap<String, u32> = HashMap::new();
        for (index, phase) in plan.phases.iter().enumerate() {
            let satisfied = phase.skills.iter().all(|skill| {
                let need = consumed.get(skill).copied().unwrap_or(0) + 1;
                approved_counts.get(skill).copied().unwrap_or(0) >= need
            });
            if !satisfied {
                let predecessor = phase.predecessor_phase_index.unwrap_or(index.saturating_sub(1));
                let input_paths: Vec<String> = if index == 0 {
                    Vec::new()
                } else {
                    let predecessor_skills = &plan.phases[predecessor].skills;
                    approved
                        .iter()
                        .filter(|t| predecessor_skills.contains(&t.skill))
                        .map(|t| t.output.path.clone())
                        .collect()
                };
                let tasks = self.materialize_phase(&goal, &plan, index, &input_paths).await?;
                return Ok(AdvanceOutcome::Materialized { tasks });
            }
            for skill in &phase.skills {
                *consumed.entry(skill.clone()).or_insert(0) += 1;
            }
        }

        Ok(AdvanceOutcome::Complete)
    }
}

/// `GoalCategory → [{squad, rationale}]`, measure always last (§4.6).
fn routing_table(category: GoalCategory) -> Vec<(Squad, &'static str)> {
    match category {
        GoalCategory::Strategic => vec![
            (Squad::Strategy, "set strategic direction"),
            (Squad::Creative, "produce supporting creative"),
            (Squad::Convert, "build the conversion path"),
            (Squad::Measure, "measure outcomes"),
        ],
        GoalCategory::Content => vec![
            (Squad::Creative, "produce content"),
            (Squad::Convert, "wire content into the funnel"),
            (Squad::Measure, "measure outcomes"),
        ],
        GoalCategory::Optimization => vec![
            (Squad::Convert, "optimize the conversion path"),
            (Squad::Activate, "activate the optimized experience"),
            (Squad::Measure, "measure outcomes"),
        ],
        GoalCategory::Retention => vec![
            (Squad::Activate, "run retention plays"),
            (Squad::Measure, "measure outcomes"),
        ],
        GoalCategory::Competitive => vec![
            (Squad::Strategy, "assess the competitive position"),
            (Squad::Measure, "measure outcomes"),
        ],
        GoalCategory::Measurement => vec![(Squad::Measure, "measure outcomes")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::{Priority, SkillManifest};

    fn skills_with(entries: &[(&str, Squad)]) -> std::sync::Arc<SkillRegistry> {
        std::sync::Arc::new(
            SkillRegistry::from_manifests(
                entries
                    .iter()
                    .map(|(name, squad)| SkillManifest {
                        name: name.to_string(),
                        squad: Some(*squad),
                        system_prompt: "prompt".to_string(),
                        reference_files: vec![],
                        tools: vec![],
                        is_foundation: false,
                    })
                    .collect(),
            )
            .unwrap(),
        )
    }

    async fn director_with(skills: std::sync::Arc<SkillRegistry>) -> (Director, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = std::sync::Arc::new(Workspace::new(tmp.path()).await.unwrap());
        (
            Director::new(workspace, skills, None, "sonnet".to_string()),
            tmp,
        )
    }

    #[tokio::test]
    async fn decompose_ends_with_measure_phase() {
        let skills = skills_with(&[("seo-audit", Squad::Measure), ("draft-copy", Squad::Creative)]);
        let (director, _tmp) = director_with(skills).await;
        let goal = director
            .create_goal("Grow signups", GoalCategory::Content, Priority::P1, None)
            .await
            .unwrap();
        let plan = director.decompose(&goal, None);
        assert_eq!(plan.phases.last().unwrap().name, "measure");
    }

    #[tokio::test]
    async fn materialize_first_phase_persists_pending_tasks() {
        let skills = skills_with(&[("draft-copy", Squad::Creative)]);
        let (director, _tmp) = director_with(skills).await;
        let goal = director
            .create_goal("Grow signups", GoalCategory::Content, Priority::P1, None)
            .await
            .unwrap();
        let plan = director.decompose(&goal, None);
        let tasks = director.materialize_phase(&goal, &plan, 0, &[]).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[0].next, NextAction::DirectorReview);
    }

    #[tokio::test]
    async fn advance_goal_materializes_next_phase_once_first_is_approved() {
        let skills = skills_with(&[("draft-copy", Squad::Creative), ("landing-page", Squad::Convert)]);
        let (director, _tmp) = director_with(skills).await;
        let goal = director
            .create_goal("Grow signups", GoalCategory::Content, Priority::P1, None)
            .await
            .unwrap();
        let plan = director.decompose(&goal, None);
        director.workspace.write_goal_plan(&plan).await.unwrap();
        let phase0 = director.materialize_phase(&goal, &plan, 0, &[]).await.unwrap();
        for task in &phase0 {
            director.workspace.write_output(&task.output.path, "done").await.unwrap();
            director
                .workspace
                .update_task_status(&task.id, TaskStatus::Completed)
                .await
                .unwrap();
            director
                .workspace
                .update_task_status(&task.id, TaskStatus::Approved)
                .await
                .unwrap();
        }
        match director.advance_goal(&goal.id).await.unwrap() {
            AdvanceOutcome::Materialized { tasks } => {
                assert_eq!(tasks[0].skill, "landing-page");
                assert!(!tasks[0].inputs.is_empty());
            }
            AdvanceOutcome::Complete => panic!("expected another phase to materialize"),
        }
    }

    #[tokio::test]
    async fn advance_goal_completes_once_every_phase_is_approved() {
        let skills = skills_with(&[("seo-audit", Squad::Measure)]);
        let (director, _tmp) = director_with(skills).await;
        let goal = director
            .create_goal("Measure things", GoalCategory::Measurement, Priority::P1, None)
            .await
            .unwrap();
        let plan = director.decompose(&goal, None);
        director.workspace.write_goal_plan(&plan).await.unwrap();
        let tasks = director.materialize_phase(&goal, &plan, 0, &[]).await.unwrap();
        for task in &tasks {
            director
                .workspace
                .update_task_status(&task.id, TaskStatus::Completed)
                .await
                .unwrap();
            director
                .workspace
                .update_task_status(&task.id, TaskStatus::Approved)
                .await
                .unwrap();
        }
        match director.advance_goal(&goal.id).await.unwrap() {
            AdvanceOutcome::Complete => {}
            AdvanceOutcome::Materialized { .. } => panic!("expected the goal to be complete"),
        }
    }
}
