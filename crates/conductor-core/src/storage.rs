//! Workspace abstraction (C2, §6): opaque typed reads/writes for tasks,
//! outputs, reviews, goals, learnings, and schedule state, backed by the
//! filesystem path conventions in §6. Adapted from the teacher's
//! `Storage` (async `tokio::fs` + `RwLock`-guarded in-memory state), with
//! the chat-session/legacy-import machinery replaced by this domain's
//! markdown+YAML-frontmatter entity files.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use conductor_types::{Goal, GoalPlan, Learning, Review, ScheduleState, Squad, Task, TaskStatus};

use crate::storage_paths::is_within_workspace_root;

const GOALS_DIR: &str = "goals";
const OUTPUTS_DIR: &str = "outputs";
const CONTEXT_DIR: &str = "context";
const MEMORY_DIR: &str = "memory";
const SCHEDULES_DIR: &str = "schedules";
const QUEUE_FALLBACK_DIR: &str = "queue-fallback";
const TASKS_DIR: &str = "tasks";
const REVIEWS_DIR: &str = "reviews";

const FOUNDATION_CONTEXT_PATH: &str = "context/product-marketing-context.md";
const LEARNINGS_PATH: &str = "memory/learnings.md";

#[derive(thiserror::Error, Debug)]
pub enum WorkspaceError {
    #[error("path `{0}` escapes the workspace root")]
    PathEscape(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed entity at `{path}`: {reason}")]
    Malformed { path: String, reason: String },
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// Filesystem-backed workspace. One writer at a time per path is assumed
/// safe (§5 "single-writer per path is sufficient"); the internal lock
/// only serializes the directory-listing operations that read multiple
/// files at once.
pub struct Workspace {
    root: PathBuf,
    list_lock: RwLock<()>,
}

impl Workspace {
    pub async fn new(root: impl Into<PathBuf>) -> WorkspaceResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        for dir in [
            GOALS_DIR,
            OUTPUTS_DIR,
            CONTEXT_DIR,
            MEMORY_DIR,
            SCHEDULES_DIR,
            QUEUE_FALLBACK_DIR,
            TASKS_DIR,
            REVIEWS_DIR,
        ] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self {
            root,
            list_lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> WorkspaceResult<PathBuf> {
        let candidate = self.root.join(relative);
        if !is_within_workspace_root(&candidate, &self.root) {
            return Err(WorkspaceError::PathEscape(relative.to_string()));
        }
        Ok(candidate)
    }

    pub async fn read_file(&self, relative: &str) -> WorkspaceResult<Option<Vec<u8>>> {
        let path = self.resolve(relative)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(&path).await?))
    }

    pub async fn write_file(&self, relative: &str, bytes: &[u8]) -> WorkspaceResult<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        Ok(())
    }

    // -- Tasks ---------------------------------------------------------

    fn task_path(id: &str) -> String {
        format!("{TASKS_DIR}/{id}.md")
    }

    pub async fn read_task(&self, id: &str) -> WorkspaceResult<Option<Task>> {
        self.read_frontmatter_entity(&Self::task_path(id)).await
    }

    pub async fn write_task(&self, task: &Task) -> WorkspaceResult<()> {
        let body = format!("## Goal\n\n{}\n\n## Requirements\n\n{}\n", task.goal_text, task.requirements);
        self.write_frontmatter_entity(&Self::task_path(&task.id), task, &body).await
    }

    /// Rejects the write when the transition is illegal (§9 "reject
    /// illegal transitions at the workspace boundary").
    pub async fn update_task_status(&self, id: &str, status: TaskStatus) -> WorkspaceResult<()> {
        let Some(mut task) = self.read_task(id).await? else {
            return Err(WorkspaceError::Malformed {
                path: Self::task_path(id),
                reason: "task not found".to_string(),
            });
        };
        if !task.status.can_transition_to(status) {
            return Err(WorkspaceError::Malformed {
                path: Self::task_path(id),
                reason: format!("illegal transition {:?} -> {:?}", task.status, status),
            });
        }
        task.status = status;
        self.write_task(&task).await
    }

    pub async fn list_tasks(&self) -> WorkspaceResult<Vec<Task>> {
        let _guard = self.list_lock.read().await;
        self.list_frontmatter_entities(TASKS_DIR).await
    }

    // -- Outputs ---------------------------------------------------------

    /// Invariant I1: `outputs/{squad}/{skill}/{id}.md`, or the foundation
    /// context path, or `outputs/{skill}/{id}.md` when squad is unknown.
    pub fn output_path(skill: &str, squad: Option<Squad>, is_foundation: bool, task_id: &str) -> String {
        Task::compute_output_path(skill, squad, is_foundation, task_id)
    }

    pub async fn read_output(&self, path: &str) -> WorkspaceResult<Option<String>> {
        let bytes = self.read_file(path).await?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    pub async fn write_output(&self, path: &str, content: &str) -> WorkspaceResult<()> {
        self.write_file(path, content.as_bytes()).await
    }

    // -- Context (foundation skill output) --------------------------------

    pub async fn read_context(&self) -> WorkspaceResult<Option<String>> {
        self.read_output(FOUNDATION_CONTEXT_PATH).await
    }

    pub async fn context_exists(&self) -> bool {
        self.resolve(FOUNDATION_CONTEXT_PATH)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    // -- Learnings ---------------------------------------------------------

    pub async fn read_learnings(&self, skill_filter: Option<&str>) -> WorkspaceResult<Vec<Learning>> {
        let raw = self.read_file(LEARNINGS_PATH).await?;
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&raw);
        let mut entries = Vec::new();
        for block in text.split("\n---\n") {
            let trimmed = block.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_yaml::from_str::<Learning>(trimmed) {
                Ok(entry) => {
                    let matches = skill_filter
                        .map(|skill| entry.agent == skill)
                        .unwrap_or(true);
                    if matches {
                        entries.push(entry);
                    }
                }
                Err(_) => continue,
            }
        }
        Ok(entries)
    }

    pub async fn append_learning(&self, entry: &Learning) -> WorkspaceResult<()> {
        let serialized = serde_yaml::to_string(entry).map_err(|err| WorkspaceError::Malformed {
            path: LEARNINGS_PATH.to_string(),
            reason: err.to_string(),
        })?;
        let mut existing = self
            .read_file(LEARNINGS_PATH)
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        if !existing.is_empty() && !existing.ends_with('\n') {
            existing.push('\n');
        }
        existing.push_str(&serialized);
        existing.push_str("---\n");
        self.write_file(LEARNINGS_PATH, existing.as_bytes()).await
    }

    // -- Goals ---------------------------------------------------------

    fn goal_path(id: &str) -> String {
        format!("{GOALS_DIR}/{id}.md")
    }

    fn goal_plan_path(id: &str) -> String {
        format!("{GOALS_DIR}/{id}-plan.md")
    }

    pub async fn read_goal(&self, id: &str) -> WorkspaceResult<Option<Goal>> {
        let Some(bytes) = self.read_file(&Self::goal_path(id)).await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        let (frontmatter, _body) = split_frontmatter(&text).ok_or_else(|| WorkspaceError::Malformed {
            path: Self::goal_path(id),
            reason: "missing frontmatter".to_string(),
        })?;
        serde_yaml::from_str(frontmatter)
            .map(Some)
            .map_err(|err| WorkspaceError::Malformed {
                path: Self::goal_path(id),
                reason: err.to_string(),
            })
    }

    pub async fn write_goal(&self, goal: &Goal) -> WorkspaceResult<()> {
        let body = format!("## Description\n\n{}\n", goal.description);
        self.write_frontmatter_entity(&Self::goal_path(&goal.id), goal, &body).await
    }

    pub async fn list_goals(&self) -> WorkspaceResult<Vec<Goal>> {
        let _guard = self.list_lock.read().await;
        let dir = self.resolve(GOALS_DIR)?;
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_plan = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with("-plan.md"))
                .unwrap_or(false);
            if is_plan || path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(goal) = self.read_goal(id).await? {
                out.push(goal);
            }
        }
        Ok(out)
    }

    pub async fn read_goal_plan(&self, goal_id: &str) -> WorkspaceResult<Option<GoalPlan>> {
        self.read_frontmatter_entity(&Self::goal_plan_path(goal_id)).await
    }

    pub async fn write_goal_plan(&self, plan: &GoalPlan) -> WorkspaceResult<()> {
        self.write_frontmatter_entity(&Self::goal_plan_path(&plan.goal_id), plan, "").await
    }

    // -- Reviews ---------------------------------------------------------

    fn review_path(id: &str) -> String {
        format!("{REVIEWS_DIR}/{id}.md")
    }

    pub async fn write_review(&self, review: &Review) -> WorkspaceResult<()> {
        self.write_frontmatter_entity(&Self::review_path(&review.id), review, "").await
    }

    pub async fn list_reviews(&self, task_id: &str) -> WorkspaceResult<Vec<Review>> {
        let _guard = self.list_lock.read().await;
        let all: Vec<Review> = self.list_frontmatter_entities(REVIEWS_DIR).await?;
        Ok(all.into_iter().filter(|r| r.task_id == task_id).collect())
    }

    // -- Schedule state ---------------------------------------------------------

    fn schedule_state_path(id: &str) -> String {
        format!("{SCHEDULES_DIR}/{id}.json")
    }

    pub async fn read_schedule_state(&self, id: &str) -> WorkspaceResult<Option<ScheduleState>> {
        let Some(bytes) = self.read_file(&Self::schedule_state_path(id)).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|err| WorkspaceError::Malformed {
            path: Self::schedule_state_path(id),
            reason: err.to_string(),
        })
    }

    pub async fn write_schedule_state(&self, state: &ScheduleState) -> WorkspaceResult<()> {
        let path = Self::schedule_state_path(&state.schedule_id);
        let raw = serde_json::to_vec_pretty(state).map_err(|err| WorkspaceError::Malformed {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        self.write_file(&path, &raw).await
    }

    // -- Queue fallback ---------------------------------------------------------

    pub async fn write_queue_fallback(&self, job_id: &str, payload: &serde_json::Value) -> WorkspaceResult<()> {
        let path = format!("{QUEUE_FALLBACK_DIR}/{job_id}.json");
        let raw = serde_json::to_vec_pretty(payload).map_err(|err| WorkspaceError::Malformed {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        self.write_file(&path, &raw).await
    }

    // -- Generic frontmatter entity helpers ---------------------------------------------------------

    async fn read_frontmatter_entity<T: DeserializeOwned>(&self, relative: &str) -> WorkspaceResult<Option<T>> {
        let Some(bytes) = self.read_file(relative).await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        let (frontmatter, _body) = split_frontmatter(&text).ok_or_else(|| WorkspaceError::Malformed {
            path: relative.to_string(),
            reason: "missing frontmatter".to_string(),
        })?;
        serde_yaml::from_str(frontmatter)
            .map(Some)
            .map_err(|err| WorkspaceError::Malformed {
                path: relative.to_string(),
                reason: err.to_string(),
            })
    }

    async fn write_frontmatter_entity<T: Serialize>(
        &self,
        relative: &str,
        entity: &T,
        body: &str,
    ) -> WorkspaceResult<()> {
        let frontmatter = serde_yaml::to_string(entity).map_err(|err| WorkspaceError::Malformed {
            path: relative.to_string(),
            reason: err.to_string(),
        })?;
        let document = compose_frontmatter(&frontmatter, body);
        self.write_file(relative, document.as_bytes()).await
    }

    async fn list_frontmatter_entities<T: DeserializeOwned>(&self, dir: &str) -> WorkspaceResult<Vec<T>> {
        let path = self.resolve(dir)?;
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            if entry_path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let relative = format!(
                "{dir}/{}",
                entry_path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
            );
            if let Some(item) = self.read_frontmatter_entity(&relative).await? {
                out.push(item);
            }
        }
        Ok(out)
    }
}

fn split_frontmatter(text: &str) -> Option<(&str, &str)> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix("---")?;
    let (frontmatter, body) = rest.split_once("---")?;
    Some((frontmatter.trim(), body.trim_start_matches('\n')))
}

fn compose_frontmatter(frontmatter: &str, body: &str) -> String {
    format!("---\n{}---\n\n{body}", frontmatter.trim_end().to_string() + "\n")
}

/// Timestamp helper shared by the scheduler and cost-report writer.
pub fn today_stamp() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::{GoalCategory, NextAction, OutputDescriptor, Priority};

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            sender: "director".to_string(),
            skill: "copywriting".to_string(),
            priority: Priority::P1,
            deadline: None,
            status: TaskStatus::Pending,
            revision_count: 0,
            goal_id: Some("goal-20260801-abcdef".to_string()),
            pipeline_id: None,
            goal_text: "Write launch copy".to_string(),
            inputs: vec![],
            requirements: "Keep it under 200 words".to_string(),
            output: OutputDescriptor {
                path: Workspace::output_path("copywriting", Some(Squad::Creative), false, id),
                format: "markdown".to_string(),
            },
            next: NextAction::Complete,
            tags: vec![],
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn write_then_read_task_round_trips() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(tmp.path()).await.expect("workspace");
        let task = sample_task("task-20260801-abcdef");
        workspace.write_task(&task).await.expect("write");
        let loaded = workspace
            .read_task("task-20260801-abcdef")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(loaded.skill, "copywriting");
        assert_eq!(loaded.requirements, "Keep it under 200 words");
    }

    #[tokio::test]
    async fn update_task_status_rejects_illegal_transition() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(tmp.path()).await.expect("workspace");
        let task = sample_task("task-20260801-abcdef");
        workspace.write_task(&task).await.expect("write");
        let result = workspace
            .update_task_status("task-20260801-abcdef", TaskStatus::Approved)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_task_status_allows_legal_transition() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(tmp.path()).await.expect("workspace");
        let task = sample_task("task-20260801-abcdef");
        workspace.write_task(&task).await.expect("write");
        workspace
            .update_task_status("task-20260801-abcdef", TaskStatus::InProgress)
            .await
            .expect("legal transition");
        let loaded = workspace.read_task("task-20260801-abcdef").await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn goal_round_trips_with_description_in_body() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(tmp.path()).await.expect("workspace");
        let goal = Goal {
            id: "goal-20260801-abcdef".to_string(),
            description: "Grow signups 20%".to_string(),
            category: GoalCategory::Strategic,
            priority: Priority::P0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deadline: None,
            metadata: Default::default(),
        };
        workspace.write_goal(&goal).await.expect("write");
        let loaded = workspace.read_goal(&goal.id).await.expect("read").expect("present");
        assert_eq!(loaded.description, goal.description);
        assert_eq!(loaded.category, goal.category);
    }

    #[tokio::test]
    async fn list_goals_skips_plan_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(tmp.path()).await.expect("workspace");
        let goal = Goal {
            id: "goal-20260801-abcdef".to_string(),
            description: "Grow signups 20%".to_string(),
            category: GoalCategory::Strategic,
            priority: Priority::P0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deadline: None,
            metadata: Default::default(),
        };
        workspace.write_goal(&goal).await.expect("write goal");
        workspace
            .write_goal_plan(&GoalPlan {
                goal_id: goal.id.clone(),
                phases: vec![],
                pipeline_template: None,
                estimated_task_count: 0,
            })
            .await
            .expect("write plan");
        let goals = workspace.list_goals().await.expect("list");
        assert_eq!(goals.len(), 1);
    }

    #[tokio::test]
    async fn learnings_append_and_filter_by_agent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(tmp.path()).await.expect("workspace");
        workspace
            .append_learning(&Learning {
                timestamp: Utc::now(),
                agent: "copywriting".to_string(),
                goal_id: None,
                outcome: "approved".to_string(),
                learning: "shorter headlines win".to_string(),
                action_taken: "updated guidance".to_string(),
            })
            .await
            .expect("append");
        workspace
            .append_learning(&Learning {
                timestamp: Utc::now(),
                agent: "seo-audit".to_string(),
                goal_id: None,
                outcome: "revised".to_string(),
                learning: "needs more keyword density".to_string(),
                action_taken: "flagged".to_string(),
            })
            .await
            .expect("append");
        let all = workspace.read_learnings(None).await.expect("read all");
        assert_eq!(all.len(), 2);
        let filtered = workspace.read_learnings(Some("copywriting")).await.expect("read filtered");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].learning, "shorter headlines win");
    }

    #[tokio::test]
    async fn write_file_rejects_path_escape() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(tmp.path()).await.expect("workspace");
        let result = workspace.write_file("../escape.md", b"nope").await;
        assert!(matches!(result, Err(WorkspaceError::PathEscape(_))));
    }

    #[tokio::test]
    async fn schedule_state_round_trips_as_json() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(tmp.path()).await.expect("workspace");
        let state = ScheduleState::new("sched-weekly-content");
        workspace.write_schedule_state(&state).await.expect("write");
        let loaded = workspace
            .read_schedule_state("sched-weekly-content")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(loaded.schedule_id, "sched-weekly-content");
    }
}
