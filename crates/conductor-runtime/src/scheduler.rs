//! Scheduler (C14, §4.10): drives cron-triggered pipeline templates and
//! single-skill goals. Holds an in-memory schedule-state map mirrored to the
//! workspace so a restart can pick up `lastFiredAt`/`fireCount`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use conductor_budget::BudgetState;
use conductor_core::Workspace;
use conductor_orchestrator::{AdvanceOutcome, Director, PipelineEngine, PipelineTemplateRegistry};
use conductor_types::{GoalCategory, Priority, ScheduleEntry, ScheduleState, ScheduleTarget};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("workspace error: {0}")]
    Workspace(#[from] conductor_core::WorkspaceError),
    #[error("director error: {0}")]
    Director(#[from] conductor_orchestrator::DirectorError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] conductor_orchestrator::PipelineError),
    #[error("invalid cron expression `{expr}` on schedule `{id}`: {reason}")]
    InvalidCron { id: String, expr: String, reason: String },
}

/// How far back catch-up replay and minute-matching will look for missed
/// occurrences (§4.10 "bounded by a max-lookback window").
const DEFAULT_MAX_LOOKBACK: Duration = Duration::hours(24);
const DEFAULT_MAX_CATCH_UP_FIRES: usize = 20;

#[derive(Debug, Clone)]
pub struct TickReport {
    pub fired: Vec<String>,
    pub skipped: Vec<(String, String)>,
}

pub struct Scheduler {
    workspace: Arc<Workspace>,
    director: Arc<Director>,
    pipelines: Arc<PipelineEngine>,
    templates: Arc<PipelineTemplateRegistry>,
    /// Insertion-ordered so `tick` evaluates schedules in the order they
    /// were registered (§5 "evaluates schedules in insertion order within a
    /// single tick"), not hash order.
    schedules: Mutex<Vec<ScheduleEntry>>,
    state: Mutex<HashMap<String, ScheduleState>>,
    /// Schedule ids with a fire currently in flight (overlap protection).
    running: Mutex<std::collections::HashSet<String>>,
}

fn minute_floor(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_second(0).unwrap().with_nanosecond(0).unwrap()
}

fn parse_cron(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    // The `cron` crate requires a leading seconds field; schedule entries are
    // specified at minute granularity, so the seconds field is fixed at 0.
    cron::Schedule::from_str(&format!("0 {expr}"))
}

fn cron_matches_minute(schedule: &cron::Schedule, minute: DateTime<Utc>) -> bool {
    let just_before = minute - Duration::seconds(1);
    schedule
        .after(&just_before)
        .next()
        .map(minute_floor)
        .is_some_and(|next| next == minute)
}

/// Occurrences in `(after, before]`, earliest-first, bounded by both
/// `max_lookback` and `cap`.
fn occurrences_between(
    schedule: &cron::Schedule,
    after: DateTime<Utc>,
    before: DateTime<Utc>,
    max_lookback: Duration,
    cap: usize,
) -> Vec<DateTime<Utc>> {
    let earliest = (before - max_lookback).max(after);
    schedule
        .after(&earliest)
        .take_while(|t| *t <= before)
        .take(cap)
        .collect()
}

impl Scheduler {
    pub fn new(
        workspace: Arc<Workspace>,
        director: Arc<Director>,
        pipelines: Arc<PipelineEngine>,
        templates: Arc<PipelineTemplateRegistry>,
    ) -> Self {
        Self {
            workspace,
            director,
            pipelines,
            templates,
            schedules: Mutex::new(Vec::new()),
            state: Mutex::new(HashMap::new()),
            running: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Restores persisted state and, for catch-up-enabled schedules, replays
    /// missed occurrences between `lastFiredAt` and now (§4.10 `start`).
    pub async fn start(
        &self,
        entries: Vec<ScheduleEntry>,
        budget: &BudgetState,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, SchedulerError> {
        let mut fired = Vec::new();
        let mut restored_states = Vec::with_capacity(entries.len());

        for entry in &entries {
            let restored = self
                .workspace
                .read_schedule_state(&entry.id)
                .await?
                .unwrap_or_else(|| ScheduleState::new(entry.id.clone()));

            let mut current = restored;
            if entry.catch_up && entry.enabled {
                if let Some(last_fired) = current.last_fired_at {
                    let schedule = parse_cron(&entry.cron_expression).map_err(|err| {
                        SchedulerError::InvalidCron {
                            id: entry.id.clone(),
                            expr: entry.cron_expression.clone(),
                            reason: err.to_string(),
                        }
                    })?;
                    for occurrence in occurrences_between(
                        &schedule,
                        last_fired,
                        now,
                        DEFAULT_MAX_LOOKBACK,
                        DEFAULT_MAX_CATCH_UP_FIRES,
                    ) {
                        if !budget.allows(entry.priority) {
                            break;
                        }
                        self.fire(entry, &mut current, occurrence).await?;
                        fired.push(entry.id.clone());
                    }
                }
            }
            restored_states.push((entry.id.clone(), current));
        }

        let mut schedules = self.schedules.lock().await;
        let mut state = self.state.lock().await;
        for entry in entries {
            match schedules.iter_mut().find(|existing| existing.id == entry.id) {
                Some(existing) => *existing = entry,
                None => schedules.push(entry),
            }
        }
        for (id, current) in restored_states {
            state.insert(id, current);
        }
        Ok(fired)
    }

    /// Evaluates every enabled schedule once, in insertion order (§4.10,
    /// §5 "ticks themselves are serialized").
    pub async fn tick(&self, budget: &BudgetState, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let minute = minute_floor(now);
        let mut report = TickReport { fired: Vec::new(), skipped: Vec::new() };

        let schedules = self.schedules.lock().await;
        let ids: Vec<String> = schedules.iter().map(|entry| entry.id.clone()).collect();
        drop(schedules);

        for id in ids {
            let entry = {
                let schedules = self.schedules.lock().await;
                let Some(entry) = schedules.iter().find(|entry| entry.id == id).cloned() else { continue };
                entry
            };
            if !entry.enabled {
                continue;
            }

            let schedule = match parse_cron(&entry.cron_expression) {
                Ok(s) => s,
                Err(err) => {
                    report.skipped.push((id.clone(), format!("invalid_cron: {err}")));
                    continue;
                }
            };
            if !cron_matches_minute(&schedule, minute) {
                continue;
            }

            let mut state = self.state.lock().await;
            let current = state.entry(id.clone()).or_insert_with(|| ScheduleState::new(id.clone()));

            if current.last_fired_at == Some(minute) {
                report.skipped.push((id.clone(), "already_fired_this_minute".to_string()));
                continue;
            }
            if self.running.lock().await.contains(&id) {
                current.last_skip_reason = Some("pipeline_still_running".to_string());
                report.skipped.push((id.clone(), "pipeline_still_running".to_string()));
                continue;
            }
            if budget.level == conductor_budget::BudgetLevel::Exhausted {
                current.last_skip_reason = Some("budget_exhausted".to_string());
                report.skipped.push((id.clone(), "budget_exhausted".to_string()));
                continue;
            }
            if !budget.allows(entry.priority) {
                current.last_skip_reason = Some("budget_throttle".to_string());
                report.skipped.push((id.clone(), "budget_throttle".to_string()));
                continue;
            }

            let mut owned_state = current.clone();
            drop(state);

            self.running.lock().await.insert(id.clone());
            let fire_result = self.fire(&entry, &mut owned_state, minute).await;
            self.running.lock().await.remove(&id);

            match fire_result {
                Ok(()) => {
                    owned_state.last_skip_reason = None;
                    self.state.lock().await.insert(id.clone(), owned_state);
                    report.fired.push(id.clone());
                }
                Err(err) => {
                    return Err(err);
                }
            }
        }

        Ok(report)
    }

    /// Marks a schedule's in-flight fire as complete, clearing the overlap
    /// guard (§4.10 `markCompleted`).
    pub async fn mark_completed(&self, id: &str) {
        self.running.lock().await.remove(id);
    }

    /// Persists every schedule's state and returns (§4.10 `stop`).
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let state = self.state.lock().await;
        for entry in state.values() {
            self.workspace.write_schedule_state(entry).await?;
        }
        Ok(())
    }

    async fn fire(
        &self,
        entry: &ScheduleEntry,
        state: &mut ScheduleState,
        fired_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        match &entry.target {
            ScheduleTarget::Goal { skill } => {
                let category = entry.goal_category.unwrap_or(GoalCategory::Measurement);
                let goal = self
                    .director
                    .create_goal(
                        format!("scheduled goal `{}` for skill `{skill}`", entry.name),
                        category,
                        entry.priority,
                        None,
                    )
                    .await?;
                let plan = self.director.decompose(&goal, None);
                self.workspace.write_goal_plan(&plan).await?;
                self.director.materialize_phase(&goal, &plan, 0, &[]).await?;
            }
            ScheduleTarget::PipelineTemplate { name } => {
                if let Some(definition) = self.templates.get(name) {
                    let now = Utc::now();
                    let run = conductor_types::PipelineRun {
                        id: conductor_types::generate_id("run", now),
                        definition_id: definition.id.clone(),
                        goal_id: None,
                        status: conductor_types::PipelineRunStatus::Pending,
                        current_step_index: 0,
                        task_ids: Vec::new(),
                        created_at: now,
                        updated_at: now,
                    };
                    self.pipelines
                        .advance(
                            definition,
                            run,
                            &entry.name,
                            entry.priority,
                            None,
                            CancellationToken::new(),
                        )
                        .await?;
                }
            }
        }
        state.last_fired_at = Some(fired_at);
        state.fire_count += 1;
        self.workspace.write_schedule_state(state).await?;
        Ok(())
    }
}

/// Resolves a `Director::advance_goal` call outside a tick, used by callers
/// that want to drive a scheduled goal forward after its phase-1 tasks have
/// been reviewed. Kept thin: the scheduler itself only materializes phase 1.
pub async fn advance_scheduled_goal(
    director: &Director,
    goal_id: &str,
) -> Result<AdvanceOutcome, conductor_orchestrator::DirectorError> {
    director.advance_goal(goal_id).await
}
