//! `conductor-engine`: the headless CLI that drives a goal, a scheduler
//! pass, or an event through the orchestration crates. Config validation
//! happens once at startup (§10.2); everything past that point reports
//! through the exit codes below (§6).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use conductor_budget::{BudgetLevel, BudgetState, BudgetThresholds, CostTracker};
use conductor_core::{AgentExecutor, ConfigStore, Workspace, WorkspaceError};
use conductor_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use conductor_orchestrator::{
    AdvanceOutcome, CompletionRouter, Condition, Director, EventMapping, EventRouter,
    FailureTracker, PipelineEngine, PipelineTemplateRegistry,
};
use conductor_providers::{AnthropicClient, AnthropicClientConfig, LlmClient};
use conductor_runtime::{
    ComponentCheck, ComponentStatus, HealthCheck, HealthMonitor, InMemoryQueueAdapter,
    QueueManager, QueueWorker, Scheduler, WorkerOutcome,
};
use conductor_skills::SkillRegistry;
use conductor_tools::ToolRegistry;
use conductor_types::{Event, GoalCategory, Priority, ScheduleEntry, ScheduleTarget};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_BUDGET_EXHAUSTED: u8 = 3;
const EXIT_WORKSPACE_ERROR: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "conductor-engine")]
#[command(about = "Headless marketing orchestration engine")]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[arg(long, global = true, env = "CONDUCTOR_WORKSPACE_ROOT")]
    workspace: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a goal from a description and drive it to completion.
    Run {
        description: Vec<String>,
        #[arg(long, default_value = "strategic")]
        category: String,
        #[arg(long, default_value = "p1")]
        priority: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run one scheduler pass against the configured schedule entries.
    Schedule,
    /// Emit an event through the event router.
    Events {
        event_type: String,
        #[arg(long, default_value = "cli")]
        source: String,
        /// JSON object of event data, e.g. `{"severity": 9}`.
        #[arg(long)]
        data: Option<String>,
    },
    /// Print the current system health report.
    Health,
}

fn parse_category(raw: &str) -> Option<GoalCategory> {
    match raw.to_ascii_lowercase().as_str() {
        "strategic" => Some(GoalCategory::Strategic),
        "content" => Some(GoalCategory::Content),
        "optimization" => Some(GoalCategory::Optimization),
        "retention" => Some(GoalCategory::Retention),
        "competitive" => Some(GoalCategory::Competitive),
        "measurement" => Some(GoalCategory::Measurement),
        _ => None,
    }
}

fn parse_priority(raw: &str) -> Option<Priority> {
    match raw.to_ascii_uppercase().as_str() {
        "P0" => Some(Priority::P0),
        "P1" => Some(Priority::P1),
        "P2" => Some(Priority::P2),
        "P3" => Some(Priority::P3),
        _ => None,
    }
}

fn category_label(category: GoalCategory) -> &'static str {
    match category {
        GoalCategory::Strategic => "strategic",
        GoalCategory::Content => "content",
        GoalCategory::Optimization => "optimization",
        GoalCategory::Retention => "retention",
        GoalCategory::Competitive => "competitive",
        GoalCategory::Measurement => "measurement",
    }
}

/// Everything `run`/`schedule`/`events`/`health` drive: one wiring of the
/// workspace, skills/tools, executor, and the runtime drivers built on top
/// of it (§6 "data flow").
struct Engine {
    workspace: Arc<Workspace>,
    director: Arc<Director>,
    queue: Arc<QueueManager>,
    worker: Arc<QueueWorker>,
    pipelines: Arc<PipelineEngine>,
    templates: Arc<PipelineTemplateRegistry>,
    event_router: Arc<EventRouter>,
    cost: Mutex<CostTracker>,
    budget_total_usd: f64,
    budget_thresholds: BudgetThresholds,
    logs_dir: PathBuf,
}

impl Engine {
    async fn build(workspace_root: &Path) -> anyhow::Result<Self> {
        let config_path = workspace_root.join(".agents").join("config.json");
        let config_store = ConfigStore::new(&config_path, None).await?;
        let config = config_store.get().await;

        let workspace = Arc::new(Workspace::new(workspace_root).await?);

        let skills_dir = workspace_root.join(".agents").join("skills");
        let skills = Arc::new(SkillRegistry::load(&skills_dir)?);
        for err in skills.errors() {
            warn!(error = %err, "skipped a malformed skill manifest");
        }

        let tools_path = workspace_root.join(".agents").join("tools.yaml");
        let tools = Arc::new(match tokio::fs::read_to_string(&tools_path).await {
            Ok(yaml) => ToolRegistry::load(&yaml).map_err(|errs| {
                anyhow::anyhow!(
                    "tools.yaml failed validation: {}",
                    errs.into_iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
                )
            })?,
            Err(_) => ToolRegistry::from_map(Default::default()).expect("an empty tool map always validates"),
        });

        let anthropic = config.anthropic.clone();
        let llm: Arc<dyn LlmClient> = Arc::new(AnthropicClient::new(AnthropicClientConfig {
            api_key: anthropic.api_key.clone().unwrap_or_default(),
            base_url: anthropic.base_url.clone(),
        }));

        let executor = Arc::new(AgentExecutor::new(
            workspace.clone(),
            skills.clone(),
            tools,
            llm.clone(),
            anthropic.clone(),
            config.max_tool_iterations,
        ));

        let director = Arc::new(Director::new(
            workspace.clone(),
            skills,
            Some(llm),
            anthropic.default_model.clone(),
        ));

        let router = Arc::new(CompletionRouter::new(workspace.clone(), director.clone()));
        let failures = Arc::new(FailureTracker::new(3));

        let adapter = Arc::new(InMemoryQueueAdapter::new());
        let queue = Arc::new(QueueManager::new(adapter, workspace.clone()));
        let worker = Arc::new(QueueWorker::new(
            workspace.clone(),
            queue.clone(),
            executor.clone(),
            router,
            failures,
            vec!["Summary".to_string()],
        ));

        let pipelines = Arc::new(PipelineEngine::new(workspace.clone(), executor, 4));
        let templates = Arc::new(load_pipeline_templates(workspace_root)?);
        let event_router = Arc::new(EventRouter::new(
            workspace.clone(),
            director.clone(),
            pipelines.clone(),
            templates.clone(),
            load_event_mappings(workspace_root)?,
        ));

        let logs_dir = canonical_logs_dir_from_root(workspace_root);

        Ok(Self {
            workspace,
            director,
            queue,
            worker,
            pipelines,
            templates,
            event_router,
            cost: Mutex::new(CostTracker::new()),
            budget_total_usd: config.budget.total_monthly_usd,
            budget_thresholds: config.budget.thresholds,
            logs_dir,
        })
    }

    fn budget(&self) -> BudgetState {
        self.cost.lock().unwrap().to_budget_state(self.budget_total_usd, self.budget_thresholds)
    }

    /// Pulls jobs off the queue until it is empty, recording each job's cost
    /// against the running tracker as it completes.
    async fn drain_queue(&self, cancel: CancellationToken) -> anyhow::Result<u32> {
        let mut processed = 0u32;
        loop {
            let budget = self.budget();
            match self.worker.process_one(&budget, cancel.clone()).await? {
                WorkerOutcome::Idle => break,
                WorkerOutcome::Processed { cost_entry, paused_pipeline, .. } => {
                    processed += 1;
                    if let Some(entry) = cost_entry {
                        self.cost.lock().unwrap().record(entry);
                    }
                    if let Some(pipeline_id) = paused_pipeline {
                        warn!(pipeline_id, "pipeline paused after crossing the failure threshold");
                    }
                }
            }
        }
        Ok(processed)
    }

    fn flush_cost_report(&self) -> anyhow::Result<PathBuf> {
        let reports_dir = self.workspace.root().join("reports");
        let path = self.cost.lock().unwrap().flush(&reports_dir, chrono::Utc::now())?;
        Ok(path)
    }
}

fn load_pipeline_templates(workspace_root: &Path) -> anyhow::Result<PipelineTemplateRegistry> {
    let path = workspace_root.join(".agents").join("pipelines.json");
    let definitions = match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(_) => Vec::new(),
    };
    Ok(PipelineTemplateRegistry::from_definitions(definitions)?)
}

/// On-disk shape for an event mapping. `EventMapping` itself can't derive
/// `Deserialize` because `chrono::Duration` doesn't support serde, so the
/// config file spells the cooldown as plain seconds and this converts it.
#[derive(serde::Deserialize)]
struct MappingConfig {
    event_type: String,
    target: ScheduleTarget,
    #[serde(default)]
    condition: Option<Condition>,
    #[serde(default)]
    cooldown_seconds: i64,
    priority: Priority,
    #[serde(default)]
    goal_category: Option<GoalCategory>,
}

fn load_event_mappings(workspace_root: &Path) -> anyhow::Result<Vec<EventMapping>> {
    let path = workspace_root.join(".agents").join("events.json");
    let configs: Vec<MappingConfig> = match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(_) => Vec::new(),
    };
    Ok(configs
        .into_iter()
        .map(|c| EventMapping {
            event_type: c.event_type,
            target: c.target,
            condition: c.condition,
            cooldown: chrono::Duration::seconds(c.cooldown_seconds),
            priority: c.priority,
            goal_category: c.goal_category,
        })
        .collect())
}

fn load_schedule_entries(workspace_root: &Path) -> anyhow::Result<Vec<ScheduleEntry>> {
    let path = workspace_root.join(".agents").join("schedules.json");
    match std::fs::read_to_string(&path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(_) => Ok(Vec::new()),
    }
}

/// Creates the goal, decomposes it, and — unless `dry_run` — materializes
/// and drains phases until the director reports the goal complete.
///
/// `DirectorReview`'s `GoalIterate` action only marks a phase's tasks
/// approved; nothing in the router re-materializes the next phase for it
/// (unlike `PipelineContinue`, which does). This loop closes that gap by
/// polling `advance_goal` itself between drain cycles.
async fn run_goal(
    engine: &Engine,
    description: String,
    category: GoalCategory,
    priority: Priority,
    dry_run: bool,
) -> anyhow::Result<serde_json::Value> {
    let goal = engine.director.create_goal(description, category, priority, None).await?;
    let plan = engine.director.decompose(&goal, None);
    engine.workspace.write_goal_plan(&plan).await?;

    if dry_run {
        return Ok(serde_json::json!({
            "goal_id": goal.id,
            "category": category_label(goal.category),
            "priority": format!("{:?}", goal.priority),
            "phases": plan.phases.iter().map(|p| serde_json::json!({
                "name": p.name,
                "skills": p.skills,
            })).collect::<Vec<_>>(),
            "dry_run": true,
        }));
    }

    let cancel = CancellationToken::new();
    let initial = engine.director.materialize_phase(&goal, &plan, 0, &[]).await?;
    for task in &initial {
        engine.queue.enqueue(task, &engine.budget()).await?;
    }

    let mut total_tasks = initial.len();
    loop {
        engine.drain_queue(cancel.clone()).await?;
        match engine.director.advance_goal(&goal.id).await? {
            AdvanceOutcome::Materialized { tasks } if !tasks.is_empty() => {
                total_tasks += tasks.len();
                for task in &tasks {
                    engine.queue.enqueue(task, &engine.budget()).await?;
                }
            }
            _ => break,
        }
    }

    let report_path = engine.flush_cost_report()?;
    let budget = engine.budget();
    Ok(serde_json::json!({
        "goal_id": goal.id,
        "phases": plan.phases.len(),
        "tasks_materialized": total_tasks,
        "budget_level": format!("{:?}", budget.level),
        "percent_used": budget.percent_used,
        "cost_report": report_path.display().to_string(),
    }))
}

struct QueueHealthCheck {
    queue: Arc<QueueManager>,
}

#[async_trait::async_trait]
impl HealthCheck for QueueHealthCheck {
    fn name(&self) -> &str {
        "queue"
    }

    async fn check(&self) -> ComponentCheck {
        let healthy = self.queue.healthy().await;
        ComponentCheck {
            name: "queue".to_string(),
            status: if healthy { ComponentStatus::Up } else { ComponentStatus::Offline },
            details: if healthy { String::new() } else { "queue adapter unavailable".to_string() },
        }
    }
}

struct WorkspaceHealthCheck {
    workspace: Arc<Workspace>,
}

#[async_trait::async_trait]
impl HealthCheck for WorkspaceHealthCheck {
    fn name(&self) -> &str {
        "workspace"
    }

    async fn check(&self) -> ComponentCheck {
        match self.workspace.list_goals().await {
            Ok(_) => ComponentCheck {
                name: "workspace".to_string(),
                status: ComponentStatus::Up,
                details: String::new(),
            },
            Err(err) => ComponentCheck {
                name: "workspace".to_string(),
                status: ComponentStatus::Offline,
                details: err.to_string(),
            },
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let workspace_root = match &cli.workspace {
        Some(raw) => PathBuf::from(raw),
        None => std::env::current_dir()?,
    };

    let engine = match Engine::build(&workspace_root).await {
        Ok(engine) => engine,
        Err(err) => {
            if err.downcast_ref::<WorkspaceError>().is_some() {
                eprintln!("workspace error: {err}");
                return Ok(ExitCode::from(EXIT_WORKSPACE_ERROR));
            }
            eprintln!("configuration error: {err}");
            return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
        }
    };

    let _logging_guard = init_process_logging(ProcessKind::Cli, &engine.logs_dir, 14).ok();

    match cli.command {
        Command::Run { description, category, priority, dry_run } => {
            let description = description.join(" ");
            if description.trim().is_empty() {
                eprintln!("configuration error: a goal description is required");
                return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
            }
            let Some(category) = parse_category(&category) else {
                eprintln!("configuration error: unknown category `{category}`");
                return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
            };
            let Some(priority) = parse_priority(&priority) else {
                eprintln!("configuration error: unknown priority `{priority}`");
                return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
            };

            if !dry_run && engine.budget().level == BudgetLevel::Exhausted {
                eprintln!("budget exhausted at startup");
                return Ok(ExitCode::from(EXIT_BUDGET_EXHAUSTED));
            }

            let report = run_goal(&engine, description, category, priority, dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!(goal_id = %report["goal_id"], "run complete");
            Ok(ExitCode::from(EXIT_OK))
        }
        Command::Schedule => {
            if engine.budget().level == BudgetLevel::Exhausted {
                eprintln!("budget exhausted at startup");
                return Ok(ExitCode::from(EXIT_BUDGET_EXHAUSTED));
            }
            let entries = load_schedule_entries(&workspace_root)?;
            let scheduler = Scheduler::new(
                engine.workspace.clone(),
                engine.director.clone(),
                engine.pipelines.clone(),
                engine.templates.clone(),
            );
            let fired = scheduler.start(entries, &engine.budget(), chrono::Utc::now()).await?;
            engine.drain_queue(CancellationToken::new()).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "fired": fired }))?);
            Ok(ExitCode::from(EXIT_OK))
        }
        Command::Events { event_type, source, data } => {
            let data: std::collections::HashMap<String, serde_json::Value> = match data {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Default::default(),
            };
            let event = Event {
                id: conductor_types::generate_id("event", chrono::Utc::now()),
                event_type,
                timestamp: chrono::Utc::now(),
                source,
                data,
            };
            let outcome = engine.event_router.emit(event).await?;
            engine.drain_queue(CancellationToken::new()).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "pipelines_triggered": outcome.pipelines_triggered,
                    "pipeline_ids": outcome.pipeline_ids,
                    "skipped_reasons": outcome.skipped_reasons,
                }))?
            );
            Ok(ExitCode::from(EXIT_OK))
        }
        Command::Health => {
            let queue_depth = engine.queue.depth().await as u64;
            let budget = engine.budget();
            let monitor = HealthMonitor::new(
                vec![
                    Arc::new(QueueHealthCheck { queue: engine.queue.clone() }),
                    Arc::new(WorkspaceHealthCheck { workspace: engine.workspace.clone() }),
                ],
                std::time::Duration::from_millis(5_000),
            );
            let report = monitor.check_health(0, queue_depth, Some(&budget)).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "level": report.level.label(),
                    "code": report.level.code(),
                    "queue_depth": report.queue_depth,
                    "budget_percent_used": report.budget_percent_used,
                    "checks": report.checks.iter().map(|c| serde_json::json!({
                        "name": c.name,
                        "status": format!("{:?}", c.status),
                        "details": c.details,
                    })).collect::<Vec<_>>(),
                }))?
            );
            Ok(ExitCode::from(report.level.code()))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("configuration error: {err}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}
