//! Queue manager (C11, §4.8): the enqueue side of the task queue — budget
//! gating, submission to the queue adapter, and the filesystem fallback path
//! when the adapter is unavailable.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use conductor_budget::{BudgetLevel, BudgetState};
use conductor_core::Workspace;
use conductor_types::{Priority, Task, TaskStatus};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct QueueJob {
    pub id: String,
    pub task: Task,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("queue adapter unavailable: {0}")]
pub struct QueueAdapterError(pub String);

/// The queue contract consumed by the worker (§6): `add` submits a job,
/// `health` backs the health monitor's queue check. The in-process adapter
/// below is the default implementation; a remote-backed adapter would
/// implement the same trait.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    async fn add(&self, job: QueueJob) -> Result<String, QueueAdapterError>;
    async fn pop(&self) -> Option<QueueJob>;
    async fn depth(&self) -> usize;
    async fn health(&self) -> bool;
}

struct Ordered {
    priority: Priority,
    sequence: u64,
    job: QueueJob,
}

impl PartialEq for Ordered {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for Ordered {}
impl PartialOrd for Ordered {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Ordered {
    /// `BinaryHeap` pops the greatest element; `Reverse(priority)` makes
    /// `P0` (the numerically smallest, highest-urgency variant) compare
    /// greatest, and `Reverse(sequence)` keeps submission order within a
    /// priority class (§5 ordering guarantees).
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (Reverse(self.priority), Reverse(self.sequence))
            .cmp(&(Reverse(other.priority), Reverse(other.sequence)))
    }
}

/// Default, in-process queue adapter: a priority heap guarded by a single
/// lock, ordered per §5 (submission order within a priority class, higher
/// priority dispatched first across classes).
#[derive(Default)]
pub struct InMemoryQueueAdapter {
    heap: Mutex<BinaryHeap<Ordered>>,
    sequence: AtomicU64,
    /// When set, `add` fails every call — used by tests to exercise the
    /// filesystem fallback path.
    force_unavailable: std::sync::atomic::AtomicBool,
}

impl InMemoryQueueAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.force_unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueAdapter for InMemoryQueueAdapter {
    async fn add(&self, job: QueueJob) -> Result<String, QueueAdapterError> {
        if self.force_unavailable.load(Ordering::SeqCst) {
            return Err(QueueAdapterError("backing store unavailable".to_string()));
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = job.id.clone();
        let priority = job.task.priority;
        self.heap.lock().await.push(Ordered { priority, sequence, job });
        Ok(id)
    }

    async fn pop(&self) -> Option<QueueJob> {
        self.heap.lock().await.pop().map(|ordered| ordered.job)
    }

    async fn depth(&self) -> usize {
        self.heap.lock().await.len()
    }

    async fn health(&self) -> bool {
        !self.force_unavailable.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { job_id: String },
    Deferred,
    Fallback { job_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("workspace error: {0}")]
    Workspace(#[from] conductor_core::WorkspaceError),
}

pub struct QueueManager {
    adapter: Arc<dyn QueueAdapter>,
    workspace: Arc<Workspace>,
}

impl QueueManager {
    pub fn new(adapter: Arc<dyn QueueAdapter>, workspace: Arc<Workspace>) -> Self {
        Self { adapter, workspace }
    }

    /// Enqueues `task` under `budget`, applying the gate → submit → fallback
    /// sequence (§4.8).
    pub async fn enqueue(&self, task: &Task, budget: &BudgetState) -> Result<EnqueueOutcome, QueueError> {
        if budget.level == BudgetLevel::Exhausted {
            self.workspace.update_task_status(&task.id, TaskStatus::Blocked).await?;
            return Ok(EnqueueOutcome::Deferred);
        }
        if !budget.allows(task.priority) {
            self.workspace.update_task_status(&task.id, TaskStatus::Deferred).await?;
            return Ok(EnqueueOutcome::Deferred);
        }

        let job = QueueJob {
            id: format!("job-{}-{}", task.id, Utc::now().timestamp_millis()),
            task: task.clone(),
        };
        match self.adapter.add(job.clone()).await {
            Ok(job_id) => Ok(EnqueueOutcome::Enqueued { job_id }),
            Err(_) => {
                let payload = serde_json::json!({ "task": job.task, "enqueued_at": Utc::now() });
                self.workspace.write_queue_fallback(&job.id, &payload).await?;
                Ok(EnqueueOutcome::Fallback { job_id: job.id })
            }
        }
    }

    pub async fn pop(&self) -> Option<QueueJob> {
        self.adapter.pop().await
    }

    pub async fn depth(&self) -> usize {
        self.adapter.depth().await
    }

    pub async fn healthy(&self) -> bool {
        self.adapter.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_budget::BudgetThresholds;
    use conductor_types::{generate_id, NextAction, OutputDescriptor, TaskInput};

    fn task_with(priority: Priority) -> Task {
        let now = Utc::now();
        let id = generate_id("task", now);
        Task {
            id: id.clone(),
            sender: "director".to_string(),
            skill: "seo-audit".to_string(),
            priority,
            deadline: None,
            status: TaskStatus::Pending,
            revision_count: 0,
            goal_id: None,
            pipeline_id: None,
            goal_text: "grow signups".to_string(),
            inputs: Vec::<TaskInput>::new(),
            requirements: "audit".to_string(),
            output: OutputDescriptor {
                path: format!("outputs/measure/seo-audit/{id}.md"),
                format: "markdown".to_string(),
            },
            next: NextAction::Complete,
            tags: vec![],
            metadata: serde_json::Value::Null,
        }
    }

    async fn manager_with() -> (QueueManager, Arc<Workspace>, Arc<InMemoryQueueAdapter>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Arc::new(Workspace::new(tmp.path()).await.unwrap());
        let adapter = Arc::new(InMemoryQueueAdapter::new());
        (QueueManager::new(adapter.clone(), workspace.clone()), workspace, adapter, tmp)
    }

    fn normal_budget() -> BudgetState {
        BudgetState::derive(0.0, 100.0, BudgetThresholds::default())
    }

    #[tokio::test]
    async fn p0_dispatches_before_p2_regardless_of_submission_order() {
        let (manager, _ws, _adapter, _tmp) = manager_with().await;
        manager.enqueue(&task_with(Priority::P2), &normal_budget()).await.unwrap();
        manager.enqueue(&task_with(Priority::P0), &normal_budget()).await.unwrap();
        let first = manager.pop().await.unwrap();
        assert_eq!(first.task.priority, Priority::P0);
    }

    #[tokio::test]
    async fn same_priority_preserves_submission_order() {
        let (manager, _ws, _adapter, _tmp) = manager_with().await;
        let a = task_with(Priority::P1);
        let b = task_with(Priority::P1);
        manager.enqueue(&a, &normal_budget()).await.unwrap();
        manager.enqueue(&b, &normal_budget()).await.unwrap();
        let first = manager.pop().await.unwrap();
        assert_eq!(first.task.id, a.id);
    }

    #[tokio::test]
    async fn exhausted_budget_blocks_instead_of_enqueueing() {
        let (manager, workspace, _adapter, _tmp) = manager_with().await;
        let task = task_with(Priority::P1);
        workspace.write_task(&task).await.unwrap();
        let exhausted = BudgetState::derive(200.0, 100.0, BudgetThresholds::default());
        let outcome = manager.enqueue(&task, &exhausted).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Deferred);
        let stored = workspace.read_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Blocked);
        assert_eq!(manager.depth().await, 0);
    }

    #[tokio::test]
    async fn disallowed_priority_defers_without_blocking() {
        let (manager, workspace, _adapter, _tmp) = manager_with().await;
        let task = task_with(Priority::P3);
        workspace.write_task(&task).await.unwrap();
        let throttle = BudgetState::derive(92.0, 100.0, BudgetThresholds::default());
        let outcome = manager.enqueue(&task, &throttle).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Deferred);
        let stored = workspace.read_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Deferred);
    }

    #[tokio::test]
    async fn adapter_failure_falls_back_to_the_workspace() {
        let (manager, _ws, adapter, _tmp) = manager_with().await;
        adapter.set_unavailable(true);
        let task = task_with(Priority::P1);
        let outcome = manager.enqueue(&task, &normal_budget()).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Fallback { .. }));
    }
}
