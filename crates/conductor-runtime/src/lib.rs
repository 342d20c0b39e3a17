//! Runtime drivers: the queue manager and worker that pull materialized
//! tasks through the executor, the cron scheduler, and the health monitor.

pub mod health;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use health::{ComponentCheck, ComponentStatus, HealthCheck, HealthLevel, HealthMonitor, HealthReport};
pub use queue::{EnqueueOutcome, InMemoryQueueAdapter, QueueAdapter, QueueAdapterError, QueueError, QueueJob, QueueManager};
pub use scheduler::{advance_scheduled_goal, Scheduler, SchedulerError, TickReport};
pub use worker::{QueueWorker, WorkerError, WorkerOutcome};
